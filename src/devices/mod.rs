//! Device configuration rows and the shared devices store.
//!
//! A row is a fixed, ordered set of nine fields keyed by its `ID`. The store
//! is a comma-delimited text file with one row per device; see
//! [`store::upsert`] for the write path.
mod lock;
mod store;

pub use lock::StoreLock;
pub use store::{upsert, RowInput, UpsertOutcome};

use crate::error::{FwError, FwResult};
use serde::Serialize;
use std::collections::BTreeMap;

/// Column order of the devices store.
pub const COLUMNS: [&str; 9] = [
    "ID",
    "qemu-binary",
    "machine-type",
    "cpu-type",
    "dtb",
    "memory",
    "kernel-image",
    "qemuopts",
    "description",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceConfigRow {
    pub id: String,
    pub qemu_binary: String,
    pub machine_type: String,
    pub cpu_type: String,
    pub dtb: String,
    pub memory: String,
    pub kernel_image: String,
    pub qemuopts: String,
    pub description: String,
}

impl DeviceConfigRow {
    fn from_array(fields: [String; 9]) -> FwResult<Self> {
        let [id, qemu_binary, machine_type, cpu_type, dtb, memory, kernel_image, qemuopts, description] =
            fields;
        if id.trim().is_empty() {
            return Err(FwError::validation("row", "ID must not be empty"));
        }
        Ok(Self {
            id,
            qemu_binary,
            machine_type,
            cpu_type,
            dtb,
            memory,
            kernel_image,
            qemuopts,
            description,
        })
    }

    pub fn fields(&self) -> [&str; 9] {
        [
            &self.id,
            &self.qemu_binary,
            &self.machine_type,
            &self.cpu_type,
            &self.dtb,
            &self.memory,
            &self.kernel_image,
            &self.qemuopts,
            &self.description,
        ]
    }

    /// Parse one pre-formatted CSV row of exactly nine fields.
    pub fn from_csv_line(line: &str) -> FwResult<Self> {
        let fields = parse_csv_line(line)
            .ok_or_else(|| FwError::validation("row", format!("not a CSV record: {line:?}")))?;
        let count = fields.len();
        let fields: [String; 9] = fields.try_into().map_err(|_| {
            FwError::validation(
                "row",
                format!("expected {} fields, found {count}", COLUMNS.len()),
            )
        })?;
        Self::from_array(fields)
    }

    /// Assemble a row from a column-name mapping.
    ///
    /// Names match [`COLUMNS`] case-insensitively, with `_` accepted for
    /// `-`. Values are trimmed the same way stored rows are. Columns missing from `fields` are taken from `base` when given;
    /// otherwise they are a validation error.
    pub fn from_fields(
        fields: &BTreeMap<String, String>,
        base: Option<&DeviceConfigRow>,
    ) -> FwResult<Self> {
        let mut values: [Option<String>; 9] = Default::default();
        for (key, value) in fields {
            let index = column_index(key)
                .ok_or_else(|| FwError::validation("field", format!("unknown column {key:?}")))?;
            values[index] = Some(value.trim().to_string());
        }

        let mut missing = Vec::new();
        let mut resolved: [String; 9] = Default::default();
        for (index, slot) in values.into_iter().enumerate() {
            match (slot, base) {
                (Some(value), _) => resolved[index] = value,
                (None, Some(base)) if index > 0 => resolved[index] = base.fields()[index].to_string(),
                (None, _) => missing.push(COLUMNS[index]),
            }
        }
        if !missing.is_empty() {
            return Err(FwError::validation(
                "field mapping",
                format!("missing required column(s): {}", missing.join(", ")),
            ));
        }
        Self::from_array(resolved)
    }

    /// CSV rendering without a trailing newline; fields are quoted only when
    /// they need it.
    pub fn to_csv_line(&self) -> FwResult<String> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record(self.fields())
            .map_err(|err| FwError::validation("row", err.to_string()))?;
        let bytes = writer
            .into_inner()
            .map_err(|err| FwError::validation("row", err.to_string()))?;
        let line = String::from_utf8(bytes).map_err(|err| FwError::validation("row", err.to_string()))?;
        Ok(line.trim_end_matches('\n').to_string())
    }
}

/// The store header line.
pub fn header_line() -> String {
    COLUMNS.join(",")
}

fn column_index(key: &str) -> Option<usize> {
    let wanted = key.trim().replace('_', "-");
    COLUMNS
        .iter()
        .position(|column| column.eq_ignore_ascii_case(&wanted))
}

/// Fields of a single CSV record, trimmed; `None` if the line is not one
/// well-formed record.
pub(crate) fn parse_csv_line(line: &str) -> Option<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(line.as_bytes());
    let mut records = reader.records();
    let record = records.next()?.ok()?;
    if records.next().is_some() {
        return None;
    }
    Some(record.iter().map(str::to_string).collect())
}

/// Parse `KEY=VALUE` arguments into a field mapping.
pub fn parse_field_args(args: &[String]) -> FwResult<BTreeMap<String, String>> {
    let mut fields = BTreeMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| FwError::validation("field", format!("expected KEY=VALUE, got {arg:?}")))?;
        if fields.insert(key.trim().to_string(), value.to_string()).is_some() {
            return Err(FwError::validation("field", format!("column {key:?} given twice")));
        }
    }
    Ok(fields)
}
