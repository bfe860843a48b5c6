//! Upsert into the shared devices store.
//!
//! The whole cycle (read, duplicate check, backup, write) runs under a
//! [`StoreLock`]. The new content is written to a temporary file next to the
//! store and renamed over it, so readers see either the old or the new store.
use super::{header_line, parse_csv_line, DeviceConfigRow, StoreLock};
use crate::error::{FwError, FwResult};
use crate::fsutil::unique_path;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

/// What the caller wants written.
#[derive(Debug, Clone)]
pub enum RowInput {
    /// A pre-formatted CSV row.
    Line(String),
    /// Column name to value. For an existing ID, omitted columns keep their
    /// stored values.
    Fields(BTreeMap<String, String>),
    Row(DeviceConfigRow),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Appended,
    Updated,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertOutcome {
    pub store: PathBuf,
    pub action: UpsertAction,
    pub row: DeviceConfigRow,
    pub backup: Option<PathBuf>,
    pub header_added: bool,
}

impl UpsertOutcome {
    pub fn updated(&self) -> bool {
        self.action == UpsertAction::Updated
    }
}

/// One physical line of the store.
enum StoreLine {
    /// Header, blank, comment, or unparseable text kept verbatim.
    Opaque(String),
    Row { id: String, text: String },
}

struct StoreText {
    lines: Vec<StoreLine>,
    header_added: bool,
}

impl StoreText {
    fn parse(text: &str) -> Self {
        let header = header_line();
        let mut lines = Vec::new();
        let first = text.lines().next().unwrap_or_default();
        let header_added = !same_ignoring_whitespace(first, &header);
        if header_added {
            lines.push(StoreLine::Opaque(header));
        }
        for (index, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if (index == 0 && !header_added) || trimmed.is_empty() || trimmed.starts_with('#') {
                lines.push(StoreLine::Opaque(line.to_string()));
                continue;
            }
            match parse_csv_line(line).and_then(|fields| fields.into_iter().next()) {
                Some(id) if !id.is_empty() => lines.push(StoreLine::Row {
                    id,
                    text: line.to_string(),
                }),
                _ => {
                    tracing::warn!(line, "keeping unparseable devices line as-is");
                    lines.push(StoreLine::Opaque(line.to_string()));
                }
            }
        }
        Self {
            lines,
            header_added,
        }
    }

    fn find(&self, id: &str) -> Option<usize> {
        self.lines.iter().position(|line| matches!(line, StoreLine::Row { id: row_id, .. } if row_id == id))
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            let text = match line {
                StoreLine::Opaque(text) | StoreLine::Row { text, .. } => text,
            };
            out.push_str(text);
            out.push('\n');
        }
        out
    }
}

fn same_ignoring_whitespace(left: &str, right: &str) -> bool {
    left.split_whitespace().collect::<String>() == right.split_whitespace().collect::<String>()
}

/// Insert or replace the row for its ID.
///
/// With `allow_update == false` an existing ID fails with
/// [`FwError::DuplicateKey`] before anything is written. A backup of the
/// existing store is taken first when `create_backup` is set; if that fails
/// the store is not touched.
pub fn upsert(
    store: &Path,
    input: RowInput,
    allow_update: bool,
    create_backup: bool,
    lock_wait: Duration,
) -> FwResult<UpsertOutcome> {
    let parent = store
        .parent()
        .filter(|parent| parent.is_dir())
        .ok_or_else(|| FwError::path("devices store directory", store, "parent directory does not exist"))?;
    if let RowInput::Line(line) = &input {
        DeviceConfigRow::from_csv_line(line)?;
    }

    let lock = StoreLock::acquire(store, lock_wait)?;
    tracing::debug!(lock = %lock.path().display(), "holding store lock");
    let existing = match fs::read_to_string(store) {
        Ok(text) => Some(text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(FwError::io(store, err)),
    };
    let mut text = StoreText::parse(existing.as_deref().unwrap_or_default());

    let row = resolve_row(input, &text)?;
    let position = text.find(&row.id);
    if position.is_some() && !allow_update {
        return Err(FwError::DuplicateKey {
            id: row.id,
            store: store.to_path_buf(),
        });
    }

    let backup = match (&existing, create_backup) {
        (Some(_), true) => Some(write_backup(store)?),
        _ => None,
    };

    let line = StoreLine::Row {
        id: row.id.clone(),
        text: row.to_csv_line()?,
    };
    let action = match position {
        Some(index) => {
            text.lines[index] = line;
            UpsertAction::Updated
        }
        None => {
            text.lines.push(line);
            UpsertAction::Appended
        }
    };

    write_atomically(parent, store, text.render().as_bytes())?;
    tracing::info!(store = %store.display(), id = %row.id, action = ?action, backup = backup.is_some(), "devices store written");
    Ok(UpsertOutcome {
        store: store.to_path_buf(),
        action,
        row,
        backup,
        header_added: text.header_added,
    })
}

fn resolve_row(input: RowInput, text: &StoreText) -> FwResult<DeviceConfigRow> {
    match input {
        RowInput::Row(row) => Ok(row),
        RowInput::Line(line) => DeviceConfigRow::from_csv_line(&line),
        RowInput::Fields(fields) => {
            let base = fields
                .iter()
                .find(|(key, _)| key.trim().eq_ignore_ascii_case("id"))
                .and_then(|(_, id)| text.find(id.trim()))
                .and_then(|index| match &text.lines[index] {
                    StoreLine::Row { text, .. } => DeviceConfigRow::from_csv_line(text).ok(),
                    StoreLine::Opaque(_) => None,
                });
            DeviceConfigRow::from_fields(&fields, base.as_ref())
        }
    }
}

fn write_backup(store: &Path) -> FwResult<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let mut name = store.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(format!(".bak.{stamp}"));
    let backup = unique_path(&store.with_file_name(name))
        .map_err(|err| FwError::io(store, std::io::Error::other(err.to_string())))?;
    fs::copy(store, &backup).map_err(|err| FwError::io(&backup, err))?;
    tracing::debug!(backup = %backup.display(), "store backed up");
    Ok(backup)
}

/// Replace `store` with `bytes`, keeping the store's permissions. A new
/// store is made world-readable.
fn write_atomically(dir: &Path, store: &Path, bytes: &[u8]) -> FwResult<()> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|err| FwError::io(dir, err))?;
    tmp.write_all(bytes).map_err(|err| FwError::io(tmp.path(), err))?;
    let permissions = match fs::metadata(store) {
        Ok(meta) => Some(meta.permissions()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => new_store_permissions(),
        Err(err) => return Err(FwError::io(store, err)),
    };
    if let Some(permissions) = permissions {
        tmp.as_file()
            .set_permissions(permissions)
            .map_err(|err| FwError::io(tmp.path(), err))?;
    }
    tmp.as_file().sync_all().map_err(|err| FwError::io(tmp.path(), err))?;
    tmp.persist(store).map_err(|err| FwError::io(store, err.error))?;
    Ok(())
}

#[cfg(unix)]
fn new_store_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn new_store_permissions() -> Option<fs::Permissions> {
    None
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
