//! Per-instance scratch directories written by the emulation framework.
use crate::error::{FwError, FwResult};
use crate::paths::{FirmaePaths, SCRATCH_LOG_NAMES};
use crate::util::tail_text;
use serde::Serialize;
use std::fs;
use std::path::Path;

const LOG_TAIL_BYTES: u64 = 64_000;
const LOG_TAIL_LINES: usize = 200;

/// Tail of one scratch log.
#[derive(Debug, Clone, Serialize)]
pub struct ScratchLog {
    pub name: String,
    pub tail: String,
}

/// Numeric instance ids present under the scratch directory, ascending.
pub fn numeric_instances(scratch_dir: &Path) -> Vec<u64> {
    let Ok(entries) = fs::read_dir(scratch_dir) else {
        return Vec::new();
    };
    let mut ids: Vec<u64> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    ids.sort_unstable();
    ids
}

pub fn latest_instance(scratch_dir: &Path) -> Option<String> {
    numeric_instances(scratch_dir)
        .last()
        .map(|id| id.to_string())
}

/// Bounded tails of the known log files for `instance_id`; empty logs are
/// left out.
pub fn collect_scratch_logs(firmae: &FirmaePaths, instance_id: &str) -> Vec<ScratchLog> {
    let dir = firmae.instance_dir(instance_id);
    SCRATCH_LOG_NAMES
        .iter()
        .filter_map(|name| {
            let tail = tail_text(&dir.join(name), LOG_TAIL_BYTES, LOG_TAIL_LINES);
            (!tail.trim().is_empty()).then(|| ScratchLog {
                name: name.to_string(),
                tail,
            })
        })
        .collect()
}

pub fn render_scratch_logs(logs: &[ScratchLog]) -> String {
    let mut out = String::new();
    for log in logs {
        out.push_str(&format!("--- {} (tail) ---\n{}\n", log.name, log.tail));
    }
    out
}

/// Remove everything inside the scratch directory; returns the entry count.
pub fn clean_scratch(firmae: &FirmaePaths) -> FwResult<usize> {
    let scratch = firmae.scratch_dir();
    if !scratch.is_dir() {
        return Err(FwError::path("scratch directory", scratch, "not found"));
    }
    let entries = fs::read_dir(&scratch).map_err(|err| FwError::io(&scratch, err))?;
    let mut removed = 0;
    for entry in entries {
        let path = entry.map_err(|err| FwError::io(&scratch, err))?.path();
        let result = if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|err| FwError::io(&path, err))?;
        removed += 1;
    }
    tracing::info!(removed, scratch = %scratch.display(), "scratch cleaned");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_are_numeric_directories_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["3", "12", "notes", "7"] {
            fs::create_dir(dir.path().join(name)).expect("create");
        }
        fs::write(dir.path().join("99"), b"file").expect("write");

        assert_eq!(numeric_instances(dir.path()), vec![3, 7, 12]);
        assert_eq!(latest_instance(dir.path()).as_deref(), Some("12"));
        assert!(numeric_instances(&dir.path().join("absent")).is_empty());
    }

    #[test]
    fn collects_only_non_empty_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let firmae = FirmaePaths::new(dir.path().to_path_buf());
        let instance = firmae.instance_dir("4");
        fs::create_dir_all(&instance).expect("create instance");
        fs::write(instance.join("makeImage.log"), "mke2fs failed\n").expect("write");
        fs::write(instance.join("emulation.log"), "").expect("write");

        let logs = collect_scratch_logs(&firmae, "4");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].name, "makeImage.log");
        assert!(render_scratch_logs(&logs).starts_with("--- makeImage.log (tail) ---\n"));
    }

    #[test]
    fn clean_removes_all_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let firmae = FirmaePaths::new(dir.path().to_path_buf());
        let scratch = firmae.scratch_dir();
        fs::create_dir_all(scratch.join("1").join("image")).expect("create");
        fs::write(scratch.join("stray.txt"), b"x").expect("write");

        assert_eq!(clean_scratch(&firmae).expect("clean"), 2);
        assert_eq!(fs::read_dir(&scratch).expect("read").count(), 0);
    }

    #[test]
    fn clean_without_scratch_is_path_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let firmae = FirmaePaths::new(dir.path().to_path_buf());
        assert!(matches!(
            clean_scratch(&firmae),
            Err(FwError::PathResolution { .. })
        ));
    }
}
