//! Filesystem helpers shared by the scaffolder and the reconciler.
mod archive;
mod discover;

pub use archive::{create_tar_bz2, extract_archive, ArchiveKind};
pub use discover::{find_marker_dirs, WalkLimits};

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// First free path among `base`, `base-2`, `base-3`, ...
///
/// Existence is checked without following symlinks, so a dangling link
/// still counts as taken.
pub fn unique_path(base: &Path) -> Result<PathBuf> {
    if fs::symlink_metadata(base).is_err() {
        return Ok(base.to_path_buf());
    }
    let name = base
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("path {} has no UTF-8 file name", base.display()))?;
    for suffix in 2u32.. {
        let candidate = base.with_file_name(format!("{name}-{suffix}"));
        if fs::symlink_metadata(&candidate).is_err() {
            return Ok(candidate);
        }
    }
    Err(anyhow!("no free name for {}", base.display()))
}

/// Recursively copy `src` into `dest`, which must not exist yet.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(anyhow!("{} is not a directory", src.display()));
    }
    fs::create_dir_all(dest.parent().unwrap_or(Path::new(".")))
        .with_context(|| format!("create parent of {}", dest.display()))?;
    fs::create_dir(dest).with_context(|| format!("create {}", dest.display()))?;

    let mut pending = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((from_dir, to_dir)) = pending.pop() {
        for entry in fs::read_dir(&from_dir).with_context(|| format!("read {}", from_dir.display()))? {
            let entry = entry?;
            let from = entry.path();
            let to = to_dir.join(entry.file_name());
            let file_type = entry
                .file_type()
                .with_context(|| format!("inspect {}", from.display()))?;
            if file_type.is_symlink() {
                copy_symlink(&from, &to)?;
            } else if file_type.is_dir() {
                fs::create_dir(&to).with_context(|| format!("create {}", to.display()))?;
                pending.push((from, to));
            } else {
                fs::copy(&from, &to)
                    .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = fs::read_link(from).with_context(|| format!("read link {}", from.display()))?;
    std::os::unix::fs::symlink(&target, to).with_context(|| format!("link {}", to.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to).with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
    Ok(())
}

/// Regular files directly inside `dir`, sorted by name.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
