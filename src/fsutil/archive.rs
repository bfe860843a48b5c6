//! Archive extraction for staged firmware and rootfs packaging.
use anyhow::{anyhow, Context, Result};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarBz2,
}

impl ArchiveKind {
    /// Detect an archive by file name suffix (case-insensitive).
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Some(ArchiveKind::TarBz2)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

/// Extract `archive` into `dest`, returning the regular files written.
///
/// Any member whose path would land outside `dest` aborts the extraction.
pub fn extract_archive(archive: &Path, kind: ArchiveKind, dest: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut written = match kind {
        ArchiveKind::Zip => extract_zip(file, dest),
        ArchiveKind::Tar => extract_tar(file, dest),
        ArchiveKind::TarBz2 => extract_tar(BzDecoder::new(file), dest),
    }
    .with_context(|| format!("extract {}", archive.display()))?;
    written.sort();
    Ok(written)
}

fn extract_zip(file: File, dest: &Path) -> Result<Vec<PathBuf>> {
    let mut zip = zip::ZipArchive::new(file).context("read zip directory")?;
    // Validate every member before writing anything.
    for index in 0..zip.len() {
        let member = zip.by_index(index).context("read zip member")?;
        if member.enclosed_name().is_none() {
            return Err(anyhow!("unsafe path in zip: {}", member.name()));
        }
    }

    let mut written = Vec::new();
    for index in 0..zip.len() {
        let mut member = zip.by_index(index).context("read zip member")?;
        let Some(rel) = member.enclosed_name().map(Path::to_path_buf) else {
            continue;
        };
        let target = dest.join(&rel);
        if member.is_dir() {
            fs::create_dir_all(&target).with_context(|| format!("create {}", target.display()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut out = File::create(&target).with_context(|| format!("create {}", target.display()))?;
        io::copy(&mut member, &mut out).with_context(|| format!("write {}", target.display()))?;
        #[cfg(unix)]
        if let Some(mode) = member.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
                .with_context(|| format!("chmod {}", target.display()))?;
        }
        written.push(target);
    }
    Ok(written)
}

fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = tar::Archive::new(reader);
    let mut written = Vec::new();
    for entry in archive.entries().context("read tar entries")? {
        let mut entry = entry.context("read tar entry")?;
        let rel = entry.path().context("decode tar member path")?.into_owned();
        if !is_enclosed(&rel) {
            return Err(anyhow!("unsafe path in tar: {}", rel.display()));
        }
        let is_file = entry.header().entry_type().is_file();
        let unpacked = entry
            .unpack_in(dest)
            .with_context(|| format!("unpack {}", rel.display()))?;
        if !unpacked {
            return Err(anyhow!("unsafe path in tar: {}", rel.display()));
        }
        if is_file {
            written.push(dest.join(rel));
        }
    }
    Ok(written)
}

fn is_enclosed(rel: &Path) -> bool {
    rel.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Pack the contents of `src_dir` (not the directory itself) into a
/// bzip2-compressed tarball at `dest`.
///
/// Entries are added in sorted order with symlinks stored as links. The
/// archive is written to a temporary file next to `dest` and renamed into
/// place, so a failure never leaves a truncated tarball behind.
pub fn create_tar_bz2(src_dir: &Path, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", dest.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    let tmp = NamedTempFile::new_in(parent).with_context(|| format!("stage {}", dest.display()))?;

    {
        let encoder = BzEncoder::new(tmp.as_file(), Compression::best());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        for (path, rel) in sorted_entries(src_dir)? {
            builder
                .append_path_with_name(&path, &rel)
                .with_context(|| format!("archive {}", path.display()))?;
        }
        let encoder = builder.into_inner().context("finish tar stream")?;
        encoder.finish().context("finish bzip2 stream")?;
    }

    tmp.as_file()
        .sync_all()
        .with_context(|| format!("sync {}", dest.display()))?;
    tmp.persist(dest)
        .map_err(|err| err.error)
        .with_context(|| format!("publish {}", dest.display()))?;
    Ok(())
}

/// Every entry below `root` paired with its root-relative name, depth-first
/// in name order (a directory precedes its children).
fn sorted_entries(root: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut entries = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel_dir) = stack.pop() {
        let dir = root.join(&rel_dir);
        let mut children: Vec<_> = fs::read_dir(&dir)
            .with_context(|| format!("read {}", dir.display()))?
            .collect::<io::Result<_>>()
            .with_context(|| format!("read {}", dir.display()))?;
        children.sort_by_key(|entry| entry.file_name());

        let mut subdirs = Vec::new();
        for child in children {
            let rel = rel_dir.join(child.file_name());
            let is_dir = child
                .file_type()
                .with_context(|| format!("inspect {}", child.path().display()))?
                .is_dir();
            entries.push((child.path(), rel.clone()));
            if is_dir {
                subdirs.push(rel);
            }
        }
        stack.extend(subdirs.into_iter().rev());
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let file = File::create(path).expect("create zip");
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, data) in members {
            zip.start_file(*name, options).expect("start member");
            zip.write_all(data).expect("write member");
        }
        zip.finish().expect("finish zip");
    }

    #[test]
    fn detects_archive_kinds_by_suffix() {
        assert_eq!(ArchiveKind::detect(Path::new("FW.ZIP")), Some(ArchiveKind::Zip));
        assert_eq!(
            ArchiveKind::detect(Path::new("rootfs.tar.bz2")),
            Some(ArchiveKind::TarBz2)
        );
        assert_eq!(ArchiveKind::detect(Path::new("fw.tar")), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::detect(Path::new("fw.bin")), None);
    }

    #[test]
    fn extracts_zip_members_and_lists_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("fw.zip");
        write_zip(
            &archive,
            &[("DIR868L_FW.bin", b"image"), ("notes/readme.txt", b"hi")],
        );
        let out = dir.path().join("out");
        fs::create_dir(&out).expect("create out");

        let files = extract_archive(&archive, ArchiveKind::Zip, &out).expect("extract");
        assert_eq!(
            files,
            vec![out.join("DIR868L_FW.bin"), out.join("notes/readme.txt")]
        );
        assert_eq!(fs::read(out.join("DIR868L_FW.bin")).expect("read"), b"image");
    }

    #[test]
    fn rejects_zip_slip_before_writing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("ok.bin", b"fine"), ("../escape.txt", b"bad")]);
        let out = dir.path().join("out");
        fs::create_dir(&out).expect("create out");

        assert!(extract_archive(&archive, ArchiveKind::Zip, &out).is_err());
        assert!(!dir.path().join("escape.txt").exists());
        assert!(!out.join("ok.bin").exists());
    }

    #[test]
    fn tarball_holds_directory_contents_at_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rootfs = dir.path().join("squashfs-root");
        fs::create_dir_all(rootfs.join("etc")).expect("create etc");
        fs::create_dir_all(rootfs.join("bin")).expect("create bin");
        fs::write(rootfs.join("etc/passwd"), "root:x:0:0\n").expect("write passwd");
        fs::write(rootfs.join("bin/busybox"), b"\x7fELF").expect("write busybox");
        #[cfg(unix)]
        std::os::unix::fs::symlink("busybox", rootfs.join("bin/sh")).expect("symlink");

        let tarball = dir.path().join("env").join("rootfs.tar.bz2");
        create_tar_bz2(&rootfs, &tarball).expect("pack");

        let out = dir.path().join("unpacked");
        fs::create_dir(&out).expect("create out");
        let files = extract_archive(&tarball, ArchiveKind::TarBz2, &out).expect("unpack");
        assert!(files.contains(&out.join("etc/passwd")));
        assert_eq!(
            fs::read_to_string(out.join("etc/passwd")).expect("read"),
            "root:x:0:0\n"
        );
        #[cfg(unix)]
        assert_eq!(
            fs::read_link(out.join("bin/sh")).expect("read link"),
            PathBuf::from("busybox")
        );
        assert!(!out.join("squashfs-root").exists());
    }
}
