//! Exclusive access to a devices store for one read-modify-write cycle.
use crate::error::{FwError, FwResult};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const RETRY_EVERY: Duration = Duration::from_millis(50);

/// Advisory lock on `<store>.lock`, held until dropped.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    file: File,
}

impl StoreLock {
    /// Acquire the lock, retrying until `wait` has passed.
    pub fn acquire(store: &Path, wait: Duration) -> FwResult<Self> {
        let path = lock_path(store);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| FwError::io(&path, err))?;

        let start = Instant::now();
        loop {
            match try_lock(&file) {
                Ok(true) => {
                    tracing::debug!(store = %store.display(), waited_ms = start.elapsed().as_millis() as u64, "store locked");
                    return Ok(Self { path, file });
                }
                Ok(false) => {}
                Err(err) => return Err(FwError::io(&path, err)),
            }
            if start.elapsed() >= wait {
                tracing::warn!(store = %store.display(), "store lock not acquired");
                return Err(FwError::Busy {
                    store: store.to_path_buf(),
                    waited: start.elapsed(),
                });
            }
            thread::sleep(RETRY_EVERY);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

fn lock_path(store: &Path) -> PathBuf {
    let mut name = store
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    store.with_file_name(name)
}

#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor stays valid for the lifetime of `file`.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: as above; closing the descriptor would release it too.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn second_writer_is_busy_until_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = dir.path().join("devices");

        let held = StoreLock::acquire(&store, Duration::from_millis(100)).expect("first lock");
        assert!(held.path().ends_with("devices.lock"));

        let start = Instant::now();
        let err = StoreLock::acquire(&store, Duration::from_millis(150)).unwrap_err();
        assert!(matches!(err, FwError::Busy { .. }));
        assert!(start.elapsed() >= Duration::from_millis(150));

        drop(held);
        StoreLock::acquire(&store, Duration::from_millis(100)).expect("lock after release");
    }
}
