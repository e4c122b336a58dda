//! Advisory file locks serializing writers across processes
//!
//! Commits, garbage collection and undo-track updates hold an exclusive
//! `flock(2)` on a lock file inside the store for their critical section. The
//! in-process commit mutex orders threads; this lock orders processes. The OS
//! drops the lock when the file handle closes, including on crash.
//!
//! Without `flock(2)` the lock is a `<name>.held` marker created with
//! `create_new` and removed on drop. A crashed holder leaves the marker
//! behind; it has to be removed by hand.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{trace, warn};

#[cfg(any(not(unix), test))]
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// An exclusive lock held for the lifetime of the value
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
    marker: Option<PathBuf>,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is acquired
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_and_lock(path.as_ref(), true)
    }

    /// Acquire the lock without waiting; fails if another handle holds it
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_and_lock(path.as_ref(), false)
    }

    fn open_and_lock(path: &Path, blocking: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let marker = lock(&file, path, blocking)?;

        // Owner info for whoever inspects a stuck lock
        file.set_len(0)?;
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        writeln!(file, "{}@{}", std::process::id(), host)?;
        file.flush()?;

        trace!("Acquired lock {:?}", path);
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
            marker,
        })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(marker) = &self.marker {
            if let Err(e) = std::fs::remove_file(marker) {
                warn!("Failed to remove lock marker {:?}: {}", marker, e);
            }
        }
    }
}

#[cfg(unix)]
fn lock(file: &File, _path: &Path, blocking: bool) -> io::Result<Option<PathBuf>> {
    use libc::{flock, LOCK_EX, LOCK_NB};

    let operation = if blocking { LOCK_EX } else { LOCK_EX | LOCK_NB };
    loop {
        let result = unsafe { flock(file.as_raw_fd(), operation) };
        if result == 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn lock(_file: &File, path: &Path, blocking: bool) -> io::Result<Option<PathBuf>> {
    create_marker(path, blocking).map(Some)
}

#[cfg(any(not(unix), test))]
const MARKER_POLL: Duration = Duration::from_millis(10);

/// Create `<path>.held` exclusively, polling while another holder has it
#[cfg(any(not(unix), test))]
fn create_marker(path: &Path, blocking: bool) -> io::Result<PathBuf> {
    let mut name = path.as_os_str().to_owned();
    name.push(".held");
    let marker = PathBuf::from(name);
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => return Ok(marker),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && blocking => {
                std::thread::sleep(MARKER_POLL);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock_records_owner() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("store.lock");

        let lock = FileLock::acquire(&lock_path).unwrap();
        assert_eq!(lock.path(), lock_path.as_path());
        let content = fs::read_to_string(&lock_path).unwrap();
        assert!(content.starts_with(&std::process::id().to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_second_handle_is_excluded() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("store.lock");

        let first = FileLock::acquire(&lock_path).unwrap();
        assert!(FileLock::try_acquire(&lock_path).is_err());
        drop(first);
        assert!(FileLock::try_acquire(&lock_path).is_ok());
    }

    #[test]
    fn test_marker_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("undo.lock");

        let marker = create_marker(&lock_path, false).unwrap();
        assert_eq!(marker, temp_dir.path().join("undo.lock.held"));
        assert!(create_marker(&lock_path, false).is_err());

        let path = lock_path.clone();
        let waiter = std::thread::spawn(move || create_marker(&path, true));
        std::thread::sleep(MARKER_POLL * 5);
        assert!(!waiter.is_finished());
        fs::remove_file(&marker).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), marker);
    }

    #[cfg(unix)]
    #[test]
    fn test_blocking_acquire_waits_for_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("store.lock");

        let first = FileLock::acquire(&lock_path).unwrap();
        let path = lock_path.clone();
        let waiter = std::thread::spawn(move || FileLock::acquire(&path).map(|_| ()));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(first);
        waiter.join().unwrap().unwrap();
    }
}
