//! Cooperative cross-process lock files
//!
//! Mutual exclusion between independent short-lived invocations is built on
//! create-exclusive file semantics: whoever creates the lock file owns the
//! lock, and removal releases it. A holder that dies without cleaning up is
//! reclaimed once the file is older than the staleness threshold, so a
//! crashed process cannot wedge the store. Waiters poll with a bounded
//! timeout and fail loudly rather than hang.

use crate::error::{Result, SafepointError};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// How long a waiter polls before giving up
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
/// Age after which a lock file is considered abandoned and reclaimed
pub const STALE_AFTER: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An advisory exclusive lock bound to a filesystem path
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

/// Held lock; removing the file on drop releases it on all exit paths
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Acquire the lock, waiting up to [`ACQUIRE_TIMEOUT`]
    pub fn acquire(&self) -> Result<LockGuard> {
        self.acquire_within(ACQUIRE_TIMEOUT)
    }

    /// Acquire the lock with an explicit timeout
    pub fn acquire_within(&self, timeout: Duration) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    // Holder identity, for post-mortem inspection only
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(LockGuard {
                        path: self.path.clone(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.reclaim_if_stale() {
                        continue;
                    }
                    if start.elapsed() >= timeout {
                        return Err(SafepointError::LockTimeout(self.path.clone()));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the lock file if its holder appears dead
    ///
    /// Returns true when the file was removed and acquisition should be
    /// retried immediately.
    fn reclaim_if_stale(&self) -> bool {
        let age = fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok());

        match age {
            Some(age) if age > STALE_AFTER => {
                warn!(
                    "Reclaiming stale lock {:?} (held for {:?})",
                    self.path, age
                );
                fs::remove_file(&self.path).is_ok()
            }
            _ => false,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Failed to remove lock file {:?}: {}", self.path, e);
        }
    }
}

/// Path of the lock file guarding a given file
pub fn lock_path_for(guarded: &Path) -> PathBuf {
    let name = guarded
        .file_name()
        .map(|n| format!(".{}.lock", n.to_string_lossy()))
        .unwrap_or_else(|| ".lock".to_string());
    guarded.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = LockFile::new(dir.path().join("x.lock"));

        let guard = lock.acquire().unwrap();
        assert!(dir.path().join("x.lock").exists());
        drop(guard);
        assert!(!dir.path().join("x.lock").exists());
    }

    #[test]
    fn test_contention_times_out() {
        let dir = TempDir::new().unwrap();
        let lock = LockFile::new(dir.path().join("x.lock"));

        let _guard = lock.acquire().unwrap();
        let other = LockFile::new(dir.path().join("x.lock"));
        let err = other
            .acquire_within(Duration::from_millis(150))
            .unwrap_err();
        assert!(matches!(err, SafepointError::LockTimeout(_)));
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.lock");
        fs::write(&path, "12345\n").unwrap();

        // Backdate the lock file past the staleness threshold
        let old = SystemTime::now() - (STALE_AFTER + Duration::from_secs(5));
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        let lock = LockFile::new(&path);
        let guard = lock.acquire_within(Duration::from_millis(500)).unwrap();
        drop(guard);
    }

    #[test]
    fn test_lock_path_for() {
        let p = lock_path_for(Path::new("/a/b/metadata.json"));
        assert_eq!(p, PathBuf::from("/a/b/.metadata.json.lock"));
    }
}
