// src/lock.rs

//! Exclusive locks on shared on-disk resources
//!
//! # Lock Strategy
//!
//! - **Work tree lock**: `<state>.lock`, held by a pipeline run for its whole
//!   duration, so only one run touches the packaging working tree
//! - **Snapshot lock**: `<monitoring.work_dir>/snapshots.lock`, held by a
//!   drift check while it reads and rewrites its snapshots
//!
//! Both are `flock(LOCK_EX)` locks taken without blocking: a contended lock
//! means another run is in progress and is reported as [`Error::LockHeld`].
//! The lock is released when the guard is dropped, or when the process dies.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Exclusive lock guard
pub struct ExclusiveLock {
    /// Kept open to maintain the lock
    file: File,
    path: PathBuf,
}

impl ExclusiveLock {
    /// Try to acquire the lock without blocking
    ///
    /// The holder's PID is written into the lock file for diagnostics.
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                file.set_len(0)?;
                writeln!(file, "{}", std::process::id())?;
                info!("Acquired lock at {}", path.display());
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                debug!("Lock already held at {}", path.display());
                Err(Error::LockHeld(format!(
                    "{} is held by another run{}",
                    path.display(),
                    match holder.trim() {
                        "" => String::new(),
                        pid => format!(" (pid {})", pid),
                    }
                )))
            }
            Err(e) => Err(Error::IoError(format!(
                "Failed to acquire lock {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!("Released lock at {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.lock");

        let lock = ExclusiveLock::try_acquire(&path).unwrap();
        assert_eq!(lock.path(), path);

        let err = ExclusiveLock::try_acquire(&path).err().unwrap();
        assert!(matches!(err, Error::LockHeld(_)));
        assert!(err.to_string().contains(&std::process::id().to_string()));

        drop(lock);
        assert!(ExclusiveLock::try_acquire(&path).is_ok());
    }

    #[test]
    fn test_lock_creates_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/snapshots.lock");
        let _lock = ExclusiveLock::try_acquire(&path).unwrap();
        assert!(path.exists());
    }
}
