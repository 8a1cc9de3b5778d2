//! Single-instance lock for a sync directory
//!
//! Uses a non-blocking exclusive `flock(2)` on the lock file. The kernel drops
//! the lock when the holder exits, so a crashed daemon never leaves a stale
//! lock behind. The holder's pid is written into the file for diagnostics only.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{} is locked by another instance{}", .path.display(), describe_holder(.pid))]
    Held { path: PathBuf, pid: Option<u32> },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn describe_holder(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (pid {pid})"),
        None => String::new(),
    }
}

fn io_err(path: &Path, source: impl Into<std::io::Error>) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        source: source.into(),
    }
}

/// Observed state of a lock file, as reported by [`LockGuard::probe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Held { pid: Option<u32> },
}

/// Exclusive advisory lock, held until dropped or released
pub struct LockGuard {
    lock: Flock<File>,
    path: PathBuf,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("path", &self.path).finish()
    }
}

impl LockGuard {
    /// Try to take the lock without blocking, creating parent directories if needed
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| io_err(path, e))?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                    pid: read_holder_pid(path),
                });
            }
            Err((_, errno)) => return Err(io_err(path, errno)),
        };

        // Truncate only after the lock is ours
        let mut file: &File = &lock;
        file.set_len(0).map_err(|e| io_err(path, e))?;
        file.write_all(format!("{}\n", std::process::id()).as_bytes())
            .map_err(|e| io_err(path, e))?;

        info!("Acquired lock {}", path.display());
        Ok(Self {
            lock,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly
    pub fn release(self) -> Result<(), LockError> {
        let path = self.path;
        self.lock
            .unlock()
            .map_err(|(_, errno)| io_err(&path, errno))?;
        info!("Released lock {}", path.display());
        Ok(())
    }

    /// Report whether someone holds the lock, without creating the file or keeping the lock
    pub fn probe(path: &Path) -> Result<LockStatus, LockError> {
        if !path.exists() {
            return Ok(LockStatus::Free);
        }

        let file = File::open(path).map_err(|e| io_err(path, e))?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("Lock {} is free", path.display());
                drop(lock);
                Ok(LockStatus::Free)
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(LockStatus::Held {
                pid: read_holder_pid(path),
            }),
            Err((_, errno)) => Err(io_err(path, errno)),
        }
    }
}

fn read_holder_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_creates_parent_dirs_and_writes_pid() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("sync").join("syncd.lock");

        let guard = LockGuard::acquire(&path).unwrap();

        assert_eq!(guard.path(), path.as_path());
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_reports_holder() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("syncd.lock");

        let _guard = LockGuard::acquire(&path).unwrap();
        let second = LockGuard::acquire(&path);

        assert_matches!(second, Err(LockError::Held { pid: Some(pid), .. }) if pid == std::process::id());
        // The losing attempt must not clobber the holder's pid
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_lock_is_reusable_after_release_and_drop() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("syncd.lock");

        LockGuard::acquire(&path).unwrap().release().unwrap();

        let guard = LockGuard::acquire(&path).unwrap();
        drop(guard);

        assert!(LockGuard::acquire(&path).is_ok());
    }

    #[test]
    fn test_probe() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("syncd.lock");

        assert_eq!(LockGuard::probe(&path).unwrap(), LockStatus::Free);
        assert!(!path.exists());

        let guard = LockGuard::acquire(&path).unwrap();
        assert_eq!(
            LockGuard::probe(&path).unwrap(),
            LockStatus::Held {
                pid: Some(std::process::id())
            }
        );

        drop(guard);
        assert_eq!(LockGuard::probe(&path).unwrap(), LockStatus::Free);
    }

    #[test]
    fn test_held_error_message() {
        let err = LockError::Held {
            path: PathBuf::from("/sync/syncd.lock"),
            pid: Some(42),
        };
        assert_eq!(
            err.to_string(),
            "/sync/syncd.lock is locked by another instance (pid 42)"
        );
    }
}
