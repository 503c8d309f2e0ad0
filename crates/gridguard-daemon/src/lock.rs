//! Daemon lock file.
//!
//! A pid file created with exclusive semantics guards against two daemons
//! orchestrating the same host. A lock left behind by a dead process is
//! taken over; a live pid refuses startup.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Lock acquisition errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another live process holds the lock.
    #[error("another instance (pid {pid}) holds the lock at {path}")]
    Held {
        /// Pid found in the lock file.
        pid: u32,
        /// Lock file path.
        path: String,
    },

    /// Filesystem failure while taking the lock.
    #[error("lock file I/O at {path}: {source}")]
    Io {
        /// Lock file path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// An acquired lock. Released (best effort) on drop.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquires the lock at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Held`] when a live process owns the lock,
    /// or [`LockError::Io`] on filesystem failure.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io = |source| LockError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io)?;
        }

        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id()).map_err(io)?;
                    info!(path = %path.display(), "lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                },
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if process_alive(pid) => {
                            return Err(LockError::Held {
                                pid,
                                path: path.display().to_string(),
                            });
                        },
                        _ => {
                            warn!(path = %path.display(), "removing stale lock file");
                            fs::remove_file(path).map_err(io)?;
                            // Retry the exclusive create.
                        },
                    }
                },
                Err(e) => return Err(io(e)),
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

/// True when `pid` names a live process.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Without a portable liveness probe, assume the holder is alive.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gridguard.lock");

        {
            let _lock = LockFile::acquire(&path).unwrap();
            assert!(path.exists());
            // A second acquisition against our own live pid is refused.
            assert!(matches!(
                LockFile::acquire(&path),
                Err(LockError::Held { .. })
            ));
        }
        assert!(!path.exists(), "lock must be released on drop");
    }

    #[test]
    fn test_stale_lock_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gridguard.lock");
        // No such pid on any sane system.
        fs::write(&path, "4294967294").unwrap();

        let _lock = LockFile::acquire(&path).unwrap();
        let holder: u32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(holder, std::process::id());
    }

    #[test]
    fn test_garbage_lock_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gridguard.lock");
        fs::write(&path, "not a pid").unwrap();

        assert!(LockFile::acquire(&path).is_ok());
    }
}
