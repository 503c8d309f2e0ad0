//! Atomic journal file I/O.
//!
//! The journal is rewritten in full on every update via the temp-file +
//! fsync + rename protocol: a crash at any point leaves either the old
//! complete file or the new complete file on disk, never a torn one.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Upper bound on the journal file size. A journal is a few KiB in
/// practice; anything near this limit is corrupt or hostile.
pub const MAX_JOURNAL_SIZE: u64 = 4 * 1024 * 1024;

/// Errors from journal file I/O.
#[derive(Debug, thiserror::Error)]
pub enum JournalFsError {
    /// The path has no parent directory to create the temp file in.
    #[error("journal path has no parent directory: {0}")]
    NoParentDirectory(String),

    /// The file on disk exceeds [`MAX_JOURNAL_SIZE`].
    #[error("journal file too large: {size} bytes (max {max})")]
    FileTooLarge {
        /// Observed size in bytes.
        size: u64,
        /// Allowed maximum in bytes.
        max: u64,
    },

    /// JSON encode/decode failure.
    #[error("journal serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// Underlying filesystem failure.
    #[error("journal I/O failed during {context}: {source}")]
    Io {
        /// Operation that failed.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

fn io_err(context: &'static str) -> impl FnOnce(std::io::Error) -> JournalFsError {
    move |source| JournalFsError::Io { context, source }
}

/// Serializes `value` as pretty JSON and writes it atomically to `path`
/// with mode 0600, creating the parent directory (0700) on first use.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), JournalFsError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| JournalFsError::NoParentDirectory(path.display().to_string()))?;

    if !parent.exists() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .map_err(io_err("create journal directory"))?;
        }
        #[cfg(not(unix))]
        fs::create_dir_all(parent).map_err(io_err("create journal directory"))?;
    }

    let json = serde_json::to_string_pretty(value)?;

    // Temp file in the same directory: same filesystem, so the rename is
    // atomic. NamedTempFile creates with mode 0600.
    let mut tmp =
        tempfile::NamedTempFile::new_in(parent).map_err(io_err("create temp file"))?;
    tmp.write_all(json.as_bytes())
        .map_err(io_err("write temp file"))?;
    tmp.flush().map_err(io_err("flush temp file"))?;
    tmp.as_file()
        .sync_all()
        .map_err(io_err("fsync temp file"))?;
    tmp.persist(path)
        .map_err(|e| JournalFsError::Io {
            context: "rename into place",
            source: e.error,
        })?;

    // fsync the directory so the rename itself is durable.
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(io_err("fsync journal directory"))?;

    Ok(())
}

/// Loads a JSON document from `path`.
///
/// Returns `Ok(None)` when the file does not exist; a fresh host has no
/// journal and that is not an error.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, JournalFsError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err("stat journal file")(e)),
    };
    if metadata.len() > MAX_JOURNAL_SIZE {
        return Err(JournalFsError::FileTooLarge {
            size: metadata.len(),
            max: MAX_JOURNAL_SIZE,
        });
    }

    let bytes = fs::read(path).map_err(io_err("read journal file"))?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}
