//! Storage errors.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for storage calls.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure reaching the record log.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying file could not be read or written.
    #[error("record log I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Another handle owns the log file.
    #[error("record log {} is in use by another handle", .0.display())]
    Locked(PathBuf),
}
