//! Error types for actlog.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ActlogError {
    /// The data file exists but is not a readable store image.
    #[error("Corrupt store at {path}: {reason}")]
    CorruptStore { path: PathBuf, reason: String },

    /// A flush or append did not complete. Never swallowed.
    #[error("Write failed for {path}: {reason}")]
    WriteFailure { path: PathBuf, reason: String },

    /// One queue line could not be parsed.
    #[error("Skipped queue line {line}: {reason}")]
    ParseSkip { line: usize, reason: String },

    #[error("Store at {0} is held by another process")]
    StoreLocked(PathBuf),

    #[error("Store is closed")]
    StoreClosed,

    #[error("Store snapshot is read-only")]
    ReadOnly,

    #[error("Queue {path} is full ({size} bytes, limit {limit})")]
    QueueFull { path: PathBuf, size: u64, limit: u64 },

    #[error("Queue entry is {size} bytes, limit {limit}")]
    EntryTooLarge { size: usize, limit: usize },

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl ActlogError {
    pub(crate) fn write_failure(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        ActlogError::WriteFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        ActlogError::CorruptStore {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
