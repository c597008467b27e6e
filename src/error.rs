//! Pipeline error taxonomy.

use std::fmt;

use serde::Serialize;

/// Errors produced while moving a file through the upload pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    #[error("read failed for {name}: {reason}")]
    Read { name: String, reason: String },

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("upload of part {part_number} failed after {attempts} attempts: {reason}")]
    PartUpload {
        part_number: u32,
        attempts: u32,
        reason: String,
    },

    #[error("remote api: {0}")]
    Remote(String),

    #[error("metadata commit failed: {0}")]
    Commit(String),

    #[error("object {object_key} uploaded but not committed: {reason}")]
    OrphanedUpload { object_key: String, reason: String },

    #[error("crypto worker pool has been shut down")]
    PoolExhausted,

    #[error("cancelled")]
    Cancelled,

    #[error("no key available for collection {0}")]
    UnknownCollection(i64),

    #[error("upload scheduler is not running")]
    SchedulerStopped,
}

/// Coarse classification used in batch reports and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Read,
    Encryption,
    PartUpload,
    Remote,
    Commit,
    OrphanedUpload,
    PoolExhausted,
    Cancelled,
}

impl UploadError {
    pub fn read(name: &str, reason: impl fmt::Display) -> Self {
        UploadError::Read {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Read { .. } => ErrorKind::Read,
            UploadError::Encryption(_) | UploadError::UnknownCollection(_) => {
                ErrorKind::Encryption
            }
            UploadError::PartUpload { .. } => ErrorKind::PartUpload,
            UploadError::Remote(_) => ErrorKind::Remote,
            UploadError::Commit(_) => ErrorKind::Commit,
            UploadError::OrphanedUpload { .. } => ErrorKind::OrphanedUpload,
            UploadError::PoolExhausted | UploadError::SchedulerStopped => {
                ErrorKind::PoolExhausted
            }
            UploadError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the scheduler may re-queue a task that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PartUpload | ErrorKind::Remote | ErrorKind::Commit | ErrorKind::OrphanedUpload
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Read => "read",
            ErrorKind::Encryption => "encryption",
            ErrorKind::PartUpload => "part_upload",
            ErrorKind::Remote => "remote",
            ErrorKind::Commit => "commit",
            ErrorKind::OrphanedUpload => "orphaned_upload",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
