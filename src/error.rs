//! Error types for the safepoint library
//!
//! Errors are designed to be informative and actionable. The hook path never
//! surfaces these to the host tool; the standalone commands render them via
//! [`SafepointError::user_message`].

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the safepoint library
pub type Result<T> = std::result::Result<T, SafepointError>;

/// Main error type for all safepoint operations
#[derive(Debug, Error)]
pub enum SafepointError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot ID failed shape validation before any storage access
    #[error("Invalid snapshot id: {0:?}")]
    InvalidSnapshotId(String),

    /// Snapshot not found in the project history
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// A prefix matched more than one snapshot
    #[error("Ambiguous snapshot id {prefix:?} ({matches} matches)")]
    AmbiguousSnapshotId {
        /// The prefix that was supplied
        prefix: String,
        /// Number of snapshots matching the prefix
        matches: usize,
    },

    /// Object not found in content-addressable storage
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Timed out waiting for the cooperative lock file
    #[error("Lock acquisition timeout: {0:?}")]
    LockTimeout(PathBuf),

    /// Snapshot storage missing or unusable
    #[error("Storage not initialized at path: {0:?}")]
    StorageNotInitialized(PathBuf),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Decompression errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SafepointError {
    /// Create a storage error with a custom message
    pub fn storage(msg: impl Into<String>) -> Self {
        SafepointError::Storage(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        SafepointError::Internal(msg.into())
    }

    /// Check if this error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SafepointError::LockTimeout(_))
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            SafepointError::InvalidSnapshotId(id) => {
                format!(
                    "Invalid snapshot id {:?}. Snapshot ids are 1-40 lowercase hex characters.",
                    id
                )
            }
            SafepointError::SnapshotNotFound(id) => {
                format!(
                    "Snapshot '{}' not found. Use 'safepoint list' to see available snapshots.",
                    id
                )
            }
            SafepointError::AmbiguousSnapshotId { prefix, matches } => {
                format!(
                    "Snapshot prefix '{}' is ambiguous ({} matches). Supply more characters.",
                    prefix, matches
                )
            }
            SafepointError::LockTimeout(path) => {
                format!(
                    "Timed out waiting for lock {:?}. Another operation may be in progress. Try again later.",
                    path
                )
            }
            SafepointError::StorageNotInitialized(path) => {
                format!("Snapshot storage not initialized at {:?}.", path)
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SafepointError::SnapshotNotFound("abc123".to_string());
        assert_eq!(err.to_string(), "Snapshot not found: abc123");
    }

    #[test]
    fn test_error_recoverable() {
        assert!(SafepointError::LockTimeout(PathBuf::from("/tmp/x.lock")).is_recoverable());
        assert!(!SafepointError::storage("bad").is_recoverable());
    }

    #[test]
    fn test_user_message_mentions_prefix() {
        let err = SafepointError::AmbiguousSnapshotId {
            prefix: "ab".to_string(),
            matches: 3,
        };
        assert!(err.user_message().contains("'ab'"));
    }
}
