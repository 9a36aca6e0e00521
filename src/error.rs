//! Error types for snapshot operations.

use std::io;
use thiserror::Error;

use crate::backend::StoreError;

/// Coarse classification of a [`SnapshotError`], used by callers to decide
/// between reporting a caller fault and retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; never retried.
    Validation,
    /// Unknown snapshot/experiment, or a manifest naming unstored blobs.
    NotFound,
    /// Same hash recorded with a different size.
    Conflict,
    /// Transient object store or database failure.
    BackendUnavailable,
    /// Stored state disagrees with the ledger.
    Integrity,
}

/// Errors that can occur during snapshot operations.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Malformed hash, path, size or experiment name.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown snapshot or experiment.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Manifest references hashes with no recorded blob.
    #[error("Missing blobs: {}", .0.join(", "))]
    MissingBlobs(Vec<String>),

    /// Ledger already holds this hash with a different size.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object store or database could not be reached; safe to retry.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A blob the ledger knows about could not be read back intact.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// I/O error during local file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),
}

impl SnapshotError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SnapshotError::Validation(_) => ErrorKind::Validation,
            SnapshotError::NotFound(_) | SnapshotError::MissingBlobs(_) => ErrorKind::NotFound,
            SnapshotError::Conflict(_) => ErrorKind::Conflict,
            SnapshotError::BackendUnavailable(_) | SnapshotError::IoError(_) => {
                ErrorKind::BackendUnavailable
            }
            SnapshotError::IntegrityViolation(_) => ErrorKind::Integrity,
        }
    }

    /// Whether repeating the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::BackendUnavailable
    }
}

impl From<sqlx::Error> for SnapshotError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => SnapshotError::NotFound("row not found".to_string()),
            sqlx::Error::Decode(e) => {
                SnapshotError::IntegrityViolation(format!("corrupt ledger row: {}", e))
            }
            sqlx::Error::ColumnDecode { index, source } => SnapshotError::IntegrityViolation(
                format!("corrupt ledger column {}: {}", index, source),
            ),
            other => SnapshotError::BackendUnavailable(format!("database: {}", other)),
        }
    }
}

impl From<StoreError> for SnapshotError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => {
                SnapshotError::NotFound(format!("object {} not found in store", key))
            }
            StoreError::Unavailable(msg) => SnapshotError::BackendUnavailable(msg),
            StoreError::Body(e) => {
                SnapshotError::Validation(format!("upload body rejected: {}", e))
            }
            StoreError::Misconfigured(msg) => SnapshotError::Validation(msg),
            StoreError::Conflict(key) => SnapshotError::Conflict(format!(
                "object {} is already stored with a different size",
                key
            )),
            StoreError::Io(e) => {
                SnapshotError::BackendUnavailable(format!("object store I/O: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_blobs_lists_every_hash() {
        let err = SnapshotError::MissingBlobs(vec!["aa".into(), "bb".into()]);
        assert_eq!(err.to_string(), "Missing blobs: aa, bb");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_store_errors_map_into_taxonomy() {
        let unavailable: SnapshotError = StoreError::Unavailable("timeout".into()).into();
        assert!(unavailable.is_retryable());

        let body: SnapshotError =
            StoreError::Body(io::Error::new(io::ErrorKind::InvalidData, "short")).into();
        assert_eq!(body.kind(), ErrorKind::Validation);

        let missing: SnapshotError = StoreError::NotFound("ab/cd".into()).into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_pool_timeout_is_retryable() {
        let err: SnapshotError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_retryable());
    }
}
