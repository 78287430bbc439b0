//! Store error types.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflict with an existing object.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Version mismatch (optimistic concurrency control).
    #[error("version mismatch on {key}: stored {expected}, got {actual}")]
    VersionMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Object rejected before it reached storage.
    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Stale writes and duplicate creates; the caller should re-fetch and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::VersionMismatch { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
