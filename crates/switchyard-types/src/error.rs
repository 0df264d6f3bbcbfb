//! Infrastructure error types shared by every collaborator contract.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures of an external store (config or run store).
///
/// These are infrastructure failures, distinct from domain failures such as a
/// missing project. Callers are expected to retry at their own level rather
/// than feed them into workflow-level fallback.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A row exists but could not be decoded.
    #[error("Corrupt record '{id}': {reason}")]
    Corrupt { id: String, reason: String },

    /// A write collided with an existing record.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The row targeted by an update does not exist.
    #[error("Record not found: {0}")]
    Missing(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt {
            id: "<json>".to_string(),
            reason: err.to_string(),
        }
    }
}
