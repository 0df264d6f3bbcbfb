//! Error types for the run engine.

use switchyard_types::{RunStatus, StoreError};
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by engine operations.
///
/// Step failures are not errors: they end the run in FAILED, WAITING_APPROVAL
/// or TIMED_OUT and are reported through the `RunResult`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No run with this id exists.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// The operation is not legal from the run's current state.
    #[error("Cannot {operation} run '{run_id}' in state {from}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        operation: &'static str,
    },

    /// The execution context failed validation; no run was created.
    #[error("Invalid execution context for run '{run_id}': {reason}")]
    InvalidContext { run_id: String, reason: String },

    /// The run store failed.
    #[error("Run store error: {0}")]
    Store(#[from] StoreError),

    /// The engine stopped accepting work.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub(crate) fn invalid(run_id: &str, from: RunStatus, operation: &'static str) -> Self {
        Self::InvalidTransition {
            run_id: run_id.to_string(),
            from,
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let err = EngineError::invalid("r1", RunStatus::WaitingApproval, "pause");
        assert_eq!(
            err.to_string(),
            "Cannot pause run 'r1' in state WAITING_APPROVAL"
        );
    }

    #[test]
    fn test_store_error_converts() {
        let err: EngineError = StoreError::Missing("r9".into()).into();
        assert!(matches!(err, EngineError::Store(StoreError::Missing(_))));
    }
}
