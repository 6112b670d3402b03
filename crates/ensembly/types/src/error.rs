//! Error taxonomy for the workflow core
//!
//! Usage errors (`TypeMismatch`, `InvalidTransition`, `StagingSyntax`) are
//! surfaced to the caller immediately and never retried. Transient backend
//! errors (`BackendSubmission`) are retried up to the configured reattempt
//! limit; `BackendFatal` is not retried and fails the task.

use crate::state::ExecutionState;

/// Errors produced by the workflow core
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkflowError {
    /// A value of the wrong kind was passed where a specific entity type
    /// was expected. Most of these are ruled out statically; the variant
    /// survives at the dynamic seams (unit-name parsing, re-attaching an
    /// already-owned stage or task).
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// A state transition that would move an entity backwards
    #[error("invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: ExecutionState,
        to: ExecutionState,
    },

    /// A malformed staging directive string
    #[error("malformed staging directive: '{0}'")]
    StagingSyntax(String),

    /// A transient backend submission failure, retried up to the reattempt limit
    #[error("backend submission failed: {0}")]
    BackendSubmission(String),

    /// A non-retryable backend rejection; the task fails
    #[error("backend rejected unit: {0}")]
    BackendFatal(String),

    /// The task exceeded its reattempt budget and is terminally failed
    #[error("task '{task}' exhausted its reattempt limit of {limit}")]
    ReattemptsExhausted { task: String, limit: u32 },

    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("stage not found: {0}")]
    StageNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// An operation was issued against an engine that is not running
    #[error("engine is not running")]
    EngineStopped,
}

impl WorkflowError {
    /// Check whether the error is a transient backend condition that the
    /// engine retries transparently. Everything else is surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendSubmission(_))
    }
}

/// Result alias used throughout the workspace
pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(WorkflowError::BackendSubmission("timeout".into()).is_retryable());
        assert!(!WorkflowError::BackendFatal("bad unit".into()).is_retryable());
        assert!(!WorkflowError::StagingSyntax("a > b > c".into()).is_retryable());
        assert!(!WorkflowError::EngineStopped.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = WorkflowError::InvalidTransition {
            entity: "task-1".into(),
            from: ExecutionState::Submitted,
            to: ExecutionState::Described,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for task-1: SUBMITTED -> DESCRIBED"
        );
    }
}
