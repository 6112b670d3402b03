//! The shared state order for pipelines, stages and tasks
//!
//! All three entity kinds progress through a single total order of states,
//! expressed as integer precedence levels. States sharing a level are
//! mutually exclusive terminal outcomes. Transitions only ever move forward;
//! once a final state is recorded, later final writes are ignored (first
//! terminal write wins).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{WorkflowError, WorkflowResult};

// ── Execution State ──────────────────────────────────────────────────

/// Lifecycle state of a pipeline, stage or task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    /// Described by the application layer, not yet picked up
    #[default]
    Described,
    /// Being scheduled onto the pending queue
    Scheduling,
    /// Sitting on the pending queue, waiting for a submitter
    Scheduled,
    /// A submitter is translating and submitting the task
    Submitting,
    /// Accepted by the execution backend
    Submitted,
    /// The backend reported execution finished (task only)
    #[serde(rename = "EXECUTED")]
    Completed,
    /// A listener is translating the backend outcome (task only)
    Dequeueing,
    /// Backend outcome translated, awaiting reconciliation (task only)
    Dequeued,
    /// Finished successfully
    Done,
    /// Finished unsuccessfully
    Failed,
    /// Cancelled before reaching another final state
    Terminated,
    /// Deliberately not executed (pipeline and stage only)
    Skipped,
}

impl ExecutionState {
    /// Numeric precedence in the shared total order. States sharing a
    /// precedence are mutually exclusive outcomes.
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Described => 1,
            Self::Scheduling => 2,
            Self::Scheduled => 3,
            Self::Submitting => 4,
            Self::Submitted => 5,
            Self::Completed => 6,
            Self::Dequeueing => 7,
            Self::Dequeued => 8,
            Self::Done | Self::Failed | Self::Terminated => 9,
            Self::Skipped => 10,
        }
    }

    /// Check if this is one of the mutually exclusive final outcomes
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Terminated)
    }

    /// The wire name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Described => "DESCRIBED",
            Self::Scheduling => "SCHEDULING",
            Self::Scheduled => "SCHEDULED",
            Self::Submitting => "SUBMITTING",
            Self::Submitted => "SUBMITTED",
            Self::Completed => "EXECUTED",
            Self::Dequeueing => "DEQUEUEING",
            Self::Dequeued => "DEQUEUED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── State History ────────────────────────────────────────────────────

/// One entry in an entity's append-only state history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// The state that was entered
    pub state: ExecutionState,
    /// When the transition was recorded
    pub timestamp: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(state: ExecutionState, timestamp: DateTime<Utc>) -> Self {
        Self { state, timestamp }
    }

    pub fn now(state: ExecutionState) -> Self {
        Self::new(state, Utc::now())
    }
}

// ── Transition Validation ────────────────────────────────────────────

/// Outcome of validating a requested state transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The transition moves forward and must be recorded
    Advanced,
    /// A later final write for an already-final entity: dropped, not an error
    IgnoredFinal,
}

/// Validate a transition against the monotonic forward-progress rule.
///
/// A transition to a lower precedence is an [`WorkflowError::InvalidTransition`].
/// Final states tie-break by first write wins: once any final state is
/// recorded, further final writes are ignored rather than rejected.
pub fn validate_transition(
    entity: &str,
    current: ExecutionState,
    next: ExecutionState,
) -> WorkflowResult<Transition> {
    if current.is_final() && next.is_final() {
        return Ok(Transition::IgnoredFinal);
    }
    if next.precedence() < current.precedence() {
        return Err(WorkflowError::InvalidTransition {
            entity: entity.to_string(),
            from: current,
            to: next,
        });
    }
    Ok(Transition::Advanced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_order() {
        let ladder = [
            ExecutionState::Described,
            ExecutionState::Scheduling,
            ExecutionState::Scheduled,
            ExecutionState::Submitting,
            ExecutionState::Submitted,
            ExecutionState::Completed,
            ExecutionState::Dequeueing,
            ExecutionState::Dequeued,
            ExecutionState::Done,
        ];
        for pair in ladder.windows(2) {
            assert!(pair[0].precedence() < pair[1].precedence());
        }
    }

    #[test]
    fn test_final_states_share_precedence() {
        assert_eq!(ExecutionState::Done.precedence(), 9);
        assert_eq!(ExecutionState::Failed.precedence(), 9);
        assert_eq!(ExecutionState::Terminated.precedence(), 9);
        assert!(ExecutionState::Done.is_final());
        assert!(ExecutionState::Failed.is_final());
        assert!(ExecutionState::Terminated.is_final());
        assert!(!ExecutionState::Skipped.is_final());
    }

    #[test]
    fn test_forward_transition_allowed() {
        let outcome = validate_transition(
            "t",
            ExecutionState::Described,
            ExecutionState::Scheduling,
        )
        .unwrap();
        assert_eq!(outcome, Transition::Advanced);
    }

    #[test]
    fn test_regression_rejected() {
        let result = validate_transition(
            "t",
            ExecutionState::Submitted,
            ExecutionState::Scheduling,
        );
        assert!(matches!(
            result,
            Err(WorkflowError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_first_final_write_wins() {
        let outcome = validate_transition(
            "t",
            ExecutionState::Done,
            ExecutionState::Terminated,
        )
        .unwrap();
        assert_eq!(outcome, Transition::IgnoredFinal);

        let outcome = validate_transition(
            "t",
            ExecutionState::Terminated,
            ExecutionState::Done,
        )
        .unwrap();
        assert_eq!(outcome, Transition::IgnoredFinal);
    }

    #[test]
    fn test_final_to_earlier_rejected() {
        let result = validate_transition(
            "t",
            ExecutionState::Failed,
            ExecutionState::Described,
        );
        assert!(matches!(
            result,
            Err(WorkflowError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(ExecutionState::Described.as_str(), "DESCRIBED");
        assert_eq!(ExecutionState::Completed.as_str(), "EXECUTED");
        assert_eq!(format!("{}", ExecutionState::Terminated), "TERMINATED");
    }

    #[test]
    fn test_serde_wire_names() {
        let json = serde_json::to_string(&ExecutionState::Completed).unwrap();
        assert_eq!(json, "\"EXECUTED\"");
        let back: ExecutionState = serde_json::from_str("\"DEQUEUEING\"").unwrap();
        assert_eq!(back, ExecutionState::Dequeueing);
    }
}
