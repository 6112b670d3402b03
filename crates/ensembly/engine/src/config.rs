//! Configuration for the workflow engine

use serde::{Deserialize, Serialize};

use ensembly_types::{WorkflowError, WorkflowResult};

/// Tunables for the synchronization engine: worker pool sizes, queue
/// capacities, retry budget and the autotermination switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of submitter workers draining the pending queue
    #[serde(default = "default_submitter_count")]
    pub submitter_count: usize,

    /// Number of listener workers consuming backend notifications
    #[serde(default = "default_listener_count")]
    pub listener_count: usize,

    /// Capacity of the pending (to-be-submitted) queue
    #[serde(default = "default_queue_capacity")]
    pub pending_capacity: usize,

    /// Capacity of the completed (to-be-reconciled) queue
    #[serde(default = "default_queue_capacity")]
    pub completed_capacity: usize,

    /// How many times a failed task is automatically resubmitted before it
    /// is terminally FAILED. Zero disables reattempts.
    #[serde(default)]
    pub max_reattempts: u32,

    /// Shut the engine down once every registered pipeline is settled
    #[serde(default = "default_true")]
    pub autoterminate: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            submitter_count: default_submitter_count(),
            listener_count: default_listener_count(),
            pending_capacity: default_queue_capacity(),
            completed_capacity: default_queue_capacity(),
            max_reattempts: 0,
            autoterminate: true,
        }
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.submitter_count == 0
            || self.listener_count == 0
            || self.pending_capacity == 0
            || self.completed_capacity == 0
        {
            return Err(WorkflowError::TypeMismatch {
                expected: "non-zero worker counts and queue capacities".into(),
                actual: format!(
                    "submitters={}, listeners={}, pending={}, completed={}",
                    self.submitter_count,
                    self.listener_count,
                    self.pending_capacity,
                    self.completed_capacity
                ),
            });
        }
        Ok(())
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_submitter_count() -> usize {
    2
}

fn default_listener_count() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    128
}
