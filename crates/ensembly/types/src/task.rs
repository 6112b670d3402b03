//! Tasks: the atomic unit of executable work
//!
//! A task carries its executable, resource requirements, pre/post execution
//! hooks and five declarative staging-directive lists. Parent ids are
//! assigned exactly once, when the owning stage is attached to a pipeline;
//! a task never reaches a dispatchable state without both parents set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{WorkflowError, WorkflowResult};
use crate::pipeline::PipelineId;
use crate::stage::StageId;
use crate::state::{validate_transition, ExecutionState, StateRecord, Transition};

// ── Task Identifier ──────────────────────────────────────────────────

/// Unique identifier for a task
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Task ─────────────────────────────────────────────────────────────

/// The atomic unit of work dispatched to the execution backend
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Human-readable name
    pub name: String,
    /// Command to run. Submitted to the backend as a single string;
    /// declaring it as a list is accepted and the head is used.
    pub executable: Vec<String>,
    /// Argument vector for the executable
    pub arguments: Vec<String>,
    /// Commands run on the execution host before the executable
    pub pre_exec: Vec<String>,
    /// Commands run on the execution host after the executable
    pub post_exec: Vec<String>,
    /// Requested core count
    pub cores: u32,
    /// Whether the executable is MPI-launched
    pub mpi: bool,

    /// Data uploaded from the client side before execution (backend default
    /// transfer semantics)
    pub upload_input_data: Vec<String>,
    /// Data copied on the execution resource before execution
    pub copy_input_data: Vec<String>,
    /// Data linked on the execution resource before execution
    pub link_input_data: Vec<String>,
    /// Data copied on the execution resource after execution
    pub copy_output_data: Vec<String>,
    /// Data downloaded to the client side after execution (backend default
    /// transfer semantics)
    pub download_output_data: Vec<String>,

    /// Current state
    pub state: ExecutionState,
    /// Append-only ordered log of every recorded transition
    pub state_history: Vec<StateRecord>,
    /// Exit code reported by the backend, once final
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Working path assigned by the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Backend-assigned unit identifier for the current attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    /// Number of reattempts consumed so far
    pub attempts: u32,

    /// Owning stage, assigned when the stage is attached to a pipeline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_stage: Option<StageId>,
    /// Owning pipeline, assigned when the stage is attached to a pipeline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_pipeline: Option<PipelineId>,

    /// When the task was described
    pub created_at: DateTime<Utc>,
    /// When the task was last updated
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Describe a new task. The task starts in DESCRIBED with that state
    /// already on its history.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            name: name.into(),
            executable: Vec::new(),
            arguments: Vec::new(),
            pre_exec: Vec::new(),
            post_exec: Vec::new(),
            cores: 1,
            mpi: false,
            upload_input_data: Vec::new(),
            copy_input_data: Vec::new(),
            link_input_data: Vec::new(),
            copy_output_data: Vec::new(),
            download_output_data: Vec::new(),
            state: ExecutionState::Described,
            state_history: vec![StateRecord::new(ExecutionState::Described, now)],
            exit_code: None,
            path: None,
            backend_id: None,
            attempts: 0,
            parent_stage: None,
            parent_pipeline: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_executable<I, S>(mut self, executable: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.executable = executable.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pre_exec<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pre_exec = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_post_exec<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.post_exec = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    pub fn with_mpi(mut self, mpi: bool) -> Self {
        self.mpi = mpi;
        self
    }

    // ── State ────────────────────────────────────────────────────────

    /// Record a transition at the current time
    pub fn record_transition(&mut self, next: ExecutionState) -> WorkflowResult<Transition> {
        self.record_transition_at(next, Utc::now())
    }

    /// Record a transition with an explicit timestamp.
    ///
    /// Enforces monotonic forward progress; a second final write is ignored
    /// (first terminal write wins). SKIPPED is a pipeline/stage state and is
    /// rejected for tasks.
    pub fn record_transition_at(
        &mut self,
        next: ExecutionState,
        timestamp: DateTime<Utc>,
    ) -> WorkflowResult<Transition> {
        if next == ExecutionState::Skipped {
            return Err(WorkflowError::InvalidTransition {
                entity: self.id.to_string(),
                from: self.state,
                to: next,
            });
        }
        match validate_transition(&self.id.to_string(), self.state, next)? {
            Transition::Advanced => {
                self.state = next;
                self.state_history.push(StateRecord::new(next, timestamp));
                self.updated_at = timestamp;
                Ok(Transition::Advanced)
            }
            Transition::IgnoredFinal => {
                tracing::debug!(
                    task_id = %self.id,
                    current = %self.state,
                    ignored = %next,
                    "Ignoring late final write"
                );
                Ok(Transition::IgnoredFinal)
            }
        }
    }

    /// Restart a failed task for another attempt.
    ///
    /// This is the one sanctioned restart of the state ladder: it appends a
    /// fresh SCHEDULING record (history is never rewritten), bumps the
    /// attempt counter and clears the per-attempt backend bookkeeping.
    /// Reattempting a task that is not FAILED is an invalid transition.
    pub fn reset_for_reattempt(&mut self) -> WorkflowResult<()> {
        if self.state != ExecutionState::Failed {
            return Err(WorkflowError::InvalidTransition {
                entity: self.id.to_string(),
                from: self.state,
                to: ExecutionState::Scheduling,
            });
        }
        let now = Utc::now();
        self.attempts += 1;
        self.state = ExecutionState::Scheduling;
        self.state_history
            .push(StateRecord::new(ExecutionState::Scheduling, now));
        self.exit_code = None;
        self.path = None;
        self.backend_id = None;
        self.updated_at = now;
        Ok(())
    }

    // ── Query ────────────────────────────────────────────────────────

    /// Check if the task reached a final state
    pub fn is_final(&self) -> bool {
        self.state.is_final()
    }

    /// A task may only be dispatched once both parent ids are set
    pub fn is_dispatchable(&self) -> bool {
        self.parent_stage.is_some() && self.parent_pipeline.is_some()
    }

    /// Assign parent ids. Assignment happens exactly once, when the owning
    /// stage is attached to a pipeline; reassigning to a different owner is
    /// a usage error.
    pub(crate) fn assign_parents(
        &mut self,
        stage: &StageId,
        pipeline: &PipelineId,
    ) -> WorkflowResult<()> {
        match (&self.parent_stage, &self.parent_pipeline) {
            (Some(s), _) if s != stage => Err(WorkflowError::TypeMismatch {
                expected: "unattached task".into(),
                actual: format!("task '{}' already owned by stage '{}'", self.id, s),
            }),
            (_, Some(p)) if p != pipeline => Err(WorkflowError::TypeMismatch {
                expected: "unattached task".into(),
                actual: format!("task '{}' already owned by pipeline '{}'", self.id, p),
            }),
            _ => {
                self.parent_stage = Some(stage.clone());
                self.parent_pipeline = Some(pipeline.clone());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_starts_described() {
        let t = Task::new("simulation");
        assert_eq!(t.state, ExecutionState::Described);
        assert_eq!(t.state_history.len(), 1);
        assert_eq!(t.state_history[0].state, ExecutionState::Described);
        assert_eq!(t.cores, 1);
        assert!(!t.mpi);
        assert!(!t.is_dispatchable());
    }

    #[test]
    fn test_builder() {
        let t = Task::new("simulation")
            .with_executable(["grompp"])
            .with_arguments(["-f", "run.mdp"])
            .with_pre_exec(["module load gromacs"])
            .with_post_exec(["echo done"])
            .with_cores(16)
            .with_mpi(true);
        assert_eq!(t.executable, vec!["grompp"]);
        assert_eq!(t.arguments.len(), 2);
        assert_eq!(t.cores, 16);
        assert!(t.mpi);
    }

    #[test]
    fn test_state_ladder() {
        let mut t = Task::new("t");
        for next in [
            ExecutionState::Scheduling,
            ExecutionState::Scheduled,
            ExecutionState::Submitting,
            ExecutionState::Submitted,
            ExecutionState::Completed,
            ExecutionState::Dequeueing,
            ExecutionState::Dequeued,
            ExecutionState::Done,
        ] {
            assert_eq!(t.record_transition(next).unwrap(), Transition::Advanced);
        }
        assert!(t.is_final());
        assert_eq!(t.state_history.len(), 9);

        // History is non-decreasing in precedence
        for pair in t.state_history.windows(2) {
            assert!(pair[0].state.precedence() <= pair[1].state.precedence());
        }
    }

    #[test]
    fn test_regression_is_error() {
        let mut t = Task::new("t");
        t.record_transition(ExecutionState::Submitted).unwrap();
        let result = t.record_transition(ExecutionState::Scheduling);
        assert!(matches!(
            result,
            Err(WorkflowError::InvalidTransition { .. })
        ));
        // State unchanged and nothing appended
        assert_eq!(t.state, ExecutionState::Submitted);
        assert_eq!(t.state_history.len(), 2);
    }

    #[test]
    fn test_late_final_write_ignored() {
        let mut t = Task::new("t");
        t.record_transition(ExecutionState::Terminated).unwrap();
        let outcome = t.record_transition(ExecutionState::Done).unwrap();
        assert_eq!(outcome, Transition::IgnoredFinal);
        assert_eq!(t.state, ExecutionState::Terminated);
        assert_eq!(t.state_history.len(), 2);
    }

    #[test]
    fn test_skipped_rejected_for_tasks() {
        let mut t = Task::new("t");
        assert!(t.record_transition(ExecutionState::Skipped).is_err());
    }

    #[test]
    fn test_reattempt_restarts_ladder() {
        let mut t = Task::new("t");
        t.record_transition(ExecutionState::Scheduling).unwrap();
        t.record_transition(ExecutionState::Failed).unwrap();
        t.backend_id = Some("unit-1".into());
        t.exit_code = Some(1);

        t.reset_for_reattempt().unwrap();
        assert_eq!(t.state, ExecutionState::Scheduling);
        assert_eq!(t.attempts, 1);
        assert!(t.backend_id.is_none());
        assert!(t.exit_code.is_none());
        // History keeps the FAILED record
        assert!(t
            .state_history
            .iter()
            .any(|r| r.state == ExecutionState::Failed));
    }

    #[test]
    fn test_reattempt_requires_failed() {
        let mut t = Task::new("t");
        t.record_transition(ExecutionState::Scheduling).unwrap();
        assert!(t.reset_for_reattempt().is_err());
    }

    #[test]
    fn test_task_id() {
        let id = TaskId::generate();
        assert!(!id.0.is_empty());
        assert!(id.short().len() <= 8);
        assert_eq!(format!("{}", TaskId::new("t-1")), "t-1");
    }
}
