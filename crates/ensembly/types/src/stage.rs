//! Stages: sets of tasks that run concurrently within one pipeline step

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{WorkflowError, WorkflowResult};
use crate::pipeline::PipelineId;
use crate::state::{validate_transition, ExecutionState, StateRecord, Transition};
use crate::task::{Task, TaskId};

// ── Stage Identifier ─────────────────────────────────────────────────

/// Unique identifier for a stage
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageId(pub String);

impl StageId {
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

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Stage ────────────────────────────────────────────────────────────

/// An ordered set of tasks activated together once the stage itself is
/// activated. A stage is done once every member task reached a final state;
/// an activated stage never contains zero tasks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stage {
    /// Unique stage identifier
    pub id: StageId,
    /// Human-readable name
    pub name: String,
    /// Description-time task bodies. Drained into the runtime store at
    /// registration; the roster below stays as the membership record.
    tasks: Vec<Task>,
    /// Stable roster of member task ids, in insertion order
    pub task_ids: Vec<TaskId>,
    /// Current state
    pub state: ExecutionState,
    /// Append-only ordered log of every recorded transition
    pub state_history: Vec<StateRecord>,
    /// Owning pipeline, assigned when the stage is attached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_pipeline: Option<PipelineId>,
    /// When the stage was described
    pub created_at: DateTime<Utc>,
    /// When the stage was last updated
    pub updated_at: DateTime<Utc>,
}

impl Stage {
    /// Describe a new, empty stage in DESCRIBED state
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: StageId::generate(),
            name: name.into(),
            tasks: Vec::new(),
            task_ids: Vec::new(),
            state: ExecutionState::Described,
            state_history: vec![StateRecord::new(ExecutionState::Described, now)],
            parent_pipeline: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach tasks to the stage, recomputing the roster. Tasks attached
    /// after the stage itself was attached to a pipeline receive their
    /// parent ids immediately.
    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = Task>) -> WorkflowResult<()> {
        for mut task in tasks {
            if let Some(pipeline) = self.parent_pipeline.clone() {
                task.assign_parents(&self.id, &pipeline)?;
            }
            self.task_ids.push(task.id.clone());
            self.tasks.push(task);
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Builder form of [`add_tasks`](Self::add_tasks)
    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> WorkflowResult<Self> {
        self.add_tasks(tasks)?;
        Ok(self)
    }

    /// Number of member tasks
    pub fn task_count(&self) -> usize {
        self.task_ids.len()
    }

    /// Description-time task bodies still owned by the stage
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Hand ownership of the task bodies to the runtime store. The roster
    /// in `task_ids` is unaffected.
    pub fn drain_tasks(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.tasks)
    }

    /// Assign the owning pipeline, propagating parent ids into every task
    /// currently held by the stage. Assignment happens exactly once.
    pub(crate) fn assign_parent(&mut self, pipeline: &PipelineId) -> WorkflowResult<()> {
        if let Some(existing) = &self.parent_pipeline {
            if existing != pipeline {
                return Err(WorkflowError::TypeMismatch {
                    expected: "unattached stage".into(),
                    actual: format!(
                        "stage '{}' already owned by pipeline '{}'",
                        self.id, existing
                    ),
                });
            }
            return Ok(());
        }
        self.parent_pipeline = Some(pipeline.clone());
        for task in &mut self.tasks {
            task.assign_parents(&self.id, pipeline)?;
        }
        Ok(())
    }

    // ── State ────────────────────────────────────────────────────────

    /// Record a transition at the current time
    pub fn record_transition(&mut self, next: ExecutionState) -> WorkflowResult<Transition> {
        self.record_transition_at(next, Utc::now())
    }

    /// Record a transition with an explicit timestamp, enforcing monotonic
    /// forward progress (first final write wins)
    pub fn record_transition_at(
        &mut self,
        next: ExecutionState,
        timestamp: DateTime<Utc>,
    ) -> WorkflowResult<Transition> {
        match validate_transition(&self.id.to_string(), self.state, next)? {
            Transition::Advanced => {
                self.state = next;
                self.state_history.push(StateRecord::new(next, timestamp));
                self.updated_at = timestamp;
                Ok(Transition::Advanced)
            }
            Transition::IgnoredFinal => {
                tracing::debug!(
                    stage_id = %self.id,
                    current = %self.state,
                    ignored = %next,
                    "Ignoring late final write"
                );
                Ok(Transition::IgnoredFinal)
            }
        }
    }

    /// Check if the stage reached a final state
    pub fn is_final(&self) -> bool {
        self.state.is_final()
    }
}
