//! Pipelines: ordered sequences of stages executed one at a time
//!
//! The active-stage pointer only moves forward; advancing past the last
//! stage sets the completion flag exactly once. The pointer and the flag
//! are owned by the pipeline and, at runtime, guarded by the single
//! pipeline lock held by the workflow store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{WorkflowError, WorkflowResult};
use crate::stage::{Stage, StageId};
use crate::state::{validate_transition, ExecutionState, StateRecord, Transition};

// ── Pipeline Identifier ──────────────────────────────────────────────

/// Unique identifier for a pipeline
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId(pub String);

impl PipelineId {
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

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────

/// An ordered sequence of stages executed one at a time
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pipeline {
    /// Unique pipeline identifier
    pub id: PipelineId,
    /// Human-readable name
    pub name: String,
    /// The stages, in execution order
    stages: Vec<Stage>,
    /// Optional binding to a named compute resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Current state
    pub state: ExecutionState,
    /// Append-only ordered log of every recorded transition
    pub state_history: Vec<StateRecord>,
    /// One-based number of the currently active stage. Starts at 1 and only
    /// ever moves forward; never exceeds the stage count.
    current_stage: usize,
    /// Set exactly once, when the pointer advances past the last stage
    completed: bool,
    /// When the pipeline was described
    pub created_at: DateTime<Utc>,
    /// When the pipeline was last updated
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    /// Describe a new, empty pipeline in DESCRIBED state
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: PipelineId::generate(),
            name: name.into(),
            stages: Vec::new(),
            resource: None,
            state: ExecutionState::Described,
            state_history: vec![StateRecord::new(ExecutionState::Described, now)],
            current_stage: 1,
            completed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Attach stages in order, assigning parent ids to each stage and,
    /// transitively, to every task the stage holds. A stage already owned
    /// by a different pipeline is rejected.
    pub fn add_stages(&mut self, stages: impl IntoIterator<Item = Stage>) -> WorkflowResult<()> {
        for mut stage in stages {
            stage.assign_parent(&self.id)?;
            self.stages.push(stage);
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Builder form of [`add_stages`](Self::add_stages)
    pub fn with_stages(mut self, stages: impl IntoIterator<Item = Stage>) -> WorkflowResult<Self> {
        self.add_stages(stages)?;
        Ok(self)
    }

    /// Detach stages by name, recomputing the stage count. Only legal while
    /// the pipeline is still in DESCRIBED state. Returns how many stages
    /// were removed.
    pub fn remove_stages(&mut self, names: &[&str]) -> WorkflowResult<usize> {
        if self.state != ExecutionState::Described {
            return Err(WorkflowError::InvalidTransition {
                entity: self.id.to_string(),
                from: self.state,
                to: self.state,
            });
        }
        let before = self.stages.len();
        self.stages.retain(|s| !names.contains(&s.name.as_str()));
        let removed = before - self.stages.len();
        if removed > 0 {
            self.updated_at = Utc::now();
        }
        Ok(removed)
    }

    // ── Stage access ─────────────────────────────────────────────────

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stages_mut(&mut self) -> &mut [Stage] {
        &mut self.stages
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Position of a stage in execution order (zero-based)
    pub fn stage_index(&self, stage_id: &StageId) -> Option<usize> {
        self.stages.iter().position(|s| &s.id == stage_id)
    }

    pub fn stage(&self, stage_id: &StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| &s.id == stage_id)
    }

    pub fn stage_mut(&mut self, stage_id: &StageId) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| &s.id == stage_id)
    }

    // ── Progression ──────────────────────────────────────────────────

    /// One-based number of the currently active stage
    pub fn current_stage(&self) -> usize {
        self.current_stage
    }

    /// Zero-based index of the currently active stage
    pub fn active_stage_index(&self) -> usize {
        self.current_stage.saturating_sub(1)
    }

    /// Whether every stage has been executed
    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Advance the active-stage pointer, or set the completion flag when no
    /// stage remains. Forward only; once the flag is set this is a no-op.
    pub fn increment_stage(&mut self) {
        if self.completed {
            return;
        }
        if self.current_stage < self.stage_count() {
            self.current_stage += 1;
        } else {
            self.completed = true;
        }
        self.updated_at = Utc::now();
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
                    pipeline_id = %self.id,
                    current = %self.state,
                    ignored = %next,
                    "Ignoring late final write"
                );
                Ok(Transition::IgnoredFinal)
            }
        }
    }

    /// Check if the pipeline reached a final state
    pub fn is_final(&self) -> bool {
        self.state.is_final()
    }

    /// A pipeline is settled once it either ran every stage or reached a
    /// final state. The engine's autotermination waits for every registered
    /// pipeline to settle.
    pub fn is_settled(&self) -> bool {
        self.completed || self.is_final()
    }
}
