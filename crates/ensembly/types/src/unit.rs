//! Backend-facing unit descriptions and resolved staging directives
//!
//! A [`UnitDescription`] is what the engine hands to the execution backend
//! for one task attempt. Its name encodes the task, stage and pipeline ids
//! so that asynchronous backend notifications can be routed back to the
//! owning entities.

use serde::{Deserialize, Serialize};

use crate::error::{WorkflowError, WorkflowResult};
use crate::pipeline::PipelineId;
use crate::stage::StageId;
use crate::task::TaskId;

// ── Staging ──────────────────────────────────────────────────────────

/// How the backend should realize a data movement. Directives without an
/// action use the backend's default transfer semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagingAction {
    /// Copy the data on the execution resource
    Copy,
    /// Symlink the data on the execution resource
    Link,
}

/// One resolved source/target/action triple, ready for the backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingDirective {
    /// Where the data comes from
    pub source: String,
    /// Where the data goes, relative to the unit sandbox
    pub target: String,
    /// Transfer mechanics; absent means backend default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<StagingAction>,
}

impl StagingDirective {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: StagingAction) -> Self {
        self.action = Some(action);
        self
    }
}

// ── Unit Description ─────────────────────────────────────────────────

/// The description of one submitted unit of work, produced from a task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnitDescription {
    /// `"<taskId>,<stageId>,<pipelineId>"` for traceability
    pub name: String,
    /// Commands run before the executable
    pub pre_exec: Vec<String>,
    /// The executable, as a single string
    pub executable: String,
    /// Argument vector
    pub arguments: Vec<String>,
    /// Requested core count
    pub cores: u32,
    /// MPI launch flag
    pub mpi: bool,
    /// Commands run after the executable
    pub post_exec: Vec<String>,
    /// Resolved input staging directives
    pub input_staging: Vec<StagingDirective>,
    /// Resolved output staging directives
    pub output_staging: Vec<StagingDirective>,
}

impl UnitDescription {
    /// Compose the traceability name from the id triple
    pub fn compose_name(task: &TaskId, stage: &StageId, pipeline: &PipelineId) -> String {
        format!("{},{},{}", task, stage, pipeline)
    }

    /// Recover the id triple from a unit name. A name that does not carry
    /// the three comma-separated ids is not a task unit.
    pub fn parse_name(name: &str) -> WorkflowResult<(TaskId, StageId, PipelineId)> {
        let mut parts = name.split(',').map(str::trim);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(task), Some(stage), Some(pipeline), None)
                if !task.is_empty() && !stage.is_empty() && !pipeline.is_empty() =>
            {
                Ok((
                    TaskId::new(task),
                    StageId::new(stage),
                    PipelineId::new(pipeline),
                ))
            }
            _ => Err(WorkflowError::TypeMismatch {
                expected: "task unit name '<task>,<stage>,<pipeline>'".into(),
                actual: name.to_string(),
            }),
        }
    }
}
