//! Ensembly domain types
//!
//! The entity model for the ensemble workflow engine:
//!
//! - [`Pipeline`] — an ordered sequence of stages executed one at a time
//! - [`Stage`] — a set of tasks intended to run concurrently
//! - [`Task`] — the atomic unit of executable work, with staging directives
//! - [`ExecutionState`] — the shared total order every entity progresses through
//! - [`UnitDescription`] — the backend-facing description of a submitted task
//!
//! Entities record every state change in an append-only history of
//! [`StateRecord`]s. The history is the externally observable execution
//! record: it is only ever appended to, never rewritten.

#![deny(unsafe_code)]

pub mod error;
pub mod pipeline;
pub mod stage;
pub mod state;
pub mod task;
pub mod unit;

pub use error::{WorkflowError, WorkflowResult};
pub use pipeline::{Pipeline, PipelineId};
pub use stage::{Stage, StageId};
pub use state::{ExecutionState, StateRecord, Transition};
pub use task::{Task, TaskId};
pub use unit::{StagingAction, StagingDirective, UnitDescription};
