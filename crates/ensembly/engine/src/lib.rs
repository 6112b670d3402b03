//! Ensembly synchronization engine
//!
//! Drives registered pipelines against a pluggable execution backend.
//! Stages are activated one at a time per pipeline; their tasks flow
//! through a bounded pending queue into a submitter pool, backend
//! notifications flow back through a listener pool, and a reconciler
//! applies the reattempt policy and advances the pipelines.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ensembly_engine::{EngineConfig, InMemoryBackend, WorkflowEngine};
//! use ensembly_types::{Pipeline, Stage, Task};
//!
//! # async fn run() -> ensembly_types::WorkflowResult<()> {
//! let mut stage = Stage::new("simulate");
//! stage.add_tasks([Task::new("md").with_executable(["gmx"])])?;
//! let pipeline = Pipeline::new("campaign").with_stages([stage])?;
//!
//! let engine = WorkflowEngine::new(EngineConfig::default(), InMemoryBackend::new())?;
//! engine.register_pipeline(pipeline).await?;
//! engine.start().await?;
//! engine.wait().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod progression;
pub mod store;

pub use backend::{
    BackendNotification, BackendUnitId, BackendUnitState, ExecutionBackend, InMemoryBackend,
};
pub use config::EngineConfig;
pub use engine::WorkflowEngine;
pub use progression::{Progress, ProgressionController};
pub use store::{StageProgress, WorkflowStore};
