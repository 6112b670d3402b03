//! The runtime workflow store
//!
//! Registration flattens the described Pipeline→Stage→Task tree into lookup
//! tables: pipelines (with their stages) behind one mutex each, tasks behind
//! their own mutexes, and plain-id parent references resolved through the
//! tables. This keeps per-task bookkeeping off the pipeline lock: workers
//! always update a task under its own lock first and only then, if the
//! stage completed, touch the pipeline.
//!
//! Entity snapshots and state histories taken from the store are the
//! externally observable execution record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use ensembly_types::{
    ExecutionState, Pipeline, PipelineId, StageId, StateRecord, Task, TaskId, WorkflowError,
    WorkflowResult,
};

// ── Stage Progress ───────────────────────────────────────────────────

/// Concurrent completion bookkeeping for one stage.
///
/// The remaining counter is decremented exactly once per task, by whichever
/// worker records the task's definitive final state; the decrement that
/// reaches zero elects the single worker allowed to advance the pipeline.
pub struct StageProgress {
    remaining: AtomicUsize,
    failed: AtomicBool,
    terminated: AtomicBool,
}

impl StageProgress {
    fn new(task_count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(task_count),
            failed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// Record one task's definitive final state. Returns `true` for the
    /// single caller whose decrement completed the stage.
    pub fn record_final(&self, state: ExecutionState) -> bool {
        match state {
            ExecutionState::Failed => self.failed.store(true, Ordering::SeqCst),
            ExecutionState::Terminated => self.terminated.store(true, Ordering::SeqCst),
            _ => {}
        }
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        match previous {
            Ok(1) => true,
            Ok(_) => false,
            Err(_) => {
                tracing::warn!("stage progress decremented below zero");
                false
            }
        }
    }

    /// The stage's collective outcome: FAILED beats TERMINATED beats DONE
    pub fn outcome(&self) -> ExecutionState {
        if self.failed.load(Ordering::SeqCst) {
            ExecutionState::Failed
        } else if self.terminated.load(Ordering::SeqCst) {
            ExecutionState::Terminated
        } else {
            ExecutionState::Done
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

// ── Workflow Store ───────────────────────────────────────────────────

/// Lookup tables for every registered entity, plus the unit-id routing
/// table for backend notifications
#[derive(Default)]
pub struct WorkflowStore {
    pipelines: RwLock<HashMap<PipelineId, Arc<Mutex<Pipeline>>>>,
    tasks: RwLock<HashMap<TaskId, Arc<Mutex<Task>>>>,
    progress: RwLock<HashMap<StageId, Arc<StageProgress>>>,
    units: RwLock<HashMap<String, TaskId>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a described pipeline, moving its tasks into the task table.
    ///
    /// Every stage must hold at least one task (an activated stage never
    /// contains zero tasks), and the pipeline at least one stage.
    pub async fn register_pipeline(&self, mut pipeline: Pipeline) -> WorkflowResult<PipelineId> {
        if pipeline.stage_count() == 0 {
            return Err(WorkflowError::TypeMismatch {
                expected: "pipeline with at least one stage".into(),
                actual: format!("empty pipeline '{}'", pipeline.id),
            });
        }
        for stage in pipeline.stages() {
            if stage.task_count() == 0 {
                return Err(WorkflowError::TypeMismatch {
                    expected: "stage with at least one task".into(),
                    actual: format!("empty stage '{}'", stage.id),
                });
            }
        }

        let pipeline_id = pipeline.id.clone();
        let mut tasks = self.tasks.write().await;
        let mut progress = self.progress.write().await;
        for stage in pipeline.stages_mut() {
            progress.insert(
                stage.id.clone(),
                Arc::new(StageProgress::new(stage.task_count())),
            );
            for task in stage.drain_tasks() {
                tasks.insert(task.id.clone(), Arc::new(Mutex::new(task)));
            }
        }
        drop(tasks);
        drop(progress);

        tracing::info!(
            pipeline_id = %pipeline_id,
            stages = pipeline.stage_count(),
            "Pipeline registered"
        );
        self.pipelines
            .write()
            .await
            .insert(pipeline_id.clone(), Arc::new(Mutex::new(pipeline)));
        Ok(pipeline_id)
    }

    // ── Lookup ───────────────────────────────────────────────────────

    pub async fn pipeline(&self, id: &PipelineId) -> WorkflowResult<Arc<Mutex<Pipeline>>> {
        self.pipelines
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::PipelineNotFound(id.to_string()))
    }

    pub async fn task(&self, id: &TaskId) -> WorkflowResult<Arc<Mutex<Task>>> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::TaskNotFound(id.to_string()))
    }

    pub async fn stage_progress(&self, id: &StageId) -> WorkflowResult<Arc<StageProgress>> {
        self.progress
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::StageNotFound(id.to_string()))
    }

    pub async fn pipeline_ids(&self) -> Vec<PipelineId> {
        self.pipelines.read().await.keys().cloned().collect()
    }

    // ── Unit routing ─────────────────────────────────────────────────

    /// Bind a backend unit id to the task it executes
    pub async fn bind_unit(&self, unit_id: impl Into<String>, task_id: TaskId) {
        self.units.write().await.insert(unit_id.into(), task_id);
    }

    /// Route a backend notification to its task
    pub async fn task_for_unit(&self, unit_id: &str) -> Option<TaskId> {
        self.units.read().await.get(unit_id).cloned()
    }

    /// Drop the binding once the unit reached a terminal backend state
    pub async fn release_unit(&self, unit_id: &str) {
        self.units.write().await.remove(unit_id);
    }

    // ── Settlement ───────────────────────────────────────────────────

    /// Check whether every registered pipeline ran to completion or reached
    /// a final state. An empty store is not settled: the engine waits for
    /// work rather than terminating on startup.
    pub async fn all_settled(&self) -> bool {
        let pipelines = self.pipelines.read().await;
        if pipelines.is_empty() {
            return false;
        }
        for cell in pipelines.values() {
            if !cell.lock().await.is_settled() {
                return false;
            }
        }
        true
    }

    // ── Reporting ────────────────────────────────────────────────────

    /// Point-in-time copy of a pipeline (with its stages)
    pub async fn pipeline_snapshot(&self, id: &PipelineId) -> WorkflowResult<Pipeline> {
        Ok(self.pipeline(id).await?.lock().await.clone())
    }

    /// Point-in-time copy of a task
    pub async fn task_snapshot(&self, id: &TaskId) -> WorkflowResult<Task> {
        Ok(self.task(id).await?.lock().await.clone())
    }

    /// A task's append-only state history
    pub async fn task_history(&self, id: &TaskId) -> WorkflowResult<Vec<StateRecord>> {
        Ok(self.task(id).await?.lock().await.state_history.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensembly_types::Stage;

    fn pipeline_with(tasks_per_stage: &[usize]) -> Pipeline {
        let mut p = Pipeline::new("p");
        for (i, n) in tasks_per_stage.iter().enumerate() {
            let mut s = Stage::new(format!("s{}", i));
            s.add_tasks((0..*n).map(|j| Task::new(format!("t{}-{}", i, j))))
                .unwrap();
            p.add_stages([s]).unwrap();
        }
        p
    }

    #[tokio::test]
    async fn test_register_flattens_tasks() {
        let store = WorkflowStore::new();
        let p = pipeline_with(&[2, 1]);
        let task_id = p.stages()[0].task_ids[0].clone();
        let stage_id = p.stages()[0].id.clone();

        let pid = store.register_pipeline(p).await.unwrap();

        let snapshot = store.pipeline_snapshot(&pid).await.unwrap();
        assert_eq!(snapshot.stage_count(), 2);
        // Task bodies moved to the table; rosters intact
        assert_eq!(snapshot.stages()[0].tasks().len(), 0);
        assert_eq!(snapshot.stages()[0].task_count(), 2);

        let task = store.task_snapshot(&task_id).await.unwrap();
        assert!(task.is_dispatchable());

        let progress = store.stage_progress(&stage_id).await.unwrap();
        assert_eq!(progress.remaining(), 2);
    }

    #[tokio::test]
    async fn test_empty_pipeline_rejected() {
        let store = WorkflowStore::new();
        let result = store.register_pipeline(Pipeline::new("empty")).await;
        assert!(matches!(result, Err(WorkflowError::TypeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_empty_stage_rejected() {
        let store = WorkflowStore::new();
        let mut p = Pipeline::new("p");
        p.add_stages([Stage::new("empty")]).unwrap();
        let result = store.register_pipeline(p).await;
        assert!(matches!(result, Err(WorkflowError::TypeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_unit_routing() {
        let store = WorkflowStore::new();
        let p = pipeline_with(&[1]);
        let task_id = p.stages()[0].task_ids[0].clone();
        store.register_pipeline(p).await.unwrap();

        store.bind_unit("unit-1", task_id.clone()).await;
        assert_eq!(store.task_for_unit("unit-1").await, Some(task_id));
        assert_eq!(store.task_for_unit("unit-2").await, None);

        store.release_unit("unit-1").await;
        assert_eq!(store.task_for_unit("unit-1").await, None);
    }

    #[tokio::test]
    async fn test_settlement() {
        let store = WorkflowStore::new();
        assert!(!store.all_settled().await);

        let pid = store.register_pipeline(pipeline_with(&[1])).await.unwrap();
        assert!(!store.all_settled().await);

        store
            .pipeline(&pid)
            .await
            .unwrap()
            .lock()
            .await
            .record_transition(ExecutionState::Failed)
            .unwrap();
        assert!(store.all_settled().await);
    }

    #[test]
    fn test_stage_progress_elects_one_completer() {
        let progress = StageProgress::new(3);
        assert!(!progress.record_final(ExecutionState::Done));
        assert!(!progress.record_final(ExecutionState::Done));
        assert!(progress.record_final(ExecutionState::Done));
        assert_eq!(progress.outcome(), ExecutionState::Done);
        // Underflow is swallowed, never a second election
        assert!(!progress.record_final(ExecutionState::Done));
    }

    #[test]
    fn test_stage_progress_outcome_precedence() {
        let progress = StageProgress::new(3);
        progress.record_final(ExecutionState::Done);
        progress.record_final(ExecutionState::Terminated);
        progress.record_final(ExecutionState::Failed);
        assert_eq!(progress.outcome(), ExecutionState::Failed);
    }
}
