//! Stage activation and pipeline advancement
//!
//! All pointer movement goes through here. Activation selects the current
//! stage under the pipeline lock, skipping SKIPPED stages; completion is
//! decided lock-free through the per-stage progress counter, and only the
//! one worker whose decrement reached zero takes the pipeline lock to
//! advance the pointer. Tasks are never locked together with their
//! pipeline.

use std::sync::Arc;

use ensembly_types::{
    ExecutionState, PipelineId, StageId, TaskId, WorkflowError, WorkflowResult,
};

use crate::store::WorkflowStore;

/// What a recorded terminal task meant for the workflow as a whole
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// The stage still has unfinished tasks
    StageInFlight,
    /// The stage finished cleanly; the next stage can be activated
    StageComplete { pipeline: PipelineId },
    /// The pipeline settled, either by running every stage or by inheriting
    /// a FAILED or TERMINATED outcome
    PipelineComplete {
        pipeline: PipelineId,
        state: ExecutionState,
    },
}

/// Drives pipelines forward, one stage at a time
pub struct ProgressionController {
    store: Arc<WorkflowStore>,
}

impl ProgressionController {
    pub fn new(store: Arc<WorkflowStore>) -> Self {
        Self { store }
    }

    /// Select the pipeline's current stage for execution.
    ///
    /// Marks the pipeline SCHEDULING on first activation, advances past
    /// SKIPPED stages, marks the selected stage SCHEDULING and returns its
    /// id with the task roster. Returns `None` when nothing is left to run,
    /// recording the pipeline DONE if skipping exhausted the stages.
    pub async fn activate_current_stage(
        &self,
        pipeline_id: &PipelineId,
    ) -> WorkflowResult<Option<(StageId, Vec<TaskId>)>> {
        let cell = self.store.pipeline(pipeline_id).await?;
        let mut pipeline = cell.lock().await;

        if pipeline.is_settled() {
            return Ok(None);
        }
        if pipeline.state == ExecutionState::Described {
            pipeline.record_transition(ExecutionState::Scheduling)?;
        }

        loop {
            if pipeline.completed() {
                pipeline.record_transition(ExecutionState::Done)?;
                tracing::info!(pipeline_id = %pipeline_id, "Pipeline completed by skipping");
                return Ok(None);
            }
            let idx = pipeline.active_stage_index();
            if pipeline.stages()[idx].state == ExecutionState::Skipped {
                tracing::debug!(
                    pipeline_id = %pipeline_id,
                    stage = idx + 1,
                    "Skipping stage"
                );
                pipeline.increment_stage();
                continue;
            }
            let stage = &mut pipeline.stages_mut()[idx];
            if stage.state == ExecutionState::Described {
                stage.record_transition(ExecutionState::Scheduling)?;
            }
            tracing::info!(
                pipeline_id = %pipeline_id,
                stage_id = %stage.id,
                tasks = stage.task_count(),
                "Stage activated"
            );
            return Ok(Some((stage.id.clone(), stage.task_ids.clone())));
        }
    }

    /// Record that every task of the activated stage has been handed to the
    /// submission path
    pub async fn mark_stage_scheduled(
        &self,
        pipeline_id: &PipelineId,
        stage_id: &StageId,
    ) -> WorkflowResult<()> {
        let cell = self.store.pipeline(pipeline_id).await?;
        let mut pipeline = cell.lock().await;
        if let Some(stage) = pipeline.stage_mut(stage_id) {
            stage.record_transition(ExecutionState::Scheduled)?;
        }
        Ok(())
    }

    /// Fold one task's final state into its stage and, when the stage is
    /// thereby finished, into the pipeline.
    ///
    /// Safe to call concurrently for every task of a stage: the progress
    /// counter elects exactly one caller to advance the pipeline, so the
    /// pointer moves at most once per stage regardless of interleaving.
    pub async fn record_terminal_task(&self, task_id: &TaskId) -> WorkflowResult<Progress> {
        let (stage_id, pipeline_id, final_state) = {
            let cell = self.store.task(task_id).await?;
            let task = cell.lock().await;
            if !task.is_final() {
                return Err(WorkflowError::TypeMismatch {
                    expected: "task in a final state".into(),
                    actual: format!("task '{}' in state {}", task.id, task.state),
                });
            }
            let stage = task.parent_stage.clone().ok_or_else(|| {
                WorkflowError::StageNotFound(format!("task '{}' has no parent stage", task.id))
            })?;
            let pipeline = task.parent_pipeline.clone().ok_or_else(|| {
                WorkflowError::PipelineNotFound(format!(
                    "task '{}' has no parent pipeline",
                    task.id
                ))
            })?;
            (stage, pipeline, task.state)
        };

        let progress = self.store.stage_progress(&stage_id).await?;
        if !progress.record_final(final_state) {
            return Ok(Progress::StageInFlight);
        }

        // This caller observed the counter reach zero and alone advances
        // the pipeline.
        let cell = self.store.pipeline(&pipeline_id).await?;
        let mut pipeline = cell.lock().await;
        if pipeline.is_final() {
            return Ok(Progress::PipelineComplete {
                pipeline: pipeline_id,
                state: pipeline.state,
            });
        }

        let outcome = progress.outcome();
        if let Some(stage) = pipeline.stage_mut(&stage_id) {
            stage.record_transition(outcome)?;
        }
        tracing::info!(
            pipeline_id = %pipeline_id,
            stage_id = %stage_id,
            outcome = %outcome,
            "Stage finished"
        );

        match outcome {
            ExecutionState::Done => {
                if pipeline.stage_index(&stage_id) == Some(pipeline.active_stage_index()) {
                    pipeline.increment_stage();
                }
                if pipeline.completed() {
                    pipeline.record_transition(ExecutionState::Done)?;
                    tracing::info!(pipeline_id = %pipeline_id, "Pipeline completed");
                    Ok(Progress::PipelineComplete {
                        pipeline: pipeline_id,
                        state: ExecutionState::Done,
                    })
                } else {
                    Ok(Progress::StageComplete {
                        pipeline: pipeline_id,
                    })
                }
            }
            state => {
                pipeline.record_transition(state)?;
                tracing::warn!(
                    pipeline_id = %pipeline_id,
                    state = %state,
                    "Pipeline inherited stage outcome"
                );
                Ok(Progress::PipelineComplete {
                    pipeline: pipeline_id,
                    state,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensembly_types::{Pipeline, Stage, Task};
    use proptest::prelude::*;

    async fn registered(tasks_per_stage: &[usize]) -> (Arc<WorkflowStore>, PipelineId) {
        let store = Arc::new(WorkflowStore::new());
        let mut p = Pipeline::new("p");
        for (i, n) in tasks_per_stage.iter().enumerate() {
            let mut s = Stage::new(format!("s{}", i));
            s.add_tasks((0..*n).map(|j| Task::new(format!("t{}-{}", i, j))))
                .unwrap();
            p.add_stages([s]).unwrap();
        }
        let pid = store.register_pipeline(p).await.unwrap();
        (store, pid)
    }

    async fn finish_task(store: &WorkflowStore, id: &TaskId, state: ExecutionState) {
        let cell = store.task(id).await.unwrap();
        cell.lock().await.record_transition(state).unwrap();
    }

    #[tokio::test]
    async fn test_activation_marks_states() {
        let (store, pid) = registered(&[2, 1]).await;
        let controller = ProgressionController::new(store.clone());

        let (stage_id, roster) = controller
            .activate_current_stage(&pid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(roster.len(), 2);

        let snapshot = store.pipeline_snapshot(&pid).await.unwrap();
        assert_eq!(snapshot.state, ExecutionState::Scheduling);
        assert_eq!(
            snapshot.stage(&stage_id).unwrap().state,
            ExecutionState::Scheduling
        );

        controller.mark_stage_scheduled(&pid, &stage_id).await.unwrap();
        let snapshot = store.pipeline_snapshot(&pid).await.unwrap();
        assert_eq!(
            snapshot.stage(&stage_id).unwrap().state,
            ExecutionState::Scheduled
        );
    }

    #[tokio::test]
    async fn test_stage_complete_advances_pointer() {
        let (store, pid) = registered(&[2, 1]).await;
        let controller = ProgressionController::new(store.clone());
        let (_, roster) = controller
            .activate_current_stage(&pid)
            .await
            .unwrap()
            .unwrap();

        finish_task(&store, &roster[0], ExecutionState::Done).await;
        assert_eq!(
            controller.record_terminal_task(&roster[0]).await.unwrap(),
            Progress::StageInFlight
        );

        finish_task(&store, &roster[1], ExecutionState::Done).await;
        assert_eq!(
            controller.record_terminal_task(&roster[1]).await.unwrap(),
            Progress::StageComplete {
                pipeline: pid.clone()
            }
        );

        let snapshot = store.pipeline_snapshot(&pid).await.unwrap();
        assert_eq!(snapshot.current_stage(), 2);
        assert!(!snapshot.completed());
    }

    #[tokio::test]
    async fn test_last_stage_completes_pipeline() {
        let (store, pid) = registered(&[1]).await;
        let controller = ProgressionController::new(store.clone());
        let (_, roster) = controller
            .activate_current_stage(&pid)
            .await
            .unwrap()
            .unwrap();

        finish_task(&store, &roster[0], ExecutionState::Done).await;
        assert_eq!(
            controller.record_terminal_task(&roster[0]).await.unwrap(),
            Progress::PipelineComplete {
                pipeline: pid.clone(),
                state: ExecutionState::Done
            }
        );

        let snapshot = store.pipeline_snapshot(&pid).await.unwrap();
        assert!(snapshot.completed());
        assert_eq!(snapshot.state, ExecutionState::Done);
    }

    #[tokio::test]
    async fn test_failed_task_fails_pipeline() {
        let (store, pid) = registered(&[2, 1]).await;
        let controller = ProgressionController::new(store.clone());
        let (stage_id, roster) = controller
            .activate_current_stage(&pid)
            .await
            .unwrap()
            .unwrap();

        finish_task(&store, &roster[0], ExecutionState::Failed).await;
        controller.record_terminal_task(&roster[0]).await.unwrap();
        finish_task(&store, &roster[1], ExecutionState::Done).await;
        assert_eq!(
            controller.record_terminal_task(&roster[1]).await.unwrap(),
            Progress::PipelineComplete {
                pipeline: pid.clone(),
                state: ExecutionState::Failed
            }
        );

        let snapshot = store.pipeline_snapshot(&pid).await.unwrap();
        assert_eq!(snapshot.state, ExecutionState::Failed);
        assert_eq!(
            snapshot.stage(&stage_id).unwrap().state,
            ExecutionState::Failed
        );
        // Pointer untouched; the pipeline settled by state, not completion
        assert_eq!(snapshot.current_stage(), 1);
        assert!(!snapshot.completed());
    }

    #[tokio::test]
    async fn test_skipped_stages_are_bypassed() {
        let (store, pid) = registered(&[1, 1, 1]).await;
        {
            let cell = store.pipeline(&pid).await.unwrap();
            let mut p = cell.lock().await;
            p.stages_mut()[0]
                .record_transition(ExecutionState::Skipped)
                .unwrap();
            p.stages_mut()[1]
                .record_transition(ExecutionState::Skipped)
                .unwrap();
        }
        let controller = ProgressionController::new(store.clone());
        let (stage_id, _) = controller
            .activate_current_stage(&pid)
            .await
            .unwrap()
            .unwrap();

        let snapshot = store.pipeline_snapshot(&pid).await.unwrap();
        assert_eq!(snapshot.stage_index(&stage_id), Some(2));
        assert_eq!(snapshot.current_stage(), 3);
    }

    #[tokio::test]
    async fn test_all_stages_skipped_completes_pipeline() {
        let (store, pid) = registered(&[1, 1]).await;
        {
            let cell = store.pipeline(&pid).await.unwrap();
            let mut p = cell.lock().await;
            for stage in p.stages_mut() {
                stage.record_transition(ExecutionState::Skipped).unwrap();
            }
        }
        let controller = ProgressionController::new(store.clone());
        assert!(controller
            .activate_current_stage(&pid)
            .await
            .unwrap()
            .is_none());

        let snapshot = store.pipeline_snapshot(&pid).await.unwrap();
        assert!(snapshot.completed());
        assert_eq!(snapshot.state, ExecutionState::Done);
    }

    #[tokio::test]
    async fn test_non_final_task_rejected() {
        let (store, pid) = registered(&[1]).await;
        let controller = ProgressionController::new(store.clone());
        let (_, roster) = controller
            .activate_current_stage(&pid)
            .await
            .unwrap()
            .unwrap();
        assert!(controller.record_terminal_task(&roster[0]).await.is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any interleaving of concurrent terminal recordings elects exactly
        /// one completer, and the pipeline's verdict matches the worst task
        /// outcome.
        #[test]
        fn prop_concurrent_completions_elect_one(
            finals in prop::collection::vec(
                prop_oneof![
                    3 => Just(ExecutionState::Done),
                    1 => Just(ExecutionState::Failed),
                    1 => Just(ExecutionState::Terminated),
                ],
                1..=6,
            )
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .build()
                .unwrap();
            runtime.block_on(async move {
                let (store, pid) = registered(&[finals.len()]).await;
                let controller = Arc::new(ProgressionController::new(store.clone()));
                let (_, roster) = controller
                    .activate_current_stage(&pid)
                    .await
                    .unwrap()
                    .unwrap();
                for (id, state) in roster.iter().zip(finals.iter()) {
                    finish_task(&store, id, *state).await;
                }

                let mut handles = Vec::new();
                for id in roster.clone() {
                    let controller = controller.clone();
                    handles.push(tokio::spawn(async move {
                        controller.record_terminal_task(&id).await.unwrap()
                    }));
                }
                let mut settled = 0;
                for handle in handles {
                    if handle.await.unwrap() != Progress::StageInFlight {
                        settled += 1;
                    }
                }
                assert_eq!(settled, 1);

                let expected = if finals.contains(&ExecutionState::Failed) {
                    ExecutionState::Failed
                } else if finals.contains(&ExecutionState::Terminated) {
                    ExecutionState::Terminated
                } else {
                    ExecutionState::Done
                };
                let snapshot = store.pipeline_snapshot(&pid).await.unwrap();
                if expected == ExecutionState::Done {
                    assert!(snapshot.completed());
                    assert_eq!(snapshot.state, ExecutionState::Done);
                } else {
                    assert_eq!(snapshot.state, expected);
                    assert!(!snapshot.completed());
                }
            });
        }
    }
}
