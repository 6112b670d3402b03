//! The synchronization engine
//!
//! Two bounded queues connect three worker pools around the execution
//! backend: an activator feeds the pending queue with the tasks of each
//! activated stage, submitters drain it into the backend, listeners fold
//! backend notifications back into task state, and a single reconciler
//! consumes the completed queue, applies the reattempt policy and drives
//! pipeline progression.
//!
//! Queue payloads are plain task ids; every state mutation happens on the
//! store's entities, task-lock first. Workers shut down on a watch signal,
//! either from [`WorkflowEngine::stop`] or from autotermination once every
//! registered pipeline settled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use ensembly_staging::describe_unit;
use ensembly_types::{
    ExecutionState, Pipeline, PipelineId, StateRecord, Task, TaskId, WorkflowError, WorkflowResult,
};

use crate::backend::{BackendNotification, BackendUnitId, BackendUnitState, ExecutionBackend};
use crate::config::EngineConfig;
use crate::progression::{Progress, ProgressionController};
use crate::store::WorkflowStore;

// ── Completion Queue Payload ─────────────────────────────────────────

/// How long a submitter holds off after a transient submission error
/// before putting the task back on the pending queue
const SUBMISSION_RETRY_DELAY: Duration = Duration::from_millis(50);

/// One finished attempt, headed for the reconciler.
///
/// `retryable` distinguishes execution failures the reattempt policy may
/// resubmit from definitive ones (malformed descriptions, fatal backend
/// rejections, termination). Transient submission errors never get here;
/// the submitter keeps those tasks on the pending queue.
#[derive(Clone, Debug)]
struct Completion {
    task_id: TaskId,
    state: ExecutionState,
    retryable: bool,
}

// ── Workflow Engine ──────────────────────────────────────────────────

type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Executes registered pipelines against an [`ExecutionBackend`]
pub struct WorkflowEngine {
    config: EngineConfig,
    store: Arc<WorkflowStore>,
    progression: Arc<ProgressionController>,
    backend: Arc<dyn ExecutionBackend>,

    pending_tx: mpsc::Sender<TaskId>,
    pending_rx: SharedReceiver<TaskId>,
    completed_tx: mpsc::Sender<Completion>,
    completed_rx: SharedReceiver<Completion>,
    activation_tx: mpsc::Sender<PipelineId>,
    activation_rx: SharedReceiver<PipelineId>,

    shutdown_tx: watch::Sender<bool>,
    settled_tx: watch::Sender<bool>,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, backend: Arc<dyn ExecutionBackend>) -> WorkflowResult<Self> {
        config.validate()?;
        let (pending_tx, pending_rx) = mpsc::channel(config.pending_capacity);
        let (completed_tx, completed_rx) = mpsc::channel(config.completed_capacity);
        let (activation_tx, activation_rx) = mpsc::channel(config.pending_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let (settled_tx, _) = watch::channel(false);
        let store = Arc::new(WorkflowStore::new());
        Ok(Self {
            progression: Arc::new(ProgressionController::new(store.clone())),
            store,
            config,
            backend,
            pending_tx,
            pending_rx: Arc::new(Mutex::new(pending_rx)),
            completed_tx,
            completed_rx: Arc::new(Mutex::new(completed_rx)),
            activation_tx,
            activation_rx: Arc::new(Mutex::new(activation_rx)),
            shutdown_tx,
            settled_tx,
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Hand a described pipeline to the engine. If the engine is already
    /// running the pipeline's first stage is activated immediately;
    /// otherwise activation happens on [`start`](Self::start).
    pub async fn register_pipeline(&self, pipeline: Pipeline) -> WorkflowResult<PipelineId> {
        if *self.shutdown_tx.borrow() {
            return Err(WorkflowError::EngineStopped);
        }
        let pipeline_id = self.store.register_pipeline(pipeline).await?;
        self.settled_tx.send_replace(false);
        if self.started.load(Ordering::SeqCst) {
            let _ = self.activation_tx.send(pipeline_id.clone()).await;
        }
        Ok(pipeline_id)
    }

    /// Spawn the worker pools and activate every registered pipeline.
    /// Idempotent; the second call is a no-op.
    pub async fn start(&self) -> WorkflowResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let notif_rx = self.backend.take_notifications().ok_or_else(|| {
            WorkflowError::BackendFatal("backend notification stream already taken".into())
        })?;
        let notif_rx = Arc::new(Mutex::new(notif_rx));

        let mut workers = self.workers.lock().await;
        workers.push(tokio::spawn(Self::activator_loop(
            self.store.clone(),
            self.progression.clone(),
            self.pending_tx.clone(),
            self.activation_rx.clone(),
            self.settled_tx.clone(),
            self.shutdown_tx.clone(),
            self.config.autoterminate,
        )));
        for index in 0..self.config.submitter_count {
            workers.push(tokio::spawn(Self::submitter_loop(
                index,
                self.store.clone(),
                self.backend.clone(),
                self.pending_tx.clone(),
                self.pending_rx.clone(),
                self.completed_tx.clone(),
                self.shutdown_tx.clone(),
            )));
        }
        for index in 0..self.config.listener_count {
            workers.push(tokio::spawn(Self::listener_loop(
                index,
                self.store.clone(),
                notif_rx.clone(),
                self.completed_tx.clone(),
                self.shutdown_tx.clone(),
            )));
        }
        workers.push(tokio::spawn(Self::reconciler_loop(
            self.config.clone(),
            self.store.clone(),
            self.progression.clone(),
            self.completed_rx.clone(),
            self.pending_tx.clone(),
            self.activation_tx.clone(),
            self.settled_tx.clone(),
            self.shutdown_tx.clone(),
        )));
        drop(workers);

        tracing::info!(
            submitters = self.config.submitter_count,
            listeners = self.config.listener_count,
            "Engine started"
        );
        for pipeline_id in self.store.pipeline_ids().await {
            let _ = self.activation_tx.send(pipeline_id).await;
        }
        Ok(())
    }

    /// Block until every registered pipeline settled. With autotermination
    /// enabled the workers are stopped before returning; otherwise the
    /// engine stays resident and accepts further pipelines.
    pub async fn wait(&self) -> WorkflowResult<()> {
        let mut settled = self.settled_tx.subscribe();
        loop {
            if *settled.borrow_and_update() {
                break;
            }
            if settled.changed().await.is_err() {
                break;
            }
        }
        if self.config.autoterminate {
            self.stop().await;
        }
        Ok(())
    }

    /// Signal shutdown and join every worker. Idempotent.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("Engine stopped");
    }

    /// Terminate one pipeline: the pipeline, its unfinished stages and
    /// their unfinished tasks are marked TERMINATED and in-flight backend
    /// units are cancelled. Late backend notifications for terminated
    /// tasks are dropped as late final writes.
    pub async fn terminate_pipeline(&self, pipeline_id: &PipelineId) -> WorkflowResult<()> {
        let task_ids = {
            let cell = self.store.pipeline(pipeline_id).await?;
            let mut pipeline = cell.lock().await;
            if pipeline.is_settled() {
                return Ok(());
            }
            pipeline.record_transition(ExecutionState::Terminated)?;
            let mut task_ids = Vec::new();
            for stage in pipeline.stages_mut() {
                if stage.state == ExecutionState::Skipped {
                    continue;
                }
                stage.record_transition(ExecutionState::Terminated)?;
                task_ids.extend(stage.task_ids.iter().cloned());
            }
            task_ids
        };
        tracing::warn!(pipeline_id = %pipeline_id, "Pipeline terminated on request");

        for task_id in task_ids {
            let backend_id = {
                let cell = self.store.task(&task_id).await?;
                let mut task = cell.lock().await;
                if task.is_final() {
                    continue;
                }
                task.record_transition(ExecutionState::Terminated)?;
                task.backend_id.take()
            };
            if let Some(backend_id) = backend_id {
                let unit_id = BackendUnitId::new(backend_id);
                if let Err(error) = self.backend.cancel(&unit_id).await {
                    tracing::warn!(task_id = %task_id, %error, "Unit cancellation failed");
                }
                // A backend may cancel without a notification; the routing
                // entry is dropped here rather than waiting for one
                self.store.release_unit(&unit_id.0).await;
            }
        }

        Self::signal_if_settled(
            &self.store,
            &self.settled_tx,
            &self.shutdown_tx,
            self.config.autoterminate,
        )
        .await;
        Ok(())
    }

    // ── Reporting ────────────────────────────────────────────────────

    pub async fn pipeline_snapshot(&self, id: &PipelineId) -> WorkflowResult<Pipeline> {
        self.store.pipeline_snapshot(id).await
    }

    pub async fn task_snapshot(&self, id: &TaskId) -> WorkflowResult<Task> {
        self.store.task_snapshot(id).await
    }

    pub async fn task_history(&self, id: &TaskId) -> WorkflowResult<Vec<StateRecord>> {
        self.store.task_history(id).await
    }

    // ── Workers ──────────────────────────────────────────────────────

    async fn signal_if_settled(
        store: &WorkflowStore,
        settled_tx: &watch::Sender<bool>,
        shutdown_tx: &watch::Sender<bool>,
        autoterminate: bool,
    ) {
        if store.all_settled().await {
            tracing::info!("All registered pipelines settled");
            settled_tx.send_replace(true);
            if autoterminate {
                shutdown_tx.send_replace(true);
            }
        }
    }

    /// Activates pipelines' current stages and schedules their tasks onto
    /// the pending queue
    #[allow(clippy::too_many_arguments)]
    async fn activator_loop(
        store: Arc<WorkflowStore>,
        progression: Arc<ProgressionController>,
        pending_tx: mpsc::Sender<TaskId>,
        activation_rx: SharedReceiver<PipelineId>,
        settled_tx: watch::Sender<bool>,
        shutdown_tx: watch::Sender<bool>,
        autoterminate: bool,
    ) {
        let mut shutdown = shutdown_tx.subscribe();
        loop {
            let received = {
                let mut rx = activation_rx.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => None,
                    received = rx.recv() => received,
                }
            };
            let Some(pipeline_id) = received else { break };

            match progression.activate_current_stage(&pipeline_id).await {
                Ok(Some((stage_id, roster))) => {
                    for task_id in roster {
                        let schedule = async {
                            let cell = store.task(&task_id).await?;
                            let mut task = cell.lock().await;
                            if task.is_final() {
                                return Ok(false);
                            }
                            if task.state == ExecutionState::Described {
                                task.record_transition(ExecutionState::Scheduling)?;
                            }
                            task.record_transition(ExecutionState::Scheduled)?;
                            Ok::<bool, WorkflowError>(true)
                        };
                        match schedule.await {
                            Ok(true) => {
                                let _ = pending_tx.send(task_id).await;
                            }
                            Ok(false) => {}
                            Err(error) => {
                                tracing::error!(task_id = %task_id, %error, "Scheduling failed");
                            }
                        }
                    }
                    if let Err(error) =
                        progression.mark_stage_scheduled(&pipeline_id, &stage_id).await
                    {
                        tracing::error!(stage_id = %stage_id, %error, "Stage bookkeeping failed");
                    }
                }
                Ok(None) => {
                    Self::signal_if_settled(&store, &settled_tx, &shutdown_tx, autoterminate)
                        .await;
                }
                Err(error) => {
                    tracing::error!(pipeline_id = %pipeline_id, %error, "Activation failed");
                }
            }
        }
        tracing::debug!("Activator stopped");
    }

    /// Drains the pending queue: translates each task into a unit
    /// description and submits it to the backend
    #[allow(clippy::too_many_arguments)]
    async fn submitter_loop(
        index: usize,
        store: Arc<WorkflowStore>,
        backend: Arc<dyn ExecutionBackend>,
        pending_tx: mpsc::Sender<TaskId>,
        pending_rx: SharedReceiver<TaskId>,
        completed_tx: mpsc::Sender<Completion>,
        shutdown_tx: watch::Sender<bool>,
    ) {
        let mut shutdown = shutdown_tx.subscribe();
        loop {
            let received = {
                let mut rx = pending_rx.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => None,
                    received = rx.recv() => received,
                }
            };
            let Some(task_id) = received else { break };

            let cell = match store.task(&task_id).await {
                Ok(cell) => cell,
                Err(error) => {
                    tracing::error!(task_id = %task_id, %error, "Unknown pending task");
                    continue;
                }
            };

            // Translate under the task lock, submit without it
            let unit = {
                let mut task = cell.lock().await;
                if task.is_final() {
                    continue;
                }
                if let Err(error) = task.record_transition(ExecutionState::Submitting) {
                    tracing::error!(task_id = %task_id, %error, "Submission bookkeeping failed");
                    continue;
                }
                describe_unit(&task)
            };
            let unit = match unit {
                Ok(unit) => unit,
                Err(error) => {
                    tracing::error!(task_id = %task_id, %error, "Task description rejected");
                    let _ = cell.lock().await.record_transition(ExecutionState::Failed);
                    let _ = completed_tx
                        .send(Completion {
                            task_id,
                            state: ExecutionState::Failed,
                            retryable: false,
                        })
                        .await;
                    continue;
                }
            };

            match backend.submit(unit).await {
                Ok(unit_id) => {
                    store.bind_unit(unit_id.0.clone(), task_id.clone()).await;
                    let mut task = cell.lock().await;
                    if task.is_final() {
                        // Terminated while in flight; withdraw the unit
                        drop(task);
                        let _ = backend.cancel(&unit_id).await;
                        store.release_unit(&unit_id.0).await;
                        continue;
                    }
                    task.backend_id = Some(unit_id.0.clone());
                    if let Err(error) = task.record_transition(ExecutionState::Submitted) {
                        tracing::error!(task_id = %task_id, %error, "Submission bookkeeping failed");
                    }
                    tracing::debug!(
                        submitter = index,
                        task_id = %task_id,
                        unit_id = %unit_id,
                        "Unit submitted"
                    );
                }
                Err(error) if error.is_retryable() => {
                    // Connectivity loss or another transient rejection: the
                    // queue stays the source of truth. Hold off briefly and
                    // put the task back; no state change, no budget spent.
                    tracing::warn!(
                        task_id = %task_id,
                        %error,
                        "Submission failed transiently, holding task on the queue"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(SUBMISSION_RETRY_DELAY) => {}
                    }
                    let _ = pending_tx.send(task_id).await;
                }
                Err(error) => {
                    tracing::error!(task_id = %task_id, %error, "Submission rejected");
                    let _ = cell.lock().await.record_transition(ExecutionState::Failed);
                    let _ = completed_tx
                        .send(Completion {
                            task_id,
                            state: ExecutionState::Failed,
                            retryable: false,
                        })
                        .await;
                }
            }
        }
        tracing::debug!(submitter = index, "Submitter stopped");
    }

    /// Folds backend notifications back into task state and feeds the
    /// completed queue
    async fn listener_loop(
        index: usize,
        store: Arc<WorkflowStore>,
        notif_rx: SharedReceiver<BackendNotification>,
        completed_tx: mpsc::Sender<Completion>,
        shutdown_tx: watch::Sender<bool>,
    ) {
        let mut shutdown = shutdown_tx.subscribe();
        loop {
            let received = {
                let mut rx = notif_rx.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => None,
                    received = rx.recv() => received,
                }
            };
            let Some(notification) = received else { break };
            if !notification.state.is_terminal() {
                continue;
            }

            let unit_id = notification.unit_id.0.clone();
            let Some(task_id) = store.task_for_unit(&unit_id).await else {
                tracing::debug!(unit_id = %unit_id, "Notification for unknown unit dropped");
                continue;
            };
            let cell = match store.task(&task_id).await {
                Ok(cell) => cell,
                Err(error) => {
                    tracing::error!(task_id = %task_id, %error, "Unit bound to unknown task");
                    continue;
                }
            };

            let final_state = match notification.state {
                BackendUnitState::Done => ExecutionState::Done,
                BackendUnitState::Failed => ExecutionState::Failed,
                _ => ExecutionState::Terminated,
            };
            let recorded = {
                let mut task = cell.lock().await;
                if task.is_final() {
                    // Late notification; the first final write won
                    false
                } else {
                    let ladder = if final_state == ExecutionState::Terminated {
                        vec![final_state]
                    } else {
                        vec![
                            ExecutionState::Completed,
                            ExecutionState::Dequeueing,
                            ExecutionState::Dequeued,
                            final_state,
                        ]
                    };
                    let mut folded = true;
                    for state in ladder {
                        if let Err(error) = task.record_transition(state) {
                            tracing::error!(task_id = %task_id, %error, "Outcome folding failed");
                            folded = false;
                            break;
                        }
                    }
                    if folded {
                        task.exit_code = notification.exit_code;
                        if notification.path.is_some() {
                            task.path = notification.path.clone();
                        }
                    }
                    folded
                }
            };
            store.release_unit(&unit_id).await;

            if recorded {
                tracing::debug!(
                    listener = index,
                    task_id = %task_id,
                    state = %final_state,
                    "Unit outcome recorded"
                );
                let _ = completed_tx
                    .send(Completion {
                        task_id,
                        state: final_state,
                        retryable: final_state == ExecutionState::Failed,
                    })
                    .await;
            }
        }
        tracing::debug!(listener = index, "Listener stopped");
    }

    /// The single reattempt decision point; everything terminal flows
    /// through here before touching the pipeline
    #[allow(clippy::too_many_arguments)]
    async fn reconciler_loop(
        config: EngineConfig,
        store: Arc<WorkflowStore>,
        progression: Arc<ProgressionController>,
        completed_rx: SharedReceiver<Completion>,
        pending_tx: mpsc::Sender<TaskId>,
        activation_tx: mpsc::Sender<PipelineId>,
        settled_tx: watch::Sender<bool>,
        shutdown_tx: watch::Sender<bool>,
    ) {
        let mut shutdown = shutdown_tx.subscribe();
        loop {
            let received = {
                let mut rx = completed_rx.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => None,
                    received = rx.recv() => received,
                }
            };
            let Some(completion) = received else { break };

            if completion.state == ExecutionState::Failed && completion.retryable {
                let Ok(cell) = store.task(&completion.task_id).await else {
                    continue;
                };
                let mut task = cell.lock().await;
                if task.attempts < config.max_reattempts {
                    let restart = task.reset_for_reattempt().and_then(|()| {
                        task.record_transition(ExecutionState::Scheduled).map(|_| ())
                    });
                    match restart {
                        Ok(()) => {
                            tracing::info!(
                                task_id = %completion.task_id,
                                attempt = task.attempts,
                                limit = config.max_reattempts,
                                "Resubmitting failed task"
                            );
                            drop(task);
                            let _ = pending_tx.send(completion.task_id.clone()).await;
                            continue;
                        }
                        Err(error) => {
                            tracing::error!(
                                task_id = %completion.task_id,
                                %error,
                                "Reattempt restart failed"
                            );
                        }
                    }
                } else if config.max_reattempts > 0 {
                    let exhausted = WorkflowError::ReattemptsExhausted {
                        task: completion.task_id.to_string(),
                        limit: config.max_reattempts,
                    };
                    tracing::warn!(error = %exhausted, "Task terminally failed");
                }
            }

            match progression.record_terminal_task(&completion.task_id).await {
                Ok(Progress::StageInFlight) => {}
                Ok(Progress::StageComplete { pipeline }) => {
                    let _ = activation_tx.send(pipeline).await;
                }
                Ok(Progress::PipelineComplete { pipeline, state }) => {
                    tracing::info!(pipeline_id = %pipeline, state = %state, "Pipeline settled");
                    Self::signal_if_settled(
                        &store,
                        &settled_tx,
                        &shutdown_tx,
                        config.autoterminate,
                    )
                    .await;
                }
                Err(error) => {
                    tracing::error!(task_id = %completion.task_id, %error, "Reconciliation failed");
                }
            }
        }
        tracing::debug!("Reconciler stopped");
    }
}
