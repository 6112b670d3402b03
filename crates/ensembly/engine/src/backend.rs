//! The execution-backend interface and an in-memory test backend
//!
//! The engine never assumes a specific backend. It requires three things:
//! accepting unit descriptions, cancelling units, and eventual delivery of
//! asynchronous state-change notifications over a channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use ensembly_types::{UnitDescription, WorkflowError, WorkflowResult};

// ── Backend Unit Identifier ──────────────────────────────────────────

/// Identifier assigned by the backend to a submitted unit
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendUnitId(pub String);

impl BackendUnitId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for BackendUnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Backend States & Notifications ───────────────────────────────────

/// Unit states as reported by the backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendUnitState {
    /// Accepted, not yet running
    Pending,
    /// Executing
    Running,
    /// Finished successfully
    Done,
    /// Finished unsuccessfully
    Failed,
    /// Cancelled on request
    Canceled,
}

impl BackendUnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }
}

/// One asynchronous state-change notification from the backend
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendNotification {
    /// The unit the notification is about
    pub unit_id: BackendUnitId,
    /// The new backend-side state
    pub state: BackendUnitState,
    /// Exit code, for terminal states
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Working path assigned to the unit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

// ── Execution Backend ────────────────────────────────────────────────

/// The remote job-execution service the engine submits units to.
///
/// Submission and cancellation may block on network I/O; both must return
/// promptly once the engine signals shutdown (the engine drops in-flight
/// calls on cancellation points). Transient submission failures are
/// reported as [`WorkflowError::BackendSubmission`] and retried by the
/// engine; permanent rejections as [`WorkflowError::BackendFatal`].
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Submit a unit for execution, returning the backend-assigned id
    async fn submit(&self, unit: UnitDescription) -> WorkflowResult<BackendUnitId>;

    /// Cancel a previously submitted unit
    async fn cancel(&self, unit_id: &BackendUnitId) -> WorkflowResult<()>;

    /// Take the notification stream. Yields `Some` exactly once; the engine
    /// calls this at start and shares the receiver across its listener pool.
    fn take_notifications(&self) -> Option<mpsc::Receiver<BackendNotification>>;
}

// ── In-Memory Backend ────────────────────────────────────────────────

const NOTIFICATION_BUFFER: usize = 1024;

#[derive(Default)]
struct BackendInner {
    /// Remaining scripted execution failures per unit name
    fail_budget: HashMap<String, u32>,
    /// Scripted execution failures applied to units not listed above
    default_failures: u32,
    /// Remaining scripted transient submission failures (backend-wide)
    submission_failures: u32,
    /// Units accepted so far, in submission order
    submitted: Vec<(BackendUnitId, UnitDescription)>,
    /// Units cancelled before completion
    canceled: Vec<BackendUnitId>,
    /// Simulated connectivity; submissions fail transiently while down
    connected: bool,
    /// Cancel without emitting a CANCELED notification
    silent_cancel: bool,
}

/// An in-process backend for tests and demos.
///
/// In auto mode every accepted unit runs to DONE after a short delay,
/// honoring scripted per-unit failure budgets. In manual mode units sit
/// until the test drives them with [`notify`](InMemoryBackend::notify),
/// which makes completion ordering deterministic.
pub struct InMemoryBackend {
    notif_tx: mpsc::Sender<BackendNotification>,
    notif_rx: std::sync::Mutex<Option<mpsc::Receiver<BackendNotification>>>,
    inner: std::sync::Mutex<BackendInner>,
    auto_complete: bool,
}

impl InMemoryBackend {
    /// Backend that completes every unit on its own
    pub fn new() -> Arc<Self> {
        Self::build(true)
    }

    /// Backend that only reports what the test tells it to
    pub fn manual() -> Arc<Self> {
        Self::build(false)
    }

    fn build(auto_complete: bool) -> Arc<Self> {
        let (notif_tx, notif_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        Arc::new(Self {
            notif_tx,
            notif_rx: std::sync::Mutex::new(Some(notif_rx)),
            inner: std::sync::Mutex::new(BackendInner {
                connected: true,
                ..Default::default()
            }),
            auto_complete,
        })
    }

    /// Script the first `n` attempts of every unit to fail execution
    pub fn fail_each_unit(self: &Arc<Self>, n: u32) -> Arc<Self> {
        self.inner.lock().unwrap().default_failures = n;
        self.clone()
    }

    /// Script the first `n` attempts of one named unit to fail execution
    pub fn fail_unit(self: &Arc<Self>, unit_name: impl Into<String>, n: u32) -> Arc<Self> {
        self.inner
            .lock()
            .unwrap()
            .fail_budget
            .insert(unit_name.into(), n);
        self.clone()
    }

    /// Script the next `n` submissions to fail transiently
    pub fn fail_submissions(self: &Arc<Self>, n: u32) -> Arc<Self> {
        self.inner.lock().unwrap().submission_failures = n;
        self.clone()
    }

    /// Make cancellations succeed without emitting a notification, as a
    /// backend that drops units quietly would
    pub fn cancel_silently(self: &Arc<Self>) -> Arc<Self> {
        self.inner.lock().unwrap().silent_cancel = true;
        self.clone()
    }

    /// Toggle simulated connectivity
    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().unwrap().connected = connected;
    }

    /// Units accepted so far, in submission order
    pub fn submitted(&self) -> Vec<(BackendUnitId, UnitDescription)> {
        self.inner.lock().unwrap().submitted.clone()
    }

    /// Units cancelled so far
    pub fn canceled(&self) -> Vec<BackendUnitId> {
        self.inner.lock().unwrap().canceled.clone()
    }

    /// Manually push a notification (manual mode, or late/duplicate
    /// notifications in tests)
    pub async fn notify(
        &self,
        unit_id: BackendUnitId,
        state: BackendUnitState,
        exit_code: Option<i32>,
    ) {
        let _ = self
            .notif_tx
            .send(BackendNotification {
                unit_id,
                state,
                exit_code,
                path: None,
            })
            .await;
    }

    fn consume_failure(&self, unit_name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let default_failures = inner.default_failures;
        let budget = inner
            .fail_budget
            .entry(unit_name.to_string())
            .or_insert(default_failures);
        if *budget > 0 {
            *budget -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl ExecutionBackend for InMemoryBackend {
    async fn submit(&self, unit: UnitDescription) -> WorkflowResult<BackendUnitId> {
        let unit_id = BackendUnitId::generate();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.connected {
                return Err(WorkflowError::BackendSubmission(
                    "backend unreachable".into(),
                ));
            }
            if inner.submission_failures > 0 {
                inner.submission_failures -= 1;
                return Err(WorkflowError::BackendSubmission(
                    "simulated transient submission failure".into(),
                ));
            }
            inner.submitted.push((unit_id.clone(), unit.clone()));
        }

        if self.auto_complete {
            let fail = self.consume_failure(&unit.name);
            let tx = self.notif_tx.clone();
            let id = unit_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                let _ = tx
                    .send(BackendNotification {
                        unit_id: id.clone(),
                        state: BackendUnitState::Running,
                        exit_code: None,
                        path: Some(format!("/tmp/units/{}", id)),
                    })
                    .await;
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                let (state, exit_code) = if fail {
                    (BackendUnitState::Failed, Some(1))
                } else {
                    (BackendUnitState::Done, Some(0))
                };
                let _ = tx
                    .send(BackendNotification {
                        unit_id: id.clone(),
                        state,
                        exit_code,
                        path: Some(format!("/tmp/units/{}", id)),
                    })
                    .await;
            });
        }

        Ok(unit_id)
    }

    async fn cancel(&self, unit_id: &BackendUnitId) -> WorkflowResult<()> {
        let silent = {
            let mut inner = self.inner.lock().unwrap();
            inner.canceled.push(unit_id.clone());
            inner.silent_cancel
        };
        if !silent {
            let _ = self
                .notif_tx
                .send(BackendNotification {
                    unit_id: unit_id.clone(),
                    state: BackendUnitState::Canceled,
                    exit_code: None,
                    path: None,
                })
                .await;
        }
        Ok(())
    }

    fn take_notifications(&self) -> Option<mpsc::Receiver<BackendNotification>> {
        self.notif_rx.lock().unwrap().take()
    }
}
