//! Pollable handles on customization tasks.
//!
//! A [`Receipt`] is created when a task is submitted and moves through
//! [`TaskState`] exactly once to a terminal state:
//!
//! ```text
//! Pending ──▶ Running ──▶ Succeeded | Failed | Cancelled
//!    └──────────────────▶ Cancelled
//! ```
//!
//! Progress and the status message live in the task's [`TaskStepTracker`];
//! the receipt owns the state transitions and cancellation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::models::ImageInfo;
use crate::streams::CancelFlag;
use crate::tracker::TaskStepTracker;

/// Lifecycle of one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    /// Submitted, waiting for a worker.
    Pending,
    Running,
    /// Published; `output` is the customization tool's captured output.
    Succeeded { image: ImageInfo, output: String },
    /// Failure message, prefixed with the error class.
    Failed(String),
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded { .. } | TaskState::Failed(_) | TaskState::Cancelled
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded { .. } => "succeeded",
            TaskState::Failed(_) => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

/// Handle on one submitted task.
pub struct Receipt {
    id: String,
    task_id: String,
    base_image_id: String,
    created_at: DateTime<Utc>,
    tracker: Arc<TaskStepTracker>,
    state: watch::Sender<TaskState>,
    cancel: CancelFlag,
    abort: Mutex<Option<AbortHandle>>,
}

impl Receipt {
    pub fn new(
        id: impl Into<String>,
        task_id: impl Into<String>,
        base_image_id: impl Into<String>,
        tracker: Arc<TaskStepTracker>,
    ) -> Self {
        Self {
            id: id.into(),
            task_id: task_id.into(),
            base_image_id: base_image_id.into(),
            created_at: Utc::now(),
            tracker,
            state: watch::Sender::new(TaskState::Pending),
            cancel: CancelFlag::new(),
            abort: Mutex::new(None),
        }
    }

    /// Receipt id returned to the caller.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Internal registry id derived from the receipt id and session key.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn base_image_id(&self) -> &str {
        &self.base_image_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.tracker.started_at()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.tracker.completed_at()
    }

    pub fn tracker(&self) -> &Arc<TaskStepTracker> {
        &self.tracker
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn state(&self) -> TaskState {
        self.state.borrow().clone()
    }

    pub fn is_started(&self) -> bool {
        self.tracker.is_started()
    }

    pub fn is_done(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.borrow(), TaskState::Cancelled)
    }

    pub fn percent_complete(&self) -> f64 {
        self.tracker.overall_percent_complete()
    }

    pub fn message(&self) -> Option<String> {
        self.tracker.message()
    }

    /// The published image, once the task has succeeded.
    pub fn image_info(&self) -> Option<ImageInfo> {
        match &*self.state.borrow() {
            TaskState::Succeeded { image, .. } => Some(image.clone()),
            _ => None,
        }
    }

    /// Request cancellation. Returns `false` if the task already finished.
    ///
    /// A pending task never starts. A running task has its cancel flag
    /// raised, which stops the customization tool and in-flight copies.
    pub fn cancel(&self) -> bool {
        let mut accepted = false;
        let mut was_pending = false;
        let flag = &self.cancel;
        // The flag is raised under the state lock so `finish` sees it.
        self.state.send_if_modified(|state| match state {
            TaskState::Pending => {
                *state = TaskState::Cancelled;
                flag.cancel();
                accepted = true;
                was_pending = true;
                true
            }
            TaskState::Running => {
                flag.cancel();
                accepted = true;
                false
            }
            _ => false,
        });
        if was_pending {
            if let Some(abort) = self.abort.lock().take() {
                abort.abort();
            }
            self.tracker.set_message("Cancelled");
            self.tracker.complete();
            tracing::info!(task_id = %self.task_id, "Cancelled pending task");
        }
        accepted
    }

    /// Wait for a terminal state.
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(TaskState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }

    pub(crate) fn set_abort_handle(&self, handle: AbortHandle) {
        *self.abort.lock() = Some(handle);
    }

    /// Move from `Pending` to `Running`. Returns `false` if cancelled first.
    pub(crate) fn mark_running(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TaskState::Pending {
                *state = TaskState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Record the terminal state. Later calls are ignored.
    ///
    /// A success arriving after cancellation was requested is recorded as
    /// `Cancelled`, and its published image is returned for deletion.
    pub(crate) fn finish(&self, outcome: TaskState) -> Option<ImageInfo> {
        let mut orphan = None;
        let flag = &self.cancel;
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = match outcome {
                TaskState::Succeeded { image, .. } if flag.is_cancelled() => {
                    orphan = Some(image);
                    TaskState::Cancelled
                }
                other => other,
            };
            true
        });
        self.abort.lock().take();
        if orphan.is_some() {
            self.tracker.set_message("Cancelled");
            tracing::info!(task_id = %self.task_id, "Task cancelled after publishing");
        }
        orphan
    }

    /// Serializable snapshot; `download_url` is filled in by the service.
    pub fn status(&self) -> ReceiptStatus {
        let state = self.state();
        let (image, output) = match &state {
            TaskState::Succeeded { image, output } => (Some(image.clone()), Some(output.clone())),
            _ => (None, None),
        };
        ReceiptStatus {
            id: self.id.clone(),
            base_image_id: self.base_image_id.clone(),
            state: state.name(),
            created_at: self.created_at,
            started_at: self.started_at(),
            completed_at: self.completed_at(),
            percent_complete: self.percent_complete(),
            message: self.message(),
            done: state.is_terminal(),
            cancelled: state == TaskState::Cancelled,
            image,
            output,
            download_url: None,
        }
    }
}

impl std::fmt::Debug for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receipt")
            .field("id", &self.id)
            .field("base_image_id", &self.base_image_id)
            .field("state", &self.state.borrow().name())
            .finish()
    }
}

/// Point-in-time view of a receipt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptStatus {
    pub id: String,
    pub base_image_id: String,
    pub state: &'static str,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub percent_complete: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub done: bool,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}
