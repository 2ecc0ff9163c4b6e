//! Outbound notifications to the presentation layer.
//!
//! Everything the supervisor wants a UI to know about goes through one
//! unbounded channel. Sends never fail the caller: once the receiver is gone
//! notifications are dropped.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::detect::{AuthFailureDetection, BillingFailureDetection, RateLimitDetection};
use crate::machine::{ReviewReason, TaskState, TaskStatus};
use crate::process::{OutputStream, ProcessType};
use crate::profiles::ProfileSummary;
use crate::protocol::{ExecutionPhase, PhaseSource, TaskEvent};
use crate::wlog_trace;

/// Phase progress as shown to the user. `sequence` increases per task and
/// lets consumers discard late arrivals.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProgress {
    pub phase: ExecutionPhase,
    pub message: String,
    pub phase_progress: Option<u8>,
    pub overall_progress: Option<u8>,
    pub current_subtask: Option<String>,
    pub reset_timestamp: Option<i64>,
    pub profile_id: Option<String>,
    pub source: PhaseSource,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Log {
        task_id: String,
        stream: OutputStream,
        line: String,
    },
    Error {
        task_id: String,
        message: String,
    },
    ExecutionProgress {
        task_id: String,
        progress: ExecutionProgress,
    },
    TaskEvent {
        task_id: String,
        event: TaskEvent,
    },
    StatusChanged {
        task_id: String,
        state: TaskState,
        status: TaskStatus,
        review_reason: Option<ReviewReason>,
    },
    ProcessExit {
        task_id: String,
        process_type: ProcessType,
        exit_code: Option<i32>,
    },
    RateLimitDetected {
        task_id: String,
        detection: RateLimitDetection,
    },
    AuthFailureDetected {
        task_id: String,
        detection: AuthFailureDetection,
    },
    BillingFailureDetected {
        task_id: String,
        detection: BillingFailureDetection,
    },
    ProfileSwapped {
        task_id: String,
        reason: String,
        from_profile: Option<String>,
        to_profile: ProfileSummary,
        swap_count: u32,
    },
}

impl Notification {
    pub fn task_id(&self) -> &str {
        match self {
            Notification::Log { task_id, .. }
            | Notification::Error { task_id, .. }
            | Notification::ExecutionProgress { task_id, .. }
            | Notification::TaskEvent { task_id, .. }
            | Notification::StatusChanged { task_id, .. }
            | Notification::ProcessExit { task_id, .. }
            | Notification::RateLimitDetected { task_id, .. }
            | Notification::AuthFailureDetected { task_id, .. }
            | Notification::BillingFailureDetected { task_id, .. }
            | Notification::ProfileSwapped { task_id, .. } => task_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            wlog_trace!("notification receiver closed, dropping");
        }
    }

    pub fn error(&self, task_id: &str, message: impl Into<String>) {
        self.send(Notification::Error {
            task_id: task_id.to_string(),
            message: message.into(),
        });
    }
}
