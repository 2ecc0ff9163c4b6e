//! Task states, statuses, review reasons and machine events.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::TaskEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Backlog,
    Planning,
    PlanReview,
    Coding,
    QaReview,
    QaFixing,
    HumanReview,
    Error,
    CreatingPr,
    PrCreated,
    Done,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Backlog => "backlog",
            TaskState::Planning => "planning",
            TaskState::PlanReview => "plan_review",
            TaskState::Coding => "coding",
            TaskState::QaReview => "qa_review",
            TaskState::QaFixing => "qa_fixing",
            TaskState::HumanReview => "human_review",
            TaskState::Error => "error",
            TaskState::CreatingPr => "creating_pr",
            TaskState::PrCreated => "pr_created",
            TaskState::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The externally visible status persisted in plan files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    AiReview,
    HumanReview,
    CreatingPr,
    PrCreated,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AiReview => "ai_review",
            TaskStatus::HumanReview => "human_review",
            TaskStatus::CreatingPr => "creating_pr",
            TaskStatus::PrCreated => "pr_created",
            TaskStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task is waiting for a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    Completed,
    PlanReview,
    Errors,
    Stopped,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewReason::Completed => "completed",
            ReviewReason::PlanReview => "plan_review",
            ReviewReason::Errors => "errors",
            ReviewReason::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskContext {
    pub review_reason: Option<ReviewReason>,
    pub error: Option<String>,
    pub qa_iteration: Option<u64>,
}

/// Current state plus context, as held per task and rehydrated from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub state: TaskState,
    pub context: TaskContext,
}

impl TaskSnapshot {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            context: TaskContext::default(),
        }
    }
}

impl Default for TaskSnapshot {
    fn default() -> Self {
        Self::new(TaskState::Backlog)
    }
}

/// Events the machine understands, from workers or from users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineEvent {
    PlanningStarted,
    PlanningComplete { require_review: bool },
    PlanningFailed { error: String },
    PlanApproved,
    CodingStarted,
    AllSubtasksDone,
    CodingFailed { error: String },
    QaStarted,
    QaPassed,
    QaFailed { iteration: Option<u64> },
    QaFixingStarted,
    QaFixingComplete,
    QaFixingFailed { error: String },
    QaMaxIterations { error: String },
    QaAgentError { error: String },
    ProcessExited {
        exit_code: Option<i32>,
        unexpected: bool,
        /// Classified cause, used as the task error instead of the exit code.
        reason: Option<String>,
    },
    UserStopped,
    UserResumed,
    CreatePr,
    PrCreated,
    PrFailed { error: String },
    MarkDone,
}

/// Worker event types after which a process exit must not be interpreted.
pub const TERMINAL_EVENT_TYPES: &[&str] = &[
    "PLANNING_COMPLETE",
    "PLANNING_FAILED",
    "ALL_SUBTASKS_DONE",
    "CODING_FAILED",
    "QA_PASSED",
    "QA_MAX_ITERATIONS",
    "QA_AGENT_ERROR",
    "QA_FIXING_FAILED",
];

/// Worker event types that begin new work and so re-arm exit handling.
pub const WORK_STARTED_EVENT_TYPES: &[&str] = &[
    "PLANNING_STARTED",
    "CODING_STARTED",
    "QA_STARTED",
    "QA_FIXING_STARTED",
];

pub fn is_terminal_event_type(event_type: &str) -> bool {
    TERMINAL_EVENT_TYPES.contains(&event_type)
}

pub fn is_work_started_event_type(event_type: &str) -> bool {
    WORK_STARTED_EVENT_TYPES.contains(&event_type)
}

fn error_text(event: &TaskEvent, fallback: &str) -> String {
    event
        .str_field("error")
        .or_else(|| event.str_field("message"))
        .unwrap_or(fallback)
        .to_string()
}

impl MachineEvent {
    /// Map a worker event onto a machine event. Informational types
    /// (`SUBTASK_*` and unknown ones) map to `None`.
    pub fn from_task_event(event: &TaskEvent) -> Option<Self> {
        let mapped = match event.event_type.as_str() {
            "PLANNING_STARTED" => MachineEvent::PlanningStarted,
            "PLANNING_COMPLETE" => MachineEvent::PlanningComplete {
                require_review: event
                    .bool_field("requireReviewBeforeCoding")
                    .unwrap_or(false),
            },
            "PLANNING_FAILED" => MachineEvent::PlanningFailed {
                error: error_text(event, "Planning failed"),
            },
            "PLAN_APPROVED" => MachineEvent::PlanApproved,
            "CODING_STARTED" => MachineEvent::CodingStarted,
            "ALL_SUBTASKS_DONE" => MachineEvent::AllSubtasksDone,
            "CODING_FAILED" => MachineEvent::CodingFailed {
                error: error_text(event, "Coding failed"),
            },
            "QA_STARTED" => MachineEvent::QaStarted,
            "QA_PASSED" => MachineEvent::QaPassed,
            "QA_FAILED" => MachineEvent::QaFailed {
                iteration: event.u64_field("iteration"),
            },
            "QA_FIXING_STARTED" => MachineEvent::QaFixingStarted,
            "QA_FIXING_COMPLETE" => MachineEvent::QaFixingComplete,
            "QA_FIXING_FAILED" => MachineEvent::QaFixingFailed {
                error: error_text(event, "QA fixing failed"),
            },
            "QA_MAX_ITERATIONS" => MachineEvent::QaMaxIterations {
                error: error_text(event, "QA reached its maximum number of iterations"),
            },
            "QA_AGENT_ERROR" => MachineEvent::QaAgentError {
                error: error_text(event, "QA agent error"),
            },
            "PR_CREATED" => MachineEvent::PrCreated,
            _ => return None,
        };
        Some(mapped)
    }

    pub fn name(&self) -> &'static str {
        match self {
            MachineEvent::PlanningStarted => "PLANNING_STARTED",
            MachineEvent::PlanningComplete { .. } => "PLANNING_COMPLETE",
            MachineEvent::PlanningFailed { .. } => "PLANNING_FAILED",
            MachineEvent::PlanApproved => "PLAN_APPROVED",
            MachineEvent::CodingStarted => "CODING_STARTED",
            MachineEvent::AllSubtasksDone => "ALL_SUBTASKS_DONE",
            MachineEvent::CodingFailed { .. } => "CODING_FAILED",
            MachineEvent::QaStarted => "QA_STARTED",
            MachineEvent::QaPassed => "QA_PASSED",
            MachineEvent::QaFailed { .. } => "QA_FAILED",
            MachineEvent::QaFixingStarted => "QA_FIXING_STARTED",
            MachineEvent::QaFixingComplete => "QA_FIXING_COMPLETE",
            MachineEvent::QaFixingFailed { .. } => "QA_FIXING_FAILED",
            MachineEvent::QaMaxIterations { .. } => "QA_MAX_ITERATIONS",
            MachineEvent::QaAgentError { .. } => "QA_AGENT_ERROR",
            MachineEvent::ProcessExited { .. } => "PROCESS_EXITED",
            MachineEvent::UserStopped => "USER_STOPPED",
            MachineEvent::UserResumed => "USER_RESUMED",
            MachineEvent::CreatePr => "CREATE_PR",
            MachineEvent::PrCreated => "PR_CREATED",
            MachineEvent::PrFailed { .. } => "PR_FAILED",
            MachineEvent::MarkDone => "MARK_DONE",
        }
    }
}
