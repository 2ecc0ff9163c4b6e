//! Mapping between machine states and what is persisted on disk.
//!
//! Several internal states share one persisted status, so rebuilding a
//! machine needs the review reason and the last execution phase as well.

use super::states::{ReviewReason, TaskContext, TaskSnapshot, TaskState, TaskStatus};
use crate::protocol::ExecutionPhase;
use crate::store::{PersistedState, PlanFile};

pub fn status_for(state: TaskState) -> TaskStatus {
    match state {
        TaskState::Backlog => TaskStatus::Backlog,
        TaskState::Planning | TaskState::Coding => TaskStatus::InProgress,
        TaskState::QaReview | TaskState::QaFixing => TaskStatus::AiReview,
        TaskState::PlanReview | TaskState::HumanReview | TaskState::Error => {
            TaskStatus::HumanReview
        }
        TaskState::CreatingPr => TaskStatus::CreatingPr,
        TaskState::PrCreated => TaskStatus::PrCreated,
        TaskState::Done => TaskStatus::Done,
    }
}

pub fn execution_phase_for(state: TaskState) -> ExecutionPhase {
    match state {
        TaskState::Backlog => ExecutionPhase::Idle,
        TaskState::Planning | TaskState::PlanReview => ExecutionPhase::Planning,
        TaskState::Coding => ExecutionPhase::Coding,
        TaskState::QaReview => ExecutionPhase::QaReview,
        TaskState::QaFixing => ExecutionPhase::QaFixing,
        TaskState::Error => ExecutionPhase::Failed,
        TaskState::HumanReview
        | TaskState::CreatingPr
        | TaskState::PrCreated
        | TaskState::Done => ExecutionPhase::Complete,
    }
}

/// The fields written to plan files for `snapshot`.
pub fn persisted_state(snapshot: &TaskSnapshot) -> PersistedState {
    PersistedState {
        status: status_for(snapshot.state).as_str().to_string(),
        review_reason: snapshot
            .context
            .review_reason
            .map(|r| r.as_str().to_string()),
        xstate_state: snapshot.state.as_str().to_string(),
        execution_phase: execution_phase_for(snapshot.state).as_str().to_string(),
        last_event: None,
    }
}

/// Rebuild a machine from persisted status, review reason and phase.
pub fn rehydrate(
    status: TaskStatus,
    review_reason: Option<ReviewReason>,
    phase: Option<ExecutionPhase>,
) -> TaskSnapshot {
    let state = match status {
        TaskStatus::Backlog => TaskState::Backlog,
        TaskStatus::InProgress => match phase {
            Some(ExecutionPhase::Planning) => TaskState::Planning,
            _ => TaskState::Coding,
        },
        TaskStatus::AiReview => match phase {
            Some(ExecutionPhase::QaFixing) => TaskState::QaFixing,
            _ => TaskState::QaReview,
        },
        TaskStatus::HumanReview => match review_reason {
            Some(ReviewReason::PlanReview) => TaskState::PlanReview,
            Some(ReviewReason::Errors) => TaskState::Error,
            _ => TaskState::HumanReview,
        },
        TaskStatus::CreatingPr => TaskState::CreatingPr,
        TaskStatus::PrCreated => TaskState::PrCreated,
        TaskStatus::Done => TaskState::Done,
    };
    let review_reason = match state {
        TaskState::PlanReview | TaskState::HumanReview | TaskState::Error | TaskState::CreatingPr => {
            review_reason
        }
        _ => None,
    };
    TaskSnapshot {
        state,
        context: TaskContext {
            review_reason,
            ..TaskContext::default()
        },
    }
}

/// Rebuild from a plan file. Unknown statuses fall back to the raw state
/// name, then to `backlog`.
pub fn rehydrate_plan(plan: &PlanFile) -> TaskSnapshot {
    let review_reason = plan.review_reason.as_deref().and_then(ReviewReason::parse);
    let phase = plan.execution_phase.as_deref().and_then(ExecutionPhase::parse);

    if let Some(status) = plan.status.as_deref().and_then(TaskStatus::parse) {
        return rehydrate(status, review_reason, phase);
    }
    match plan.xstate_state.as_deref().and_then(TaskState::parse) {
        Some(state) => TaskSnapshot {
            state,
            context: TaskContext {
                review_reason,
                ..TaskContext::default()
            },
        },
        None => TaskSnapshot::default(),
    }
}
