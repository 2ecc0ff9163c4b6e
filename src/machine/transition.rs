//! The pure transition function.
//!
//! `transition` never touches disk or channels. It returns the next
//! snapshot together with the effects the caller must perform, so replaying
//! the same event list against a fresh machine always lands in the same
//! place.

use super::rehydrate::{execution_phase_for, status_for};
use super::states::{
    MachineEvent, ReviewReason, TaskContext, TaskSnapshot, TaskState, TaskStatus,
};
use crate::protocol::ExecutionPhase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Write status, review reason, state name and phase to every plan copy.
    Persist,
    NotifyStatus {
        status: TaskStatus,
        review_reason: Option<ReviewReason>,
    },
    NotifyProgress {
        phase: ExecutionPhase,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: TaskState,
    pub snapshot: TaskSnapshot,
    pub effects: Vec<Effect>,
}

fn unexpected_exit(event: &MachineEvent) -> bool {
    matches!(
        event,
        MachineEvent::ProcessExited {
            unexpected: true,
            ..
        }
    )
}

fn requires_plan_review(event: &MachineEvent) -> bool {
    matches!(
        event,
        MachineEvent::PlanningComplete {
            require_review: true
        }
    )
}

fn exit_message(event: &MachineEvent) -> String {
    match event {
        MachineEvent::ProcessExited {
            reason: Some(reason),
            ..
        } => reason.clone(),
        MachineEvent::ProcessExited {
            exit_code: Some(code),
            ..
        } => format!("Process exited unexpectedly with code {}", code),
        _ => "Process exited unexpectedly".to_string(),
    }
}

fn failure(error: &str) -> (TaskState, TaskContext) {
    (
        TaskState::Error,
        TaskContext {
            review_reason: Some(ReviewReason::Errors),
            error: Some(error.to_string()),
            qa_iteration: None,
        },
    )
}

fn review(reason: ReviewReason) -> (TaskState, TaskContext) {
    (
        TaskState::HumanReview,
        TaskContext {
            review_reason: Some(reason),
            ..TaskContext::default()
        },
    )
}

fn working(state: TaskState) -> (TaskState, TaskContext) {
    (state, TaskContext::default())
}

/// Next state and context for `event`, or `None` if `state` does not handle it.
fn next(
    state: TaskState,
    context: &TaskContext,
    event: &MachineEvent,
) -> Option<(TaskState, TaskContext)> {
    use MachineEvent as E;
    use TaskState as S;

    let outcome = match (state, event) {
        (S::Backlog, E::PlanningStarted) => working(S::Planning),
        (S::Backlog, E::CodingStarted) => working(S::Coding),

        (S::Planning, E::PlanningComplete { .. }) if requires_plan_review(event) => (
            S::PlanReview,
            TaskContext {
                review_reason: Some(ReviewReason::PlanReview),
                ..TaskContext::default()
            },
        ),
        (S::Planning, E::PlanningComplete { .. }) => working(S::Coding),
        (S::Planning, E::CodingStarted) => working(S::Coding),
        (S::Planning, E::PlanningFailed { error }) => failure(error),
        (S::Planning, E::UserStopped) => working(S::Backlog),

        (S::PlanReview, E::PlanApproved) => working(S::Coding),
        (S::PlanReview, E::CodingStarted) => working(S::Coding),
        (S::PlanReview, E::PlanningStarted) => working(S::Planning),
        (S::PlanReview, E::UserStopped) => working(S::Backlog),

        (S::Coding, E::QaStarted | E::AllSubtasksDone) => working(S::QaReview),
        (S::Coding, E::CodingFailed { error }) => failure(error),
        (S::Coding, E::UserStopped) => review(ReviewReason::Stopped),

        (S::QaReview, E::QaFailed { iteration }) => (
            S::QaFixing,
            TaskContext {
                qa_iteration: *iteration,
                ..TaskContext::default()
            },
        ),
        (S::QaReview, E::QaFixingStarted) => (S::QaFixing, context.clone()),
        (S::QaFixing, E::QaFixingComplete) => (
            S::QaReview,
            TaskContext {
                qa_iteration: context.qa_iteration,
                ..TaskContext::default()
            },
        ),
        (S::QaFixing, E::QaFixingFailed { error }) => failure(error),
        (S::QaReview | S::QaFixing, E::QaPassed) => review(ReviewReason::Completed),
        (S::QaReview | S::QaFixing, E::QaMaxIterations { error }) => failure(error),
        (S::QaReview | S::QaFixing, E::QaAgentError { error }) => failure(error),
        (S::QaReview | S::QaFixing, E::UserStopped) => review(ReviewReason::Stopped),

        (S::Planning | S::Coding | S::QaReview | S::QaFixing, E::ProcessExited { .. })
            if unexpected_exit(event) =>
        {
            failure(&exit_message(event))
        }

        (S::HumanReview | S::Error, E::UserResumed) => working(S::Coding),
        (S::HumanReview | S::Error, E::PlanningStarted) => working(S::Planning),
        (S::HumanReview | S::Error, E::MarkDone) => working(S::Done),
        (S::HumanReview, E::CreatePr) => (S::CreatingPr, context.clone()),

        (S::CreatingPr, E::PrCreated) => working(S::PrCreated),
        (S::CreatingPr, E::PrFailed { error }) => (
            S::HumanReview,
            TaskContext {
                review_reason: Some(ReviewReason::Completed),
                error: Some(error.clone()),
                qa_iteration: None,
            },
        ),
        (S::PrCreated, E::MarkDone) => working(S::Done),

        _ => return None,
    };
    Some(outcome)
}

/// Apply `event` to `snapshot`.
///
/// Returns `None` when the event is not handled in the current state; the
/// caller leaves the snapshot untouched in that case.
pub fn transition(snapshot: &TaskSnapshot, event: &MachineEvent) -> Option<Transition> {
    let (state, context) = next(snapshot.state, &snapshot.context, event)?;
    let status = status_for(state);
    let review_reason = context.review_reason;
    let effects = vec![
        Effect::Persist,
        Effect::NotifyStatus {
            status,
            review_reason,
        },
        Effect::NotifyProgress {
            phase: execution_phase_for(state),
        },
    ];
    Some(Transition {
        from: snapshot.state,
        snapshot: TaskSnapshot { state, context },
        effects,
    })
}

/// Fold a whole event list over a fresh machine.
pub fn replay<'a>(events: impl IntoIterator<Item = &'a MachineEvent>) -> TaskSnapshot {
    events
        .into_iter()
        .fold(TaskSnapshot::default(), |snapshot, event| {
            transition(&snapshot, event)
                .map(|t| t.snapshot)
                .unwrap_or(snapshot)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(events: &[MachineEvent]) -> TaskSnapshot {
        replay(events.iter())
    }

    fn exited(code: i32, unexpected: bool) -> MachineEvent {
        MachineEvent::ProcessExited {
            exit_code: Some(code),
            unexpected,
            reason: None,
        }
    }

    #[test]
    fn test_plan_review_guard() {
        let reviewed = run(&[
            MachineEvent::PlanningStarted,
            MachineEvent::PlanningComplete {
                require_review: true,
            },
        ]);
        assert_eq!(reviewed.state, TaskState::PlanReview);
        assert_eq!(reviewed.context.review_reason, Some(ReviewReason::PlanReview));

        let straight = run(&[
            MachineEvent::PlanningStarted,
            MachineEvent::PlanningComplete {
                require_review: false,
            },
        ]);
        assert_eq!(straight.state, TaskState::Coding);
        assert_eq!(straight.context.review_reason, None);
    }

    #[test]
    fn test_happy_path_through_qa() {
        let snapshot = run(&[
            MachineEvent::PlanningStarted,
            MachineEvent::PlanningComplete {
                require_review: false,
            },
            MachineEvent::AllSubtasksDone,
            MachineEvent::QaFailed { iteration: Some(1) },
            MachineEvent::QaFixingComplete,
            MachineEvent::QaPassed,
        ]);
        assert_eq!(snapshot.state, TaskState::HumanReview);
        assert_eq!(snapshot.context.review_reason, Some(ReviewReason::Completed));
    }

    #[test]
    fn test_failures_capture_error() {
        let snapshot = run(&[
            MachineEvent::PlanningStarted,
            MachineEvent::PlanningComplete {
                require_review: false,
            },
            MachineEvent::CodingFailed {
                error: "tests failed".to_string(),
            },
        ]);
        assert_eq!(snapshot.state, TaskState::Error);
        assert_eq!(snapshot.context.review_reason, Some(ReviewReason::Errors));
        assert_eq!(snapshot.context.error.as_deref(), Some("tests failed"));

        let qa = run(&[
            MachineEvent::CodingStarted,
            MachineEvent::QaStarted,
            MachineEvent::QaMaxIterations {
                error: "gave up".to_string(),
            },
        ]);
        assert_eq!(qa.state, TaskState::Error);
    }

    #[test]
    fn test_clean_exit_never_downgrades_review() {
        let snapshot = run(&[
            MachineEvent::PlanningStarted,
            MachineEvent::PlanningComplete {
                require_review: true,
            },
            exited(0, false),
        ]);
        assert_eq!(snapshot.state, TaskState::PlanReview);

        let coding = run(&[MachineEvent::CodingStarted, exited(0, false)]);
        assert_eq!(coding.state, TaskState::Coding);
    }

    #[test]
    fn test_unexpected_exit_errors_active_states_only() {
        let snapshot = run(&[MachineEvent::CodingStarted, exited(137, true)]);
        assert_eq!(snapshot.state, TaskState::Error);
        assert_eq!(
            snapshot.context.error.as_deref(),
            Some("Process exited unexpectedly with code 137")
        );

        let review = run(&[
            MachineEvent::CodingStarted,
            MachineEvent::QaStarted,
            MachineEvent::QaPassed,
            exited(1, true),
        ]);
        assert_eq!(review.state, TaskState::HumanReview);
    }

    #[test]
    fn test_classified_exit_carries_reason() {
        let snapshot = run(&[
            MachineEvent::CodingStarted,
            MachineEvent::ProcessExited {
                exit_code: Some(1),
                unexpected: true,
                reason: Some("Rate limit reached. Resets 5pm".to_string()),
            },
        ]);
        assert_eq!(snapshot.state, TaskState::Error);
        assert_eq!(
            snapshot.context.error.as_deref(),
            Some("Rate limit reached. Resets 5pm")
        );
    }

    #[test]
    fn test_user_stop_and_resume() {
        let stopped = run(&[MachineEvent::PlanningStarted, MachineEvent::UserStopped]);
        assert_eq!(stopped.state, TaskState::Backlog);

        let stopped = run(&[MachineEvent::CodingStarted, MachineEvent::UserStopped]);
        assert_eq!(stopped.state, TaskState::HumanReview);
        assert_eq!(stopped.context.review_reason, Some(ReviewReason::Stopped));

        let resumed = run(&[
            MachineEvent::CodingStarted,
            MachineEvent::UserStopped,
            MachineEvent::UserResumed,
        ]);
        assert_eq!(resumed.state, TaskState::Coding);
        assert_eq!(resumed.context, TaskContext::default());
    }

    #[test]
    fn test_pull_request_flow() {
        let base = [
            MachineEvent::CodingStarted,
            MachineEvent::QaStarted,
            MachineEvent::QaPassed,
            MachineEvent::CreatePr,
        ];
        let mut events = base.to_vec();
        events.extend([MachineEvent::PrCreated, MachineEvent::MarkDone]);
        assert_eq!(run(&events).state, TaskState::Done);

        let mut failed = base.to_vec();
        failed.push(MachineEvent::PrFailed {
            error: "no remote".to_string(),
        });
        let snapshot = run(&failed);
        assert_eq!(snapshot.state, TaskState::HumanReview);
        assert_eq!(snapshot.context.error.as_deref(), Some("no remote"));
    }

    #[test]
    fn test_done_ignores_everything() {
        let done = TaskSnapshot::new(TaskState::Done);
        for event in [
            MachineEvent::PlanningStarted,
            MachineEvent::UserResumed,
            exited(1, true),
            MachineEvent::MarkDone,
        ] {
            assert!(transition(&done, &event).is_none());
        }
    }

    #[test]
    fn test_unhandled_event_yields_none() {
        let backlog = TaskSnapshot::default();
        assert!(transition(&backlog, &MachineEvent::QaPassed).is_none());
        assert!(transition(&backlog, &MachineEvent::PlanApproved).is_none());
    }

    #[test]
    fn test_effects_carry_status_and_phase() {
        let t = transition(&TaskSnapshot::default(), &MachineEvent::PlanningStarted).unwrap();
        assert_eq!(t.from, TaskState::Backlog);
        assert_eq!(
            t.effects,
            vec![
                Effect::Persist,
                Effect::NotifyStatus {
                    status: TaskStatus::InProgress,
                    review_reason: None,
                },
                Effect::NotifyProgress {
                    phase: ExecutionPhase::Planning,
                },
            ]
        );
    }

    #[test]
    fn test_replay_is_deterministic() {
        let events = vec![
            MachineEvent::PlanningStarted,
            MachineEvent::PlanningComplete {
                require_review: true,
            },
            MachineEvent::PlanApproved,
            MachineEvent::QaStarted,
            MachineEvent::QaFailed { iteration: Some(1) },
            MachineEvent::QaFixingComplete,
            MachineEvent::QaFailed { iteration: Some(2) },
            MachineEvent::QaFixingFailed {
                error: "fixer crashed".to_string(),
            },
        ];
        let first = run(&events);
        for _ in 0..5 {
            assert_eq!(run(&events), first);
        }
        assert_eq!(first.state, TaskState::Error);
    }
}
