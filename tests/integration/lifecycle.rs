//! Task lifecycle integration tests.
//!
//! Workers report progress with task events; the orchestrator drives the
//! state machine and merges the result into the spec's plan file.

use serde_json::json;
use std::time::Duration;

use warden::machine::{TaskState, TaskTarget};
use warden::protocol::ExecutionPhase;
use warden::{Notification, TaskExecutionRequest};

use crate::fixtures::{
    config, drain, echo_script, event_line, orchestrator, settle, TestProject, SPEC_ID,
};

const TASK: &str = "task-1";

fn errors(notifications: &[Notification]) -> Vec<String> {
    notifications
        .iter()
        .filter_map(|n| match n {
            Notification::Error { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

/// Test: Plan review pause survives a clean exit
/// Given a worker that finishes planning with review required and exits 0
/// When the orchestrator settles
/// Then the task waits in plan_review and the plan file says so
#[tokio::test]
async fn test_plan_review_then_clean_exit() {
    let project = TestProject::new();
    let script = echo_script(
        &[
            event_line(TASK, "PLANNING_STARTED", 1, json!({})),
            event_line(
                TASK,
                "PLANNING_COMPLETE",
                2,
                json!({ "requireReviewBeforeCoding": true }),
            ),
        ],
        "exit 0",
    );
    let (mut orch, mut rx) = orchestrator(config(&script, vec![]));
    orch.start_task_execution(TaskExecutionRequest::new(TASK, project.path.clone(), SPEC_ID))
        .await
        .unwrap();
    settle(&mut orch).await;

    assert_eq!(
        orch.states().snapshot(TASK).unwrap().state,
        TaskState::PlanReview
    );
    let plan = project.plan();
    assert_eq!(plan["status"], "human_review");
    assert_eq!(plan["reviewReason"], "plan_review");
    assert_eq!(plan["xstateState"], "plan_review");
    assert_eq!(plan["executionPhase"], "planning");
    assert_eq!(plan["lastEvent"]["sequence"], 2);
    assert!(errors(&drain(&mut rx)).is_empty());
}

/// Test: A crash after QA passed does not undo the result
/// Given a worker that reports QA_PASSED and then exits non-zero
/// When the exit is handled
/// Then the task stays in human_review with no error reported
#[tokio::test]
async fn test_crash_after_qa_passed_stays_in_review() {
    let project = TestProject::new();
    let script = echo_script(
        &[
            event_line(TASK, "CODING_STARTED", 1, json!({})),
            event_line(TASK, "QA_STARTED", 2, json!({})),
            event_line(TASK, "QA_PASSED", 3, json!({})),
        ],
        "exit 1",
    );
    let (mut orch, mut rx) = orchestrator(config(&script, vec![]));
    orch.start_task_execution(TaskExecutionRequest::new(TASK, project.path.clone(), SPEC_ID))
        .await
        .unwrap();
    settle(&mut orch).await;

    assert_eq!(
        orch.states().snapshot(TASK).unwrap().state,
        TaskState::HumanReview
    );
    assert_eq!(orch.states().terminal_event(TASK), Some("QA_PASSED"));
    let plan = project.plan();
    assert_eq!(plan["status"], "human_review");
    assert_eq!(plan["reviewReason"], "completed");
    assert!(errors(&drain(&mut rx)).is_empty());
}

/// Test: Unexpected exit while coding
/// Given a worker that starts coding and exits with code 3
/// When the exit is handled
/// Then the task is in error, persisted as human_review with reason errors
#[tokio::test]
async fn test_unexpected_exit_while_coding() {
    let project = TestProject::new();
    let script = echo_script(&[event_line(TASK, "CODING_STARTED", 1, json!({}))], "exit 3");
    let (mut orch, mut rx) = orchestrator(config(&script, vec![]));
    orch.start_task_execution(TaskExecutionRequest::new(TASK, project.path.clone(), SPEC_ID))
        .await
        .unwrap();
    settle(&mut orch).await;

    let snapshot = orch.states().snapshot(TASK).unwrap();
    assert_eq!(snapshot.state, TaskState::Error);
    assert_eq!(
        snapshot.context.error.as_deref(),
        Some("Process exited unexpectedly with code 3")
    );
    assert_eq!(orch.states().current_phase(TASK), ExecutionPhase::Failed);

    let plan = project.plan();
    assert_eq!(plan["status"], "human_review");
    assert_eq!(plan["reviewReason"], "errors");
    assert_eq!(plan["xstateState"], "error");
    assert!(errors(&drain(&mut rx))
        .iter()
        .any(|m| m.contains("code 3")));
}

/// Test: Stopping a running task
/// Given a worker that starts planning and then blocks
/// When the user stops the task
/// Then the worker is killed, its exit is ignored and the task is back in backlog
#[tokio::test]
async fn test_stop_running_task() {
    let project = TestProject::new();
    let script = echo_script(
        &[event_line(TASK, "PLANNING_STARTED", 1, json!({}))],
        "exec sleep 30",
    );
    let (mut orch, mut rx) = orchestrator(config(&script, vec![]));
    orch.start_task_execution(TaskExecutionRequest::new(TASK, project.path.clone(), SPEC_ID))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while orch.states().snapshot(TASK).map(|s| s.state) != Some(TaskState::Planning) {
            orch.step().await;
        }
    })
    .await
    .expect("worker never started planning");

    let target = TaskTarget::for_spec(TASK, &project.path, SPEC_ID);
    let outcome = orch.stop_task(&target).await;
    assert!(matches!(
        outcome,
        warden::machine::EventOutcome::Transitioned {
            from: TaskState::Planning,
            to: TaskState::Backlog
        }
    ));
    assert!(!orch.processes().is_running(TASK));
    assert!(orch.context(TASK).is_none());
    assert_eq!(project.plan()["status"], "backlog");

    settle(&mut orch).await;
    assert!(errors(&drain(&mut rx)).is_empty());
}

/// Test: Starting a task for a missing spec
/// Given a project without the requested spec directory
/// When the task is started
/// Then nothing is spawned
#[tokio::test]
async fn test_start_unknown_spec_fails() {
    let project = TestProject::new();
    let (mut orch, _rx) = orchestrator(config("exit 0", vec![]));
    let result = orch
        .start_task_execution(TaskExecutionRequest::new(
            TASK,
            project.path.clone(),
            "099-missing",
        ))
        .await;

    assert!(result.is_err());
    assert_eq!(orch.processes().running_count(), 0);
}
