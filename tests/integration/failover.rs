//! Provider failure and profile failover integration tests.
//!
//! Workers print provider error text and exit non-zero; the orchestrator
//! classifies the output and restarts under another credential profile.

use serde_json::json;

use warden::machine::TaskState;
use warden::protocol::ExecutionPhase;
use warden::{Notification, TaskExecutionRequest};

use crate::fixtures::{
    config, drain, echo_script, event_line, orchestrator, profile, settle, TestProject, SPEC_ID,
};

const TASK: &str = "task-1";

const RATE_LIMITED_ONCE: &str = r#"echo "$CLAUDE_CONFIG_DIR" >> config_dirs.txt
if [ -f attempted ]; then exit 0; fi
touch attempted
echo 'Limit reached · resets 5pm'
exit 1"#;

const ALWAYS_RATE_LIMITED: &str = r#"echo "$CLAUDE_CONFIG_DIR" >> config_dirs.txt
echo 'Limit reached · resets 5pm'
exit 1"#;

/// Test: Rate limit swaps to the alternate profile
/// Given two profiles and a worker rate-limited on its first run
/// When the worker exits
/// Then the task restarts once under the second profile
#[tokio::test]
async fn test_rate_limit_swaps_profile_and_restarts() {
    let project = TestProject::new();
    let mut config = config(
        RATE_LIMITED_ONCE,
        vec![profile("a", true), profile("b", true)],
    );
    config.auto_switch.enabled = true;
    let (mut orch, mut rx) = orchestrator(config);
    orch.start_task_execution(TaskExecutionRequest::new(TASK, project.path.clone(), SPEC_ID))
        .await
        .unwrap();
    settle(&mut orch).await;

    assert_eq!(
        project.read("config_dirs.txt"),
        "/tmp/warden-test-a\n/tmp/warden-test-b\n"
    );

    let notifications = drain(&mut rx);
    let swaps: Vec<_> = notifications
        .iter()
        .filter_map(|n| match n {
            Notification::ProfileSwapped {
                reason,
                from_profile,
                to_profile,
                swap_count,
                ..
            } => Some((
                reason.clone(),
                from_profile.clone(),
                to_profile.id.clone(),
                *swap_count,
            )),
            _ => None,
        })
        .collect();
    assert_eq!(
        swaps,
        vec![(
            "rate_limit".to_string(),
            Some("a".to_string()),
            "b".to_string(),
            1
        )]
    );
    assert!(!notifications
        .iter()
        .any(|n| matches!(n, Notification::Error { .. })));
}

/// Test: Swap budget bounds restarts
/// Given three profiles and a worker that is always rate-limited
/// When the task runs to completion
/// Then it swaps exactly twice and reports the exhausted budget
#[tokio::test]
async fn test_swap_budget_bounds_restarts() {
    let project = TestProject::new();
    let mut config = config(
        ALWAYS_RATE_LIMITED,
        vec![profile("a", true), profile("b", true), profile("c", true)],
    );
    config.auto_switch.enabled = true;
    let (mut orch, mut rx) = orchestrator(config);
    orch.start_task_execution(TaskExecutionRequest::new(TASK, project.path.clone(), SPEC_ID))
        .await
        .unwrap();
    settle(&mut orch).await;

    assert_eq!(project.read("config_dirs.txt").lines().count(), 3);

    let notifications = drain(&mut rx);
    let targets: Vec<String> = notifications
        .iter()
        .filter_map(|n| match n {
            Notification::ProfileSwapped { to_profile, .. } => Some(to_profile.id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(targets, vec!["b".to_string(), "c".to_string()]);

    let exits = notifications
        .iter()
        .filter(|n| matches!(n, Notification::ProcessExit { .. }))
        .count();
    assert_eq!(exits, 3);
    assert!(notifications.iter().any(|n| matches!(
        n,
        Notification::Error { message, .. } if message.contains("swap budget")
    )));
    assert!(orch.context(TASK).is_none());
}

/// Test: Auth failures only swap to authenticated profiles
/// Given an alternate profile that is not authenticated
/// When the worker fails with an invalid API key
/// Then no swap happens and the auth failure is reported
#[tokio::test]
async fn test_auth_failure_without_authenticated_alternate() {
    let project = TestProject::new();
    let mut config = config(
        "echo 'Error: Invalid API key'; exit 1",
        vec![profile("a", true), profile("b", false)],
    );
    config.auto_switch.enabled = true;
    let (mut orch, mut rx) = orchestrator(config);
    orch.start_task_execution(TaskExecutionRequest::new(TASK, project.path.clone(), SPEC_ID))
        .await
        .unwrap();
    settle(&mut orch).await;

    let notifications = drain(&mut rx);
    assert!(notifications
        .iter()
        .any(|n| matches!(n, Notification::AuthFailureDetected { .. })));
    assert!(!notifications
        .iter()
        .any(|n| matches!(n, Notification::ProfileSwapped { .. })));
    assert!(!notifications
        .iter()
        .any(|n| matches!(n, Notification::Error { .. })));
    assert_eq!(orch.states().current_phase(TASK), ExecutionPhase::Failed);
}

/// Test: Auto-switch disabled
/// Given auto-switching turned off
/// When the worker is rate-limited
/// Then the detection is surfaced without a restart
#[tokio::test]
async fn test_rate_limit_with_switching_disabled() {
    let project = TestProject::new();
    let config = config(
        ALWAYS_RATE_LIMITED,
        vec![profile("a", true), profile("b", true)],
    );
    let (mut orch, mut rx) = orchestrator(config);
    orch.start_task_execution(TaskExecutionRequest::new(TASK, project.path.clone(), SPEC_ID))
        .await
        .unwrap();
    settle(&mut orch).await;

    assert_eq!(project.read("config_dirs.txt").lines().count(), 1);
    let notifications = drain(&mut rx);
    let detection = notifications
        .iter()
        .find_map(|n| match n {
            Notification::RateLimitDetected { detection, .. } => Some(detection.clone()),
            _ => None,
        })
        .expect("rate limit not reported");
    assert_eq!(detection.profile_id.as_deref(), Some("a"));
    assert_eq!(detection.reset_time.as_deref(), Some("5pm"));
    assert_eq!(
        detection.suggested_profile.map(|p| p.id),
        Some("b".to_string())
    );
}

/// Test: Unrecovered rate limit while coding
/// Given a single profile, switching off and a worker rate-limited mid-coding
/// When the worker exits
/// Then the task errors with the detection message and no generic error is sent
#[tokio::test]
async fn test_unrecovered_rate_limit_errors_with_detection_message() {
    let project = TestProject::new();
    let script = echo_script(
        &[event_line(TASK, "CODING_STARTED", 1, json!({}))],
        "echo 'Limit reached · resets 5pm'\nexit 1",
    );
    let (mut orch, mut rx) = orchestrator(config(&script, vec![profile("a", true)]));
    orch.start_task_execution(TaskExecutionRequest::new(TASK, project.path.clone(), SPEC_ID))
        .await
        .unwrap();
    settle(&mut orch).await;

    let notifications = drain(&mut rx);
    let detection = notifications
        .iter()
        .find_map(|n| match n {
            Notification::RateLimitDetected { detection, .. } => Some(detection.clone()),
            _ => None,
        })
        .expect("rate limit not reported");
    assert!(!notifications
        .iter()
        .any(|n| matches!(n, Notification::Error { .. })));

    let snapshot = orch.states().snapshot(TASK).unwrap();
    assert_eq!(snapshot.state, TaskState::Error);
    assert_eq!(
        snapshot.context.error.as_deref(),
        Some(detection.message.as_str())
    );
    assert_eq!(orch.states().current_phase(TASK), ExecutionPhase::Failed);
    assert_eq!(project.plan()["reviewReason"], "errors");
}
