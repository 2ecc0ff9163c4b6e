//! Spec creation integration tests.

use warden::locator::SpecLocator;
use warden::SpecCreationRequest;

use crate::fixtures::{config, orchestrator, path_str, settle, TestProject};

const ARGS_SCRIPT: &str = r#"printf '%s\n' "$@" > args.txt
echo "$WARDEN_TASK_ID" > task_id.txt
exit 0"#;

/// Test: Spec creation allocates the next numbered directory
/// Given a project that already has spec 001
/// When a spec is created from a description
/// Then directory 002-<slug> is created and handed to the worker
#[tokio::test]
async fn test_spec_creation_allocates_next_number() {
    let project = TestProject::new();
    let (mut orch, _rx) = orchestrator(config(ARGS_SCRIPT, vec![]));
    orch.start_spec_creation(SpecCreationRequest::new(
        "task-9",
        project.path.clone(),
        "Add a login page!",
    ))
    .await
    .unwrap();
    settle(&mut orch).await;

    let spec_dir = SpecLocator::new(&project.path).spec_dir("002-add-a-login-page");
    assert!(spec_dir.is_dir());

    let args: Vec<String> = project.read("args.txt").lines().map(String::from).collect();
    let flag = args.iter().position(|a| a == "--spec-dir").unwrap();
    assert_eq!(args[flag + 1], path_str(&spec_dir));
    let task = args.iter().position(|a| a == "--task").unwrap();
    assert_eq!(args[task + 1], "Add a login page!");
    assert_eq!(project.read("task_id.txt").trim(), "task-9");
}

/// Test: Empty descriptions are rejected before anything is allocated
#[tokio::test]
async fn test_spec_creation_rejects_empty_description() {
    let project = TestProject::new();
    let (mut orch, _rx) = orchestrator(config(ARGS_SCRIPT, vec![]));
    let result = orch
        .start_spec_creation(SpecCreationRequest::new("task-9", project.path.clone(), "  "))
        .await;

    assert!(result.is_err());
    assert!(!SpecLocator::new(&project.path)
        .spec_dir("002-task")
        .exists());
}
