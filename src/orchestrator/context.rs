use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::locator::{PlanPaths, PLAN_FILE_NAME};
use crate::machine::TaskTarget;
use crate::process::ProcessType;
use crate::profiles::ProfileSummary;
use crate::protocol::TaskEvent;

/// Arguments for running the build worker against an existing spec.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskExecutionRequest {
    pub task_id: String,
    pub project_dir: PathBuf,
    pub spec_id: String,
    pub require_review_before_coding: bool,
    pub extra_args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl TaskExecutionRequest {
    pub fn new(
        task_id: impl Into<String>,
        project_dir: impl Into<PathBuf>,
        spec_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            project_dir: project_dir.into(),
            spec_id: spec_id.into(),
            require_review_before_coding: false,
            extra_args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

/// Arguments for running the spec-creation worker.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecCreationRequest {
    pub task_id: String,
    pub project_dir: PathBuf,
    pub description: String,
    /// Allocated on first launch when not given.
    pub spec_dir: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl SpecCreationRequest {
    pub fn new(
        task_id: impl Into<String>,
        project_dir: impl Into<PathBuf>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            project_dir: project_dir.into(),
            description: description.into(),
            spec_dir: None,
            extra_args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

/// The start operation a task was launched with, replayed on restart.
#[derive(Debug, Clone, PartialEq)]
pub enum Launch {
    TaskExecution(TaskExecutionRequest),
    SpecCreation(SpecCreationRequest),
}

impl Launch {
    pub fn task_id(&self) -> &str {
        match self {
            Launch::TaskExecution(r) => &r.task_id,
            Launch::SpecCreation(r) => &r.task_id,
        }
    }

    pub fn project_dir(&self) -> &PathBuf {
        match self {
            Launch::TaskExecution(r) => &r.project_dir,
            Launch::SpecCreation(r) => &r.project_dir,
        }
    }

    pub fn process_type(&self) -> ProcessType {
        match self {
            Launch::TaskExecution(_) => ProcessType::TaskExecution,
            Launch::SpecCreation(_) => ProcessType::SpecCreation,
        }
    }
}

/// Per-task supervisor bookkeeping that outlives individual workers.
#[derive(Debug, Clone)]
pub struct TaskExecutionContext {
    pub launch: Launch,
    pub swap_count: u32,
    /// Bumped on every (re)start so deferred work can tell whether it is
    /// stale.
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

impl TaskExecutionContext {
    pub fn new(launch: Launch, generation: u64) -> Self {
        Self {
            launch,
            swap_count: 0,
            generation,
            started_at: Utc::now(),
        }
    }

    pub fn task_id(&self) -> &str {
        self.launch.task_id()
    }

    pub fn target(&self) -> TaskTarget {
        match &self.launch {
            Launch::TaskExecution(r) => {
                TaskTarget::for_spec(r.task_id.clone(), &r.project_dir, &r.spec_id)
            }
            Launch::SpecCreation(r) => TaskTarget::new(
                r.task_id.clone(),
                r.spec_dir.as_ref().map(|dir| PlanPaths {
                    primary: dir.join(PLAN_FILE_NAME),
                    worktree: None,
                }),
            ),
        }
    }

    /// Target for a worker event. Spec-creation runs without a known spec
    /// directory learn it from the event's spec id.
    pub fn target_for_event(&self, event: &TaskEvent) -> TaskTarget {
        let target = self.target();
        if target.plan_paths.is_some() || event.spec_id.is_empty() {
            return target;
        }
        TaskTarget::for_spec(target.task_id, self.launch.project_dir(), &event.spec_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentReason {
    /// Picked when the task started.
    Proactive,
    /// Swapped in after a provider failure.
    Reactive,
    Manual,
}

/// Which credential profile a task is running under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileAssignment {
    pub profile_id: String,
    pub profile_name: String,
    pub reason: AssignmentReason,
    pub session_id: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

impl ProfileAssignment {
    pub fn new(profile: &ProfileSummary, reason: AssignmentReason) -> Self {
        Self {
            profile_id: profile.id.clone(),
            profile_name: profile.name.clone(),
            reason,
            session_id: None,
            assigned_at: Utc::now(),
        }
    }
}
