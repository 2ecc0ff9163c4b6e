//! The on-disk plan document and the targeted updates the supervisor makes
//! to it.
//!
//! The worker writes most of the document; the supervisor only merges the
//! fields it owns. Unknown fields are carried through `extra` so a merge
//! never drops data the worker wrote.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use super::atomic::{read_json, write_json_atomic, RetryPolicy};
use super::file_lock::FileLocks;
use crate::{wlog_debug, Result};

pub const SUBTASK_PENDING: &str = "pending";
pub const SUBTASK_IN_PROGRESS: &str = "in_progress";
pub const SUBTASK_COMPLETED: &str = "completed";
pub const SUBTASK_FAILED: &str = "failed";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_status: Option<String>,
    #[serde(default)]
    pub phases: Vec<PlanPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<LastEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xstate_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_reason: Option<String>,
    #[serde(default, rename = "updated_at", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, rename = "created_at", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanPhase {
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_subtask_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_subtask_status() -> String {
    SUBTASK_PENDING.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastEvent {
    pub event_id: String,
    pub sequence: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: String,
}

/// The state-machine snapshot the supervisor merges into a plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub status: String,
    pub review_reason: Option<String>,
    pub xstate_state: String,
    pub execution_phase: String,
    pub last_event: Option<LastEvent>,
}

impl PlanFile {
    pub fn subtasks(&self) -> impl Iterator<Item = &Subtask> {
        self.phases.iter().flat_map(|p| p.subtasks.iter())
    }

    pub fn apply_state(&mut self, state: &PersistedState) {
        self.status = Some(state.status.clone());
        self.plan_status = Some(state.status.clone());
        self.review_reason = state.review_reason.clone();
        self.xstate_state = Some(state.xstate_state.clone());
        self.execution_phase = Some(state.execution_phase.clone());
        if let Some(event) = &state.last_event {
            self.last_event = Some(event.clone());
        }
    }

    /// Put interrupted subtasks back to pending. Completed subtasks are never
    /// touched.
    pub fn reset_stuck_subtasks(&mut self) -> usize {
        let mut reset = 0;
        for subtask in self.phases.iter_mut().flat_map(|p| p.subtasks.iter_mut()) {
            if subtask.status == SUBTASK_IN_PROGRESS || subtask.status == SUBTASK_FAILED {
                subtask.status = SUBTASK_PENDING.to_string();
                subtask.started_at = None;
                subtask.completed_at = None;
                reset += 1;
            }
        }
        reset
    }
}

/// Serialized, atomic access to plan files.
#[derive(Clone, Default)]
pub struct PlanStore {
    locks: FileLocks,
    policy: RetryPolicy,
}

impl PlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            locks: FileLocks::new(),
            policy,
        }
    }

    pub async fn read(&self, path: &Path) -> Result<Option<PlanFile>> {
        read_json(path, self.policy).await
    }

    /// Re-read, modify and atomically rewrite a plan under its path lock.
    ///
    /// Returns `Ok(None)` without writing when the file is absent and
    /// `create_if_missing` is false.
    pub async fn update<F>(
        &self,
        path: &Path,
        create_if_missing: bool,
        modify: F,
    ) -> Result<Option<PlanFile>>
    where
        F: FnOnce(&mut PlanFile),
    {
        self.locks
            .with_lock(path, move || async move {
                let now = Utc::now().to_rfc3339();
                let mut plan = match read_json::<PlanFile>(path, self.policy).await? {
                    Some(plan) => plan,
                    None if create_if_missing => PlanFile {
                        created_at: Some(now.clone()),
                        ..PlanFile::default()
                    },
                    None => return Ok(None),
                };
                modify(&mut plan);
                plan.updated_at = Some(now);
                write_json_atomic(path, &plan, self.policy).await?;
                Ok(Some(plan))
            })
            .await
    }

    pub async fn persist_state(
        &self,
        path: &Path,
        state: &PersistedState,
        create_if_missing: bool,
    ) -> Result<bool> {
        let written = self
            .update(path, create_if_missing, |plan| plan.apply_state(state))
            .await?;
        wlog_debug!(
            "persist_state path={} status={} state={} written={}",
            path.display(),
            state.status,
            state.xstate_state,
            written.is_some()
        );
        Ok(written.is_some())
    }

    pub async fn reset_stuck_subtasks(&self, path: &Path) -> Result<usize> {
        let mut reset = 0;
        self.update(path, false, |plan| reset = plan.reset_stuck_subtasks())
            .await?;
        if reset > 0 {
            wlog_debug!("reset {} stuck subtasks in {}", reset, path.display());
        }
        Ok(reset)
    }
}
