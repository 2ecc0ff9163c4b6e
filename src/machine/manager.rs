use std::collections::HashMap;
use std::path::Path;

use super::rehydrate::{persisted_state, rehydrate_plan};
use super::states::{
    is_terminal_event_type, is_work_started_event_type, MachineEvent, TaskSnapshot,
};
use super::transition::{transition, Effect, Transition};
use super::TaskState;
use crate::locator::{PlanPaths, SpecLocator};
use crate::notify::{ExecutionProgress, Notification, Notifier};
use crate::protocol::{ExecutionPhase, PhaseSource, PhaseTracker, PhaseUpdate, TaskEvent};
use crate::store::{LastEvent, PersistedState, PlanStore};
use crate::{wlog, wlog_debug, wlog_error};

/// Where a task's machine lives and persists.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTarget {
    pub task_id: String,
    /// `None` for runs that have no plan yet (spec creation before a spec
    /// directory exists). Such tasks are tracked in memory only.
    pub plan_paths: Option<PlanPaths>,
}

impl TaskTarget {
    pub fn new(task_id: impl Into<String>, plan_paths: Option<PlanPaths>) -> Self {
        Self {
            task_id: task_id.into(),
            plan_paths,
        }
    }

    pub fn for_spec(task_id: impl Into<String>, project_dir: &Path, spec_id: &str) -> Self {
        let paths = SpecLocator::new(project_dir).plan_paths(spec_id);
        Self::new(task_id, Some(paths))
    }
}

/// Actions a user can take on a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    ApprovePlan,
    Resume,
    Stop,
    RestartPlanning,
    CreatePr,
    PrCreated,
    PrFailed(String),
    MarkDone,
}

impl UserAction {
    fn machine_event(&self) -> MachineEvent {
        match self {
            UserAction::ApprovePlan => MachineEvent::PlanApproved,
            UserAction::Resume => MachineEvent::UserResumed,
            UserAction::Stop => MachineEvent::UserStopped,
            UserAction::RestartPlanning => MachineEvent::PlanningStarted,
            UserAction::CreatePr => MachineEvent::CreatePr,
            UserAction::PrCreated => MachineEvent::PrCreated,
            UserAction::PrFailed(error) => MachineEvent::PrFailed {
                error: error.clone(),
            },
            UserAction::MarkDone => MachineEvent::MarkDone,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Transitioned { from: TaskState, to: TaskState },
    /// The current state has no transition for the event.
    Unhandled,
    /// Accepted but carries no state change (`SUBTASK_*` and friends).
    Informational,
    /// Sequence lower than the last accepted one.
    Stale { last_sequence: u64 },
    /// A terminal event was already seen, so the exit was not dispatched.
    Suppressed { terminal_event: String },
}

struct TaskEntry {
    snapshot: Option<TaskSnapshot>,
    last_sequence: Option<u64>,
    terminal_event: Option<String>,
    phases: PhaseTracker,
    last_overall: Option<u8>,
}

impl TaskEntry {
    fn new() -> Self {
        Self {
            snapshot: None,
            last_sequence: None,
            terminal_event: None,
            phases: PhaseTracker::new(false),
            last_overall: None,
        }
    }
}

/// Owns one state machine and one phase tracker per task, and applies the
/// effects of every transition.
pub struct TaskStateManager {
    tasks: HashMap<String, TaskEntry>,
    store: PlanStore,
    notifier: Notifier,
}

impl TaskStateManager {
    pub fn new(store: PlanStore, notifier: Notifier) -> Self {
        Self {
            tasks: HashMap::new(),
            store,
            notifier,
        }
    }

    fn entry(&mut self, task_id: &str) -> &mut TaskEntry {
        self.tasks
            .entry(task_id.to_string())
            .or_insert_with(TaskEntry::new)
    }

    pub fn snapshot(&self, task_id: &str) -> Option<&TaskSnapshot> {
        self.tasks.get(task_id)?.snapshot.as_ref()
    }

    pub fn terminal_event(&self, task_id: &str) -> Option<&str> {
        self.tasks.get(task_id)?.terminal_event.as_deref()
    }

    pub fn last_sequence(&self, task_id: &str) -> Option<u64> {
        self.tasks.get(task_id)?.last_sequence
    }

    pub fn current_phase(&self, task_id: &str) -> ExecutionPhase {
        self.tasks
            .get(task_id)
            .map(|e| e.phases.current())
            .unwrap_or(ExecutionPhase::Idle)
    }

    /// Prepare for a freshly spawned worker: restart phase tracking and
    /// re-arm exit handling. Machine state and the sequence gate survive.
    pub fn begin_run(&mut self, task_id: &str, is_spec_runner: bool) {
        let entry = self.entry(task_id);
        entry.phases.restart(is_spec_runner);
        entry.terminal_event = None;
    }

    /// Drop the sequence gate so a new worker run may start counting from
    /// zero again.
    pub fn reset_sequence(&mut self, task_id: &str) {
        if let Some(entry) = self.tasks.get_mut(task_id) {
            entry.last_sequence = None;
        }
    }

    fn progress_from(
        entry: &mut TaskEntry,
        update: PhaseUpdate,
        sequence: u64,
    ) -> ExecutionProgress {
        let overall = update.phase.overall_progress().or(entry.last_overall);
        entry.last_overall = overall;
        ExecutionProgress {
            phase: update.phase,
            message: update.message,
            phase_progress: update.progress,
            overall_progress: overall,
            current_subtask: update.subtask,
            reset_timestamp: update.reset_timestamp,
            profile_id: update.profile_id,
            source: update.source,
            sequence,
        }
    }

    fn emit_progress(&self, task_id: &str, progress: ExecutionProgress) {
        self.notifier.send(Notification::ExecutionProgress {
            task_id: task_id.to_string(),
            progress,
        });
    }

    /// Feed a plain output line to the task's phase tracker and forward any
    /// accepted phase change.
    pub fn observe_output(&mut self, task_id: &str, line: &str) -> Option<ExecutionProgress> {
        let entry = self.entry(task_id);
        let (update, sequence) = entry.phases.observe(line)?;
        let progress = Self::progress_from(entry, update, sequence);
        self.emit_progress(task_id, progress.clone());
        Some(progress)
    }

    /// Force a phase decided by the supervisor itself.
    pub fn force_phase(
        &mut self,
        task_id: &str,
        phase: ExecutionPhase,
        message: impl Into<String>,
    ) -> ExecutionProgress {
        let entry = self.entry(task_id);
        let sequence = entry.phases.force(phase);
        let update = PhaseUpdate {
            phase,
            message: message.into(),
            progress: None,
            subtask: None,
            reset_timestamp: None,
            profile_id: None,
            source: PhaseSource::Synthetic,
        };
        let progress = Self::progress_from(entry, update, sequence);
        self.emit_progress(task_id, progress.clone());
        progress
    }

    /// Current snapshot, rehydrating from the primary plan when no live
    /// machine exists.
    async fn load(&mut self, target: &TaskTarget) -> TaskSnapshot {
        if let Some(snapshot) = self.snapshot(&target.task_id) {
            return snapshot.clone();
        }
        let snapshot = match &target.plan_paths {
            Some(paths) => match self.store.read(&paths.primary).await {
                Ok(Some(plan)) => {
                    let snapshot = rehydrate_plan(&plan);
                    wlog_debug!(
                        "rehydrated task {} as {} from {}",
                        target.task_id,
                        snapshot.state,
                        paths.primary.display()
                    );
                    snapshot
                }
                Ok(None) => TaskSnapshot::default(),
                Err(e) => {
                    wlog_error!(
                        "cannot rehydrate task {} from {}: {}",
                        target.task_id,
                        paths.primary.display(),
                        e
                    );
                    TaskSnapshot::default()
                }
            },
            None => TaskSnapshot::default(),
        };
        self.entry(&target.task_id).snapshot = Some(snapshot.clone());
        snapshot
    }

    async fn persist(&self, target: &TaskTarget, state: &PersistedState) {
        let Some(paths) = &target.plan_paths else {
            return;
        };
        // The primary plan is created on demand; a worktree copy only
        // receives updates once the worker has written it.
        let writes = [(&paths.primary, true)]
            .into_iter()
            .chain(paths.worktree.iter().map(|p| (p, false)));
        for (path, create) in writes {
            if let Err(e) = self.store.persist_state(path, state, create).await {
                wlog_error!(
                    "failed to persist task {} to {}: {}",
                    target.task_id,
                    path.display(),
                    e
                );
                self.notifier.error(
                    &target.task_id,
                    format!("Failed to save task state: {}", e),
                );
            }
        }
    }

    async fn apply_effects(
        &mut self,
        target: &TaskTarget,
        t: &Transition,
        last_event: Option<LastEvent>,
    ) {
        for effect in &t.effects {
            match effect {
                Effect::Persist => {
                    let mut state = persisted_state(&t.snapshot);
                    state.last_event = last_event.clone();
                    self.persist(target, &state).await;
                }
                Effect::NotifyStatus {
                    status,
                    review_reason,
                } => self.notifier.send(Notification::StatusChanged {
                    task_id: target.task_id.clone(),
                    state: t.snapshot.state,
                    status: *status,
                    review_reason: *review_reason,
                }),
                Effect::NotifyProgress { phase } => {
                    let message = t
                        .snapshot
                        .context
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("Task is now {}", t.snapshot.state));
                    self.force_phase(&target.task_id, *phase, message);
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        target: &TaskTarget,
        event: MachineEvent,
        last_event: Option<LastEvent>,
    ) -> EventOutcome {
        let snapshot = self.load(target).await;
        let Some(t) = transition(&snapshot, &event) else {
            wlog_debug!(
                "task {} ignores {} in state {}",
                target.task_id,
                event.name(),
                snapshot.state
            );
            return EventOutcome::Unhandled;
        };
        wlog!(
            "task {}: {} --{}--> {}",
            target.task_id,
            t.from,
            event.name(),
            t.snapshot.state
        );
        self.entry(&target.task_id).snapshot = Some(t.snapshot.clone());
        self.apply_effects(target, &t, last_event).await;
        EventOutcome::Transitioned {
            from: t.from,
            to: t.snapshot.state,
        }
    }

    /// Handle a structured worker event.
    pub async fn handle_task_event(
        &mut self,
        target: &TaskTarget,
        event: &TaskEvent,
    ) -> EventOutcome {
        let entry = self.entry(&target.task_id);
        if let Some(last) = entry.last_sequence {
            if event.sequence < last {
                wlog_debug!(
                    "dropping stale {} for task {} (seq {} < {})",
                    event.event_type,
                    target.task_id,
                    event.sequence,
                    last
                );
                return EventOutcome::Stale {
                    last_sequence: last,
                };
            }
        }
        entry.last_sequence = Some(event.sequence);

        if is_terminal_event_type(&event.event_type) {
            entry.terminal_event = Some(event.event_type.clone());
        } else if is_work_started_event_type(&event.event_type) {
            entry.terminal_event = None;
        }

        match MachineEvent::from_task_event(event) {
            Some(machine_event) => {
                self.dispatch(target, machine_event, Some(event.last_event()))
                    .await
            }
            None => EventOutcome::Informational,
        }
    }

    /// Interpret a worker exit. Exits after a terminal event are never
    /// dispatched, whatever the code. `reason` replaces the exit-code text
    /// as the task error when the failure was classified.
    pub async fn handle_process_exit(
        &mut self,
        target: &TaskTarget,
        exit_code: Option<i32>,
        reason: Option<String>,
    ) -> EventOutcome {
        if let Some(terminal) = self.terminal_event(&target.task_id) {
            wlog_debug!(
                "task {} exited after {}, not dispatching exit",
                target.task_id,
                terminal
            );
            return EventOutcome::Suppressed {
                terminal_event: terminal.to_string(),
            };
        }
        let event = MachineEvent::ProcessExited {
            exit_code,
            unexpected: exit_code != Some(0),
            reason,
        };
        self.dispatch(target, event, None).await
    }

    pub async fn handle_user_action(
        &mut self,
        target: &TaskTarget,
        action: &UserAction,
    ) -> EventOutcome {
        self.dispatch(target, action.machine_event(), None).await
    }
}
