use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::context::{
    AssignmentReason, Launch, ProfileAssignment, SpecCreationRequest, TaskExecutionContext,
    TaskExecutionRequest,
};
use super::failover::{decide, FailoverDecision};
use crate::config::Config;
use crate::detect::{classify_failure, FailureDetection};
use crate::locator::SpecLocator;
use crate::machine::{EventOutcome, TaskStateManager, TaskTarget, UserAction};
use crate::notify::{Notification, Notifier};
use crate::process::{
    ExitDisposition, OutputStream, OutputTail, ProcessManager, ProcessMessage, ProcessType,
    SpawnOutcome, SpawnRequest,
};
use crate::profiles::ProfileStore;
use crate::protocol::{parse_task_event, ExecutionPhase};
use crate::store::{PlanStore, SpecNumberLock};
use crate::{util, wlog, wlog_debug, wlog_error, wlog_trace, wlog_warn, Error, Result};

const SLUG_MAX_LEN: usize = 48;

/// What became of a classified provider failure.
#[derive(Debug)]
enum Recovery {
    /// A profile swap was made and a restart is scheduled.
    Restarting,
    /// Reported to the user; carries the error text for the task.
    Surfaced(String),
}

/// Work the orchestrator schedules for itself.
#[derive(Debug)]
enum Deferred {
    Restart { task_id: String, generation: u64 },
    Cleanup { task_id: String, generation: u64 },
}

/// Drives workers for many tasks from a single event loop.
///
/// All task state is owned here and mutated only from [`Orchestrator::step`],
/// so per-task handling is strictly sequential.
pub struct Orchestrator {
    config: Config,
    profiles: Arc<dyn ProfileStore>,
    processes: ProcessManager,
    process_rx: mpsc::UnboundedReceiver<ProcessMessage>,
    deferred_tx: mpsc::UnboundedSender<Deferred>,
    deferred_rx: mpsc::UnboundedReceiver<Deferred>,
    pending_deferred: usize,
    states: TaskStateManager,
    store: PlanStore,
    notifier: Notifier,
    contexts: HashMap<String, TaskExecutionContext>,
    assignments: HashMap<String, ProfileAssignment>,
    tails: HashMap<String, OutputTail>,
    next_generation: u64,
}

impl Orchestrator {
    pub fn new(config: Config, profiles: Arc<dyn ProfileStore>, notifier: Notifier) -> Self {
        let (processes, process_rx) =
            ProcessManager::new(profiles.clone(), config.supervisor.kill_grace());
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        let store = PlanStore::new();
        Self {
            states: TaskStateManager::new(store.clone(), notifier.clone()),
            config,
            profiles,
            processes,
            process_rx,
            deferred_tx,
            deferred_rx,
            pending_deferred: 0,
            store,
            notifier,
            contexts: HashMap::new(),
            assignments: HashMap::new(),
            tails: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    pub fn states(&self) -> &TaskStateManager {
        &self.states
    }

    pub fn context(&self, task_id: &str) -> Option<&TaskExecutionContext> {
        self.contexts.get(task_id)
    }

    pub fn assignment(&self, task_id: &str) -> Option<&ProfileAssignment> {
        self.assignments.get(task_id)
    }

    /// Nothing running and nothing scheduled.
    pub fn is_idle(&self) -> bool {
        self.processes.running_count() == 0 && self.pending_deferred == 0
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Drop everything kept for a task between restarts.
    fn retire(&mut self, task_id: &str) {
        self.contexts.remove(task_id);
        self.tails.remove(task_id);
        self.assignments.remove(task_id);
    }

    fn target_for(&self, task_id: &str) -> TaskTarget {
        self.contexts
            .get(task_id)
            .map(|ctx| ctx.target())
            .unwrap_or_else(|| TaskTarget::new(task_id, None))
    }

    pub async fn start_task_execution(
        &mut self,
        req: TaskExecutionRequest,
    ) -> Result<SpawnOutcome> {
        let spec_dir = SpecLocator::new(&req.project_dir).spec_dir(&req.spec_id);
        if !spec_dir.is_dir() {
            return Err(Error::Validation(format!(
                "spec directory {} does not exist",
                spec_dir.display()
            )));
        }
        let task_id = req.task_id.clone();
        self.begin(Launch::TaskExecution(req)).await;
        self.launch(&task_id).await
    }

    pub async fn start_spec_creation(
        &mut self,
        mut req: SpecCreationRequest,
    ) -> Result<SpawnOutcome> {
        if req.description.trim().is_empty() {
            return Err(Error::Validation("task description is empty".to_string()));
        }
        if req.spec_dir.is_none() {
            let mut lock = SpecNumberLock::new(SpecLocator::new(&req.project_dir));
            lock.acquire().await?;
            let created = lock
                .create_spec_dir(&util::slugify(&req.description, SLUG_MAX_LEN))
                .await;
            lock.release().await;
            let (number, dir) = created?;
            wlog!("allocated spec {:03} at {}", number, dir.display());
            req.spec_dir = Some(dir);
        }
        let task_id = req.task_id.clone();
        self.begin(Launch::SpecCreation(req)).await;
        self.launch(&task_id).await
    }

    /// Fresh context for a user-initiated start.
    async fn begin(&mut self, launch: Launch) {
        let task_id = launch.task_id().to_string();
        let generation = self.bump_generation();
        self.contexts
            .insert(task_id.clone(), TaskExecutionContext::new(launch, generation));
        self.states.reset_sequence(&task_id);
        if let Some(profile) = self.profiles.active_profile().await {
            self.assignments.insert(
                task_id,
                ProfileAssignment::new(&profile, AssignmentReason::Proactive),
            );
        }
    }

    fn spawn_request(&self, ctx: &TaskExecutionContext) -> SpawnRequest {
        let mut env = std::collections::BTreeMap::new();
        env.insert("WARDEN_TASK_ID".to_string(), ctx.task_id().to_string());
        env.insert(
            "WARDEN_PROJECT_DIR".to_string(),
            ctx.launch.project_dir().to_string_lossy().into_owned(),
        );

        let (mut command, cwd) = match &ctx.launch {
            Launch::TaskExecution(r) => {
                let mut command = self.config.worker_command.clone();
                command.extend([
                    "--spec".to_string(),
                    r.spec_id.clone(),
                    "--project-dir".to_string(),
                    r.project_dir.to_string_lossy().into_owned(),
                    "--task-id".to_string(),
                    r.task_id.clone(),
                ]);
                if r.require_review_before_coding {
                    command.push("--require-review-before-coding".to_string());
                }
                command.extend(r.extra_args.iter().cloned());
                env.insert("WARDEN_SPEC_ID".to_string(), r.spec_id.clone());
                env.extend(r.env.clone());
                (command, r.project_dir.clone())
            }
            Launch::SpecCreation(r) => {
                let mut command = self.config.spec_command.clone();
                command.extend([
                    "--task".to_string(),
                    r.description.clone(),
                    "--project-dir".to_string(),
                    r.project_dir.to_string_lossy().into_owned(),
                    "--task-id".to_string(),
                    r.task_id.clone(),
                ]);
                if let Some(dir) = &r.spec_dir {
                    command.push("--spec-dir".to_string());
                    command.push(dir.to_string_lossy().into_owned());
                }
                command.extend(r.extra_args.iter().cloned());
                env.extend(r.env.clone());
                (command, r.project_dir.clone())
            }
        };
        SpawnRequest {
            task_id: ctx.task_id().to_string(),
            process_type: ctx.launch.process_type(),
            command,
            cwd,
            env,
        }
    }

    /// Spawn a worker from the task's stored context.
    async fn launch(&mut self, task_id: &str) -> Result<SpawnOutcome> {
        let ctx = self
            .contexts
            .get(task_id)
            .ok_or_else(|| Error::ContextNotFound(task_id.to_string()))?;
        let req = self.spawn_request(ctx);
        let process_type = req.process_type;

        self.states.begin_run(task_id, process_type.is_spec_runner());
        self.tails.insert(
            task_id.to_string(),
            OutputTail::new(self.config.supervisor.output_buffer_chars),
        );
        match self.processes.spawn(req).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                wlog_error!("could not start worker for task {}: {}", task_id, e);
                self.notifier.error(task_id, e.to_string());
                Err(e)
            }
        }
    }

    /// Kill the task's worker and record the stop.
    pub async fn stop_task(&mut self, target: &TaskTarget) -> EventOutcome {
        let task_id = target.task_id.as_str();
        self.retire(task_id);
        if self.processes.kill(task_id).await {
            wlog!("stopped task {}", task_id);
        }
        self.states
            .handle_user_action(target, &UserAction::Stop)
            .await
    }

    pub async fn user_action(&mut self, target: &TaskTarget, action: UserAction) -> EventOutcome {
        if action == UserAction::Stop {
            return self.stop_task(target).await;
        }
        self.states.handle_user_action(target, &action).await
    }

    pub async fn shutdown(&mut self) -> usize {
        let killed = self
            .processes
            .kill_all(self.config.supervisor.kill_all_timeout())
            .await;
        wlog!("shutdown killed {} workers", killed);
        killed
    }

    /// Handle one process message or deferred job.
    pub async fn step(&mut self) {
        tokio::select! {
            Some(message) = self.process_rx.recv() => self.handle_process_message(message).await,
            Some(job) = self.deferred_rx.recv() => {
                self.pending_deferred = self.pending_deferred.saturating_sub(1);
                self.handle_deferred(job).await;
            }
        }
    }

    /// Run until no worker is alive and nothing is scheduled.
    pub async fn run_until_idle(&mut self) {
        while !self.is_idle() {
            self.step().await;
        }
    }

    async fn handle_process_message(&mut self, message: ProcessMessage) {
        match message {
            ProcessMessage::Output {
                task_id,
                spawn_id,
                stream,
                line,
            } => self.handle_output(task_id, spawn_id, stream, line).await,
            ProcessMessage::Exited {
                task_id,
                spawn_id,
                process_type,
                exit_code,
            } => {
                self.handle_exit(task_id, spawn_id, process_type, exit_code)
                    .await
            }
        }
    }

    async fn handle_output(
        &mut self,
        task_id: String,
        spawn_id: u64,
        stream: OutputStream,
        line: String,
    ) {
        if self.processes.spawn_id_of(&task_id) != Some(spawn_id) {
            wlog_trace!("dropping output from retired spawn {} of {}", spawn_id, task_id);
            return;
        }
        if let Some(tail) = self.tails.get_mut(&task_id) {
            tail.push_line(&line);
        }

        if let Some(event) = parse_task_event(&line) {
            let target = match self.contexts.get(&task_id) {
                Some(ctx) => ctx.target_for_event(&event),
                None => TaskTarget::new(task_id.clone(), None),
            };
            self.notifier.send(Notification::TaskEvent {
                task_id: task_id.clone(),
                event: event.clone(),
            });
            let outcome = self.states.handle_task_event(&target, &event).await;
            wlog_debug!("task {} event {} -> {:?}", task_id, event.event_type, outcome);
        } else {
            self.states.observe_output(&task_id, &line);
        }

        self.notifier.send(Notification::Log {
            task_id,
            stream,
            line,
        });
    }

    async fn handle_exit(
        &mut self,
        task_id: String,
        spawn_id: u64,
        process_type: ProcessType,
        exit_code: Option<i32>,
    ) {
        if self.processes.on_exit(&task_id, spawn_id) == ExitDisposition::Killed {
            wlog_debug!("spawn {} of task {} was killed, ignoring exit", spawn_id, task_id);
            return;
        }
        wlog!(
            "{:?} worker for task {} exited with {:?}",
            process_type,
            task_id,
            exit_code
        );
        self.notifier.send(Notification::ProcessExit {
            task_id: task_id.clone(),
            process_type,
            exit_code,
        });
        if let Some(ctx) = self.contexts.get(&task_id) {
            let generation = ctx.generation;
            self.schedule(
                Deferred::Cleanup {
                    task_id: task_id.clone(),
                    generation,
                },
                self.config.supervisor.cleanup_delay(),
            );
        }

        if exit_code == Some(0) {
            return;
        }
        if let Some(terminal) = self.states.terminal_event(&task_id) {
            wlog!(
                "task {} already reported {}, not treating exit as a failure",
                task_id,
                terminal
            );
            return;
        }

        // Taken before failover, which may drop the context.
        let target = self.target_for(&task_id);
        let output = self
            .tails
            .get_mut(&task_id)
            .map(|tail| tail.contents().to_string())
            .unwrap_or_default();
        let profile_id = self.assignments.get(&task_id).map(|a| a.profile_id.clone());
        let reason = match classify_failure(&output, profile_id.as_deref(), self.profiles.as_ref())
            .await
        {
            Some(detection) => match self.recover(&task_id, detection).await {
                Recovery::Restarting => return,
                Recovery::Surfaced(reason) => Some(reason),
            },
            None => None,
        };

        let generic = match exit_code {
            Some(code) => format!("Worker exited with code {}", code),
            None => "Worker was terminated by a signal".to_string(),
        };
        let outcome = self
            .states
            .handle_process_exit(&target, exit_code, reason.clone())
            .await;
        if !matches!(outcome, EventOutcome::Transitioned { .. })
            && !self.states.current_phase(&task_id).is_terminal()
        {
            self.states.force_phase(
                &task_id,
                ExecutionPhase::Failed,
                reason.clone().unwrap_or_else(|| generic.clone()),
            );
        }
        // Classified failures were already reported with their own remediation.
        if reason.is_none() {
            self.notifier.error(&task_id, generic);
        }
    }

    /// Report a failure that will not be recovered automatically.
    fn surface(&self, task_id: &str, detection: FailureDetection) -> Recovery {
        let reason = detection.message().to_string();
        let task_id = task_id.to_string();
        self.notifier.send(match detection {
            FailureDetection::RateLimit(detection) => Notification::RateLimitDetected {
                task_id,
                detection,
            },
            FailureDetection::Auth(detection) => Notification::AuthFailureDetected {
                task_id,
                detection,
            },
            FailureDetection::Billing(detection) => Notification::BillingFailureDetected {
                task_id,
                detection,
            },
        });
        Recovery::Surfaced(reason)
    }

    /// Try to recover from a classified failure by swapping profiles.
    async fn recover(&mut self, task_id: &str, detection: FailureDetection) -> Recovery {
        let Some(swap_count) = self.contexts.get(task_id).map(|c| c.swap_count) else {
            return self.surface(task_id, detection);
        };
        let decision = decide(
            &self.config.auto_switch,
            self.config.supervisor.max_swaps,
            swap_count,
            &detection,
            self.profiles.as_ref(),
        )
        .await;
        wlog!(
            "task {} {} failure: {:?}",
            task_id,
            detection.category(),
            decision
        );

        match decision {
            FailoverDecision::Swap { to } => {
                if let Err(e) = self.profiles.set_active(&to.id).await {
                    wlog_error!("could not activate profile {}: {}", to.id, e);
                    return self.surface(task_id, detection);
                }
                let generation = self.bump_generation();
                let Some(ctx) = self.contexts.get_mut(task_id) else {
                    return self.surface(task_id, detection);
                };
                ctx.swap_count += 1;
                ctx.generation = generation;
                let swap_count = ctx.swap_count;

                self.assignments.insert(
                    task_id.to_string(),
                    ProfileAssignment::new(&to, AssignmentReason::Reactive),
                );
                self.notifier.send(Notification::ProfileSwapped {
                    task_id: task_id.to_string(),
                    reason: detection.category().to_string(),
                    from_profile: detection.profile_id().map(str::to_string),
                    to_profile: to,
                    swap_count,
                });
                self.processes.kill(task_id).await;
                self.schedule(
                    Deferred::Restart {
                        task_id: task_id.to_string(),
                        generation,
                    },
                    self.config.supervisor.restart_delay(),
                );
                Recovery::Restarting
            }
            FailoverDecision::BudgetExhausted { max } => {
                self.surface(task_id, detection);
                let err = Error::SwapBudgetExhausted {
                    task_id: task_id.to_string(),
                    max,
                };
                wlog_warn!("{}", err);
                self.notifier.error(task_id, err.to_string());
                self.retire(task_id);
                Recovery::Surfaced(err.to_string())
            }
            FailoverDecision::NoAlternate | FailoverDecision::Disabled => {
                self.surface(task_id, detection)
            }
        }
    }

    fn schedule(&mut self, job: Deferred, delay: Duration) {
        self.pending_deferred += 1;
        let tx = self.deferred_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(job);
        });
    }

    async fn handle_deferred(&mut self, job: Deferred) {
        match job {
            Deferred::Cleanup {
                task_id,
                generation,
            } => {
                let current = self.contexts.get(&task_id).map(|c| c.generation);
                if current != Some(generation) {
                    wlog_debug!(
                        "skipping stale cleanup for task {} (generation {} vs {:?})",
                        task_id,
                        generation,
                        current
                    );
                    return;
                }
                if self.processes.is_running(&task_id) {
                    return;
                }
                self.retire(&task_id);
                wlog_debug!("cleaned up context for task {}", task_id);
            }
            Deferred::Restart {
                task_id,
                generation,
            } => {
                let current = self.contexts.get(&task_id).map(|c| c.generation);
                if current != Some(generation) {
                    wlog_debug!("skipping superseded restart for task {}", task_id);
                    return;
                }
                if let Some(paths) = self.target_for(&task_id).plan_paths {
                    for path in paths.iter() {
                        if let Err(e) = self.store.reset_stuck_subtasks(path).await {
                            wlog_error!(
                                "could not reset subtasks in {}: {}",
                                path.display(),
                                e
                            );
                        }
                    }
                }
                wlog!("restarting task {} (generation {})", task_id, generation);
                if let Err(e) = self.launch(&task_id).await {
                    wlog_error!("restart of task {} failed: {}", task_id, e);
                }
            }
        }
    }
}
