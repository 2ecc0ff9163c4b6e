//! Spawning, tracking and killing worker processes.
//!
//! A task has at most one live worker. The record for a spawn is
//! registered synchronously, before any await, so a `kill` that arrives
//! while the environment is still being assembled finds it. Every spawn has
//! a unique spawn id; killed ids go into a set that both the spawn path and
//! the exit path consult, so a cancelled spawn never starts reading output
//! and a deliberate kill is never mistaken for a failure.

use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::env::build_worker_env;
use super::line_buffer::LineBuffer;
use super::{OutputStream, ProcessMessage, ProcessType};
use crate::profiles::ProfileStore;
use crate::{wlog, wlog_debug, wlog_error, wlog_warn, Error, Result};

const READ_CHUNK: usize = 8192;
/// How long the exit path waits for pipe readers after the child is gone.
const READER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_id: String,
    pub process_type: ProcessType,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub cwd: PathBuf,
    /// Per-spawn overrides layered over the inherited environment.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Started { spawn_id: u64, pid: Option<u32> },
    /// Killed while the environment was being prepared. The child, if it
    /// got as far as starting, has been terminated and reaped.
    Cancelled { spawn_id: u64 },
}

/// How an exit should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// The process was killed on purpose. Not a failure.
    Killed,
    /// The process ended on its own.
    Natural,
}

#[derive(Debug, Clone)]
struct ProcessHandle {
    pid: Option<u32>,
    /// Cancelled by the waiter once the child has been reaped.
    exited: CancellationToken,
    /// Cancelled to make the waiter hard-kill the child.
    force_kill: CancellationToken,
}

#[derive(Debug)]
struct ProcessRecord {
    spawn_id: u64,
    /// `None` between spawn intent and the OS process existing.
    handle: Option<ProcessHandle>,
}

#[derive(Debug, Default)]
struct Registry {
    records: HashMap<String, ProcessRecord>,
    killed: HashSet<u64>,
    next_spawn_id: u64,
}

#[derive(Clone)]
pub struct ProcessManager {
    registry: Arc<Mutex<Registry>>,
    events: mpsc::UnboundedSender<ProcessMessage>,
    profiles: Arc<dyn ProfileStore>,
    kill_grace: Duration,
}

impl ProcessManager {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        kill_grace: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ProcessMessage>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            events,
            profiles,
            kill_grace,
        };
        (manager, rx)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.registry().records.contains_key(task_id)
    }

    pub fn spawn_id_of(&self, task_id: &str) -> Option<u64> {
        self.registry().records.get(task_id).map(|r| r.spawn_id)
    }

    pub fn running_count(&self) -> usize {
        self.registry().records.len()
    }

    /// Remove the record only if it still belongs to `spawn_id`.
    fn forget_spawn(&self, task_id: &str, spawn_id: u64) {
        let mut registry = self.registry();
        if registry.records.get(task_id).map(|r| r.spawn_id) == Some(spawn_id) {
            registry.records.remove(task_id);
        }
    }

    /// Start a worker for `req.task_id`, killing any worker it already has.
    pub async fn spawn(&self, req: SpawnRequest) -> Result<SpawnOutcome> {
        let Some((program, args)) = req.command.split_first() else {
            return Err(Error::Validation(format!(
                "empty command for task {}",
                req.task_id
            )));
        };

        if self.is_running(&req.task_id) {
            wlog!("task {} already has a worker, killing it first", req.task_id);
            self.kill(&req.task_id).await;
        }

        let spawn_id = {
            let mut registry = self.registry();
            registry.next_spawn_id += 1;
            let spawn_id = registry.next_spawn_id;
            registry.records.insert(
                req.task_id.clone(),
                ProcessRecord {
                    spawn_id,
                    handle: None,
                },
            );
            spawn_id
        };

        let env = match build_worker_env(self.profiles.as_ref(), &req.env).await {
            Ok(env) => env,
            Err(e) => {
                self.forget_spawn(&req.task_id, spawn_id);
                self.registry().killed.remove(&spawn_id);
                return Err(Error::Spawn {
                    task_id: req.task_id.clone(),
                    message: format!("environment setup failed: {}", e),
                });
            }
        };

        let mut child = match Command::new(program)
            .args(args)
            .current_dir(&req.cwd)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.forget_spawn(&req.task_id, spawn_id);
                self.registry().killed.remove(&spawn_id);
                wlog_error!("failed to spawn {} for task {}: {}", program, req.task_id, e);
                return Err(Error::Spawn {
                    task_id: req.task_id.clone(),
                    message: e.to_string(),
                });
            }
        };

        let pid = child.id();
        let handle = ProcessHandle {
            pid,
            exited: CancellationToken::new(),
            force_kill: CancellationToken::new(),
        };

        let cancelled = {
            let mut registry = self.registry();
            let was_killed = registry.killed.remove(&spawn_id);
            match registry.records.get_mut(&req.task_id) {
                Some(record) if record.spawn_id == spawn_id && !was_killed => {
                    record.handle = Some(handle.clone());
                    false
                }
                _ => true,
            }
        };

        if cancelled {
            wlog!(
                "task {} was killed during spawn {}, terminating pid {:?}",
                req.task_id,
                spawn_id,
                pid
            );
            if let Err(e) = child.start_kill() {
                wlog_debug!("start_kill after cancelled spawn: {}", e);
            }
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Ok(SpawnOutcome::Cancelled { spawn_id });
        }

        wlog!(
            "spawned {:?} worker for task {} (spawn {}, pid {:?})",
            req.process_type,
            req.task_id,
            spawn_id,
            pid
        );
        self.wire(child, &req, spawn_id, handle);
        Ok(SpawnOutcome::Started { spawn_id, pid })
    }

    fn wire(&self, mut child: Child, req: &SpawnRequest, spawn_id: u64, handle: ProcessHandle) {
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                stdout,
                req.task_id.clone(),
                spawn_id,
                OutputStream::Stdout,
                self.events.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                stderr,
                req.task_id.clone(),
                spawn_id,
                OutputStream::Stderr,
                self.events.clone(),
            ));
        }

        let events = self.events.clone();
        let task_id = req.task_id.clone();
        let process_type = req.process_type;
        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = handle.force_kill.cancelled() => None,
            };
            let status = match waited {
                Some(status) => status,
                None => {
                    wlog_warn!("force killing worker for task {}", task_id);
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let exit_code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    wlog_error!("waiting on worker for task {} failed: {}", task_id, e);
                    None
                }
            };
            if timeout(READER_DRAIN, join_all(readers)).await.is_err() {
                wlog_debug!("output readers for task {} did not drain", task_id);
            }
            handle.exited.cancel();
            let _ = events.send(ProcessMessage::Exited {
                task_id,
                spawn_id,
                process_type,
                exit_code,
            });
        });
    }

    /// Kill the task's worker. Safe to call at any point, including while
    /// its spawn is still in flight. Returns whether anything was tracked.
    pub async fn kill(&self, task_id: &str) -> bool {
        let record = {
            let mut registry = self.registry();
            let Some(record) = registry.records.remove(task_id) else {
                return false;
            };
            registry.killed.insert(record.spawn_id);
            record
        };

        let Some(handle) = record.handle else {
            wlog!(
                "task {} killed before its process started (spawn {})",
                task_id,
                record.spawn_id
            );
            return true;
        };

        terminate(&handle, self.kill_grace).await;
        wlog!("killed worker for task {} (spawn {})", task_id, record.spawn_id);
        true
    }

    /// Kill every tracked worker concurrently, giving each at most `limit`.
    pub async fn kill_all(&self, limit: Duration) -> usize {
        let task_ids: Vec<String> = self.registry().records.keys().cloned().collect();
        let results = join_all(task_ids.iter().map(|task_id| async move {
            match timeout(limit, self.kill(task_id)).await {
                Ok(killed) => killed,
                Err(_) => {
                    wlog_warn!("timed out killing worker for task {}", task_id);
                    false
                }
            }
        }))
        .await;
        results.into_iter().filter(|killed| *killed).count()
    }

    /// Account for an exit reported by a waiter.
    pub fn on_exit(&self, task_id: &str, spawn_id: u64) -> ExitDisposition {
        self.forget_spawn(task_id, spawn_id);
        if self.registry().killed.remove(&spawn_id) {
            ExitDisposition::Killed
        } else {
            ExitDisposition::Natural
        }
    }
}

fn spawn_reader<R>(
    mut reader: R,
    task_id: String,
    spawn_id: u64,
    stream: OutputStream,
    events: mpsc::UnboundedSender<ProcessMessage>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut lines = LineBuffer::new();
        let send = |line: String| {
            let _ = events.send(ProcessMessage::Output {
                task_id: task_id.clone(),
                spawn_id,
                stream,
                line,
            });
        };
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => lines.push(&chunk[..n]).into_iter().for_each(&send),
                Err(e) => {
                    wlog_debug!("{:?} read for task {} failed: {}", stream, task_id, e);
                    break;
                }
            }
        }
        if let Some(rest) = lines.finish() {
            send(rest);
        }
    })
}

#[cfg(unix)]
fn request_stop(handle: &ProcessHandle) {
    match handle.pid {
        // SAFETY: plain signal delivery to a pid we spawned.
        Some(pid) => unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        },
        None => handle.force_kill.cancel(),
    }
}

#[cfg(not(unix))]
fn request_stop(handle: &ProcessHandle) {
    handle.force_kill.cancel();
}

/// Ask politely, wait out the grace period, then force.
async fn terminate(handle: &ProcessHandle, grace: Duration) {
    if handle.exited.is_cancelled() {
        return;
    }
    request_stop(handle);
    if timeout(grace, handle.exited.cancelled()).await.is_ok() {
        return;
    }
    handle.force_kill.cancel();
    if timeout(READER_DRAIN + grace, handle.exited.cancelled())
        .await
        .is_err()
    {
        wlog_warn!("worker pid {:?} did not exit after force kill", handle.pid);
    }
}
