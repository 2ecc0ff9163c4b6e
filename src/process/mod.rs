//! Worker process lifecycle.

pub mod env;
pub mod line_buffer;
pub mod manager;

use serde::Serialize;

pub use line_buffer::{LineBuffer, OutputTail};
pub use manager::{ExitDisposition, ProcessManager, SpawnOutcome, SpawnRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    SpecCreation,
    TaskExecution,
}

impl ProcessType {
    pub fn is_spec_runner(&self) -> bool {
        matches!(self, ProcessType::SpecCreation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Messages from reader and waiter tasks to whoever drives the workers.
///
/// Output for a spawn is always delivered before that spawn's `Exited`.
#[derive(Debug, Clone)]
pub enum ProcessMessage {
    Output {
        task_id: String,
        spawn_id: u64,
        stream: OutputStream,
        line: String,
    },
    Exited {
        task_id: String,
        spawn_id: u64,
        process_type: ProcessType,
        /// `None` when the process was ended by a signal.
        exit_code: Option<i32>,
    },
}
