use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt document at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Failed to spawn worker for task {task_id}: {message}")]
    Spawn { task_id: String, message: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("No execution context for task {0}")]
    ContextNotFound(String),

    #[error("Task {task_id} exhausted its profile swap budget (max: {max})")]
    SwapBudgetExhausted { task_id: String, max: u32 },

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// True for "the file does not exist", which most plan readers treat as
    /// "no persisted state yet" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Error::Storage { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
