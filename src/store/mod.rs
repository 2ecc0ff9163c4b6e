//! Durable, crash-safe persistence of task state.
//!
//! Plans are written atomically (temp file + rename), transient OS errors are
//! retried with backoff, and read-modify-write sequences are serialized per
//! path. Spec numbers are allocated under a lock shared by the primary
//! checkout and its worktrees.

pub mod atomic;
pub mod file_lock;
pub mod numbering;
pub mod plan;

pub use atomic::{read_json, write_json_atomic, RetryPolicy};
pub use file_lock::FileLocks;
pub use numbering::SpecNumberLock;
pub use plan::{LastEvent, PersistedState, PlanFile, PlanStore};
