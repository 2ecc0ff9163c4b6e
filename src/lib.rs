pub mod config;
pub mod detect;
pub mod error;
pub mod locator;
pub mod log;
pub mod machine;
pub mod notify;
pub mod orchestrator;
pub mod process;
pub mod profiles;
pub mod protocol;
pub mod store;
pub mod util;

pub use error::{Error, Result};
pub use notify::{Notification, Notifier};
pub use orchestrator::{Orchestrator, SpecCreationRequest, TaskExecutionRequest};
