//! Task supervision: start workers, track their state, and fail over
//! between credential profiles when a provider refuses the work.

pub mod context;
mod core;
pub mod failover;

pub use self::core::Orchestrator;
pub use context::{
    AssignmentReason, Launch, ProfileAssignment, SpecCreationRequest, TaskExecutionContext,
    TaskExecutionRequest,
};
pub use failover::{decide, switch_enabled, FailoverDecision};
