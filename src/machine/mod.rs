//! Task lifecycle state machine.
//!
//! Transitions are computed by a pure function over explicit state and
//! event enums; `TaskStateManager` owns the per-task machines and performs
//! the persistence and notification effects each transition returns.

pub mod manager;
pub mod rehydrate;
pub mod states;
pub mod transition;

pub use manager::{EventOutcome, TaskStateManager, TaskTarget, UserAction};
pub use rehydrate::{execution_phase_for, persisted_state, rehydrate, rehydrate_plan, status_for};
pub use states::{
    MachineEvent, ReviewReason, TaskContext, TaskSnapshot, TaskState, TaskStatus,
    TERMINAL_EVENT_TYPES,
};
pub use transition::{replay, transition, Effect, Transition};
