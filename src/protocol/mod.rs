//! Worker output protocol.
//!
//! Each output line may carry a structured task event, a structured phase
//! marker, or free-form log text. Parsing never fails the stream: anything
//! unrecognised is dropped with a debug trace.

pub mod events;
pub mod phase;

pub use events::{extract_json_object, parse_task_event, TaskEvent, TASK_EVENT_MARKER};
pub use phase::{
    parse_structured_phase, ExecutionPhase, PhaseSource, PhaseTracker, PhaseUpdate,
    PHASE_MARKER,
};
