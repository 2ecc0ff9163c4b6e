//! Execution-phase tracking from worker output.
//!
//! Structured `__EXEC_PHASE__:{...}` markers are authoritative. Plain log
//! lines are matched heuristically, but only ever move a task forward: a
//! stale planner line cannot pull a task that is already coding back into
//! planning.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use super::events::{extract_json_object, marker_payload};
use crate::wlog_debug;

pub const PHASE_MARKER: &str = "__EXEC_PHASE__:";

const MAX_MESSAGE_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Idle,
    Planning,
    Coding,
    RateLimitPaused,
    AuthFailurePaused,
    QaReview,
    QaFixing,
    Complete,
    Failed,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Idle => "idle",
            ExecutionPhase::Planning => "planning",
            ExecutionPhase::Coding => "coding",
            ExecutionPhase::RateLimitPaused => "rate_limit_paused",
            ExecutionPhase::AuthFailurePaused => "auth_failure_paused",
            ExecutionPhase::QaReview => "qa_review",
            ExecutionPhase::QaFixing => "qa_fixing",
            ExecutionPhase::Complete => "complete",
            ExecutionPhase::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }

    /// Position in the forward ordering. Pauses share coding's rank.
    pub fn order(&self) -> u8 {
        match self {
            ExecutionPhase::Idle => 0,
            ExecutionPhase::Planning => 1,
            ExecutionPhase::Coding
            | ExecutionPhase::RateLimitPaused
            | ExecutionPhase::AuthFailurePaused => 2,
            ExecutionPhase::QaReview => 3,
            ExecutionPhase::QaFixing => 4,
            ExecutionPhase::Complete | ExecutionPhase::Failed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionPhase::Complete | ExecutionPhase::Failed)
    }

    pub fn is_pause(&self) -> bool {
        matches!(
            self,
            ExecutionPhase::RateLimitPaused | ExecutionPhase::AuthFailurePaused
        )
    }

    /// Overall progress shown for the phase. Pauses report `None` and keep
    /// whatever progress was last shown.
    pub fn overall_progress(&self) -> Option<u8> {
        match self {
            ExecutionPhase::Idle => Some(0),
            ExecutionPhase::Planning => Some(10),
            ExecutionPhase::Coding => Some(40),
            ExecutionPhase::QaReview => Some(80),
            ExecutionPhase::QaFixing => Some(85),
            ExecutionPhase::Complete => Some(100),
            ExecutionPhase::Failed => Some(0),
            ExecutionPhase::RateLimitPaused | ExecutionPhase::AuthFailurePaused => None,
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSource {
    Structured,
    Fallback,
    /// Derived by the supervisor from a state transition or a process exit.
    Synthetic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseUpdate {
    pub phase: ExecutionPhase,
    pub message: String,
    pub progress: Option<u8>,
    pub subtask: Option<String>,
    /// Unix seconds at which a paused provider limit resets.
    pub reset_timestamp: Option<i64>,
    pub profile_id: Option<String>,
    pub source: PhaseSource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPhaseMarker {
    phase: ExecutionPhase,
    #[serde(default)]
    message: String,
    progress: Option<u8>,
    subtask: Option<String>,
    reset_timestamp: Option<i64>,
    profile_id: Option<String>,
}

/// Outcome of looking for a structured phase marker on a line.
#[derive(Debug, PartialEq)]
pub enum StructuredPhase {
    Absent,
    Invalid,
    Valid(PhaseUpdate),
}

pub fn parse_structured_phase(line: &str) -> StructuredPhase {
    let Some(payload) = marker_payload(line, PHASE_MARKER) else {
        return StructuredPhase::Absent;
    };
    let parsed = extract_json_object(payload)
        .ok_or_else(|| "no JSON object".to_string())
        .and_then(|json| {
            serde_json::from_str::<RawPhaseMarker>(json).map_err(|e| e.to_string())
        });
    match parsed {
        Ok(raw) => StructuredPhase::Valid(PhaseUpdate {
            phase: raw.phase,
            message: raw.message,
            progress: raw.progress.map(|p| p.min(100)),
            subtask: raw.subtask,
            reset_timestamp: raw.reset_timestamp,
            profile_id: raw.profile_id,
            source: PhaseSource::Structured,
        }),
        Err(e) => {
            wlog_debug!("dropping malformed phase marker: {}", e);
            StructuredPhase::Invalid
        }
    }
}

/// Heuristics for task-execution workers, most specific first.
static TASK_PATTERNS: LazyLock<Vec<(Regex, ExecutionPhase)>> = LazyLock::new(|| {
    [
        (
            r"(?i)\b(qa[ _-]?fixer|fixing qa issues|applying qa fixes)\b",
            ExecutionPhase::QaFixing,
        ),
        (
            r"(?i)\b(qa[ _-]?reviewer|starting qa|running qa|qa review)\b",
            ExecutionPhase::QaReview,
        ),
        (
            r"(?i)\b(build complete|all subtasks completed|qa approved)\b",
            ExecutionPhase::Complete,
        ),
        (
            r"(?i)\b(coder agent|coding agent|starting coder|implementing subtask|working on subtask)\b",
            ExecutionPhase::Coding,
        ),
        (
            r"(?i)\b(planner agent|planning phase|starting planner|creating implementation plan)\b",
            ExecutionPhase::Planning,
        ),
    ]
    .into_iter()
    .map(|(re, phase)| (Regex::new(re).expect("static regex"), phase))
    .collect()
});

/// Spec-creation workers never code or run QA, so their lines only ever
/// mean "planning".
static SPEC_RUNNER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(spec|discover\w*|requirements?|research\w*|context|complexity|critique|gathering)\b")
        .expect("static regex")
});

/// Candidate phase for a plain log line, without any ordering checks.
pub fn match_fallback_phase(line: &str, is_spec_runner: bool) -> Option<ExecutionPhase> {
    if is_spec_runner {
        return SPEC_RUNNER_PATTERN
            .is_match(line)
            .then_some(ExecutionPhase::Planning);
    }
    TASK_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(line))
        .map(|(_, phase)| *phase)
}

fn short_message(line: &str) -> String {
    line.trim().chars().take(MAX_MESSAGE_CHARS).collect()
}

/// Per-task phase state: the current phase, phases already finished, and
/// the sequence stamped on forwarded updates.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    current: ExecutionPhase,
    completed: HashSet<ExecutionPhase>,
    sequence: u64,
    is_spec_runner: bool,
}

impl PhaseTracker {
    pub fn new(is_spec_runner: bool) -> Self {
        Self {
            current: ExecutionPhase::Idle,
            completed: HashSet::new(),
            sequence: 0,
            is_spec_runner,
        }
    }

    pub fn current(&self) -> ExecutionPhase {
        self.current
    }

    pub fn is_completed(&self, phase: ExecutionPhase) -> bool {
        self.completed.contains(&phase)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Start a fresh run. The sequence keeps counting so consumers never see
    /// it go backwards.
    pub fn restart(&mut self, is_spec_runner: bool) {
        self.current = ExecutionPhase::Idle;
        self.completed.clear();
        self.is_spec_runner = is_spec_runner;
    }

    fn enter(&mut self, phase: ExecutionPhase) -> u64 {
        let previous = self.current;
        if phase.order() > previous.order()
            && previous != ExecutionPhase::Idle
            && !previous.is_pause()
        {
            self.completed.insert(previous);
        }
        self.current = phase;
        self.sequence += 1;
        self.sequence
    }

    /// Force a phase from an authoritative source (state machine, exit
    /// handling) and return its sequence.
    pub fn force(&mut self, phase: ExecutionPhase) -> u64 {
        self.enter(phase)
    }

    fn fallback_allowed(&self, candidate: ExecutionPhase) -> bool {
        if self.current.is_terminal() || self.current.is_pause() {
            return false;
        }
        if candidate == self.current || self.completed.contains(&candidate) {
            return false;
        }
        candidate.is_terminal() || candidate.order() >= self.current.order()
    }

    /// Feed one output line. Returns the accepted update and its sequence.
    pub fn observe(&mut self, line: &str) -> Option<(PhaseUpdate, u64)> {
        match parse_structured_phase(line) {
            StructuredPhase::Valid(update) => {
                let seq = self.enter(update.phase);
                Some((update, seq))
            }
            StructuredPhase::Invalid => None,
            StructuredPhase::Absent => {
                let candidate = match_fallback_phase(line, self.is_spec_runner)?;
                if !self.fallback_allowed(candidate) {
                    return None;
                }
                let seq = self.enter(candidate);
                Some((
                    PhaseUpdate {
                        phase: candidate,
                        message: short_message(line),
                        progress: None,
                        subtask: None,
                        reset_timestamp: None,
                        profile_id: None,
                        source: PhaseSource::Fallback,
                    },
                    seq,
                ))
            }
        }
    }
}
