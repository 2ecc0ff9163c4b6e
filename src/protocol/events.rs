//! Structured task events embedded in worker output.
//!
//! A worker announces lifecycle changes with a line of the form
//! `__TASK_EVENT__:{...}`. Anything after the marker that is not a single
//! well-formed, schema-valid JSON object is dropped.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::LastEvent;
use crate::wlog_debug;

pub const TASK_EVENT_MARKER: &str = "__TASK_EVENT__:";

/// Return the first balanced `{...}` object in `text`.
///
/// Braces inside string literals (including escaped quotes) do not count.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Payload following `marker` in `line`, if the marker is present.
pub fn marker_payload<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.find(marker).map(|idx| &line[idx + marker.len()..])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub task_id: String,
    pub spec_id: String,
    pub project_id: String,
    pub timestamp: String,
    pub event_id: String,
    pub sequence: u64,
    /// Event-specific fields, kept as sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskEvent {
    fn is_valid(&self) -> bool {
        !self.event_type.is_empty()
            && !self.task_id.is_empty()
            && !self.spec_id.is_empty()
            && !self.project_id.is_empty()
            && !self.event_id.is_empty()
            && DateTime::parse_from_rfc3339(&self.timestamp).is_ok()
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.extra.get(name).and_then(Value::as_bool)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }

    pub fn u64_field(&self, name: &str) -> Option<u64> {
        self.extra.get(name).and_then(Value::as_u64)
    }

    pub fn last_event(&self) -> LastEvent {
        LastEvent {
            event_id: self.event_id.clone(),
            sequence: self.sequence,
            event_type: self.event_type.clone(),
            timestamp: self.timestamp.clone(),
        }
    }
}

/// Parse a schema-valid task event from one output line.
pub fn parse_task_event(line: &str) -> Option<TaskEvent> {
    let payload = marker_payload(line, TASK_EVENT_MARKER)?;
    let Some(json) = extract_json_object(payload) else {
        wlog_debug!("task event marker without JSON object: {}", line);
        return None;
    };
    match serde_json::from_str::<TaskEvent>(json) {
        Ok(event) if event.is_valid() => Some(event),
        Ok(event) => {
            wlog_debug!(
                "dropping task event {} with invalid fields",
                event.event_type
            );
            None
        }
        Err(e) => {
            wlog_debug!("dropping malformed task event: {}", e);
            None
        }
    }
}
