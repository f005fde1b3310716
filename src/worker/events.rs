//! Worker CLI event stream codec.
//!
//! The worker emits NDJSON on stdout: one event object per line. Events are
//! decoded into typed variants; malformed lines are dropped with a warning so
//! a single bad line never aborts the stream. Fields beyond the ones the
//! supervisor interprets are carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::warn;

/// Events emitted by the Worker CLI in NDJSON output mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    #[serde(rename = "step_start")]
    StepStart(StepStartEvent),
    #[serde(rename = "text")]
    Text(TextEvent),
    #[serde(rename = "tool_use")]
    ToolUse(ToolUseEvent),
    #[serde(rename = "step_finish")]
    StepFinish(StepFinishEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStartEvent {
    pub timestamp: Number,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub part: StepStartPart,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepStartPart {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub snapshot: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEvent {
    pub timestamp: Number,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub part: TextPart,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TextPart {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub time: Option<TextTiming>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextTiming {
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseEvent {
    pub timestamp: Number,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub part: ToolUsePart,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolUsePart {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default, rename = "callID")]
    pub call_id: String,
    #[serde(default)]
    pub state: ToolUseState,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolUseState {
    #[serde(default)]
    pub status: ToolStatus,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub metadata: ToolMetadata,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Completed,
    #[default]
    Pending,
    Error,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<i64>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFinishEvent {
    pub timestamp: Number,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub part: StepFinishPart,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFinishPart {
    #[serde(default)]
    pub id: String,
    pub reason: FinishReason,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default)]
    pub cost: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Why a worker step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "tool-calls")]
    ToolCalls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub reasoning: u64,
}

impl WorkerEvent {
    /// Worker session correlation id carried by every event.
    pub fn session_id(&self) -> &str {
        match self {
            WorkerEvent::StepStart(e) => &e.session_id,
            WorkerEvent::Text(e) => &e.session_id,
            WorkerEvent::ToolUse(e) => &e.session_id,
            WorkerEvent::StepFinish(e) => &e.session_id,
        }
    }

    /// Text payload, for text events.
    pub fn text(&self) -> Option<&str> {
        match self {
            WorkerEvent::Text(e) => Some(&e.part.text),
            _ => None,
        }
    }

    /// Token usage, for step_finish events.
    pub fn token_usage(&self) -> Option<TokenUsage> {
        match self {
            WorkerEvent::StepFinish(e) => Some(e.part.tokens),
            _ => None,
        }
    }

    /// True iff this event marks the worker's final, successful step.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            WorkerEvent::StepFinish(e) if e.part.reason == FinishReason::Stop
        )
    }
}

const KNOWN_EVENT_TYPES: [&str; 4] = ["step_start", "text", "tool_use", "step_finish"];

/// Parse one NDJSON line into a typed event.
///
/// Returns `None` (after a warn log) for anything that is not a well-formed
/// event object with a known `type`. Never panics, never propagates an error.
pub fn parse_line(line: &str) -> Option<WorkerEvent> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, line = %truncate(line, 200), "Failed to parse worker event line");
            return None;
        }
    };

    let obj = match value.as_object() {
        Some(o) => o,
        None => {
            warn!(line = %truncate(line, 200), "Worker event line is not a JSON object");
            return None;
        }
    };

    let event_type = match obj.get("type").and_then(|v| v.as_str()) {
        Some(t) => t.to_string(),
        None => {
            warn!("Worker event missing string 'type' field");
            return None;
        }
    };
    if !KNOWN_EVENT_TYPES.contains(&event_type.as_str()) {
        warn!(event_type = %event_type, "Unknown worker event type, dropping");
        return None;
    }
    if !obj.get("timestamp").map(Value::is_number).unwrap_or(false) {
        warn!(event_type = %event_type, "Worker event missing numeric 'timestamp'");
        return None;
    }
    if !obj.get("sessionID").map(Value::is_string).unwrap_or(false) {
        warn!(event_type = %event_type, "Worker event missing string 'sessionID'");
        return None;
    }
    if !obj.get("part").map(Value::is_object).unwrap_or(false) {
        warn!(event_type = %event_type, "Worker event missing object 'part'");
        return None;
    }

    match serde_json::from_value::<WorkerEvent>(value) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, event_type = %event_type, "Malformed worker event payload, dropping");
            None
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}
