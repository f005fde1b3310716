//! Core task type and lifecycle states.
//!
//! # Invariants
//! - `task_id` is immutable once assigned
//! - `session_id` is write-once: empty until the first worker event, then fixed
//! - terminal statuses are absorbing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hard cap on the accumulated text buffer per task. Appends past the cap are
/// discarded; the discarded bytes do not roll back the cap.
pub const ACCUMULATED_TEXT_CAP: usize = 1024 * 1024;

/// Idle window after a trailing question before a task is considered to be
/// waiting for user input.
pub const INPUT_REQUIRED_IDLE_THRESHOLD: std::time::Duration =
    std::time::Duration::from_secs(30);

/// Retention for terminal tasks in the in-memory registry.
pub const COMPLETED_TASK_MAX_AGE: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Cadence of the registry purge sweep.
pub const PURGE_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// working -> working | input_required | completed | failed | cancelled
/// input_required -> working | completed | failed | cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Worker is (or is about to be) running
    Working,
    /// Worker emitted a question and has gone idle
    InputRequired,
    /// Worker signalled completion
    Completed,
    /// Worker failed, timed out, or could not be spawned
    Failed,
    /// Task was cancelled externally
    Cancelled,
}

impl TaskStatus {
    /// Check if the status is terminal (absorbing).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Check if the task can still make progress.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Working | TaskStatus::InputRequired)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Working => "working",
            TaskStatus::InputRequired => "input_required",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Built-in worker agents a task may be pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Explore,
    Plan,
    Build,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentKind::Explore => "explore",
            AgentKind::Plan => "plan",
            AgentKind::Build => "build",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explore" => Ok(AgentKind::Explore),
            "plan" => Ok(AgentKind::Plan),
            "build" => Ok(AgentKind::Build),
            other => Err(format!("unknown agent: {}", other)),
        }
    }
}

/// Allocate a fresh task identifier: a constant tag plus opaque hex.
pub fn new_task_id() -> String {
    format!("task_{}", Uuid::new_v4().simple())
}

/// In-memory task state. Owned exclusively by the `TaskManager`; accessors
/// hand out clones.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    /// Worker session correlation id; empty until the first event arrives.
    pub session_id: String,
    pub title: String,
    pub model: String,
    pub agent: Option<AgentKind>,
    pub created_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub status: TaskStatus,
    /// Present on non-success terminal states and on `input_required`.
    pub status_message: Option<String>,
    /// Concatenated text-event payloads, capped at [`ACCUMULATED_TEXT_CAP`].
    pub accumulated_text: String,
    /// One-shot marker set when text had to be discarded at the cap.
    pub text_overflowed: bool,
}

impl Task {
    pub fn new(title: String, model: String, agent: Option<AgentKind>) -> Self {
        let now = Utc::now();
        Self {
            task_id: new_task_id(),
            session_id: String::new(),
            title,
            model,
            agent,
            created_at: now,
            last_event_at: now,
            status: TaskStatus::Working,
            status_message: None,
            accumulated_text: String::new(),
            text_overflowed: false,
        }
    }

    /// Append text to the accumulated buffer, honouring the cap. Returns true
    /// if this append hit the cap for the first time.
    pub fn append_text(&mut self, text: &str) -> bool {
        let remaining = ACCUMULATED_TEXT_CAP.saturating_sub(self.accumulated_text.len());
        if remaining == 0 {
            if !self.text_overflowed {
                self.text_overflowed = true;
                return true;
            }
            return false;
        }
        if text.len() <= remaining {
            self.accumulated_text.push_str(text);
            return false;
        }
        // Truncate on a char boundary at or below the remaining budget.
        let mut cut = remaining;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.accumulated_text.push_str(&text[..cut]);
        let first = !self.text_overflowed;
        self.text_overflowed = true;
        first
    }
}

/// Errors surfaced by task registry operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_format() {
        let id = new_task_id();
        assert!(id.starts_with("task_"));
        let hex = &id["task_".len()..];
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_status_predicates() {
        assert!(TaskStatus::Working.is_active());
        assert!(TaskStatus::InputRequired.is_active());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Completed.is_active());
    }

    #[test]
    fn test_append_text_cap() {
        let mut task = Task::new("t".into(), "x/y".into(), None);
        let chunk = "a".repeat(ACCUMULATED_TEXT_CAP - 1);
        assert!(!task.append_text(&chunk));
        assert!(!task.text_overflowed);

        // Crosses the cap: keeps what fits, records the overflow once.
        assert!(task.append_text("bc"));
        assert_eq!(task.accumulated_text.len(), ACCUMULATED_TEXT_CAP);
        assert!(task.text_overflowed);

        // Further appends are silent no-ops.
        assert!(!task.append_text("d"));
        assert_eq!(task.accumulated_text.len(), ACCUMULATED_TEXT_CAP);
    }

    #[test]
    fn test_append_text_char_boundary() {
        let mut task = Task::new("t".into(), "x/y".into(), None);
        task.accumulated_text = "a".repeat(ACCUMULATED_TEXT_CAP - 1);
        // A two-byte char does not fit in the single remaining byte.
        task.append_text("é");
        assert!(task.accumulated_text.len() < ACCUMULATED_TEXT_CAP);
        assert!(task.text_overflowed);
    }

    #[test]
    fn test_agent_kind_round_trip() {
        for (s, kind) in [
            ("explore", AgentKind::Explore),
            ("plan", AgentKind::Plan),
            ("build", AgentKind::Build),
        ] {
            assert_eq!(s.parse::<AgentKind>().unwrap(), kind);
            assert_eq!(kind.to_string(), s);
        }
        assert!("builder".parse::<AgentKind>().is_err());
    }
}
