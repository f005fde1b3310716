//! Durable task records: metadata checkpoints, append-only event logs, final
//! results, and the session index.
//!
//! Layout under the base directory (default `~/.shepherd-mcp/`):
//!
//! ```text
//! <base>/
//!   tasks/
//!     <taskId>.json          metadata checkpoint (whole-file write)
//!     <taskId>.output.jsonl  append-only event log
//!     <taskId>.result.json   written once on terminal transition
//!   sessions.json            {version, mappings}
//! ```
//!
//! In-memory state stays authoritative while the supervisor runs; these files
//! exist for inspection and crash recovery. Hot-path writes go through the
//! bounded [`writer`] queue and are never awaited by event processing.

pub mod writer;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::task::{AgentKind, Task, TaskStatus};
use crate::worker::events::{parse_line, WorkerEvent};

/// Version stamp for the sessions index file.
pub const SESSIONS_FILE_VERSION: u32 = 1;

/// Task state as checkpointed to disk. Mirrors [`Task`] minus the in-memory
/// buffer; timestamps serialize as ISO-8601.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTaskMetadata {
    pub task_id: String,
    pub session_id: String,
    pub title: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentKind>,
    pub created_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl From<&Task> for PersistedTaskMetadata {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            session_id: task.session_id.clone(),
            title: task.title.clone(),
            model: task.model.clone(),
            agent: task.agent,
            created_at: task.created_at,
            last_event_at: task.last_event_at,
            status: task.status,
            status_message: task.status_message.clone(),
        }
    }
}

/// Final record written once per task on its terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub output: String,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMapping {
    pub task_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionsFile {
    version: u32,
    mappings: HashMap<String, SessionMapping>,
}

impl Default for SessionsFile {
    fn default() -> Self {
        Self {
            version: SESSIONS_FILE_VERSION,
            mappings: HashMap::new(),
        }
    }
}

/// On-disk store for task artifacts.
///
/// Per-task files have a single writer by construction; `sessions.json` is
/// read-modify-write and therefore serialized through an internal mutex.
#[derive(Debug)]
pub struct TaskStore {
    base_dir: PathBuf,
    tasks_dir: PathBuf,
    sessions_path: PathBuf,
    sessions_lock: tokio::sync::Mutex<()>,
}

impl TaskStore {
    pub fn new(base_dir: PathBuf) -> Self {
        let tasks_dir = base_dir.join("tasks");
        let sessions_path = base_dir.join("sessions.json");
        Self {
            base_dir,
            tasks_dir,
            sessions_path,
            sessions_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Default base directory under the user's profile.
    pub fn default_base_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".shepherd-mcp"))
    }

    /// Create the directory layout and an empty sessions index if absent.
    /// Safe to call repeatedly.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.tasks_dir)
            .with_context(|| format!("Failed to create {}", self.tasks_dir.display()))?;
        if !self.sessions_path.exists() {
            write_pretty(&self.sessions_path, &SessionsFile::default())?;
        }
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    fn metadata_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{}.json", task_id))
    }

    fn events_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{}.output.jsonl", task_id))
    }

    fn result_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{}.result.json", task_id))
    }

    pub fn save_task_metadata(&self, meta: &PersistedTaskMetadata) -> Result<()> {
        write_pretty(&self.metadata_path(&meta.task_id), meta)
    }

    /// `Ok(None)` when no checkpoint exists; other I/O errors propagate.
    pub fn load_task_metadata(&self, task_id: &str) -> Result<Option<PersistedTaskMetadata>> {
        read_optional(&self.metadata_path(task_id))
    }

    /// Append one event to the task's log. The whole line goes out in a
    /// single write so concurrent appends to *other* logs cannot interleave
    /// into this one.
    pub fn append_event(&self, task_id: &str, event: &WorkerEvent) -> Result<()> {
        let path = self.events_path(task_id);
        let mut line = serde_json::to_string(event).context("Failed to encode event")?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        Ok(())
    }

    /// Load the surviving events of a task's log, in append order. Lines that
    /// fail to parse are skipped with a warning.
    pub fn load_events(&self, task_id: &str) -> Result<Vec<WorkerEvent>> {
        let path = self.events_path(task_id);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let mut events = Vec::new();
        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_line(trimmed) {
                Some(event) => events.push(event),
                None => warn!(task_id = %task_id, "Skipping unparseable event log line"),
            }
        }
        Ok(events)
    }

    pub fn save_result(&self, result: &TaskResult) -> Result<()> {
        write_pretty(&self.result_path(&result.task_id), result)
    }

    pub fn load_result(&self, task_id: &str) -> Result<Option<TaskResult>> {
        read_optional(&self.result_path(task_id))
    }

    /// Task ids derived from artifact filenames; each id appears once even
    /// when several of its files exist.
    pub fn list_tasks(&self) -> Result<Vec<String>> {
        let mut ids = BTreeSet::new();
        let entries = match fs::read_dir(&self.tasks_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.tasks_dir.display()))
            }
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let id = if let Some(stem) = name.strip_suffix(".output.jsonl") {
                stem
            } else if let Some(stem) = name.strip_suffix(".result.json") {
                stem
            } else if let Some(stem) = name.strip_suffix(".json") {
                stem
            } else {
                continue;
            };
            if !id.is_empty() {
                ids.insert(id.to_string());
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// Remove every artifact of a task. Missing files are fine.
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        for path in [
            self.metadata_path(task_id),
            self.events_path(task_id),
            self.result_path(task_id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
                }
            }
        }
        Ok(())
    }

    /// Record `session_id -> task_id`. Last write wins on duplicate keys.
    pub async fn save_session_mapping(&self, session_id: &str, task_id: &str) -> Result<()> {
        let _guard = self.sessions_lock.lock().await;
        let mut file = self.read_sessions();
        file.mappings.insert(
            session_id.to_string(),
            SessionMapping {
                task_id: task_id.to_string(),
                created_at: Utc::now(),
            },
        );
        write_pretty(&self.sessions_path, &file)
    }

    pub async fn get_task_id_by_session(&self, session_id: &str) -> Option<String> {
        let _guard = self.sessions_lock.lock().await;
        self.read_sessions()
            .mappings
            .get(session_id)
            .map(|m| m.task_id.clone())
    }

    pub async fn remove_session_mapping(&self, session_id: &str) -> Result<()> {
        let _guard = self.sessions_lock.lock().await;
        let mut file = self.read_sessions();
        if file.mappings.remove(session_id).is_some() {
            write_pretty(&self.sessions_path, &file)?;
        }
        Ok(())
    }

    fn read_sessions(&self) -> SessionsFile {
        match fs::read_to_string(&self.sessions_path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(file) => file,
                Err(e) => {
                    warn!(error = %e, "sessions.json is corrupt, starting from empty index");
                    SessionsFile::default()
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, "Failed to read sessions.json");
                }
                SessionsFile::default()
            }
        }
    }
}

fn write_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value).context("Failed to encode record")?;
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn read_optional<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let value = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to decode {}", path.display()))?;
    Ok(Some(value))
}
