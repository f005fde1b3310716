//! Canonical in-memory task registry and lifecycle state machine.
//!
//! The manager is the only writer of task state. Event handling is
//! synchronous with respect to that state: the registry lock is held only for
//! the mutation, and status changes are published on a broadcast channel
//! after the lock is released, so subscribers can do slow work (persistence
//! checkpoints) without ever blocking an event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::persistence::PersistedTaskMetadata;
use crate::task::task::{
    AgentKind, Task, TaskError, TaskStatus, INPUT_REQUIRED_IDLE_THRESHOLD,
};
use crate::worker::events::WorkerEvent;

/// Status message attached when idle-input detection fires.
const WAITING_FOR_INPUT_MESSAGE: &str = "Waiting for user input";

/// Published on every externally-visible status transition (old != new only).
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: Option<String>,
}

struct TaskEntry {
    task: Task,
    idle_timer: Option<JoinHandle<()>>,
    last_text_at: Option<Instant>,
    terminal_at: Option<Instant>,
}

impl TaskEntry {
    fn disarm_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

struct ManagerInner {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    status_tx: broadcast::Sender<StatusChange>,
    /// Trailing punctuation that marks the buffer as a pending question.
    idle_trigger: char,
}

/// Shared handle to the task registry. Cheap to clone.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self::with_idle_trigger('?')
    }

    /// Use a different trailing character for idle-input detection.
    pub fn with_idle_trigger(idle_trigger: char) -> Self {
        let (status_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ManagerInner {
                tasks: Mutex::new(HashMap::new()),
                status_tx,
                idle_trigger,
            }),
        }
    }

    /// Subscribe to status transitions. Each transition is delivered exactly
    /// once per subscriber, after the registry lock is released.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status_tx.subscribe()
    }

    /// Register a new task in `working` state and return its id.
    pub fn create_task(&self, title: String, model: String, agent: Option<AgentKind>) -> String {
        let task = Task::new(title, model, agent);
        let task_id = task.task_id.clone();
        let mut tasks = self.lock_tasks();
        tasks.insert(
            task_id.clone(),
            TaskEntry {
                task,
                idle_timer: None,
                last_text_at: None,
                terminal_at: None,
            },
        );
        task_id
    }

    /// Ingest one worker event for a task.
    ///
    /// Terminal tasks drop the event. Otherwise the session id is captured
    /// write-once, activity timestamps advance, any pending idle timer is
    /// disarmed, and the event drives the state machine.
    pub fn handle_event(&self, task_id: &str, event: &WorkerEvent) -> Result<(), TaskError> {
        let mut changes: Vec<StatusChange> = Vec::new();
        let mut arm_timer = false;
        {
            let mut tasks = self.lock_tasks();
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

            if entry.task.status.is_terminal() {
                debug!(task_id = %task_id, status = %entry.task.status, "Dropping event for terminal task");
                return Ok(());
            }

            if entry.task.session_id.is_empty() && !event.session_id().is_empty() {
                entry.task.session_id = event.session_id().to_string();
            }
            entry.task.last_event_at = Utc::now();
            entry.disarm_idle_timer();

            // Any activity wakes a task that was waiting for input.
            if entry.task.status == TaskStatus::InputRequired {
                if let Some(change) = set_status(entry, TaskStatus::Working, None) {
                    changes.push(change);
                }
            }

            match event {
                WorkerEvent::StepStart(_) | WorkerEvent::ToolUse(_) => {}
                WorkerEvent::Text(text_event) => {
                    if entry.task.append_text(&text_event.part.text) {
                        warn!(
                            task_id = %task_id,
                            "Accumulated text reached its cap, discarding further output"
                        );
                    }
                    entry.last_text_at = Some(Instant::now());
                    if entry
                        .task
                        .accumulated_text
                        .trim_end()
                        .ends_with(self.inner.idle_trigger)
                    {
                        arm_timer = true;
                    }
                }
                WorkerEvent::StepFinish(finish) => {
                    if finish.part.reason == crate::worker::events::FinishReason::Stop {
                        if let Some(change) = set_status(entry, TaskStatus::Completed, None) {
                            changes.push(change);
                        }
                    }
                }
            }

            if arm_timer && !entry.task.status.is_terminal() {
                entry.idle_timer = Some(self.spawn_idle_timer(task_id));
            }
        }
        self.publish(changes);
        Ok(())
    }

    /// Mark a task failed with a reason. No-op when already terminal.
    pub fn fail_task(&self, task_id: &str, message: impl Into<String>) -> Result<(), TaskError> {
        self.finish_task(task_id, TaskStatus::Failed, Some(message.into()))
    }

    /// Mark a task cancelled. No-op when already terminal.
    pub fn cancel_task(&self, task_id: &str) -> Result<(), TaskError> {
        self.finish_task(task_id, TaskStatus::Cancelled, Some("Task cancelled".to_string()))
    }

    fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: Option<String>,
    ) -> Result<(), TaskError> {
        let change = {
            let mut tasks = self.lock_tasks();
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
            if entry.task.status.is_terminal() {
                return Ok(());
            }
            entry.disarm_idle_timer();
            set_status(entry, status, message)
        };
        self.publish(change);
        Ok(())
    }

    pub fn get_task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.lock_tasks().get(task_id).map(|e| e.task.status)
    }

    /// Defensive copy of the full in-memory task state.
    pub fn get_task_state(&self, task_id: &str) -> Option<Task> {
        self.lock_tasks().get(task_id).map(|e| e.task.clone())
    }

    /// Persistable projection of a task.
    pub fn get_task_metadata(&self, task_id: &str) -> Option<PersistedTaskMetadata> {
        self.lock_tasks()
            .get(task_id)
            .map(|e| PersistedTaskMetadata::from(&e.task))
    }

    /// Tasks still able to make progress.
    pub fn list_active_tasks(&self) -> Vec<Task> {
        self.lock_tasks()
            .values()
            .filter(|e| e.task.status.is_active())
            .map(|e| e.task.clone())
            .collect()
    }

    pub fn list_all_tasks(&self) -> Vec<Task> {
        self.lock_tasks().values().map(|e| e.task.clone()).collect()
    }

    /// Drop a task from the registry, cancelling its timers.
    pub fn remove_task(&self, task_id: &str) -> bool {
        match self.lock_tasks().remove(task_id) {
            Some(mut entry) => {
                entry.disarm_idle_timer();
                true
            }
            None => false,
        }
    }

    /// Evict terminal tasks whose terminal transition is older than
    /// `max_age`. On-disk artifacts are untouched. Returns the eviction
    /// count.
    pub fn purge_completed(&self, max_age: Duration) -> usize {
        let mut tasks = self.lock_tasks();
        let before = tasks.len();
        tasks.retain(|_, entry| match entry.terminal_at {
            Some(at) if at.elapsed() >= max_age => {
                entry.disarm_idle_timer();
                false
            }
            _ => true,
        });
        let purged = before - tasks.len();
        if purged > 0 {
            debug!(purged = purged, "Purged aged-out terminal tasks");
        }
        purged
    }

    /// Cancel every pending timer and empty the registry. Used at shutdown
    /// and in tests.
    pub fn cleanup(&self) {
        let mut tasks = self.lock_tasks();
        for entry in tasks.values_mut() {
            entry.disarm_idle_timer();
        }
        tasks.clear();
    }

    fn spawn_idle_timer(&self, task_id: &str) -> JoinHandle<()> {
        let manager = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(INPUT_REQUIRED_IDLE_THRESHOLD).await;
            manager.fire_idle_check(&task_id);
        })
    }

    /// Re-validate the idle condition when the timer fires. The timer may
    /// lose a race against a fresh event or a terminal transition; every
    /// condition is checked again under the lock.
    fn fire_idle_check(&self, task_id: &str) {
        let change = {
            let mut tasks = self.lock_tasks();
            let Some(entry) = tasks.get_mut(task_id) else {
                return;
            };
            if entry.task.status != TaskStatus::Working {
                return;
            }
            if !entry
                .task
                .accumulated_text
                .trim_end()
                .ends_with(self.inner.idle_trigger)
            {
                return;
            }
            let Some(last_text_at) = entry.last_text_at else {
                return;
            };
            if last_text_at.elapsed() < INPUT_REQUIRED_IDLE_THRESHOLD {
                return;
            }
            set_status(
                entry,
                TaskStatus::InputRequired,
                Some(WAITING_FOR_INPUT_MESSAGE.to_string()),
            )
        };
        self.publish(change);
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskEntry>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, changes: impl IntoIterator<Item = StatusChange>) {
        for change in changes {
            let _ = self.inner.status_tx.send(change);
        }
    }
}

/// Apply a status transition; returns the change to publish when old != new.
fn set_status(
    entry: &mut TaskEntry,
    status: TaskStatus,
    message: Option<String>,
) -> Option<StatusChange> {
    if entry.task.status == status {
        return None;
    }
    entry.task.status = status;
    entry.task.status_message = message.clone();
    if status.is_terminal() {
        entry.terminal_at = Some(Instant::now());
    }
    Some(StatusChange {
        task_id: entry.task.task_id.clone(),
        status,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::events::parse_line;
    use tokio::time::advance;

    fn step_start(session: &str) -> WorkerEvent {
        parse_line(&format!(
            r#"{{"type":"step_start","timestamp":1,"sessionID":"{}","part":{{"id":"p","snapshot":""}}}}"#,
            session
        ))
        .unwrap()
    }

    fn text(session: &str, body: &str) -> WorkerEvent {
        parse_line(&format!(
            r#"{{"type":"text","timestamp":2,"sessionID":"{}","part":{{"id":"p","text":{}}}}}"#,
            session,
            serde_json::to_string(body).unwrap()
        ))
        .unwrap()
    }

    fn tool_use(session: &str) -> WorkerEvent {
        parse_line(&format!(
            r#"{{"type":"tool_use","timestamp":3,"sessionID":"{}","part":{{"id":"p","tool":"bash","callID":"c","state":{{"status":"completed","input":{{}},"output":"","metadata":{{"truncated":false}}}}}}}}"#,
            session
        ))
        .unwrap()
    }

    fn step_finish(session: &str, reason: &str) -> WorkerEvent {
        parse_line(&format!(
            r#"{{"type":"step_finish","timestamp":4,"sessionID":"{}","part":{{"id":"p","reason":"{}","tokens":{{"input":1,"output":1,"reasoning":0}},"cost":0.0}}}}"#,
            session, reason
        ))
        .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<StatusChange>) -> Vec<StatusChange> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change);
        }
        out
    }

    #[tokio::test]
    async fn test_happy_path() {
        let manager = TaskManager::new();
        let mut rx = manager.subscribe();
        let id = manager.create_task("Simple".into(), "x/y".into(), None);

        manager.handle_event(&id, &step_start("S")).unwrap();
        manager.handle_event(&id, &text("S", "Done.")).unwrap();
        manager.handle_event(&id, &step_finish("S", "stop")).unwrap();

        let task = manager.get_task_state(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.session_id, "S");
        assert_eq!(task.accumulated_text, "Done.");

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_tool_use_then_completion() {
        let manager = TaskManager::new();
        let id = manager.create_task("Tools".into(), "x/y".into(), None);

        for event in [
            step_start("S"),
            text("S", "Analyzing…"),
            step_finish("S", "tool-calls"),
            step_start("S"),
            tool_use("S"),
            step_finish("S", "tool-calls"),
            step_start("S"),
            text("S", " done"),
            step_finish("S", "stop"),
        ] {
            manager.handle_event(&id, &event).unwrap();
        }

        let task = manager.get_task_state(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.accumulated_text, "Analyzing… done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_input_detection() {
        let manager = TaskManager::new();
        let id = manager.create_task("Idle".into(), "x/y".into(), None);

        manager.handle_event(&id, &step_start("S")).unwrap();
        manager.handle_event(&id, &text("S", "Proceed?")).unwrap();

        // Sleeping lets the armed timer register before the paused clock
        // auto-advances to its deadline.
        tokio::time::sleep(Duration::from_millis(30_000)).await;
        tokio::task::yield_now().await;

        let task = manager.get_task_state(&id).unwrap();
        assert_eq!(task.status, TaskStatus::InputRequired);
        assert_eq!(
            task.status_message.as_deref(),
            Some("Waiting for user input")
        );

        // The next events resume the task and finish it.
        manager.handle_event(&id, &step_start("S")).unwrap();
        manager.handle_event(&id, &text("S", "ok.")).unwrap();
        manager.handle_event(&id, &step_finish("S", "stop")).unwrap();
        assert_eq!(
            manager.get_task_status(&id),
            Some(TaskStatus::Completed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_disarms_idle_timer() {
        let manager = TaskManager::new();
        let id = manager.create_task("Busy".into(), "x/y".into(), None);

        manager
            .handle_event(&id, &text("S", "Still thinking?"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(15_000)).await;

        // The buffer no longer ends with a question, so no timer is rearmed.
        manager.handle_event(&id, &text("S", " yes")).unwrap();
        tokio::time::sleep(Duration::from_millis(20_000)).await;
        tokio::task::yield_now().await;

        assert_eq!(manager.get_task_status(&id), Some(TaskStatus::Working));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_never_downgrades_terminal() {
        let manager = TaskManager::new();
        let id = manager.create_task("Race".into(), "x/y".into(), None);

        manager.handle_event(&id, &text("S", "Continue?")).unwrap();
        manager.fail_task(&id, "boom").unwrap();

        tokio::time::sleep(Duration::from_millis(31_000)).await;
        tokio::task::yield_now().await;
        assert_eq!(manager.get_task_status(&id), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn test_events_dropped_on_terminal_task() {
        let manager = TaskManager::new();
        let id = manager.create_task("T".into(), "x/y".into(), None);
        manager.cancel_task(&id).unwrap();

        manager.handle_event(&id, &step_finish("S", "stop")).unwrap();
        let task = manager.get_task_state(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.session_id, "");
    }

    #[tokio::test]
    async fn test_session_id_write_once() {
        let manager = TaskManager::new();
        let id = manager.create_task("T".into(), "x/y".into(), None);
        manager.handle_event(&id, &step_start("first")).unwrap();
        manager.handle_event(&id, &text("second", "hi")).unwrap();
        assert_eq!(manager.get_task_state(&id).unwrap().session_id, "first");
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let manager = TaskManager::new();
        assert!(matches!(
            manager.handle_event("task_missing", &step_start("S")),
            Err(TaskError::NotFound(_))
        ));
        assert!(manager.fail_task("task_missing", "x").is_err());
        assert!(manager.cancel_task("task_missing").is_err());
    }

    #[tokio::test]
    async fn test_fail_then_cancel_is_noop() {
        let manager = TaskManager::new();
        let mut rx = manager.subscribe();
        let id = manager.create_task("T".into(), "x/y".into(), None);

        manager.fail_task(&id, "first failure").unwrap();
        manager.cancel_task(&id).unwrap();
        manager.fail_task(&id, "second failure").unwrap();

        let task = manager.get_task_state(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.status_message.as_deref(), Some("first failure"));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_list_active_subset_of_all() {
        let manager = TaskManager::new();
        let a = manager.create_task("A".into(), "x/y".into(), None);
        let b = manager.create_task("B".into(), "x/y".into(), None);
        let _c = manager.create_task("C".into(), "x/y".into(), None);
        manager.handle_event(&a, &step_finish("S", "stop")).unwrap();
        manager.cancel_task(&b).unwrap();

        let all = manager.list_all_tasks();
        let active = manager.list_active_tasks();
        assert_eq!(all.len(), 3);
        assert_eq!(active.len(), 1);
        for task in &active {
            assert!(task.status.is_active());
            assert!(all.iter().any(|t| t.task_id == task.task_id));
        }
    }

    #[tokio::test]
    async fn test_remove_and_cleanup() {
        let manager = TaskManager::new();
        let id = manager.create_task("T".into(), "x/y".into(), None);
        assert!(manager.remove_task(&id));
        assert!(!manager.remove_task(&id));

        manager.create_task("U".into(), "x/y".into(), None);
        manager.cleanup();
        assert!(manager.list_all_tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_completed() {
        let manager = TaskManager::new();
        let done = manager.create_task("done".into(), "x/y".into(), None);
        let live = manager.create_task("live".into(), "x/y".into(), None);
        manager
            .handle_event(&done, &step_finish("S", "stop"))
            .unwrap();

        advance(Duration::from_secs(30 * 60)).await;
        assert_eq!(manager.purge_completed(Duration::from_secs(3600)), 0);

        advance(Duration::from_secs(31 * 60)).await;
        assert_eq!(manager.purge_completed(Duration::from_secs(3600)), 1);
        assert!(manager.get_task_status(&done).is_none());
        assert!(manager.get_task_status(&live).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_required_resumes_on_next_event() {
        let manager = TaskManager::new();
        let mut rx = manager.subscribe();
        let id = manager.create_task("T".into(), "x/y".into(), None);

        manager.handle_event(&id, &text("S", "Which one?")).unwrap();
        tokio::time::sleep(Duration::from_millis(30_000)).await;
        tokio::task::yield_now().await;
        assert_eq!(
            manager.get_task_status(&id),
            Some(TaskStatus::InputRequired)
        );

        manager.handle_event(&id, &tool_use("S")).unwrap();
        assert_eq!(manager.get_task_status(&id), Some(TaskStatus::Working));

        let statuses: Vec<_> = drain(&mut rx).into_iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::InputRequired, TaskStatus::Working]
        );
    }
}
