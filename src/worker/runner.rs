//! Worker CLI process driver.
//!
//! Turns "start one task" into a supervised child process: spawns the Worker
//! CLI with direct argv (never through a shell), streams its NDJSON stdout
//! into the task manager, enqueues every event for persistence, enforces the
//! runtime timeout, and classifies the exit. Respond continuations reuse the
//! same pipeline against an existing worker session.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use crate::persistence::writer::{PersistenceWriter, WriteJob};
use crate::pool::ProcessPool;
use crate::task::{AgentKind, TaskManager};
use crate::worker::events::parse_line;
use crate::worker::kill::{kill_pid_tree, kill_process_tree};

/// Upper bound on a single worker run.
pub const WORKER_TIMEOUT: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    /// Fresh task start; admitted through the process pool.
    Start,
    /// Session continuation for a respond request.
    Respond,
}

struct RunnerInner {
    cli_path: String,
    manager: TaskManager,
    writer: PersistenceWriter,
    pool: ProcessPool,
    children: Mutex<HashMap<String, u32>>,
    respond_children: Mutex<HashMap<String, u32>>,
}

/// Shared handle to the runner. Cheap to clone.
#[derive(Clone)]
pub struct WorkerRunner {
    inner: Arc<RunnerInner>,
}

impl WorkerRunner {
    pub fn new(
        cli_path: String,
        manager: TaskManager,
        writer: PersistenceWriter,
        pool: ProcessPool,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                cli_path,
                manager,
                writer,
                pool,
                children: Mutex::new(HashMap::new()),
                respond_children: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cli_path(&self) -> &str {
        &self.inner.cli_path
    }

    /// Launch the worker for a freshly created task. The task must exist and
    /// be in `working`; the child is admitted through the process pool and
    /// supervised on a background task, so this returns immediately.
    pub fn start(
        &self,
        task_id: &str,
        prompt: &str,
        model: &str,
        agent: Option<AgentKind>,
        output_guidance: Option<&str>,
    ) -> Result<()> {
        let status = self
            .inner
            .manager
            .get_task_status(task_id)
            .ok_or_else(|| anyhow!("Task not found: {}", task_id))?;
        if status != crate::task::TaskStatus::Working {
            return Err(anyhow!(
                "Task {} is {}, expected working",
                task_id,
                status
            ));
        }
        let argv = build_start_argv(prompt, model, agent, output_guidance);
        self.spawn_run(task_id, argv, RunKind::Start);
        Ok(())
    }

    /// Launch a continuation of an existing worker session, feeding its
    /// output back into the same task.
    pub fn respond(&self, task_id: &str, session_id: &str, response: &str) {
        let argv = build_respond_argv(session_id, response);
        self.spawn_run(task_id, argv, RunKind::Respond);
    }

    fn spawn_run(&self, task_id: &str, argv: Vec<String>, kind: RunKind) {
        let inner = Arc::clone(&self.inner);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            match kind {
                RunKind::Start => {
                    let pool = inner.pool.clone();
                    pool.execute(run_worker(inner, task_id, argv, kind)).await;
                }
                RunKind::Respond => run_worker(inner, task_id, argv, kind).await,
            }
        });
    }

    /// Signal the live child (and any continuation) for a task. Returns true
    /// iff at least one live child existed and was signalled.
    pub fn stop(&self, task_id: &str) -> bool {
        let mut signalled = false;
        for children in [&self.inner.children, &self.inner.respond_children] {
            let pid = lock(children).remove(task_id);
            if let Some(pid) = pid {
                info!(task_id = %task_id, pid = pid, "Stopping worker process");
                kill_pid_tree(pid);
                signalled = true;
            }
        }
        signalled
    }

    /// Terminate every live child. Used at shutdown.
    pub fn stop_all(&self) {
        for children in [&self.inner.children, &self.inner.respond_children] {
            let drained: Vec<(String, u32)> = lock(children).drain().collect();
            for (task_id, pid) in drained {
                info!(task_id = %task_id, pid = pid, "Stopping worker process at shutdown");
                kill_pid_tree(pid);
            }
        }
    }

    /// Live start-run children.
    pub fn active_count(&self) -> usize {
        lock(&self.inner.children).len()
    }

    /// Live respond continuations.
    pub fn active_respond_count(&self) -> usize {
        lock(&self.inner.respond_children).len()
    }
}

fn lock<'a>(
    map: &'a Mutex<HashMap<String, u32>>,
) -> std::sync::MutexGuard<'a, HashMap<String, u32>> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

/// Compose the start argv: model, NDJSON output mode, optional agent, then
/// the prompt as a single final argument.
fn build_start_argv(
    prompt: &str,
    model: &str,
    agent: Option<AgentKind>,
    output_guidance: Option<&str>,
) -> Vec<String> {
    let mut argv = vec![
        "--model".to_string(),
        model.to_string(),
        "--format".to_string(),
        "json".to_string(),
    ];
    if let Some(agent) = agent {
        argv.push("--agent".to_string());
        argv.push(agent.to_string());
    }
    let prompt = match output_guidance {
        Some(guidance) => format!("{}\n\nOutput guidance: {}", prompt, guidance),
        None => prompt.to_string(),
    };
    argv.push(prompt);
    argv
}

fn build_respond_argv(session_id: &str, response: &str) -> Vec<String> {
    vec![
        "run".to_string(),
        "--session".to_string(),
        session_id.to_string(),
        "--format".to_string(),
        "json".to_string(),
        response.to_string(),
    ]
}

/// Drive one worker child from spawn to exit classification.
async fn run_worker(inner: Arc<RunnerInner>, task_id: String, argv: Vec<String>, kind: RunKind) {
    // The task may have been cancelled while queued for a pool slot.
    match inner.manager.get_task_status(&task_id) {
        Some(status) if !status.is_terminal() => {}
        _ => {
            debug!(task_id = %task_id, "Skipping worker spawn, task no longer runnable");
            return;
        }
    }

    let mut cmd = Command::new(&inner.cli_path);
    cmd.args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(task_id = %task_id, cli_path = %inner.cli_path, kind = ?kind, "Spawning worker");

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = inner
                .manager
                .fail_task(&task_id, format!("Process error: {}", e));
            return;
        }
    };

    let children = match kind {
        RunKind::Start => &inner.children,
        RunKind::Respond => &inner.respond_children,
    };
    if let Some(pid) = child.id() {
        lock(children).insert(task_id.clone(), pid);
    }

    if let Some(stderr) = child.stderr.take() {
        let stderr_task_id = task_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if is_rate_limit_line(trimmed) {
                    error!(task_id = %stderr_task_id, stderr = %trimmed, "Worker reported a rate limit");
                } else {
                    debug!(task_id = %stderr_task_id, stderr = %trimmed, "Worker stderr");
                }
            }
        });
    }

    let stdout = child.stdout.take();
    let drained =
        tokio::time::timeout(WORKER_TIMEOUT, drive_child(&inner, &task_id, stdout, &mut child))
            .await;

    match drained {
        Ok(Ok(status)) => classify_exit(&inner, &task_id, status),
        Ok(Err(e)) => {
            let _ = inner
                .manager
                .fail_task(&task_id, format!("Process error: {}", e));
        }
        Err(_) => {
            warn!(task_id = %task_id, "Worker exceeded runtime limit, killing");
            kill_process_tree(&child);
            let _ = child.wait().await;
            let _ = inner
                .manager
                .fail_task(&task_id, "Process timed out after 900 seconds");
        }
    }

    lock(children).remove(&task_id);
}

/// Stream stdout lines through the codec into the manager, then reap the
/// child. The final partial line (no trailing LF) flows through the same
/// path.
async fn drive_child(
    inner: &Arc<RunnerInner>,
    task_id: &str,
    stdout: Option<ChildStdout>,
    child: &mut Child,
) -> std::io::Result<std::process::ExitStatus> {
    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        let mut session_recorded = false;
        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Some(event) = parse_line(trimmed) else {
                continue;
            };

            if let Err(e) = inner.manager.handle_event(task_id, &event) {
                warn!(task_id = %task_id, error = %e, "Dropping event for unknown task");
                continue;
            }

            if !session_recorded && !event.session_id().is_empty() {
                session_recorded = true;
                inner.writer.submit(WriteJob::SessionMapping {
                    session_id: event.session_id().to_string(),
                    task_id: task_id.to_string(),
                });
                if let Some(meta) = inner.manager.get_task_metadata(task_id) {
                    inner.writer.submit(WriteJob::Metadata(Box::new(meta)));
                }
            }

            inner.writer.submit(WriteJob::AppendEvent {
                task_id: task_id.to_string(),
                event: Box::new(event),
            });
        }
    }
    child.wait().await
}

/// Reconcile the task status with how the child exited. An event-driven
/// terminal status always wins; a clean exit without a completion event
/// leaves the task working (the worker may be non-compliant, not failed).
fn classify_exit(inner: &Arc<RunnerInner>, task_id: &str, status: std::process::ExitStatus) {
    let current = inner.manager.get_task_status(task_id);
    match current {
        Some(s) if !s.is_terminal() => {}
        _ => return,
    }

    if let Some(code) = status.code() {
        if code != 0 {
            let _ = inner
                .manager
                .fail_task(task_id, format!("Process exited with code {}", code));
        }
        return;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            let _ = inner
                .manager
                .fail_task(task_id, format!("Process killed by signal {}", sig));
            return;
        }
    }
    let _ = inner
        .manager
        .fail_task(task_id, "Process terminated abnormally");
}

fn is_rate_limit_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("rate limit") || lower.contains("429") || lower.contains("overloaded")
}
