//! Background persistence writer.
//!
//! Hot paths (event streaming, status transitions) must never block on disk.
//! They enqueue jobs here with `try_send`; a single drained queue keeps all
//! disk mutation on one task, which also serializes `sessions.json`. When the
//! queue is full the newest job is dropped with a warning.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PersistedTaskMetadata, TaskResult, TaskStore};
use crate::worker::events::WorkerEvent;

/// Bound on queued write jobs. Policy on overflow: drop-newest.
const WRITER_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum WriteJob {
    Metadata(Box<PersistedTaskMetadata>),
    AppendEvent {
        task_id: String,
        event: Box<WorkerEvent>,
    },
    Result(Box<TaskResult>),
    SessionMapping {
        session_id: String,
        task_id: String,
    },
}

/// Cheap handle for submitting fire-and-forget persistence work.
#[derive(Clone)]
pub struct PersistenceWriter {
    tx: Option<mpsc::Sender<WriteJob>>,
}

impl PersistenceWriter {
    /// Spawn the writer task. With no store (persistence disabled), the
    /// returned handle accepts and discards jobs.
    pub fn spawn(store: Option<Arc<TaskStore>>) -> (Self, JoinHandle<()>) {
        let Some(store) = store else {
            return (Self { tx: None }, tokio::spawn(async {}));
        };

        let (tx, mut rx) = mpsc::channel::<WriteJob>(WRITER_QUEUE_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = run_job(&store, job).await {
                    warn!(error = %e, "Persistence write failed");
                }
            }
            debug!("Persistence writer drained and stopped");
        });
        (Self { tx: Some(tx) }, handle)
    }

    /// Writer that discards everything; used when persistence is disabled
    /// and in tests that do not care about disk state.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Enqueue a job without waiting. Full queue drops the job with a warn;
    /// a closed queue (shutdown) drops it silently.
    pub fn submit(&self, job: WriteJob) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(job = ?job_kind(&job), "Persistence queue full, dropping write");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Persistence writer stopped, dropping write");
            }
        }
    }
}

fn job_kind(job: &WriteJob) -> &'static str {
    match job {
        WriteJob::Metadata(_) => "metadata",
        WriteJob::AppendEvent { .. } => "append_event",
        WriteJob::Result(_) => "result",
        WriteJob::SessionMapping { .. } => "session_mapping",
    }
}

async fn run_job(store: &TaskStore, job: WriteJob) -> anyhow::Result<()> {
    match job {
        WriteJob::Metadata(meta) => store.save_task_metadata(&meta),
        WriteJob::AppendEvent { task_id, event } => store.append_event(&task_id, &event),
        WriteJob::Result(result) => store.save_result(&result),
        WriteJob::SessionMapping {
            session_id,
            task_id,
        } => store.save_session_mapping(&session_id, &task_id).await,
    }
}
