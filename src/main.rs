//! shepherd-mcp entrypoint: wire the components together and serve stdio.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use shepherd_mcp::config::ServerConfig;
use shepherd_mcp::persistence::writer::{PersistenceWriter, WriteJob};
use shepherd_mcp::persistence::{PersistedTaskMetadata, TaskResult, TaskStore};
use shepherd_mcp::pool::ProcessPool;
use shepherd_mcp::server::ControlServer;
use shepherd_mcp::task::{TaskManager, COMPLETED_TASK_MAX_AGE, PURGE_SWEEP_INTERVAL};
use shepherd_mcp::tools::{ToolContext, ToolRegistry};
use shepherd_mcp::worker::WorkerRunner;

#[tokio::main]
async fn main() {
    // stdout carries the control protocol; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Fatal startup error");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let base_dir = TaskStore::default_base_dir()
        .ok_or_else(|| anyhow!("Could not determine the user's home directory"))?;
    let config = ServerConfig::load(&base_dir.join("config.json"));

    let store = TaskStore::new(base_dir);
    let store = match store.init() {
        Ok(()) => {
            info!(base_dir = %store.base_dir().display(), "Persistence initialized");
            Some(Arc::new(store))
        }
        Err(e) => {
            warn!(error = %e, "Persistence unavailable, continuing in memory-only mode");
            None
        }
    };
    let (writer, writer_handle) = PersistenceWriter::spawn(store);

    let manager = TaskManager::new();
    let pool = ProcessPool::new(config.pool.max_concurrent);
    let runner = WorkerRunner::new(
        config.cli_path.clone(),
        manager.clone(),
        writer.clone(),
        pool.clone(),
    );

    spawn_status_sink(manager.clone(), writer.clone());
    spawn_purge_sweep(manager.clone());

    let ctx = Arc::new(ToolContext {
        manager: manager.clone(),
        runner: runner.clone(),
        pool,
        config,
    });
    let server = ControlServer::new(ToolRegistry::new(ctx));

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    info!("shepherd-mcp serving on stdio");
    let served = server.run(shutdown).await;

    info!("Shutting down");
    runner.stop_all();
    manager.cleanup();
    // Release every writer handle (ours, the runner's, the tool context's)
    // so the writer can drain, then wait for it best-effort.
    drop(server);
    drop(writer);
    drop(runner);
    let _ = tokio::time::timeout(Duration::from_secs(2), writer_handle).await;

    served
}

/// Checkpoint task metadata on every status transition and write the final
/// result record on terminal transitions. All work is queued fire-and-forget
/// so transitions never wait on disk.
fn spawn_status_sink(manager: TaskManager, writer: PersistenceWriter) {
    let mut rx = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(change) => {
                    let Some(task) = manager.get_task_state(&change.task_id) else {
                        continue;
                    };
                    writer.submit(WriteJob::Metadata(Box::new(PersistedTaskMetadata::from(
                        &task,
                    ))));
                    if change.status.is_terminal() {
                        let completed_at = Utc::now();
                        let duration_ms =
                            (completed_at - task.created_at).num_milliseconds().max(0) as u64;
                        writer.submit(WriteJob::Result(Box::new(TaskResult {
                            task_id: task.task_id.clone(),
                            status: change.status,
                            status_message: change.message.clone(),
                            output: task.accumulated_text.clone(),
                            completed_at,
                            duration_ms,
                        })));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed = missed, "Status sink fell behind, checkpoints skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Status sink stopped");
    });
}

/// Periodically evict aged-out terminal tasks from the registry.
fn spawn_purge_sweep(manager: TaskManager) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            manager.purge_completed(COMPLETED_TASK_MAX_AGE);
        }
    });
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(mut term), Ok(mut hup)) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
                _ = hup.recv() => {}
            }
        }
        _ => {
            warn!("Failed to install signal handlers, falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
