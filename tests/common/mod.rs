//! Shared fixtures: fake Worker CLI scripts and component wiring.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use shepherd_mcp::persistence::writer::PersistenceWriter;
use shepherd_mcp::pool::ProcessPool;
use shepherd_mcp::task::TaskManager;
use shepherd_mcp::worker::WorkerRunner;

/// Write an executable shell script that stands in for the Worker CLI.
#[cfg(unix)]
pub fn write_worker_script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-worker.sh");
    let script = format!("#!/bin/sh\n{}\n", body);
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Build a runner around the given CLI path with an isolated manager.
pub fn test_runner(
    cli_path: &str,
    writer: PersistenceWriter,
) -> (TaskManager, WorkerRunner, ProcessPool) {
    let manager = TaskManager::new();
    let pool = ProcessPool::new(4);
    let runner = WorkerRunner::new(cli_path.to_string(), manager.clone(), writer, pool.clone());
    (manager, runner, pool)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
