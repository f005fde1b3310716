//! Platform-portable child termination.
//!
//! POSIX: SIGTERM to the child's process group, escalating to SIGKILL after a
//! grace period. Windows: the process-tree termination utility. Every error is
//! swallowed at debug level; the child may already be gone.

use tokio::process::Child;
use tracing::debug;

/// Grace period between SIGTERM and SIGKILL.
#[cfg(unix)]
const KILL_ESCALATION_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// Terminate `child` and its descendants.
///
/// No-op when the pid is unknown (the child already exited and was reaped).
pub fn kill_process_tree(child: &Child) {
    let Some(pid) = child.id() else {
        debug!("Kill requested for already-reaped child");
        return;
    };
    kill_pid_tree(pid);
}

/// Terminate the process tree rooted at `pid`.
#[cfg(unix)]
pub fn kill_pid_tree(pid: u32) {
    signal_group(pid, libc::SIGTERM);
    tokio::spawn(async move {
        tokio::time::sleep(KILL_ESCALATION_DELAY).await;
        signal_group(pid, libc::SIGKILL);
    });
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) {
    // Negative pid addresses the whole process group; children are spawned
    // with process_group(0) so the group id equals the child pid.
    let ret = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        debug!(pid = pid, signal = sig, error = %err, "Process group signal failed");
        // Fall back to the single process in case it escaped its group.
        let ret = unsafe { libc::kill(pid as libc::pid_t, sig) };
        if ret != 0 {
            debug!(pid = pid, signal = sig, "Process signal failed, child likely exited");
        }
    }
}

#[cfg(windows)]
pub fn kill_pid_tree(pid: u32) {
    match std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .output()
    {
        Ok(output) if !output.status.success() => {
            debug!(
                pid = pid,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "taskkill reported failure, child likely exited"
            );
        }
        Ok(_) => {}
        Err(e) => {
            debug!(pid = pid, error = %e, "Failed to invoke taskkill");
        }
    }
}
