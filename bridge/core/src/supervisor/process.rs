//! Worker process handle and termination hook

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::Child;

use super::environment::WorkerEnvironment;

/// Pids of workers that must not outlive the host
static ARMED_WORKERS: Mutex<BTreeSet<u32>> = parking_lot::const_mutex(BTreeSet::new());

/// Kill every worker whose termination hook is still armed
///
/// For exit paths that skip destructors (panic hooks, `process::exit`).
/// Returns the number of workers signalled.
pub fn kill_armed_workers() -> usize {
    let pids: Vec<u32> = std::mem::take(&mut *ARMED_WORKERS.lock())
        .into_iter()
        .collect();
    for pid in &pids {
        force_kill_pid(*pid);
    }
    pids.len()
}

#[cfg(unix)]
fn force_kill_pid(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pid) {
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGKILL) {
            tracing::debug!(pid, error = %e, "Worker already gone");
        }
    }
}

#[cfg(not(unix))]
fn force_kill_pid(pid: u32) {
    tracing::warn!(pid, "Cannot kill worker by pid on this platform");
}

/// A spawned worker, owned by the supervisor
#[derive(Debug)]
pub struct WorkerHandle {
    child: Child,
    pid: Option<u32>,
    executable: PathBuf,
    environment: WorkerEnvironment,
    graceful_timeout: Duration,
    hook_armed: bool,
}

impl WorkerHandle {
    pub(crate) fn new(
        child: Child,
        executable: PathBuf,
        environment: WorkerEnvironment,
        graceful_timeout: Duration,
    ) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            executable,
            environment,
            graceful_timeout,
            hook_armed: false,
        }
    }

    /// OS pid, unless already reaped at spawn
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Executable the worker was started from
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Environment the worker was started with
    pub fn environment(&self) -> &WorkerEnvironment {
        &self.environment
    }

    /// Wait before the forced kill in [`WorkerHandle::terminate`]
    pub fn graceful_timeout(&self) -> Duration {
        self.graceful_timeout
    }

    /// Kill the worker if the host exits without stopping it
    pub(crate) fn arm_termination_hook(&mut self) {
        if let Some(pid) = self.pid {
            ARMED_WORKERS.lock().insert(pid);
            self.hook_armed = true;
        }
    }

    pub(crate) fn disarm_termination_hook(&mut self) {
        if let Some(pid) = self.pid {
            ARMED_WORKERS.lock().remove(&pid);
        }
        self.hook_armed = false;
    }

    /// Whether the termination hook is armed
    pub fn is_hook_armed(&self) -> bool {
        self.hook_armed
    }

    /// Whether the process has not exited yet
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit status if the process already exited
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(pid = ?self.pid, error = %e, "Could not poll worker status");
                None
            }
        }
    }

    /// Graceful terminate, bounded wait, then forced kill
    ///
    /// Returns the exit status once the process is confirmed stopped.
    pub async fn terminate(mut self) -> Option<ExitStatus> {
        self.disarm_termination_hook();

        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(pid = ?self.pid, %status, "Worker had already exited");
                return Some(status);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(pid = ?self.pid, error = %e, "Could not poll worker status"),
        }

        tracing::info!(
            pid = ?self.pid,
            timeout_secs = self.graceful_timeout.as_secs_f64(),
            "Attempting to gracefully terminate the worker"
        );
        if let Err(e) = self.signal_terminate() {
            tracing::warn!(pid = ?self.pid, error = %e, "Graceful terminate signal failed");
        }

        match tokio::time::timeout(self.graceful_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid = ?self.pid, %status, "Worker terminated gracefully");
                Some(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Waiting for worker failed, killing it");
                self.force_kill().await
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?self.pid,
                    "Worker did not stop within the graceful timeout, killing it"
                );
                self.force_kill().await
            }
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) -> Result<(), String> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = self.child.id().ok_or("worker already reaped")?;
        let raw = i32::try_from(pid).map_err(|e| e.to_string())?;
        kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|e| e.to_string())
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) -> Result<(), String> {
        self.child.start_kill().map_err(|e| e.to_string())
    }

    async fn force_kill(&mut self) -> Option<ExitStatus> {
        if let Err(e) = self.child.kill().await {
            tracing::error!(pid = ?self.pid, error = %e, "Failed to kill worker");
        }
        match self.child.wait().await {
            Ok(status) => {
                tracing::info!(pid = ?self.pid, %status, "Worker killed");
                Some(status)
            }
            Err(e) => {
                tracing::error!(pid = ?self.pid, error = %e, "Worker status unknown after kill");
                None
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.hook_armed {
            tracing::warn!(pid = ?self.pid, "Supervisor dropped without stop, killing worker");
            if let Err(e) = self.child.start_kill() {
                tracing::debug!(pid = ?self.pid, error = %e, "Worker already gone");
            }
            self.disarm_termination_hook();
        }
    }
}
