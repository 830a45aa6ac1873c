//! Liveness watchdog
//!
//! Runs inside the worker and watches the host pid. When the host is gone
//! the worker must not linger as an orphan.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Whether a process with `pid` exists
///
/// `EPERM` means the process exists but belongs to someone else.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a cheap existence check the host is assumed alive.
#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    true
}

/// Cancellable periodic check of the host pid
pub struct LivenessWatchdog {
    host_pid: u32,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LivenessWatchdog {
    /// Spawn a watchdog that calls `on_orphaned` once when `host_pid` is gone
    pub fn spawn<F>(host_pid: u32, interval: Duration, on_orphaned: F) -> Self
    where
        F: FnOnce(u32) + Send + 'static,
    {
        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(watch_host(host_pid, interval, cancelled, on_orphaned));
        tracing::debug!(host_pid, interval_ms = interval.as_millis() as u64, "Liveness watchdog started");
        Self {
            host_pid,
            cancel,
            task: Some(task),
        }
    }

    /// Watchdog that exits the worker with status 0 when the host is gone
    pub fn exit_on_orphan(host_pid: u32, interval: Duration) -> Self {
        Self::spawn(host_pid, interval, |pid| {
            tracing::warn!(host_pid = pid, "Host process is gone, exiting worker");
            std::process::exit(0);
        })
    }

    /// Pid being watched
    pub fn host_pid(&self) -> u32 {
        self.host_pid
    }

    /// Whether the watchdog is still polling
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel polling and wait for the task to end
    pub async fn stop(mut self) {
        let _ = self.cancel.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LivenessWatchdog {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn watch_host<F>(
    host_pid: u32,
    interval: Duration,
    mut cancelled: watch::Receiver<bool>,
    on_orphaned: F,
) where
    F: FnOnce(u32) + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !process_exists(host_pid) {
                    on_orphaned(host_pid);
                    return;
                }
            }
            changed = cancelled.changed() => {
                if changed.is_err() || *cancelled.borrow() {
                    tracing::debug!(host_pid, "Liveness watchdog stopped");
                    return;
                }
            }
        }
    }
}
