//! Worker process supervisor
//!
//! Owns the worker's lifecycle on the host side: runtime discovery,
//! environment, dependency installation, the host half of the bridge, spawn
//! and graceful-then-forced shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! start():  install dir check ─► resolve executable ─► build env
//!           ─► install deps (bundled runtime only) ─► host bridge (clear)
//!           ─► spawn ─► arm termination hook
//! stop():   disarm hook ─► SIGTERM ─► wait ≤ graceful_timeout ─► SIGKILL
//!           ─► clear handle ─► tear down bridge
//! ```

pub mod environment;
pub mod executable;
pub mod installer;
pub mod process;

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::context::{Bridge, InstallOptions, IpcContext};
use crate::error::{BridgeError, Result};
use crate::proxy::CallbackProxy;
use crate::registry::CallbackRegistry;
use crate::role::{ProcessRole, RoleGuard};

pub use environment::{
    build_worker_environment, problematic_tmp_vars, BridgeVariables, WorkerEnvironment,
    ENV_EXTENSION_DIR, ENV_HOST_PID, ENV_IPC_DIR, ENV_TRANSPORT, ENV_WATCHDOG_INTERVAL,
};
pub use executable::{
    default_worker_executable, resolve_worker_executable, ExecutableOrigin, ResolvedExecutable,
    RuntimeLayout, WORKER_BINARY,
};
pub use installer::{DependencyInstaller, InstallRequest, NoopInstaller, PipInstaller};
pub use process::{kill_armed_workers, WorkerHandle};

/// Default wait between SIGTERM and SIGKILL
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

/// How to launch the worker
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// When false, `start()` does nothing
    pub enabled: bool,
    /// Worker install location; also its working directory
    pub install_dir: PathBuf,
    /// Extension directory shared with the worker
    pub extension_dir: PathBuf,
    /// Script passed as first argument to the executable, if any
    pub bootstrap: Option<PathBuf>,
    /// Arguments appended after the bootstrap
    pub forwarded_args: Vec<String>,
    /// Where bundled runtimes are looked for
    pub runtime: RuntimeLayout,
    /// Executable used when no bundled runtime is found
    pub fallback_executable: PathBuf,
    /// Wait between the graceful signal and the forced kill
    pub graceful_timeout: Duration,
    /// Variables removed from the inherited environment
    pub stripped_env_vars: Vec<String>,
    /// Host liveness poll interval handed to the worker
    pub watchdog_interval: Option<Duration>,
}

impl SupervisorConfig {
    /// Defaults for a worker installed at `install_dir`
    ///
    /// The fallback executable is [`default_worker_executable`].
    pub fn new(install_dir: impl Into<PathBuf>, extension_dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            install_dir: install_dir.into(),
            extension_dir: extension_dir.into(),
            bootstrap: None,
            forwarded_args: Vec::new(),
            runtime: RuntimeLayout::default(),
            fallback_executable: default_worker_executable(),
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            stripped_env_vars: vec!["PYTHONPATH".to_string()],
            watchdog_interval: None,
        }
    }
}

/// Host-side owner of the worker process
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    context: IpcContext,
    callbacks: CallbackRegistry,
    installer: Arc<dyn DependencyInstaller>,
    worker: Option<WorkerHandle>,
    bridge: Option<Bridge>,
}

impl WorkerSupervisor {
    /// Supervisor using `context` (must be the host role) and serving
    /// `callbacks` to the worker
    pub fn new(
        config: SupervisorConfig,
        context: IpcContext,
        callbacks: CallbackRegistry,
        installer: Arc<dyn DependencyInstaller>,
    ) -> Self {
        Self {
            config,
            context,
            callbacks,
            installer,
            worker: None,
            bridge: None,
        }
    }

    /// Settings the supervisor was built with
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Whether a worker handle is held
    pub fn is_started(&self) -> bool {
        self.worker.is_some()
    }

    /// Handle of the running worker
    pub fn worker(&self) -> Option<&WorkerHandle> {
        self.worker.as_ref()
    }

    /// Pid of the running worker
    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().and_then(WorkerHandle::pid)
    }

    /// Proxy into the worker, available while started
    pub fn proxy(&self) -> Option<Arc<CallbackProxy>> {
        self.bridge.as_ref().map(Bridge::proxy)
    }

    /// Whether the worker exited on its own since `start()`
    pub fn has_exited(&mut self) -> bool {
        self.exit_status().is_some()
    }

    /// Exit status of a worker that exited on its own, without waiting
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.worker.as_mut().and_then(WorkerHandle::exit_status)
    }

    /// Launch the worker
    ///
    /// No-op when disabled or already started.
    ///
    /// # Errors
    ///
    /// `WorkerNotInstalled` if the install directory is missing; nothing is
    /// spawned in that case.
    pub async fn start(&mut self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("Worker supervision disabled, not starting worker");
            return Ok(());
        }
        if self.worker.is_some() {
            tracing::debug!(pid = ?self.worker_pid(), "Worker already started");
            return Ok(());
        }
        self.context.ensure_consistent()?;
        RoleGuard::new(ProcessRole::Host, "worker supervisor").check(self.context.role())?;

        let install_dir = &self.config.install_dir;
        if !install_dir.is_dir() {
            tracing::error!(path = %install_dir.display(), "Worker install directory not found");
            return Err(BridgeError::WorkerNotInstalled {
                path: install_dir.clone(),
            });
        }

        let executable = resolve_worker_executable(
            install_dir,
            &self.config.runtime,
            &self.config.fallback_executable,
        );
        let ipc_dir = self.context.ipc_dir();
        let environment = build_worker_environment(
            WorkerEnvironment::inherit(),
            &self.config.stripped_env_vars,
            &BridgeVariables {
                strategy: self.context.strategy(),
                extension_dir: &self.config.extension_dir,
                ipc_dir: &ipc_dir,
                host_pid: std::process::id(),
                watchdog_interval: self.config.watchdog_interval,
            },
        );

        if executable.path != self.config.fallback_executable {
            self.installer
                .ensure_installed(&InstallRequest {
                    executable: &executable,
                    install_dir,
                    extension_dir: &self.config.extension_dir,
                    environment: &environment,
                })
                .await?;
        }

        if self.bridge.is_none() {
            let bridge = self
                .context
                .install_bridge(self.callbacks.clone(), InstallOptions { clear_on_init: true })
                .await?;
            self.bridge = Some(bridge);
        }

        let mut command = Command::new(&executable.path);
        if let Some(bootstrap) = &self.config.bootstrap {
            command.arg(bootstrap);
        }
        command
            .args(&self.config.forwarded_args)
            .current_dir(install_dir)
            .env_clear()
            .envs(environment.iter())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::info!(
            executable = %executable.path.display(),
            origin = ?executable.origin,
            cwd = %install_dir.display(),
            strategy = %self.context.strategy(),
            "Starting worker"
        );

        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                if let Some(bridge) = self.bridge.take() {
                    bridge.shutdown().await;
                }
                return Err(BridgeError::Spawn {
                    executable: executable.path,
                    source,
                });
            }
        };

        let mut handle = WorkerHandle::new(
            child,
            executable.path,
            environment,
            self.config.graceful_timeout,
        );
        handle.arm_termination_hook();
        tracing::info!(pid = ?handle.pid(), "Worker started");
        self.worker = Some(handle);
        Ok(())
    }

    /// Stop the worker and tear down the bridge
    ///
    /// Safe to call when never started, and more than once.
    pub async fn stop(&mut self) {
        if let Some(mut handle) = self.worker.take() {
            handle.disarm_termination_hook();
            handle.terminate().await;
        } else {
            tracing::debug!("No worker to stop");
        }
        if let Some(bridge) = self.bridge.take() {
            bridge.shutdown().await;
        }
    }
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("config", &self.config)
            .field("worker", &self.worker)
            .field("bridge_installed", &self.bridge.is_some())
            .finish_non_exhaustive()
    }
}
