//! Worker bootstrap
//!
//! Everything the worker does before its own application logic: read the
//! bridge variables left by the supervisor, set up the resource search
//! path, join the bridge and start the liveness watchdog.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::context::{Bridge, InstallOptions, IpcContext};
use crate::error::{BridgeError, Result};
use crate::proxy::CallbackProxy;
use crate::registry::CallbackRegistry;
use crate::role::ProcessRole;
use crate::supervisor::{
    ENV_EXTENSION_DIR, ENV_HOST_PID, ENV_IPC_DIR, ENV_TRANSPORT, ENV_WATCHDOG_INTERVAL,
};
use crate::transport::{self, TransportConfig, TransportStrategy};
use crate::watchdog::{self, LivenessWatchdog};

/// Bridge settings received from the host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Working directory the host started the worker in
    pub install_dir: PathBuf,
    /// Shared extension directory
    pub extension_dir: PathBuf,
    /// Transport selected by the host
    pub strategy: TransportStrategy,
    /// Rendezvous directory
    pub ipc_dir: PathBuf,
    /// Pid of the host, or of the parent when none was passed
    pub host_pid: u32,
    /// Watchdog interval requested by the host; zero disables the watchdog
    pub watchdog_interval: Option<Duration>,
}

impl WorkerSettings {
    /// Read settings from the process environment; the install directory is
    /// the working directory
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var_os(name), std::env::current_dir()?)
    }

    /// Read settings through `lookup`
    ///
    /// # Errors
    ///
    /// `MissingEnvironment` when the extension directory or strategy is
    /// absent, `TransportStrategyMismatch` when the strategy is unknown.
    pub fn from_lookup<F>(lookup: F, install_dir: PathBuf) -> Result<Self>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let extension_dir = lookup(ENV_EXTENSION_DIR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .ok_or(BridgeError::MissingEnvironment(ENV_EXTENSION_DIR))?;

        let strategy_name = lookup(ENV_TRANSPORT)
            .filter(|v| !v.is_empty())
            .ok_or(BridgeError::MissingEnvironment(ENV_TRANSPORT))?;
        let strategy_name = strategy_name.to_string_lossy();
        let strategy = transport::lookup(&strategy_name).map_err(|_| {
            BridgeError::TransportStrategyMismatch {
                received: strategy_name.to_string(),
                supported: transport::supported_names(),
            }
        })?;

        let ipc_dir = lookup(ENV_IPC_DIR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| extension_dir.join(".ipc"));

        let host_pid = match lookup(ENV_HOST_PID).and_then(|v| v.to_str()?.trim().parse().ok()) {
            Some(pid) => pid,
            None => parent_pid(),
        };

        let watchdog_interval = lookup(ENV_WATCHDOG_INTERVAL)
            .and_then(|v| v.to_str()?.trim().parse().ok())
            .map(Duration::from_millis);

        Ok(Self {
            install_dir,
            extension_dir,
            strategy,
            ipc_dir,
            host_pid,
            watchdog_interval,
        })
    }
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    0
}

/// Ordered directories searched for worker resources
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    /// Search path over `dirs`, first occurrence wins
    pub fn new(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut path = Self::default();
        for dir in dirs {
            path.append(dir);
        }
        path
    }

    /// Put `dirs` in front, keeping their order; duplicates move forward
    pub fn prepend(&mut self, dirs: impl IntoIterator<Item = PathBuf>) {
        let front: Vec<PathBuf> = dirs.into_iter().collect();
        self.dirs.retain(|d| !front.contains(d));
        let mut merged = Vec::with_capacity(front.len() + self.dirs.len());
        for dir in front {
            if !merged.contains(&dir) {
                merged.push(dir);
            }
        }
        merged.append(&mut self.dirs);
        self.dirs = merged;
    }

    /// Add `dir` at the end unless already present
    pub fn append(&mut self, dir: PathBuf) {
        if !self.dirs.contains(&dir) {
            self.dirs.push(dir);
        }
    }

    /// Directories in lookup order
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// First existing `<dir>/<relative>`
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Option<PathBuf> {
        let relative = relative.as_ref();
        self.dirs
            .iter()
            .map(|dir| dir.join(relative))
            .find(|candidate| candidate.exists())
    }
}

/// Worker start-up sequence
#[derive(Debug)]
pub struct WorkerBootstrap {
    settings: WorkerSettings,
    transport: TransportConfig,
    watchdog_interval: Option<Duration>,
}

impl WorkerBootstrap {
    /// `defaults` supplies timeouts; strategy and rendezvous root come from
    /// `settings`
    pub fn new(settings: WorkerSettings, defaults: TransportConfig) -> Self {
        let transport = TransportConfig {
            strategy: settings.strategy,
            ipc_dir: Some(settings.ipc_dir.clone()),
            ..defaults
        };
        let watchdog_interval = match settings.watchdog_interval {
            Some(interval) if interval.is_zero() => None,
            Some(interval) => Some(interval),
            None => Some(watchdog::DEFAULT_POLL_INTERVAL),
        };
        Self {
            settings,
            transport,
            watchdog_interval,
        }
    }

    /// Bootstrap from the process environment
    ///
    /// # Errors
    ///
    /// See [`WorkerSettings::from_env`].
    pub fn from_env(defaults: TransportConfig) -> Result<Self> {
        Ok(Self::new(WorkerSettings::from_env()?, defaults))
    }

    /// Poll the host at `interval`, or never with `None`
    #[must_use]
    pub fn with_watchdog(mut self, interval: Option<Duration>) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Settings received from the host
    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Join the bridge serving `registry` and start the watchdog
    ///
    /// Pending calls are kept: the host may have queued calls before the
    /// worker came up.
    pub async fn launch(self, registry: CallbackRegistry) -> Result<WorkerRuntime> {
        let search_path = SearchPath::new([
            self.settings.install_dir.clone(),
            self.settings.extension_dir.clone(),
        ]);

        let context = IpcContext::new(ProcessRole::Worker, self.transport)?;
        let bridge = context
            .install_bridge(registry, InstallOptions { clear_on_init: false })
            .await?;

        let watchdog = self.watchdog_interval.map(|interval| {
            LivenessWatchdog::exit_on_orphan(self.settings.host_pid, interval)
        });

        tracing::info!(
            host_pid = self.settings.host_pid,
            strategy = %self.settings.strategy,
            extension_dir = %self.settings.extension_dir.display(),
            "Worker joined the bridge"
        );

        Ok(WorkerRuntime {
            settings: self.settings,
            search_path,
            context,
            bridge,
            watchdog,
        })
    }
}

/// A running worker's bridge state
pub struct WorkerRuntime {
    settings: WorkerSettings,
    search_path: SearchPath,
    context: IpcContext,
    bridge: Bridge,
    watchdog: Option<LivenessWatchdog>,
}

impl WorkerRuntime {
    /// Settings received from the host
    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Module search path for worker extensions
    pub fn search_path(&self) -> &SearchPath {
        &self.search_path
    }

    /// Worker side IPC context
    pub fn context(&self) -> &IpcContext {
        &self.context
    }

    /// Proxy into the host
    pub fn proxy(&self) -> Arc<CallbackProxy> {
        self.bridge.proxy()
    }

    /// Callbacks served to the host
    pub fn registry(&self) -> &CallbackRegistry {
        self.bridge.registry()
    }

    /// Stop the watchdog and leave the bridge
    pub async fn shutdown(self) {
        if let Some(watchdog) = self.watchdog {
            watchdog.stop().await;
        }
        self.bridge.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_settings_from_complete_environment() {
        let settings = WorkerSettings::from_lookup(
            lookup_from(&[
                (ENV_EXTENSION_DIR, "/ext"),
                (ENV_TRANSPORT, "file"),
                (ENV_IPC_DIR, "/run/bridge"),
                (ENV_HOST_PID, "1234"),
                (ENV_WATCHDOG_INTERVAL, "250"),
            ]),
            PathBuf::from("/opt/engine"),
        )
        .unwrap();

        assert_eq!(settings.extension_dir, PathBuf::from("/ext"));
        assert_eq!(settings.strategy, TransportStrategy::File);
        assert_eq!(settings.ipc_dir, PathBuf::from("/run/bridge"));
        assert_eq!(settings.host_pid, 1234);
        assert_eq!(settings.install_dir, PathBuf::from("/opt/engine"));
        assert_eq!(settings.watchdog_interval, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_optional_settings_default() {
        let settings = WorkerSettings::from_lookup(
            lookup_from(&[(ENV_EXTENSION_DIR, "/ext"), (ENV_TRANSPORT, "FILE")]),
            PathBuf::from("/opt/engine"),
        )
        .unwrap();

        assert_eq!(settings.ipc_dir, PathBuf::from("/ext/.ipc"));
        assert_eq!(settings.watchdog_interval, None);
        #[cfg(unix)]
        assert_eq!(settings.host_pid, std::os::unix::process::parent_id());
    }

    #[test]
    fn test_missing_variables_fail_fast() {
        let err = WorkerSettings::from_lookup(
            lookup_from(&[(ENV_TRANSPORT, "file")]),
            PathBuf::from("/opt/engine"),
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::MissingEnvironment(ENV_EXTENSION_DIR)));

        let err = WorkerSettings::from_lookup(
            lookup_from(&[(ENV_EXTENSION_DIR, "/ext")]),
            PathBuf::from("/opt/engine"),
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::MissingEnvironment(ENV_TRANSPORT)));
    }

    #[test]
    fn test_unknown_strategy_is_a_mismatch() {
        let err = WorkerSettings::from_lookup(
            lookup_from(&[(ENV_EXTENSION_DIR, "/ext"), (ENV_TRANSPORT, "shared-memory")]),
            PathBuf::from("/opt/engine"),
        )
        .unwrap_err();
        match err {
            BridgeError::TransportStrategyMismatch {
                received,
                supported,
            } => {
                assert_eq!(received, "shared-memory");
                assert!(supported.contains("file"));
            }
            other => panic!("expected TransportStrategyMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_watchdog_interval_disables_watchdog() {
        let settings = WorkerSettings::from_lookup(
            lookup_from(&[
                (ENV_EXTENSION_DIR, "/ext"),
                (ENV_TRANSPORT, "file"),
                (ENV_WATCHDOG_INTERVAL, "0"),
            ]),
            PathBuf::from("/opt/engine"),
        )
        .unwrap();
        let bootstrap = WorkerBootstrap::new(settings, TransportConfig::default());
        assert_eq!(bootstrap.watchdog_interval, None);
    }

    #[test]
    fn test_search_path_prepend_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join("install");
        let ext = dir.path().join("ext");
        std::fs::create_dir_all(&install).unwrap();
        std::fs::create_dir_all(ext.join("nodes")).unwrap();
        std::fs::write(ext.join("nodes/custom.json"), b"{}").unwrap();

        let mut path = SearchPath::new([PathBuf::from("/usr/lib/engine")]);
        path.prepend([install.clone(), ext.clone(), install.clone()]);

        assert_eq!(
            path.dirs(),
            &[install, ext.clone(), PathBuf::from("/usr/lib/engine")]
        );
        assert_eq!(path.resolve("nodes/custom.json"), Some(ext.join("nodes/custom.json")));
        assert_eq!(path.resolve("missing.txt"), None);
    }
}
