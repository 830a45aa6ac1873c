//! Worker environment
//!
//! The worker inherits the host environment minus interpreter path
//! variables, plus the variables it needs to join the bridge.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::time::Duration;

use crate::transport::TransportStrategy;

/// Shared extension directory (required by the worker)
pub const ENV_EXTENSION_DIR: &str = "BRIDGE_EXTENSION_DIR";
/// Transport strategy name (required by the worker)
pub const ENV_TRANSPORT: &str = "BRIDGE_TRANSPORT";
/// Rendezvous directory (optional, defaults to `<extension_dir>/.ipc`)
pub const ENV_IPC_DIR: &str = "BRIDGE_IPC_DIR";
/// Host pid watched by the worker (optional, defaults to the parent pid)
pub const ENV_HOST_PID: &str = "BRIDGE_HOST_PID";
/// Watchdog poll interval in milliseconds, `0` disables it (optional)
pub const ENV_WATCHDOG_INTERVAL: &str = "BRIDGE_WATCHDOG_INTERVAL";

/// Temp directory variables that break the worker on Windows when set to a
/// bare relative `tmp`
const TMP_VARS: [&str; 2] = ["TMP", "TEMP"];

/// Snapshot of environment variables handed to the worker
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerEnvironment {
    vars: BTreeMap<OsString, OsString>,
}

impl WorkerEnvironment {
    /// Copy of the current process environment
    pub fn inherit() -> Self {
        std::env::vars_os().collect()
    }

    /// Value of `name`, if set
    pub fn get(&self, name: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(name.as_ref()).map(OsString::as_os_str)
    }

    /// Set or replace a variable
    pub fn set(&mut self, name: impl Into<OsString>, value: impl Into<OsString>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Remove a variable; returns whether it was present
    pub fn remove(&mut self, name: impl AsRef<OsStr>) -> bool {
        self.vars.remove(name.as_ref()).is_some()
    }

    /// Variables in name order
    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    /// Number of variables
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether no variable is set
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K: Into<OsString>, V: Into<OsString>> FromIterator<(K, V)> for WorkerEnvironment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Values injected into the worker environment
#[derive(Clone, Debug)]
pub struct BridgeVariables<'a> {
    /// Transport the host selected
    pub strategy: TransportStrategy,
    /// Shared extension directory
    pub extension_dir: &'a Path,
    /// Rendezvous directory
    pub ipc_dir: &'a Path,
    /// Pid the worker watches
    pub host_pid: u32,
    /// Left unset, the worker uses its own default
    pub watchdog_interval: Option<Duration>,
}

/// Temp-directory variables set to the literal `tmp`
pub fn problematic_tmp_vars(env: &WorkerEnvironment) -> Vec<&'static str> {
    TMP_VARS
        .into_iter()
        .filter(|name| env.get(name).is_some_and(|v| v == "tmp"))
        .collect()
}

/// Derive the worker environment from `base`
pub fn build_worker_environment(
    mut base: WorkerEnvironment,
    stripped: &[String],
    bridge: &BridgeVariables<'_>,
) -> WorkerEnvironment {
    for name in stripped {
        if base.remove(name) {
            tracing::debug!(var = %name, "Stripped variable from worker environment");
        }
    }

    if cfg!(windows) {
        for var in problematic_tmp_vars(&base) {
            tracing::warn!(
                var,
                "Temp directory variable is set to 'tmp'; the worker may fail to create temporary files"
            );
        }
    }

    base.set(ENV_EXTENSION_DIR, bridge.extension_dir);
    base.set(ENV_TRANSPORT, bridge.strategy.name());
    base.set(ENV_IPC_DIR, bridge.ipc_dir);
    base.set(ENV_HOST_PID, bridge.host_pid.to_string());
    match bridge.watchdog_interval {
        Some(interval) => base.set(ENV_WATCHDOG_INTERVAL, interval.as_millis().to_string()),
        None => {
            base.remove(ENV_WATCHDOG_INTERVAL);
        }
    }
    base
}
