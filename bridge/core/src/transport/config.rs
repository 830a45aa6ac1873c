//! Transport Configuration
//!
//! Configuration types for selecting and tuning the transport strategy.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::factory;
use super::traits::TransportError;

/// Transport strategy selection
///
/// Both processes must agree on the strategy; the host passes its choice to
/// the worker by name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStrategy {
    /// One spool directory per mailbox, one file per message
    ///
    /// Works on every platform and survives either side restarting.
    #[default]
    File,

    /// Unix domain socket per mailbox
    ///
    /// Lower latency; pending messages live in kernel buffers and the
    /// receiver's queue rather than on disk.
    #[cfg(unix)]
    Socket,
}

impl TransportStrategy {
    /// Canonical strategy name, as passed between processes
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::File => "file",
            #[cfg(unix)]
            Self::Socket => "socket",
        }
    }
}

impl fmt::Display for TransportStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransportStrategy {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        factory::lookup(s)
    }
}

/// Transport configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Which strategy to use
    pub strategy: TransportStrategy,

    /// Rendezvous root shared by both processes (None = use default)
    ///
    /// Default: $XDG_RUNTIME_DIR/callback-bridge
    /// Fallback: /tmp/callback-bridge-$UID
    pub ipc_dir: Option<PathBuf>,

    /// How long a proxy waits for a matching result, in milliseconds
    pub call_timeout_ms: u64,

    /// Spool directory polling interval for the file strategy, in milliseconds
    pub poll_interval_ms: u64,

    /// How long the socket strategy keeps retrying a peer that is not yet
    /// listening, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            strategy: TransportStrategy::default(),
            ipc_dir: None,
            call_timeout_ms: 30_000,
            poll_interval_ms: 20,
            connect_timeout_ms: 5000,
        }
    }
}

impl TransportConfig {
    /// Configuration using the given strategy and rendezvous root
    pub fn with_strategy(strategy: TransportStrategy, ipc_dir: impl Into<PathBuf>) -> Self {
        Self {
            strategy,
            ipc_dir: Some(ipc_dir.into()),
            ..Default::default()
        }
    }

    /// Rendezvous root, falling back to [`default_ipc_dir`]
    pub fn resolved_ipc_dir(&self) -> PathBuf {
        self.ipc_dir.clone().unwrap_or_else(default_ipc_dir)
    }

    /// Proxy call timeout
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Spool polling interval (never zero)
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Socket connect retry budget
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Get the default rendezvous root
///
/// Uses XDG_RUNTIME_DIR if available, otherwise a per-user directory in /tmp
pub fn default_ipc_dir() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        return runtime_dir.join("callback-bridge");
    }
    #[cfg(unix)]
    {
        // SAFETY: getuid has no preconditions and cannot fail
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/callback-bridge-{uid}"))
    }
    #[cfg(not(unix))]
    {
        std::env::temp_dir().join("callback-bridge")
    }
}
