//! Bridge errors

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::role::ProcessRole;
use crate::transport::TransportError;

/// Errors surfaced by the callback bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A role-restricted callable was invoked from the wrong process
    #[error("{callable} is restricted to the {required} process but was invoked {}", invoked_in(.active))]
    WrongProcessRole {
        /// What was invoked
        callable: String,
        /// Role the callable is bound to
        required: ProcessRole,
        /// Role of the invoking process; `None` before any role was set
        active: Option<ProcessRole>,
    },

    /// The process role token was already set to a different role
    #[error("process role is already {active}; cannot become {requested}")]
    RoleAlreadyActive {
        /// Role fixed earlier
        active: ProcessRole,
        /// Role that was asked for
        requested: ProcessRole,
    },

    /// Install location of the worker does not exist
    #[error("worker is not installed: {} does not exist", path.display())]
    WorkerNotInstalled {
        /// Expected install directory
        path: PathBuf,
    },

    /// The worker was handed a strategy name it does not know
    #[error("transport strategy mismatch: worker received {received:?}, supported: {supported}")]
    TransportStrategyMismatch {
        /// Name received from the host
        received: String,
        /// Names this build supports
        supported: String,
    },

    /// A required environment variable is absent
    #[error("required environment variable {0} is not set")]
    MissingEnvironment(&'static str),

    /// No matching result arrived within the bounded wait
    #[error("remote call {identifier} timed out after {timeout:?}")]
    RemoteCallTimeout {
        /// Callback identifier
        identifier: String,
        /// Wait that elapsed
        timeout: Duration,
    },

    /// The remote callback failed; carries its description
    #[error("remote call {identifier} failed: {message}")]
    RemoteExecutionError {
        /// Callback identifier
        identifier: String,
        /// Description reported by the remote side
        message: String,
    },

    /// Nothing is registered under the identifier
    #[error("no callback registered under {identifier} in the {role} process")]
    UnknownCallback {
        /// Callback identifier
        identifier: String,
        /// Role of the registry that was searched
        role: ProcessRole,
    },

    /// A local callback returned an error
    #[error("callback {identifier} failed: {message}")]
    CallbackFailed {
        /// Callback identifier
        identifier: String,
        /// Error description, including its causes
        message: String,
    },

    /// The identifier is already taken in this registry
    #[error("a callback is already registered under {0}")]
    DuplicateCallback(String),

    /// A listener/proxy pair is already installed for this context
    #[error("an IPC bridge is already installed for the {0} process")]
    BridgeAlreadyInstalled(ProcessRole),

    /// Installing the worker's dependencies failed
    #[error("failed to install worker dependencies: {0}")]
    DependencyInstall(String),

    /// The worker process could not be spawned
    #[error("failed to spawn worker {}: {source}", executable.display())]
    Spawn {
        /// Executable that was launched
        executable: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Local filesystem or process I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope (de)serialization failed
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn invoked_in(active: &Option<ProcessRole>) -> String {
    match active {
        Some(role) => format!("in the {role} process"),
        None => "before a process role was set".to_string(),
    }
}

impl BridgeError {
    /// Whether the caller may reasonably retry the operation
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteCallTimeout { .. } | Self::Transport(_))
    }
}

/// Result alias used across the crate
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
