//! Transport Factory
//!
//! Registry mapping strategy names to constructors. The host and worker both
//! resolve the agreed strategy name through [`lookup`], so a name one side
//! does not know is detected before any message is exchanged.

use std::path::Path;

use super::{
    config::{TransportConfig, TransportStrategy},
    file_spool::FileSpoolTransport,
    traits::{MailboxId, Transport, TransportError},
};

#[cfg(unix)]
use super::unix_socket::UnixSocketTransport;

/// Constructor for a strategy, bound to one inbox under a rendezvous root
pub type TransportConstructor =
    fn(&Path, MailboxId, &TransportConfig) -> Result<Box<dyn Transport>, TransportError>;

/// One registered strategy
#[derive(Clone, Copy)]
pub struct StrategyEntry {
    /// Strategy produced by this entry
    pub strategy: TransportStrategy,
    /// Accepted spellings, canonical name first
    pub names: &'static [&'static str],
    /// Constructor
    pub open: TransportConstructor,
}

fn open_file_spool(
    root: &Path,
    inbox: MailboxId,
    config: &TransportConfig,
) -> Result<Box<dyn Transport>, TransportError> {
    Ok(Box::new(FileSpoolTransport::open(
        root,
        inbox,
        config.poll_interval(),
    )?))
}

#[cfg(unix)]
fn open_unix_socket(
    root: &Path,
    inbox: MailboxId,
    config: &TransportConfig,
) -> Result<Box<dyn Transport>, TransportError> {
    Ok(Box::new(UnixSocketTransport::bind(
        root,
        inbox,
        config.connect_timeout(),
    )?))
}

const FILE_ENTRY: StrategyEntry = StrategyEntry {
    strategy: TransportStrategy::File,
    names: &["file", "spool", "filesystem"],
    open: open_file_spool,
};

#[cfg(unix)]
const SOCKET_ENTRY: StrategyEntry = StrategyEntry {
    strategy: TransportStrategy::Socket,
    names: &["socket", "unix"],
    open: open_unix_socket,
};

#[cfg(unix)]
static STRATEGIES: &[StrategyEntry] = &[FILE_ENTRY, SOCKET_ENTRY];

#[cfg(not(unix))]
static STRATEGIES: &[StrategyEntry] = &[FILE_ENTRY];

/// All strategies available on this platform
pub fn registered_strategies() -> &'static [StrategyEntry] {
    STRATEGIES
}

/// Canonical names of every registered strategy, comma separated
pub fn supported_names() -> String {
    STRATEGIES
        .iter()
        .map(|entry| entry.names[0])
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolve a strategy by name (case-insensitive, surrounding whitespace ignored)
///
/// # Errors
///
/// Returns `TransportError::UnknownStrategy` if no registered strategy
/// answers to `name`.
pub fn lookup(name: &str) -> Result<TransportStrategy, TransportError> {
    let wanted = name.trim().to_ascii_lowercase();
    STRATEGIES
        .iter()
        .find(|entry| entry.names.iter().any(|n| *n == wanted))
        .map(|entry| entry.strategy)
        .ok_or_else(|| TransportError::UnknownStrategy(name.to_string()))
}

/// Open a transport for `inbox` using the configured strategy
///
/// # Example
///
/// ```ignore
/// use bridge_core::transport::{open_transport, MailboxId, TransportConfig};
/// use bridge_core::ProcessRole;
///
/// let config = TransportConfig::default();
/// let transport = open_transport(&config, MailboxId::calls(ProcessRole::Host))?;
/// ```
pub fn open_transport(
    config: &TransportConfig,
    inbox: MailboxId,
) -> Result<Box<dyn Transport>, TransportError> {
    let entry = STRATEGIES
        .iter()
        .find(|entry| entry.strategy == config.strategy)
        .ok_or_else(|| TransportError::UnknownStrategy(config.strategy.to_string()))?;
    let root = config.resolved_ipc_dir();
    tracing::debug!(
        strategy = %config.strategy,
        root = %root.display(),
        inbox = %inbox,
        "Opening transport"
    );
    (entry.open)(&root, inbox, config)
}
