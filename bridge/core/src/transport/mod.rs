//! Transport Layer for host/worker IPC
//!
//! Provides abstraction over the local mechanisms that move envelopes
//! between the two processes:
//! - `file`: spool directory per mailbox (all platforms)
//! - `socket`: Unix domain socket per mailbox (Unix only)
//!
//! # Design Philosophy
//!
//! The transport layer only moves opaque framed payloads. Envelopes,
//! correlation and dispatch live above it, so a strategy can be swapped by
//! name without touching the listener or proxy.
//!
//! # Security
//!
//! - Socket files are created with 0600 permissions
//! - No network exposure

pub mod config;
pub mod factory;
pub mod file_spool;
pub mod frame;
pub mod traits;
#[cfg(unix)]
pub mod unix_socket;

// Re-exports for convenience
pub use config::{default_ipc_dir, TransportConfig, TransportStrategy};
pub use factory::{lookup, open_transport, registered_strategies, supported_names};
pub use file_spool::FileSpoolTransport;
pub use frame::FrameDecoder;
pub use traits::{MailboxId, Transport, TransportError};

#[cfg(unix)]
pub use unix_socket::UnixSocketTransport;
