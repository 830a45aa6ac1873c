//! Transport Traits
//!
//! Core trait definitions for moving framed envelopes between the host and
//! worker processes.
//!
//! Each process owns named mailboxes. A transport instance is bound to one
//! inbox it receives from, and can send to any peer mailbox under the same
//! rendezvous root.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use super::config::TransportStrategy;
use crate::role::ProcessRole;

/// Name of a mailbox under the rendezvous root
///
/// Mailboxes are named `<role>.calls` (call envelopes addressed to a role)
/// and `<role>.results` (result envelopes addressed back to a caller).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailboxId(String);

impl MailboxId {
    /// Mailbox receiving call envelopes for `role`
    #[must_use]
    pub fn calls(role: ProcessRole) -> Self {
        Self(format!("{role}.calls"))
    }

    /// Mailbox receiving result envelopes for calls made by `role`
    #[must_use]
    pub fn results(role: ProcessRole) -> Self {
        Self(format!("{role}.results"))
    }

    /// Build a mailbox from an arbitrary name
    ///
    /// Names become file and socket names, so only ASCII alphanumerics,
    /// `.`, `-` and `_` are accepted.
    pub fn new(name: impl Into<String>) -> Result<Self, TransportError> {
        let name = name.into();
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if valid {
            Ok(Self(name))
        } else {
            Err(TransportError::InvalidMailbox(name))
        }
    }

    /// The mailbox name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during transport operations
#[derive(Debug)]
pub enum TransportError {
    /// Connection to peer failed
    ConnectionFailed(String),
    /// Connection was closed
    ConnectionClosed,
    /// Failed to send message
    SendFailed(String),
    /// Frame encoding or decoding error
    Frame(String),
    /// IO error from underlying transport
    IoError(std::io::Error),
    /// Transport not in expected state
    InvalidState(String),
    /// Mailbox name is not usable as a file or socket name
    InvalidMailbox(String),
    /// No strategy is registered under this name
    UnknownStrategy(String),
    /// Frame checksum mismatch - data corruption detected
    ChecksumMismatch {
        /// Expected checksum value
        expected: u32,
        /// Actual checksum value received
        actual: u32,
    },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Frame(msg) => write!(f, "Frame error: {msg}"),
            Self::IoError(e) => write!(f, "IO error: {e}"),
            Self::InvalidState(msg) => write!(f, "Invalid state: {msg}"),
            Self::InvalidMailbox(name) => write!(f, "Invalid mailbox name: {name:?}"),
            Self::UnknownStrategy(name) => write!(f, "Unknown transport strategy: {name:?}"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "Checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
            ),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

/// A message-moving strategy bound to one inbox
///
/// Implementations must deliver payloads sent to the same mailbox by one
/// sender in send order, must not block past the timeout given to
/// [`Transport::receive`], and must never hand out a payload whose frame
/// failed verification.
#[async_trait]
pub trait Transport: Send {
    /// Strategy implemented by this transport
    fn strategy(&self) -> TransportStrategy;

    /// The mailbox this transport receives from
    fn inbox(&self) -> &MailboxId;

    /// Deliver one payload to a peer mailbox
    async fn send(&mut self, peer: &MailboxId, payload: &[u8]) -> Result<(), TransportError>;

    /// Take the oldest pending payload from the inbox
    ///
    /// Returns `Ok(None)` when nothing arrived within `timeout`.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

    /// Discard everything pending for `mailbox`
    ///
    /// Returns the number of discarded messages where the strategy can count
    /// them.
    async fn clear(&mut self, mailbox: &MailboxId) -> Result<usize, TransportError>;
}
