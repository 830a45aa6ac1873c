//! Unix Socket Transport
//!
//! Each inbox is a Unix domain socket under the rendezvous root.
//!
//! # Socket Location
//!
//! `<root>/<mailbox>.sock`, e.g. `<root>/worker.calls.sock`
//!
//! # Security
//!
//! - Socket created with mode 0600 (owner-only access)
//! - No network exposure (Unix domain sockets only)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                       ┌──────────────────┐
//! │  Host process    │                       │  Worker process  │
//! │                  │   worker.calls.sock   │                  │
//! │  Outbox ────────►├──────────────────────►│ InboxListener    │
//! │                  │                       │                  │
//! │  InboxListener ◄─┤◄──────────────────────┤──────── Outbox   │
//! │                  │   host.results.sock   │                  │
//! └──────────────────┘                       └──────────────────┘
//! ```

mod inbox;
mod outbox;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::config::TransportStrategy;
use super::frame;
use super::traits::{MailboxId, Transport, TransportError};
use inbox::InboxListener;
use outbox::Outbox;

/// Socket path for a mailbox under `root`
#[must_use]
pub fn socket_path_for(root: &Path, mailbox: &MailboxId) -> PathBuf {
    root.join(format!("{}.sock", mailbox.as_str()))
}

/// Socket-strategy transport bound to one inbox
pub struct UnixSocketTransport {
    root: PathBuf,
    inbox: MailboxId,
    listener: InboxListener,
    outbox: Outbox,
    connect_timeout: Duration,
}

impl UnixSocketTransport {
    /// Bind the inbox socket
    ///
    /// Does not need a running runtime; the accept loop starts on the first
    /// receive.
    pub fn bind(
        root: &Path,
        inbox: MailboxId,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = InboxListener::bind(socket_path_for(root, &inbox))?;
        tracing::info!(path = ?listener.socket_path(), inbox = %inbox, "Listening on Unix socket");
        Ok(Self {
            root: root.to_path_buf(),
            inbox,
            listener,
            outbox: Outbox::default(),
            connect_timeout,
        })
    }

    /// Path of the inbox socket file
    pub fn socket_path(&self) -> &Path {
        self.listener.socket_path()
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    fn strategy(&self) -> TransportStrategy {
        TransportStrategy::Socket
    }

    fn inbox(&self) -> &MailboxId {
        &self.inbox
    }

    async fn send(&mut self, peer: &MailboxId, payload: &[u8]) -> Result<(), TransportError> {
        let frame = frame::encode_frame(payload)?;
        let path = socket_path_for(&self.root, peer);
        self.outbox
            .deliver(peer, &path, &frame, self.connect_timeout)
            .await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        self.listener.recv(timeout).await
    }

    async fn clear(&mut self, mailbox: &MailboxId) -> Result<usize, TransportError> {
        if *mailbox == self.inbox {
            return self.listener.drain();
        }
        // Undelivered bytes for a peer live in the dropped connection.
        self.outbox.disconnect(mailbox);
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::ProcessRole;

    #[tokio::test]
    async fn test_socket_roundtrip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = UnixSocketTransport::bind(
            dir.path(),
            MailboxId::calls(ProcessRole::Worker),
            Duration::from_secs(1),
        )
        .unwrap();
        let mut host = UnixSocketTransport::bind(
            dir.path(),
            MailboxId::results(ProcessRole::Host),
            Duration::from_secs(1),
        )
        .unwrap();

        let peer = MailboxId::calls(ProcessRole::Worker);
        for i in 0..10u8 {
            host.send(&peer, &[i; 3]).await.unwrap();
        }
        for i in 0..10u8 {
            let got = worker.receive(Duration::from_secs(1)).await.unwrap();
            assert_eq!(got, Some(vec![i; 3]));
        }
    }

    #[tokio::test]
    async fn test_socket_file_permissions_and_cleanup() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let inbox = MailboxId::calls(ProcessRole::Host);
        let path = socket_path_for(dir.path(), &inbox);

        let transport =
            UnixSocketTransport::bind(dir.path(), inbox, Duration::from_secs(1)).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(transport);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = MailboxId::calls(ProcessRole::Worker);
        std::fs::write(socket_path_for(dir.path(), &inbox), b"left over").unwrap();

        let transport = UnixSocketTransport::bind(dir.path(), inbox, Duration::from_secs(1));
        assert!(transport.is_ok());
    }

    #[tokio::test]
    async fn test_send_to_absent_peer_fails_after_connect_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = UnixSocketTransport::bind(
            dir.path(),
            MailboxId::results(ProcessRole::Host),
            Duration::from_millis(100),
        )
        .unwrap();

        let result = host
            .send(&MailboxId::calls(ProcessRole::Worker), b"nobody home")
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_clear_drains_own_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = MailboxId::calls(ProcessRole::Worker);
        let mut worker =
            UnixSocketTransport::bind(dir.path(), inbox.clone(), Duration::from_secs(1)).unwrap();
        let mut host = UnixSocketTransport::bind(
            dir.path(),
            MailboxId::results(ProcessRole::Host),
            Duration::from_secs(1),
        )
        .unwrap();

        host.send(&inbox, b"stale").await.unwrap();
        // Start the accept loop and let the frame land in the queue
        assert_eq!(
            worker.receive(Duration::from_secs(1)).await.unwrap(),
            Some(b"stale".to_vec())
        );
        host.send(&inbox, b"also stale").await.unwrap();
        host.send(&inbox, b"still stale").await.unwrap();

        let mut drained = 0;
        for _ in 0..50 {
            drained += worker.clear(&inbox).await.unwrap();
            if drained == 2 {
                break;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(drained, 2);
        assert!(worker
            .receive(Duration::from_millis(30))
            .await
            .unwrap()
            .is_none());
    }
}
