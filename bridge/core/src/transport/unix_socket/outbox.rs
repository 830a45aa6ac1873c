//! Sending side of the socket strategy
//!
//! Keeps one connection per peer mailbox so frames to the same peer stay
//! in send order.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::Instant;

use crate::transport::traits::{MailboxId, TransportError};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Default)]
pub(crate) struct Outbox {
    connections: HashMap<MailboxId, UnixStream>,
}

impl Outbox {
    /// Write one encoded frame to `peer`, reconnecting once if the cached
    /// connection went stale (peer restarted).
    pub(crate) async fn deliver(
        &mut self,
        peer: &MailboxId,
        socket_path: &Path,
        frame: &[u8],
        connect_timeout: Duration,
    ) -> Result<(), TransportError> {
        if let Some(stream) = self.connections.get_mut(peer) {
            match stream.write_all(frame).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "Cached connection failed, reconnecting");
                    self.connections.remove(peer);
                }
            }
        }

        let mut stream = connect_with_retry(socket_path, connect_timeout).await?;
        stream
            .write_all(frame)
            .await
            .map_err(|e| TransportError::SendFailed(format!("{peer}: {e}")))?;
        self.connections.insert(peer.clone(), stream);
        Ok(())
    }

    /// Forget the cached connection to `peer`; returns whether one existed
    pub(crate) fn disconnect(&mut self, peer: &MailboxId) -> bool {
        self.connections.remove(peer).is_some()
    }
}

/// Connect, retrying with backoff while the peer is not yet listening
async fn connect_with_retry(
    socket_path: &Path,
    connect_timeout: Duration,
) -> Result<UnixStream, TransportError> {
    let deadline = Instant::now() + connect_timeout;
    let mut delay = INITIAL_RETRY_DELAY;

    loop {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() + delay < deadline => {
                tracing::trace!(path = ?socket_path, error = %e, "Peer not listening yet, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
            Err(e) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "Failed to connect to {socket_path:?}: {e}"
                )))
            }
        }
    }
}
