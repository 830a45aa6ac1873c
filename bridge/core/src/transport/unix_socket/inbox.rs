//! Receiving side of the socket strategy
//!
//! One listening socket per inbox. Every accepted connection gets a reader
//! task that decodes frames into a shared inbound queue.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::transport::frame::FrameDecoder;
use crate::transport::traits::TransportError;

/// Bounded so a stalled receiver applies backpressure to senders.
const INBOUND_CAPACITY: usize = 256;

/// Listening socket for one inbox
///
/// The socket is bound eagerly so peers can connect before the first
/// receive; the accept loop is spawned lazily because binding may happen
/// outside the runtime.
pub(crate) struct InboxListener {
    socket_path: PathBuf,
    pending: Option<std::os::unix::net::UnixListener>,
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
    accept_task: Option<JoinHandle<()>>,
}

impl InboxListener {
    pub(crate) fn bind(socket_path: PathBuf) -> Result<Self, TransportError> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create directory {parent:?}: {e}"),
                ))
            })?;
        }

        // A socket file left behind by a crashed session
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                TransportError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to remove old socket {socket_path:?}: {e}"),
                ))
            })?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;

        tracing::debug!(path = ?socket_path, "Inbox socket bound");

        Ok(Self {
            socket_path,
            pending: Some(listener),
            inbound: None,
            accept_task: None,
        })
    }

    pub(crate) fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn ensure_running(&mut self) -> Result<&mut mpsc::Receiver<Vec<u8>>, TransportError> {
        if self.inbound.is_none() {
            let std_listener = self
                .pending
                .take()
                .ok_or_else(|| TransportError::InvalidState("Inbox listener is closed".into()))?;
            let listener = UnixListener::from_std(std_listener)?;
            let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
            self.accept_task = Some(tokio::spawn(accept_loop(
                listener,
                tx,
                self.socket_path.clone(),
            )));
            self.inbound = Some(rx);
        }
        self.inbound
            .as_mut()
            .ok_or_else(|| TransportError::InvalidState("Inbox listener is not running".into()))
    }

    pub(crate) async fn recv(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let inbound = self.ensure_running()?;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Err(_) => Ok(None),
        }
    }

    /// Drop everything already queued; returns the number dropped
    pub(crate) fn drain(&mut self) -> Result<usize, TransportError> {
        let inbound = self.ensure_running()?;
        let mut drained = 0;
        while inbound.try_recv().is_ok() {
            drained += 1;
        }
        Ok(drained)
    }
}

impl Drop for InboxListener {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                tracing::warn!(path = ?self.socket_path, error = %e, "Failed to remove socket file");
            }
        }
    }
}

async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<Vec<u8>>, socket_path: PathBuf) {
    // Dropping the set aborts every reader when this task is aborted.
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    tracing::trace!(path = ?socket_path, "Accepted sender connection");
                    readers.spawn(read_frames(stream, tx.clone()));
                }
                Err(e) => {
                    tracing::warn!(path = ?socket_path, error = %e, "Accept failed, inbox closed");
                    break;
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

async fn read_frames(mut stream: UnixStream, tx: mpsc::Sender<Vec<u8>>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                tracing::trace!("Sender connection closed");
                return;
            }
            Ok(n) => {
                decoder.push(&buf[..n]);

                // Decode all available frames
                loop {
                    match decoder.decode() {
                        Ok(Some(payload)) => {
                            if tx.send(payload).await.is_err() {
                                tracing::debug!("Inbox receiver dropped");
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // The stream cannot be resynchronized after a bad frame
                            tracing::warn!(error = %e, "Frame decode error, dropping connection");
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Read error");
                return;
            }
        }
    }
}
