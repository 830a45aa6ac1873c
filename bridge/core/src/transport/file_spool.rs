//! File Spool Transport
//!
//! Each mailbox is a directory under the rendezvous root. A message is one
//! framed file named so that lexical order is send order:
//!
//! ```text
//! <root>/<mailbox>/<stamp:020>-<seq:012>-<pid>.msg
//! ```
//!
//! Writers stage the frame under a dot-prefixed name and rename it into
//! place, so readers never see a partially written message.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};

use super::{
    config::TransportStrategy,
    frame,
    traits::{MailboxId, Transport, TransportError},
};

const MESSAGE_SUFFIX: &str = ".msg";
const STAGING_SUFFIX: &str = ".tmp";

/// Spool-directory transport
#[derive(Debug)]
pub struct FileSpoolTransport {
    root: PathBuf,
    inbox: MailboxId,
    poll_interval: Duration,
    last_stamp: u128,
    seq: u64,
}

impl FileSpoolTransport {
    /// Open the spool for `inbox`, creating its directory
    pub fn open(
        root: &Path,
        inbox: MailboxId,
        poll_interval: Duration,
    ) -> Result<Self, TransportError> {
        let transport = Self {
            root: root.to_path_buf(),
            inbox,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            last_stamp: 0,
            seq: 0,
        };
        std::fs::create_dir_all(transport.mailbox_dir(&transport.inbox))?;
        Ok(transport)
    }

    /// Directory holding the pending messages of `mailbox`
    pub fn mailbox_dir(&self, mailbox: &MailboxId) -> PathBuf {
        self.root.join(mailbox.as_str())
    }

    fn next_message_name(&mut self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        // Never go backwards, even if the wall clock does.
        self.last_stamp = now.max(self.last_stamp + 1);
        self.seq += 1;
        format!(
            "{:020}-{:012}-{}{MESSAGE_SUFFIX}",
            self.last_stamp,
            self.seq,
            std::process::id()
        )
    }

    async fn oldest_message(&self) -> Result<Option<PathBuf>, TransportError> {
        let dir = self.mailbox_dir(&self.inbox);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut oldest: Option<(String, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(MESSAGE_SUFFIX) {
                continue;
            }
            if oldest.as_ref().map_or(true, |(current, _)| name < *current) {
                oldest = Some((name, entry.path()));
            }
        }
        Ok(oldest.map(|(_, path)| path))
    }

    /// Read, delete and verify the oldest message, skipping corrupt ones
    async fn take_oldest(&self) -> Result<Option<Vec<u8>>, TransportError> {
        while let Some(path) = self.oldest_message().await? {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Raced with a clear
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            remove_if_present(&path).await?;

            match frame::decode_frame(&bytes) {
                Ok(payload) => {
                    tracing::trace!(
                        inbox = %self.inbox,
                        bytes = payload.len(),
                        "Took spooled message"
                    );
                    return Ok(Some(payload));
                }
                Err(e) => {
                    tracing::warn!(
                        inbox = %self.inbox,
                        path = %path.display(),
                        error = %e,
                        "Discarding unreadable spool message"
                    );
                }
            }
        }
        Ok(None)
    }
}

async fn remove_if_present(path: &Path) -> Result<(), TransportError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Transport for FileSpoolTransport {
    fn strategy(&self) -> TransportStrategy {
        TransportStrategy::File
    }

    fn inbox(&self) -> &MailboxId {
        &self.inbox
    }

    async fn send(&mut self, peer: &MailboxId, payload: &[u8]) -> Result<(), TransportError> {
        let frame = frame::encode_frame(payload)?;
        let dir = self.mailbox_dir(peer);
        tokio::fs::create_dir_all(&dir).await?;

        let name = self.next_message_name();
        let staging = dir.join(format!(".{name}{STAGING_SUFFIX}"));
        tokio::fs::write(&staging, &frame)
            .await
            .map_err(|e| TransportError::SendFailed(format!("{}: {e}", staging.display())))?;
        tokio::fs::rename(&staging, dir.join(&name))
            .await
            .map_err(|e| TransportError::SendFailed(format!("{}: {e}", staging.display())))?;

        tracing::trace!(peer = %peer, message = %name, "Spooled message");
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(payload) = self.take_oldest().await? {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, ticker.tick()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn clear(&mut self, mailbox: &MailboxId) -> Result<usize, TransportError> {
        let dir = self.mailbox_dir(mailbox);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut discarded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(MESSAGE_SUFFIX) || name.ends_with(STAGING_SUFFIX) {
                remove_if_present(&entry.path()).await?;
                if !name.starts_with('.') {
                    discarded += 1;
                }
            }
        }
        Ok(discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::ProcessRole;

    const POLL: Duration = Duration::from_millis(5);

    fn pair(root: &Path) -> (FileSpoolTransport, FileSpoolTransport) {
        let host = FileSpoolTransport::open(root, MailboxId::results(ProcessRole::Host), POLL)
            .unwrap();
        let worker =
            FileSpoolTransport::open(root, MailboxId::calls(ProcessRole::Worker), POLL).unwrap();
        (host, worker)
    }

    #[tokio::test]
    async fn test_send_then_receive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, mut worker) = pair(dir.path());
        let worker_calls = MailboxId::calls(ProcessRole::Worker);

        for i in 0..5u8 {
            host.send(&worker_calls, &[i]).await.unwrap();
        }

        for i in 0..5u8 {
            let got = worker.receive(Duration::from_secs(1)).await.unwrap();
            assert_eq!(got, Some(vec![i]));
        }
    }

    #[tokio::test]
    async fn test_receive_times_out_on_empty_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut worker) = pair(dir.path());

        let started = Instant::now();
        let got = worker.receive(Duration::from_millis(50)).await.unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_corrupt_message_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, mut worker) = pair(dir.path());
        let worker_calls = MailboxId::calls(ProcessRole::Worker);

        // Sorts before anything the sender names with a real timestamp.
        let inbox_dir = worker.mailbox_dir(&worker_calls);
        std::fs::write(
            inbox_dir.join("00000000000000000000-000000000000-1.msg"),
            b"garbage",
        )
        .unwrap();
        host.send(&worker_calls, b"valid").await.unwrap();

        let got = worker.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, Some(b"valid".to_vec()));
        assert_eq!(std::fs::read_dir(&inbox_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_staged_files_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut worker) = pair(dir.path());
        let inbox_dir = worker.mailbox_dir(&MailboxId::calls(ProcessRole::Worker));

        std::fs::write(inbox_dir.join(".half-written.msg.tmp"), b"partial").unwrap();

        let got = worker.receive(Duration::from_millis(30)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_clear_discards_pending_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, mut worker) = pair(dir.path());
        let worker_calls = MailboxId::calls(ProcessRole::Worker);

        host.send(&worker_calls, b"stale-1").await.unwrap();
        host.send(&worker_calls, b"stale-2").await.unwrap();

        assert_eq!(worker.clear(&worker_calls).await.unwrap(), 2);
        assert!(worker
            .receive(Duration::from_millis(30))
            .await
            .unwrap()
            .is_none());

        // Clearing a mailbox nobody created is not an error
        let unknown = MailboxId::new("nobody.calls").unwrap();
        assert_eq!(worker.clear(&unknown).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_message_names_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _) = pair(dir.path());

        let names: Vec<String> = (0..100).map(|_| host.next_message_name()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
