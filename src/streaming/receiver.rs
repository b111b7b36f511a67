//! Receiver side of a transfer session.
//!
//! Reads the filename, writes the chunk stream into a temp file next to the
//! destination and renames it into place. The reply stream is closed in every
//! outcome so the sender is never left waiting; on failure it first carries
//! one string describing the error.

use crate::error::{Result, TransferError};
use crate::server::ConnectionId;
use crate::streaming::channel::{with_deadline, StreamSink, StreamSource, TransferStats};
use crate::streaming::pipeline::{receive_chunks, BufferPair, Deadlines, TransferState};
use crate::streaming::protocol::DEFAULT_BLOCK_SIZE;
use crate::streaming::storage::{StagedFile, StorageOptions};
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

/// Validate a filename received from the wire and join it onto `root`.
///
/// Only a single plain path component is accepted: no separators, no `.` or
/// `..`, no absolute or prefixed paths.
pub fn validate_filename(root: &Path, raw: &[u8]) -> Result<PathBuf> {
    let name = std::str::from_utf8(raw)
        .map_err(|_| TransferError::InvalidFilename(String::from_utf8_lossy(raw).into_owned()))?;

    // Reject empty paths
    if name.is_empty() {
        return Err(TransferError::InvalidFilename(String::new()));
    }

    // Separators of any platform, and NUL which no filesystem accepts
    if name.contains(['/', '\\', '\0']) {
        return Err(TransferError::InvalidFilename(name.to_string()));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == name => Ok(root.join(c)),
        _ => Err(TransferError::InvalidFilename(name.to_string())),
    }
}

/// Longest a failed transfer keeps reading the sender's remaining data when
/// no `io_timeout` is configured.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Directory uploaded files land in
    pub root: PathBuf,
    /// Block size; must match the sender's
    pub block_size: usize,
    /// Deadline for each storage or stream operation
    pub io_timeout: Option<Duration>,
    /// Write the destination with unbuffered I/O
    pub direct_io: bool,
}

impl ReceiverConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            io_timeout: None,
            direct_io: false,
        }
    }
}

/// Receiver state
pub struct Receiver {
    config: ReceiverConfig,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Run one transfer over an accepted stream pair.
    ///
    /// `reply` is closed before returning, on success and on failure.
    pub async fn receive<R, S>(
        &self,
        conn: ConnectionId,
        source: &mut R,
        reply: &mut S,
    ) -> Result<TransferStats>
    where
        R: StreamSource + ?Sized,
        S: StreamSink + ?Sized,
    {
        let started = Instant::now();
        let mut state = TransferState::default();
        let result = self.run(conn, source, &mut state).await;

        let limit = self.config.io_timeout;

        // A failure is reported as a single string ahead of closure; the
        // sender treats any value on this stream as a rejection.
        if let Err(e) = &result {
            let report = format!("{}: {}", e.kind(), e);
            let sent = reply.send(report.as_bytes());
            if let Err(send_err) = with_deadline(limit, "stream send", sent).await {
                tracing::debug!(%conn, "could not report failure to sender: {send_err}");
            }
        }

        tracing::debug!(%conn, "closing reply stream");
        let closed = with_deadline(limit, "stream close", reply.close()).await;

        // Unread inbound data would make the transport reset the connection
        // and discard the report before the sender reads it.
        if result.is_err() {
            self.drain(conn, source).await;
        }

        match result {
            Ok(dest) => {
                closed?;
                let stats = TransferStats::finish(state.offset, state.chunks, started);
                tracing::info!(
                    %conn,
                    dest = %dest.display(),
                    bytes = stats.bytes,
                    chunks = stats.chunks,
                    "transfer complete"
                );
                Ok(stats)
            }
            Err(e) => {
                tracing::error!(
                    %conn,
                    kind = %e.kind(),
                    offset = state.offset,
                    "transfer failed: {e}"
                );
                if let Err(close_err) = closed {
                    tracing::warn!(%conn, "failed to close reply stream: {close_err}");
                }
                Err(e)
            }
        }
    }

    /// Discard inbound values until the sender closes, bounded by
    /// `io_timeout` or [`DRAIN_TIMEOUT`].
    async fn drain<R>(&self, conn: ConnectionId, source: &mut R)
    where
        R: StreamSource + ?Sized,
    {
        let limit = self.config.io_timeout.unwrap_or(DRAIN_TIMEOUT);
        let discard = async {
            let mut bytes = 0u64;
            while let Ok(Some(value)) = source.receive().await {
                bytes += value.len() as u64;
            }
            bytes
        };
        match tokio::time::timeout(limit, discard).await {
            Ok(bytes) => tracing::debug!(%conn, bytes, "drained inbound stream"),
            Err(_) => tracing::debug!(%conn, "gave up draining inbound stream"),
        }
    }

    async fn run<R>(
        &self,
        conn: ConnectionId,
        source: &mut R,
        state: &mut TransferState,
    ) -> Result<PathBuf>
    where
        R: StreamSource + ?Sized,
    {
        let deadlines = Deadlines {
            io_timeout: self.config.io_timeout,
        };

        let filename: Bytes =
            with_deadline(deadlines.io_timeout, "stream receive", source.receive())
                .await?
                .ok_or_else(|| TransferError::protocol("stream closed before filename"))?;
        let dest = validate_filename(&self.config.root, &filename)?;
        tracing::debug!(%conn, dest = %dest.display(), "creating destination");

        let storage = StorageOptions {
            direct_io: self.config.direct_io,
        };
        let (file, staged) = StagedFile::create(&dest, storage).await?;
        tracing::trace!(%conn, temp = %staged.temp_path().display(), "staging");

        let mut buffers = BufferPair::new(self.config.block_size);
        receive_chunks(source, &file, &mut buffers, state, deadlines).await?;

        // Release the handle before the rename
        drop(file);
        staged.commit().await?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::streaming::channel::memory_pair;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_validate_filename_accepts_plain_names() {
        let root = Path::new("/srv/uploads");
        assert_eq!(
            validate_filename(root, b"report.csv").unwrap(),
            root.join("report.csv")
        );
        assert_eq!(
            validate_filename(root, b".hidden").unwrap(),
            root.join(".hidden")
        );
    }

    #[test]
    fn test_validate_filename_rejects_traversal() {
        let root = Path::new("/srv/uploads");
        for bad in [
            &b""[..],
            b"..",
            b".",
            b"../etc/passwd",
            b"/etc/passwd",
            b"a/b",
            b"a\\b",
            b"nul\0byte",
            &[0xff, 0xfe],
        ] {
            let err = validate_filename(root, bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ProtocolViolation, "{bad:?}");
        }
    }

    #[tokio::test]
    async fn test_receiver_basic() {
        let tmp = TempDir::new().unwrap();
        let receiver = Receiver::new(ReceiverConfig::new(tmp.path()));

        let (mut wire_sink, mut wire_source) = memory_pair();
        let (mut reply_sink, mut reply_source) = memory_pair();

        let sender = tokio::spawn(async move {
            wire_sink.send(b"test.txt").await.unwrap();
            wire_sink.send(b"hello world").await.unwrap();
            wire_sink.close().await.unwrap();
            reply_source.receive().await.unwrap()
        });

        let stats = receiver
            .receive(ConnectionId::new(1), &mut wire_source, &mut reply_sink)
            .await
            .unwrap();
        assert!(sender.await.unwrap().is_none());

        assert_eq!(stats.bytes, 11);
        assert_eq!(stats.chunks, 1);
        let content = fs::read_to_string(tmp.path().join("test.txt")).unwrap();
        assert_eq!(content, "hello world");
    }

    #[tokio::test]
    async fn test_receiver_overwrites_existing() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.bin"), vec![1u8; 9000]).unwrap();
        let receiver = Receiver::new(ReceiverConfig::new(tmp.path()));

        let (mut wire_sink, mut wire_source) = memory_pair();
        let (mut reply_sink, _reply_source) = memory_pair();
        wire_sink.send(b"a.bin").await.unwrap();
        wire_sink.send(b"xy").await.unwrap();
        wire_sink.close().await.unwrap();

        receiver
            .receive(ConnectionId::new(2), &mut wire_source, &mut reply_sink)
            .await
            .unwrap();
        assert_eq!(fs::read(tmp.path().join("a.bin")).unwrap(), b"xy");
    }

    #[tokio::test]
    async fn test_receiver_missing_filename_still_closes_reply() {
        let tmp = TempDir::new().unwrap();
        let receiver = Receiver::new(ReceiverConfig::new(tmp.path()));

        let (mut wire_sink, mut wire_source) = memory_pair();
        let (mut reply_sink, mut reply_source) = memory_pair();
        wire_sink.close().await.unwrap();

        let err = receiver
            .receive(ConnectionId::new(3), &mut wire_source, &mut reply_sink)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        let report = reply_source.receive().await.unwrap().unwrap();
        assert!(report.starts_with(b"protocol_violation: "));
        assert!(reply_source.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receiver_traversal_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("uploads");
        fs::create_dir(&root).unwrap();
        let receiver = Receiver::new(ReceiverConfig::new(&root));

        let (mut wire_sink, mut wire_source) = memory_pair();
        let (mut reply_sink, mut reply_source) = memory_pair();
        wire_sink.send(b"../escaped.txt").await.unwrap();
        wire_sink.send(b"payload").await.unwrap();
        wire_sink.close().await.unwrap();

        let err = receiver
            .receive(ConnectionId::new(4), &mut wire_source, &mut reply_sink)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidFilename(_)));
        assert!(!tmp.path().join("escaped.txt").exists());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
        assert!(reply_source.receive().await.unwrap().is_some());
        assert!(reply_source.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receiver_failure_leaves_no_partial_file() {
        let tmp = TempDir::new().unwrap();
        let mut config = ReceiverConfig::new(tmp.path());
        config.block_size = 512;
        let receiver = Receiver::new(config);

        let (mut wire_sink, mut wire_source) = memory_pair();
        let (mut reply_sink, _reply_source) = memory_pair();

        let sender = tokio::spawn(async move {
            wire_sink.send(b"big.bin").await.unwrap();
            wire_sink.send(&[1u8; 512]).await.unwrap();
            // Larger than the receiver's block size
            let _ = wire_sink.send(&[2u8; 1024]).await;
            let _ = wire_sink.close().await;
        });

        let err = receiver
            .receive(ConnectionId::new(5), &mut wire_source, &mut reply_sink)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        drop(wire_source);
        sender.await.unwrap();

        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
