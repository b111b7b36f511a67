//! Sender side of a transfer session.
//!
//! Sends the file's basename as the first string on the stream, runs the
//! sender pipeline over the rest of it, then waits for the receiver to close
//! its reply stream before reporting success. A value on the reply stream is
//! the receiver's failure report.

use crate::error::{Result, TransferError};
use crate::streaming::channel::{with_deadline, StreamSink, StreamSource, TransferStats};
use crate::streaming::pipeline::{send_chunks, BufferPair, Deadlines, TransferState};
use crate::streaming::protocol::DEFAULT_BLOCK_SIZE;
use crate::streaming::storage::{BlockFile, StorageOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How long a failed send waits for the receiver's failure report when no
/// `io_timeout` is configured.
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(2);

/// Sender configuration
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Block size; must match the receiver's
    pub block_size: usize,
    /// Deadline for each storage or stream operation
    pub io_timeout: Option<Duration>,
    /// Open the source with unbuffered I/O
    pub direct_io: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            io_timeout: None,
            direct_io: false,
        }
    }
}

/// Sender state
pub struct Sender {
    config: SenderConfig,
}

/// The name announced to the receiver: the last path component only.
pub fn wire_filename(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .ok_or_else(|| TransferError::InvalidFilename(path.display().to_string()))?;
    name.to_str()
        .map(str::to_owned)
        .ok_or_else(|| TransferError::InvalidFilename(name.to_string_lossy().into_owned()))
}

impl Sender {
    pub fn new(config: SenderConfig) -> Self {
        Self { config }
    }

    /// Transfer the file at `path` over an established stream pair.
    pub async fn send<S, R>(
        &self,
        path: &Path,
        sink: &mut S,
        source: &mut R,
    ) -> Result<TransferStats>
    where
        S: StreamSink + ?Sized,
        R: StreamSource + ?Sized,
    {
        let started = Instant::now();
        let limit = self.config.io_timeout;
        let deadlines = Deadlines { io_timeout: limit };

        let filename = wire_filename(path)?;
        tracing::debug!(file = %path.display(), "opening source");
        let file = BlockFile::open(
            path,
            StorageOptions {
                direct_io: self.config.direct_io,
            },
        )
        .await?;

        tracing::debug!(filename, "sending filename");
        with_deadline(limit, "stream send", sink.send(filename.as_bytes())).await?;

        let mut buffers = BufferPair::new(self.config.block_size);
        let mut state = TransferState::default();
        if let Err(e) = send_chunks(&file, sink, &mut buffers, &mut state, deadlines).await {
            tracing::warn!(
                kind = %e.kind(),
                offset = state.offset,
                file = %path.display(),
                "send failed: {e}"
            );
            // Best effort: the receiver must still see the stream end
            let _ = sink.close().await;

            // A receiver-side failure usually surfaces here as a broken
            // stream; its report explains why.
            let wait = limit.unwrap_or(REPORT_TIMEOUT);
            if let Ok(Ok(Some(report))) = tokio::time::timeout(wait, source.receive()).await {
                return Err(rejected(&report));
            }
            return Err(e);
        }

        // The receiver closes its side once everything is flushed to storage.
        // Anything it sends first is a failure report.
        if let Some(report) = with_deadline(limit, "stream receive", source.receive()).await? {
            return Err(rejected(&report));
        }

        let stats = TransferStats::finish(state.offset, state.chunks, started);
        tracing::info!(
            file = %path.display(),
            bytes = stats.bytes,
            chunks = stats.chunks,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "transfer complete"
        );
        Ok(stats)
    }
}

fn rejected(report: &[u8]) -> TransferError {
    TransferError::protocol(format!(
        "receiver rejected transfer: {}",
        String::from_utf8_lossy(report)
    ))
}

/// Convenience for callers holding owned halves.
pub async fn send_file<S, R>(
    config: SenderConfig,
    path: impl Into<PathBuf>,
    mut sink: S,
    mut source: R,
) -> Result<TransferStats>
where
    S: StreamSink,
    R: StreamSource,
{
    let path = path.into();
    Sender::new(config).send(&path, &mut sink, &mut source).await
}
