//! Stream pair types for the transfer pipeline.
//!
//! A transfer runs over two independent halves: a [`StreamSink`] for the
//! outbound direction and a [`StreamSource`] for the inbound one. Each value
//! on a stream is one wire string (see [`crate::streaming::protocol`]); the
//! peer closing its outbound half is the only end-of-data signal.
//!
//! Two implementations are provided:
//! - [`FramedSink`] / [`FramedSource`] over any tokio byte stream (TCP);
//! - [`memory_pair`], bounded in-process channels used by tests and benches.

use crate::error::{Result, TransferError};
use crate::streaming::protocol::{Encode, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Channel size for in-memory stream pairs (values in flight)
pub const MEMORY_CHANNEL_SIZE: usize = 4;

// =============================================================================
// Sink / Source
// =============================================================================

/// Outbound half of a stream pair.
#[async_trait]
pub trait StreamSink: Send {
    /// Send one string value.
    async fn send(&mut self, value: &[u8]) -> Result<()>;

    /// Flush and close the outbound direction. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a stream pair.
#[async_trait]
pub trait StreamSource: Send {
    /// Receive the next string value; `None` once the peer has closed.
    async fn receive(&mut self) -> Result<Option<Bytes>>;
}

pub type BoxSink = Box<dyn StreamSink>;
pub type BoxSource = Box<dyn StreamSource>;

#[async_trait]
impl<S: StreamSink + ?Sized> StreamSink for Box<S> {
    async fn send(&mut self, value: &[u8]) -> Result<()> {
        (**self).send(value).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}

#[async_trait]
impl<S: StreamSource + ?Sized> StreamSource for Box<S> {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        (**self).receive().await
    }
}

/// Run `fut` under an optional deadline, mapping expiry to `Timeout(op)`.
pub async fn with_deadline<T, F>(limit: Option<Duration>, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransferError::Timeout(op))?,
        None => fut.await,
    }
}

// =============================================================================
// Framed byte streams
// =============================================================================

/// Writes each value as a length-prefixed string frame.
pub struct FramedSink<W> {
    writer: W,
    frame: BytesMut,
    closed: bool,
}

impl<W: AsyncWrite + Unpin + Send> FramedSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            frame: BytesMut::new(),
            closed: false,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> StreamSink for FramedSink<W> {
    async fn send(&mut self, value: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TransferError::StreamClosed);
        }
        if value.len() > MAX_FRAME_SIZE as usize {
            return Err(TransferError::protocol(format!(
                "frame size {} exceeds maximum allowed size {}",
                value.len(),
                MAX_FRAME_SIZE
            )));
        }
        self.frame.clear();
        value.encode(&mut self.frame)?;
        self.writer.write_all(&self.frame).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Reads length-prefixed string frames until the peer shuts down its side.
pub struct FramedSource<R> {
    reader: R,
    max_frame: u32,
    finished: bool,
    desynced: bool,
}

impl<R: AsyncRead + Unpin + Send> FramedSource<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame(reader, MAX_FRAME_SIZE)
    }

    /// Reject frames longer than `max_frame` (capped at [`MAX_FRAME_SIZE`])
    /// before allocating for them.
    pub fn with_max_frame(reader: R, max_frame: u32) -> Self {
        Self {
            reader,
            max_frame: max_frame.min(MAX_FRAME_SIZE),
            finished: false,
            desynced: false,
        }
    }

    /// Fill `buf` completely. Returns the byte count read before EOF.
    async fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Consume a rejected frame's payload so the next frame stays readable.
    async fn skip(&mut self, len: u32) -> Result<()> {
        let mut payload = (&mut self.reader).take(len as u64);
        let skipped = tokio::io::copy(&mut payload, &mut tokio::io::sink()).await?;
        if skipped < len as u64 {
            self.finished = true;
        }
        Ok(())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> StreamSource for FramedSource<R> {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        if self.desynced {
            return Err(TransferError::protocol("stream framing lost"));
        }
        if self.finished {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        match self.read_full(&mut prefix).await? {
            0 => {
                self.finished = true;
                return Ok(None);
            }
            LENGTH_PREFIX_SIZE => {}
            n => {
                return Err(TransferError::TruncatedInput {
                    needed: LENGTH_PREFIX_SIZE,
                    remaining: n,
                })
            }
        }

        // Validate frame size before allocation
        let len = u32::from_ne_bytes(prefix);
        if len > self.max_frame {
            if len > MAX_FRAME_SIZE {
                self.desynced = true;
            } else {
                self.skip(len).await?;
            }
            return Err(TransferError::protocol(format!(
                "frame size {} exceeds maximum allowed size {}",
                len, self.max_frame
            )));
        }

        let mut payload = vec![0u8; len as usize];
        let n = self.read_full(&mut payload).await?;
        if n < payload.len() {
            return Err(TransferError::TruncatedInput {
                needed: payload.len(),
                remaining: n,
            });
        }
        Ok(Some(Bytes::from(payload)))
    }
}

// =============================================================================
// In-memory stream pair
// =============================================================================

/// Sending half of an in-process stream.
pub struct MemorySink {
    tx: Option<mpsc::Sender<Bytes>>,
}

/// Receiving half of an in-process stream.
pub struct MemorySource {
    rx: mpsc::Receiver<Bytes>,
}

/// Create a bounded in-process stream. Dropping or closing the sink ends it.
pub fn memory_pair() -> (MemorySink, MemorySource) {
    let (tx, rx) = mpsc::channel(MEMORY_CHANNEL_SIZE);
    (MemorySink { tx: Some(tx) }, MemorySource { rx })
}

#[async_trait]
impl StreamSink for MemorySink {
    async fn send(&mut self, value: &[u8]) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(TransferError::StreamClosed)?;
        tx.send(Bytes::copy_from_slice(value))
            .await
            .map_err(|_| TransferError::StreamClosed)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl StreamSource for MemorySource {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

// =============================================================================
// Transfer statistics
// =============================================================================

/// Statistics for one completed transfer
#[derive(Debug, Default, Clone)]
pub struct TransferStats {
    /// File bytes moved (exact, excluding padding)
    pub bytes: u64,

    /// Chunks moved, including a zero-length chunk for an empty file
    pub chunks: u64,

    /// Wall-clock time from handshake to stream closure
    pub elapsed: Duration,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn finish(bytes: u64, chunks: u64, started: Instant) -> Self {
        Self {
            bytes,
            chunks,
            elapsed: started.elapsed(),
        }
    }

    /// Throughput in bytes per second, if any time elapsed.
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        (secs > 0.0).then(|| self.bytes as f64 / secs)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_framed_roundtrip_and_close() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut sink = FramedSink::new(client_write);
        let mut source = FramedSource::new(server_read);

        let writer = tokio::spawn(async move {
            sink.send(b"report.csv").await.unwrap();
            sink.send(&[]).await.unwrap();
            sink.send(&[7u8; 300]).await.unwrap();
            sink.close().await.unwrap();
            // Second close is a no-op
            sink.close().await.unwrap();
        });

        assert_eq!(source.receive().await.unwrap().unwrap().as_ref(), b"report.csv");
        assert!(source.receive().await.unwrap().unwrap().is_empty());
        assert_eq!(source.receive().await.unwrap().unwrap().len(), 300);
        assert!(source.receive().await.unwrap().is_none());
        assert!(source.receive().await.unwrap().is_none());

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_framed_send_after_close_fails() {
        let (client, _server) = tokio::io::duplex(64);
        let mut sink = FramedSink::new(client);
        sink.close().await.unwrap();
        let err = sink.send(b"late").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StreamFailure);
    }

    #[tokio::test]
    async fn test_framed_eof_mid_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_ne_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let mut source = FramedSource::new(server);
        let err = source.receive().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TruncatedInput);
    }

    #[tokio::test]
    async fn test_framed_rejects_oversized_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_SIZE + 1).to_ne_bytes())
            .await
            .unwrap();

        let mut source = FramedSource::new(server);
        let err = source.receive().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_framed_frame_limit_skips_payload() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(&32u32.to_ne_bytes()).await.unwrap();
        client.write_all(&[9u8; 32]).await.unwrap();
        client.write_all(&3u32.to_ne_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let mut source = FramedSource::with_max_frame(server, 16);
        let err = source.receive().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        // The rejected payload was consumed, the next frame is intact
        assert_eq!(source.receive().await.unwrap().unwrap().as_ref(), b"abc");
        assert!(source.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_framed_huge_prefix_stops_reading() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_ne_bytes()).await.unwrap();
        client.write_all(b"junk").await.unwrap();

        let mut source = FramedSource::with_max_frame(server, 16);
        assert!(source.receive().await.is_err());
        let err = source.receive().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_memory_pair() {
        let (mut sink, mut source) = memory_pair();
        sink.send(b"one").await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(source.receive().await.unwrap().unwrap().as_ref(), b"one");
        assert!(source.receive().await.unwrap().is_none());
        assert!(sink.send(b"two").await.is_err());
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let (_sink, mut source) = memory_pair();
        let err = with_deadline(Some(Duration::from_millis(20)), "receive", source.receive())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_transfer_stats() {
        let mut stats = TransferStats::new();
        assert!(stats.throughput().is_none());

        stats.bytes = 1024 * 1024;
        stats.chunks = 256;
        stats.elapsed = Duration::from_secs(2);
        assert_eq!(stats.throughput(), Some(512.0 * 1024.0));
    }
}
