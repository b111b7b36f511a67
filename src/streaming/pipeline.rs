//! Double-buffered chunk pipeline.
//!
//! Both roles keep one buffer in flight on the network while the other is
//! busy with storage:
//!
//! ```text
//! Sender:    read N+1 -> staging   ||   send active (N)     -> swap
//! Receiver:  write active (N)      ||   receive N+1 -> staging -> swap
//! ```
//!
//! The two operations of a step are joined (`try_join!`), never ordered, and
//! buffers are only swapped after both have completed.

use crate::error::{Result, TransferError};
use crate::streaming::channel::{with_deadline, StreamSink, StreamSource};
use crate::streaming::storage::{AlignedBlock, BlockFile};
use std::mem;
use std::time::Duration;

/// The two alternating buffers of a session.
#[derive(Debug)]
pub struct BufferPair {
    /// Chunk being sent (sender) or written (receiver)
    active: AlignedBlock,
    /// Chunk being read (sender) or received (receiver)
    staging: AlignedBlock,
}

impl BufferPair {
    pub fn new(block_size: usize) -> Self {
        Self {
            active: AlignedBlock::new(block_size),
            staging: AlignedBlock::new(block_size),
        }
    }

    pub fn swap(&mut self) {
        mem::swap(&mut self.active, &mut self.staging);
    }
}

/// Progress of one transfer, kept by the session so a failure can be
/// reported with the offset it happened at.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferState {
    /// Bytes sent or persisted so far
    pub offset: u64,
    /// Chunks sent or received so far
    pub chunks: u64,
    /// Set once the source is exhausted / the peer closed its stream
    pub finished: bool,
}

/// Per-operation deadline applied at every suspension point.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadlines {
    pub io_timeout: Option<Duration>,
}

// =============================================================================
// Sender
// =============================================================================

/// Stream the whole of `file` into `sink` as block-sized chunks, then close
/// the sink.
///
/// A zero-length file produces exactly one zero-length chunk: the receiver
/// detects completion by stream closure, not by a sentinel.
pub async fn send_chunks<S>(
    file: &BlockFile,
    sink: &mut S,
    buffers: &mut BufferPair,
    state: &mut TransferState,
    deadlines: Deadlines,
) -> Result<()>
where
    S: StreamSink + ?Sized,
{
    let limit = deadlines.io_timeout;
    let size = with_deadline(limit, "storage read", file.size()).await?;

    let staging = mem::take(&mut buffers.staging);
    buffers.staging = with_deadline(limit, "storage read", file.read_block(0, staging)).await?;
    let mut bytes_read = buffers.staging.len() as u64;
    buffers.swap();

    while bytes_read < size {
        tracing::trace!(bytes_read, size, chunk = state.chunks, "pipeline step");
        let staging = mem::take(&mut buffers.staging);
        let read = with_deadline(limit, "storage read", file.read_block(bytes_read, staging));
        let send = with_deadline(limit, "stream send", sink.send(buffers.active.filled()));
        let (next, ()) = tokio::try_join!(read, send)?;

        if next.is_empty() {
            return Err(TransferError::storage(
                crate::error::StorageOp::Read,
                file.path(),
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("source shrank to {bytes_read} bytes, expected {size}"),
                ),
            ));
        }

        state.offset += buffers.active.len() as u64;
        state.chunks += 1;
        bytes_read += next.len() as u64;
        buffers.staging = next;
        buffers.swap();
    }

    with_deadline(limit, "stream send", sink.send(buffers.active.filled())).await?;
    state.offset += buffers.active.len() as u64;
    state.chunks += 1;

    with_deadline(limit, "stream close", sink.close()).await?;
    state.finished = true;
    Ok(())
}

// =============================================================================
// Receiver
// =============================================================================

/// Receive one chunk into `block`. Returns `false` once the stream is closed.
async fn receive_into<S>(source: &mut S, block: &mut AlignedBlock) -> Result<bool>
where
    S: StreamSource + ?Sized,
{
    let Some(chunk) = source.receive().await? else {
        return Ok(false);
    };
    if chunk.len() > block.capacity() {
        return Err(TransferError::protocol(format!(
            "chunk of {} bytes exceeds block size {}",
            chunk.len(),
            block.capacity()
        )));
    }
    block.fill_from(&chunk);
    Ok(true)
}

/// Persist every chunk from `source` into `file` until the peer closes the
/// stream, then trim `file` to the exact byte count received.
///
/// Only the last chunk may be shorter than the block size; a short chunk
/// followed by another one is a protocol violation.
pub async fn receive_chunks<S>(
    source: &mut S,
    file: &BlockFile,
    buffers: &mut BufferPair,
    state: &mut TransferState,
    deadlines: Deadlines,
) -> Result<()>
where
    S: StreamSource + ?Sized,
{
    let limit = deadlines.io_timeout;

    let first = with_deadline(limit, "stream receive", receive_into(source, &mut buffers.staging))
        .await?;
    if !first {
        tracing::debug!("stream closed before first chunk, empty transfer");
        state.finished = true;
        return with_deadline(limit, "storage write", file.finish(0)).await;
    }
    state.chunks += 1;
    buffers.swap();

    while !state.finished {
        let active = mem::take(&mut buffers.active);
        let chunk_len = active.len() as u64;
        let write = with_deadline(limit, "storage write", file.write_block(state.offset, active));
        let receive = with_deadline(
            limit,
            "stream receive",
            receive_into(source, &mut buffers.staging),
        );
        let (written, more) = tokio::try_join!(write, receive)?;

        buffers.active = written;
        state.offset += chunk_len;
        tracing::trace!(offset = state.offset, chunk = state.chunks, "chunk persisted");

        if more {
            if !buffers.active.is_full() {
                return Err(TransferError::protocol(format!(
                    "short chunk of {} bytes before end of stream",
                    chunk_len
                )));
            }
            state.chunks += 1;
            buffers.swap();
        } else {
            state.finished = true;
        }
    }

    with_deadline(limit, "storage write", file.finish(state.offset)).await
}

// =============================================================================
// Tests
// =============================================================================
