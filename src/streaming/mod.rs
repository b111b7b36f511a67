//! Streaming transfer protocol.
//!
//! One file moves over one stream pair as a sequence of wire strings:
//!
//! ```text
//! sender                                   receiver
//!   | -- string: basename --------------->  |  validate, create temp file
//!   | -- string: chunk 0 (block size) ---->  |
//!   | -- string: chunk 1 ----------------->  |  write chunk 0 || receive 1
//!   | -- string: chunk N (<= block size) ->  |
//!   | -- close --------------------------->  |  write chunk N, truncate, rename
//!   | <------------------------- close --   |
//! ```
//!
//! There is no end-of-file marker: stream closure ends the transfer. Both
//! sides double-buffer so storage I/O overlaps network I/O.

pub mod channel;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod storage;

pub use channel::{
    memory_pair, with_deadline, BoxSink, BoxSource, FramedSink, FramedSource, MemorySink,
    MemorySource, StreamSink, StreamSource, TransferStats,
};
pub use pipeline::{receive_chunks, send_chunks, BufferPair, Deadlines, TransferState};
pub use protocol::{
    decode_from_slice, encode_to_bytes, Decode, Encode, RequestHeader, WireType, WireValue,
    AUX_UNUSED, DEFAULT_BLOCK_SIZE, FILE_UPLOAD_TAG, MAX_FRAME_SIZE, REQUEST_MAGIC,
};
pub use receiver::{validate_filename, Receiver, ReceiverConfig};
pub use sender::{send_file, wire_filename, Sender, SenderConfig};
pub use storage::{AlignedBlock, BlockFile, StagedFile, StorageOptions};
