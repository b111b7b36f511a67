//! Error types for the transfer protocol.
//!
//! Library code returns `crate::error::Result`; the binary wraps these in
//! anyhow at the edges.

use std::fmt;
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Coarse classification used when logging a failed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TruncatedInput,
    ProtocolViolation,
    StorageFailure,
    StreamFailure,
    ShortWrite,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TruncatedInput => "truncated_input",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::StreamFailure => "stream_failure",
            ErrorKind::ShortWrite => "short_write",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage operation that failed, for error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Open,
    Create,
    Read,
    Write,
    Truncate,
    Sync,
    Rename,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageOp::Open => "open",
            StorageOp::Create => "create",
            StorageOp::Read => "read",
            StorageOp::Write => "write",
            StorageOp::Truncate => "truncate",
            StorageOp::Sync => "sync",
            StorageOp::Rename => "rename",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    TruncatedInput { needed: usize, remaining: usize },

    #[error("value of {0} elements exceeds the u32 length prefix")]
    LengthOverflow(usize),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid filename {0:?}")]
    InvalidFilename(String),

    #[error("storage {op} failed for {}: {source}", path.display())]
    Storage {
        op: StorageOp,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("short write at offset {offset}: storage accepted {written} of {expected} bytes")]
    ShortWrite {
        offset: u64,
        written: usize,
        expected: usize,
    },

    #[error("stream failure: {0}")]
    Stream(#[from] io::Error),

    #[error("stream closed by peer")]
    StreamClosed,

    #[error("timed out during {0}")]
    Timeout(&'static str),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::TruncatedInput { .. } => ErrorKind::TruncatedInput,
            TransferError::LengthOverflow(_)
            | TransferError::ProtocolViolation(_)
            | TransferError::InvalidFilename(_) => ErrorKind::ProtocolViolation,
            TransferError::Storage { .. } => ErrorKind::StorageFailure,
            TransferError::ShortWrite { .. } => ErrorKind::ShortWrite,
            TransferError::Stream(_) | TransferError::StreamClosed => ErrorKind::StreamFailure,
            TransferError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        TransferError::ProtocolViolation(msg.into())
    }

    pub(crate) fn storage(op: StorageOp, path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Storage {
            op,
            path: path.into(),
            source,
        }
    }
}
