//! ferry - single-file streaming transfer.
//!
//! A sender streams one file to a receiver as a filename followed by
//! block-sized chunks; both sides overlap storage I/O with network I/O through
//! a pair of aligned buffers. See [`streaming`] for the protocol.

pub mod cli;
pub mod config;
pub mod error;
pub mod server;
pub mod streaming;
pub mod transport;

pub use error::{ErrorKind, Result, TransferError};
