//! Client-side transport: TCP connection to a `ferry serve` instance.

pub mod client;

pub use client::{upload, Connection, DEFAULT_PORT};
