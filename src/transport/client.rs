//! Client session - establishes a connection to a remote `ferry serve`
//!
//! Opens the TCP stream, sends the request header and hands back framed
//! halves. Protocol handling is done by [`Sender`].

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::streaming::channel::{FramedSink, FramedSource, TransferStats};
use crate::streaming::protocol::{RequestHeader, AUX_UNUSED, FILE_UPLOAD_TAG};
use crate::streaming::sender::{Sender, SenderConfig};

/// Port `ferry serve` listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 10000;

/// An open request to a remote server
pub struct Connection {
    sink: FramedSink<OwnedWriteHalf>,
    source: FramedSource<OwnedReadHalf>,
    peer: SocketAddr,
}

impl Connection {
    /// Connect and open a request carrying `tag` and `aux`.
    pub async fn connect<A: ToSocketAddrs>(addr: A, tag: u64, aux: i32) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)
            .await
            .context("Failed to connect to server")?;
        let peer = stream.peer_addr().context("Failed to read peer address")?;
        stream
            .set_nodelay(true)
            .context("Failed to set TCP_NODELAY")?;

        RequestHeader::new(tag, aux)
            .write_to(&mut stream)
            .await
            .with_context(|| format!("Failed to send request header to {}", peer))?;
        tracing::debug!(%peer, tag, "request opened");

        let (read, write) = stream.into_split();
        Ok(Self {
            sink: FramedSink::new(write),
            source: FramedSource::new(read),
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Split into the outbound sink and the reply source
    pub fn split(self) -> (FramedSink<OwnedWriteHalf>, FramedSource<OwnedReadHalf>) {
        (self.sink, self.source)
    }
}

/// Upload the file at `path` to the server at `addr`.
pub async fn upload<A: ToSocketAddrs>(
    addr: A,
    path: &Path,
    config: SenderConfig,
) -> Result<TransferStats> {
    let conn = Connection::connect(addr, FILE_UPLOAD_TAG, AUX_UNUSED).await?;
    let peer = conn.peer();
    let (mut sink, mut source) = conn.split();

    Sender::new(config)
        .send(path, &mut sink, &mut source)
        .await
        .with_context(|| format!("Failed to send {} to {}", path.display(), peer))
}
