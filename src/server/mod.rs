//! Receiving server.
//!
//! Accepts TCP connections, reads the [`RequestHeader`] each client opens
//! with and hands the connection's stream pair to the handler registered for
//! the request tag. Every connection runs on its own task; the only state
//! shared between them is the connection counter and the handler table.

use crate::error::Result;
use crate::streaming::channel::{BoxSink, BoxSource, FramedSink, FramedSource};
use crate::streaming::protocol::{
    RequestHeader, DEFAULT_BLOCK_SIZE, FILE_UPLOAD_TAG, MAX_FRAME_SIZE,
};
use crate::streaming::{Receiver, ReceiverConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

/// Time a client gets to send its request header.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time in-flight connections get to finish once shutdown is requested.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity of an accepted request, for log correlation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handles one request. Owns both halves of the stream pair until it returns.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle(&self, conn: ConnectionId, aux: i32, source: BoxSource, sink: BoxSink);

    /// Largest inbound value this handler accepts.
    fn max_frame_size(&self) -> u32 {
        MAX_FRAME_SIZE
    }
}

/// Stores uploaded files with a [`Receiver`].
pub struct UploadHandler {
    receiver: Receiver,
}

impl UploadHandler {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            receiver: Receiver::new(config),
        }
    }
}

#[async_trait]
impl StreamHandler for UploadHandler {
    async fn handle(
        &self,
        conn: ConnectionId,
        aux: i32,
        mut source: BoxSource,
        mut sink: BoxSink,
    ) {
        tracing::debug!(%conn, aux, "new upload");
        // Failures are logged by the receiver; the server keeps serving.
        let _ = self.receiver.receive(conn, &mut source, &mut sink).await;
    }

    /// Chunks never exceed the block size; a filename fits in a default block.
    fn max_frame_size(&self) -> u32 {
        let limit = self.receiver.config().block_size.max(DEFAULT_BLOCK_SIZE);
        u32::try_from(limit).unwrap_or(MAX_FRAME_SIZE)
    }
}

/// Handler table plus the process-wide connection counter.
pub struct Server {
    handlers: HashMap<u64, Arc<dyn StreamHandler>>,
    next_conn: AtomicU64,
    handshake_timeout: Duration,
    drain_timeout: Duration,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            next_conn: AtomicU64::new(0),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }

    /// A server with the upload handler registered under [`FILE_UPLOAD_TAG`].
    pub fn upload(config: ReceiverConfig) -> Self {
        let mut server = Self::new();
        server.register_handler(FILE_UPLOAD_TAG, UploadHandler::new(config));
        server
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Register `handler` for requests carrying `tag`, replacing any previous one.
    pub fn register_handler(&mut self, tag: u64, handler: impl StreamHandler) {
        self.handlers.insert(tag, Arc::new(handler));
    }

    /// Allocate the next connection identity. Starts at 1.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Accept connections until `shutdown` resolves, then give in-flight
    /// transfers up to the drain timeout to finish before aborting them.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let server = Arc::new(self);
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "listening");
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested, no longer accepting");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("connection task panicked: {e}");
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        tasks.spawn(async move { server.dispatch(stream, peer).await });
                    }
                    Err(e) => tracing::warn!("accept failed: {e}"),
                },
            }
        }

        if !tasks.is_empty() {
            tracing::info!(in_flight = tasks.len(), "waiting for transfers to finish");
        }
        let drained = tokio::time::timeout(server.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                aborted = tasks.len(),
                "transfers still running after drain timeout, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        Ok(())
    }

    async fn dispatch(&self, mut stream: TcpStream, peer: SocketAddr) {
        let header = match tokio::time::timeout(
            self.handshake_timeout,
            RequestHeader::read_from(&mut stream),
        )
        .await
        {
            Ok(Ok(header)) => header,
            Ok(Err(e)) => {
                tracing::warn!(%peer, "bad request header: {e}");
                return;
            }
            Err(_) => {
                tracing::warn!(%peer, "timed out waiting for request header");
                return;
            }
        };

        let Some(handler) = self.handlers.get(&header.tag).cloned() else {
            tracing::warn!(%peer, tag = header.tag, "no handler registered for request tag");
            return;
        };

        let conn = self.next_connection_id();
        tracing::debug!(%conn, %peer, tag = header.tag, "new connection");

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%conn, "failed to set TCP_NODELAY: {e}");
        }
        let (read, write) = stream.into_split();
        let source: BoxSource = Box::new(FramedSource::with_max_frame(
            read,
            handler.max_frame_size(),
        ));
        let sink: BoxSink = Box::new(FramedSink::new(write));
        handler.handle(conn, header.aux, source, sink).await;
        tracing::debug!(%conn, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::protocol::AUX_UNUSED;
    use crate::streaming::{StreamSink, StreamSource};
    use std::collections::HashSet;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::{mpsc, oneshot};

    #[test]
    fn test_connection_ids_are_distinct_and_increasing() {
        let server = Server::new();
        let a = server.next_connection_id();
        let b = server.next_connection_id();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_connection_ids_unique_across_tasks() {
        let server = Arc::new(Server::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let server = Arc::clone(&server);
            handles.push(tokio::spawn(async move {
                (0..100)
                    .map(|_| server.next_connection_id())
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 800);
    }

    /// Records the aux value and first value of each request.
    struct Recorder(mpsc::UnboundedSender<(ConnectionId, i32, Option<bytes::Bytes>)>);

    #[async_trait]
    impl StreamHandler for Recorder {
        async fn handle(
            &self,
            conn: ConnectionId,
            aux: i32,
            mut source: BoxSource,
            mut sink: BoxSink,
        ) {
            let first = source.receive().await.unwrap();
            let _ = self.0.send((conn, aux, first));
            let _ = sink.close().await;
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_tag() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut server = Server::new();
        server.register_handler(42, Recorder(tx));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serve = tokio::spawn(server.serve(listener, async move {
            let _ = stop_rx.await;
        }));

        // Unknown tag is dropped without reaching any handler
        let mut stream = TcpStream::connect(addr).await.unwrap();
        RequestHeader::new(7, AUX_UNUSED)
            .write_to(&mut stream)
            .await
            .unwrap();
        drop(stream);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        RequestHeader::new(42, 666).write_to(&mut stream).await.unwrap();
        stream.write_all(&5u32.to_ne_bytes()).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.shutdown().await.unwrap();

        let (conn, aux, first) = rx.recv().await.unwrap();
        assert_eq!(conn.get(), 1);
        assert_eq!(aux, 666);
        assert_eq!(first.unwrap().as_ref(), b"hello");

        stop_tx.send(()).unwrap();
        serve.await.unwrap().unwrap();
    }

    /// Holds every connection open until aborted.
    struct Stall;

    #[async_trait]
    impl StreamHandler for Stall {
        async fn handle(&self, _conn: ConnectionId, _aux: i32, _source: BoxSource, _sink: BoxSink) {
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stalled_transfers() {
        let mut server = Server::new().with_drain_timeout(Duration::from_millis(100));
        server.register_handler(FILE_UPLOAD_TAG, Stall);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serve = tokio::spawn(server.serve(listener, async move {
            let _ = stop_rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        RequestHeader::new(FILE_UPLOAD_TAG, AUX_UNUSED)
            .write_to(&mut stream)
            .await
            .unwrap();
        // Let the server dispatch the connection
        tokio::time::sleep(Duration::from_millis(50)).await;

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), serve)
            .await
            .expect("serve returned after the drain timeout")
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_upload_frame_limit_follows_block_size() {
        let mut config = ReceiverConfig::new("/srv/in");
        config.block_size = 1024 * 1024;
        assert_eq!(UploadHandler::new(config.clone()).max_frame_size(), 1024 * 1024);

        config.block_size = 512;
        assert_eq!(
            UploadHandler::new(config).max_frame_size(),
            DEFAULT_BLOCK_SIZE as u32
        );
    }
}
