//! One live client channel: identity plus the outbound send path.

use hx_core::{ConnectionId, Frame, FrameSink, HxError, HxResult};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A connected client.
///
/// The read half of the channel belongs to the connection's read loop; this
/// type only owns the write half. `send` may be called concurrently from any
/// task: writes are serialized per connection so frames never interleave.
pub struct Connection {
    id: ConnectionId,
    sink: Mutex<Box<dyn FrameSink>>,
    closed: AtomicBool,
    remote_addr: Option<SocketAddr>,
    connected_at: Instant,
    /// Event names this client receives via `publish`.
    subscriptions: RwLock<HashSet<String>>,
}

impl Connection {
    /// Wrap the write half of a freshly upgraded channel, assigning a new id.
    pub fn new(sink: Box<dyn FrameSink>, remote_addr: Option<SocketAddr>) -> HxResult<Self> {
        Ok(Self::with_id(ConnectionId::generate()?, sink, remote_addr))
    }

    /// Wrap a channel under a caller-chosen id.
    pub fn with_id(
        id: ConnectionId,
        sink: Box<dyn FrameSink>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            id,
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            remote_addr,
            connected_at: Instant::now(),
            subscriptions: RwLock::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Time since the upgrade completed.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Whether the channel has been closed or a write found it closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send `data` as one text frame. The bytes must be valid UTF-8.
    pub async fn send(&self, data: &[u8]) -> HxResult<()> {
        let text = std::str::from_utf8(data).map_err(|_| HxError::InvalidText)?;
        self.send_frame(Frame::Text(text.to_owned())).await
    }

    /// Send a string as one text frame.
    pub async fn send_text(&self, text: &str) -> HxResult<()> {
        self.send_frame(Frame::Text(text.to_owned())).await
    }

    /// Send one binary frame.
    pub async fn send_binary(&self, data: &[u8]) -> HxResult<()> {
        self.send_frame(Frame::Binary(data.to_vec())).await
    }

    /// Write one frame. No retry.
    pub async fn send_frame(&self, frame: Frame) -> HxResult<()> {
        if self.is_closed() {
            return Err(HxError::TransportClosed);
        }
        let mut sink = self.sink.lock().await;
        let result = sink.send(frame).await;
        if matches!(result, Err(HxError::TransportClosed)) {
            self.closed.store(true, Ordering::Release);
        }
        result
    }

    /// Close the underlying channel. Idempotent.
    pub async fn close(&self) -> HxResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.sink.lock().await.close().await
    }

    /// Receive frames published under `event`.
    pub fn subscribe(&self, event: impl Into<String>) {
        self.subscriptions.write().insert(event.into());
    }

    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&self, event: &str) -> bool {
        self.subscriptions.write().remove(event)
    }

    pub fn is_subscribed(&self, event: &str) -> bool {
        self.subscriptions.read().contains(event)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use hx_core::Duplex;
    use std::sync::Arc;

    fn connect() -> (Arc<Connection>, memory::MemoryPeer) {
        let (channel, peer) = memory::pair();
        let (sink, _source) = channel.split();
        (Arc::new(Connection::new(sink, None).unwrap()), peer)
    }

    #[tokio::test]
    async fn send_text_reaches_peer() {
        let (conn, mut peer) = connect();
        conn.send_text("<div id=\"a\">1</div>").await.unwrap();
        conn.send(b"<div id=\"a\">2</div>").await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Text("<div id=\"a\">1</div>".into())));
        assert_eq!(peer.recv().await, Some(Frame::Text("<div id=\"a\">2</div>".into())));
    }

    #[tokio::test]
    async fn send_rejects_invalid_utf8() {
        let (conn, mut peer) = connect();
        assert!(matches!(conn.send(&[0xff, 0xfe]).await, Err(HxError::InvalidText)));
        conn.send_binary(&[0xff, 0xfe]).await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Binary(vec![0xff, 0xfe])));
    }

    #[tokio::test]
    async fn send_to_dropped_peer_is_transport_closed() {
        let (conn, peer) = connect();
        drop(peer);
        assert!(matches!(conn.send_text("x").await, Err(HxError::TransportClosed)));
        assert!(conn.is_closed());
        // later sends short-circuit without touching the sink
        assert!(matches!(conn.send_text("y").await, Err(HxError::TransportClosed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, mut peer) = connect();
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert_eq!(peer.recv().await, None);
        assert!(matches!(conn.send_text("late").await, Err(HxError::TransportClosed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_do_not_interleave() {
        let (conn, mut peer) = connect();
        let mut tasks = Vec::new();
        for i in 0..50 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                conn.send_text(&format!("frame-{i}")).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..50 {
            match peer.recv().await {
                Some(Frame::Text(t)) => {
                    assert!(t.starts_with("frame-"));
                    seen.insert(t);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn subscriptions() {
        let (conn, _peer) = connect();
        assert!(!conn.is_subscribed("news"));
        conn.subscribe("news");
        assert!(conn.is_subscribed("news"));
        assert!(conn.unsubscribe("news"));
        assert!(!conn.unsubscribe("news"));
    }

    #[test]
    fn ids_are_distinct() {
        let (a, _pa) = connect();
        let (b, _pb) = connect();
        assert_ne!(a.id(), b.id());
    }
}
