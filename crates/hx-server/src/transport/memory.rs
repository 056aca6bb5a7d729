//! In-process transport backed by tokio channels.
//!
//! [`pair`] returns the server side (a [`Duplex`] to hand to
//! [`HxServer::on_upgrade`](crate::HxServer::on_upgrade)) and a
//! [`MemoryPeer`] that plays the browser. Useful for embedding the
//! dispatcher behind a custom transport and for tests.

use hx_core::{BoxFuture, Duplex, Frame, FrameSink, FrameSource, HxError, HxResult};
use tokio::sync::mpsc;

type Inbound = HxResult<Frame>;

/// Create a connected server/peer pair.
pub fn pair() -> (MemoryChannel, MemoryPeer) {
    let (to_server, from_peer) = mpsc::unbounded_channel::<Inbound>();
    let (to_peer, from_server) = mpsc::unbounded_channel::<Frame>();
    (
        MemoryChannel {
            sink: MemorySink { tx: Some(to_peer) },
            source: MemorySource { rx: from_peer },
        },
        MemoryPeer {
            tx: Some(to_server),
            rx: from_server,
        },
    )
}

/// Server side of an in-memory connection.
pub struct MemoryChannel {
    sink: MemorySink,
    source: MemorySource,
}

impl Duplex for MemoryChannel {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (Box::new(self.sink), Box::new(self.source))
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

impl FrameSink for MemorySink {
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, HxResult<()>> {
        Box::pin(async move {
            let tx = self.tx.as_ref().ok_or(HxError::TransportClosed)?;
            tx.send(frame).map_err(|_| HxError::TransportClosed)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, HxResult<()>> {
        Box::pin(async move {
            self.tx = None;
            Ok(())
        })
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl FrameSource for MemorySource {
    fn recv(&mut self) -> BoxFuture<'_, HxResult<Option<Frame>>> {
        Box::pin(async move { self.rx.recv().await.transpose() })
    }
}

/// Client side of an in-memory connection.
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<Inbound>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    /// Deliver a frame to the server.
    pub fn send(&self, frame: Frame) -> HxResult<()> {
        let tx = self.tx.as_ref().ok_or(HxError::TransportClosed)?;
        tx.send(Ok(frame)).map_err(|_| HxError::TransportClosed)
    }

    /// Deliver a text frame to the server.
    pub fn send_text(&self, text: impl Into<String>) -> HxResult<()> {
        self.send(Frame::Text(text.into()))
    }

    /// Make the server's next read fail with `error`.
    pub fn fail(&self, error: HxError) -> HxResult<()> {
        let tx = self.tx.as_ref().ok_or(HxError::TransportClosed)?;
        tx.send(Err(error)).map_err(|_| HxError::TransportClosed)
    }

    /// Next frame written by the server; `None` once the server closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// A frame the server already wrote, without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Half-close: the server's read loop sees a clean close, while frames
    /// the server writes are still received here.
    pub fn close(&mut self) {
        self.tx = None;
    }
}
