//! Abstract duplex frame channel.
//!
//! The dispatcher is written once against these traits; each transport
//! library gets a thin adapter that splits its native connection into a
//! [`FrameSink`] (shared, used for replies and broadcasts) and a
//! [`FrameSource`] (owned by the connection's read loop).

use crate::error::HxResult;
use std::future::Future;
use std::pin::Pin;

/// A boxed, sendable future, as returned by the transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One complete WebSocket data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Frame::Text(_))
    }
}

/// Write half of a duplex channel.
pub trait FrameSink: Send {
    /// Write one whole frame. Fails with `TransportClosed` once the peer is
    /// gone, `Transport` for any other write failure.
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, HxResult<()>>;

    /// Close the channel. Closing an already-closed channel is not an error.
    fn close(&mut self) -> BoxFuture<'_, HxResult<()>>;
}

/// Read half of a duplex channel.
pub trait FrameSource: Send {
    /// Wait for the next data frame.
    ///
    /// `Ok(None)` means the peer closed cleanly; `Err` is a terminal read
    /// failure. Control frames (ping/pong/close) are handled by the adapter
    /// and never surface here.
    fn recv(&mut self) -> BoxFuture<'_, HxResult<Option<Frame>>>;
}

/// A freshly upgraded connection that can be split into its two halves.
pub trait Duplex: Send + 'static {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>);
}

impl<S, R> Duplex for (S, R)
where
    S: FrameSink + 'static,
    R: FrameSource + 'static,
{
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (Box::new(self.0), Box::new(self.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_len() {
        assert_eq!(Frame::Text("abc".into()).len(), 3);
        assert_eq!(Frame::Binary(vec![1, 2]).len(), 2);
        assert!(Frame::Text(String::new()).is_empty());
        assert!(Frame::Text("x".into()).is_text());
        assert!(!Frame::Binary(vec![]).is_text());
    }
}
