//! WebSocket adapter using tokio-tungstenite.
//!
//! [`WebSocketListener`] accepts TCP connections, performs the handshake
//! for whichever server is mounted at the request path (after its origin
//! and capacity checks), and hands the upgraded stream to that server.
//! [`WebSocketChannel`] adapts any upgraded `WebSocketStream` to the core's
//! frame traits, so TLS or proxied streams can be served the same way.

use crate::server::HxServer;
use crate::transport::UpgradeRouter;
use crate::upgrade::{ConnectionGuard, UpgradeRejection};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hx_core::{BoxFuture, Duplex, Frame, FrameSink, FrameSource, HxError, HxResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

type Routes = HashMap<String, Arc<HxServer>>;

/// Accepts WebSocket upgrades on one TCP address for any number of mount
/// points.
pub struct WebSocketListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    routes: Routes,
}

impl WebSocketListener {
    /// Bind the TCP listener. Nothing is accepted until [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// [`HxError::Transport`] if the address cannot be bound, [`HxError::Io`]
    /// if the bound address cannot be read back.
    pub async fn bind(addr: SocketAddr) -> HxResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HxError::Transport(format!("WS bind failed: {e}")))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "WebSocket listener bound");
        Ok(Self {
            listener,
            local_addr,
            routes: HashMap::new(),
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn mounted_paths(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    /// Accept connections until the task is dropped. Each connection is
    /// handshaken and served on its own task.
    pub async fn run(self) -> HxResult<()> {
        if self.routes.is_empty() {
            warn!("no servers mounted, every upgrade will be refused");
        }
        let routes = Arc::new(self.routes);
        info!(
            addr = %self.local_addr,
            mounts = routes.len(),
            "WebSocket listener started"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    let routes = routes.clone();
                    tokio::spawn(async move {
                        serve_tcp(stream, remote, routes).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

impl UpgradeRouter for WebSocketListener {
    fn route(&mut self, path: &str, server: Arc<HxServer>) {
        if self.routes.insert(path.to_string(), server).is_some() {
            warn!(path = %path, "replacing server already mounted at path");
        }
    }
}

/// Handshake one TCP connection and serve it until it closes.
async fn serve_tcp(stream: TcpStream, remote: SocketAddr, routes: Arc<Routes>) {
    debug!(remote = %remote, "TCP connection accepted");

    let mut admitted: Option<(Arc<HxServer>, ConnectionGuard)> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        let origin = request
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok());
        match admit(&routes, path, origin) {
            Ok(entry) => {
                admitted = Some(entry);
                Ok(response)
            }
            Err(rejection) => {
                warn!(remote = %remote, path = %path, reason = %rejection, "upgrade refused");
                Err(reject_response(&rejection))
            }
        }
    };

    let handshake = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(handshake_config(&routes)),
    )
    .await;

    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            warn!(remote = %remote, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let Some((server, _guard)) = admitted.take() else {
        return;
    };

    let channel = WebSocketChannel::new(ws, server.config().upgrade.max_message_size);
    match server.on_upgrade(channel, Some(remote)).await {
        Ok(live) => {
            if let Err(e) = live.task.await {
                error!(remote = %remote, error = %e, "connection task aborted");
            }
        }
        Err(e) => {
            warn!(remote = %remote, error = %e, "could not accept connection");
        }
    }
}

/// Pick the server for `path` and apply its origin and capacity checks.
fn admit(
    routes: &Routes,
    path: &str,
    origin: Option<&str>,
) -> Result<(Arc<HxServer>, ConnectionGuard), UpgradeRejection> {
    let server = routes
        .get(path)
        .ok_or_else(|| UpgradeRejection::NotMounted(path.to_string()))?;
    let policy = server.upgrade_policy();
    policy.check_origin(origin)?;
    let guard = policy.try_acquire()?;
    Ok((server.clone(), guard))
}

fn reject_response(rejection: &UpgradeRejection) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(rejection.to_string()));
    *response.status_mut() =
        StatusCode::from_u16(rejection.status()).unwrap_or(StatusCode::FORBIDDEN);
    response
}

/// Handshake settings for a listener: the most generous of its mounts.
/// Per-mount message limits are enforced again after routing.
fn handshake_config(routes: &Routes) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    let upgrades = routes.values().map(|s| &s.config().upgrade);
    if let Some(write) = upgrades.clone().map(|u| u.write_buffer_size).max() {
        config.write_buffer_size = write;
    }
    if let Some(max) = upgrades.map(|u| u.max_message_size).max() {
        config.max_message_size = Some(max);
        config.max_frame_size = Some(max);
    }
    config
}

/// An upgraded WebSocket stream, ready to be served.
pub struct WebSocketChannel<S> {
    ws: WebSocketStream<S>,
    max_message_size: usize,
}

impl<S> WebSocketChannel<S> {
    pub fn new(ws: WebSocketStream<S>, max_message_size: usize) -> Self {
        Self {
            ws,
            max_message_size,
        }
    }
}

impl<S> Duplex for WebSocketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let (sink, stream) = self.ws.split();
        (
            Box::new(WsSink { inner: sink }),
            Box::new(WsSource {
                inner: stream,
                max_message_size: self.max_message_size,
            }),
        )
    }
}

struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, HxResult<()>> {
        Box::pin(async move {
            let message = match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(data) => Message::Binary(data.into()),
            };
            self.inner.send(message).await.map_err(send_error)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, HxResult<()>> {
        Box::pin(async move {
            match self.inner.close().await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(send_error(e)),
            }
        })
    }
}

struct WsSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
    max_message_size: usize,
}

impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn recv(&mut self) -> BoxFuture<'_, HxResult<Option<Frame>>> {
        Box::pin(async move {
            loop {
                let frame = match self.inner.next().await {
                    Some(Ok(Message::Text(text))) => Frame::Text(text),
                    Some(Ok(Message::Binary(data))) => Frame::Binary(data.to_vec()),
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    // tungstenite queues pong replies itself
                    Some(Ok(_)) => continue,
                    Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                        return Ok(None)
                    }
                    Some(Err(e)) => return Err(HxError::Read(format!("WS recv failed: {e}"))),
                    None => return Ok(None),
                };
                if frame.len() > self.max_message_size {
                    return Err(HxError::Read(format!(
                        "WS message too large: {} bytes (max {})",
                        frame.len(),
                        self.max_message_size
                    )));
                }
                return Ok(Some(frame));
            }
        })
    }
}

fn send_error(e: WsError) -> HxError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => HxError::TransportClosed,
        WsError::Io(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ) =>
        {
            HxError::TransportClosed
        }
        other => HxError::Transport(format!("WS send failed: {other}")),
    }
}
