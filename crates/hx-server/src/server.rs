//! Dispatcher: owns the registry, the trigger table and the lifecycle hooks,
//! and runs one read loop per upgraded connection.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::registry::{BroadcastReport, Registry};
use crate::transport::UpgradeRouter;
use crate::upgrade::UpgradePolicy;
use futures_util::FutureExt;
use hx_core::{
    decode, BoxFuture, ConnectionId, Duplex, Envelope, Frame, FrameSource, HxError, HxResult,
};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A trigger handler. Invoked with the originating connection and the
/// decoded envelope; may reply through the connection.
pub type Handler =
    Arc<dyn Fn(Arc<Connection>, Envelope) -> BoxFuture<'static, HxResult<()>> + Send + Sync>;

/// Connect/disconnect hook.
pub type ConnectionHook =
    Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, HxResult<()>> + Send + Sync>;

/// Observer for frames that failed to decode.
pub type DecodeErrorHook = Arc<dyn Fn(&Connection, &HxError) + Send + Sync>;

/// A connection accepted by [`HxServer::on_upgrade`] and the task running
/// its read loop. The task finishes after disconnect cleanup.
pub struct LiveConnection {
    pub connection: Arc<Connection>,
    pub task: JoinHandle<()>,
}

/// The event-routing server for one mount point.
pub struct HxServer {
    config: ServerConfig,
    policy: UpgradePolicy,
    registry: Registry,
    handlers: RwLock<HashMap<String, Handler>>,
    on_connect: RwLock<Option<ConnectionHook>>,
    on_disconnect: RwLock<Option<ConnectionHook>>,
    on_decode_error: RwLock<Option<DecodeErrorHook>>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    /// Read loops started and not yet through cleanup.
    active_loops: AtomicUsize,
    drained: Notify,
}

impl HxServer {
    pub fn new(config: ServerConfig) -> Self {
        let policy = UpgradePolicy::new(&config.upgrade);
        Self {
            config,
            policy,
            registry: Registry::new(),
            handlers: RwLock::new(HashMap::new()),
            on_connect: RwLock::new(None),
            on_disconnect: RwLock::new(None),
            on_decode_error: RwLock::new(None),
            shutdown_tx: broadcast::channel(1).0,
            shutting_down: AtomicBool::new(false),
            active_loops: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Origin and capacity checks applied by transport adapters before the
    /// handshake completes.
    pub fn upgrade_policy(&self) -> &UpgradePolicy {
        &self.policy
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register (or replace) the handler for `trigger`. Safe to call while
    /// connections are live; frames already being dispatched keep the
    /// handler they looked up.
    pub fn listen<F, Fut>(&self, trigger: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Connection>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HxResult<()>> + Send + 'static,
    {
        let trigger = trigger.into();
        let handler = Arc::new(handler);
        let handler: Handler = Arc::new(move |conn: Arc<Connection>, envelope: Envelope| {
            let handler = handler.clone();
            Box::pin(async move { handler(conn, envelope).await })
                as BoxFuture<'static, HxResult<()>>
        });
        if self.handlers.write().insert(trigger.clone(), handler).is_some() {
            debug!(trigger = %trigger, "replaced handler");
        }
    }

    /// Remove the handler for `trigger`. Returns `true` if one was registered.
    pub fn unlisten(&self, trigger: &str) -> bool {
        self.handlers.write().remove(trigger).is_some()
    }

    pub fn has_handler(&self, trigger: &str) -> bool {
        self.handlers.read().contains_key(trigger)
    }

    /// Called after a connection is registered, before its first frame is
    /// read. The hook runs under the handler timeout; an error, timeout or
    /// panic is logged and the connection is still served.
    pub fn on_connect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HxResult<()>> + Send + 'static,
    {
        *self.on_connect.write() = Some(connection_hook(hook));
    }

    /// Called when the read loop ends, while the connection is still in the
    /// registry. Bounded by the handler timeout. The connection is removed
    /// and closed afterwards whether the hook succeeds, fails or panics.
    pub fn on_disconnect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HxResult<()>> + Send + 'static,
    {
        *self.on_disconnect.write() = Some(connection_hook(hook));
    }

    /// Observe frames that could not be decoded. The frame is dropped and the
    /// connection stays open either way, even if the observer panics.
    pub fn on_decode_error<F>(&self, hook: F)
    where
        F: Fn(&Connection, &HxError) + Send + Sync + 'static,
    {
        *self.on_decode_error.write() = Some(Arc::new(hook));
    }

    /// Register this server with a transport adapter at `path`.
    pub fn mount<R: UpgradeRouter + ?Sized>(self: &Arc<Self>, router: &mut R, path: &str) {
        info!(path = %path, "mounting server");
        router.route(path, self.clone());
    }

    /// Take over an upgraded channel: register it, run the connect hook and
    /// spawn its read loop.
    ///
    /// # Errors
    ///
    /// - [`HxError::Upgrade`] if the server is shutting down or the id is
    ///   already registered.
    /// - [`HxError::IdGeneration`] if the secure random source fails.
    ///
    /// The channel is closed before any error is returned. A failing
    /// connect hook is not an error.
    pub async fn on_upgrade<D: Duplex>(
        self: &Arc<Self>,
        channel: D,
        remote_addr: Option<SocketAddr>,
    ) -> HxResult<LiveConnection> {
        // Subscribe and count before checking the flag so `shutdown` either
        // refuses this connection or waits for it.
        let shutdown = self.shutdown_tx.subscribe();
        self.active_loops.fetch_add(1, Ordering::SeqCst);
        if self.shutting_down.load(Ordering::SeqCst) {
            self.loop_finished();
            return Err(HxError::Upgrade("server is shutting down".into()));
        }

        let (mut sink, source) = channel.split();
        let id = match ConnectionId::generate() {
            Ok(id) => id,
            Err(e) => {
                let _ = sink.close().await;
                self.loop_finished();
                return Err(e);
            }
        };
        let conn = Arc::new(Connection::with_id(id, sink, remote_addr));

        if !self.registry.add(conn.clone()).await {
            let _ = conn.close().await;
            self.loop_finished();
            return Err(HxError::Upgrade(format!(
                "connection id {} already registered",
                conn.id().short()
            )));
        }
        info!(
            conn_id = %conn.id().short(),
            remote = ?remote_addr,
            "connection opened"
        );

        let hook = self.on_connect.read().clone();
        self.run_hook("on_connect", hook, &conn).await;

        let task = tokio::spawn(self.clone().read_loop(conn.clone(), source, shutdown));
        Ok(LiveConnection {
            connection: conn,
            task,
        })
    }

    /// Send `data` as a text frame to every connection.
    ///
    /// # Errors
    ///
    /// [`HxError::InvalidText`] if `data` is not UTF-8; nothing is sent.
    /// Per-connection send failures are reported in the
    /// [`BroadcastReport`], not as an error.
    pub async fn broadcast(&self, data: &[u8]) -> HxResult<BroadcastReport> {
        self.registry.broadcast(data).await
    }

    /// Send `data` to the connections selected by `predicate`.
    ///
    /// # Errors
    ///
    /// Same as [`broadcast`](Self::broadcast).
    pub async fn broadcast_filtered<P>(&self, data: &[u8], predicate: P) -> HxResult<BroadcastReport>
    where
        P: Fn(&Connection) -> bool,
    {
        self.registry.broadcast_filtered(data, predicate).await
    }

    /// Send `data` to the connections subscribed to `event`.
    ///
    /// # Errors
    ///
    /// Same as [`broadcast`](Self::broadcast).
    pub async fn publish(&self, event: &str, data: &[u8]) -> HxResult<BroadcastReport> {
        self.registry
            .broadcast_filtered(data, |c| c.is_subscribed(event))
            .await
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop every read loop and wait until each has finished its disconnect
    /// cleanup. New upgrades are refused from the moment this is called.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        info!(
            active = self.active_loops.load(Ordering::SeqCst),
            "shutting down, draining connections"
        );

        loop {
            let drained = self.drained.notified();
            if self.active_loops.load(Ordering::SeqCst) == 0 {
                break;
            }
            drained.await;
        }
        info!("all connections drained");
    }

    async fn read_loop(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut source: Box<dyn FrameSource>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let next = tokio::select! {
                _ = shutdown.recv() => {
                    debug!(conn_id = %conn.id().short(), "read loop stopped by shutdown");
                    break;
                }
                next = self.next_frame(source.as_mut()) => next,
            };

            match next {
                Ok(Some(Frame::Text(text))) => self.dispatch(&conn, text.as_bytes()).await,
                Ok(Some(Frame::Binary(data))) => {
                    warn!(conn_id = %conn.id().short(), len = data.len(), "ignoring binary frame");
                }
                Ok(None) => {
                    debug!(conn_id = %conn.id().short(), "peer closed channel");
                    break;
                }
                Err(HxError::Timeout) => {
                    info!(conn_id = %conn.id().short(), "idle timeout");
                    break;
                }
                Err(e) => {
                    warn!(conn_id = %conn.id().short(), error = %e, "read failed");
                    break;
                }
            }
        }

        self.finish(conn).await;
    }

    async fn next_frame(&self, source: &mut dyn FrameSource) -> HxResult<Option<Frame>> {
        match self.config.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, source.recv())
                .await
                .unwrap_or(Err(HxError::Timeout)),
            None => source.recv().await,
        }
    }

    /// Decode one frame and run its handler, if any. Nothing here ends the
    /// connection.
    async fn dispatch(&self, conn: &Arc<Connection>, raw: &[u8]) {
        let envelope = match decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn_id = %conn.id().short(), error = %e, "dropping malformed frame");
                let observer = self.on_decode_error.read().clone();
                if let Some(observer) = observer {
                    let observed =
                        panic::catch_unwind(AssertUnwindSafe(|| observer(conn.as_ref(), &e)));
                    if observed.is_err() {
                        error!(conn_id = %conn.id().short(), "decode-error observer panicked");
                    }
                }
                return;
            }
        };

        let handler = self.handlers.read().get(envelope.trigger()).cloned();
        let Some(handler) = handler else {
            debug!(
                conn_id = %conn.id().short(),
                trigger = %envelope.trigger(),
                "no handler for trigger"
            );
            return;
        };

        let trigger = envelope.trigger().to_owned();
        debug!(conn_id = %conn.id().short(), trigger = %trigger, "dispatching");

        match self.guarded(handler(conn.clone(), envelope)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(conn_id = %conn.id().short(), trigger = %trigger, error = %e, "handler failed");
            }
            Err(_) => {
                error!(conn_id = %conn.id().short(), trigger = %trigger, "handler panicked");
            }
        }
    }

    /// Disconnect hook, then removal, then close. Runs once per connection;
    /// removal happens however the hook ends.
    async fn finish(&self, conn: Arc<Connection>) {
        let hook = self.on_disconnect.read().clone();
        self.run_hook("on_disconnect", hook, &conn).await;

        self.registry.remove_by_id(conn.id()).await;
        if let Err(e) = conn.close().await {
            debug!(conn_id = %conn.id().short(), error = %e, "close failed");
        }
        info!(
            conn_id = %conn.id().short(),
            duration_ms = conn.age().as_millis() as u64,
            "connection closed"
        );
        self.loop_finished();
    }

    /// Await application code under the handler timeout, catching panics.
    async fn guarded<F>(&self, call: F) -> Result<HxResult<()>, Box<dyn Any + Send>>
    where
        F: Future<Output = HxResult<()>>,
    {
        let call = AssertUnwindSafe(call).catch_unwind();
        match self.config.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Ok(Err(HxError::Timeout))),
            None => call.await,
        }
    }

    async fn run_hook(
        &self,
        stage: &'static str,
        hook: Option<ConnectionHook>,
        conn: &Arc<Connection>,
    ) {
        let Some(hook) = hook else {
            return;
        };
        match self.guarded(hook(conn.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(conn_id = %conn.id().short(), hook = stage, error = %e, "lifecycle hook failed");
            }
            Err(_) => {
                error!(conn_id = %conn.id().short(), hook = stage, "lifecycle hook panicked");
            }
        }
    }

    fn loop_finished(&self) {
        if self.active_loops.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

impl fmt::Debug for HxServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HxServer")
            .field("config", &self.config)
            .field("handlers", &self.handlers.read().len())
            .field("active_loops", &self.active_loops.load(Ordering::SeqCst))
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

fn connection_hook<F, Fut>(hook: F) -> ConnectionHook
where
    F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HxResult<()>> + Send + 'static,
{
    // Call the hook inside the future so a panic before its first await is
    // caught along with the rest.
    let hook = Arc::new(hook);
    Arc::new(move |conn: Arc<Connection>| {
        let hook = hook.clone();
        Box::pin(async move { hook(conn).await }) as BoxFuture<'static, HxResult<()>>
    })
}
