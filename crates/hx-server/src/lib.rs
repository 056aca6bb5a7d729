//! hx-server: WebSocket event-routing server for htmx.
//!
//! Accepts upgraded connections, keeps them in a registry, decodes each
//! inbound frame into an envelope and dispatches it to the handler
//! registered for its `HX-Trigger`. Handlers reply through the connection;
//! the application can also broadcast to all or some connections.

pub mod config;
pub mod connection;
pub mod registry;
pub mod server;
pub mod transport;
pub mod upgrade;

// Re-export commonly used items at crate root.
pub use config::{HostConfig, ServerConfig, UpgradeConfig};
pub use connection::Connection;
pub use registry::{BroadcastReport, Registry, SendFailure};
pub use server::{ConnectionHook, DecodeErrorHook, Handler, HxServer, LiveConnection};
pub use transport::{UpgradeRouter, WebSocketChannel, WebSocketListener};
pub use upgrade::{ConnectionGuard, UpgradePolicy, UpgradeRejection};

pub use hx_core::{encode_json, encode_text, Envelope, HxError, HxResult};
