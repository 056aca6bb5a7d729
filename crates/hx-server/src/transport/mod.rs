//! Transport adapters.
//!
//! Each adapter turns its library's native connection into a
//! [`Duplex`](hx_core::Duplex) and hands it to
//! [`HxServer::on_upgrade`](crate::HxServer::on_upgrade):
//! - [`websocket`]: tokio-tungstenite over TCP (or any async byte stream)
//! - [`memory`]: in-process channel pair

pub mod memory;
pub mod websocket;

pub use websocket::{WebSocketChannel, WebSocketListener};

use crate::server::HxServer;
use std::sync::Arc;

/// Something that can route upgrade requests for a path to a server.
pub trait UpgradeRouter {
    /// Serve upgrades arriving at `path` with `server`. A later route for the
    /// same path replaces the earlier one.
    fn route(&mut self, path: &str, server: Arc<HxServer>);
}
