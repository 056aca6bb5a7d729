//! Upgrade policy: which handshakes a mount point accepts.
//!
//! [`UpgradeConfig`] holds the rules; [`UpgradePolicy`] is the runtime
//! counterpart that owns an atomic connection counter and answers the
//! origin and capacity checks the transport adapter makes before it
//! completes a handshake.

use crate::config::UpgradeConfig;
use hx_core::HxError;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeRejection {
    /// No server is mounted at the requested path.
    #[error("nothing mounted at {0}")]
    NotMounted(String),
    /// The `Origin` header is not on the allow-list.
    #[error("origin not allowed: {}", .0.as_deref().unwrap_or("<missing>"))]
    OriginDenied(Option<String>),
    /// The mount already holds `max_connections` live connections.
    #[error("connection limit reached ({0})")]
    AtCapacity(usize),
}

impl UpgradeRejection {
    /// HTTP status the adapter answers the handshake with.
    pub fn status(&self) -> u16 {
        match self {
            UpgradeRejection::NotMounted(_) => 404,
            UpgradeRejection::OriginDenied(_) => 403,
            UpgradeRejection::AtCapacity(_) => 503,
        }
    }
}

impl From<UpgradeRejection> for HxError {
    fn from(r: UpgradeRejection) -> Self {
        HxError::Upgrade(r.to_string())
    }
}

/// Runtime upgrade policy with atomic connection tracking.
#[derive(Debug)]
pub struct UpgradePolicy {
    allowed_origins: HashSet<String>,
    /// `true` when the wildcard `"*"` is present.
    allow_all: bool,
    max_connections: usize,
    active: Arc<AtomicUsize>,
}

impl UpgradePolicy {
    pub fn new(config: &UpgradeConfig) -> Self {
        let allow_all = config.allowed_origins.iter().any(|o| o == "*");
        let allowed_origins = config
            .allowed_origins
            .iter()
            .map(|o| o.trim_end_matches('/').to_string())
            .collect();
        Self {
            allowed_origins,
            allow_all,
            max_connections: config.max_connections,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Check the request's `Origin` header against the allow-list.
    pub fn check_origin(&self, origin: Option<&str>) -> Result<(), UpgradeRejection> {
        if self.allow_all {
            return Ok(());
        }
        match origin {
            Some(o) if self.allowed_origins.contains(o.trim_end_matches('/')) => Ok(()),
            other => Err(UpgradeRejection::OriginDenied(other.map(str::to_string))),
        }
    }

    /// Reserve a connection slot. The returned guard releases it on drop,
    /// so it can be moved into the connection's task.
    pub fn try_acquire(&self) -> Result<ConnectionGuard, UpgradeRejection> {
        let max = self.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| UpgradeRejection::AtCapacity(max))?;
        Ok(ConnectionGuard {
            counter: self.active.clone(),
        })
    }

    /// Current number of reserved slots.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// RAII guard that releases a connection slot on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
