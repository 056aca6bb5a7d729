//! Registry of live connections.
//!
//! Membership is a single `Vec` behind one async mutex. Structural changes
//! and snapshots take the lock; sends happen after the lock is released, on
//! a snapshot, so a slow client never blocks registration or other
//! broadcasts.

use crate::connection::Connection;
use futures_util::future::join_all;
use hx_core::{ConnectionId, Frame, HxError, HxResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A send that failed during a broadcast.
#[derive(Debug)]
pub struct SendFailure {
    pub id: ConnectionId,
    pub error: HxError,
}

/// Outcome of one broadcast: who got the frame and who did not.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<ConnectionId>,
    pub failures: Vec<SendFailure>,
}

impl BroadcastReport {
    /// Number of members that were sent to, successfully or not.
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failures.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The set of currently connected sessions.
#[derive(Default)]
pub struct Registry {
    members: Mutex<Vec<Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns `false` (and leaves the registry unchanged)
    /// if a member with the same id is already present.
    pub async fn add(&self, conn: Arc<Connection>) -> bool {
        let mut members = self.members.lock().await;
        if members.iter().any(|c| c.id() == conn.id()) {
            return false;
        }
        members.push(conn);
        true
    }

    /// Remove the member with this id. Removing an unknown id is a no-op.
    pub async fn remove_by_id(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut members = self.members.lock().await;
        let index = members.iter().position(|c| c.id() == id)?;
        Some(members.remove(index))
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let members = self.members.lock().await;
        members.iter().find(|c| c.id() == id).cloned()
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.get(id).await.is_some()
    }

    /// Stable copy of the current membership, in insertion order.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.members.lock().await.clone()
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        let members = self.members.lock().await;
        members.iter().map(|c| c.id().clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.is_empty()
    }

    /// Send `data` as a text frame to every member.
    ///
    /// # Errors
    ///
    /// [`HxError::InvalidText`] if `data` is not UTF-8. Individual send
    /// failures land in the report.
    pub async fn broadcast(&self, data: &[u8]) -> HxResult<BroadcastReport> {
        Ok(self.broadcast_frame(text_frame(data)?).await)
    }

    /// Send `data` as a text frame to every member for which `predicate`
    /// returns `true`.
    ///
    /// # Errors
    ///
    /// [`HxError::InvalidText`] if `data` is not UTF-8.
    pub async fn broadcast_filtered<P>(&self, data: &[u8], predicate: P) -> HxResult<BroadcastReport>
    where
        P: Fn(&Connection) -> bool,
    {
        Ok(self.broadcast_frame_filtered(text_frame(data)?, predicate).await)
    }

    /// Send `frame` to every member.
    pub async fn broadcast_frame(&self, frame: Frame) -> BroadcastReport {
        self.broadcast_frame_filtered(frame, |_| true).await
    }

    /// Send `frame` to the members selected by `predicate`.
    ///
    /// The predicate and the sends run against one snapshot, so a member is
    /// either sent to or skipped, never both. One member failing does not
    /// stop the others from being attempted.
    pub async fn broadcast_frame_filtered<P>(&self, frame: Frame, predicate: P) -> BroadcastReport
    where
        P: Fn(&Connection) -> bool,
    {
        let targets: Vec<Arc<Connection>> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|c| predicate(c.as_ref()))
            .collect();

        let results = join_all(targets.iter().map(|conn| {
            let frame = frame.clone();
            async move { (conn.id().clone(), conn.send_frame(frame).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered.push(id),
                Err(error) => {
                    warn!(conn_id = %id.short(), error = %error, "broadcast send failed");
                    report.failures.push(SendFailure { id, error });
                }
            }
        }
        debug!(
            delivered = report.delivered.len(),
            failed = report.failures.len(),
            "broadcast complete"
        );
        report
    }
}

fn text_frame(data: &[u8]) -> HxResult<Frame> {
    let text = std::str::from_utf8(data).map_err(|_| HxError::InvalidText)?;
    Ok(Frame::Text(text.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{self, MemoryPeer};
    use hx_core::Duplex;
    use rand::seq::SliceRandom;

    fn connect() -> (Arc<Connection>, MemoryPeer) {
        let (channel, peer) = memory::pair();
        let (sink, _source) = channel.split();
        (Arc::new(Connection::new(sink, None).unwrap()), peer)
    }

    #[tokio::test]
    async fn add_then_remove_excludes_from_broadcast() {
        let registry = Registry::new();
        let (a, mut peer_a) = connect();
        let (b, mut peer_b) = connect();
        assert!(registry.add(a.clone()).await);
        assert!(registry.add(b.clone()).await);

        let removed = registry.remove_by_id(a.id()).await.unwrap();
        assert_eq!(removed.id(), a.id());

        let report = registry.broadcast(b"tick").await.unwrap();
        assert_eq!(report.delivered, vec![b.id().clone()]);
        assert!(peer_a.try_recv().is_none());
        assert_eq!(peer_b.recv().await, Some(Frame::Text("tick".into())));
    }

    #[tokio::test]
    async fn remove_unknown_id_is_noop() {
        let registry = Registry::new();
        let (a, _peer) = connect();
        registry.add(a.clone()).await;

        let (stranger, _p) = connect();
        assert!(registry.remove_by_id(stranger.id()).await.is_none());
        assert!(registry.remove_by_id(a.id()).await.is_some());
        // second removal of the same id
        assert!(registry.remove_by_id(a.id()).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let registry = Registry::new();
        let (a, _peer) = connect();
        assert!(registry.add(a.clone()).await);
        assert!(!registry.add(a.clone()).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn broadcast_partial_failure() {
        let registry = Registry::new();
        let (a, mut peer_a) = connect();
        let (b, peer_b) = connect();
        let (c, mut peer_c) = connect();
        for conn in [&a, &b, &c] {
            registry.add(conn.clone()).await;
        }
        drop(peer_b);

        let report = registry.broadcast(b"<div id=\"x\">hi</div>").await.unwrap();
        assert_eq!(report.attempted(), 3);
        assert_eq!(report.delivered.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(&report.failures[0].id, b.id());
        assert!(matches!(report.failures[0].error, HxError::TransportClosed));
        assert!(!report.is_complete());

        assert!(peer_a.recv().await.is_some());
        assert!(peer_c.recv().await.is_some());
    }

    #[tokio::test]
    async fn filtered_broadcast() {
        let registry = Registry::new();
        let (a, mut peer_a) = connect();
        let (b, mut peer_b) = connect();
        registry.add(a.clone()).await;
        registry.add(b.clone()).await;

        let target = b.id().clone();
        let report = registry
            .broadcast_filtered(b"only-b", |c| c.id() == &target)
            .await
            .unwrap();

        assert_eq!(report.delivered, vec![target]);
        assert_eq!(peer_b.recv().await, Some(Frame::Text("only-b".into())));
        assert!(peer_a.try_recv().is_none());
    }

    #[tokio::test]
    async fn broadcast_rejects_invalid_utf8() {
        let registry = Registry::new();
        let (a, _peer) = connect();
        registry.add(a).await;
        assert!(matches!(registry.broadcast(&[0xc3, 0x28]).await, Err(HxError::InvalidText)));
    }

    #[tokio::test]
    async fn broadcast_to_empty_registry() {
        let registry = Registry::new();
        let report = registry.broadcast(b"nobody").await.unwrap();
        assert_eq!(report.attempted(), 0);
        assert!(report.is_complete());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_add_and_remove_leave_registry_empty() {
        for _round in 0..10 {
            let registry = Arc::new(Registry::new());
            let mut conns: Vec<(Arc<Connection>, MemoryPeer)> = (0..64).map(|_| connect()).collect();
            conns.shuffle(&mut rand::thread_rng());

            let adds: Vec<_> = conns
                .iter()
                .map(|(c, _)| {
                    let registry = registry.clone();
                    let c = c.clone();
                    tokio::spawn(async move { registry.add(c).await })
                })
                .collect();
            for t in adds {
                assert!(t.await.unwrap());
            }
            assert_eq!(registry.len().await, 64);

            let mut ids = registry.ids().await;
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), 64);

            conns.shuffle(&mut rand::thread_rng());
            let removes: Vec<_> = conns
                .iter()
                .map(|(c, _)| {
                    let registry = registry.clone();
                    let id = c.id().clone();
                    tokio::spawn(async move { registry.remove_by_id(&id).await.is_some() })
                })
                .collect();
            for t in removes {
                assert!(t.await.unwrap());
            }
            assert!(registry.is_empty().await);
        }
    }
}
