//! Outstanding request table.
//!
//! Each request owns a single-slot handoff: the first of a response, a
//! timeout or a cancellation resolves it and removes the entry. Later
//! writers find nothing and are ignored.

use std::time::{Duration, Instant};

use atlas_core::error::SyncError;
use dashmap::DashMap;
use libp2p::PeerId;
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::{MessageType, SyncMessage};

/// Outcome delivered to the requester.
pub type Reply = Result<SyncMessage, SyncError>;

#[derive(Debug)]
struct PendingRequest {
    kind: MessageType,
    peer: PeerId,
    created: Instant,
    timeout: Duration,
    reply: oneshot::Sender<Reply>,
}

/// Pending requests keyed by request ID.
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: DashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new request and return the receiving end of its handoff.
    pub fn register(
        &self,
        request_id: impl Into<String>,
        kind: MessageType,
        peer: PeerId,
        timeout: Duration,
    ) -> oneshot::Receiver<Reply> {
        let (reply, rx) = oneshot::channel();
        self.inner.insert(
            request_id.into(),
            PendingRequest {
                kind,
                peer,
                created: Instant::now(),
                timeout,
                reply,
            },
        );
        rx
    }

    /// Deliver `outcome` to the request. Returns `false` if the request was
    /// unknown or already resolved.
    pub fn resolve(&self, request_id: &str, outcome: Reply) -> bool {
        match self.inner.remove(request_id) {
            Some((_, pending)) => {
                // The requester may have stopped waiting; nothing to do then.
                let _ = pending.reply.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolve every request older than its timeout with
    /// [`SyncError::Timeout`]. Returns how many were purged.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .inner
            .iter()
            .filter(|e| now.saturating_duration_since(e.created) >= e.timeout)
            .map(|e| e.key().clone())
            .collect();
        let mut purged = 0;
        for id in expired {
            if let Some((id, pending)) = self.inner.remove(&id) {
                debug!(request = %id, kind = ?pending.kind, peer = %pending.peer, "request expired");
                let _ = pending.reply.send(Err(SyncError::Timeout(id)));
                purged += 1;
            }
        }
        purged
    }

    /// Resolve every request with [`SyncError::Cancelled`].
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter(|id| self.resolve(id, Err(SyncError::Cancelled(id.clone()))))
            .count()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.inner.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChainStatusRequest;

    fn msg(id: &str) -> SyncMessage {
        SyncMessage::ChainStatusRequest(ChainStatusRequest {
            request_id: id.into(),
        })
    }

    #[tokio::test]
    async fn first_writer_wins() {
        let pending = PendingRequests::new();
        let rx = pending.register("status_1", MessageType::ChainStatusRequest, PeerId::random(), Duration::from_secs(5));
        assert!(pending.resolve("status_1", Ok(msg("status_1"))));
        assert!(!pending.resolve("status_1", Err(SyncError::Timeout("status_1".into()))));
        assert_eq!(rx.await.unwrap(), Ok(msg("status_1")));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn expired_requests_resolve_with_timeout() {
        let pending = PendingRequests::new();
        let rx = pending.register("a", MessageType::BlockRequest, PeerId::random(), Duration::ZERO);
        let _keep = pending.register("b", MessageType::BlockRequest, PeerId::random(), Duration::from_secs(60));
        assert_eq!(pending.purge_expired(Instant::now()), 1);
        assert_eq!(rx.await.unwrap(), Err(SyncError::Timeout("a".into())));
        assert!(pending.contains("b"));
    }

    #[tokio::test]
    async fn cancel_all_drains_table() {
        let pending = PendingRequests::new();
        let rx = pending.register("x", MessageType::BlockRequest, PeerId::random(), Duration::from_secs(60));
        assert_eq!(pending.cancel_all(), 1);
        assert_eq!(rx.await.unwrap(), Err(SyncError::Cancelled("x".into())));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn resolving_unknown_request_is_noop() {
        let pending = PendingRequests::new();
        assert!(!pending.resolve("nope", Ok(msg("nope"))));
    }

    #[test]
    fn dropped_receiver_does_not_block_resolve() {
        let pending = PendingRequests::new();
        drop(pending.register("gone", MessageType::BlockRequest, PeerId::random(), Duration::from_secs(1)));
        assert!(pending.resolve("gone", Ok(msg("gone"))));
    }
}
