//! In-process [`Transport`] for tests.
//!
//! Every transport joined to a [`MemoryNetwork`] sees every other member as
//! a connected peer. Messages go through the real wire codec and are
//! delivered on a spawned task, so a running tokio runtime is required.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use atlas_core::error::NetworkError;
use dashmap::DashMap;
use libp2p::PeerId;
use tracing::debug;

use crate::protocol::{MessageType, SyncMessage};
use crate::transport::{MessageHandler, Transport};

#[derive(Default)]
struct Endpoint {
    handlers: DashMap<MessageType, MessageHandler>,
    /// Inbound messages are silently dropped while set.
    muted: AtomicBool,
}

/// A set of in-process peers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<DashMap<PeerId, Arc<Endpoint>>>,
    delivered: Arc<AtomicUsize>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new peer with a random ID.
    pub fn join(&self) -> Arc<MemoryTransport> {
        let id = PeerId::random();
        let endpoint = Arc::new(Endpoint::default());
        self.endpoints.insert(id, endpoint.clone());
        Arc::new(MemoryTransport {
            id,
            network: self.clone(),
            endpoint,
        })
    }

    pub fn leave(&self, peer: &PeerId) {
        self.endpoints.remove(peer);
    }

    /// Drop every message sent to `peer` while `muted` is set.
    pub fn set_muted(&self, peer: &PeerId, muted: bool) {
        if let Some(ep) = self.endpoints.get(peer) {
            ep.muted.store(muted, Ordering::SeqCst);
        }
    }

    /// Messages handed to a handler so far.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

/// One peer's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    id: PeerId,
    network: MemoryNetwork,
    endpoint: Arc<Endpoint>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.id
    }

    fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .network
            .endpoints
            .iter()
            .map(|e| *e.key())
            .filter(|p| *p != self.id)
            .collect();
        peers.sort();
        peers
    }

    async fn send(&self, peer: PeerId, message: SyncMessage) -> Result<(), NetworkError> {
        let target = self
            .network
            .endpoints
            .get(&peer)
            .map(|e| e.value().clone())
            .ok_or_else(|| NetworkError::UnknownPeer(peer.to_string()))?;

        let bytes = message.encode()?;
        let message = SyncMessage::decode(&bytes)?;

        if target.muted.load(Ordering::SeqCst) {
            debug!(%peer, kind = ?message.message_type(), "dropping message to muted peer");
            return Ok(());
        }
        let handler = target
            .handlers
            .get(&message.message_type())
            .map(|h| h.value().clone());
        match handler {
            Some(handler) => {
                self.network.delivered.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handler(self.id, message));
            }
            None => debug!(%peer, kind = ?message.message_type(), "no handler registered"),
        }
        Ok(())
    }

    fn register_handler(&self, kind: MessageType, handler: MessageHandler) {
        self.endpoint.handlers.insert(kind, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChainStatusRequest;
    use crate::transport::handler_fn;
    use tokio::sync::mpsc;

    fn status_request(id: &str) -> SyncMessage {
        SyncMessage::ChainStatusRequest(ChainStatusRequest {
            request_id: id.into(),
        })
    }

    #[tokio::test]
    async fn peers_exclude_self() {
        let net = MemoryNetwork::new();
        let a = net.join();
        let b = net.join();
        assert_eq!(a.peers(), vec![b.local_peer_id()]);
        net.leave(&b.local_peer_id());
        assert!(a.peers().is_empty());
    }

    #[tokio::test]
    async fn messages_reach_registered_handler() {
        let net = MemoryNetwork::new();
        let a = net.join();
        let b = net.join();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register_handler(
            MessageType::ChainStatusRequest,
            handler_fn(move |from: PeerId, msg: SyncMessage| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((from, msg));
                }
            }),
        );
        a.send(b.local_peer_id(), status_request("status_1")).await.unwrap();
        let (from, msg) = rx.recv().await.unwrap();
        assert_eq!(from, a.local_peer_id());
        assert_eq!(msg, status_request("status_1"));
        assert_eq!(net.delivered(), 1);
    }

    #[tokio::test]
    async fn unknown_peer_is_error() {
        let net = MemoryNetwork::new();
        let a = net.join();
        let err = a.send(PeerId::random(), status_request("x")).await.unwrap_err();
        assert!(matches!(err, NetworkError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn muted_peer_drops_messages() {
        let net = MemoryNetwork::new();
        let a = net.join();
        let b = net.join();
        b.register_handler(
            MessageType::ChainStatusRequest,
            handler_fn(|_, _| async {}),
        );
        net.set_muted(&b.local_peer_id(), true);
        a.send(b.local_peer_id(), status_request("x")).await.unwrap();
        assert_eq!(net.delivered(), 0);
    }
}
