//! The P2P transport seam.
//!
//! The sync manager only needs point-to-point sends, peer enumeration and
//! inbound dispatch keyed by [`MessageType`]. A libp2p swarm or the
//! in-memory test transport sits behind this trait.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use atlas_core::error::NetworkError;
use libp2p::PeerId;

use crate::protocol::{MessageType, SyncMessage};

/// Future returned by an inbound handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Inbound message callback. Receives the sending peer and the message.
pub type MessageHandler = Arc<dyn Fn(PeerId, SyncMessage) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(PeerId, SyncMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |peer, message| Box::pin(f(peer, message)) as HandlerFuture)
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Currently connected peers, excluding the local node.
    fn peers(&self) -> Vec<PeerId>;

    /// Send `message` to `peer`.
    async fn send(&self, peer: PeerId, message: SyncMessage) -> Result<(), NetworkError>;

    /// Route inbound messages of `kind` to `handler`, replacing any previous
    /// handler for that kind.
    fn register_handler(&self, kind: MessageType, handler: MessageHandler);
}
