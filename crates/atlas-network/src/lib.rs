//! # atlas-network: Sync protocol and transport seam.
//!
//! Defines the bincode wire messages exchanged between peers, the
//! [`Transport`] trait a P2P stack implements, the pending-request table
//! that correlates responses by request ID, and the [`ChainSyncManager`]
//! that catches a node up to the highest peer.
//!
//! With the `testing` feature, [`memory::MemoryNetwork`] provides an
//! in-process transport for multi-node tests.

pub mod config;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod pending;
pub mod protocol;
pub mod sync;
pub mod transport;

pub use config::SyncConfig;
pub use pending::PendingRequests;
pub use protocol::{
    BlockRequest, BlockResponse, ChainStatus, ChainStatusRequest, ChainStatusResponse,
    ForkResolution, MessageType, SyncMessage, MAX_MESSAGE_SIZE,
};
pub use sync::{ChainSyncManager, SyncObserver, SyncStatus, NO_BLOCKS_IN_RANGE};
pub use transport::{handler_fn, HandlerFuture, MessageHandler, Transport};
