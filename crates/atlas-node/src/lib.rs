//! # atlas-node: Full node composition.
//!
//! Composes the Atlas subsystems into a running node:
//! - [`node::Node`]: ledger, pool, consensus and sync wired together, with
//!   the block-production tick and start/stop lifecycle
//! - [`node::NodeChain`]: block store and the import path shared by
//!   production and sync
//! - [`tasks::TaskSet`]: cancellable periodic background tasks
//! - [`config::NodeConfig`]: node configuration and loading

pub mod config;
pub mod node;
pub mod tasks;

pub use config::{NodeConfig, SnapshotConfig};
pub use node::{Node, NodeChain};
pub use tasks::TaskSet;
