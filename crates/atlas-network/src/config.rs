//! Chain sync configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of the [`ChainSyncManager`](crate::sync::ChainSyncManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Blocks requested per chunk.
    pub chunk_size: u64,
    pub status_timeout_secs: u64,
    pub block_request_timeout_secs: u64,
    /// Interval of the expired-request sweep.
    pub sweep_interval_secs: u64,
    /// Interval of the peer poll that starts a sync when idle.
    pub poll_interval_secs: u64,
    /// Upper bound on blocks served per block request.
    pub max_blocks_per_response: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            status_timeout_secs: 10,
            block_request_timeout_secs: 30,
            sweep_interval_secs: 30,
            poll_interval_secs: 60,
            max_blocks_per_response: 500,
        }
    }
}

impl SyncConfig {
    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }

    pub fn block_request_timeout(&self) -> Duration {
        Duration::from_secs(self.block_request_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
