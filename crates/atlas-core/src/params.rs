//! Chain parameters shared by the ledger, pool, and consensus manager.

use serde::{Deserialize, Serialize};

use crate::constants::*;

/// Tunable protocol parameters.
///
/// Defaults match the public network. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    /// Maximum transactions per block.
    pub max_block_size: usize,
    /// Maximum transactions in the pool.
    pub max_tx_pool_size: usize,
    /// Age after which pooled transactions expire.
    pub tx_expiration_secs: u64,
    /// Target interval between blocks.
    pub block_time_secs: u64,
    /// Minimum amount of an on-chain stake transaction.
    pub min_stake: u64,
    /// Reward paid to the forging validator.
    pub block_reward: i64,
    /// Blocks between validator rotations.
    pub validator_rotation: u64,
    pub max_validators: usize,
    /// Slashes after which a validator is removed.
    pub slashing_threshold: usize,
    /// Confirmations required for finality.
    pub finality_threshold: u32,
    /// Window after which finalized confirmation records are collected.
    pub confirmation_window_secs: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            max_tx_pool_size: DEFAULT_MAX_TX_POOL_SIZE,
            tx_expiration_secs: DEFAULT_TX_EXPIRATION_SECS,
            block_time_secs: DEFAULT_BLOCK_TIME_SECS,
            min_stake: DEFAULT_MIN_STAKE,
            block_reward: DEFAULT_BLOCK_REWARD,
            validator_rotation: DEFAULT_VALIDATOR_ROTATION,
            max_validators: DEFAULT_MAX_VALIDATORS,
            slashing_threshold: DEFAULT_SLASHING_THRESHOLD,
            finality_threshold: DEFAULT_FINALITY_THRESHOLD,
            confirmation_window_secs: DEFAULT_CONFIRMATION_WINDOW_SECS,
        }
    }
}

impl ChainParams {
    /// Reject parameters that would stall or break the chain.
    pub fn validate(&self) -> Result<(), String> {
        let checks: [(&str, bool); 10] = [
            ("max_block_size", self.max_block_size > 0),
            ("max_tx_pool_size", self.max_tx_pool_size > 0),
            ("tx_expiration_secs", self.tx_expiration_secs > 0),
            ("block_time_secs", self.block_time_secs > 0),
            ("min_stake", self.min_stake > 0),
            ("block_reward", self.block_reward > 0),
            ("validator_rotation", self.validator_rotation > 0),
            ("max_validators", self.max_validators > 0),
            ("slashing_threshold", self.slashing_threshold > 0),
            ("finality_threshold", self.finality_threshold > 0),
        ];
        match checks.iter().find(|(_, ok)| !ok) {
            Some((name, _)) => Err(format!("{name} must be positive")),
            None => Ok(()),
        }
    }
}
