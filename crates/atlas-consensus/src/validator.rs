//! Validator records and their scoring.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identity attributes required for KYC registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycInfo {
    pub full_name: String,
    pub country: String,
    pub id_number: String,
    pub verified: bool,
}

impl KycInfo {
    /// Verified, with every identity field present.
    pub fn is_complete(&self) -> bool {
        self.verified
            && !self.full_name.is_empty()
            && !self.country.is_empty()
            && !self.id_number.is_empty()
    }
}

/// A registered validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    pub address: String,
    /// Own stake plus every delegation.
    pub stake: u64,
    /// Portion of the own stake locked in this node's ledger. Zero for
    /// validators learned from peers.
    pub self_bond: u64,
    pub delegations: BTreeMap<String, u64>,
    pub slash_count: u32,
    pub active: bool,
    pub performance_score: f64,
    pub uptime: f64,
    pub reputation_score: f64,
    /// Unix seconds of the last metrics update.
    pub last_active: Option<i64>,
    pub blocks_produced: u64,
    /// Unix seconds of each slash.
    pub slashing_history: Vec<i64>,
    pub reward_history: Vec<u64>,
    pub kyc: Option<KycInfo>,
}

impl Validator {
    /// A fresh validator with perfect scores.
    pub fn new(address: impl Into<String>, stake: u64) -> Self {
        Self {
            address: address.into(),
            stake,
            self_bond: 0,
            delegations: BTreeMap::new(),
            slash_count: 0,
            active: true,
            performance_score: 1.0,
            uptime: 1.0,
            reputation_score: 1.0,
            last_active: None,
            blocks_produced: 0,
            slashing_history: Vec::new(),
            reward_history: Vec::new(),
            kyc: None,
        }
    }

    /// Total of all delegations.
    pub fn delegated(&self) -> u64 {
        self.delegations
            .values()
            .fold(0u64, |sum, amount| sum.saturating_add(*amount))
    }

    /// Selection weight: `0.4·stake share + 0.3·performance + 0.2·reputation
    /// + 0.1·uptime`.
    pub fn selection_weight(&self, total_stake: u128) -> f64 {
        let share = if total_stake == 0 {
            0.0
        } else {
            self.stake as f64 / total_stake as f64
        };
        0.4 * share + 0.3 * self.performance_score + 0.2 * self.reputation_score + 0.1 * self.uptime
    }

    /// Rotation score: `0.4·performance + 0.3·reputation + 0.3·uptime`.
    pub fn rotation_score(&self) -> f64 {
        0.4 * self.performance_score + 0.3 * self.reputation_score + 0.3 * self.uptime
    }
}
