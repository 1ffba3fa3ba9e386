//! Block confirmation counting and finality.
//!
//! A block is final once its confirmation count reaches the threshold.
//! Finality is permanent: garbage collection drops confirmation counters of
//! old finalized blocks but never un-finalizes them.

use std::collections::{HashMap, HashSet};

use atlas_core::types::Hash256;
use tracing::info;

#[derive(Debug, Clone, Copy)]
struct Confirmations {
    count: u32,
    /// Unix seconds at which the threshold was reached.
    finalized_at: Option<i64>,
}

/// Confirmation counters and the finalized set.
#[derive(Debug, Clone)]
pub struct FinalityTracker {
    threshold: u32,
    window_secs: u64,
    confirmations: HashMap<Hash256, Confirmations>,
    finalized: HashSet<Hash256>,
}

impl FinalityTracker {
    pub fn new(threshold: u32, window_secs: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            window_secs,
            confirmations: HashMap::new(),
            finalized: HashSet::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Count one confirmation of `hash`. Returns `true` if this confirmation
    /// finalized the block.
    pub fn track(&mut self, hash: Hash256, now: i64) -> bool {
        let entry = self.confirmations.entry(hash).or_insert(Confirmations {
            count: 0,
            finalized_at: None,
        });
        entry.count = entry.count.saturating_add(1);
        if entry.count >= self.threshold && entry.finalized_at.is_none() {
            entry.finalized_at = Some(now);
            if self.finalized.insert(hash) {
                info!(hash = %hash.short(), confirmations = entry.count, "block finalized");
                return true;
            }
        }
        false
    }

    /// Mark `hash` final without counting confirmations.
    pub fn mark_finalized(&mut self, hash: Hash256) {
        self.finalized.insert(hash);
    }

    pub fn is_finalized(&self, hash: &Hash256) -> bool {
        self.finalized.contains(hash)
    }

    pub fn confirmations(&self, hash: &Hash256) -> u32 {
        self.confirmations.get(hash).map_or(0, |c| c.count)
    }

    /// `(confirmations, finalized)`.
    pub fn status(&self, hash: &Hash256) -> (u32, bool) {
        (self.confirmations(hash), self.is_finalized(hash))
    }

    /// Drop counters of blocks finalized more than the window ago. Returns
    /// how many were dropped.
    pub fn cleanup(&mut self, now: i64) -> usize {
        let window = i64::try_from(self.window_secs).unwrap_or(i64::MAX);
        let before = self.confirmations.len();
        self.confirmations.retain(|_, c| match c.finalized_at {
            Some(at) => now.saturating_sub(at) <= window,
            None => true,
        });
        before - self.confirmations.len()
    }

    /// Number of tracked confirmation counters.
    pub fn tracked(&self) -> usize {
        self.confirmations.len()
    }
}
