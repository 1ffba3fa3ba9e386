//! In-memory priority pool of pending transactions.
//!
//! The pool provides:
//! - O(1) lookup and deduplication by content hash
//! - O(log n) highest-priority-first selection for block production
//! - Capacity-bounded storage with lowest-priority eviction
//!
//! Priority is computed once at admission from the amount, declared fee,
//! age, sender reputation, payload complexity, and the transaction's
//! success rate in earlier block attempts. Equal priorities pop in
//! insertion order.
//!
//! Per-transaction history is dropped as soon as the transaction leaves the
//! pool for good: confirmed, expired, evicted or rejected.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use ordered_float::OrderedFloat;
use tracing::debug;

use crate::error::{MempoolError, TransactionError};
use crate::types::{Block, Hash256, Transaction, TxPayload};
use crate::validation::validate_transaction;

/// Default maximum number of transactions in the pool.
pub const DEFAULT_MAX_COUNT: usize = crate::constants::DEFAULT_MAX_TX_POOL_SIZE;

const W_AMOUNT: f64 = 0.3;
const W_FEE: f64 = 0.2;
const W_AGE: f64 = 0.1;
const W_REPUTATION: f64 = 0.1;
const W_COMPLEXITY: f64 = 0.15;
const W_SUCCESS: f64 = 0.15;

/// Step applied to reputation and success-rate scores per outcome.
const SCORE_STEP: f64 = 0.1;

/// Bound on the magnitude of reputation and success-rate scores.
const SCORE_LIMIT: f64 = 1.0;

type PriorityKey = (OrderedFloat<f64>, Reverse<u64>, Hash256);

/// A transaction held in the pool with its admission metadata.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub tx: Transaction,
    pub hash: Hash256,
    pub priority: f64,
    /// Congestion-priced fee computed at admission.
    pub fee: i64,
    /// Unix seconds at admission.
    pub inserted_at: i64,
    seq: u64,
}

impl PoolEntry {
    fn key(&self) -> PriorityKey {
        (OrderedFloat(self.priority), Reverse(self.seq), self.hash)
    }
}

/// Priority-ordered pool of pending transactions.
///
/// Not thread-safe; callers wrap it in a `Mutex`, which makes admission and
/// eviction atomic together.
#[derive(Debug)]
pub struct Mempool {
    entries: HashMap<Hash256, PoolEntry>,
    /// Ascending: lowest priority first (eviction); iterate in reverse for
    /// block selection.
    by_priority: BTreeSet<PriorityKey>,
    max_count: usize,
    expiration_secs: u64,
    next_seq: u64,
    fee_multiplier: f64,
    sender_reputation: HashMap<String, f64>,
    success_rate: HashMap<Hash256, f64>,
}

impl Mempool {
    /// Create a pool holding at most `max_count` transactions, each expiring
    /// `expiration_secs` after admission.
    pub fn new(max_count: usize, expiration_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            by_priority: BTreeSet::new(),
            max_count: max_count.max(1),
            expiration_secs,
            next_seq: 0,
            fee_multiplier: 1.0,
            sender_reputation: HashMap::new(),
            success_rate: HashMap::new(),
        }
    }

    /// Create a pool with default limits.
    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_MAX_COUNT,
            crate::constants::DEFAULT_TX_EXPIRATION_SECS,
        )
    }

    /// Admit `tx` at the current wall-clock time.
    ///
    /// `expected_nonce` is the sender's nonce in the ledger; network
    /// transactions skip the check.
    pub fn insert(&mut self, tx: Transaction, expected_nonce: u64) -> Result<Hash256, MempoolError> {
        self.insert_at(tx, expected_nonce, chrono::Utc::now().timestamp())
    }

    /// Admit `tx` as of `now` (Unix seconds).
    ///
    /// Rejects structurally invalid transactions, nonce mismatches, and
    /// duplicates. If the pool is full the lowest-priority entry is evicted,
    /// but only when the new transaction's priority is strictly higher.
    pub fn insert_at(
        &mut self,
        tx: Transaction,
        expected_nonce: u64,
        now: i64,
    ) -> Result<Hash256, MempoolError> {
        validate_transaction(&tx)?;
        if !tx.is_network() && tx.nonce != expected_nonce {
            return Err(TransactionError::InvalidNonce {
                address: tx.sender.clone(),
                expected: expected_nonce,
                got: tx.nonce,
            }
            .into());
        }
        self.admit(tx, now, true)
    }

    fn admit(&mut self, tx: Transaction, now: i64, evict: bool) -> Result<Hash256, MempoolError> {
        let hash = tx.hash();
        if self.entries.contains_key(&hash) {
            return Err(MempoolError::AlreadyExists(hash.to_string()));
        }

        self.update_fee_multiplier();
        let priority = self.priority_at(&tx, now);

        if self.entries.len() >= self.max_count {
            let Some(&lowest) = self.by_priority.first() else {
                return Err(MempoolError::PoolFull);
            };
            if !evict || lowest.0.into_inner() >= priority {
                return Err(MempoolError::PoolFull);
            }
            self.remove_key(lowest);
            debug!(evicted = %lowest.2.short(), "evicted lowest-priority transaction");
        }

        let fee = self.calculate_fee(&tx);
        let entry = PoolEntry {
            tx,
            hash,
            priority,
            fee,
            inserted_at: now,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.by_priority.insert(entry.key());
        self.entries.insert(hash, entry);
        debug!(hash = %hash.short(), priority, fee, size = self.entries.len(), "admitted transaction");
        Ok(hash)
    }

    fn remove_key(&mut self, key: PriorityKey) -> Option<PoolEntry> {
        self.by_priority.remove(&key);
        self.success_rate.remove(&key.2);
        self.entries.remove(&key.2)
    }

    /// Remove a transaction by hash.
    pub fn remove(&mut self, hash: &Hash256) -> Option<PoolEntry> {
        let key = self.entries.get(hash)?.key();
        self.remove_key(key)
    }

    /// Pop up to `limit` highest-priority transactions, highest first.
    ///
    /// Their history is kept until they are confirmed, rejected or fail to
    /// requeue.
    pub fn take_for_block(&mut self, limit: usize) -> Vec<Transaction> {
        let mut out = Vec::with_capacity(limit.min(self.entries.len()));
        while out.len() < limit {
            let Some(key) = self.by_priority.pop_last() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key.2) {
                out.push(entry.tx);
            }
        }
        out
    }

    /// Return transactions to the pool after a failed block, skipping the
    /// nonce check and without evicting anything. Returns how many were
    /// re-admitted.
    pub fn requeue(&mut self, txs: Vec<Transaction>, now: i64) -> usize {
        let mut requeued = 0;
        for tx in txs {
            let hash = tx.hash();
            match self.admit(tx, now, false) {
                Ok(_) => requeued += 1,
                Err(MempoolError::AlreadyExists(_)) => {}
                Err(_) => {
                    self.success_rate.remove(&hash);
                }
            }
        }
        requeued
    }

    /// Forget a taken transaction that failed block application, lowering
    /// its sender's reputation.
    pub fn reject(&mut self, tx: &Transaction) {
        self.record_sender_outcome(&tx.sender, false);
        self.success_rate.remove(&tx.hash());
    }

    /// Drop entries older than the expiration age as of `now`. Returns the
    /// number removed.
    pub fn sweep(&mut self, now: i64) -> usize {
        let max_age = i64::try_from(self.expiration_secs).unwrap_or(i64::MAX);
        let expired: Vec<PriorityKey> = self
            .entries
            .values()
            .filter(|e| now.saturating_sub(e.inserted_at) > max_age)
            .map(PoolEntry::key)
            .collect();
        for key in &expired {
            self.remove_key(*key);
        }
        expired.len()
    }

    /// Drop every pool entry included in `block`, along with the history
    /// of every transaction in it.
    pub fn remove_confirmed(&mut self, block: &Block) -> usize {
        let mut removed = 0;
        for tx in &block.transactions {
            let hash = tx.hash();
            if self.remove(&hash).is_some() {
                removed += 1;
            }
            self.success_rate.remove(&hash);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_priority.clear();
        self.success_rate.clear();
    }

    pub fn get(&self, hash: &Hash256) -> Option<&PoolEntry> {
        self.entries.get(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    /// Every pooled transaction, highest priority first.
    pub fn all(&self) -> Vec<Transaction> {
        self.iter().map(|e| e.tx.clone()).collect()
    }

    /// Entries in priority order, highest first.
    pub fn iter(&self) -> impl Iterator<Item = &PoolEntry> {
        self.by_priority
            .iter()
            .rev()
            .filter_map(|key| self.entries.get(&key.2))
    }

    /// Priority of the entry that would be evicted next.
    pub fn lowest_priority(&self) -> Option<f64> {
        self.by_priority.first().map(|k| k.0.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Number of transactions with a recorded block-attempt history.
    pub fn tracked_outcomes(&self) -> usize {
        self.success_rate.len()
    }

    // ------------------------------------------------------------------
    // Pricing
    // ------------------------------------------------------------------

    fn update_fee_multiplier(&mut self) {
        let usage = self.entries.len() as f64 / self.max_count as f64;
        self.fee_multiplier = 1.0 + 4.0 * usage;
    }

    /// Congestion multiplier as of the last admission, in `[1.0, 5.0]`.
    pub fn fee_multiplier(&self) -> f64 {
        self.fee_multiplier
    }

    /// `(1 + (len(sender)+len(recipient))/100 + ⌊amount·0.001⌋) × multiplier`,
    /// at least 1.
    pub fn calculate_fee(&self, tx: &Transaction) -> i64 {
        let size_fee = ((tx.sender.len() + tx.recipient.len()) / 100) as i64;
        let amount_fee = (tx.amount as f64 * 0.001) as i64;
        let fee = (1_i64.saturating_add(size_fee).saturating_add(amount_fee)) as f64
            * self.fee_multiplier;
        (fee as i64).max(1)
    }

    /// Priority of `tx` if it were admitted at `now`.
    pub fn priority_at(&self, tx: &Transaction, now: i64) -> f64 {
        let amount = tx.amount as f64 / 1000.0;
        let fee = tx.fee as f64 / 100.0;
        let age_hours = now.saturating_sub(tx.timestamp) as f64 / 3600.0;
        W_AMOUNT * amount
            + W_FEE * fee
            + W_AGE * age_hours
            + W_REPUTATION * self.sender_reputation(&tx.sender)
            + W_COMPLEXITY * complexity(&tx.payload)
            + W_SUCCESS * self.success_rate(&tx.hash())
    }

    // ------------------------------------------------------------------
    // Scoring inputs
    // ------------------------------------------------------------------

    pub fn sender_reputation(&self, sender: &str) -> f64 {
        self.sender_reputation.get(sender).copied().unwrap_or(0.0)
    }

    /// Nudge a sender's reputation up or down by one step, within
    /// `[-1, 1]`.
    pub fn record_sender_outcome(&mut self, sender: &str, success: bool) {
        let score = self.sender_reputation.entry(sender.to_string()).or_insert(0.0);
        *score = step(*score, success);
    }

    pub fn success_rate(&self, hash: &Hash256) -> f64 {
        self.success_rate.get(hash).copied().unwrap_or(0.0)
    }

    /// Nudge a transaction's success rate up or down by one step, within
    /// `[-1, 1]`. Call before requeueing it so the new priority sees it.
    pub fn record_tx_outcome(&mut self, hash: Hash256, success: bool) {
        let rate = self.success_rate.entry(hash).or_insert(0.0);
        *rate = step(*rate, success);
    }
}

fn step(score: f64, success: bool) -> f64 {
    let delta = if success { SCORE_STEP } else { -SCORE_STEP };
    (score + delta).clamp(-SCORE_LIMIT, SCORE_LIMIT)
}

/// Execution weight of a payload in `[0, 1]`.
fn complexity(payload: &TxPayload) -> f64 {
    match payload {
        TxPayload::Regular => 0.0,
        TxPayload::Stake | TxPayload::Vote(_) => 0.25,
        TxPayload::Proposal(_) => 0.5,
        TxPayload::Call(_) => 0.75,
        TxPayload::Deploy(_) => 1.0,
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::with_defaults()
    }
}
