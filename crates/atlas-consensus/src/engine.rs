//! Consensus manager implementing the ledger's [`StakeHook`].
//!
//! Owns the validator registry and the finality tracker behind one
//! `RwLock`. Stake that backs a validator always lives in the owning
//! account's `staked_amount`; registration, delegation, stake updates and
//! removal move balance through the [`StateManager`].
//!
//! Lock order is registry first, then ledger. The ledger never calls into
//! this manager while holding its own lock.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use atlas_core::constants::{MAX_PERFORMANCE_HISTORY, MIN_FORGING_STAKE};
use atlas_core::error::{BlockError, ConsensusError, TransactionError};
use atlas_core::params::ChainParams;
use atlas_core::state::StateManager;
use atlas_core::traits::StakeHook;
use atlas_core::types::{Block, Hash256, TxPayload};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::finality::FinalityTracker;
use crate::validator::{KycInfo, Validator};

/// Fraction of the validator set removed by each rotation.
const ROTATION_FRACTION: f64 = 0.2;

struct Registry {
    validators: BTreeMap<String, Validator>,
    performance_history: HashMap<String, VecDeque<f64>>,
    finality: FinalityTracker,
}

/// The proof-of-stake consensus manager.
pub struct ConsensusManager {
    inner: RwLock<Registry>,
    state: Arc<StateManager>,
    params: ChainParams,
    rng: Mutex<StdRng>,
    clock: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl fmt::Debug for ConsensusManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusManager")
            .field("validators", &self.validator_count())
            .finish_non_exhaustive()
    }
}

impl ConsensusManager {
    /// Create a manager with the system clock.
    pub fn new(params: ChainParams, state: Arc<StateManager>) -> Self {
        Self::with_clock(params, state, || chrono::Utc::now().timestamp())
    }

    /// Create a manager with a custom clock (Unix seconds).
    pub fn with_clock(
        params: ChainParams,
        state: Arc<StateManager>,
        clock: impl Fn() -> i64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: RwLock::new(Registry {
                validators: BTreeMap::new(),
                performance_history: HashMap::new(),
                finality: FinalityTracker::new(
                    params.finality_threshold,
                    params.confirmation_window_secs,
                ),
            }),
            state,
            params,
            rng: Mutex::new(StdRng::from_entropy()),
            clock: Box::new(clock),
        }
    }

    /// Seed the selection RNG for reproducible draws.
    ///
    /// Available under `#[cfg(test)]` or the `testing` feature.
    #[cfg(any(test, feature = "testing"))]
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    // ------------------------------------------------------------------
    // Registration and stake
    // ------------------------------------------------------------------

    /// Register a KYC-verified validator, moving `stake` out of its
    /// spendable balance.
    pub fn register_validator(
        &self,
        address: &str,
        stake: u64,
        kyc: KycInfo,
    ) -> Result<(), ConsensusError> {
        let mut reg = self.inner.write();
        if reg.validators.contains_key(address) {
            return Err(ConsensusError::AlreadyRegistered(address.to_string()));
        }
        if reg.validators.len() >= self.params.max_validators {
            return Err(ConsensusError::TooManyValidators(self.params.max_validators));
        }
        if stake < MIN_FORGING_STAKE {
            return Err(ConsensusError::StakeTooLow {
                amount: stake,
                minimum: MIN_FORGING_STAKE,
            });
        }
        let need = i64::try_from(stake).map_err(|_| ConsensusError::InvalidAmount(i64::MAX))?;
        let have = self.state.get_balance(address);
        if have < need {
            return Err(ConsensusError::InsufficientBalance {
                address: address.to_string(),
                have,
                need,
            });
        }
        if !kyc.is_complete() {
            return Err(ConsensusError::KycRequired);
        }
        self.state
            .stake(address, stake)
            .map_err(|e| stake_error(address, need, e))?;
        self.state.set_validator_flag(address, true);

        let mut v = Validator::new(address, stake);
        v.self_bond = stake;
        v.kyc = Some(kyc);
        reg.validators.insert(address.to_string(), v);
        reg.performance_history.insert(address.to_string(), VecDeque::new());
        info!(address, stake, "validator registered");
        Ok(())
    }

    /// Delegate `amount` of `delegator`'s balance to `validator`.
    pub fn delegate_stake(
        &self,
        delegator: &str,
        validator: &str,
        amount: i64,
    ) -> Result<(), ConsensusError> {
        if amount <= 0 {
            return Err(ConsensusError::InvalidAmount(amount));
        }
        let mut reg = self.inner.write();
        let v = reg
            .validators
            .get_mut(validator)
            .ok_or_else(|| ConsensusError::ValidatorNotFound(validator.to_string()))?;
        let units = amount.unsigned_abs();
        self.state
            .stake(delegator, units)
            .map_err(|e| stake_error(delegator, amount, e))?;
        *v.delegations.entry(delegator.to_string()).or_insert(0) += units;
        v.stake = v.stake.saturating_add(units);
        info!(delegator, validator, amount, "stake delegated");
        Ok(())
    }

    /// Withdraw `delegator`'s whole delegation from `validator`. Returns the
    /// amount released.
    pub fn undelegate_stake(&self, delegator: &str, validator: &str) -> Result<u64, ConsensusError> {
        let mut reg = self.inner.write();
        let v = reg
            .validators
            .get_mut(validator)
            .ok_or_else(|| ConsensusError::ValidatorNotFound(validator.to_string()))?;
        let amount = v
            .delegations
            .remove(delegator)
            .ok_or_else(|| ConsensusError::DelegationNotFound {
                delegator: delegator.to_string(),
                validator: validator.to_string(),
            })?;
        v.stake = v.stake.saturating_sub(amount);
        if let Err(e) = self.state.unstake(delegator, amount) {
            warn!(delegator, amount, error = %e, "failed to release delegation");
        }
        info!(delegator, validator, amount, "stake undelegated");
        Ok(amount)
    }

    /// Set a validator's stake to `new_stake`, moving the difference between
    /// its spendable balance and its stake.
    pub fn update_validator_stake(&self, address: &str, new_stake: u64) -> Result<(), ConsensusError> {
        let mut reg = self.inner.write();
        let v = reg
            .validators
            .get_mut(address)
            .ok_or_else(|| ConsensusError::ValidatorNotFound(address.to_string()))?;
        if new_stake > v.stake {
            let diff = new_stake - v.stake;
            let need = i64::try_from(diff).map_err(|_| ConsensusError::InvalidAmount(i64::MAX))?;
            self.state
                .stake(address, diff)
                .map_err(|e| stake_error(address, need, e))?;
            v.self_bond = v.self_bond.saturating_add(diff);
        } else if new_stake < v.stake {
            let diff = v.stake - new_stake;
            if diff > v.self_bond {
                return Err(ConsensusError::InvalidAmount(
                    i64::try_from(new_stake).unwrap_or(i64::MAX),
                ));
            }
            self.state
                .unstake(address, diff)
                .map_err(|e| stake_error(address, 0, e))?;
            v.self_bond -= diff;
        }
        v.stake = new_stake;
        info!(address, stake = new_stake, "validator stake updated");
        Ok(())
    }

    /// Add a validator learned from a peer, if unknown. Its stake is not
    /// backed by this node's ledger.
    pub fn add_external_validator(&self, address: &str, stake: u64) -> bool {
        let mut reg = self.inner.write();
        if reg.validators.contains_key(address) {
            return false;
        }
        reg.validators
            .insert(address.to_string(), Validator::new(address, stake));
        reg.performance_history.insert(address.to_string(), VecDeque::new());
        debug!(address, stake, "external validator added");
        true
    }

    fn register_on_chain(&self, address: &str, amount: u64) -> Result<(), TransactionError> {
        if amount < self.params.min_stake {
            return Err(TransactionError::StakeTooLow {
                amount: i64::try_from(amount).unwrap_or(i64::MAX),
                minimum: self.params.min_stake,
            });
        }
        let mut reg = self.inner.write();
        if let Some(v) = reg.validators.get_mut(address) {
            v.stake = v.stake.saturating_add(amount);
            v.self_bond = v.self_bond.saturating_add(amount);
            info!(address, amount, stake = v.stake, "validator stake increased on chain");
            return Ok(());
        }
        if reg.validators.len() >= self.params.max_validators {
            return Err(TransactionError::Governance(format!(
                "validator set is full ({})",
                self.params.max_validators
            )));
        }
        let mut v = Validator::new(address, amount);
        v.self_bond = amount;
        reg.validators.insert(address.to_string(), v);
        reg.performance_history.insert(address.to_string(), VecDeque::new());
        info!(address, amount, "validator registered on chain");
        Ok(())
    }

    /// Drop a validator and release every stake backing it.
    fn remove_validator(&self, reg: &mut Registry, address: &str) -> Option<Validator> {
        let v = reg.validators.remove(address)?;
        reg.performance_history.remove(address);
        if v.self_bond > 0 {
            if let Err(e) = self.state.unstake(address, v.self_bond) {
                warn!(address, amount = v.self_bond, error = %e, "failed to release validator stake");
            }
        }
        for (delegator, amount) in &v.delegations {
            if let Err(e) = self.state.unstake(delegator, *amount) {
                warn!(delegator = %delegator, amount, error = %e, "failed to release delegation");
            }
        }
        self.state.set_validator_flag(address, false);
        info!(address, stake = v.stake, "validator removed");
        Some(v)
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// Pick the next block producer by weighted random draw.
    ///
    /// A single registered validator is always chosen.
    pub fn choose_validator(&self) -> Result<Validator, ConsensusError> {
        let reg = self.inner.read();
        let active: Vec<&Validator> = reg.validators.values().filter(|v| v.active).collect();
        match active.as_slice() {
            [] => return Err(ConsensusError::NoValidators),
            [only] => return Ok((*only).clone()),
            _ => {}
        }

        let total_stake: u128 = active.iter().map(|v| u128::from(v.stake)).sum();
        let weights: Vec<f64> = active
            .iter()
            .map(|v| v.selection_weight(total_stake))
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return Ok(active[0].clone());
        }

        let draw = self.rng.lock().gen_range(0.0..1.0) * total;
        let mut cumulative = 0.0;
        for (v, w) in active.iter().zip(&weights) {
            cumulative += w;
            if draw <= cumulative {
                debug!(validator = %v.address, weight = w, draw, "validator selected");
                return Ok((*v).clone());
            }
        }
        active
            .last()
            .map(|v| (*v).clone())
            .ok_or(ConsensusError::SelectionFailed)
    }

    // ------------------------------------------------------------------
    // Metrics, rewards, slashing, rotation
    // ------------------------------------------------------------------

    /// Fold one success or failure into uptime and performance.
    pub fn update_validator_metrics(&self, address: &str, success: bool) -> Result<(), ConsensusError> {
        let now = self.now();
        let mut reg = self.inner.write();
        let v = reg
            .validators
            .get_mut(address)
            .ok_or_else(|| ConsensusError::ValidatorNotFound(address.to_string()))?;
        let hit = if success { 0.1 } else { 0.0 };
        v.uptime = v.uptime * 0.9 + hit;
        v.performance_score = v.performance_score * 0.9 + hit;
        v.last_active = Some(now);
        if success {
            v.blocks_produced += 1;
        }
        let score = v.performance_score;
        let history = reg.performance_history.entry(address.to_string()).or_default();
        history.push_back(score);
        while history.len() > MAX_PERFORMANCE_HISTORY {
            history.pop_front();
        }
        Ok(())
    }

    /// Record a reward and nudge reputation toward 1.0.
    pub fn reward_validator(&self, address: &str, amount: u64) -> Result<(), ConsensusError> {
        let mut reg = self.inner.write();
        let v = reg
            .validators
            .get_mut(address)
            .ok_or_else(|| ConsensusError::ValidatorNotFound(address.to_string()))?;
        v.reward_history.push(amount);
        v.reputation_score = (v.reputation_score * 1.1).min(1.0);
        Ok(())
    }

    /// Record a slash and halve reputation. Stake is left untouched until the
    /// slash count reaches the threshold, at which point the validator is
    /// removed and its stake released. Returns whether it was removed.
    pub fn slash_validator(&self, address: &str, reason: &str) -> Result<bool, ConsensusError> {
        let now = self.now();
        let mut reg = self.inner.write();
        let v = reg
            .validators
            .get_mut(address)
            .ok_or_else(|| ConsensusError::ValidatorNotFound(address.to_string()))?;
        v.slashing_history.push(now);
        v.slash_count = v.slash_count.saturating_add(1);
        v.reputation_score *= 0.5;
        info!(address, reason, slashes = v.slash_count, reputation = v.reputation_score, "validator slashed");

        if v.slashing_history.len() >= self.params.slashing_threshold {
            self.remove_validator(&mut reg, address);
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove the bottom fifth of validators by rotation score. Returns the
    /// removed addresses.
    pub fn rotate_validators(&self) -> Vec<String> {
        let mut reg = self.inner.write();
        let mut scored: Vec<(String, f64)> = reg
            .validators
            .values()
            .map(|v| (v.address.clone(), v.rotation_score()))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let count = (scored.len() as f64 * ROTATION_FRACTION) as usize;
        let removed: Vec<String> = scored.into_iter().take(count).map(|(a, _)| a).collect();
        for address in &removed {
            self.remove_validator(&mut reg, address);
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), remaining = reg.validators.len(), "validators rotated");
        }
        removed
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_validator_info(&self, address: &str) -> Result<Validator, ConsensusError> {
        self.inner
            .read()
            .validators
            .get(address)
            .cloned()
            .ok_or_else(|| ConsensusError::ValidatorNotFound(address.to_string()))
    }

    /// Every validator, ordered by address.
    pub fn all_validators(&self) -> Vec<Validator> {
        self.inner.read().validators.values().cloned().collect()
    }

    pub fn validator_count(&self) -> usize {
        self.inner.read().validators.len()
    }

    pub fn total_stake(&self) -> u128 {
        self.inner
            .read()
            .validators
            .values()
            .map(|v| u128::from(v.stake))
            .sum()
    }

    pub fn performance_history(&self, address: &str) -> Vec<f64> {
        self.inner
            .read()
            .performance_history
            .get(address)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Finality
    // ------------------------------------------------------------------

    /// Structural checks plus the parent-finalized rule, without tracking.
    pub fn check_block(&self, block: &Block) -> Result<(), ConsensusError> {
        if block.hash.is_zero() {
            return Err(BlockError::EmptyHash.into());
        }
        if block.timestamp > self.now() {
            return Err(BlockError::TimestampInFuture(block.timestamp).into());
        }
        if !self.is_block_finalized(&block.prev_hash) {
            return Err(BlockError::ParentNotFinalized(block.prev_hash.short()).into());
        }
        Ok(())
    }

    /// Check that `block` was forged by an active validator and pays
    /// exactly one block reward.
    ///
    /// The reward is the single network transaction, placed last, paying
    /// `block_reward` to the forger with no fee.
    pub fn check_producer(&self, block: &Block) -> Result<(), ConsensusError> {
        {
            let reg = self.inner.read();
            let v = reg
                .validators
                .get(&block.validator)
                .ok_or_else(|| ConsensusError::ValidatorNotFound(block.validator.clone()))?;
            if !v.active || v.stake < MIN_FORGING_STAKE {
                return Err(ConsensusError::InvalidValidator(block.validator.clone()));
            }
        }

        let issued = block.transactions.iter().filter(|tx| tx.is_network()).count();
        if issued != 1 {
            return Err(invalid_reward(format!("{issued} network transactions")));
        }
        let Some(reward) = block.transactions.last().filter(|tx| tx.is_network()) else {
            return Err(invalid_reward("reward is not the last transaction".into()));
        };
        if !matches!(reward.payload, TxPayload::Regular) {
            return Err(invalid_reward("reward must be a plain network transfer".into()));
        }
        if reward.recipient != block.validator {
            return Err(invalid_reward(format!("paid to {}", reward.recipient)));
        }
        if reward.amount != self.params.block_reward || reward.fee != 0 {
            return Err(invalid_reward(format!(
                "amount {} fee {}, expected {} fee 0",
                reward.amount, reward.fee, self.params.block_reward
            )));
        }
        Ok(())
    }

    /// [`check_block`](Self::check_block), then count a confirmation.
    pub fn validate_block(&self, block: &Block) -> Result<(), ConsensusError> {
        self.check_block(block)?;
        self.track_block_confirmation(block.hash);
        Ok(())
    }

    pub fn track_block_confirmation(&self, hash: Hash256) -> bool {
        let now = self.now();
        self.inner.write().finality.track(hash, now)
    }

    /// Mark a block final directly. Used for genesis.
    pub fn mark_finalized(&self, hash: Hash256) {
        self.inner.write().finality.mark_finalized(hash);
    }

    pub fn is_block_finalized(&self, hash: &Hash256) -> bool {
        self.inner.read().finality.is_finalized(hash)
    }

    pub fn block_confirmations(&self, hash: &Hash256) -> u32 {
        self.inner.read().finality.confirmations(hash)
    }

    /// `(confirmations, finalized)`.
    pub fn finality_status(&self, hash: &Hash256) -> (u32, bool) {
        self.inner.read().finality.status(hash)
    }

    pub fn finality_threshold(&self) -> u32 {
        self.inner.read().finality.threshold()
    }

    /// Garbage-collect old confirmation counters. Returns how many were
    /// dropped.
    pub fn cleanup_old_confirmations(&self) -> usize {
        let now = self.now();
        self.inner.write().finality.cleanup(now)
    }
}

impl StakeHook for ConsensusManager {
    fn check_stakes(&self, stakes: &[(&str, u64)]) -> Result<(), (usize, TransactionError)> {
        let reg = self.inner.read();
        let mut joining: HashSet<&str> = HashSet::new();
        for (position, &(address, amount)) in stakes.iter().enumerate() {
            if amount < self.params.min_stake {
                return Err((
                    position,
                    TransactionError::StakeTooLow {
                        amount: i64::try_from(amount).unwrap_or(i64::MAX),
                        minimum: self.params.min_stake,
                    },
                ));
            }
            if reg.validators.contains_key(address) || joining.contains(address) {
                continue;
            }
            if reg.validators.len() + joining.len() >= self.params.max_validators {
                return Err((
                    position,
                    TransactionError::Governance(format!(
                        "validator set is full ({})",
                        self.params.max_validators
                    )),
                ));
            }
            joining.insert(address);
        }
        Ok(())
    }

    fn on_chain_stake(&self, address: &str, amount: u64) -> Result<(), TransactionError> {
        self.register_on_chain(address, amount)
    }
}

fn invalid_reward(reason: String) -> ConsensusError {
    BlockError::InvalidReward(reason).into()
}

fn stake_error(address: &str, need: i64, e: TransactionError) -> ConsensusError {
    match e {
        TransactionError::InsufficientFunds { have, need, .. } => ConsensusError::InsufficientBalance {
            address: address.to_string(),
            have,
            need,
        },
        _ => ConsensusError::InvalidAmount(need),
    }
}
