//! The account ledger and its state-transition function.
//!
//! [`StateManager`] owns every account, the governance registry, and the
//! oracle registry behind one `RwLock`. [`StateManager::apply_block`] stages
//! a block's effects in an overlay and commits only if every transaction
//! succeeds, so a failing block leaves no trace.
//!
//! Accounts live in two tiers. An optional [`AccountStore`] is consulted
//! first; the in-memory map is the fallback and is always kept current.
//!
//! Stake events are reported to a [`StakeHook`] (the consensus manager). The
//! hook is consulted before the ledger lock is taken and notified after it is
//! released, so consensus may call back into the ledger freely.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::GENESIS_VALIDATOR;
use crate::error::{BlockError, StateError, TransactionError};
use crate::governance::{Governance, Proposal, Vote};
use crate::params::ChainParams;
use crate::snapshot::{balances_checksum, Snapshot, SnapshotStore};
use crate::traits::{AccountStore, ContractExecutor, DisabledExecutor, StakeHook};
use crate::types::{Account, Block, Transaction, TxPayload};
use crate::validation::validate_transaction;

/// A value published to the oracle registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleEntry {
    pub value: String,
    pub source: String,
    pub timestamp: i64,
}

#[derive(Debug, Default)]
struct Ledger {
    accounts: HashMap<String, Account>,
    governance: Governance,
    oracle: HashMap<String, OracleEntry>,
    /// State checksum recorded at each applied height.
    block_checksums: BTreeMap<u64, String>,
    /// Index of the last applied block.
    height: u64,
    last_snapshot: Option<DateTime<Utc>>,
}

impl Ledger {
    fn balances(&self) -> BTreeMap<String, i64> {
        self.accounts
            .iter()
            .map(|(addr, acct)| (addr.clone(), acct.balance))
            .collect()
    }

    fn checksum(&self) -> String {
        balances_checksum(&self.height.to_string(), &self.balances())
    }

    fn record_checksum(&mut self) {
        let sum = self.checksum();
        self.block_checksums.insert(self.height, sum);
    }
}

/// Effects of one block, staged on top of the committed ledger.
struct Staging<'a> {
    mgr: &'a StateManager,
    base: &'a Ledger,
    overlay: HashMap<String, Account>,
    governance: Governance,
    stakes: Vec<(String, u64)>,
}

impl Staging<'_> {
    fn account(&mut self, address: &str) -> &mut Account {
        let (mgr, base) = (self.mgr, self.base);
        self.overlay
            .entry(address.to_string())
            .or_insert_with(|| mgr.lookup(base, address))
    }

    fn credit(&mut self, address: &str, amount: i64) -> Result<(), TransactionError> {
        let acct = self.account(address);
        acct.balance = acct
            .balance
            .checked_add(amount)
            .ok_or(TransactionError::Overflow)?;
        Ok(())
    }
}

/// The account ledger.
pub struct StateManager {
    inner: RwLock<Ledger>,
    params: ChainParams,
    store: Option<Arc<dyn AccountStore>>,
    executor: Arc<dyn ContractExecutor>,
    stake_hook: RwLock<Option<Weak<dyn StakeHook>>>,
    snapshots: Option<SnapshotStore>,
    apply_snapshot_interval: Duration,
    clock: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl fmt::Debug for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager")
            .field("height", &self.height())
            .field("snapshots", &self.snapshots.as_ref().map(SnapshotStore::dir))
            .finish_non_exhaustive()
    }
}

impl StateManager {
    /// An empty in-memory ledger with contracts disabled and no snapshots.
    pub fn new(params: ChainParams) -> Self {
        Self {
            inner: RwLock::new(Ledger::default()),
            params,
            store: None,
            executor: Arc::new(DisabledExecutor),
            stake_hook: RwLock::new(None),
            snapshots: None,
            apply_snapshot_interval: Duration::from_secs(
                crate::constants::DEFAULT_APPLY_SNAPSHOT_INTERVAL_SECS,
            ),
            clock: Box::new(Utc::now),
        }
    }

    /// Use `store` as the primary account tier.
    pub fn with_account_store(mut self, store: Arc<dyn AccountStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Route Deploy and Call transactions to `executor`.
    pub fn with_executor(mut self, executor: Arc<dyn ContractExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Persist snapshots to `store`, taking one automatically after a block
    /// whenever `apply_interval` has passed since the last.
    pub fn with_snapshots(mut self, store: SnapshotStore, apply_interval: Duration) -> Self {
        self.snapshots = Some(store);
        self.apply_snapshot_interval = apply_interval;
        self
    }

    /// Replace the wall clock used for snapshot timestamps.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Register the receiver of stake events.
    pub fn set_stake_hook(&self, hook: Weak<dyn StakeHook>) {
        *self.stake_hook.write() = Some(hook);
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    fn hook(&self) -> Option<Arc<dyn StakeHook>> {
        self.stake_hook.read().as_ref().and_then(Weak::upgrade)
    }

    // ------------------------------------------------------------------
    // Account tiers
    // ------------------------------------------------------------------

    fn lookup(&self, ledger: &Ledger, address: &str) -> Account {
        if let Some(store) = &self.store {
            match store.get_account(address) {
                Ok(Some(acct)) => return acct,
                Ok(None) => {}
                Err(e) => warn!(address, error = %e, "account store read failed, using memory"),
            }
        }
        ledger
            .accounts
            .get(address)
            .cloned()
            .unwrap_or_else(|| Account::new(address))
    }

    fn persist(&self, ledger: &mut Ledger, account: Account) {
        if let Some(store) = &self.store {
            if let Err(e) = store.set_account(&account) {
                warn!(address = %account.address, error = %e, "account store write failed");
            }
        }
        ledger.accounts.insert(account.address.clone(), account);
    }

    /// Read-modify-write one account outside block application.
    fn modify(&self, address: &str, f: impl FnOnce(&mut Account)) {
        let mut ledger = self.inner.write();
        let mut acct = self.lookup(&ledger, address);
        f(&mut acct);
        self.persist(&mut ledger, acct);
        ledger.record_checksum();
    }

    /// [`modify`](Self::modify) with a change that may be refused.
    fn update<T>(
        &self,
        address: &str,
        f: impl FnOnce(&mut Account) -> Result<T, TransactionError>,
    ) -> Result<T, TransactionError> {
        let mut ledger = self.inner.write();
        let mut acct = self.lookup(&ledger, address);
        let out = f(&mut acct)?;
        self.persist(&mut ledger, acct);
        ledger.record_checksum();
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Point reads and administrative writes
    // ------------------------------------------------------------------

    /// The account at `address`, or a fresh zero account.
    pub fn get_account(&self, address: &str) -> Account {
        let ledger = self.inner.read();
        self.lookup(&ledger, address)
    }

    pub fn set_account(&self, account: Account) {
        let mut ledger = self.inner.write();
        self.persist(&mut ledger, account);
        ledger.record_checksum();
    }

    pub fn get_balance(&self, address: &str) -> i64 {
        self.get_account(address).balance
    }

    pub fn set_balance(&self, address: &str, balance: i64) {
        self.modify(address, |acct| acct.balance = balance);
    }

    pub fn get_nonce(&self, address: &str) -> u64 {
        self.get_account(address).nonce
    }

    pub fn set_nonce(&self, address: &str, nonce: u64) {
        self.modify(address, |acct| acct.nonce = nonce);
    }

    /// Credit `amount` out of thin air. Used for genesis allocations and
    /// test setup.
    pub fn fund(&self, address: &str, amount: i64) -> Result<(), TransactionError> {
        if amount <= 0 {
            return Err(TransactionError::NonPositiveAmount(amount));
        }
        self.update(address, |acct| {
            acct.balance = acct
                .balance
                .checked_add(amount)
                .ok_or(TransactionError::Overflow)?;
            Ok(())
        })?;
        info!(address, amount, "funded account");
        Ok(())
    }

    /// Move `amount` from spendable balance into stake.
    pub fn stake(&self, address: &str, amount: u64) -> Result<(), TransactionError> {
        let need = i64::try_from(amount).map_err(|_| TransactionError::Overflow)?;
        self.update(address, |acct| {
            if acct.balance < need {
                return Err(TransactionError::InsufficientFunds {
                    address: address.to_string(),
                    have: acct.balance,
                    need,
                });
            }
            acct.balance -= need;
            acct.staked_amount = acct
                .staked_amount
                .checked_add(amount)
                .ok_or(TransactionError::Overflow)?;
            Ok(())
        })
    }

    /// Move `amount` from stake back to spendable balance.
    pub fn unstake(&self, address: &str, amount: u64) -> Result<(), TransactionError> {
        let credit = i64::try_from(amount).map_err(|_| TransactionError::Overflow)?;
        self.update(address, |acct| {
            if acct.staked_amount < amount {
                return Err(TransactionError::InsufficientFunds {
                    address: address.to_string(),
                    have: i64::try_from(acct.staked_amount).unwrap_or(i64::MAX),
                    need: credit,
                });
            }
            acct.staked_amount -= amount;
            acct.balance = acct
                .balance
                .checked_add(credit)
                .ok_or(TransactionError::Overflow)?;
            Ok(())
        })
    }

    pub fn set_validator_flag(&self, address: &str, is_validator: bool) {
        self.modify(address, |acct| acct.is_validator = is_validator);
    }

    /// Every in-memory balance, keyed by address.
    pub fn all_balances(&self) -> BTreeMap<String, i64> {
        self.inner.read().balances()
    }

    /// Index of the last applied block.
    pub fn height(&self) -> u64 {
        self.inner.read().height
    }

    // ------------------------------------------------------------------
    // Block application
    // ------------------------------------------------------------------

    /// Apply every transaction in `block`, atomically.
    ///
    /// # Errors
    ///
    /// [`BlockError::Transaction`] names the first failing transaction. The
    /// ledger is unchanged when an error is returned.
    pub fn apply_block(&self, block: &Block) -> Result<(), BlockError> {
        let hook = self.hook();
        if let Some(hook) = &hook {
            let (indices, pending): (Vec<usize>, Vec<(&str, u64)>) = block
                .transactions
                .iter()
                .enumerate()
                .filter(|(_, tx)| matches!(tx.payload, TxPayload::Stake) && !tx.is_network() && tx.amount > 0)
                .map(|(index, tx)| (index, (tx.sender.as_str(), tx.amount.unsigned_abs())))
                .unzip();
            if !pending.is_empty() {
                hook.check_stakes(&pending).map_err(|(position, source)| BlockError::Transaction {
                    index: indices.get(position).copied().unwrap_or(position),
                    source,
                })?;
            }
        }

        let stakes = {
            let mut ledger = self.inner.write();
            let mut staging = Staging {
                mgr: self,
                base: &*ledger,
                overlay: HashMap::new(),
                governance: ledger.governance.clone(),
                stakes: Vec::new(),
            };
            for (index, tx) in block.transactions.iter().enumerate() {
                self.apply_transaction(&mut staging, block, tx)
                    .map_err(|source| {
                        debug!(block = block.index, index, error = %source, "transaction rejected");
                        BlockError::Transaction { index, source }
                    })?;
            }
            staging.governance.tally_all(block.index);

            let Staging {
                overlay,
                governance,
                stakes,
                ..
            } = staging;
            for acct in overlay.into_values() {
                self.persist(&mut ledger, acct);
            }
            ledger.governance = governance;
            ledger.height = block.index;
            ledger.record_checksum();
            stakes
        };

        if let Some(hook) = &hook {
            for (address, amount) in &stakes {
                if let Err(e) = hook.on_chain_stake(address, *amount) {
                    warn!(address = %address, amount, error = %e, "stake hook rejected committed stake, releasing it");
                    self.release_refused_stake(address, *amount);
                }
            }
        }

        info!(
            height = block.index,
            txs = block.transactions.len(),
            validator = %block.validator,
            "applied block"
        );
        self.maybe_snapshot(block.index);
        Ok(())
    }

    /// Return stake the validator registry refused to spendable balance.
    fn release_refused_stake(&self, address: &str, amount: u64) {
        let released = self.update(address, |acct| {
            let credit = i64::try_from(amount).map_err(|_| TransactionError::Overflow)?;
            acct.staked_amount = acct.staked_amount.saturating_sub(amount);
            acct.balance = acct
                .balance
                .checked_add(credit)
                .ok_or(TransactionError::Overflow)?;
            if acct.staked_amount == 0 {
                acct.is_validator = false;
            }
            Ok(())
        });
        if let Err(e) = released {
            warn!(address, amount, error = %e, "failed to release refused stake");
        }
    }

    /// Advance sender nonces past every transaction in `block` without
    /// applying it.
    ///
    /// Used for blocks a recovered snapshot already covers: snapshots hold
    /// balances only, so the nonces those blocks consumed must be replayed
    /// before their transactions could be accepted again.
    pub fn advance_nonces(&self, block: &Block) {
        let mut ledger = self.inner.write();
        let mut advanced = 0;
        for tx in block.transactions.iter().filter(|tx| !tx.is_network()) {
            let mut acct = self.lookup(&ledger, &tx.sender);
            let next = tx.nonce.saturating_add(1);
            if acct.nonce < next {
                acct.nonce = next;
                self.persist(&mut ledger, acct);
                advanced += 1;
            }
        }
        if advanced > 0 {
            ledger.record_checksum();
            debug!(block = block.index, advanced, "replayed nonces of covered block");
        }
    }

    fn apply_transaction(
        &self,
        staging: &mut Staging<'_>,
        block: &Block,
        tx: &Transaction,
    ) -> Result<(), TransactionError> {
        validate_transaction(tx)?;
        let debit = tx.total_debit().ok_or(TransactionError::Overflow)?;

        if tx.is_network() {
            return match tx.payload {
                TxPayload::Regular => staging.credit(&tx.recipient, tx.amount),
                TxPayload::Stake => Err(TransactionError::NetworkCannotStake),
                _ => Err(TransactionError::InvalidPayload(
                    "network sender may only transfer".into(),
                )),
            };
        }

        let sender = staging.account(&tx.sender);
        if sender.nonce != tx.nonce {
            return Err(TransactionError::InvalidNonce {
                address: tx.sender.clone(),
                expected: sender.nonce,
                got: tx.nonce,
            });
        }

        let charge = match tx.payload {
            TxPayload::Regular | TxPayload::Stake => debit,
            _ => tx.fee,
        };
        if sender.balance < charge {
            return Err(TransactionError::InsufficientFunds {
                address: tx.sender.clone(),
                have: sender.balance,
                need: charge,
            });
        }

        match &tx.payload {
            TxPayload::Regular => {
                sender.balance -= charge;
                sender.nonce += 1;
                staging.credit(&tx.recipient, tx.amount)?;
            }
            TxPayload::Stake => {
                let amount = tx.amount.unsigned_abs();
                if amount < self.params.min_stake {
                    return Err(TransactionError::StakeTooLow {
                        amount: tx.amount,
                        minimum: self.params.min_stake,
                    });
                }
                sender.balance -= charge;
                sender.nonce += 1;
                sender.staked_amount = sender
                    .staked_amount
                    .checked_add(amount)
                    .ok_or(TransactionError::Overflow)?;
                sender.is_validator = true;
                staging.stakes.push((tx.sender.clone(), amount));
            }
            TxPayload::Deploy(payload) => {
                sender.balance -= charge;
                sender.nonce += 1;
                let outcome = self
                    .executor
                    .deploy(&tx.sender, payload)
                    .map_err(|e| TransactionError::Contract(e.to_string()))?;
                debug!(sender = %tx.sender, contract = ?outcome.contract_address, gas = outcome.gas_used, "contract deployed");
            }
            TxPayload::Call(payload) => {
                sender.balance -= charge;
                sender.nonce += 1;
                let outcome = self
                    .executor
                    .call(&tx.sender, &tx.recipient, payload, tx.amount, tx.fee.unsigned_abs())
                    .map_err(|e| TransactionError::Contract(e.to_string()))?;
                debug!(sender = %tx.sender, contract = %tx.recipient, function = %payload.function, gas = outcome.gas_used, "contract called");
            }
            TxPayload::Proposal(payload) => {
                sender.balance -= charge;
                sender.nonce += 1;
                let end = block.index.saturating_add(payload.duration);
                let proposal =
                    staging
                        .governance
                        .submit(&tx.sender, &payload.description, &payload.actions, block.index, end);
                debug!(id = %proposal.id, proposer = %tx.sender, end, "proposal submitted");
            }
            TxPayload::Vote(payload) => {
                sender.balance -= charge;
                sender.nonce += 1;
                staging.governance.cast_vote(
                    &payload.proposal_id,
                    &tx.sender,
                    payload.choice,
                    payload.weight,
                )?;
            }
        }

        if tx.fee > 0 && !block.validator.is_empty() && block.validator != GENESIS_VALIDATOR {
            staging.credit(&block.validator, tx.fee)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Governance and oracle
    // ------------------------------------------------------------------

    pub fn proposal(&self, id: &str) -> Option<Proposal> {
        self.inner.read().governance.proposal(id).cloned()
    }

    pub fn votes(&self, id: &str) -> Vec<Vote> {
        self.inner.read().governance.votes(id).to_vec()
    }

    pub fn set_oracle_data(&self, key: &str, value: &str, source: &str, timestamp: i64) {
        self.inner.write().oracle.insert(
            key.to_string(),
            OracleEntry {
                value: value.to_string(),
                source: source.to_string(),
                timestamp,
            },
        );
    }

    pub fn get_oracle_data(&self, key: &str) -> Option<OracleEntry> {
        self.inner.read().oracle.get(key).cloned()
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    /// Checksum over the current height and every in-memory balance.
    pub fn state_checksum(&self) -> String {
        self.inner.read().checksum()
    }

    /// Compare the state as seen through the account tiers against the
    /// checksum recorded at the current height.
    ///
    /// # Errors
    ///
    /// [`StateError::StateCorrupt`] if they differ.
    pub fn verify_state_integrity(&self) -> Result<(), StateError> {
        let ledger = self.inner.read();
        let Some(recorded) = ledger.block_checksums.get(&ledger.height) else {
            return Ok(());
        };
        let observed: BTreeMap<String, i64> = ledger
            .accounts
            .keys()
            .map(|addr| (addr.clone(), self.lookup(&ledger, addr).balance))
            .collect();
        let current = balances_checksum(&ledger.height.to_string(), &observed);
        if &current != recorded {
            warn!(height = ledger.height, "state checksum mismatch");
            return Err(StateError::StateCorrupt);
        }
        Ok(())
    }

    /// Write the balance map to `path` as JSON.
    pub fn export_state(&self, path: &Path) -> Result<(), StateError> {
        let balances = self.all_balances();
        std::fs::write(path, serde_json::to_vec_pretty(&balances)?)?;
        info!(path = %path.display(), accounts = balances.len(), "exported state");
        Ok(())
    }

    /// Load a JSON balance map from `path`, overwriting matching balances.
    pub fn import_state(&self, path: &Path) -> Result<usize, StateError> {
        let balances: BTreeMap<String, i64> = serde_json::from_slice(&std::fs::read(path)?)?;
        let mut ledger = self.inner.write();
        for (addr, bal) in &balances {
            let mut acct = self.lookup(&ledger, addr);
            acct.balance = *bal;
            self.persist(&mut ledger, acct);
        }
        ledger.record_checksum();
        info!(path = %path.display(), accounts = balances.len(), "imported state");
        Ok(balances.len())
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    fn snapshot_store(&self) -> Result<&SnapshotStore, StateError> {
        self.snapshots.as_ref().ok_or(StateError::SnapshotsDisabled)
    }

    /// Write a snapshot of the current balances labelled with `height`.
    pub fn create_snapshot(&self, height: u64) -> Result<PathBuf, StateError> {
        let store = self.snapshot_store()?;
        let now = (self.clock)();
        let balances = self.inner.read().balances();
        let path = store.write(&Snapshot::new(balances, height, now))?;
        self.inner.write().last_snapshot = Some(now);
        Ok(path)
    }

    fn maybe_snapshot(&self, height: u64) {
        if self.snapshots.is_none() {
            return;
        }
        let now = (self.clock)();
        let due = match self.inner.read().last_snapshot {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.apply_snapshot_interval),
        };
        if due {
            if let Err(e) = self.create_snapshot(height) {
                warn!(height, error = %e, "automatic snapshot failed");
            }
        }
    }

    /// Restore balances from the newest snapshot.
    ///
    /// # Errors
    ///
    /// [`StateError::SnapshotCorrupt`] if the newest snapshot fails its
    /// checksum; the ledger is untouched in that case.
    pub fn load_latest_snapshot(&self) -> Result<Snapshot, StateError> {
        let snapshot = self.snapshot_store()?.load_latest()?;
        self.restore(&snapshot);
        Ok(snapshot)
    }

    /// Restore from the newest valid snapshot, falling back through older
    /// ones.
    ///
    /// # Errors
    ///
    /// [`StateError::StateCorrupt`] when no valid snapshot exists.
    pub fn recover_state(&self) -> Result<Snapshot, StateError> {
        let snapshot = self.snapshot_store()?.recover()?;
        self.restore(&snapshot);
        Ok(snapshot)
    }

    /// Whether any snapshot file exists.
    pub fn has_snapshots(&self) -> bool {
        self.snapshots
            .as_ref()
            .and_then(|s| s.list().ok())
            .is_some_and(|files| !files.is_empty())
    }

    fn restore(&self, snapshot: &Snapshot) {
        let mut ledger = self.inner.write();
        ledger
            .accounts
            .retain(|addr, _| snapshot.balances.contains_key(addr));
        for (addr, bal) in &snapshot.balances {
            let mut acct = ledger
                .accounts
                .get(addr)
                .cloned()
                .unwrap_or_else(|| Account::new(addr.as_str()));
            acct.balance = *bal;
            self.persist(&mut ledger, acct);
        }
        ledger.height = snapshot.block_height;
        ledger.last_snapshot = Some(snapshot.timestamp);
        ledger.record_checksum();
        info!(height = snapshot.block_height, accounts = snapshot.balances.len(), "restored state from snapshot");
    }
}
