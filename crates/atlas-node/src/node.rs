//! Full node composition and background loop.
//!
//! The [`Node`] struct wires the ledger, transaction pool, consensus manager
//! and chain sync into a running full node. [`NodeChain`] owns the block
//! store and the import path: local block production and peer sync both go
//! through [`NodeChain::import`], and the sync manager holds it as its
//! [`ChainAccess`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use atlas_consensus::{ConsensusManager, KycInfo, Validator, forge_block};
use atlas_core::chain_state::{ChainStore, MemoryChainStore};
use atlas_core::crypto::{Ed25519Verifier, KeyPair};
use atlas_core::error::{AtlasError, BlockError, ConsensusError, SyncError, TransactionError};
use atlas_core::genesis::genesis_hash;
use atlas_core::mempool::Mempool;
use atlas_core::snapshot::SnapshotStore;
use atlas_core::state::StateManager;
use atlas_core::traits::{ChainAccess, SignatureVerifier, StakeHook};
use atlas_core::types::{Block, Hash256, Transaction};
use atlas_core::validation::{validate_block_size, validate_successor};
use atlas_network::{ChainSyncManager, SyncStatus, Transport};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::tasks::TaskSet;

/// Period of the pool sweep and confirmation cleanup tasks.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

// ----------------------------------------------------------------------------
// NodeChain
// ----------------------------------------------------------------------------

/// The block store plus the import path shared by production and sync.
pub struct NodeChain {
    store: RwLock<MemoryChainStore>,
    state: Arc<StateManager>,
    consensus: Arc<ConsensusManager>,
    pool: Arc<Mutex<Mempool>>,
    verifier: Ed25519Verifier,
    max_block_size: usize,
    /// Held for a whole import so the tip cannot move between the checks
    /// and the append.
    import_lock: Mutex<()>,
}

impl NodeChain {
    pub fn new(
        state: Arc<StateManager>,
        consensus: Arc<ConsensusManager>,
        pool: Arc<Mutex<Mempool>>,
        max_block_size: usize,
    ) -> Self {
        Self {
            store: RwLock::new(MemoryChainStore::new()),
            state,
            consensus,
            pool,
            verifier: Ed25519Verifier,
            max_block_size,
            import_lock: Mutex::new(()),
        }
    }

    /// Validate `block` against the tip and commit it.
    ///
    /// Linkage, size, signatures, the consensus rules and the producer's
    /// standing are all checked before the ledger is touched, and a ledger
    /// failure leaves the chain unchanged. A block the ledger already
    /// reflects (it was covered by a recovered snapshot) is appended
    /// without being applied again; only its senders' nonces are replayed,
    /// since snapshots do not carry them.
    pub fn import(&self, block: Block) -> Result<(), AtlasError> {
        let _import = self.import_lock.lock();

        validate_successor(&block, self.store.read().tip())?;
        // Pool transactions plus the reward.
        validate_block_size(&block, self.max_block_size.saturating_add(1))?;
        self.verifier.verify_block(&block)?;
        self.consensus.check_block(&block)?;
        self.consensus.check_producer(&block)?;

        if block.index > self.state.height() {
            self.state.apply_block(&block)?;
        } else {
            debug!(index = block.index, "ledger already reflects block, appending only");
            self.state.advance_nonces(&block);
        }
        self.store.write().append(block.clone())?;
        self.consensus.track_block_confirmation(block.hash);
        let confirmed = self.pool.lock().remove_confirmed(&block);

        info!(
            index = block.index,
            hash = %block.hash.short(),
            validator = %block.validator,
            txs = block.transactions.len(),
            confirmed,
            "imported block"
        );
        Ok(())
    }

    /// Blocks in `from..=to` that are stored.
    pub fn range(&self, from: u64, to: u64) -> Vec<Block> {
        self.store.read().range(from, to)
    }
}

impl ChainAccess for NodeChain {
    fn height(&self) -> u64 {
        self.store.read().height()
    }

    fn latest_block(&self) -> Block {
        self.store.read().tip().clone()
    }

    fn block_by_index(&self, index: u64) -> Option<Block> {
        self.store.read().get_by_index(index).cloned()
    }

    fn block_by_hash(&self, hash: &Hash256) -> Option<Block> {
        self.store.read().get_by_hash(hash).cloned()
    }

    fn genesis_hash(&self) -> Hash256 {
        self.store
            .read()
            .get_by_index(0)
            .map_or_else(genesis_hash, |b| b.hash)
    }

    fn import_block(&self, block: Block) -> Result<(), AtlasError> {
        self.import(block)
    }
}

// ----------------------------------------------------------------------------
// Node
// ----------------------------------------------------------------------------

/// A running Atlas node.
pub struct Node {
    config: NodeConfig,
    chain: Arc<NodeChain>,
    signer: Option<KeyPair>,
    sync: RwLock<Option<Arc<ChainSyncManager>>>,
    /// Held by a production tick; a second tick finding it locked skips.
    producing: Mutex<()>,
    tasks: Mutex<Option<TaskSet>>,
    clock: Clock,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").finish_non_exhaustive()
    }
}

impl Node {
    /// Build a node with the system clock.
    ///
    /// # Errors
    ///
    /// Invalid configuration, an unreadable snapshot directory, or
    /// [`StateError::StateCorrupt`](atlas_core::error::StateError::StateCorrupt)
    /// when snapshots exist but none passes its checksum.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>, AtlasError> {
        Self::with_clock(config, || chrono::Utc::now().timestamp())
    }

    /// Build a node with a custom clock (Unix seconds).
    pub fn with_clock(
        config: NodeConfig,
        clock: impl Fn() -> i64 + Send + Sync + 'static,
    ) -> Result<Arc<Self>, AtlasError> {
        config.validate()?;
        let clock: Clock = Arc::new(clock);
        let params = config.params.clone();
        let signer = config.signer()?;

        let mut state = StateManager::new(params.clone());
        if config.snapshot.enabled {
            let store = SnapshotStore::open(config.snapshot_dir(), config.snapshot.retention)?;
            state = state.with_snapshots(store, config.snapshot.apply_interval());
        }
        let state = Arc::new(state);

        let consensus_clock = clock.clone();
        let consensus = Arc::new(ConsensusManager::with_clock(
            params.clone(),
            state.clone(),
            move || consensus_clock(),
        ));
        let hook: Arc<dyn StakeHook> = consensus.clone();
        state.set_stake_hook(Arc::downgrade(&hook));

        let pool = Arc::new(Mutex::new(Mempool::new(
            params.max_tx_pool_size,
            params.tx_expiration_secs,
        )));
        let chain = Arc::new(NodeChain::new(
            state.clone(),
            consensus.clone(),
            pool,
            params.max_block_size,
        ));
        consensus.mark_finalized(chain.genesis_hash());

        let recovered = state.has_snapshots();
        if recovered {
            let snapshot = state.recover_state()?;
            info!(height = snapshot.block_height, "resuming ledger from snapshot");
        } else {
            for (address, amount) in config.genesis_allocations.iter().filter(|(_, a)| **a > 0) {
                state.fund(address, *amount)?;
            }
        }

        if let Some(key) = &signer {
            if config.validator_stake > 0 {
                if recovered {
                    // Snapshots hold spendable balances only, so the stake
                    // locked before the snapshot is returned and locked once.
                    let stake = i64::try_from(config.validator_stake)
                        .map_err(|_| AtlasError::Config("validator_stake out of range".into()))?;
                    state.fund(&key.address(), stake)?;
                }
                consensus.register_validator(
                    &key.address(),
                    config.validator_stake,
                    config.validator_kyc.clone(),
                )?;
            }
            info!(address = %key.address(), "forging enabled");
        }
        for (address, stake) in &config.genesis_validators {
            consensus.add_external_validator(address, *stake);
        }

        Ok(Arc::new(Self {
            config,
            chain,
            signer,
            sync: RwLock::new(None),
            producing: Mutex::new(()),
            tasks: Mutex::new(None),
            clock,
        }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<NodeChain> {
        &self.chain
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.chain.state
    }

    pub fn consensus(&self) -> &Arc<ConsensusManager> {
        &self.chain.consensus
    }

    /// Address blocks are forged as, if this node has a key.
    pub fn local_address(&self) -> Option<String> {
        self.signer.as_ref().map(KeyPair::address)
    }

    fn pool(&self) -> &Mutex<Mempool> {
        &self.chain.pool
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    // ------------------------------------------------------------------
    // Transaction admission
    // ------------------------------------------------------------------

    /// Verify and admit a transaction. The expected nonce is the sender's
    /// ledger nonce.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash256, AtlasError> {
        if tx.is_network() {
            return Err(TransactionError::InvalidSignature.into());
        }
        self.chain.verifier.verify_transaction(&tx)?;
        let expected = self.state().get_nonce(&tx.sender);
        let hash = self.pool().lock().insert_at(tx, expected, self.now())?;
        Ok(hash)
    }

    pub fn get_transaction(&self, hash: &Hash256) -> Option<Transaction> {
        self.pool().lock().get(hash).map(|e| e.tx.clone())
    }

    /// Every pooled transaction.
    pub fn all_transactions(&self) -> Vec<Transaction> {
        self.pool().lock().all()
    }

    pub fn pool_size(&self) -> usize {
        self.pool().lock().len()
    }

    pub fn fee_multiplier(&self) -> f64 {
        self.pool().lock().fee_multiplier()
    }

    /// Drop expired pool entries. Returns how many were removed.
    pub fn sweep_pool(&self) -> usize {
        let now = self.now();
        let removed = self.pool().lock().sweep(now);
        if removed > 0 {
            info!(removed, "swept expired transactions");
        }
        removed
    }

    // ------------------------------------------------------------------
    // Ledger and chain queries
    // ------------------------------------------------------------------

    pub fn get_balance(&self, address: &str) -> i64 {
        self.state().get_balance(address)
    }

    pub fn get_nonce(&self, address: &str) -> u64 {
        self.state().get_nonce(address)
    }

    pub fn height(&self) -> u64 {
        self.chain.height()
    }

    pub fn latest_block(&self) -> Block {
        self.chain.latest_block()
    }

    pub fn block_by_index(&self, index: u64) -> Option<Block> {
        self.chain.block_by_index(index)
    }

    pub fn block_by_hash(&self, hash: &Hash256) -> Option<Block> {
        self.chain.block_by_hash(hash)
    }

    /// Credit `amount` to `address` outside any block.
    pub fn fund(&self, address: &str, amount: i64) -> Result<(), AtlasError> {
        self.state().fund(address, amount)?;
        Ok(())
    }

    /// Write a snapshot at the current ledger height.
    pub fn snapshot(&self) -> Result<PathBuf, AtlasError> {
        let height = self.state().height();
        Ok(self.state().create_snapshot(height)?)
    }

    // ------------------------------------------------------------------
    // Validators
    // ------------------------------------------------------------------

    pub fn all_validators(&self) -> Vec<Validator> {
        self.consensus().all_validators()
    }

    pub fn validator_info(&self, address: &str) -> Result<Validator, AtlasError> {
        Ok(self.consensus().get_validator_info(address)?)
    }

    pub fn register_validator(&self, address: &str, stake: u64, kyc: KycInfo) -> Result<(), AtlasError> {
        Ok(self.consensus().register_validator(address, stake, kyc)?)
    }

    pub fn update_validator_stake(&self, address: &str, stake: u64) -> Result<(), AtlasError> {
        Ok(self.consensus().update_validator_stake(address, stake)?)
    }

    pub fn choose_validator(&self) -> Result<Validator, AtlasError> {
        Ok(self.consensus().choose_validator()?)
    }

    /// Returns whether the validator was removed.
    pub fn slash_validator(&self, address: &str, reason: &str) -> Result<bool, AtlasError> {
        Ok(self.consensus().slash_validator(address, reason)?)
    }

    pub fn reward_validator(&self, address: &str, amount: u64) -> Result<(), AtlasError> {
        Ok(self.consensus().reward_validator(address, amount)?)
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Create the sync manager over `transport` and register its inbound
    /// handlers. Replaces any earlier manager.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) -> Arc<ChainSyncManager> {
        let chain: Arc<dyn ChainAccess> = self.chain.clone();
        let sync = Arc::new(ChainSyncManager::new(chain, transport, self.config.sync.clone()));
        sync.attach();
        *self.sync.write() = Some(sync.clone());
        sync
    }

    pub fn sync_manager(&self) -> Option<Arc<ChainSyncManager>> {
        self.sync.read().clone()
    }

    /// Run one sync round now.
    pub async fn sync_now(&self, cancel: &CancellationToken) -> Result<(), AtlasError> {
        let sync = self.sync_manager().ok_or(SyncError::NoPeers)?;
        sync.start_sync(cancel).await?;
        Ok(())
    }

    /// Whether a sync round is running, whatever status it has reported.
    pub fn is_syncing(&self) -> bool {
        self.sync_manager().is_some_and(|s| s.is_syncing())
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync_manager().map_or(SyncStatus::Idle, |s| s.status())
    }

    /// `(synced, total)` blocks of the current or last sync.
    pub fn sync_progress(&self) -> (u64, u64) {
        self.sync_manager().map_or((0, 0), |s| s.sync_progress())
    }

    pub fn sync_duration(&self) -> Duration {
        self.sync_manager().map_or(Duration::ZERO, |s| s.sync_duration())
    }

    // ------------------------------------------------------------------
    // Block production
    // ------------------------------------------------------------------

    /// One production tick.
    ///
    /// Returns `Ok(None)` when this node is not the chosen validator, has no
    /// key, is syncing, has a chain behind its recovered ledger, or another
    /// tick is still running. On failure the
    /// taken transactions go back to the pool, except one that aborted
    /// block application, which is dropped and its sender's reputation
    /// lowered.
    pub fn produce_block(&self) -> Result<Option<Block>, AtlasError> {
        let Some(_producing) = self.producing.try_lock() else {
            debug!("previous production tick still running");
            return Ok(None);
        };
        let Some(signer) = &self.signer else {
            return Ok(None);
        };
        if self.is_syncing() {
            debug!("sync in progress, skipping production");
            return Ok(None);
        }
        if self.chain.height() < self.state().height() {
            debug!(
                chain = self.chain.height(),
                ledger = self.state().height(),
                "chain behind recovered ledger, waiting for sync"
            );
            return Ok(None);
        }

        let address = signer.address();
        let chosen = self.consensus().choose_validator()?;
        if chosen.address != address {
            debug!(chosen = %chosen.address, "another validator was chosen");
            return Ok(None);
        }

        let txs = {
            let mut pool = self.pool().lock();
            let limit = pool.len().min(self.config.params.max_block_size);
            pool.take_for_block(limit)
        };
        let last = self.chain.latest_block();

        let block = match forge_block(signer, &last, txs.clone(), self.consensus(), self.now()) {
            Ok(block) => block,
            Err(e) => {
                self.requeue(txs, None);
                self.record_outcome(&address, false);
                return Err(e.into());
            }
        };

        if let Err(e) = self.chain.import(block.clone()) {
            let offender = match &e {
                AtlasError::Block(BlockError::Transaction { index, .. }) => Some(*index),
                _ => None,
            };
            self.requeue(txs, offender);
            self.record_outcome(&address, false);
            return Err(e);
        }

        {
            let mut pool = self.pool().lock();
            for tx in &txs {
                pool.record_sender_outcome(&tx.sender, true);
            }
        }
        let reward = u64::try_from(self.config.params.block_reward).unwrap_or(0);
        if let Err(e) = self.consensus().reward_validator(&address, reward) {
            warn!(error = %e, "failed to record block reward");
        }
        self.record_outcome(&address, true);

        let rotation = self.config.params.validator_rotation;
        if rotation > 0 && block.index % rotation == 0 {
            let removed = self.consensus().rotate_validators();
            debug!(index = block.index, removed = removed.len(), "rotation point");
        }
        Ok(Some(block))
    }

    /// Return taken transactions to the pool. Those ahead of `offender`
    /// applied cleanly and are credited before they are re-admitted.
    fn requeue(&self, mut txs: Vec<Transaction>, offender: Option<usize>) {
        let now = self.now();
        let mut pool = self.pool().lock();
        if let Some(index) = offender.filter(|i| *i < txs.len()) {
            for tx in &txs[..index] {
                pool.record_tx_outcome(tx.hash(), true);
            }
            let bad = txs.remove(index);
            pool.reject(&bad);
            warn!(hash = %bad.hash().short(), sender = %bad.sender, "dropping transaction that failed block application");
        }
        let taken = txs.len();
        let requeued = pool.requeue(txs, now);
        debug!(requeued, lost = taken - requeued, "returned transactions to pool");
    }

    fn record_outcome(&self, address: &str, success: bool) {
        if let Err(e) = self.consensus().update_validator_metrics(address, success) {
            debug!(address, error = %e, "validator metrics not updated");
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the background tasks. Calling it on a running node does
    /// nothing.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.tasks.lock();
        if slot.is_some() {
            warn!("node already started");
            return;
        }
        let mut tasks = TaskSet::new();
        let block_time = Duration::from_secs(self.config.params.block_time_secs);

        self.spawn(&mut tasks, "produce", block_time, |node, _| async move {
            match node.produce_block() {
                Ok(_) => {}
                Err(AtlasError::Consensus(ConsensusError::NoValidators)) => {
                    debug!("no validators registered");
                }
                Err(e) => warn!(error = %e, "block production failed"),
            }
        });
        self.spawn(&mut tasks, "pool-sweep", MAINTENANCE_INTERVAL, |node, _| async move {
            node.sweep_pool();
        });
        self.spawn(&mut tasks, "confirmation-cleanup", MAINTENANCE_INTERVAL, |node, _| async move {
            let dropped = node.consensus().cleanup_old_confirmations();
            if dropped > 0 {
                debug!(dropped, "cleaned up confirmation records");
            }
        });
        if self.config.snapshot.enabled {
            self.spawn(&mut tasks, "snapshot", self.config.snapshot.interval(), |node, _| async move {
                if let Err(e) = node.snapshot() {
                    warn!(error = %e, "periodic snapshot failed");
                }
            });
        }
        if self.sync_manager().is_some() {
            self.spawn(&mut tasks, "sync-sweep", self.config.sync.sweep_interval(), |node, _| async move {
                if let Some(sync) = node.sync_manager() {
                    sync.sweep_expired();
                }
            });
            self.spawn(&mut tasks, "sync-poll", self.config.sync.poll_interval(), |node, token| async move {
                if let Some(sync) = node.sync_manager() {
                    sync.poll(&token).await;
                }
            });
        }

        info!(tasks = tasks.len(), block_time_secs = self.config.params.block_time_secs, "node started");
        *slot = Some(tasks);
    }

    /// Run `tick` every `period` with a strong reference to the node,
    /// stopping quietly once the node is dropped.
    fn spawn<F, Fut>(self: &Arc<Self>, tasks: &mut TaskSet, name: &'static str, period: Duration, tick: F)
    where
        F: Fn(Arc<Node>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let node = Arc::downgrade(self);
        tasks.spawn_periodic(name, period, move |token| {
            let run = node.upgrade().map(|node| tick(node, token));
            async move {
                if let Some(run) = run {
                    run.await;
                }
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Stop every background task and, with snapshots enabled, write a
    /// final snapshot.
    pub async fn stop(&self) {
        let tasks = self.tasks.lock().take();
        let Some(tasks) = tasks else {
            return;
        };
        tasks.shutdown().await;
        if self.config.snapshot.enabled {
            if let Err(e) = self.snapshot() {
                warn!(error = %e, "final snapshot failed");
            }
        }
        info!(height = self.height(), "node stopped");
    }
}
