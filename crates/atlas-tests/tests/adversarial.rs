//! Adversarial property-based test suite for Atlas.
//!
//! These tests try to break protocol invariants under randomized inputs.
//! Each property runs 256 cases with proptest shrinking.
//!
//! Attack vectors tested:
//! - Nonce replay and reordering inside a block
//! - Nonce replay of blocks covered by a recovered snapshot
//! - Balance conservation across applied and rejected blocks
//! - Snapshot tampering and checksum order independence
//! - Mempool double-insert
//! - Block selection ordering under random fees
//! - Chain linkage tampering (prev hash, hash, index)
//! - Single-validator bootstrap selection
//! - Blocks from unregistered producers
//! - Extra, missing or inflated block rewards
//! - Stake batches past the validator cap
//! - Finality monotonicity under cleanup

use std::collections::BTreeMap;
use std::sync::Arc;

use atlas_consensus::{ConsensusManager, FinalityTracker, reward_transaction};
use atlas_core::crypto::KeyPair;
use atlas_core::error::{BlockError, ConsensusError, MempoolError};
use atlas_core::genesis::genesis_block;
use atlas_core::mempool::Mempool;
use atlas_core::params::ChainParams;
use atlas_core::snapshot::{Snapshot, SnapshotStore, balances_checksum};
use atlas_core::state::StateManager;
use atlas_core::traits::StakeHook;
use atlas_core::types::{Block, Hash256, Transaction, TxPayload};
use atlas_core::validation::validate_successor;
use atlas_tests::helpers::{NOW, addr, key, kyc, signed_transfer};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const ACCOUNTS: u8 = 4;
const FORGER: u8 = 0x77;

fn keys() -> Vec<KeyPair> {
    (1..=ACCOUNTS).map(key).collect()
}

/// Ledger funding every test account with `balance`.
fn funded_ledger(balance: i64) -> StateManager {
    let ledger = StateManager::new(ChainParams::default());
    for seed in 1..=ACCOUNTS {
        ledger.fund(&addr(seed), balance).unwrap();
    }
    ledger
}

/// Unsigned-by-validator block at `index` carrying `txs`, forged by FORGER.
fn block_with(index: u64, prev: Hash256, txs: Vec<Transaction>) -> Block {
    Block {
        index,
        timestamp: NOW,
        transactions: txs,
        prev_hash: prev,
        validator: addr(FORGER),
        validator_key: Vec::new(),
        signature: vec![1],
        hash: Hash256::ZERO,
    }
    .seal()
}

/// Block at height 1 forged by `validator`.
fn produced_by(validator: &str, txs: Vec<Transaction>) -> Block {
    Block {
        validator: validator.to_string(),
        ..block_with(1, genesis_block().hash, txs)
    }
    .seal()
}

/// Ledger and registry wired together, with FORGER registered.
fn staking_chain(params: ChainParams) -> (Arc<StateManager>, Arc<ConsensusManager>) {
    let state = Arc::new(StateManager::new(params.clone()));
    let consensus = Arc::new(ConsensusManager::with_clock(params, state.clone(), || NOW));
    let hook: Arc<dyn StakeHook> = consensus.clone();
    state.set_stake_hook(Arc::downgrade(&hook));
    state.fund(&addr(FORGER), 1_000).unwrap();
    consensus.register_validator(&addr(FORGER), 500, kyc()).unwrap();
    (state, consensus)
}

fn signed_stake(from: &KeyPair, amount: i64) -> Transaction {
    let mut tx = Transaction::transfer(from.address(), from.address(), amount, 0, 0, NOW);
    tx.payload = TxPayload::Stake;
    from.sign_transaction(&mut tx);
    tx
}

fn total_supply(ledger: &StateManager) -> i64 {
    ledger.all_balances().values().sum()
}

/// `(from, to, amount, fee)` with `from != to`, indices into [`keys`].
fn transfer_plan() -> impl Strategy<Value = (usize, usize, i64, i64)> {
    (0..ACCOUNTS as usize, 1..ACCOUNTS as usize, 1i64..400, 0i64..20)
        .prop_map(|(from, shift, amount, fee)| (from, (from + shift) % ACCOUNTS as usize, amount, fee))
}

/// Sign transfers in order, assigning each sender consecutive nonces.
fn signed_batch(plans: &[(usize, usize, i64, i64)]) -> Vec<Transaction> {
    let keys = keys();
    let mut nonces = [0u64; ACCOUNTS as usize];
    plans
        .iter()
        .map(|&(from, to, amount, fee)| {
            let tx = signed_transfer(&keys[from], &keys[to].address(), amount, fee, nonces[from]);
            nonces[from] += 1;
            tx
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Nonces
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Applying a block advances each sender's nonce by exactly the number
    /// of transactions it sent; a rejected block advances none.
    #[test]
    fn nonces_advance_by_transactions_sent(plans in prop::collection::vec(transfer_plan(), 1..12)) {
        let ledger = funded_ledger(1_000);
        let before: Vec<u64> = keys().iter().map(|k| ledger.get_nonce(&k.address())).collect();
        let block = block_with(1, genesis_block().hash, signed_batch(&plans));

        let applied = ledger.apply_block(&block).is_ok();

        for (i, k) in keys().iter().enumerate() {
            let sent = plans.iter().filter(|s| s.0 == i).count() as u64;
            let expected = if applied { before[i] + sent } else { before[i] };
            prop_assert_eq!(ledger.get_nonce(&k.address()), expected);
        }
    }

    /// A transaction replayed with an already-used nonce is rejected.
    #[test]
    fn replayed_nonce_is_rejected(amount in 1i64..100, fee in 0i64..10) {
        let ledger = funded_ledger(1_000);
        let keys = keys();
        let tx = signed_transfer(&keys[0], &keys[1].address(), amount, fee, 0);
        let first = block_with(1, genesis_block().hash, vec![tx.clone()]);
        ledger.apply_block(&first).unwrap();

        let replay = block_with(2, first.hash, vec![tx]);
        let err = ledger.apply_block(&replay).unwrap_err();
        let is_tx_error = matches!(err, BlockError::Transaction { index: 0, .. });
        prop_assert!(is_tx_error);
        prop_assert_eq!(ledger.get_nonce(&keys[0].address()), 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Snapshots carry balances only. Replaying the nonces of the blocks a
    /// snapshot covers restores every sender's nonce, so those blocks
    /// cannot be replayed afterwards.
    #[test]
    fn covered_blocks_restore_nonces(plans in prop::collection::vec(transfer_plan(), 1..8)) {
        let dir = tempfile::tempdir().unwrap();
        let open = || {
            StateManager::new(ChainParams::default()).with_snapshots(
                SnapshotStore::open(dir.path(), 5).unwrap(),
                std::time::Duration::from_secs(3600),
            )
        };
        let original = open();
        for seed in 1..=ACCOUNTS {
            original.fund(&addr(seed), 10_000).unwrap();
        }
        let txs = signed_batch(&plans);
        let block = block_with(1, genesis_block().hash, txs.clone());
        original.apply_block(&block).unwrap();
        original.create_snapshot(1).unwrap();

        let recovered = open();
        recovered.recover_state().unwrap();
        recovered.advance_nonces(&block);

        for k in keys() {
            prop_assert_eq!(recovered.get_nonce(&k.address()), original.get_nonce(&k.address()));
        }
        prop_assert_eq!(recovered.all_balances(), original.all_balances());

        let replay = block_with(2, block.hash, txs);
        let is_tx_error = matches!(
            recovered.apply_block(&replay),
            Err(BlockError::Transaction { index: 0, .. })
        );
        prop_assert!(is_tx_error);
    }
}

// ---------------------------------------------------------------------------
// Conservation
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Transfers move value between accounts and fees go to the forger, so
    /// the total never changes. A rejected block changes nothing at all.
    #[test]
    fn transfers_conserve_total(
        balance in 0i64..2_000,
        plans in prop::collection::vec(transfer_plan(), 1..12),
    ) {
        let ledger = funded_ledger(balance);
        let supply = total_supply(&ledger);
        let balances = ledger.all_balances();
        let block = block_with(1, genesis_block().hash, signed_batch(&plans));

        match ledger.apply_block(&block) {
            Ok(()) => {
                prop_assert_eq!(total_supply(&ledger), supply);
                let fees: i64 = plans.iter().map(|s| s.3).sum();
                prop_assert_eq!(ledger.get_balance(&addr(FORGER)), fees);
                prop_assert_eq!(ledger.height(), 1);
            }
            Err(_) => {
                prop_assert_eq!(ledger.all_balances(), balances);
                prop_assert_eq!(ledger.height(), 0);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

fn balance_map() -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::vec(("0x[0-9a-f]{40}", 0i64..1_000_000), 0..20)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// A snapshot verifies as built, and any change to a balance or the
    /// height breaks the checksum.
    #[test]
    fn snapshot_checksum_detects_tampering(
        entries in balance_map(),
        height in 0u64..1_000_000,
        delta in 1i64..1_000,
    ) {
        let balances: BTreeMap<String, i64> = entries.into_iter().collect();
        let ts = Utc.timestamp_opt(NOW, 0).unwrap();
        let snapshot = Snapshot::new(balances.clone(), height, ts);
        prop_assert!(snapshot.verify());

        let mut moved_height = snapshot.clone();
        moved_height.block_height = height + 1;
        prop_assert!(!moved_height.verify());

        if let Some((first, _)) = balances.iter().next() {
            let mut edited = snapshot.clone();
            *edited.balances.get_mut(first).unwrap() += delta;
            prop_assert!(!edited.verify());
        }
    }

    /// The checksum depends on the set of balances, not insertion order.
    #[test]
    fn checksum_ignores_insertion_order(entries in balance_map()) {
        let forward: BTreeMap<String, i64> = entries.iter().cloned().collect();
        let mut reversed_entries = entries.clone();
        reversed_entries.reverse();
        // Later duplicates win on collect; keep the same winner both ways.
        let reversed: BTreeMap<String, i64> = reversed_entries
            .into_iter()
            .filter(|(k, v)| forward.get(k) == Some(v))
            .collect();
        prop_assert_eq!(
            balances_checksum("p", &forward),
            balances_checksum("p", &reversed)
        );
    }
}

// ---------------------------------------------------------------------------
// Mempool
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Inserting the same transaction twice is rejected and leaves one copy.
    #[test]
    fn pool_rejects_duplicates(amount in 1i64..10_000, fee in 0i64..100) {
        let mut pool = Mempool::new(100, 3_600);
        let tx = signed_transfer(&key(1), &addr(2), amount, fee, 0);

        let hash = pool.insert_at(tx.clone(), 0, NOW).unwrap();
        let again = pool.insert_at(tx, 0, NOW);

        prop_assert_eq!(again, Err(MempoolError::AlreadyExists(hash.to_string())));
        prop_assert_eq!(pool.len(), 1);
    }

    /// Block selection returns the highest priorities, highest first.
    #[test]
    fn selection_takes_top_priorities(
        fees in prop::collection::vec(0i64..1_000, 1..16),
        limit in 0usize..20,
    ) {
        let mut pool = Mempool::new(100, 3_600);
        for (i, fee) in fees.iter().enumerate() {
            let sender = key(10 + i as u8);
            pool.insert_at(signed_transfer(&sender, &addr(2), 10, *fee, 0), 0, NOW).unwrap();
        }
        let priorities: BTreeMap<Hash256, f64> =
            pool.iter().map(|e| (e.hash, e.priority)).collect();
        let mut expected: Vec<f64> = priorities.values().copied().collect();
        expected.sort_by(|a, b| b.total_cmp(a));
        expected.truncate(limit);

        let taken = pool.take_for_block(limit);
        let got: Vec<f64> = taken.iter().map(|tx| priorities[&tx.hash()]).collect();

        prop_assert_eq!(got, expected);
        prop_assert_eq!(pool.len(), fees.len() - taken.len());
    }
}

// ---------------------------------------------------------------------------
// Chain linkage
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// A successor only links to the tip it was built on, with an intact hash.
    #[test]
    fn successor_linkage_is_enforced(
        byte in 0usize..32,
        flip in 1u8..=255,
        skip in 2u64..100,
    ) {
        let tip = genesis_block();
        let block = block_with(1, tip.hash, Vec::new());
        prop_assert!(validate_successor(&block, &tip).is_ok());

        let mut wrong_prev = block.clone();
        wrong_prev.prev_hash.0[byte] ^= flip;
        let wrong_prev = wrong_prev.seal();
        prop_assert_eq!(validate_successor(&wrong_prev, &tip), Err(BlockError::InvalidPrevHash));

        let mut wrong_hash = block.clone();
        wrong_hash.hash.0[byte] ^= flip;
        prop_assert_eq!(validate_successor(&wrong_hash, &tip), Err(BlockError::HashMismatch));

        let mut wrong_index = block.clone();
        wrong_index.index = skip;
        let wrong_index = wrong_index.seal();
        prop_assert_eq!(
            validate_successor(&wrong_index, &tip),
            Err(BlockError::InvalidIndex { expected: 1, got: skip })
        );
    }
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// With one active validator, selection always returns it.
    #[test]
    fn single_validator_is_always_chosen(stake in 1u64..10_000, rounds in 1usize..20) {
        let state = Arc::new(StateManager::new(ChainParams::default()));
        state.fund(&addr(FORGER), stake as i64).unwrap();
        let consensus = ConsensusManager::with_clock(ChainParams::default(), state, || NOW);
        consensus.register_validator(&addr(FORGER), stake, kyc()).unwrap();

        for _ in 0..rounds {
            prop_assert_eq!(consensus.choose_validator().unwrap().address, addr(FORGER));
        }
    }

    /// Only a registered validator may produce, whatever it mints itself.
    #[test]
    fn unregistered_producer_is_refused(seed in 1u8..=255, minted in 1i64..i64::MAX / 2) {
        prop_assume!(seed != FORGER);
        let (state, consensus) = staking_chain(ChainParams::default());
        let rogue = addr(seed);
        let block = produced_by(&rogue, vec![reward_transaction(&rogue, minted, NOW)]);

        prop_assert_eq!(
            consensus.check_producer(&block),
            Err(ConsensusError::ValidatorNotFound(rogue.clone()))
        );
        prop_assert_eq!(state.get_balance(&rogue), 0);
    }

    /// A block pays exactly one reward of exactly `block_reward`.
    #[test]
    fn reward_must_be_exact_and_single(amount in 1i64..1_000, extra in 0usize..3) {
        let params = ChainParams::default();
        let (_, consensus) = staking_chain(params.clone());
        let forger = addr(FORGER);
        let mut txs: Vec<Transaction> = (0..extra)
            .map(|i| reward_transaction(&forger, params.block_reward, NOW - 1 - i as i64))
            .collect();
        txs.push(reward_transaction(&forger, amount, NOW));

        let accepted = consensus.check_producer(&produced_by(&forger, txs)).is_ok();
        prop_assert_eq!(accepted, amount == params.block_reward && extra == 0);
    }

    /// A block whose stakes would push the registry past its cap is
    /// refused as a whole, and the ledger's locked stake always matches the
    /// registry.
    #[test]
    fn stakes_past_capacity_are_refused(cap in 1usize..5, stakers in 1u8..6, stake in 100i64..500) {
        let params = ChainParams { max_validators: cap, ..ChainParams::default() };
        let (state, consensus) = staking_chain(params);
        let keys: Vec<KeyPair> = (1..=stakers).map(key).collect();
        for k in &keys {
            state.fund(&k.address(), 1_000).unwrap();
        }
        let block = block_with(1, genesis_block().hash, keys.iter().map(|k| signed_stake(k, stake)).collect());

        let applied = state.apply_block(&block).is_ok();

        prop_assert_eq!(applied, 1 + stakers as usize <= cap);
        prop_assert!(consensus.validator_count() <= cap);
        for k in &keys {
            let acct = state.get_account(&k.address());
            let registered = consensus.get_validator_info(&k.address()).ok();
            prop_assert_eq!(acct.staked_amount > 0, registered.is_some());
            prop_assert_eq!(acct.is_validator, registered.is_some());
            if let Some(v) = registered {
                prop_assert_eq!(v.stake, acct.staked_amount);
            }
        }
    }

    /// Once final, a block stays final whatever confirmations or cleanups
    /// follow.
    #[test]
    fn finality_is_permanent(
        threshold in 1u32..5,
        extra in 0u32..5,
        cleanup_at in 0i64..1_000_000,
    ) {
        let mut tracker = FinalityTracker::new(threshold, 60);
        let hash = Hash256([9; 32]);

        let mut finalized_on = None;
        for i in 0..threshold + extra {
            if tracker.track(hash, NOW) {
                prop_assert!(finalized_on.is_none());
                finalized_on = Some(i + 1);
            }
        }
        prop_assert_eq!(finalized_on, Some(threshold));
        prop_assert!(tracker.is_finalized(&hash));

        tracker.cleanup(NOW + cleanup_at);
        prop_assert!(tracker.is_finalized(&hash));
        tracker.track(hash, NOW + cleanup_at);
        prop_assert!(tracker.is_finalized(&hash));
    }
}
