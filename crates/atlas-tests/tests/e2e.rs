//! End-to-end scenarios for Atlas.
//!
//! Each test drives a whole node (ledger, pool, consensus, sync) through a
//! user-visible flow and checks the resulting balances, pool and chain.

use std::sync::Arc;

use atlas_core::error::{AtlasError, MempoolError, StateError, TransactionError};
use atlas_core::params::ChainParams;
use atlas_core::snapshot::SnapshotStore;
use atlas_core::state::StateManager;
use atlas_network::memory::MemoryNetwork;
use atlas_network::{SyncConfig, SyncStatus};
use atlas_tests::helpers::*;
use tokio_util::sync::CancellationToken;

const A: u8 = 1;
const B: u8 = 2;
const V: u8 = 3;

// ---------------------------------------------------------------------------
// Scenario 1: a transfer is forged and applied
// ---------------------------------------------------------------------------

#[test]
fn transfer_is_applied_by_next_block() {
    let node = validator_node(&[(A, 1000)], 1000);
    let a = key(A);

    node.submit_transaction(signed_transfer(&a, &addr(B), 100, 1, 0))
        .unwrap();
    let block = node.produce_block().unwrap().unwrap();

    assert_eq!(block.index, 1);
    assert_eq!(node.get_balance(&a.address()), 899);
    assert_eq!(node.get_balance(&addr(B)), 100);
    assert_eq!(node.get_nonce(&a.address()), 1);
    assert_eq!(node.pool_size(), 0);
}

#[test]
fn forger_collects_fee_and_reward() {
    let node = validator_node(&[(A, 1000)], 1000);
    let forger = addr(VALIDATOR_SEED);
    let before = node.get_balance(&forger);

    node.submit_transaction(signed_transfer(&key(A), &addr(B), 100, 7, 0))
        .unwrap();
    node.produce_block().unwrap().unwrap();

    let reward = ChainParams::default().block_reward;
    assert_eq!(node.get_balance(&forger), before + 7 + reward);
}

// ---------------------------------------------------------------------------
// Scenario 2: negative amounts never reach the pool
// ---------------------------------------------------------------------------

#[test]
fn negative_amount_is_rejected_at_admission() {
    let node = validator_node(&[(A, 1000)], 1000);
    let before = node.pool_size();

    let err = node
        .submit_transaction(signed_transfer(&key(A), &addr(B), -100, 1, 0))
        .unwrap_err();

    assert!(matches!(
        err,
        AtlasError::Mempool(MempoolError::Invalid(TransactionError::NonPositiveAmount(-100)))
    ));
    assert_eq!(node.pool_size(), before);
}

// ---------------------------------------------------------------------------
// Scenario 3: validator registration locks stake
// ---------------------------------------------------------------------------

#[test]
fn registration_moves_balance_into_stake() {
    let node = follower_node(&[(V, 1500)]);

    node.register_validator(&addr(V), 1000, kyc()).unwrap();

    assert_eq!(node.validator_info(&addr(V)).unwrap().stake, 1000);
    assert_eq!(node.get_balance(&addr(V)), 500);
    assert_eq!(node.state().get_account(&addr(V)).staked_amount, 1000);
    assert!(node.state().get_account(&addr(V)).is_validator);
}

#[test]
fn registration_without_kyc_leaves_balance() {
    let node = follower_node(&[(V, 1500)]);
    let mut unverified = kyc();
    unverified.verified = false;

    assert!(node.register_validator(&addr(V), 1000, unverified).is_err());
    assert_eq!(node.get_balance(&addr(V)), 1500);
    assert!(node.validator_info(&addr(V)).is_err());
}

// ---------------------------------------------------------------------------
// Scenario 4: a full pool evicts its lowest-priority entry
// ---------------------------------------------------------------------------

#[test]
fn full_pool_evicts_lowest_priority() {
    let mut cfg = base_config(&[(10, 1000), (11, 1000), (12, 1000), (13, 1000)]);
    cfg.params.max_tx_pool_size = 3;
    let node = atlas_node_lib::Node::with_clock(cfg, || NOW).unwrap();

    let low = signed_transfer(&key(10), &addr(B), 10, 1, 0);
    let mid = signed_transfer(&key(11), &addr(B), 10, 2, 0);
    let high = signed_transfer(&key(12), &addr(B), 10, 3, 0);
    for tx in [&low, &mid, &high] {
        node.submit_transaction(tx.clone()).unwrap();
    }
    assert_eq!(node.pool_size(), 3);

    let richer = signed_transfer(&key(13), &addr(B), 10, 50, 0);
    node.submit_transaction(richer.clone()).unwrap();

    assert_eq!(node.pool_size(), 3);
    assert!(node.get_transaction(&low.hash()).is_none());
    assert!(node.get_transaction(&richer.hash()).is_some());
    assert!(node.get_transaction(&mid.hash()).is_some());
}

#[test]
fn full_pool_rejects_lower_priority() {
    let mut cfg = base_config(&[(10, 1000), (11, 1000), (12, 1000)]);
    cfg.params.max_tx_pool_size = 2;
    let node = atlas_node_lib::Node::with_clock(cfg, || NOW).unwrap();

    node.submit_transaction(signed_transfer(&key(10), &addr(B), 10, 20, 0))
        .unwrap();
    node.submit_transaction(signed_transfer(&key(11), &addr(B), 10, 30, 0))
        .unwrap();
    let err = node
        .submit_transaction(signed_transfer(&key(12), &addr(B), 10, 1, 0))
        .unwrap_err();

    assert_eq!(err, AtlasError::Mempool(MempoolError::PoolFull));
    assert_eq!(node.pool_size(), 2);
}

// ---------------------------------------------------------------------------
// Scenario 5: sync to the highest peer in chunks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sync_follows_highest_peer() {
    let source = validator_node(&[], 1000);
    produce(&source, 15);

    let peer_low = follower_node(&[]);
    let peer_high = follower_node(&[]);
    let local = follower_node(&[]);
    replay(&source, &peer_low, 10);
    replay(&source, &peer_high, 15);
    replay(&source, &local, 5);

    let net = MemoryNetwork::new();
    let sync = local.attach_transport(net.join());
    peer_low.attach_transport(net.join());
    peer_high.attach_transport(net.join());
    let recorder = Arc::new(Recorder::default());
    sync.add_observer(recorder.clone());
    assert_eq!(sync.config(), &SyncConfig::default());

    local.sync_now(&CancellationToken::new()).await.unwrap();

    assert_eq!(local.height(), 15);
    assert_eq!(local.latest_block(), source.latest_block());
    assert_eq!(local.sync_status(), SyncStatus::Complete);
    assert_eq!(local.sync_progress(), (10, 10));
    assert_eq!(recorder.events(), vec!["start", "progress 10/10", "complete"]);
}

#[tokio::test]
async fn sync_downloads_in_chunks() {
    let source = validator_node(&[], 1000);
    produce(&source, 15);

    let peer = follower_node(&[]);
    replay(&source, &peer, 15);

    let mut cfg = follower_config(&[]);
    cfg.sync.chunk_size = 4;
    let local = atlas_node_lib::Node::with_clock(cfg, || NOW).unwrap();
    replay(&source, &local, 5);

    let net = MemoryNetwork::new();
    let sync = local.attach_transport(net.join());
    peer.attach_transport(net.join());
    let recorder = Arc::new(Recorder::default());
    sync.add_observer(recorder.clone());

    local.sync_now(&CancellationToken::new()).await.unwrap();

    assert_eq!(local.height(), 15);
    assert_eq!(
        recorder.events(),
        vec!["start", "progress 4/10", "progress 8/10", "progress 10/10", "complete"]
    );
}

// ---------------------------------------------------------------------------
// Scenario 6: corrupt snapshots
// ---------------------------------------------------------------------------

fn ledger_with_snapshots(dir: &std::path::Path) -> StateManager {
    let store = SnapshotStore::open(dir, 5).unwrap();
    StateManager::new(ChainParams::default())
        .with_snapshots(store, std::time::Duration::from_secs(3600))
}

#[test]
fn corrupt_single_snapshot_is_state_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = ledger_with_snapshots(dir.path());
    ledger.fund(&addr(A), 1000).unwrap();
    let path = ledger.create_snapshot(1).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x55;
    std::fs::write(&path, bytes).unwrap();

    assert!(matches!(
        ledger.load_latest_snapshot(),
        Err(StateError::SnapshotCorrupt(_))
    ));
    assert_eq!(ledger.recover_state(), Err(StateError::StateCorrupt));
}

#[test]
fn corrupt_newest_snapshot_falls_back_to_older() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = ledger_with_snapshots(dir.path());
    ledger.fund(&addr(A), 1000).unwrap();
    ledger.create_snapshot(1).unwrap();
    ledger.fund(&addr(A), 500).unwrap();
    let newest = ledger.create_snapshot(2).unwrap();
    std::fs::write(&newest, b"{\"balances\": 42}").unwrap();

    let restored = ledger.recover_state().unwrap();

    assert_eq!(restored.block_height, 1);
    assert_eq!(ledger.get_balance(&addr(A)), 1000);
}
