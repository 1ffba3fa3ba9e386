//! Shared test helpers for E2E and integration tests.

use std::sync::Arc;

use atlas_consensus::KycInfo;
use atlas_core::constants::GENESIS_TIMESTAMP;
use atlas_core::crypto::KeyPair;
use atlas_core::types::Transaction;
use atlas_network::SyncObserver;
use atlas_node_lib::{Node, NodeConfig};
use parking_lot::Mutex;

/// Fixed clock used by every test node.
pub const NOW: i64 = GENESIS_TIMESTAMP + 10_000;

/// Seed of the key every forging test node signs with.
pub const VALIDATOR_SEED: u8 = 0xAA;

/// Deterministic keypair from a seed byte.
pub fn key(seed: u8) -> KeyPair {
    KeyPair::from_secret_bytes([seed; 32])
}

pub fn addr(seed: u8) -> String {
    key(seed).address()
}

/// Complete, verified KYC record.
pub fn kyc() -> KycInfo {
    KycInfo {
        full_name: "Test Validator".into(),
        country: "NZ".into(),
        id_number: "T-0001".into(),
        verified: true,
    }
}

/// Transfer signed by `from`.
pub fn signed_transfer(from: &KeyPair, to: &str, amount: i64, fee: i64, nonce: u64) -> Transaction {
    let mut tx = Transaction::transfer(from.address(), to, amount, fee, nonce, NOW);
    from.sign_transaction(&mut tx);
    tx
}

/// Config without snapshots funding each `(seed, amount)` pair.
pub fn base_config(allocations: &[(u8, i64)]) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.snapshot.enabled = false;
    for (seed, amount) in allocations {
        cfg.genesis_allocations.insert(addr(*seed), *amount);
    }
    cfg
}

/// A node that forges as [`VALIDATOR_SEED`] with `stake`, funding it with
/// `stake` on top of `allocations`.
pub fn validator_node(allocations: &[(u8, i64)], stake: u64) -> Arc<Node> {
    let mut cfg = base_config(allocations);
    let signer = key(VALIDATOR_SEED);
    cfg.validator_key = Some(hex_secret(VALIDATOR_SEED));
    cfg.validator_stake = stake;
    cfg.validator_kyc = kyc();
    *cfg.genesis_allocations.entry(signer.address()).or_insert(0) += stake as i64;
    Node::with_clock(cfg, || NOW).expect("validator node")
}

/// [`base_config`] that also knows the [`VALIDATOR_SEED`] validator, so
/// blocks it forges are accepted.
pub fn follower_config(allocations: &[(u8, i64)]) -> NodeConfig {
    let mut cfg = base_config(allocations);
    cfg.genesis_validators.insert(addr(VALIDATOR_SEED), 1000);
    cfg
}

/// A node with no key that only follows.
pub fn follower_node(allocations: &[(u8, i64)]) -> Arc<Node> {
    Node::with_clock(follower_config(allocations), || NOW).expect("follower node")
}

/// Hex secret for a seeded key, as accepted by `NodeConfig::validator_key`.
pub fn hex_secret(seed: u8) -> String {
    format!("{seed:02x}").repeat(32)
}

/// Produce `n` blocks on `node`, panicking if any tick does not forge.
pub fn produce(node: &Node, n: usize) {
    for _ in 0..n {
        node.produce_block()
            .expect("production succeeds")
            .expect("local validator is chosen");
    }
}

/// Copy blocks `1..=to` from `source` into `target` through the import path.
pub fn replay(source: &Node, target: &Node, to: u64) {
    for block in source.chain().range(target.height() + 1, to) {
        target.chain().import(block).expect("replayed block imports");
    }
}

/// Records every sync event as a string.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl SyncObserver for Recorder {
    fn on_sync_start(&self) {
        self.events.lock().push("start".into());
    }

    fn on_sync_progress(&self, synced: u64, total: u64) {
        self.events.lock().push(format!("progress {synced}/{total}"));
    }

    fn on_sync_complete(&self) {
        self.events.lock().push("complete".into());
    }

    fn on_sync_failed(&self, error: &atlas_core::error::SyncError) {
        self.events.lock().push(format!("failed {error}"));
    }
}
