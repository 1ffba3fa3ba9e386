//! Criterion benchmarks for atlas-consensus hot paths.
//!
//! Covers: validator selection, block forging, and confirmation tracking.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use atlas_consensus::{forge_block, ConsensusManager};
use atlas_core::crypto::KeyPair;
use atlas_core::genesis::genesis_block;
use atlas_core::params::ChainParams;
use atlas_core::state::StateManager;
use atlas_core::types::{Hash256, Transaction};

const NOW: i64 = 1_700_000_000;

fn manager_with(n: usize) -> ConsensusManager {
    let state = Arc::new(StateManager::new(ChainParams::default()));
    let cm = ConsensusManager::with_clock(ChainParams::default(), state, || NOW);
    for i in 0..n {
        cm.add_external_validator(&format!("0x{i:040x}"), 100 + i as u64);
    }
    cm
}

fn bench_choose_validator(c: &mut Criterion) {
    let cm = manager_with(100);
    c.bench_function("choose_validator_100", |b| {
        b.iter(|| black_box(cm.choose_validator()))
    });
}

fn bench_forge(c: &mut Criterion) {
    let key = KeyPair::from_secret_bytes([7; 32]);
    let cm = manager_with(0);
    cm.add_external_validator(&key.address(), 1_000);
    let genesis = genesis_block();
    let txs: Vec<Transaction> = (0..100)
        .map(|i| {
            let mut tx = Transaction::transfer(
                key.address(),
                "0x2222222222222222222222222222222222222222",
                1,
                1,
                i,
                NOW,
            );
            key.sign_transaction(&mut tx);
            tx
        })
        .collect();

    c.bench_function("forge_block_100_txs", |b| {
        b.iter(|| forge_block(&key, &genesis, black_box(txs.clone()), &cm, NOW))
    });
}

fn bench_track_confirmations(c: &mut Criterion) {
    c.bench_function("track_confirmation_1000_blocks", |b| {
        b.iter_batched(
            || manager_with(0),
            |cm| {
                for i in 0..1_000u32 {
                    let mut bytes = [0u8; 32];
                    bytes[..4].copy_from_slice(&i.to_le_bytes());
                    cm.track_block_confirmation(Hash256(bytes));
                }
                cm
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_choose_validator,
    bench_forge,
    bench_track_confirmations,
);
criterion_main!(benches);
