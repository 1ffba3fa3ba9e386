//! The genesis block.
//!
//! Index 0, zero parent hash, no transactions, signed by the
//! [`GENESIS_VALIDATOR`] sentinel. Initial balances are not part of the
//! block; they are funded administratively when the ledger is created.

use std::sync::OnceLock;

use crate::constants::{GENESIS_SIGNATURE, GENESIS_TIMESTAMP, GENESIS_VALIDATOR};
use crate::types::{Block, Hash256};

/// Build the genesis block.
pub fn genesis_block() -> Block {
    Block {
        index: 0,
        timestamp: GENESIS_TIMESTAMP,
        transactions: Vec::new(),
        prev_hash: Hash256::ZERO,
        validator: GENESIS_VALIDATOR.to_string(),
        validator_key: Vec::new(),
        signature: GENESIS_SIGNATURE.to_vec(),
        hash: Hash256::ZERO,
    }
    .seal()
}

/// Hash of the genesis block, computed once.
pub fn genesis_hash() -> Hash256 {
    static HASH: OnceLock<Hash256> = OnceLock::new();
    *HASH.get_or_init(|| genesis_block().hash)
}
