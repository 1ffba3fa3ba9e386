//! Block forging.
//!
//! A forged block carries the pool transactions followed by one network
//! reward transaction paying the forger, and is signed through a
//! [`BlockSigner`].

use atlas_core::constants::{
    BLOCK_REWARD_MEMO, MIN_FORGING_STAKE, NETWORK_REWARD_SIGNATURE, NETWORK_SENDER,
};
use atlas_core::error::ConsensusError;
use atlas_core::traits::BlockSigner;
use atlas_core::types::{Block, Hash256, Transaction};
use tracing::info;

use crate::engine::ConsensusManager;

/// The protocol-issued transaction paying `amount` to `validator`.
pub fn reward_transaction(validator: &str, amount: i64, timestamp: i64) -> Transaction {
    let mut tx = Transaction::transfer(NETWORK_SENDER, validator, amount, 0, 0, timestamp);
    tx.memo = BLOCK_REWARD_MEMO.to_string();
    tx.signature = NETWORK_REWARD_SIGNATURE.to_vec();
    tx
}

/// Build and sign the block following `last`.
///
/// # Errors
///
/// [`ConsensusError::ValidatorNotFound`] if the signer is not registered,
/// [`ConsensusError::StakeTooLow`] if its stake is below the forging
/// minimum.
pub fn forge_block(
    signer: &dyn BlockSigner,
    last: &Block,
    mut transactions: Vec<Transaction>,
    consensus: &ConsensusManager,
    timestamp: i64,
) -> Result<Block, ConsensusError> {
    let address = signer.address();
    let validator = consensus.get_validator_info(&address)?;
    if validator.stake < MIN_FORGING_STAKE {
        return Err(ConsensusError::StakeTooLow {
            amount: validator.stake,
            minimum: MIN_FORGING_STAKE,
        });
    }

    transactions.push(reward_transaction(
        &address,
        consensus.params().block_reward,
        timestamp,
    ));

    let mut block = Block {
        index: last.index + 1,
        timestamp,
        transactions,
        prev_hash: last.hash,
        validator: address,
        validator_key: signer.public_key(),
        signature: Vec::new(),
        hash: Hash256::ZERO,
    };
    block.signature = signer.sign(block.signing_hash().as_bytes());
    let block = block.seal();

    info!(
        height = block.index,
        validator = %block.validator,
        txs = block.transactions.len(),
        "forged block"
    );
    Ok(block)
}
