//! Structural validation of transactions and block linkage.
//!
//! These checks need no ledger state. Balance and nonce checks happen in
//! the pool (nonce) and the ledger's state transition (both).

use crate::constants::NETWORK_SENDER;
use crate::crypto::is_valid_address;
use crate::error::{BlockError, TransactionError};
use crate::types::{Block, Transaction};

/// Context-free checks on a single transaction.
///
/// Rejects empty parties, non-positive amounts, negative fees, missing
/// signatures, a missing public key on user transactions, and malformed
/// addresses. The `network` sender is exempt from the key and address rules.
pub fn validate_transaction(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.sender.is_empty() {
        return Err(TransactionError::EmptySender);
    }
    if tx.recipient.is_empty() {
        return Err(TransactionError::EmptyRecipient);
    }
    if tx.amount <= 0 {
        return Err(TransactionError::NonPositiveAmount(tx.amount));
    }
    if tx.fee < 0 {
        return Err(TransactionError::NegativeFee(tx.fee));
    }
    if tx.total_debit().is_none() {
        return Err(TransactionError::Overflow);
    }
    if tx.signature.is_empty() {
        return Err(TransactionError::MissingSignature);
    }
    if tx.sender != NETWORK_SENDER {
        if tx.sender_public_key.is_empty() {
            return Err(TransactionError::MissingPublicKey);
        }
        if !is_valid_address(&tx.sender) {
            return Err(TransactionError::InvalidAddress(tx.sender.clone()));
        }
    }
    if !is_valid_address(&tx.recipient) {
        return Err(TransactionError::InvalidAddress(tx.recipient.clone()));
    }
    Ok(())
}

/// Check that `block` extends `tip`: consecutive index, matching parent
/// hash, and a hash that recomputes from the block's own fields.
pub fn validate_successor(block: &Block, tip: &Block) -> Result<(), BlockError> {
    let expected = tip.index + 1;
    if block.index != expected {
        return Err(BlockError::InvalidIndex {
            expected,
            got: block.index,
        });
    }
    if block.prev_hash != tip.hash {
        return Err(BlockError::InvalidPrevHash);
    }
    if block.hash != block.calculate_hash() {
        return Err(BlockError::HashMismatch);
    }
    Ok(())
}

/// Reject blocks carrying more than `max` transactions.
pub fn validate_block_size(block: &Block, max: usize) -> Result<(), BlockError> {
    let size = block.transactions.len();
    if size > max {
        return Err(BlockError::Oversized { size, max });
    }
    Ok(())
}
