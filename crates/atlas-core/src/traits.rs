//! Trait interfaces for the Atlas protocol.
//!
//! These traits define the seams between crates and external collaborators:
//! - [`AccountStore`]: persistent account storage (primary tier of the ledger)
//! - [`ContractExecutor`]: smart-contract VM for Deploy/Call transactions
//! - [`StakeHook`]: validator registration on stake transactions (atlas-consensus implements)
//! - [`SignatureVerifier`] / [`BlockSigner`]: signing collaborators ([`crate::crypto`] implements)
//! - [`ChainAccess`]: chain reads plus the shared block-import path (atlas-node implements)

use crate::error::{AtlasError, CryptoError, StateError, TransactionError, VmError};
use crate::types::{Account, Block, CallPayload, DeployPayload, Hash256};

/// Persistent account storage.
///
/// The ledger consults the store first and falls back to its in-memory map
/// when the store errors or has no record.
pub trait AccountStore: Send + Sync {
    /// Look up an account. `Ok(None)` if the store has no record.
    fn get_account(&self, address: &str) -> Result<Option<Account>, StateError>;

    /// Insert or replace an account.
    fn set_account(&self, account: &Account) -> Result<(), StateError>;
}

/// Result of one contract execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Address of a newly deployed contract, if any.
    pub contract_address: Option<String>,
    pub gas_used: u64,
}

/// Opaque smart-contract virtual machine.
///
/// Any error aborts the enclosing block.
#[cfg_attr(test, mockall::automock)]
pub trait ContractExecutor: Send + Sync {
    /// Deploy a contract on behalf of `sender`.
    fn deploy(&self, sender: &str, payload: &DeployPayload) -> Result<ExecutionOutcome, VmError>;

    /// Call `payload.function` on the contract at `contract`.
    ///
    /// `value` is the transferred amount and `gas_limit` the transaction fee.
    fn call(
        &self,
        sender: &str,
        contract: &str,
        payload: &CallPayload,
        value: i64,
        gas_limit: u64,
    ) -> Result<ExecutionOutcome, VmError>;
}

/// A VM that rejects every contract transaction.
///
/// Used when the node runs without a contract engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledExecutor;

impl ContractExecutor for DisabledExecutor {
    fn deploy(&self, _sender: &str, _payload: &DeployPayload) -> Result<ExecutionOutcome, VmError> {
        Err(VmError::Unavailable)
    }

    fn call(
        &self,
        _sender: &str,
        _contract: &str,
        _payload: &CallPayload,
        _value: i64,
        _gas_limit: u64,
    ) -> Result<ExecutionOutcome, VmError> {
        Err(VmError::Unavailable)
    }
}

/// Receives on-chain stake events from the ledger.
///
/// `check_stakes` runs before the block is staged and may veto it;
/// `on_chain_stake` runs once the block has been committed.
pub trait StakeHook: Send + Sync {
    /// Validate every stake in a block, in block order, without mutating
    /// anything. Later stakes must see the validators earlier ones would
    /// add. On rejection returns the position in `stakes` of the first
    /// stake refused.
    fn check_stakes(&self, stakes: &[(&str, u64)]) -> Result<(), (usize, TransactionError)>;

    /// Register `address` as a validator, or add `amount` to its stake.
    fn on_chain_stake(&self, address: &str, amount: u64) -> Result<(), TransactionError>;
}

/// Signature verification for transactions and blocks.
pub trait SignatureVerifier: Send + Sync {
    fn verify_transaction(&self, tx: &crate::types::Transaction) -> Result<(), CryptoError>;

    /// Verify the block signature and every transaction signature.
    fn verify_block(&self, block: &Block) -> Result<(), CryptoError>;
}

/// A validator identity able to sign blocks.
pub trait BlockSigner: Send + Sync {
    /// Address the signer forges blocks as.
    fn address(&self) -> String;

    /// Raw public key bytes placed in the block.
    fn public_key(&self) -> Vec<u8>;

    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// Chain reads plus the block-import path used by both local production
/// and peer sync.
///
/// Implemented by the node, which routes imports through consensus
/// validation and the ledger's state transition.
pub trait ChainAccess: Send + Sync {
    /// Index of the current tip.
    fn height(&self) -> u64;

    /// The current tip.
    fn latest_block(&self) -> Block;

    fn block_by_index(&self, index: u64) -> Option<Block>;

    fn block_by_hash(&self, hash: &Hash256) -> Option<Block>;

    /// Hash of block 0.
    fn genesis_hash(&self) -> Hash256;

    /// Validate and apply `block` on top of the tip.
    fn import_block(&self, block: Block) -> Result<(), AtlasError>;
}
