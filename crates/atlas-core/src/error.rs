//! Error types for the Atlas protocol.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("empty sender")] EmptySender,
    #[error("empty recipient")] EmptyRecipient,
    #[error("amount must be positive: {0}")] NonPositiveAmount(i64),
    #[error("fee must not be negative: {0}")] NegativeFee(i64),
    #[error("missing signature")] MissingSignature,
    #[error("missing sender public key")] MissingPublicKey,
    #[error("invalid address: {0}")] InvalidAddress(String),
    #[error("insufficient funds for {address}: have {have}, need {need}")] InsufficientFunds { address: String, have: i64, need: i64 },
    #[error("invalid nonce for {address}: expected {expected}, got {got}")] InvalidNonce { address: String, expected: u64, got: u64 },
    #[error("stake amount too low: {amount} (min: {minimum})")] StakeTooLow { amount: i64, minimum: u64 },
    #[error("network sender cannot stake")] NetworkCannotStake,
    #[error("invalid payload: {0}")] InvalidPayload(String),
    #[error("governance: {0}")] Governance(String),
    #[error("contract execution failed: {0}")] Contract(String),
    #[error("invalid signature")] InvalidSignature,
    #[error("arithmetic overflow")] Overflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("invalid index: expected {expected}, got {got}")] InvalidIndex { expected: u64, got: u64 },
    #[error("prev hash does not match tip")] InvalidPrevHash,
    #[error("block hash does not match contents")] HashMismatch,
    #[error("block hash is empty")] EmptyHash,
    #[error("timestamp in the future: {0}")] TimestampInFuture(i64),
    #[error("parent block {0} is not finalized")] ParentNotFinalized(String),
    #[error("oversized: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("invalid block signature")] InvalidSignature,
    #[error("invalid block reward: {0}")] InvalidReward(String),
    #[error("tx error in {index}: {source}")] Transaction { index: usize, source: TransactionError },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("snapshot checksum mismatch: {0}")] SnapshotCorrupt(String),
    #[error("state corrupt: no valid snapshot to recover from")] StateCorrupt,
    #[error("no snapshot found")] NoSnapshot,
    #[error("snapshots are not configured")] SnapshotsDisabled,
    #[error("io: {0}")] Io(String),
    #[error("serialization: {0}")] Serialization(String),
    #[error("account store: {0}")] Store(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("pool full and transaction priority does not exceed the lowest entry")] PoolFull,
    #[error(transparent)] Invalid(#[from] TransactionError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("no validators available")] NoValidators,
    #[error("validator not found: {0}")] ValidatorNotFound(String),
    #[error("validator already registered: {0}")] AlreadyRegistered(String),
    #[error("KYC verification required for validator registration")] KycRequired,
    #[error("insufficient balance for {address}: have {have}, need {need}")] InsufficientBalance { address: String, have: i64, need: i64 },
    #[error("stake amount too low: {amount} (min: {minimum})")] StakeTooLow { amount: u64, minimum: u64 },
    #[error("validator set is full ({0})")] TooManyValidators(usize),
    #[error("no delegation from {delegator} to {validator}")] DelegationNotFound { delegator: String, validator: String },
    #[error("amount must be positive: {0}")] InvalidAmount(i64),
    #[error("invalid validator: {0}")] InvalidValidator(String),
    #[error("failed to select validator")] SelectionFailed,
    #[error(transparent)] Block(#[from] BlockError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("send to {peer} failed: {reason}")] SendFailed { peer: String, reason: String },
    #[error("unknown peer: {0}")] UnknownPeer(String),
    #[error("message too large: {size}")] MessageTooLarge { size: usize },
    #[error("encode: {0}")] Encode(String),
    #[error("decode: {0}")] Decode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync already in progress")] AlreadySyncing,
    #[error("no peers available")] NoPeers,
    #[error("request {0} timed out")] Timeout(String),
    #[error("request {0} cancelled")] Cancelled(String),
    #[error("all peers failed to serve blocks {from}..={to}")] AllPeersFailed { from: u64, to: u64 },
    #[error("peer error: {0}")] Peer(String),
    #[error("unexpected response to {0}")] UnexpectedResponse(String),
    #[error("block {index} rejected: {source}")] Validation { index: u64, source: BlockError },
    #[error("block import failed: {0}")] Import(String),
    #[error(transparent)] Network(#[from] NetworkError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("public key does not derive address {0}")] AddressMismatch(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("contract execution unavailable")] Unavailable,
    #[error("contract not found: {0}")] ContractNotFound(String),
    #[error("execution failed: {0}")] ExecutionFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AtlasError {
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] State(#[from] StateError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] Consensus(#[from] ConsensusError),
    #[error(transparent)] Network(#[from] NetworkError),
    #[error(transparent)] Sync(#[from] SyncError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Vm(#[from] VmError),
    #[error("config: {0}")] Config(String),
}

impl From<std::io::Error> for StateError {
    fn from(e: std::io::Error) -> Self {
        StateError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_error_names_failing_transaction() {
        let err = BlockError::Transaction {
            index: 2,
            source: TransactionError::InvalidNonce {
                address: "0xabc".into(),
                expected: 1,
                got: 3,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("tx error in 2"));
        assert!(msg.contains("expected 1, got 3"));
    }

    #[test]
    fn umbrella_is_transparent() {
        let err: AtlasError = StateError::StateCorrupt.into();
        assert_eq!(err.to_string(), StateError::StateCorrupt.to_string());
    }

    #[test]
    fn io_error_converts_to_state_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StateError = io.into();
        assert!(matches!(err, StateError::Io(ref m) if m.contains("gone")));
    }
}
