//! Protocol constants and default chain parameters.
//!
//! Monetary values are whole units held in signed 64-bit integers, matching
//! the account model where a balance may only go negative transiently while
//! a transaction is being checked.

/// Sender used by protocol-issued transactions (block rewards).
///
/// Transactions from this sender bypass balance and nonce checks.
pub const NETWORK_SENDER: &str = "network";

/// Validator recorded on the genesis block. Fees are never credited to it.
pub const GENESIS_VALIDATOR: &str = "GENESIS_VALIDATOR";

/// Signature bytes carried by the genesis block.
pub const GENESIS_SIGNATURE: &[u8] = b"GENESIS_SIGNATURE";

/// Signature bytes carried by network reward transactions.
pub const NETWORK_REWARD_SIGNATURE: &[u8] = b"NETWORK_REWARD_SIGNATURE";

/// Genesis block timestamp (2022-01-01T00:00:00Z).
pub const GENESIS_TIMESTAMP: i64 = 1_640_995_200;

/// Memo attached to block reward transactions.
pub const BLOCK_REWARD_MEMO: &str = "block reward";

/// Minimum validator stake required to forge a block.
pub const MIN_FORGING_STAKE: u64 = 1;

/// Four-byte network identifier prepended to every wire message ("ATLS").
pub const MAGIC_BYTES: [u8; 4] = [0x41, 0x54, 0x4C, 0x53];

/// Length of an address body in hex characters (20 bytes).
pub const ADDRESS_HEX_LEN: usize = 40;

// --- Block and pool limits -------------------------------------------------

/// Maximum number of transactions per block.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 1_000;

/// Maximum number of transactions held in the pool.
pub const DEFAULT_MAX_TX_POOL_SIZE: usize = 5_000;

/// Age after which a pooled transaction is swept (24 hours).
pub const DEFAULT_TX_EXPIRATION_SECS: u64 = 24 * 60 * 60;

/// Target interval between blocks.
pub const DEFAULT_BLOCK_TIME_SECS: u64 = 30;

// --- Consensus -------------------------------------------------------------

/// Minimum amount accepted by an on-chain stake transaction.
pub const DEFAULT_MIN_STAKE: u64 = 100;

/// Fixed reward paid to the forging validator.
pub const DEFAULT_BLOCK_REWARD: i64 = 10;

/// Number of blocks between validator rotations.
pub const DEFAULT_VALIDATOR_ROTATION: u64 = 100;

/// Upper bound on the size of the validator set.
pub const DEFAULT_MAX_VALIDATORS: usize = 100;

/// Slashing events after which a validator is removed.
pub const DEFAULT_SLASHING_THRESHOLD: usize = 3;

/// Confirmations required before a block is final.
pub const DEFAULT_FINALITY_THRESHOLD: u32 = 1;

/// Finalized confirmation records older than this are garbage-collected.
pub const DEFAULT_CONFIRMATION_WINDOW_SECS: u64 = 10 * 60;

/// Maximum entries kept in a validator's performance history.
pub const MAX_PERFORMANCE_HISTORY: usize = 100;

// --- Snapshots -------------------------------------------------------------

/// Number of snapshot files retained on disk.
pub const DEFAULT_SNAPSHOT_RETENTION: usize = 5;

/// Interval of the periodic snapshot task.
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 5 * 60;

/// Minimum time between snapshots taken automatically after a block.
pub const DEFAULT_APPLY_SNAPSHOT_INTERVAL_SECS: u64 = 60 * 60;
