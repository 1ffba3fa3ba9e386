//! # atlas-consensus: Proof-of-stake validator management and finality.
//!
//! The [`ConsensusManager`] owns the validator registry: KYC registration,
//! delegation, weighted-random producer selection, rewards, slashing and
//! rotation. It tracks block confirmations toward finality and implements
//! the ledger's [`StakeHook`](atlas_core::traits::StakeHook) so on-chain
//! stake transactions register validators.
//!
//! [`forge_block`] builds and signs the next block for a selected validator.

pub mod engine;
pub mod finality;
pub mod forge;
pub mod validator;

pub use engine::ConsensusManager;
pub use finality::FinalityTracker;
pub use forge::{forge_block, reward_transaction};
pub use validator::{KycInfo, Validator};
