//! # atlas-core
//! Foundation types, ledger, and transaction pool for the Atlas protocol.

pub mod chain_state;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod genesis;
pub mod governance;
pub mod mempool;
pub mod params;
pub mod snapshot;
pub mod state;
pub mod traits;
pub mod types;
pub mod validation;
