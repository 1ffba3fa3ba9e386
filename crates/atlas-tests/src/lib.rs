//! Cross-crate test suite for Atlas.
//!
//! Integration tests that drive the ledger, pool, consensus manager and sync
//! manager together through the node, plus property tests for the protocol
//! invariants.

pub mod helpers;
