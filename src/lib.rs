//! A height-indexed, append-only, rewindable authenticated data structure
//! for named claims and their supports over a UTXO-based blockchain.
//!
//! The public entry point is [`claimtrie::ClaimTrie`]; see its docs for the
//! block-append/rewind lifecycle.

pub mod block_repo;
pub mod claimtrie;
pub mod config;
pub mod error;
#[cfg(test)]
mod fork_sweep_tests;
pub mod kv;
pub mod merkle_trie;
pub mod metrics;
pub mod name;
pub mod node;
pub mod node_manager;
pub mod node_repo;
pub mod telemetry;
pub mod temporal_repo;
pub mod types;

pub use claimtrie::ClaimTrie;
pub use config::{ClaimTrieConfig, Network, Params};
pub use error::{ClaimTrieError, Result};
pub use types::{Change, ChangeType, Claim, ClaimId, Outpoint, Support};
