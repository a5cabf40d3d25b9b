//! Per-network consensus parameters and crate configuration.
//!
//! Loaded the way `rustyblox`'s own `config.rs` loads `config.toml`, with
//! hardcoded per-network defaults so the crate runs in tests without a file
//! on disk.

use std::error::Error;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Regtest,
    Simnet,
}

/// Consensus-critical constants (spec §6 "Parameters").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Params {
    pub original_claim_expiration: i32,
    pub extended_claim_expiration: i32,
    pub extended_claim_expiration_fork_height: i32,
    pub max_removal_workaround_height: i32,
    pub all_claims_in_merkle_fork_height: i32,
    pub normalization_fork_height: i32,
    pub activation_delay_divisor: i32,
    pub max_activation_delay: i32,
}

impl Params {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Params {
                original_claim_expiration: 262_974,
                extended_claim_expiration: 2_102_400,
                extended_claim_expiration_fork_height: 400_155,
                max_removal_workaround_height: 658_300,
                all_claims_in_merkle_fork_height: 658_300,
                normalization_fork_height: 539_940,
                activation_delay_divisor: 32,
                max_activation_delay: 4032,
            },
            Network::Regtest => Params {
                original_claim_expiration: 500,
                extended_claim_expiration: 600,
                extended_claim_expiration_fork_height: 400,
                max_removal_workaround_height: 100,
                all_claims_in_merkle_fork_height: 300,
                normalization_fork_height: 250,
                activation_delay_divisor: 32,
                max_activation_delay: 4032,
            },
            Network::Simnet => Params {
                original_claim_expiration: 500,
                extended_claim_expiration: 600,
                extended_claim_expiration_fork_height: 400,
                max_removal_workaround_height: 100,
                all_claims_in_merkle_fork_height: 300,
                normalization_fork_height: 250,
                activation_delay_divisor: 32,
                max_activation_delay: 4032,
            },
        }
    }

    /// Expiration window for an entry accepted at `accepted_height`, per
    /// spec §4.3 step 1.
    pub fn expiration_at(&self, accepted_height: i32) -> i32 {
        if accepted_height < self.extended_claim_expiration_fork_height {
            self.original_claim_expiration
        } else {
            self.extended_claim_expiration
        }
    }
}

/// Crate-level configuration: which network's params to use, and where the
/// KV store lives on disk.
#[derive(Debug, Clone)]
pub struct ClaimTrieConfig {
    pub network: Network,
    pub db_path: String,
    pub use_persistent_trie: bool,
}

impl Default for ClaimTrieConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            db_path: "claimtrie-data".to_string(),
            use_persistent_trie: true,
        }
    }
}

/// Load configuration from `config.toml`, falling back to defaults for any
/// field that is absent. Mirrors `rustyblox::load_config`'s layering.
pub fn load_config(path: &str) -> Result<ClaimTrieConfig, Box<dyn Error>> {
    let raw = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .build()?;

    let network = match raw.get_string("claimtrie.network").unwrap_or_else(|_| "mainnet".into()).as_str() {
        "regtest" => Network::Regtest,
        "simnet" => Network::Simnet,
        _ => Network::Mainnet,
    };
    let db_path = raw
        .get_string("claimtrie.db_path")
        .unwrap_or_else(|_| "claimtrie-data".to_string());
    let use_persistent_trie = raw.get_bool("claimtrie.persistent_trie").unwrap_or(true);

    Ok(ClaimTrieConfig { network, db_path, use_persistent_trie })
}
