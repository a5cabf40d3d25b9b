//! The `ClaimTrie` orchestrator (spec §4.6): public API that drives all
//! repos and the trie forward or backward one block at a time, enforcing
//! that persisted roots always match the recomputed Merkle root.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::block_repo::BlockRepo;
use crate::config::{ClaimTrieConfig, Params};
use crate::error::{ClaimTrieError, Result};
use crate::kv::{KvBatch, KvStore, RocksKvStore};
use crate::merkle_trie::{empty_root, MerkleTrie, NodeLookup, PersistentMerkleTrie, RamMerkleTrie};
use crate::metrics;
use crate::node::Node;
use crate::node_manager::{NodeManager, NormalizingNodeManager};
use crate::telemetry::global_log_once;
use crate::types::{Change, ChangeType, ClaimId, Outpoint};

/// Height-indexed, append-only, rewindable authenticated structure over
/// named claims. Single-writer: mutating calls must be serialized by the
/// caller (spec §5).
pub struct ClaimTrie<K: KvStore> {
    kv: Arc<K>,
    block_repo: BlockRepo<K>,
    temporal_repo: crate::temporal_repo::TemporalRepo<K>,
    node_mgr: NormalizingNodeManager<K>,
    trie: Box<dyn MerkleTrie + Send>,
    height: i32,
    params: Params,
    cleanups: Vec<Box<dyn FnMut() -> Result<()> + Send>>,
}

impl ClaimTrie<RocksKvStore> {
    /// Open (or create) the on-disk store at `config.db_path`.
    pub fn open(config: &ClaimTrieConfig) -> Result<Self> {
        let kv = Arc::new(RocksKvStore::open(std::path::Path::new(&config.db_path))?);
        Self::with_store(kv, config)
    }
}

impl<K: KvStore + 'static> ClaimTrie<K> {
    /// Construct over an already-open store. Exposed generically so tests
    /// can pass a [`crate::kv::MemoryKvStore`].
    pub fn with_store(kv: Arc<K>, config: &ClaimTrieConfig) -> Result<Self> {
        let params = Params::for_network(config.network);
        let block_repo = BlockRepo::new(kv.clone());
        let temporal_repo = crate::temporal_repo::TemporalRepo::new(kv.clone());
        let last_height = block_repo.last_height()?;

        let base_mgr = NodeManager::new(kv.clone(), last_height, params);
        let node_mgr = NormalizingNodeManager::new(base_mgr, params.normalization_fork_height);

        let trie: Box<dyn MerkleTrie + Send> = if config.use_persistent_trie {
            Box::new(PersistentMerkleTrie::open(kv.clone())?)
        } else {
            Box::new(RamMerkleTrie::new())
        };

        let mut claimtrie = Self {
            kv,
            block_repo,
            temporal_repo,
            node_mgr,
            trie,
            height: last_height,
            params,
            cleanups: Vec::new(),
        };

        if last_height > 0 {
            claimtrie.replay_to_current_height()?;
        }

        Ok(claimtrie)
    }

    /// Re-derive the in-memory trie from the node manager's change log and
    /// verify it against the persisted root for `self.height`.
    ///
    /// `advance_to` alone cannot repopulate the trie on a fresh process: its
    /// contract only reports names with a buffered change or an
    /// already-cached `next_update_height`, and both are empty immediately
    /// after a restart. So startup instead clears the trie with
    /// `set_root(.., None)` and then walks every known name once, mirroring
    /// the one-time fork-sweep's repopulation loop.
    fn replay_to_current_height(&mut self) -> Result<()> {
        let persisted = self.block_repo.get(self.height)?.unwrap_or_else(empty_root);
        self.trie.set_root(persisted, None);

        let names = self.node_mgr.iterate_names(&[])?;
        for name in &names {
            self.trie.update(name, true);
        }

        let recomputed = self.compute_root()?;
        if recomputed != persisted {
            return Err(ClaimTrieError::InconsistentState { height: self.height, expected: persisted, actual: recomputed });
        }
        Ok(())
    }

    fn compute_root(&mut self) -> Result<[u8; 32]> {
        let _timer = metrics::TRIE_RECOMPUTE_SECONDS.start_timer();
        if self.height >= self.params.all_claims_in_merkle_fork_height {
            self.trie.merkle_hash_all_claims(&self.node_mgr, self.height, &self.params)
        } else {
            self.trie.merkle_hash(&self.node_mgr, self.height, &self.params)
        }
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn node(&self, name: &[u8]) -> Result<Node> {
        self.node_mgr.node_at(name)
    }

    pub fn merkle_hash(&mut self) -> Result<[u8; 32]> {
        self.compute_root()
    }

    fn submit(&self, name: &[u8], kind: ChangeType, outpoint: Outpoint, claim_id: ClaimId, amount: i64) {
        self.node_mgr.append_change(
            name,
            Change { height: 0, name: name.to_vec(), kind, outpoint, claim_id, amount },
        );
    }

    pub fn add_claim(&self, name: &[u8], outpoint: Outpoint, claim_id: ClaimId, amount: i64) {
        self.submit(name, ChangeType::AddClaim, outpoint, claim_id, amount);
    }

    pub fn update_claim(&self, name: &[u8], outpoint: Outpoint, claim_id: ClaimId, amount: i64) {
        self.submit(name, ChangeType::UpdateClaim, outpoint, claim_id, amount);
    }

    pub fn spend_claim(&self, name: &[u8], outpoint: Outpoint, claim_id: ClaimId) {
        self.submit(name, ChangeType::SpendClaim, outpoint, claim_id, 0);
    }

    pub fn add_support(&self, name: &[u8], outpoint: Outpoint, supported_claim_id: ClaimId, amount: i64) {
        self.submit(name, ChangeType::AddSupport, outpoint, supported_claim_id, amount);
    }

    pub fn spend_support(&self, name: &[u8], outpoint: Outpoint, supported_claim_id: ClaimId) {
        self.submit(name, ChangeType::SpendSupport, outpoint, supported_claim_id, 0);
    }

    /// Advance by exactly one block, per spec §4.6's eleven steps.
    pub fn append_block(&mut self) -> Result<[u8; 32]> {
        self.height += 1;
        let height = self.height;

        let mut batch = KvBatch::new();
        let touched = self.node_mgr.advance_to(&mut batch, height)?;
        let expiring = self.temporal_repo.nodes_at(height)?;

        if !touched.is_empty() {
            let heights = vec![height; touched.len()];
            self.temporal_repo.set_nodes_at(&mut batch, &touched, &heights);
        }

        let mut all: BTreeSet<Vec<u8>> = touched.into_iter().collect();
        all.extend(expiring);
        let all: Vec<Vec<u8>> = all.into_iter().collect();

        for name in &all {
            self.trie.update(name, true);
            metrics::NAMES_TOUCHED.inc();
            let (canonical, next_h) = self.node_mgr.next_update_height_of(name)?;
            if next_h > 0 {
                self.temporal_repo.set_nodes_at(&mut batch, &[canonical], &[next_h]);
            }
        }

        self.kv.write_batch(batch)?;

        let fork_sweep = height == self.params.all_claims_in_merkle_fork_height;
        if fork_sweep {
            info!(height, "running hash fork sweep");
            if global_log_once().should_log("fork-sweep") {
                warn!("all-claims-in-merkle fork reached; every name revisited once");
            }
            metrics::FORK_SWEEPS.inc();
            for name in self.node_mgr.iterate_names(&[])? {
                self.trie.update(&name, true);
            }
        }

        let root = self.compute_root()?;
        self.block_repo.set(height, root)?;

        if fork_sweep {
            self.trie.set_root(root, Some(&all));
        }

        metrics::BLOCKS_APPENDED.inc();
        metrics::CLAIMTRIE_HEIGHT.set(height as i64);

        Ok(root)
    }

    /// Rewind to `target`, undoing every block after it.
    pub fn reset_height(&mut self, target: i32) -> Result<()> {
        let old_height = self.height;
        let mut union: BTreeSet<Vec<u8>> = BTreeSet::new();
        for h in (target + 1)..=old_height {
            union.extend(self.temporal_repo.nodes_at(h)?);
        }
        let union: Vec<Vec<u8>> = union.into_iter().collect();

        let mut batch = KvBatch::new();
        self.node_mgr.rewind_to(&mut batch, &union, target);
        self.temporal_repo.rewind(&mut batch, target);
        self.block_repo.rewind(&mut batch, target);
        self.kv.write_batch(batch)?;

        self.height = target;

        let persisted = self.block_repo.get(target)?.unwrap_or_else(empty_root);
        let crossed_fork_downward =
            target < self.params.all_claims_in_merkle_fork_height && old_height >= self.params.all_claims_in_merkle_fork_height;

        if crossed_fork_downward {
            self.trie.set_root(persisted, None);
            for name in self.node_mgr.iterate_names(&[])? {
                self.trie.update(&name, true);
            }
        } else {
            self.trie.set_root(persisted, Some(&union));
        }

        let recomputed = self.compute_root()?;
        if recomputed != persisted {
            return Err(ClaimTrieError::InconsistentState { height: target, expected: persisted, actual: recomputed });
        }

        metrics::REWINDS.inc();
        metrics::CLAIMTRIE_HEIGHT.set(target as i64);
        Ok(())
    }

    /// Register a cleanup to run, in reverse order, on [`Self::close`].
    pub fn on_close<F: FnMut() -> Result<()> + Send + 'static>(&mut self, cleanup: F) {
        self.cleanups.push(Box::new(cleanup));
    }

    /// Flush every repo and the trie; logs per-repo errors rather than
    /// propagating, per spec §4.6.
    pub fn flush_to_disk(&mut self) {
        if let Err(e) = self.kv.flush() {
            warn!(error = %e, "kv flush failed");
        }
        if let Err(e) = self.trie.flush() {
            warn!(error = %e, "trie flush failed");
        }
    }

    /// Run registered cleanups in reverse order; errors are logged, never
    /// propagated, so partial teardown still runs (spec §4.6, §7).
    pub fn close(&mut self) {
        self.flush_to_disk();
        if let Err(e) = self.trie.close() {
            warn!(error = %e, "trie close failed");
        }
        while let Some(mut cleanup) = self.cleanups.pop() {
            if let Err(e) = cleanup() {
                warn!(error = %e, "cleanup failed during close");
            }
        }
    }
}

impl<K: KvStore> Drop for ClaimTrie<K> {
    fn drop(&mut self) {
        if let Err(e) = self.kv.flush() {
            warn!(error = %e, "kv flush failed during drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use crate::kv::MemoryKvStore;

    fn config() -> ClaimTrieConfig {
        ClaimTrieConfig { network: Network::Regtest, db_path: String::new(), use_persistent_trie: false }
    }

    fn outpoint(byte: u8) -> Outpoint {
        Outpoint::new([byte; 32], 0)
    }

    #[test]
    fn empty_trie_append_block_yields_canonical_empty_root() {
        let mut trie = ClaimTrie::with_store(Arc::new(MemoryKvStore::new()), &config()).unwrap();
        let root = trie.append_block().unwrap();
        assert_eq!(root, empty_root());
        assert_eq!(trie.height(), 1);
    }

    #[test]
    fn single_claim_becomes_controller_after_append() {
        let mut trie = ClaimTrie::with_store(Arc::new(MemoryKvStore::new()), &config()).unwrap();
        let id = ClaimId([7u8; 20]);
        trie.add_claim(b"hello", outpoint(1), id, 100);
        trie.append_block().unwrap();

        let node = trie.node(b"hello").unwrap();
        assert_eq!(node.controller, Some(id));
        assert_eq!(node.takeover_height, 1);
    }

    #[test]
    fn same_height_tie_breaks_on_smaller_outpoint() {
        let mut trie = ClaimTrie::with_store(Arc::new(MemoryKvStore::new()), &config()).unwrap();
        let id1 = ClaimId([1u8; 20]);
        let id2 = ClaimId([2u8; 20]);
        trie.add_claim(b"x", outpoint(1), id1, 50);
        trie.add_claim(b"x", outpoint(2), id2, 50);
        trie.append_block().unwrap();

        assert_eq!(trie.node(b"x").unwrap().controller, Some(id1));
    }

    #[test]
    fn append_then_reset_height_restores_prior_root() {
        let mut trie = ClaimTrie::with_store(Arc::new(MemoryKvStore::new()), &config()).unwrap();
        let id = ClaimId([7u8; 20]);

        trie.append_block().unwrap(); // height 1, empty
        let root_at_1 = trie.merkle_hash().unwrap();

        trie.add_claim(b"hello", outpoint(1), id, 100);
        trie.append_block().unwrap(); // height 2

        trie.reset_height(1).unwrap();
        assert_eq!(trie.height(), 1);
        assert_eq!(trie.merkle_hash().unwrap(), root_at_1);
    }

    #[test]
    fn round_trip_append_reset_append_matches_original_root() {
        let mut trie = ClaimTrie::with_store(Arc::new(MemoryKvStore::new()), &config()).unwrap();
        let id = ClaimId([3u8; 20]);

        trie.append_block().unwrap(); // height 1
        trie.add_claim(b"n", outpoint(5), id, 10);
        let root_original = trie.append_block().unwrap(); // height 2

        trie.reset_height(1).unwrap();
        trie.add_claim(b"n", outpoint(5), id, 10);
        let root_replayed = trie.append_block().unwrap();

        assert_eq!(root_original, root_replayed);
    }

    #[test]
    fn delayed_activation_matches_scenario_across_blocks() {
        let mut trie = ClaimTrie::with_store(Arc::new(MemoryKvStore::new()), &config()).unwrap();
        let id1 = ClaimId([1u8; 20]);
        let id2 = ClaimId([2u8; 20]);

        trie.add_claim(b"n", outpoint(1), id1, 100);
        trie.append_block().unwrap(); // height 1

        for _ in 0..99 {
            trie.append_block().unwrap();
        }
        // height now 100; next block (101) adds the contender.
        trie.add_claim(b"n", outpoint(2), id2, 200);
        trie.append_block().unwrap(); // height 101

        for _ in 0..2 {
            trie.append_block().unwrap();
        }
        // height 103: still id1.
        assert_eq!(trie.node(b"n").unwrap().controller, Some(id1));

        trie.append_block().unwrap(); // height 104
        assert_eq!(trie.node(b"n").unwrap().controller, Some(id2));
    }
}
