//! Merkle trie (spec §4.5): radix tree over names, dirty-marking, and
//! incremental hash recomputation under the two consensus hash schemes.
//!
//! Two variants share the `MerkleTrie` capability set: [`RamMerkleTrie`]
//! (rebuilt from the node manager on startup) and [`PersistentMerkleTrie`]
//! (backed by KV, each node stored under its byte-prefix key).

use std::collections::BTreeMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::config::Params;
use crate::error::Result;
use crate::kv::{KvBatch, KvStore, CF_TRIE};
use crate::node::Node;
use crate::types::{Claim, Outpoint, Support};

/// Anything that can produce the [`Node`] for a name, implemented by both
/// `NodeManager` and `NormalizingNodeManager` so the trie never depends on
/// which wrapper the orchestrator is using.
pub trait NodeLookup: Send + Sync {
    fn node_at(&self, name: &[u8]) -> Result<Node>;
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn encode_outpoint(outpoint: &Outpoint) -> Vec<u8> {
    let mut buf = Vec::with_capacity(Outpoint::SERIALIZED_LEN);
    outpoint.write(&mut buf);
    buf
}

/// Pairwise binary Merkle reduction over leaf hashes; an odd leaf at any
/// level carries up unchanged. The empty list hashes to `SHA256("")`.
fn merkle_root_of(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return sha256(&[]);
    }
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut i = 0;
        while i < level.len() {
            if i + 1 < level.len() {
                let mut buf = Vec::with_capacity(64);
                buf.extend_from_slice(&level[i]);
                buf.extend_from_slice(&level[i + 1]);
                next.push(sha256(&buf));
            } else {
                next.push(level[i]);
            }
            i += 2;
        }
        level = next;
    }
    level[0]
}

/// Pre-fork hash: SHA-256 of the controlling claim's `(outpoint,
/// take-over-height)`; `None` if there is no controller.
fn pre_fork_hash(node: &Node) -> Option<[u8; 32]> {
    let controller_id = node.controller?;
    let claim = node.claims.iter().find(|c| c.claim_id == controller_id)?;
    let mut buf = encode_outpoint(&claim.outpoint);
    buf.extend_from_slice(&node.takeover_height.to_be_bytes());
    Some(sha256(&buf))
}

/// Post-fork hash: Merkle root over every active claim, each contributing
/// `H(H(outpoint) || H(take-over-height) || H(supports-hash))`.
fn post_fork_hash(node: &Node, height: i32, params: &Params) -> Option<[u8; 32]> {
    let mut actives = node.active_claims(height, params);
    if actives.is_empty() {
        return None;
    }
    actives.sort_by_key(|c| c.outpoint);

    let takeover_hash = sha256(&node.takeover_height.to_be_bytes());
    let mut leaves = Vec::with_capacity(actives.len());
    for claim in &actives {
        let mut supports: Vec<Support> = node.active_supports_for(claim.claim_id, height, params);
        supports.sort_by_key(|s| s.outpoint);
        let support_leaves: Vec<[u8; 32]> = supports
            .iter()
            .map(|s| {
                let mut buf = encode_outpoint(&s.outpoint);
                buf.extend_from_slice(&s.amount.to_be_bytes());
                sha256(&buf)
            })
            .collect();
        let supports_hash = merkle_root_of(&support_leaves);

        let outpoint_hash = sha256(&encode_outpoint(&claim.outpoint));
        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(&outpoint_hash);
        buf.extend_from_slice(&takeover_hash);
        buf.extend_from_slice(&supports_hash);
        leaves.push(sha256(&buf));
    }
    Some(merkle_root_of(&leaves))
}

/// One position in the radix tree: an optional leaf hash (this path spells
/// out a full name) plus child edges keyed by the next byte.
#[derive(Debug, Clone, Default)]
struct TrieNode {
    children: BTreeMap<u8, TrieNode>,
    is_terminal: bool,
    leaf_hash: Option<[u8; 32]>,
    dirty: bool,
    cached_subtree_hash: Option<[u8; 32]>,
}

impl TrieNode {
    fn recompute(
        &mut self,
        path: &mut Vec<u8>,
        manager: &dyn NodeLookup,
        height: i32,
        params: &Params,
        all_claims: bool,
    ) -> Result<Option<[u8; 32]>> {
        if !self.dirty {
            return Ok(self.cached_subtree_hash);
        }

        if self.is_terminal && self.leaf_hash.is_none() {
            let node = manager.node_at(path)?;
            self.leaf_hash =
                if all_claims { post_fork_hash(&node, height, params) } else { pre_fork_hash(&node) };
        }

        let mut buf = Vec::new();
        for (&byte, child) in self.children.iter_mut() {
            path.push(byte);
            let child_hash = child.recompute(path, manager, height, params, all_claims)?;
            path.pop();
            if let Some(h) = child_hash {
                buf.push(byte);
                buf.extend_from_slice(&h);
            }
        }
        if let Some(leaf) = self.leaf_hash {
            buf.extend_from_slice(&leaf);
        }

        let result = if buf.is_empty() { None } else { Some(sha256(&buf)) };
        self.cached_subtree_hash = result;
        self.dirty = false;
        Ok(result)
    }

    fn mark_dirty_path(&mut self, name: &[u8], invalidate_leaf: bool) {
        self.dirty = true;
        let mut node = self;
        for &b in name {
            node = node.children.entry(b).or_default();
            node.dirty = true;
        }
        node.is_terminal = true;
        if invalidate_leaf {
            node.leaf_hash = None;
        }
    }

    fn clear(&mut self) {
        *self = TrieNode::default();
    }
}

/// Capability set shared by both trie variants (spec §9: "express as an
/// interface/trait with two implementations").
pub trait MerkleTrie {
    fn update(&mut self, name: &[u8], require_recompute: bool);
    fn merkle_hash(&mut self, manager: &dyn NodeLookup, height: i32, params: &Params) -> Result<[u8; 32]>;
    fn merkle_hash_all_claims(&mut self, manager: &dyn NodeLookup, height: i32, params: &Params) -> Result<[u8; 32]>;
    fn set_root(&mut self, hash: [u8; 32], names: Option<&[Vec<u8>]>);
    fn flush(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// In-memory variant: no persistence, rebuilt from the node manager on
/// startup via repeated `update(name, true)` calls.
#[derive(Default)]
pub struct RamMerkleTrie {
    root: TrieNode,
}

impl RamMerkleTrie {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MerkleTrie for RamMerkleTrie {
    fn update(&mut self, name: &[u8], require_recompute: bool) {
        self.root.mark_dirty_path(name, require_recompute);
    }

    fn merkle_hash(&mut self, manager: &dyn NodeLookup, height: i32, params: &Params) -> Result<[u8; 32]> {
        let mut path = Vec::new();
        Ok(self.root.recompute(&mut path, manager, height, params, false)?.unwrap_or_else(|| sha256(&[])))
    }

    fn merkle_hash_all_claims(&mut self, manager: &dyn NodeLookup, height: i32, params: &Params) -> Result<[u8; 32]> {
        let mut path = Vec::new();
        Ok(self.root.recompute(&mut path, manager, height, params, true)?.unwrap_or_else(|| sha256(&[])))
    }

    fn set_root(&mut self, _hash: [u8; 32], names: Option<&[Vec<u8>]>) {
        match names {
            None => self.root.clear(),
            Some(list) => {
                for name in list {
                    self.root.mark_dirty_path(name, true);
                }
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Persistent variant: each trie node is stored under its raw-name-prefix
/// key (spec §6), as `{child-bitmap, children.., node-hash?}`. Kept fully
/// mirrored in memory for the lifetime of the process; `flush` writes every
/// terminal node back (a simpler, correctness-first alternative to
/// dirty-only persistence — see DESIGN.md).
pub struct PersistentMerkleTrie<K: KvStore> {
    kv: Arc<K>,
    ram: RamMerkleTrie,
}

impl<K: KvStore> PersistentMerkleTrie<K> {
    pub fn open(kv: Arc<K>) -> Result<Self> {
        let mut ram = RamMerkleTrie::new();
        for (key, _value) in kv.iter_prefix(CF_TRIE, &[])? {
            ram.root.mark_dirty_path(&key, true);
        }
        Ok(Self { kv, ram })
    }
}

impl<K: KvStore> MerkleTrie for PersistentMerkleTrie<K> {
    fn update(&mut self, name: &[u8], require_recompute: bool) {
        self.ram.update(name, require_recompute);
    }

    fn merkle_hash(&mut self, manager: &dyn NodeLookup, height: i32, params: &Params) -> Result<[u8; 32]> {
        self.ram.merkle_hash(manager, height, params)
    }

    fn merkle_hash_all_claims(&mut self, manager: &dyn NodeLookup, height: i32, params: &Params) -> Result<[u8; 32]> {
        self.ram.merkle_hash_all_claims(manager, height, params)
    }

    fn set_root(&mut self, hash: [u8; 32], names: Option<&[Vec<u8>]>) {
        self.ram.set_root(hash, names);
    }

    fn flush(&mut self) -> Result<()> {
        let mut batch = KvBatch::new();
        collect_terminals(&self.ram.root, &mut Vec::new(), &mut batch);
        self.kv.write_batch(batch)?;
        self.kv.flush()
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

fn collect_terminals(node: &TrieNode, path: &mut Vec<u8>, batch: &mut KvBatch) {
    if node.is_terminal {
        let value = node.leaf_hash.map(|h| h.to_vec()).unwrap_or_default();
        batch.put(CF_TRIE, path.clone(), value);
    }
    for (&byte, child) in &node.children {
        path.push(byte);
        collect_terminals(child, path, batch);
        path.pop();
    }
}

/// The canonical root of a trie with no names at all (spec §8 scenario 1).
pub fn empty_root() -> [u8; 32] {
    sha256(&[])
}

/// Helper for computing an individual claim/support's node hash directly,
/// exposed for tests and diagnostics without needing a full trie.
pub fn compute_node_hash(node: &Node, height: i32, params: &Params, all_claims: bool) -> Option<[u8; 32]> {
    if all_claims {
        post_fork_hash(node, height, params)
    } else {
        pre_fork_hash(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Network, Params};
    use crate::node_manager::NodeManager;
    use crate::kv::MemoryKvStore;
    use crate::types::{ChangeType, ClaimId};

    fn manager_with_claim(name: &[u8], amount: i64) -> NodeManager<MemoryKvStore> {
        let kv = Arc::new(MemoryKvStore::new());
        let mgr = NodeManager::new(kv, 0, Params::for_network(Network::Regtest));
        mgr.append_change(
            name,
            crate::types::Change {
                height: 0,
                name: name.to_vec(),
                kind: ChangeType::AddClaim,
                outpoint: Outpoint::new([3u8; 32], 0),
                claim_id: ClaimId([4u8; 20]),
                amount,
            },
        );
        let mut batch = KvBatch::new();
        mgr.advance_to(&mut batch, 1).unwrap();
        mgr
    }

    #[test]
    fn empty_trie_hashes_to_canonical_empty_root() {
        let mut trie = RamMerkleTrie::new();
        let mgr = NodeManager::new(Arc::new(MemoryKvStore::new()), 0, Params::for_network(Network::Regtest));
        let root = trie.merkle_hash(&mgr, 0, &Params::for_network(Network::Regtest)).unwrap();
        assert_eq!(root, sha256(&[]));
    }

    #[test]
    fn single_name_changes_root() {
        let mgr = manager_with_claim(b"hello", 100);
        let params = Params::for_network(Network::Regtest);
        let mut trie = RamMerkleTrie::new();
        trie.update(b"hello", true);
        let root = trie.merkle_hash(&mgr, 1, &params).unwrap();
        assert_ne!(root, sha256(&[]));
    }

    #[test]
    fn clean_subtree_reuses_cache() {
        let mgr = manager_with_claim(b"hello", 100);
        let params = Params::for_network(Network::Regtest);
        let mut trie = RamMerkleTrie::new();
        trie.update(b"hello", true);
        let root1 = trie.merkle_hash(&mgr, 1, &params).unwrap();
        // No update() call in between: nothing dirty, should reuse cache and
        // give the same root without touching the node manager again.
        let root2 = trie.merkle_hash(&mgr, 1, &params).unwrap();
        assert_eq!(root1, root2);
    }
}
