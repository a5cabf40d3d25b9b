//! Node manager (spec §4.4): caches reconstructed nodes and advances or
//! rewinds them in step with the orchestrator.
//!
//! Caching uses an `lru::LruCache`, the same crate `cache.rs` uses for the
//! teacher's block/transaction caches.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::config::Params;
use crate::error::Result;
use crate::kv::{KvBatch, KvStore};
use crate::merkle_trie::NodeLookup;
use crate::node::Node;
use crate::node_repo::NodeRepo;
use crate::types::Change;

const DEFAULT_CACHE_SIZE: usize = 100_000;

/// True if two changes represent the same mutation modulo the raw `name`
/// spelling — comparing `(height, kind, outpoint, claim_id, amount)`.
fn changes_equivalent(a: &Change, b: &Change) -> bool {
    a.height == b.height && a.kind == b.kind && a.outpoint == b.outpoint && a.claim_id == b.claim_id && a.amount == b.amount
}

/// Caches reconstructed [`Node`]s for a KV-backed change log, and buffers
/// changes for the not-yet-appended block.
pub struct NodeManager<K: KvStore> {
    repo: NodeRepo<K>,
    cache: std::sync::Mutex<LruCache<Vec<u8>, Node>>,
    /// Changes buffered for `height + 1`, keyed by normalized name, not yet
    /// persisted.
    buffered: std::sync::Mutex<HashMap<Vec<u8>, Vec<Change>>>,
    height: std::sync::atomic::AtomicI32,
    params: Params,
}

impl<K: KvStore> NodeManager<K> {
    pub fn new(kv: Arc<K>, height: i32, params: Params) -> Self {
        Self {
            repo: NodeRepo::new(kv),
            cache: std::sync::Mutex::new(LruCache::new(NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap())),
            buffered: std::sync::Mutex::new(HashMap::new()),
            height: std::sync::atomic::AtomicI32::new(height),
            params,
        }
    }

    pub fn height(&self) -> i32 {
        self.height.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Buffer `change` for the block one past the current height, per spec
    /// §4.4's lifecycle (`chg.height = current_height + 1`). An exact
    /// duplicate of a change already buffered for the same name at the same
    /// height is dropped rather than applied twice — relevant once two raw
    /// spellings fold onto the same normalized key (spec §8, "idempotence of
    /// normalization").
    pub fn append_change(&self, name: &[u8], mut change: Change) {
        change.height = self.height() + 1;
        let mut buffered = self.buffered.lock().expect("lock poisoned");
        let pending = buffered.entry(name.to_vec()).or_default();
        if pending.iter().any(|existing| changes_equivalent(existing, &change)) {
            return;
        }
        pending.push(change);
    }

    fn load_node(&self, name: &[u8]) -> Result<Node> {
        if let Some(node) = self.cache.lock().expect("lock poisoned").get(name) {
            return Ok(node.clone());
        }
        let history = self.repo.load_changes(name)?;
        let node = Node::rebuild(&history, self.height(), &self.params);
        self.cache.lock().expect("lock poisoned").put(name.to_vec(), node.clone());
        Ok(node)
    }

    pub fn node_at(&self, name: &[u8]) -> Result<Node> {
        self.load_node(name)
    }

    /// Advance every name with a buffered change, or whose cached
    /// `next_update_height <= target_h`, rebuilding and persisting each.
    /// Returns the sorted, de-duplicated set of touched names.
    pub fn advance_to(&self, batch: &mut KvBatch, target_h: i32) -> Result<Vec<Vec<u8>>> {
        let mut names: BTreeSet<Vec<u8>> = BTreeSet::new();

        {
            let buffered = self.buffered.lock().expect("lock poisoned");
            names.extend(buffered.keys().cloned());
        }
        {
            let mut cache = self.cache.lock().expect("lock poisoned");
            for (name, node) in cache.iter() {
                if node.next_update_height != 0 && node.next_update_height <= target_h {
                    names.insert(name.clone());
                }
            }
        }

        self.height.store(target_h, std::sync::atomic::Ordering::SeqCst);

        for name in &names {
            let pending = {
                let mut buffered = self.buffered.lock().expect("lock poisoned");
                buffered.remove(name).unwrap_or_default()
            };
            if !pending.is_empty() {
                let append_height = pending[0].height;
                self.repo.append(batch, name, append_height, &pending);
            }

            let mut history = self.repo.load_changes(name)?;
            history.extend(pending);
            history.sort_by_key(|c| c.height);

            let node = Node::rebuild(&history, target_h, &self.params);
            self.cache.lock().expect("lock poisoned").put(name.clone(), node);
        }

        Ok(names.into_iter().collect())
    }

    /// Drops buffered/persisted changes above `target_h` for `names`,
    /// evicting them from cache.
    pub fn rewind_to(&self, batch: &mut KvBatch, names: &[Vec<u8>], target_h: i32) {
        let mut buffered = self.buffered.lock().expect("lock poisoned");
        let mut cache = self.cache.lock().expect("lock poisoned");
        for name in names {
            self.repo.drop_changes(batch, name, target_h);
            buffered.remove(name);
            cache.pop(name);
        }
        self.height.store(target_h, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn iterate_names(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.repo.iterate_names(prefix)
    }

    /// `(canonical_name, next_update_height)` for `name`. The base manager
    /// never re-keys, so canonical == name; the normalizing wrapper
    /// overrides this.
    pub fn next_update_height_of(&self, name: &[u8]) -> Result<(Vec<u8>, i32)> {
        let node = self.load_node(name)?;
        Ok((name.to_vec(), node.next_update_height))
    }

    /// Moves `old_name`'s entire change history onto `new_name`, dropping the
    /// old key's entries and evicting both names from cache. Used by the
    /// normalizing wrapper's one-time fork-height re-keying surge; a no-op if
    /// `old_name` has no history.
    fn rekey(&self, batch: &mut KvBatch, old_name: &[u8], new_name: &[u8]) -> Result<()> {
        let history = self.repo.load_changes(old_name)?;
        if history.is_empty() {
            return Ok(());
        }

        let mut by_height: std::collections::BTreeMap<i32, Vec<Change>> = std::collections::BTreeMap::new();
        for mut change in history {
            change.name = new_name.to_vec();
            by_height.entry(change.height).or_default().push(change);
        }
        for (height, changes) in &by_height {
            self.repo.append(batch, new_name, *height, changes);
        }
        self.repo.drop_changes(batch, old_name, -1);

        let mut buffered = self.buffered.lock().expect("lock poisoned");
        if let Some(pending) = buffered.remove(old_name) {
            buffered.entry(new_name.to_vec()).or_default().extend(pending);
        }
        let mut cache = self.cache.lock().expect("lock poisoned");
        cache.pop(old_name);
        cache.pop(new_name);

        Ok(())
    }
}

impl<K: KvStore> NodeLookup for NodeManager<K> {
    fn node_at(&self, name: &[u8]) -> Result<Node> {
        NodeManager::node_at(self, name)
    }
}

/// Wraps a base [`NodeManager`] and applies name normalization (spec §3,
/// §4.4) starting at the fork height. Before the fork, names pass through
/// unchanged; at and after, every lookup and mutation is re-keyed under the
/// normalized form.
pub struct NormalizingNodeManager<K: KvStore> {
    inner: NodeManager<K>,
    fork_height: i32,
}

impl<K: KvStore> NormalizingNodeManager<K> {
    pub fn new(inner: NodeManager<K>, fork_height: i32) -> Self {
        Self { inner, fork_height }
    }

    fn canonical(&self, name: &[u8]) -> Vec<u8> {
        crate::name::normalize_at(name, self.inner.height() + 1, self.fork_height)
    }

    pub fn height(&self) -> i32 {
        self.inner.height()
    }

    pub fn append_change(&self, name: &[u8], change: Change) {
        let canon = self.canonical(name);
        self.inner.append_change(&canon, change);
    }

    pub fn node_at(&self, name: &[u8]) -> Result<Node> {
        let canon = crate::name::normalize_at(name, self.inner.height(), self.fork_height);
        self.inner.node_at(&canon)
    }

    pub fn advance_to(&self, batch: &mut KvBatch, target_h: i32) -> Result<Vec<Vec<u8>>> {
        let crossed_fork = self.inner.height() < self.fork_height && target_h >= self.fork_height;
        let mut touched = self.inner.advance_to(batch, target_h)?;

        if crossed_fork {
            // One-time surge: every existing name's change history is moved
            // onto its normalized key (a no-op if already normalized), and
            // both forms are reported touched so the trie re-hashes them.
            let all_names = self.inner.iterate_names(&[])?;
            for name in all_names {
                let canon = crate::name::normalize(&name);
                if canon != name {
                    self.inner.rekey(batch, &name, &canon)?;
                    touched.push(canon);
                }
                touched.push(name);
            }
            touched.sort();
            touched.dedup();
        }

        Ok(touched)
    }

    pub fn rewind_to(&self, batch: &mut KvBatch, names: &[Vec<u8>], target_h: i32) {
        self.inner.rewind_to(batch, names, target_h);
    }

    pub fn iterate_names(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.inner.iterate_names(prefix)
    }

    pub fn next_update_height_of(&self, name: &[u8]) -> Result<(Vec<u8>, i32)> {
        let canon = self.canonical(name);
        let (_, h) = self.inner.next_update_height_of(&canon)?;
        Ok((canon, h))
    }
}

impl<K: KvStore> NodeLookup for NormalizingNodeManager<K> {
    fn node_at(&self, name: &[u8]) -> Result<Node> {
        NormalizingNodeManager::node_at(self, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Network, Params};
    use crate::kv::MemoryKvStore;
    use crate::types::{ChangeType, ClaimId, Outpoint};

    fn manager() -> (NodeManager<MemoryKvStore>, Arc<MemoryKvStore>) {
        let kv = Arc::new(MemoryKvStore::new());
        (NodeManager::new(kv.clone(), 0, Params::for_network(Network::Regtest)), kv)
    }

    #[test]
    fn append_then_advance_persists_and_returns_touched() {
        let (mgr, kv) = manager();
        mgr.append_change(
            b"hello",
            Change {
                height: 0,
                name: b"hello".to_vec(),
                kind: ChangeType::AddClaim,
                outpoint: Outpoint::new([1u8; 32], 0),
                claim_id: ClaimId([9u8; 20]),
                amount: 100,
            },
        );

        let mut batch = KvBatch::new();
        let touched = mgr.advance_to(&mut batch, 1).unwrap();
        assert_eq!(touched, vec![b"hello".to_vec()]);
        kv.write_batch(batch).unwrap();

        let node = mgr.node_at(b"hello").unwrap();
        assert_eq!(node.controller, Some(ClaimId([9u8; 20])));
    }

    #[test]
    fn rewind_drops_buffered_and_persisted_changes() {
        let (mgr, kv) = manager();
        mgr.append_change(
            b"hello",
            Change {
                height: 0,
                name: b"hello".to_vec(),
                kind: ChangeType::AddClaim,
                outpoint: Outpoint::new([1u8; 32], 0),
                claim_id: ClaimId([9u8; 20]),
                amount: 100,
            },
        );
        let mut batch = KvBatch::new();
        mgr.advance_to(&mut batch, 1).unwrap();
        kv.write_batch(batch).unwrap();

        let mut rewind_batch = KvBatch::new();
        mgr.rewind_to(&mut rewind_batch, &[b"hello".to_vec()], 0);
        kv.write_batch(rewind_batch).unwrap();

        let node = mgr.node_at(b"hello").unwrap();
        assert_eq!(node.controller, None);
    }

    #[test]
    fn duplicate_change_at_same_height_is_deduplicated() {
        let (mgr, kv) = manager();
        let change = Change {
            height: 0,
            name: b"hello".to_vec(),
            kind: ChangeType::AddClaim,
            outpoint: Outpoint::new([1u8; 32], 0),
            claim_id: ClaimId([9u8; 20]),
            amount: 100,
        };
        mgr.append_change(b"hello", change.clone());
        mgr.append_change(b"hello", change);

        let mut batch = KvBatch::new();
        mgr.advance_to(&mut batch, 1).unwrap();
        kv.write_batch(batch).unwrap();

        let node = mgr.node_at(b"hello").unwrap();
        assert_eq!(node.claims.len(), 1, "the repeated submission must not double-apply the claim");
    }

    #[test]
    fn normalizing_manager_dedupes_across_raw_and_canonical_spelling() {
        let kv = Arc::new(MemoryKvStore::new());
        let params = Params::for_network(Network::Regtest);
        let base = NodeManager::new(kv.clone(), params.normalization_fork_height, params);
        let mgr = NormalizingNodeManager::new(base, params.normalization_fork_height);

        let change = Change {
            height: 0,
            name: Vec::new(),
            kind: ChangeType::AddClaim,
            outpoint: Outpoint::new([2u8; 32], 0),
            claim_id: ClaimId([5u8; 20]),
            amount: 50,
        };
        // Both spellings normalize to the same key post-fork.
        mgr.append_change(b"Name", change.clone());
        mgr.append_change(b"name", change);

        let mut batch = KvBatch::new();
        mgr.advance_to(&mut batch, params.normalization_fork_height + 1).unwrap();
        kv.write_batch(batch).unwrap();

        let node = mgr.node_at(b"name").unwrap();
        assert_eq!(node.claims.len(), 1);
    }
}
