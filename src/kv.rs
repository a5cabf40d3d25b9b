//! KV store adapter (spec §2, §6 "KV store contract").
//!
//! An ordered byte-key/byte-value store with prefix iteration and atomic
//! batched writes, kept deliberately opaque so the rest of the crate never
//! depends on RocksDB directly. Modeled on `db_handles::DbHandles` (cached
//! column-family handles, startup existence check) and
//! `atomic_writer::AtomicBatchWriter` (accumulate then commit as one
//! `WriteBatch`).

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};

use crate::error::{ClaimTrieError, Result};

pub const CF_BLOCKS: &str = "blocks";
pub const CF_CHANGES: &str = "changes";
pub const CF_TEMPORAL: &str = "temporal";
pub const CF_TRIE: &str = "trie";

pub const ALL_COLUMN_FAMILIES: &[&str] = &[CF_BLOCKS, CF_CHANGES, CF_TEMPORAL, CF_TRIE];

#[derive(Debug, Clone)]
enum Op {
    Put { cf: String, key: Vec<u8>, value: Vec<u8> },
    Delete { cf: String, key: Vec<u8> },
    DeleteRange { cf: String, from: Vec<u8>, to: Vec<u8> },
}

/// Accumulates writes across column families for one atomic commit.
#[derive(Debug, Clone, Default)]
pub struct KvBatch {
    ops: Vec<Op>,
}

impl KvBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cf: &str, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(Op::Put { cf: cf.to_string(), key, value });
    }

    pub fn delete(&mut self, cf: &str, key: Vec<u8>) {
        self.ops.push(Op::Delete { cf: cf.to_string(), key });
    }

    /// Delete every key in `[from, to)` in one range operation, used by
    /// rewind (spec §4.1 `drop_changes`, §4.2 temporal range-delete).
    pub fn delete_range(&mut self, cf: &str, from: Vec<u8>, to: Vec<u8>) {
        self.ops.push(Op::DeleteRange { cf: cf.to_string(), from, to });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Ordered byte-key/byte-value store with prefix iteration and atomic
/// batched writes. The capability set the orchestrator and its repos are
/// written against; `RocksKvStore` and `MemoryKvStore` below are the two
/// implementations.
pub trait KvStore: Send + Sync {
    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn iter_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    fn write_batch(&self, batch: KvBatch) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

/// RocksDB-backed implementation.
pub struct RocksKvStore {
    db: Arc<DB>,
}

impl RocksKvStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        for cf_name in ALL_COLUMN_FAMILIES {
            if db.cf_handle(cf_name).is_none() {
                return Err(ClaimTrieError::StorageIO(format!("{} column family not found after open", cf_name)));
            }
        }

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ClaimTrieError::StorageIO(format!("unknown column family {}", name)))
    }
}

impl KvStore for RocksKvStore {
    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf(cf)?, key)?)
    }

    fn iter_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let handle = self.cf(cf)?;
        let mode = rocksdb::IteratorMode::From(prefix, rocksdb::Direction::Forward);
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn write_batch(&self, batch: KvBatch) -> Result<()> {
        let mut wb = rocksdb::WriteBatch::default();
        for op in batch.ops {
            match op {
                Op::Put { cf, key, value } => wb.put_cf(self.cf(&cf)?, key, value),
                Op::Delete { cf, key } => wb.delete_cf(self.cf(&cf)?, key),
                Op::DeleteRange { cf, from, to } => wb.delete_range_cf(self.cf(&cf)?, from, to),
            }
        }
        self.db.write(wb)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        for cf_name in ALL_COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(cf_name)?)?;
        }
        Ok(())
    }
}

/// In-memory test double, used by unit tests that don't need RocksDB.
pub struct MemoryKvStore {
    inner: std::sync::Mutex<std::collections::BTreeMap<(String, Vec<u8>), Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self { inner: std::sync::Mutex::new(std::collections::BTreeMap::new()) }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let map = self.inner.lock().expect("lock poisoned");
        Ok(map.get(&(cf.to_string(), key.to_vec())).cloned())
    }

    fn iter_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.inner.lock().expect("lock poisoned");
        Ok(map
            .range((cf.to_string(), prefix.to_vec())..)
            .take_while(|((c, k), _)| c == cf && k.starts_with(prefix))
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, batch: KvBatch) -> Result<()> {
        let mut map = self.inner.lock().expect("lock poisoned");
        for op in batch.ops {
            match op {
                Op::Put { cf, key, value } => {
                    map.insert((cf, key), value);
                }
                Op::Delete { cf, key } => {
                    map.remove(&(cf, key));
                }
                Op::DeleteRange { cf, from, to } => {
                    let keys: Vec<_> = map
                        .range((cf.clone(), from.clone())..(cf.clone(), to.clone()))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in keys {
                        map.remove(&k);
                    }
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
