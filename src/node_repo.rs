//! Change log / Node repo (spec §4.1).
//!
//! Stores, per normalized name, an append-only ordered list of changes.
//! Key = length-prefixed normalized name ∥ big-endian `u32` height ∥
//! monotonic `u16` within-block sequence (spec §6).

use std::collections::BTreeSet;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::kv::{KvBatch, KvStore, CF_CHANGES};
use crate::types::Change;

fn name_prefix(name: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + name.len());
    key.write_u16::<BigEndian>(name.len() as u16).expect("write to Vec never fails");
    key.extend_from_slice(name);
    key
}

fn full_key(name: &[u8], height: i32, seq: u16) -> Vec<u8> {
    let mut key = name_prefix(name);
    key.write_u32::<BigEndian>(height as u32).expect("write to Vec never fails");
    key.write_u16::<BigEndian>(seq).expect("write to Vec never fails");
    key
}

pub struct NodeRepo<K: KvStore> {
    kv: std::sync::Arc<K>,
}

impl<K: KvStore> NodeRepo<K> {
    pub fn new(kv: std::sync::Arc<K>) -> Self {
        Self { kv }
    }

    /// Append `changes`, all accepted at `height`, for `name`, into `batch`.
    /// Sequence numbers are assigned by position; callers only ever flush
    /// changes buffered for a single not-yet-appended block, so positional
    /// assignment is a valid monotonic within-block sequence.
    pub fn append(&self, batch: &mut KvBatch, name: &[u8], height: i32, changes: &[Change]) {
        for (seq, change) in changes.iter().enumerate() {
            let key = full_key(name, height, seq as u16);
            batch.put(CF_CHANGES, key, change.write_value());
        }
    }

    /// Returns the full change history for `name`, ordered by
    /// `(height, insertion-index)` — the natural order of the underlying
    /// keys.
    pub fn load_changes(&self, name: &[u8]) -> Result<Vec<Change>> {
        let prefix = name_prefix(name);
        let rows = self.kv.iter_prefix(CF_CHANGES, &prefix)?;
        let mut changes = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let mut cursor = Cursor::new(&key[prefix.len()..]);
            let height = cursor.read_u32::<BigEndian>().map(|v| v as i32).unwrap_or(0);
            changes.push(Change::read_value(name.to_vec(), height, &value)?);
        }
        Ok(changes)
    }

    /// Truncates all changes for `name` with `height > above_height`.
    pub fn drop_changes(&self, batch: &mut KvBatch, name: &[u8], above_height: i32) {
        let prefix = name_prefix(name);
        let mut from = prefix.clone();
        from.write_u32::<BigEndian>((above_height as i64 + 1).max(0) as u32).expect("write to Vec never fails");
        from.write_u16::<BigEndian>(0).expect("write to Vec never fails");

        let mut to = prefix;
        to.write_u32::<BigEndian>(u32::MAX).expect("write to Vec never fails");
        to.write_u16::<BigEndian>(u16::MAX).expect("write to Vec never fails");
        to.push(0x01); // one byte past the widest possible real key for this name

        batch.delete_range(CF_CHANGES, from, to);
    }

    /// Enumerate distinct names whose change history starts with `prefix`
    /// (byte prefix over the raw name, not the length-prefixed key). Used by
    /// the fork-height full rehash (empty prefix) and diagnostics.
    pub fn iterate_names(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let rows = self.kv.iter_prefix(CF_CHANGES, &[])?;
        let mut names: BTreeSet<Vec<u8>> = BTreeSet::new();
        for (key, _) in rows {
            if key.len() < 2 {
                continue;
            }
            let name_len = u16::from_be_bytes([key[0], key[1]]) as usize;
            if key.len() < 2 + name_len {
                continue;
            }
            let name = &key[2..2 + name_len];
            if name.starts_with(prefix) {
                names.insert(name.to_vec());
            }
        }
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::types::{ChangeType, ClaimId, Outpoint};

    fn sample_change(height: i32, amount: i64) -> Change {
        Change {
            height,
            name: b"foo".to_vec(),
            kind: ChangeType::AddClaim,
            outpoint: Outpoint::new([1u8; 32], 0),
            claim_id: ClaimId([2u8; 20]),
            amount,
        }
    }

    #[test]
    fn append_and_load_preserve_order() {
        let kv = std::sync::Arc::new(MemoryKvStore::new());
        let repo = NodeRepo::new(kv.clone());

        let mut batch = KvBatch::new();
        repo.append(&mut batch, b"foo", 1, &[sample_change(1, 10)]);
        kv.write_batch(batch).unwrap();

        let mut batch = KvBatch::new();
        repo.append(&mut batch, b"foo", 2, &[sample_change(2, 20), sample_change(2, 30)]);
        kv.write_batch(batch).unwrap();

        let loaded = repo.load_changes(b"foo").unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].amount, 10);
        assert_eq!(loaded[1].amount, 20);
        assert_eq!(loaded[2].amount, 30);
    }

    #[test]
    fn drop_changes_truncates_above_height() {
        let kv = std::sync::Arc::new(MemoryKvStore::new());
        let repo = NodeRepo::new(kv.clone());

        let mut batch = KvBatch::new();
        repo.append(&mut batch, b"foo", 1, &[sample_change(1, 10)]);
        repo.append(&mut batch, b"foo", 5, &[sample_change(5, 50)]);
        kv.write_batch(batch).unwrap();

        let mut drop_batch = KvBatch::new();
        repo.drop_changes(&mut drop_batch, b"foo", 1);
        kv.write_batch(drop_batch).unwrap();

        let loaded = repo.load_changes(b"foo").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].height, 1);
    }

    #[test]
    fn iterate_names_filters_by_prefix() {
        let kv = std::sync::Arc::new(MemoryKvStore::new());
        let repo = NodeRepo::new(kv.clone());

        let mut batch = KvBatch::new();
        repo.append(&mut batch, b"alpha", 1, &[sample_change(1, 1)]);
        repo.append(&mut batch, b"albatross", 1, &[sample_change(1, 1)]);
        repo.append(&mut batch, b"beta", 1, &[sample_change(1, 1)]);
        kv.write_batch(batch).unwrap();

        let names = repo.iterate_names(b"al").unwrap();
        assert_eq!(names, vec![b"albatross".to_vec(), b"alpha".to_vec()]);
    }
}
