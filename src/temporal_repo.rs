//! Temporal repo (spec §4.2): maps height → set of names needing refresh.
//!
//! Key = big-endian `u32` height ∥ length-prefixed name; value empty.
//! Duplicate insertions are idempotent; rewind removes entries implicitly by
//! range-deleting keys with `height > target`.

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::Result;
use crate::kv::{KvBatch, KvStore, CF_TEMPORAL};

fn height_prefix(height: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(4);
    key.write_u32::<BigEndian>(height as u32).expect("write to Vec never fails");
    key
}

fn full_key(height: i32, name: &[u8]) -> Vec<u8> {
    let mut key = height_prefix(height);
    key.write_u16::<BigEndian>(name.len() as u16).expect("write to Vec never fails");
    key.extend_from_slice(name);
    key
}

pub struct TemporalRepo<K: KvStore> {
    kv: std::sync::Arc<K>,
}

impl<K: KvStore> TemporalRepo<K> {
    pub fn new(kv: std::sync::Arc<K>) -> Self {
        Self { kv }
    }

    pub fn nodes_at(&self, height: i32) -> Result<Vec<Vec<u8>>> {
        let prefix = height_prefix(height);
        let rows = self.kv.iter_prefix(CF_TEMPORAL, &prefix)?;
        let mut names = Vec::with_capacity(rows.len());
        for (key, _) in rows {
            if key.len() < prefix.len() + 2 {
                continue;
            }
            let rest = &key[prefix.len()..];
            let name_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            if rest.len() < 2 + name_len {
                continue;
            }
            names.push(rest[2..2 + name_len].to_vec());
        }
        Ok(names)
    }

    /// Record that each `names[i]` needs attention at `heights[i]`.
    /// Duplicate `(name, height)` pairs collapse naturally since the key is
    /// a function of both.
    pub fn set_nodes_at(&self, batch: &mut KvBatch, names: &[Vec<u8>], heights: &[i32]) {
        debug_assert_eq!(names.len(), heights.len());
        for (name, height) in names.iter().zip(heights.iter()) {
            batch.put(CF_TEMPORAL, full_key(*height, name), Vec::new());
        }
    }

    /// Removes every scheduled entry at a height greater than `target`.
    pub fn rewind(&self, batch: &mut KvBatch, target: i32) {
        let from = height_prefix(target + 1);
        let to = height_prefix(i32::MAX);
        let mut to_inclusive_bump = to;
        to_inclusive_bump.push(0xff);
        batch.delete_range(CF_TEMPORAL, from, to_inclusive_bump);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[test]
    fn set_and_get_nodes_at_height() {
        let kv = std::sync::Arc::new(MemoryKvStore::new());
        let repo = TemporalRepo::new(kv.clone());

        let mut batch = KvBatch::new();
        repo.set_nodes_at(&mut batch, &[b"a".to_vec(), b"b".to_vec()], &[10, 10]);
        kv.write_batch(batch).unwrap();

        let mut names = repo.nodes_at(10).unwrap();
        names.sort();
        assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(repo.nodes_at(11).unwrap().is_empty());
    }

    #[test]
    fn duplicate_insertion_is_idempotent() {
        let kv = std::sync::Arc::new(MemoryKvStore::new());
        let repo = TemporalRepo::new(kv.clone());

        let mut batch = KvBatch::new();
        repo.set_nodes_at(&mut batch, &[b"a".to_vec()], &[5]);
        repo.set_nodes_at(&mut batch, &[b"a".to_vec()], &[5]);
        kv.write_batch(batch).unwrap();

        assert_eq!(repo.nodes_at(5).unwrap().len(), 1);
    }

    #[test]
    fn rewind_drops_future_heights_only() {
        let kv = std::sync::Arc::new(MemoryKvStore::new());
        let repo = TemporalRepo::new(kv.clone());

        let mut batch = KvBatch::new();
        repo.set_nodes_at(&mut batch, &[b"a".to_vec(), b"b".to_vec()], &[5, 6]);
        kv.write_batch(batch).unwrap();

        let mut rewind_batch = KvBatch::new();
        repo.rewind(&mut rewind_batch, 5);
        kv.write_batch(rewind_batch).unwrap();

        assert_eq!(repo.nodes_at(5).unwrap(), vec![b"a".to_vec()]);
        assert!(repo.nodes_at(6).unwrap().is_empty());
    }
}
