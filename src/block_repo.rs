//! Block-hash repo: maps height → Merkle root (spec §2, §6).
//!
//! Key = big-endian `u32` height; value = 32-byte root.

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::{ClaimTrieError, Result};
use crate::kv::{KvBatch, KvStore, CF_BLOCKS};

pub struct BlockRepo<K: KvStore> {
    kv: std::sync::Arc<K>,
}

fn height_key(height: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(4);
    key.write_u32::<BigEndian>(height as u32).expect("write to Vec never fails");
    key
}

impl<K: KvStore> BlockRepo<K> {
    pub fn new(kv: std::sync::Arc<K>) -> Self {
        Self { kv }
    }

    pub fn get(&self, height: i32) -> Result<Option<[u8; 32]>> {
        match self.kv.get(CF_BLOCKS, &height_key(height))? {
            Some(bytes) if bytes.len() == 32 => {
                let mut root = [0u8; 32];
                root.copy_from_slice(&bytes);
                Ok(Some(root))
            }
            Some(_) => Err(ClaimTrieError::StorageIO(format!("malformed root at height {}", height))),
            None => Ok(None),
        }
    }

    pub fn set(&self, height: i32, root: [u8; 32]) -> Result<()> {
        let mut batch = KvBatch::new();
        batch.put(CF_BLOCKS, height_key(height), root.to_vec());
        self.kv.write_batch(batch)
    }

    /// Prune roots persisted for heights above `target`, used by
    /// `reset_height` so a later startup's `last_height` scan doesn't pick up
    /// an orphaned future root.
    pub fn rewind(&self, batch: &mut KvBatch, target: i32) {
        let from = height_key(target + 1);
        let mut to = height_key(i32::MAX);
        to.push(0xff);
        batch.delete_range(CF_BLOCKS, from, to);
    }

    /// Find the highest persisted height, used on startup. Linear scan via
    /// prefix iteration since roots are written once per block and the CF
    /// stays small relative to chain length in a running node.
    pub fn last_height(&self) -> Result<i32> {
        let mut max_height = 0;
        for (key, _) in self.kv.iter_prefix(CF_BLOCKS, &[])? {
            if key.len() == 4 {
                let h = i32::from_be_bytes([key[0], key[1], key[2], key[3]]);
                if h > max_height {
                    max_height = h;
                }
            }
        }
        Ok(max_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[test]
    fn round_trips_root_per_height() {
        let repo = BlockRepo::new(std::sync::Arc::new(MemoryKvStore::new()));
        assert!(repo.get(1).unwrap().is_none());
        repo.set(1, [7u8; 32]).unwrap();
        assert_eq!(repo.get(1).unwrap(), Some([7u8; 32]));
        assert_eq!(repo.last_height().unwrap(), 1);
        repo.set(2, [9u8; 32]).unwrap();
        assert_eq!(repo.last_height().unwrap(), 2);
    }
}
