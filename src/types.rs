//! Core data model: outpoints, claim IDs, claims, supports, and changes.
//!
//! Byte layouts follow spec §6 where they are consensus-critical; everything
//! else is a plain Rust struct.

use std::cmp::Ordering;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use ripemd160::{Digest as RipeDigest, Ripemd160};
use sha2::{Digest, Sha256};

use crate::error::{ClaimTrieError, Result};

/// 32-byte transaction hash + 4-byte output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Outpoint {
    pub txid: [u8; 32],
    pub index: u32,
}

impl Outpoint {
    pub const SERIALIZED_LEN: usize = 36;

    pub fn new(txid: [u8; 32], index: u32) -> Self {
        Self { txid, index }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.txid);
        out.write_u32::<BigEndian>(self.index).expect("write to Vec never fails");
    }

    pub fn read(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut txid = [0u8; 32];
        cursor
            .read_exact(&mut txid)
            .map_err(|e| ClaimTrieError::InvalidChange(format!("outpoint txid: {}", e)))?;
        let index = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| ClaimTrieError::InvalidChange(format!("outpoint index: {}", e)))?;
        Ok(Self { txid, index })
    }
}

/// Lexicographic ordering by txid bytes then output index, per spec §4.3
/// step 4's tie-break rule.
impl Ord for Outpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.txid.cmp(&other.txid).then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Outpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 20-byte identifier derived from the originating outpoint, the same way
/// LBRY derives claim IDs: RIPEMD-160 of SHA-256 of the outpoint bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimId(pub [u8; 20]);

impl ClaimId {
    pub fn from_outpoint(outpoint: &Outpoint) -> Self {
        let mut bytes = Vec::with_capacity(Outpoint::SERIALIZED_LEN);
        outpoint.write(&mut bytes);
        let sha = Sha256::digest(&bytes);
        let ripe = Ripemd160::digest(&sha);
        let mut out = [0u8; 20];
        out.copy_from_slice(&ripe);
        ClaimId(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// A claim: a named stake of currency toward a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub claim_id: ClaimId,
    pub outpoint: Outpoint,
    pub amount: i64,
    pub accepted_height: i32,
    pub active_height: i32,
}

/// A support: additional stake boosting a specific claim's effective amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Support {
    pub supported_claim_id: ClaimId,
    pub outpoint: Outpoint,
    pub amount: i64,
    pub accepted_height: i32,
    pub active_height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChangeType {
    AddClaim = 0,
    UpdateClaim = 1,
    SpendClaim = 2,
    AddSupport = 3,
    SpendSupport = 4,
}

impl ChangeType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ChangeType::AddClaim),
            1 => Ok(ChangeType::UpdateClaim),
            2 => Ok(ChangeType::SpendClaim),
            3 => Ok(ChangeType::AddSupport),
            4 => Ok(ChangeType::SpendSupport),
            other => Err(ClaimTrieError::InvalidChange(format!("unknown change type tag {}", other))),
        }
    }
}

/// A single ordered mutation to a name's claim/support set.
///
/// The `name` field carries the raw (pre-normalization) bytes for display;
/// the change log itself keys entries by the normalized name per spec §4.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub height: i32,
    pub name: Vec<u8>,
    pub kind: ChangeType,
    pub outpoint: Outpoint,
    pub claim_id: ClaimId,
    pub amount: i64,
}

impl Change {
    /// Serialize the value half of spec §6's node-change-log layout:
    /// `{type:u8, outpoint:36, claim_id:20, amount:i64}`. The key (name +
    /// height + sequence) is assembled by the change-log repo.
    pub fn write_value(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + Outpoint::SERIALIZED_LEN + 20 + 8);
        out.push(self.kind as u8);
        self.outpoint.write(&mut out);
        out.extend_from_slice(&self.claim_id.0);
        out.write_i64::<BigEndian>(self.amount).expect("write to Vec never fails");
        out
    }

    pub fn read_value(name: Vec<u8>, height: i32, bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let tag = cursor
            .read_u8()
            .map_err(|e| ClaimTrieError::InvalidChange(format!("change tag: {}", e)))?;
        let kind = ChangeType::from_u8(tag)?;
        let outpoint = Outpoint::read(&mut cursor)?;
        let mut claim_id = [0u8; 20];
        cursor
            .read_exact(&mut claim_id)
            .map_err(|e| ClaimTrieError::InvalidChange(format!("change claim id: {}", e)))?;
        let amount = cursor
            .read_i64::<BigEndian>()
            .map_err(|e| ClaimTrieError::InvalidChange(format!("change amount: {}", e)))?;
        Ok(Change { height, name, kind: kind, outpoint, claim_id: ClaimId(claim_id), amount })
    }
}
