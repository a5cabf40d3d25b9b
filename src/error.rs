//! Crate-wide error type.
//!
//! Kinds mirror the failure semantics the orchestrator must honor:
//! `StorageIO` and `InconsistentState` are fatal to the current operation,
//! `InvalidChange` is rejected synchronously, `Interrupted` is cooperative
//! cancellation.

use std::fmt;

#[derive(Debug)]
pub enum ClaimTrieError {
    StorageIO(String),
    InconsistentState { height: i32, expected: [u8; 32], actual: [u8; 32] },
    InvalidChange(String),
    Interrupted,
}

impl fmt::Display for ClaimTrieError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimTrieError::StorageIO(msg) => write!(f, "storage I/O error: {}", msg),
            ClaimTrieError::InconsistentState { height, expected, actual } => write!(
                f,
                "inconsistent state at height {}: expected root {}, recomputed {}",
                height,
                hex::encode(expected),
                hex::encode(actual)
            ),
            ClaimTrieError::InvalidChange(msg) => write!(f, "invalid change: {}", msg),
            ClaimTrieError::Interrupted => write!(f, "operation interrupted"),
        }
    }
}

impl std::error::Error for ClaimTrieError {}

impl From<rocksdb::Error> for ClaimTrieError {
    fn from(e: rocksdb::Error) -> Self {
        ClaimTrieError::StorageIO(e.to_string())
    }
}

impl From<std::io::Error> for ClaimTrieError {
    fn from(e: std::io::Error) -> Self {
        ClaimTrieError::StorageIO(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClaimTrieError>;
