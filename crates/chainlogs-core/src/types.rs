//! Shared types for the log indexing pipeline.
//!
//! All hashes, addresses, and data payloads are normalized to lowercase
//! fixed-width `0x…` hex on ingest. With that normalization, lexicographic
//! string order equals unsigned numeric order, which is what makes the
//! topic/data-word range queries behave identically across backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Width of a 32-byte hash in hex characters (without the `0x` prefix).
pub const HASH_HEX_LEN: usize = 64;
/// Width of a 20-byte address in hex characters.
pub const ADDRESS_HEX_LEN: usize = 40;

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// A minimal block header — enough for the poll loop to track progress
/// and verify the parent hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

impl BlockHeader {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── ChainHead ────────────────────────────────────────────────────────────────

/// The poller's persisted view of the remote chain tip.
///
/// Saved transactionally with every applied block so a restart resumes from
/// the stored position instead of re-scanning from genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    /// Latest applied block number.
    pub block_number: u64,
    /// Latest applied block hash.
    pub block_hash: String,
    /// Unix timestamp of when this head was saved.
    pub updated_at: i64,
}

impl ChainHead {
    pub fn new(block_number: u64, block_hash: impl Into<String>) -> Self {
        Self {
            block_number,
            block_hash: block_hash.into(),
            updated_at: Utc::now().timestamp(),
        }
    }
}

// ─── Log ──────────────────────────────────────────────────────────────────────

/// A stored event log.
///
/// Uniqueness key: `(block_hash, log_index)`. The store holds a single
/// consistent chain view at all times, so the physical index key is
/// `(block_number, log_index)` and re-applying a block is an upsert.
/// A log is immutable once written; it is only deleted by reorg rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Hash of the block containing this log.
    pub block_hash: String,
    /// Number of the block containing this log.
    pub block_number: u64,
    /// Position of the log within its block.
    pub log_index: u32,
    /// Hash of the transaction that emitted the log.
    pub tx_hash: String,
    /// Contract address that emitted the log.
    pub address: String,
    /// Event signature hash (`topics[0]`).
    pub event_sig: String,
    /// Ordered indexed topics, including `topics[0]` (at most 4).
    pub topics: Vec<String>,
    /// Raw data payload: `0x` followed by a sequence of 32-byte hex words.
    pub data: String,
    /// When this row was written locally.
    pub created_at: DateTime<Utc>,
}

impl Log {
    /// The ordering key used by every range scan.
    pub fn ordering_key(&self) -> (u64, u32) {
        (self.block_number, self.log_index)
    }

    /// Topic at position `index` (0 = event signature), if present.
    pub fn topic(&self, index: usize) -> Option<&str> {
        self.topics.get(index).map(String::as_str)
    }

    /// The 32-byte word at `index` of the data payload, as a `0x…` hex
    /// string. `None` if the payload is shorter than `index + 1` words.
    pub fn data_word(&self, index: usize) -> Option<String> {
        let hex = self.data.strip_prefix("0x")?;
        let start = index.checked_mul(HASH_HEX_LEN)?;
        let end = start.checked_add(HASH_HEX_LEN)?;
        if hex.len() < end {
            return None;
        }
        Some(format!("0x{}", &hex[start..end]))
    }
}

// ─── Hex normalization ────────────────────────────────────────────────────────

/// Normalize a 32-byte hash to lowercase `0x` + 64 hex characters.
pub fn normalize_hash(s: &str) -> Result<String, Error> {
    normalize_hex(s, HASH_HEX_LEN)
}

/// Normalize a 20-byte address to lowercase `0x` + 40 hex characters.
pub fn normalize_address(s: &str) -> Result<String, Error> {
    normalize_hex(s, ADDRESS_HEX_LEN)
}

/// Normalize a data payload: lowercase `0x…`, any whole number of 32-byte
/// words (including zero words).
pub fn normalize_data(s: &str) -> Result<String, Error> {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    if hex.len() % HASH_HEX_LEN != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::RpcMalformed(format!(
            "data payload is not a sequence of 32-byte hex words: {s:?}"
        )));
    }
    Ok(format!("0x{}", hex.to_ascii_lowercase()))
}

fn normalize_hex(s: &str, width: usize) -> Result<String, Error> {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    if hex.len() != width || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidQuery(format!(
            "expected {width}-character hex value, got {s:?}"
        )));
    }
    Ok(format!("0x{}", hex.to_ascii_lowercase()))
}

/// Build a fixed-width 32-byte hash from a u64 — handy for callers that
/// compare topics or data words as unsigned integers.
pub fn hash_from_u64(value: u64) -> String {
    format!("0x{value:064x}")
}
