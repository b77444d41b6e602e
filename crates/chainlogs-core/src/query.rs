//! Query options and argument validation.
//!
//! Invalid arguments are rejected synchronously with a descriptive error;
//! a query never returns a partial result set.

use crate::error::Error;
use crate::types::{normalize_address, normalize_hash};

/// Topic positions that carry indexed values (position 0 is the event
/// signature and is always an equality constraint of its own).
pub const MIN_TOPIC_INDEX: usize = 1;
pub const MAX_TOPIC_INDEX: usize = 3;

/// Per-call query options. All fields are optional and defaulted; pass
/// `QueryOptions::default()` for the common case.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Pin the confirmation arithmetic to this head instead of the live
    /// one, so several calls observe one consistent cutoff.
    pub at_head: Option<u64>,
}

impl QueryOptions {
    /// Pin queries to an explicit head block.
    pub fn at_head(head: u64) -> Self {
        Self { at_head: Some(head) }
    }
}

/// Validate a topic position for indexed-topic queries.
pub fn validate_topic_index(topic_index: usize) -> Result<(), Error> {
    if !(MIN_TOPIC_INDEX..=MAX_TOPIC_INDEX).contains(&topic_index) {
        return Err(Error::InvalidQuery(format!(
            "topic index must be in {MIN_TOPIC_INDEX}..={MAX_TOPIC_INDEX}, got {topic_index}"
        )));
    }
    Ok(())
}

/// Validate and normalize a non-empty set of hash values.
pub fn validate_hash_set(values: &[String]) -> Result<Vec<String>, Error> {
    if values.is_empty() {
        return Err(Error::InvalidQuery("empty value set".into()));
    }
    values.iter().map(|v| normalize_hash(v)).collect()
}

/// Validate and normalize a non-empty set of addresses.
pub fn validate_address_set(values: &[String]) -> Result<Vec<String>, Error> {
    if values.is_empty() {
        return Err(Error::InvalidQuery("empty address set".into()));
    }
    values.iter().map(|v| normalize_address(v)).collect()
}

/// Validate an inclusive block range.
pub fn validate_block_range(start: u64, end: u64) -> Result<(), Error> {
    if start > end {
        return Err(Error::InvalidQuery(format!(
            "start block {start} is after end block {end}"
        )));
    }
    Ok(())
}
