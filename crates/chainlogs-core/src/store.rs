//! The log store trait — transactional apply/rollback plus the query
//! shapes served to callers.
//!
//! Implementations live in `chainlogs-store` (`MemoryLogStore`,
//! `SqliteLogStore`). Every method that mutates state does so in a single
//! transaction: concurrent readers observe either the pre- or the
//! post-transaction state, never an interleaving.
//!
//! Query methods take an explicit inclusive `upper_bound` block — the
//! confirmation cutoff `head − confs` computed by the caller.

use async_trait::async_trait;

use crate::error::Error;
use crate::types::{BlockHeader, ChainHead, Log};

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Apply one block in a single transaction: upsert its logs keyed by
    /// `(block_number, log_index)`, record its hash, advance the chain
    /// head. Re-applying the same block is idempotent, and applying a
    /// historical block (replay) never moves the head backward — only
    /// `rollback_above` rewinds it.
    async fn apply_block(&self, header: &BlockHeader, logs: Vec<Log>) -> Result<(), Error>;

    /// Delete all logs and block hashes above `block_number` and rewind
    /// the chain head to it, in a single transaction. Reorg rollback.
    async fn rollback_above(&self, block_number: u64) -> Result<(), Error>;

    /// The persisted chain head, if any block has been applied.
    async fn chain_head(&self) -> Result<Option<ChainHead>, Error>;

    /// The stored hash for a block, used by the divergence walk.
    async fn block_hash(&self, block_number: u64) -> Result<Option<String>, Error>;

    /// Logs for `(event_sig, address)` within `[start, end]`, ordered by
    /// `(block_number, log_index)` ascending.
    async fn logs_in_range(
        &self,
        start: u64,
        end: u64,
        event_sig: &str,
        address: &str,
    ) -> Result<Vec<Log>, Error>;

    /// Logs whose topic at `topic_index` equals one of `values`.
    async fn indexed_logs(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        values: &[String],
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error>;

    /// Logs whose topic at `topic_index`, read as an unsigned integer, is
    /// strictly greater than `min`.
    async fn indexed_logs_topic_greater_than(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        min: &str,
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error>;

    /// Logs whose topic at `topic_index` lies in `[min, max]` inclusive.
    async fn indexed_logs_topic_range(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        min: &str,
        max: &str,
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error>;

    /// Logs whose data word at `word_index`, read as an unsigned integer,
    /// is strictly greater than `min`.
    async fn logs_data_word_greater_than(
        &self,
        event_sig: &str,
        address: &str,
        word_index: usize,
        min: &str,
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error>;

    /// Logs whose data word at `word_index` lies in `[min, max]` inclusive.
    async fn logs_data_word_range(
        &self,
        event_sig: &str,
        address: &str,
        word_index: usize,
        min: &str,
        max: &str,
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error>;

    /// Most recent log for `(event_sig, address)` at or below the cutoff.
    async fn latest_log_by_event_sig(
        &self,
        event_sig: &str,
        address: &str,
        upper_bound: u64,
    ) -> Result<Option<Log>, Error>;

    /// For each `(event_sig, address)` pair drawn from the supplied sets,
    /// the most recent matching log in `[from_block, upper_bound]` — one
    /// pass, not one query per pair. Ordered by `(block_number, log_index)`.
    async fn latest_logs_by_event_sigs_addrs(
        &self,
        from_block: u64,
        event_sigs: &[String],
        addresses: &[String],
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error>;
}
