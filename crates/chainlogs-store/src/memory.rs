//! In-memory log store.
//!
//! The whole store state lives in one `Arc` snapshot that the single
//! writer replaces atomically at each commit. Readers clone the `Arc` and
//! run every query against an immutable snapshot, so a concurrently
//! committing apply or rollback is never observed half-done.
//!
//! All data is lost when the process exits. Useful for testing and
//! short-lived indexers that don't need persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use chainlogs_core::error::Error;
use chainlogs_core::store::LogStore;
use chainlogs_core::types::{BlockHeader, ChainHead, Log};

#[derive(Debug, Clone, Default)]
struct StoreState {
    /// Arena-style index: one consistent chain view, keyed by the
    /// ordering key. Rollback is a bounded range delete.
    logs: BTreeMap<(u64, u32), Log>,
    block_hashes: BTreeMap<u64, String>,
    head: Option<ChainHead>,
}

/// In-memory, snapshot-isolated log store.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    state: RwLock<Arc<StoreState>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored logs.
    pub fn log_count(&self) -> usize {
        self.snapshot().logs.len()
    }

    fn snapshot(&self) -> Arc<StoreState> {
        self.state.read().expect("store lock poisoned").clone()
    }

    /// Run `mutate` against a copy of the current state and swap the copy
    /// in atomically. The single-writer discipline upstream keeps commits
    /// strictly sequential.
    fn commit<F>(&self, mutate: F)
    where
        F: FnOnce(&mut StoreState),
    {
        let mut guard = self.state.write().expect("store lock poisoned");
        let mut next = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    fn collect<P>(
        &self,
        event_sig: &str,
        address: &str,
        upper_bound: u64,
        pred: P,
    ) -> Vec<Log>
    where
        P: Fn(&Log) -> bool,
    {
        let snap = self.snapshot();
        snap.logs
            .range(..=(upper_bound, u32::MAX))
            .map(|(_, log)| log)
            .filter(|log| log.event_sig == event_sig && log.address == address)
            .filter(|log| pred(log))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn apply_block(&self, header: &BlockHeader, logs: Vec<Log>) -> Result<(), Error> {
        for log in &logs {
            if log.block_number != header.number {
                return Err(Error::Storage(format!(
                    "log at block {} applied with header {}",
                    log.block_number, header.number
                )));
            }
        }
        self.commit(|state| {
            for log in logs {
                state.logs.insert(log.ordering_key(), log);
            }
            state.block_hashes.insert(header.number, header.hash.clone());
            // Replayed historical blocks must not rewind the head.
            let advances = state
                .head
                .as_ref()
                .map_or(true, |head| header.number >= head.block_number);
            if advances {
                state.head = Some(ChainHead::new(header.number, header.hash.clone()));
            }
        });
        Ok(())
    }

    async fn rollback_above(&self, block_number: u64) -> Result<(), Error> {
        tracing::debug!(above = block_number, "Rolling back logs");
        self.commit(|state| {
            state.logs.retain(|(number, _), _| *number <= block_number);
            state.block_hashes.retain(|number, _| *number <= block_number);
            state.head = state
                .block_hashes
                .get(&block_number)
                .map(|hash| ChainHead::new(block_number, hash.clone()));
        });
        Ok(())
    }

    async fn chain_head(&self) -> Result<Option<ChainHead>, Error> {
        Ok(self.snapshot().head.clone())
    }

    async fn block_hash(&self, block_number: u64) -> Result<Option<String>, Error> {
        Ok(self.snapshot().block_hashes.get(&block_number).cloned())
    }

    async fn logs_in_range(
        &self,
        start: u64,
        end: u64,
        event_sig: &str,
        address: &str,
    ) -> Result<Vec<Log>, Error> {
        let snap = self.snapshot();
        Ok(snap
            .logs
            .range((start, 0)..=(end, u32::MAX))
            .map(|(_, log)| log)
            .filter(|log| log.event_sig == event_sig && log.address == address)
            .cloned()
            .collect())
    }

    async fn indexed_logs(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        values: &[String],
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error> {
        Ok(self.collect(event_sig, address, upper_bound, |log| {
            log.topic(topic_index)
                .is_some_and(|t| values.iter().any(|v| v == t))
        }))
    }

    async fn indexed_logs_topic_greater_than(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        min: &str,
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error> {
        Ok(self.collect(event_sig, address, upper_bound, |log| {
            log.topic(topic_index).is_some_and(|t| t > min)
        }))
    }

    async fn indexed_logs_topic_range(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        min: &str,
        max: &str,
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error> {
        Ok(self.collect(event_sig, address, upper_bound, |log| {
            log.topic(topic_index)
                .is_some_and(|t| t >= min && t <= max)
        }))
    }

    async fn logs_data_word_greater_than(
        &self,
        event_sig: &str,
        address: &str,
        word_index: usize,
        min: &str,
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error> {
        Ok(self.collect(event_sig, address, upper_bound, |log| {
            log.data_word(word_index)
                .is_some_and(|w| w.as_str() > min)
        }))
    }

    async fn logs_data_word_range(
        &self,
        event_sig: &str,
        address: &str,
        word_index: usize,
        min: &str,
        max: &str,
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error> {
        Ok(self.collect(event_sig, address, upper_bound, |log| {
            log.data_word(word_index)
                .is_some_and(|w| w.as_str() >= min && w.as_str() <= max)
        }))
    }

    async fn latest_log_by_event_sig(
        &self,
        event_sig: &str,
        address: &str,
        upper_bound: u64,
    ) -> Result<Option<Log>, Error> {
        let snap = self.snapshot();
        Ok(snap
            .logs
            .range(..=(upper_bound, u32::MAX))
            .rev()
            .map(|(_, log)| log)
            .find(|log| log.event_sig == event_sig && log.address == address)
            .cloned())
    }

    async fn latest_logs_by_event_sigs_addrs(
        &self,
        from_block: u64,
        event_sigs: &[String],
        addresses: &[String],
        upper_bound: u64,
    ) -> Result<Vec<Log>, Error> {
        let snap = self.snapshot();
        let mut latest: HashMap<(String, String), Log> = HashMap::new();
        // Ascending walk: a later entry for the same pair overwrites.
        for (_, log) in snap.logs.range((from_block, 0)..=(upper_bound, u32::MAX)) {
            if event_sigs.contains(&log.event_sig) && addresses.contains(&log.address) {
                latest.insert((log.event_sig.clone(), log.address.clone()), log.clone());
            }
        }
        let mut out: Vec<Log> = latest.into_values().collect();
        out.sort_by_key(Log::ordering_key);
        Ok(out)
    }
}
