//! The reorg-aware poll loop and the public query surface.
//!
//! # Each cycle
//! 1. Fetch the remote tip header.
//! 2. Verify the locally stored head is still on the remote chain. A hash
//!    mismatch triggers a backward walk to the common ancestor (bounded by
//!    `max_reorg_depth`), a one-transaction rollback, and re-apply.
//! 3. Apply `local+1 ..= tip` sequentially, filtering logs through the
//!    registry snapshot, one transaction per block.
//! 4. Sleep until the next interval. Shutdown interrupts the sleep and the
//!    gaps between blocks, never an in-flight transaction.
//!
//! All writes — poll cycles and replays alike — run on this one task, so
//! the apply/rollback history is strictly sequential.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use chainlogs_core::config::{PollerConfig, ReorgOverflowPolicy};
use chainlogs_core::error::Error;
use chainlogs_core::filter::FilterRegistry;
use chainlogs_core::query::{self, QueryOptions};
use chainlogs_core::store::LogStore;
use chainlogs_core::types::{normalize_address, normalize_hash, BlockHeader, Log};

use crate::client::ChainClient;

/// Pending replay requests queue up behind the writer; callers block once
/// this many are outstanding.
const REPLAY_QUEUE_DEPTH: usize = 16;

#[derive(Debug)]
struct Status {
    synced_once: bool,
    fatal: Option<Error>,
    consecutive_failures: u32,
    last_progress: Instant,
}

struct Inner<C, S> {
    client: C,
    store: S,
    config: PollerConfig,
    filters: FilterRegistry,
    replay_tx: mpsc::Sender<u64>,
    status: Mutex<Status>,
}

/// The log poller: owns the background poll task, the filter registry,
/// and the store, and answers confirmation-aware queries.
pub struct LogPoller<C: ChainClient + 'static, S: LogStore + 'static> {
    inner: Arc<Inner<C, S>>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    replay_rx: Mutex<Option<mpsc::Receiver<u64>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C: ChainClient + 'static, S: LogStore + 'static> LogPoller<C, S> {
    pub fn new(client: C, store: S, config: PollerConfig) -> Self {
        let (replay_tx, replay_rx) = mpsc::channel(REPLAY_QUEUE_DEPTH);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                client,
                store,
                config,
                filters: FilterRegistry::new(),
                replay_tx,
                status: Mutex::new(Status {
                    synced_once: false,
                    fatal: None,
                    consecutive_failures: 0,
                    last_progress: Instant::now(),
                }),
            }),
            started: AtomicBool::new(false),
            shutdown,
            replay_rx: Mutex::new(Some(replay_rx)),
            handle: Mutex::new(None),
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────

    /// Spawn the background poll task. Errors on a second call.
    pub fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let replay_rx = self
            .replay_rx
            .lock()
            .expect("poller lock poisoned")
            .take()
            .ok_or(Error::AlreadyStarted)?;
        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(run_loop(inner, shutdown, replay_rx));
        *self.handle.lock().expect("poller lock poisoned") = Some(handle);
        Ok(())
    }

    /// Signal shutdown and wait for the poll task to finish. The signal
    /// interrupts the inter-cycle sleep promptly; an in-flight transaction
    /// always reaches a consistent commit first.
    pub async fn close(&self) -> Result<(), Error> {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().expect("poller lock poisoned").take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| Error::Unhealthy(format!("poll task failed: {e}")))?;
        }
        Ok(())
    }

    /// `Ok` once the initial chain-head sync has completed at least once.
    pub fn ready(&self) -> Result<(), Error> {
        let status = self.inner.status.lock().expect("poller lock poisoned");
        if status.synced_once {
            Ok(())
        } else {
            Err(Error::NotReady(
                "initial chain-head sync has not completed".into(),
            ))
        }
    }

    /// `Ok` while no fatal error is recorded and the loop keeps making
    /// progress within the configured grace period.
    pub fn healthy(&self) -> Result<(), Error> {
        let status = self.inner.status.lock().expect("poller lock poisoned");
        if let Some(fatal) = &status.fatal {
            return Err(fatal.clone());
        }
        if status.consecutive_failures >= self.inner.config.max_consecutive_failures {
            return Err(Error::Unhealthy(format!(
                "{} consecutive poll failures",
                status.consecutive_failures
            )));
        }
        if self.started.load(Ordering::SeqCst) && status.synced_once {
            let grace = Duration::from_millis(self.inner.config.unhealthy_after_ms);
            if status.last_progress.elapsed() > grace {
                return Err(Error::Unhealthy(
                    "no poll progress past the grace period".into(),
                ));
            }
        }
        Ok(())
    }

    // ─── Filters & replay ─────────────────────────────────────────────────

    /// Merge an `(address, event signatures)` filter into the active set;
    /// observed by the next poll cycle. See [`FilterRegistry::merge`].
    pub fn merge_filter(&self, topics: &[String], address: &str) -> Result<(), Error> {
        self.inner.filters.merge(topics, address)
    }

    /// Queue a re-scan from `from_block` through the current head, using
    /// the same idempotent apply path as normal polling. Rejected — never
    /// clamped — if the block is beyond the head or below the earliest
    /// retained block, and rejected with `NotReady` while the poll loop
    /// is not running (a queued request would otherwise sit unserved).
    pub async fn replay(&self, from_block: u64) -> Result<(), Error> {
        if let Some(fatal) = self.inner.fatal_error() {
            return Err(fatal);
        }
        let head = self.inner.store.chain_head().await?.ok_or_else(|| {
            Error::NotReady("initial chain-head sync has not completed".into())
        })?;
        if from_block > head.block_number {
            return Err(Error::ReplayRange(format!(
                "from block {from_block} is beyond the current head {}",
                head.block_number
            )));
        }
        if from_block < self.inner.config.start_block {
            return Err(Error::ReplayRange(format!(
                "from block {from_block} is below the earliest retained block {}",
                self.inner.config.start_block
            )));
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotReady("poll loop is not running".into()));
        }
        self.inner
            .replay_tx
            .send(from_block)
            .await
            .map_err(|_| Error::Stopped)
    }

    // ─── Queries ──────────────────────────────────────────────────────────

    /// The latest locally applied block number.
    pub async fn latest_block(&self, opts: QueryOptions) -> Result<u64, Error> {
        if let Some(head) = opts.at_head {
            return Ok(head);
        }
        self.inner
            .store
            .chain_head()
            .await?
            .map(|head| head.block_number)
            .ok_or_else(|| Error::NotReady("no blocks applied yet".into()))
    }

    /// The confirmation cutoff, or `None` when fewer than `confs` blocks
    /// exist — nothing can satisfy the query, which is not an error.
    async fn cutoff(&self, confs: u64, opts: QueryOptions) -> Result<Option<u64>, Error> {
        Ok(self.latest_block(opts).await?.checked_sub(confs))
    }

    /// Logs for `(event_sig, address)` in `[start, end]`, ordered by
    /// `(block_number, log_index)` ascending.
    pub async fn logs(
        &self,
        start: u64,
        end: u64,
        event_sig: &str,
        address: &str,
        opts: QueryOptions,
    ) -> Result<Vec<Log>, Error> {
        query::validate_block_range(start, end)?;
        let event_sig = normalize_hash(event_sig)?;
        let address = normalize_address(address)?;
        let head = self.latest_block(opts).await?;
        self.inner
            .store
            .logs_in_range(start, end.min(head), &event_sig, &address)
            .await
    }

    /// Logs whose topic at `topic_index` equals one of `values`.
    pub async fn indexed_logs(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        values: &[String],
        confs: u64,
        opts: QueryOptions,
    ) -> Result<Vec<Log>, Error> {
        query::validate_topic_index(topic_index)?;
        let values = query::validate_hash_set(values)?;
        let event_sig = normalize_hash(event_sig)?;
        let address = normalize_address(address)?;
        match self.cutoff(confs, opts).await? {
            Some(upper) => {
                self.inner
                    .store
                    .indexed_logs(&event_sig, &address, topic_index, &values, upper)
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    /// Logs whose topic at `topic_index`, as an unsigned integer, is
    /// strictly greater than `min`.
    pub async fn indexed_logs_topic_greater_than(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        min: &str,
        confs: u64,
        opts: QueryOptions,
    ) -> Result<Vec<Log>, Error> {
        query::validate_topic_index(topic_index)?;
        let min = normalize_hash(min)?;
        let event_sig = normalize_hash(event_sig)?;
        let address = normalize_address(address)?;
        match self.cutoff(confs, opts).await? {
            Some(upper) => {
                self.inner
                    .store
                    .indexed_logs_topic_greater_than(&event_sig, &address, topic_index, &min, upper)
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    /// Logs whose topic at `topic_index` lies in `[min, max]` inclusive.
    pub async fn indexed_logs_topic_range(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        min: &str,
        max: &str,
        confs: u64,
        opts: QueryOptions,
    ) -> Result<Vec<Log>, Error> {
        query::validate_topic_index(topic_index)?;
        let min = normalize_hash(min)?;
        let max = normalize_hash(max)?;
        let event_sig = normalize_hash(event_sig)?;
        let address = normalize_address(address)?;
        match self.cutoff(confs, opts).await? {
            Some(upper) => {
                self.inner
                    .store
                    .indexed_logs_topic_range(&event_sig, &address, topic_index, &min, &max, upper)
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    /// Logs whose data word at `word_index`, as an unsigned integer, is
    /// strictly greater than `min`. A payload shorter than the requested
    /// word simply does not match.
    pub async fn logs_data_word_greater_than(
        &self,
        event_sig: &str,
        address: &str,
        word_index: usize,
        min: &str,
        confs: u64,
        opts: QueryOptions,
    ) -> Result<Vec<Log>, Error> {
        let min = normalize_hash(min)?;
        let event_sig = normalize_hash(event_sig)?;
        let address = normalize_address(address)?;
        match self.cutoff(confs, opts).await? {
            Some(upper) => {
                self.inner
                    .store
                    .logs_data_word_greater_than(&event_sig, &address, word_index, &min, upper)
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    /// Logs whose data word at `word_index` lies in `[min, max]` inclusive.
    pub async fn logs_data_word_range(
        &self,
        event_sig: &str,
        address: &str,
        word_index: usize,
        min: &str,
        max: &str,
        confs: u64,
        opts: QueryOptions,
    ) -> Result<Vec<Log>, Error> {
        let min = normalize_hash(min)?;
        let max = normalize_hash(max)?;
        let event_sig = normalize_hash(event_sig)?;
        let address = normalize_address(address)?;
        match self.cutoff(confs, opts).await? {
            Some(upper) => {
                self.inner
                    .store
                    .logs_data_word_range(&event_sig, &address, word_index, &min, &max, upper)
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    /// Most recent log for `(event_sig, address)` at or below the cutoff.
    pub async fn latest_log_by_event_sig(
        &self,
        event_sig: &str,
        address: &str,
        confs: u64,
        opts: QueryOptions,
    ) -> Result<Option<Log>, Error> {
        let event_sig = normalize_hash(event_sig)?;
        let address = normalize_address(address)?;
        match self.cutoff(confs, opts).await? {
            Some(upper) => {
                self.inner
                    .store
                    .latest_log_by_event_sig(&event_sig, &address, upper)
                    .await
            }
            None => Ok(None),
        }
    }

    /// Newest log per `(event_sig, address)` pair, floor `from_block`, in
    /// one pass. Ordered by `(block_number, log_index)`.
    pub async fn latest_logs_by_event_sigs_addrs(
        &self,
        from_block: u64,
        event_sigs: &[String],
        addresses: &[String],
        opts: QueryOptions,
    ) -> Result<Vec<Log>, Error> {
        let event_sigs = query::validate_hash_set(event_sigs)?;
        let addresses = query::validate_address_set(addresses)?;
        let head = self.latest_block(opts).await?;
        self.inner
            .store
            .latest_logs_by_event_sigs_addrs(from_block, &event_sigs, &addresses, head)
            .await
    }
}

// ─── The poll loop ────────────────────────────────────────────────────────────

async fn run_loop<C: ChainClient, S: LogStore>(
    inner: Arc<Inner<C, S>>,
    mut shutdown: watch::Receiver<bool>,
    mut replay_rx: mpsc::Receiver<u64>,
) {
    let interval = Duration::from_millis(inner.config.poll_interval_ms);
    tracing::info!(
        poll_interval_ms = inner.config.poll_interval_ms,
        "Poll loop started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }
        if inner.fatal_error().is_none() {
            // Replays queue behind the same writer as ordinary cycles.
            while let Ok(from_block) = replay_rx.try_recv() {
                let result = inner.run_replay(from_block, &shutdown).await;
                inner.observe("replay", result);
            }
            let result = inner.run_cycle(&shutdown).await;
            inner.observe("poll", result);
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
    tracing::info!("Poll loop stopped");
}

impl<C: ChainClient, S: LogStore> Inner<C, S> {
    fn fatal_error(&self) -> Option<Error> {
        self.status.lock().expect("poller lock poisoned").fatal.clone()
    }

    fn observe(&self, phase: &str, result: Result<(), Error>) {
        let mut status = self.status.lock().expect("poller lock poisoned");
        match result {
            Ok(()) => {
                status.consecutive_failures = 0;
                status.last_progress = Instant::now();
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, phase, "Fatal error; poll loop stops advancing");
                status.fatal = Some(e);
            }
            Err(e) => {
                status.consecutive_failures += 1;
                tracing::warn!(
                    error = %e,
                    phase,
                    failures = status.consecutive_failures,
                    "Cycle failed; retrying next interval"
                );
            }
        }
    }

    async fn header_at(&self, number: u64) -> Result<BlockHeader, Error> {
        self.client
            .header_by_number(number)
            .await?
            .ok_or_else(|| Error::RpcTransient(format!("header {number} not available yet")))
    }

    async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> Result<(), Error> {
        let tip = self.client.latest_header().await?;
        let resume_from = match self.store.chain_head().await? {
            None => self.config.start_block,
            Some(local) => {
                // Verify the stored head is still on the remote chain.
                let check_at = local.block_number.min(tip.number);
                let remote = self.header_at(check_at).await?;
                let stored = if check_at == local.block_number {
                    Some(local.block_hash.clone())
                } else {
                    self.store.block_hash(check_at).await?
                };
                match stored {
                    Some(hash) if hash != remote.hash => {
                        self.repair_reorg(check_at, local.block_number, &tip).await?
                    }
                    _ => check_at + 1,
                }
            }
        };

        self.apply_forward(resume_from, tip.number, shutdown).await?;

        let mut status = self.status.lock().expect("poller lock poisoned");
        status.synced_once = true;
        Ok(())
    }

    /// Roll the store back to the common ancestor and return the first
    /// block to re-apply. Past `max_reorg_depth` the configured overflow
    /// policy decides between halting and re-anchoring at the tip.
    async fn repair_reorg(
        &self,
        diverged_at: u64,
        local_head: u64,
        tip: &BlockHeader,
    ) -> Result<u64, Error> {
        match self.find_common_ancestor(diverged_at, local_head).await {
            Ok(ancestor) => {
                tracing::warn!(
                    ancestor,
                    diverged_at,
                    local_head,
                    depth = local_head - ancestor,
                    "Reorg detected; rolling back to common ancestor"
                );
                self.store.rollback_above(ancestor).await?;
                Ok(ancestor + 1)
            }
            Err(e)
                if e.is_fatal()
                    && self.config.reorg_overflow == ReorgOverflowPolicy::ResyncFromTip =>
            {
                let boundary = self.config.finalized_below(local_head);
                tracing::error!(
                    error = %e,
                    boundary,
                    tip = tip.number,
                    "Reorg beyond repairable depth; re-anchoring at remote tip, gap left for replay"
                );
                self.store.rollback_above(boundary).await?;
                Ok(tip.number)
            }
            Err(e) => Err(e),
        }
    }

    /// Walk backward from the divergence point comparing stored vs. remote
    /// hashes until they agree.
    async fn find_common_ancestor(&self, diverged_at: u64, local_head: u64) -> Result<u64, Error> {
        let finalized = self.config.finalized_below(local_head);
        let max_depth = self.config.max_reorg_depth;
        let too_deep = Error::ReorgTooDeep {
            block_number: diverged_at,
            max_depth,
        };

        let mut n = match diverged_at.checked_sub(1) {
            Some(n) => n,
            None => return Err(too_deep),
        };
        loop {
            if local_head.saturating_sub(n) > max_depth {
                return Err(too_deep);
            }
            let Some(stored) = self.store.block_hash(n).await? else {
                // Below the retained range; nothing left to compare.
                return Err(too_deep);
            };
            let remote = self.header_at(n).await?;
            if stored == remote.hash {
                return Ok(n);
            }
            if n <= finalized {
                return Err(Error::FinalityViolation { finalized });
            }
            if n == 0 || n <= self.config.start_block {
                return Err(too_deep);
            }
            n -= 1;
        }
    }

    /// Apply `[from, to]` sequentially, one transaction per block, capped
    /// at `max_blocks_per_cycle`. Returns the next block not applied.
    /// Stops early — between transactions, never mid-apply — on shutdown,
    /// a receding tip, or a parent-hash mismatch (handled by the next
    /// cycle's divergence walk).
    async fn apply_forward(
        &self,
        from: u64,
        to: u64,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<u64, Error> {
        if from > to {
            return Ok(from);
        }
        let span = self.config.max_blocks_per_cycle.max(1);
        let capped = to.min(from.saturating_add(span - 1));
        let filters = self.filters.snapshot();
        let mut prev_hash = match from.checked_sub(1) {
            Some(parent) => self.store.block_hash(parent).await?,
            None => None,
        };

        let mut next = from;
        let mut applied = 0u64;
        while next <= capped {
            if *shutdown.borrow() {
                break;
            }
            let Some(header) = self.client.header_by_number(next).await? else {
                break; // tip receded; re-checked next cycle
            };
            if let Some(prev) = &prev_hash {
                if header.parent_hash != *prev {
                    tracing::warn!(
                        block = next,
                        "Parent hash mismatch while applying; deferring to divergence walk"
                    );
                    break;
                }
            }
            let raw = self.client.logs_for_block(&header.hash, &filters).await?;
            let mut logs = Vec::with_capacity(raw.len());
            for candidate in raw {
                if candidate.is_removed() {
                    continue;
                }
                let log = candidate.into_log()?;
                if filters.matches(&log.address, &log.event_sig) {
                    logs.push(log);
                }
            }
            let count = logs.len();
            self.store.apply_block(&header, logs).await?;
            tracing::debug!(block = next, logs = count, "Applied block");
            prev_hash = Some(header.hash);
            applied += 1;
            next += 1;
        }
        if applied > 0 {
            tracing::info!(from, applied, at = next - 1, "Applied block range");
        }
        Ok(next)
    }

    /// Re-apply `[from_block, head]` through the ordinary apply path.
    /// Nothing below `from_block` is touched; finalized rows stay intact.
    async fn run_replay(
        &self,
        from_block: u64,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let Some(head) = self.store.chain_head().await? else {
            return Err(Error::NotReady("no blocks applied yet".into()));
        };
        let to = head.block_number;
        tracing::info!(from_block, to, "Replaying block range");

        let mut cursor = from_block;
        while cursor <= to {
            if *shutdown.borrow() {
                break;
            }
            let next = self.apply_forward(cursor, to, shutdown).await?;
            if next == cursor {
                break; // no progress: shutdown or receding tip
            }
            cursor = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RawLog;
    use async_trait::async_trait;
    use chainlogs_core::filter::FilterSet;
    use chainlogs_core::types::hash_from_u64;
    use chainlogs_store::MemoryLogStore;
    use std::collections::HashMap;

    const SIG_A: u64 = 0x51;
    const SIG_B: u64 = 0x52;

    fn addr() -> String {
        format!("0x{:040x}", 0xAAu64)
    }

    /// Hash for block `number` on chain branch `fork` (0 = original chain).
    fn h(fork: u64, number: u64) -> String {
        hash_from_u64(0x0010_0000 * (fork + 1) + number)
    }

    fn header(fork: u64, number: u64, parent_fork: u64) -> BlockHeader {
        BlockHeader {
            number,
            hash: h(fork, number),
            parent_hash: if number == 0 {
                hash_from_u64(0)
            } else {
                h(parent_fork, number - 1)
            },
            timestamp: (number * 12) as i64,
        }
    }

    fn raw(block: &BlockHeader, index: u32, sig: u64, topic1: u64, word0: u64) -> RawLog {
        RawLog {
            address: addr(),
            topics: vec![hash_from_u64(sig), hash_from_u64(topic1)],
            data: hash_from_u64(word0),
            block_number: format!("0x{:x}", block.number),
            block_hash: block.hash.clone(),
            tx_hash: hash_from_u64(0x9000 + block.number),
            log_index: format!("0x{index:x}"),
            removed: None,
        }
    }

    #[derive(Default)]
    struct FakeChain {
        headers: std::sync::Mutex<Vec<BlockHeader>>,
        logs: std::sync::Mutex<HashMap<String, Vec<RawLog>>>,
        fail_next: std::sync::Mutex<Option<Error>>,
    }

    impl FakeChain {
        fn extend(&self, header: BlockHeader, logs: Vec<RawLog>) {
            self.logs.lock().unwrap().insert(header.hash.clone(), logs);
            self.headers.lock().unwrap().push(header);
        }

        /// Drop everything above `ancestor` and graft `fork` on.
        fn reorg_to(&self, ancestor: u64, fork: Vec<(BlockHeader, Vec<RawLog>)>) {
            self.headers
                .lock()
                .unwrap()
                .retain(|header| header.number <= ancestor);
            for (header, logs) in fork {
                self.extend(header, logs);
            }
        }

        fn fail_next_with(&self, e: Error) {
            *self.fail_next.lock().unwrap() = Some(e);
        }
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn latest_header(&self) -> Result<BlockHeader, Error> {
            if let Some(e) = self.fail_next.lock().unwrap().take() {
                return Err(e);
            }
            self.headers
                .lock()
                .unwrap()
                .last()
                .cloned()
                .ok_or_else(|| Error::RpcTransient("empty chain".into()))
        }

        async fn header_by_number(&self, number: u64) -> Result<Option<BlockHeader>, Error> {
            Ok(self
                .headers
                .lock()
                .unwrap()
                .iter()
                .find(|header| header.number == number)
                .cloned())
        }

        async fn logs_for_block(
            &self,
            block_hash: &str,
            _filters: &FilterSet,
        ) -> Result<Vec<RawLog>, Error> {
            Ok(self
                .logs
                .lock()
                .unwrap()
                .get(block_hash)
                .cloned()
                .unwrap_or_default())
        }
    }

    type TestPoller = LogPoller<FakeChain, MemoryLogStore>;

    fn poller(config: PollerConfig) -> (TestPoller, watch::Receiver<bool>) {
        let poller = LogPoller::new(FakeChain::default(), MemoryLogStore::new(), config);
        poller
            .merge_filter(&[hash_from_u64(SIG_A)], &addr())
            .unwrap();
        let shutdown = poller.shutdown.subscribe();
        (poller, shutdown)
    }

    /// Main chain blocks `0..=to`, one SIG_A log each: topic1 = word0 = n.
    fn seed_main_chain(poller: &TestPoller, to: u64) {
        for n in 0..=to {
            let header = header(0, n, 0);
            let log = raw(&header, 0, SIG_A, n, n);
            poller.inner.client.extend(header, vec![log]);
        }
    }

    async fn all_logs(poller: &TestPoller) -> Vec<Log> {
        poller
            .inner
            .store
            .logs_in_range(0, u64::MAX, &hash_from_u64(SIG_A), &addr())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn initial_sync_is_idempotent() {
        let (poller, shutdown) = poller(PollerConfig::default());
        seed_main_chain(&poller, 5);

        assert!(matches!(poller.ready(), Err(Error::NotReady(_))));
        poller.inner.run_cycle(&shutdown).await.unwrap();

        assert!(poller.ready().is_ok());
        assert_eq!(poller.inner.store.log_count(), 6);
        assert_eq!(poller.latest_block(QueryOptions::default()).await.unwrap(), 5);

        // A second cycle with no new blocks changes nothing.
        poller.inner.run_cycle(&shutdown).await.unwrap();
        assert_eq!(poller.inner.store.log_count(), 6);
    }

    #[tokio::test]
    async fn only_registered_filters_are_retained() {
        let (poller, shutdown) = poller(PollerConfig::default());
        for n in 0..=3u64 {
            let header = header(0, n, 0);
            let logs = vec![raw(&header, 0, SIG_A, n, n), raw(&header, 1, SIG_B, n, n)];
            poller.inner.client.extend(header, logs);
        }

        poller.inner.run_cycle(&shutdown).await.unwrap();

        assert_eq!(poller.inner.store.log_count(), 4);
        let b_logs = poller
            .logs(0, 3, &hash_from_u64(SIG_B), &addr(), QueryOptions::default())
            .await
            .unwrap();
        assert!(b_logs.is_empty());
    }

    #[tokio::test]
    async fn widened_filter_applies_from_merge_onward() {
        let (poller, shutdown) = poller(PollerConfig::default());
        for n in 0..=3u64 {
            let header = header(0, n, 0);
            let logs = vec![raw(&header, 0, SIG_A, n, n), raw(&header, 1, SIG_B, n, n)];
            poller.inner.client.extend(header, logs);
        }
        poller.inner.run_cycle(&shutdown).await.unwrap();

        poller
            .merge_filter(&[hash_from_u64(SIG_A), hash_from_u64(SIG_B)], &addr())
            .unwrap();
        let header4 = header(0, 4, 0);
        let logs4 = vec![raw(&header4, 0, SIG_A, 4, 4), raw(&header4, 1, SIG_B, 4, 4)];
        poller.inner.client.extend(header4, logs4);
        poller.inner.run_cycle(&shutdown).await.unwrap();

        // SIG_B retained only from the merge onward; history unchanged.
        let b_logs = poller
            .logs(0, 4, &hash_from_u64(SIG_B), &addr(), QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(b_logs.len(), 1);
        assert_eq!(b_logs[0].block_number, 4);
    }

    #[tokio::test]
    async fn reorg_replaces_forked_blocks_exactly() {
        let (poller, shutdown) = poller(PollerConfig::default());
        seed_main_chain(&poller, 5);
        poller.inner.run_cycle(&shutdown).await.unwrap();

        // Fork at ancestor 2: new blocks 3..=6 on branch 1.
        let mut fork = Vec::new();
        for n in 3..=6u64 {
            let parent_fork = if n == 3 { 0 } else { 1 };
            let header = header(1, n, parent_fork);
            let log = raw(&header, 0, SIG_A, 100 + n, 100 + n);
            fork.push((header, vec![log]));
        }
        poller.inner.client.reorg_to(2, fork);

        poller.inner.run_cycle(&shutdown).await.unwrap();

        let head = poller.inner.store.chain_head().await.unwrap().unwrap();
        assert_eq!(head.block_number, 6);
        assert_eq!(head.block_hash, h(1, 6));

        let logs = all_logs(&poller).await;
        assert_eq!(logs.len(), 7);
        for log in &logs {
            let expected_fork = if log.block_number <= 2 { 0 } else { 1 };
            assert_eq!(log.block_hash, h(expected_fork, log.block_number));
        }
        // The orphaned branch's payloads are gone.
        assert_eq!(logs[3].topic(1), Some(hash_from_u64(103).as_str()));
    }

    #[tokio::test]
    async fn reorg_past_max_depth_halts() {
        let config = PollerConfig {
            max_reorg_depth: 2,
            ..Default::default()
        };
        let (poller, shutdown) = poller(config);
        seed_main_chain(&poller, 5);
        poller.inner.run_cycle(&shutdown).await.unwrap();
        let before = all_logs(&poller).await;

        let mut fork = Vec::new();
        for n in 3..=6u64 {
            let parent_fork = if n == 3 { 0 } else { 1 };
            let header = header(1, n, parent_fork);
            fork.push((header, vec![]));
        }
        poller.inner.client.reorg_to(2, fork);

        let result = poller.inner.run_cycle(&shutdown).await;
        assert!(matches!(result, Err(Error::ReorgTooDeep { .. })));

        // Nothing was rolled back, and the error is sticky once observed.
        assert_eq!(all_logs(&poller).await, before);
        poller.inner.observe("poll", result);
        assert!(matches!(poller.healthy(), Err(Error::ReorgTooDeep { .. })));
        assert!(matches!(
            poller.replay(3).await,
            Err(Error::ReorgTooDeep { .. })
        ));
    }

    #[tokio::test]
    async fn divergence_below_finality_is_a_violation() {
        let config = PollerConfig {
            finality_depth: 1,
            ..Default::default()
        };
        let (poller, shutdown) = poller(config);
        seed_main_chain(&poller, 5);
        poller.inner.run_cycle(&shutdown).await.unwrap();

        let mut fork = Vec::new();
        for n in 3..=6u64 {
            let parent_fork = if n == 3 { 0 } else { 1 };
            fork.push((header(1, n, parent_fork), vec![]));
        }
        poller.inner.client.reorg_to(2, fork);

        // With head 5 the finalized boundary is 4; the walk hits a mismatch
        // there before reaching the true ancestor at 2.
        let result = poller.inner.run_cycle(&shutdown).await;
        assert!(matches!(
            result,
            Err(Error::FinalityViolation { finalized: 4 })
        ));
    }

    #[tokio::test]
    async fn resync_from_tip_leaves_gap_replay_fills() {
        let config = PollerConfig {
            max_reorg_depth: 2,
            finality_depth: 3,
            reorg_overflow: ReorgOverflowPolicy::ResyncFromTip,
            ..Default::default()
        };
        let (poller, shutdown) = poller(config);
        seed_main_chain(&poller, 5);
        poller.inner.run_cycle(&shutdown).await.unwrap();

        let mut fork = Vec::new();
        for n in 3..=6u64 {
            let parent_fork = if n == 3 { 0 } else { 1 };
            let header = header(1, n, parent_fork);
            let log = raw(&header, 0, SIG_A, 100 + n, 100 + n);
            fork.push((header, vec![log]));
        }
        poller.inner.client.reorg_to(2, fork);

        poller.inner.run_cycle(&shutdown).await.unwrap();

        // Rolled back to the finality boundary (5 - 3 = 2), re-anchored at
        // the tip, blocks 3..=5 left as a gap.
        let head = poller.inner.store.chain_head().await.unwrap().unwrap();
        assert_eq!(head.block_number, 6);
        let logs = all_logs(&poller).await;
        let blocks: Vec<u64> = logs.iter().map(|log| log.block_number).collect();
        assert_eq!(blocks, vec![0, 1, 2, 6]);

        poller.inner.run_replay(3, &shutdown).await.unwrap();
        let logs = all_logs(&poller).await;
        let blocks: Vec<u64> = logs.iter().map(|log| log.block_number).collect();
        assert_eq!(blocks, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(logs[4].block_hash, h(1, 4));
    }

    #[tokio::test]
    async fn replay_is_idempotent_and_bounded() {
        let (poller, shutdown) = poller(PollerConfig::default());
        seed_main_chain(&poller, 8);
        poller.inner.run_cycle(&shutdown).await.unwrap();
        let before = all_logs(&poller).await;

        poller.inner.run_replay(4, &shutdown).await.unwrap();

        // Same logs, same head; nothing below the replay start was touched.
        assert_eq!(all_logs(&poller).await, before);
        let head = poller.inner.store.chain_head().await.unwrap().unwrap();
        assert_eq!(head.block_number, 8);
    }

    #[tokio::test]
    async fn replay_rejects_out_of_range_blocks() {
        let config = PollerConfig {
            start_block: 3,
            ..Default::default()
        };
        let (poller, shutdown) = poller(config);

        // Before any sync there is no head to replay against.
        assert!(matches!(poller.replay(5).await, Err(Error::NotReady(_))));

        seed_main_chain(&poller, 8);
        poller.inner.run_cycle(&shutdown).await.unwrap();

        assert!(matches!(poller.replay(9).await, Err(Error::ReplayRange(_))));
        assert!(matches!(poller.replay(1).await, Err(Error::ReplayRange(_))));
    }

    #[tokio::test]
    async fn replay_requires_a_running_loop() {
        let (poller, shutdown) = poller(PollerConfig::default());
        seed_main_chain(&poller, 5);
        poller.inner.run_cycle(&shutdown).await.unwrap();

        // Valid range, but nothing is draining the queue yet.
        assert!(matches!(poller.replay(3).await, Err(Error::NotReady(_))));
    }

    #[tokio::test]
    async fn start_block_skips_earlier_history() {
        let config = PollerConfig {
            start_block: 3,
            ..Default::default()
        };
        let (poller, shutdown) = poller(config);
        seed_main_chain(&poller, 6);
        poller.inner.run_cycle(&shutdown).await.unwrap();

        let blocks: Vec<u64> = all_logs(&poller)
            .await
            .iter()
            .map(|log| log.block_number)
            .collect();
        assert_eq!(blocks, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn cycles_are_capped_at_max_blocks() {
        let config = PollerConfig {
            max_blocks_per_cycle: 4,
            ..Default::default()
        };
        let (poller, shutdown) = poller(config);
        seed_main_chain(&poller, 9);

        poller.inner.run_cycle(&shutdown).await.unwrap();
        assert_eq!(
            poller.latest_block(QueryOptions::default()).await.unwrap(),
            3
        );

        poller.inner.run_cycle(&shutdown).await.unwrap();
        poller.inner.run_cycle(&shutdown).await.unwrap();
        assert_eq!(
            poller.latest_block(QueryOptions::default()).await.unwrap(),
            9
        );
        assert_eq!(poller.inner.store.log_count(), 10);
    }

    #[tokio::test]
    async fn confirmation_cutoff_scopes_queries() {
        let (poller, shutdown) = poller(PollerConfig::default());
        seed_main_chain(&poller, 10);
        poller.inner.run_cycle(&shutdown).await.unwrap();
        let opts = QueryOptions::default();

        let latest = poller
            .latest_log_by_event_sig(&hash_from_u64(SIG_A), &addr(), 3, opts)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.block_number, 7);

        // More confirmations than blocks: empty, not an error.
        let none = poller
            .indexed_logs(
                &hash_from_u64(SIG_A),
                &addr(),
                1,
                &[hash_from_u64(5)],
                100,
                opts,
            )
            .await
            .unwrap();
        assert!(none.is_empty());

        // Pinning the head reproduces an earlier answer.
        let pinned = poller
            .latest_log_by_event_sig(&hash_from_u64(SIG_A), &addr(), 0, QueryOptions::at_head(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pinned.block_number, 5);
    }

    #[tokio::test]
    async fn topic_and_word_queries_honor_bounds() {
        let (poller, shutdown) = poller(PollerConfig::default());
        seed_main_chain(&poller, 10);
        poller.inner.run_cycle(&shutdown).await.unwrap();
        let sig = hash_from_u64(SIG_A);
        let opts = QueryOptions::default();

        let gt = poller
            .indexed_logs_topic_greater_than(&sig, &addr(), 1, &hash_from_u64(7), 0, opts)
            .await
            .unwrap();
        let blocks: Vec<u64> = gt.iter().map(|log| log.block_number).collect();
        assert_eq!(blocks, vec![8, 9, 10]); // strict: 7 itself excluded

        let range = poller
            .indexed_logs_topic_range(&sig, &addr(), 1, &hash_from_u64(3), &hash_from_u64(5), 0, opts)
            .await
            .unwrap();
        let blocks: Vec<u64> = range.iter().map(|log| log.block_number).collect();
        assert_eq!(blocks, vec![3, 4, 5]); // inclusive ends

        let words = poller
            .logs_data_word_range(&sig, &addr(), 0, &hash_from_u64(2), &hash_from_u64(4), 3, opts)
            .await
            .unwrap();
        let blocks: Vec<u64> = words.iter().map(|log| log.block_number).collect();
        assert_eq!(blocks, vec![2, 3, 4]);

        let pairs = poller
            .latest_logs_by_event_sigs_addrs(4, &[sig.clone()], &[addr()], opts)
            .await
            .unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].block_number, 10);
    }

    #[tokio::test]
    async fn malformed_query_arguments_are_rejected() {
        let (poller, shutdown) = poller(PollerConfig::default());
        seed_main_chain(&poller, 3);
        poller.inner.run_cycle(&shutdown).await.unwrap();
        let sig = hash_from_u64(SIG_A);
        let opts = QueryOptions::default();

        assert!(matches!(
            poller.indexed_logs(&sig, &addr(), 0, &[hash_from_u64(1)], 0, opts).await,
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            poller.indexed_logs(&sig, &addr(), 1, &[], 0, opts).await,
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            poller.logs(5, 2, &sig, &addr(), opts).await,
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            poller.logs(0, 3, &sig, "0xnothex", opts).await,
            Err(Error::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn transient_failures_accumulate_until_unhealthy() {
        let config = PollerConfig {
            max_consecutive_failures: 3,
            ..Default::default()
        };
        let (poller, shutdown) = poller(config);
        seed_main_chain(&poller, 3);
        poller.inner.run_cycle(&shutdown).await.unwrap();

        for _ in 0..2 {
            poller
                .inner
                .client
                .fail_next_with(Error::RpcTransient("connection reset".into()));
            let result = poller.inner.run_cycle(&shutdown).await;
            assert!(matches!(result, Err(Error::RpcTransient(_))));
            poller.inner.observe("poll", result);
        }
        assert!(poller.healthy().is_ok());

        poller
            .inner
            .client
            .fail_next_with(Error::RpcTransient("connection reset".into()));
        let result = poller.inner.run_cycle(&shutdown).await;
        poller.inner.observe("poll", result);
        assert!(matches!(poller.healthy(), Err(Error::Unhealthy(_))));

        // One good cycle clears the streak.
        poller.inner.observe("poll", poller.inner.run_cycle(&shutdown).await);
        assert!(poller.healthy().is_ok());
    }

    #[tokio::test]
    async fn start_and_close_lifecycle() {
        let config = PollerConfig {
            poll_interval_ms: 10,
            ..Default::default()
        };
        let (poller, _shutdown) = poller(config);
        seed_main_chain(&poller, 4);

        poller.start().unwrap();
        assert!(matches!(poller.start(), Err(Error::AlreadyStarted)));

        tokio::time::timeout(Duration::from_secs(5), async {
            while poller.ready().is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(poller.inner.store.log_count(), 5);

        poller.close().await.unwrap();
        assert!(matches!(poller.replay(2).await, Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn close_interrupts_the_poll_sleep() {
        let config = PollerConfig {
            poll_interval_ms: 60_000,
            ..Default::default()
        };
        let (poller, _shutdown) = poller(config);
        seed_main_chain(&poller, 2);

        poller.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(1), poller.close())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn queued_replay_runs_through_the_loop() {
        let config = PollerConfig {
            poll_interval_ms: 10,
            ..Default::default()
        };
        let (poller, _shutdown) = poller(config);
        seed_main_chain(&poller, 6);

        poller.start().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while poller.ready().is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        poller.replay(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        poller.close().await.unwrap();

        assert_eq!(poller.inner.store.log_count(), 7);
    }
}
