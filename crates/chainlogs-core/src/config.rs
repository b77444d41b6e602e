//! Poller configuration.

use serde::{Deserialize, Serialize};

/// What to do when the divergence walk fails to find a common ancestor
/// within [`PollerConfig::max_reorg_depth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReorgOverflowPolicy {
    /// Stop advancing and report a persistent health failure. Operator
    /// intervention required.
    Halt,
    /// Roll back to the finality boundary, re-anchor at the remote tip,
    /// and keep polling. The skipped range is left as a gap that a
    /// `replay` call can backfill.
    ResyncFromTip,
}

/// Configuration for a poller instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Earliest block this instance retains; `replay` below it is rejected.
    pub start_block: u64,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Depth beyond which a block is assumed final and its logs immutable.
    /// Typical values: 64 (Ethereum safe), 12 (Ethereum PoS optimistic).
    pub finality_depth: u64,
    /// Maximum depth the divergence walk will search for a common ancestor.
    pub max_reorg_depth: u64,
    /// Policy when the divergence walk exceeds `max_reorg_depth`.
    pub reorg_overflow: ReorgOverflowPolicy,
    /// Cap on blocks applied per cycle, so a long gap cannot starve
    /// shutdown. The remainder continues next cycle.
    pub max_blocks_per_cycle: u64,
    /// Consecutive transient failures tolerated before the instance
    /// reports unhealthy.
    pub max_consecutive_failures: u32,
    /// Grace period without progress before the instance reports
    /// unhealthy, in milliseconds.
    pub unhealthy_after_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            poll_interval_ms: 2000,
            finality_depth: 64,
            max_reorg_depth: 64,
            reorg_overflow: ReorgOverflowPolicy::Halt,
            max_blocks_per_cycle: 1000,
            max_consecutive_failures: 5,
            unhealthy_after_ms: 60_000,
        }
    }
}

impl PollerConfig {
    /// The finalized boundary for a given head: blocks at or below it are
    /// never deleted or mutated.
    pub fn finalized_below(&self, head: u64) -> u64 {
        head.saturating_sub(self.finality_depth)
    }
}
