//! Fluent builder API for configuring a log poller.
//!
//! # Example
//!
//! ```rust,no_run
//! use chainlogs_evm::PollerBuilder;
//! use chainlogs_core::config::ReorgOverflowPolicy;
//!
//! let config = PollerBuilder::new()
//!     .start_block(19_000_000)
//!     .poll_interval_ms(1_000)
//!     .finality_depth(12)
//!     .max_reorg_depth(32)
//!     .reorg_overflow(ReorgOverflowPolicy::ResyncFromTip)
//!     .build_config();
//! ```

use chainlogs_core::config::{PollerConfig, ReorgOverflowPolicy};

/// Fluent builder for [`PollerConfig`].
#[derive(Default)]
pub struct PollerBuilder {
    config: PollerConfig,
}

impl PollerBuilder {
    pub fn new() -> Self {
        Self {
            config: PollerConfig::default(),
        }
    }

    /// Set the earliest block this instance retains.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Set the poll interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set the depth beyond which blocks are assumed final.
    pub fn finality_depth(mut self, depth: u64) -> Self {
        self.config.finality_depth = depth;
        self
    }

    /// Set the maximum depth of the divergence walk.
    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.config.max_reorg_depth = depth;
        self
    }

    /// Set the policy for reorgs deeper than `max_reorg_depth`.
    pub fn reorg_overflow(mut self, policy: ReorgOverflowPolicy) -> Self {
        self.config.reorg_overflow = policy;
        self
    }

    /// Set the cap on blocks applied per cycle.
    pub fn max_blocks_per_cycle(mut self, blocks: u64) -> Self {
        self.config.max_blocks_per_cycle = blocks;
        self
    }

    /// Set the number of consecutive transient failures tolerated before
    /// the instance reports unhealthy.
    pub fn max_consecutive_failures(mut self, n: u32) -> Self {
        self.config.max_consecutive_failures = n;
        self
    }

    /// Set the no-progress grace period in milliseconds.
    pub fn unhealthy_after_ms(mut self, ms: u64) -> Self {
        self.config.unhealthy_after_ms = ms;
        self
    }

    /// Build the [`PollerConfig`].
    pub fn build_config(self) -> PollerConfig {
        self.config
    }
}
