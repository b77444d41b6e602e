//! Error types for the chainlogs pipeline.

use thiserror::Error;

/// Errors that can occur while polling, storing, or querying logs.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Transient RPC failure (timeout, connection reset). Retried on the
    /// next poll cycle; never advances chain state.
    #[error("transient RPC failure: {0}")]
    RpcTransient(String),

    /// The remote node returned a response we cannot interpret.
    #[error("malformed RPC response: {0}")]
    RpcMalformed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid replay range: {0}")]
    ReplayRange(String),

    #[error("reorg at block {block_number} exceeds maximum depth {max_depth}")]
    ReorgTooDeep { block_number: u64, max_depth: u64 },

    #[error("reorg reaches below the finalized block {finalized}")]
    FinalityViolation { finalized: u64 },

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("unhealthy: {0}")]
    Unhealthy(String),

    #[error("poller already started")]
    AlreadyStarted,

    #[error("poller stopped")]
    Stopped,
}

impl Error {
    /// Returns `true` if the error is transient (retry next cycle).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RpcTransient(_))
    }

    /// Returns `true` if the error is fatal for the poll loop — continuing
    /// would risk indexing an incorrect chain view.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ReorgTooDeep { .. } | Self::FinalityViolation { .. }
        )
    }
}
