//! chainlogs-evm — the reorg-aware poll loop over an EVM JSON-RPC source.
//!
//! # Architecture
//!
//! ```text
//! LogPoller
//!     ├── ChainClient     (remote header/log fetch, trait)
//!     ├── FilterRegistry  (what the poller retains, chainlogs-core)
//!     ├── LogStore        (transactional apply/rollback, chainlogs-store)
//!     └── replay queue    (historical backfill through the same writer)
//! ```

pub mod builder;
pub mod client;
pub mod poller;

pub use builder::PollerBuilder;
pub use client::{ChainClient, RawLog};
pub use poller::LogPoller;
