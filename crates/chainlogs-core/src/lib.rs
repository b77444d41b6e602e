//! chainlogs-core — foundation for the reorg-aware event-log indexing engine.
//!
//! # Architecture
//!
//! ```text
//! LogPoller (chainlogs-evm)
//!     ├── FilterRegistry   (copy-on-write address/topic filter set)
//!     ├── LogStore         (transactional apply/rollback + query shapes)
//!     ├── ChainClient      (remote header/log fetch, chainlogs-evm)
//!     └── PollerConfig     (intervals, depths, reorg policy)
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod query;
pub mod store;
pub mod types;

pub use config::{PollerConfig, ReorgOverflowPolicy};
pub use error::Error;
pub use filter::{FilterRegistry, FilterSet};
pub use query::QueryOptions;
pub use store::LogStore;
pub use types::{BlockHeader, ChainHead, Log};
