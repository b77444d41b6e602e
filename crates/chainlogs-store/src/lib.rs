//! chainlogs-store — storage backends for ChainLogs.
//!
//! Backends:
//! - [`memory`] — in-memory, snapshot copy-on-write (dev/testing, default)
//! - [`sqlite`] — SQLite via `sqlx`, WAL mode (embedded persistence)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryLogStore;
