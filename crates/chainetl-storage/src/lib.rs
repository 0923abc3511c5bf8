//! chainetl-storage — table-store backends for ChainETL.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, JSON snapshots)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
