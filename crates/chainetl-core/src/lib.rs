//! chainetl-core — chain-agnostic plumbing for the reorg-safe indexing pipeline.
//!
//! # Architecture
//!
//! ```text
//! Crawler (chainetl-tezos)
//!     ├── BlockTracker      (head window, parent hash chain)
//!     ├── ReorgDetector     (common-ancestor search, depth limit)
//!     ├── Checkpoint        (persisted head pointer)
//!     ├── SnapshotSchedule  (out-of-band state copies)
//!     ├── RetryPolicy       (cycle and adapter backoff)
//!     └── TableStore        (atomic multi-table commit, chainetl-storage)
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod pool;
pub mod reorg;
pub mod retry;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod tracker;
pub mod types;

pub use checkpoint::Checkpoint;
pub use config::CrawlerConfig;
pub use error::IndexerError;
pub use pool::{Pool, Pooled, Reset};
pub use reorg::{HeaderSource, LocalChain, ReorgDetector, ReorgEvent, ReorgType};
pub use retry::{RetryConfig, RetryPolicy};
pub use snapshot::{SnapshotConfig, SnapshotSchedule};
pub use status::{CrawlerState, SyncMode, SyncStatus};
pub use store::{HeadUpdate, Mutation, Row, TableStore, WriteBatch};
pub use tracker::BlockTracker;
pub use types::{BlockHeader, BlockId};
