//! chainetl-tezos — Tezos block builder, indexer and crawler.
//!
//! # Pipeline
//!
//! ```text
//! RawClient ──► Crawler ──► BlockBuilder ──► Indexer ──► TableStore
//!  (node)      (sync loop,   (ops, flows,     (atomic commit,
//!               reorgs)       events, checks)  rollback, lookups)
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod crawler;
pub mod indexer;
pub mod model;
pub mod params;
pub mod rpc;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use builder::{BlockBuilder, BlockPools, BuiltBlock};
pub use cache::AccountCache;
pub use config::CrawlerBuilder;
pub use crawler::{Crawler, PollOutcome, Step, SyncLoop};
pub use indexer::{BigmapUpdate, Indexer};
pub use params::Params;
pub use rpc::{RawBlock, RawClient, RetryingClient};
