//! Fluent builder API for creating crawlers.
//!
//! # Example
//!
//! ```rust,no_run
//! use chainetl_tezos::CrawlerBuilder;
//!
//! let config = CrawlerBuilder::new()
//!     .id("mainnet")
//!     .start_height(1)
//!     .max_reorg_depth(32)
//!     .snapshot_path("/var/lib/chainetl/snapshots")
//!     .snapshot_interval(100_000)
//!     .build_config();
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use chainetl_core::config::CrawlerConfig;
use chainetl_core::error::IndexerError;
use chainetl_core::retry::RetryConfig;
use chainetl_core::store::TableStore;

use crate::builder::BlockPools;
use crate::crawler::Crawler;
use crate::rpc::RawClient;

/// Fluent builder for [`CrawlerConfig`] and [`Crawler`].
#[derive(Default)]
pub struct CrawlerBuilder {
    config: CrawlerConfig,
    pools: Option<BlockPools>,
}

impl CrawlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration, e.g. one read from a file.
    pub fn from_config(config: CrawlerConfig) -> Self {
        Self {
            config,
            pools: None,
        }
    }

    /// Set the crawler ID (used in logs).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the first height indexed into an empty store.
    pub fn start_height(mut self, height: u64) -> Self {
        self.config.start_height = height;
        self
    }

    /// Stop once this height is committed.
    pub fn stop_height(mut self, height: u64) -> Self {
        self.config.stop_height = Some(height);
        self
    }

    /// Set the head polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.config.max_reorg_depth = depth;
        self
    }

    /// Enable or disable per-block consistency checks.
    pub fn validate(mut self, on: bool) -> Self {
        self.config.validate = on;
        self
    }

    /// Backoff between failed poll cycles.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.snapshot.path = Some(path.into());
        self
    }

    /// Snapshot every `n` blocks.
    pub fn snapshot_interval(mut self, n: u64) -> Self {
        self.config.snapshot.block_interval = n;
        self
    }

    /// Snapshot at these exact heights.
    pub fn snapshot_blocks(mut self, heights: impl IntoIterator<Item = u64>) -> Self {
        self.config.snapshot.blocks.extend(heights);
        self
    }

    /// Override the object pool capacities.
    pub fn pools(mut self, pools: BlockPools) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Build the `CrawlerConfig`.
    pub fn build_config(self) -> CrawlerConfig {
        self.config
    }

    /// Check the configuration and assemble an uninitialised crawler.
    pub fn build<C, S>(self, client: Arc<C>, store: Arc<S>) -> Result<Crawler<C, S>, IndexerError>
    where
        C: RawClient + 'static,
        S: TableStore + 'static,
    {
        self.config.check()?;
        let crawler = Crawler::new(self.config, client, store);
        Ok(match self.pools {
            Some(pools) => crawler.with_pools(pools),
            None => crawler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MockNode};
    use chainetl_core::status::{CrawlerState, SyncMode};
    use chainetl_storage::MemoryStore;

    #[test]
    fn builder_defaults() {
        let cfg = CrawlerBuilder::new().build_config();
        assert_eq!(cfg.id, "default");
        assert_eq!(cfg.max_reorg_depth, 64);
        assert!(cfg.validate);
        assert!(cfg.stop_height.is_none());
    }

    #[test]
    fn builder_custom() {
        let cfg = CrawlerBuilder::new()
            .id("ghostnet")
            .start_height(100)
            .stop_height(200)
            .max_reorg_depth(4)
            .validate(false)
            .snapshot_path("/tmp/snap")
            .snapshot_interval(50)
            .snapshot_blocks([120, 150])
            .build_config();

        assert_eq!(cfg.id, "ghostnet");
        assert_eq!(cfg.start_height, 100);
        assert_eq!(cfg.stop_height, Some(200));
        assert_eq!(cfg.max_reorg_depth, 4);
        assert!(!cfg.validate);
        assert_eq!(cfg.snapshot.path, Some(PathBuf::from("/tmp/snap")));
        assert_eq!(cfg.snapshot.block_interval, 50);
        assert_eq!(cfg.snapshot.blocks, vec![120, 150]);
    }

    #[test]
    fn build_rejects_bad_config() {
        let node = Arc::new(MockNode::new(mock::constants()));
        let store = Arc::new(MemoryStore::new());
        let res = CrawlerBuilder::new()
            .start_height(10)
            .stop_height(5)
            .build(node, store);
        assert!(matches!(res, Err(IndexerError::Config(_))));
    }

    #[tokio::test]
    async fn build_runs_to_stop_height() {
        let node = Arc::new(MockNode::new(mock::constants()));
        node.push_chain(mock::chain("A", 0, 4));
        let store = Arc::new(MemoryStore::new());
        let mut crawler = CrawlerBuilder::new()
            .stop_height(2)
            .poll_interval_ms(5)
            .pools(BlockPools::new(1, 16, 16))
            .build(node, store)
            .unwrap();
        crawler.init(SyncMode::Sync).await.unwrap();
        crawler.start().unwrap();
        crawler.wait().await.unwrap();
        assert_eq!(crawler.status().state, CrawlerState::Stopped);
        assert_eq!(crawler.status().height, Some(2));
    }
}
