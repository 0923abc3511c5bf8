//! Crawler configuration.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::retry::RetryConfig;
use crate::snapshot::SnapshotConfig;

/// Configuration for a crawler instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Name of this crawler (used in logs).
    pub id: String,
    /// First block to index when the index is empty.
    pub start_height: u64,
    /// Stop after committing this height. `None` = follow the chain forever.
    pub stop_height: Option<u64>,
    /// Head polling interval once synced (milliseconds).
    pub poll_interval_ms: u64,
    /// Maximum number of committed blocks a reorg may roll back.
    pub max_reorg_depth: u64,
    /// Check conservation and ordering invariants on every built block.
    pub validate: bool,
    /// Backoff between failed poll cycles.
    pub retry: RetryConfig,
    pub snapshot: SnapshotConfig,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            start_height: 0,
            stop_height: None,
            poll_interval_ms: 2000,
            max_reorg_depth: 64,
            validate: true,
            retry: RetryConfig {
                max_retries: u32::MAX,
                initial_backoff_ms: 1_000,
                max_backoff_ms: 60_000,
                multiplier: 2.0,
                jitter_fraction: 0.0,
            },
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl CrawlerConfig {
    /// Reject settings the crawler cannot run with.
    pub fn check(&self) -> Result<(), IndexerError> {
        if self.max_reorg_depth == 0 {
            return Err(IndexerError::Config("max_reorg_depth must be > 0".into()));
        }
        if let Some(stop) = self.stop_height {
            if stop < self.start_height {
                return Err(IndexerError::Config(format!(
                    "stop_height {stop} is below start_height {}",
                    self.start_height
                )));
            }
        }
        if self.snapshot.path.is_none()
            && (self.snapshot.block_interval > 0 || !self.snapshot.blocks.is_empty())
        {
            return Err(IndexerError::Config(
                "snapshot cadence configured without a snapshot path".into(),
            ));
        }
        Ok(())
    }
}
