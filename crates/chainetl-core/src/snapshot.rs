//! Snapshot scheduling.
//!
//! Snapshots are out-of-band copies of the indexed state taken at a
//! configured cadence (every N blocks and/or at an explicit list of heights).
//! They run after a commit and never block indexing: a failed snapshot is
//! logged and skipped.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Snapshot cadence and destination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Destination directory. `None` disables snapshots.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Explicit heights to snapshot at.
    #[serde(default)]
    pub blocks: Vec<u64>,
    /// Snapshot every N blocks (0 = disabled).
    #[serde(default)]
    pub block_interval: u64,
}

/// Decides when a snapshot is due.
#[derive(Debug, Clone)]
pub struct SnapshotSchedule {
    config: SnapshotConfig,
}

impl SnapshotSchedule {
    pub fn new(mut config: SnapshotConfig) -> Self {
        config.blocks.sort_unstable();
        config.blocks.dedup();
        Self { config }
    }

    /// Returns `true` if snapshots are enabled at all.
    pub fn is_enabled(&self) -> bool {
        self.config.path.is_some()
            && (self.config.block_interval > 0 || !self.config.blocks.is_empty())
    }

    /// Returns the snapshot target for `height`, or `None` if no snapshot is due.
    pub fn due(&self, height: u64) -> Option<PathBuf> {
        let dir = self.config.path.as_deref()?;
        let by_interval =
            self.config.block_interval > 0 && height > 0 && height % self.config.block_interval == 0;
        let by_list = self.config.blocks.binary_search(&height).is_ok();
        (by_interval || by_list).then(|| Self::target(dir, height))
    }

    fn target(dir: &Path, height: u64) -> PathBuf {
        dir.join(format!("snapshot-{height:010}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_path() {
        let sched = SnapshotSchedule::new(SnapshotConfig {
            path: None,
            blocks: vec![10],
            block_interval: 5,
        });
        assert!(!sched.is_enabled());
        assert!(sched.due(10).is_none());
    }

    #[test]
    fn interval_and_explicit_heights() {
        let sched = SnapshotSchedule::new(SnapshotConfig {
            path: Some(PathBuf::from("/tmp/snap")),
            blocks: vec![7, 3, 7],
            block_interval: 5,
        });
        assert!(sched.is_enabled());
        assert!(sched.due(0).is_none());
        assert!(sched.due(4).is_none());
        assert_eq!(sched.due(5), Some(PathBuf::from("/tmp/snap/snapshot-0000000005")));
        assert!(sched.due(7).is_some());
        assert!(sched.due(3).is_some());
        assert!(sched.due(10).is_some());
    }
}
