//! Crawler lifecycle states and the externally visible sync status.

use serde::{Deserialize, Serialize};

/// Mode selected at `Init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Follow the node and ingest blocks.
    Sync,
    /// Read-only: serve what is already indexed, never build or commit.
    Info,
}

/// Lifecycle state of the crawler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlerState {
    /// Not yet initialised.
    Uninitialized,
    /// Initialised in sync mode, not started.
    Sync,
    /// Initialised in read-only mode.
    Info,
    /// Driver loop is ingesting blocks.
    Running,
    /// Rolling back and replaying a fork.
    Rollback,
    /// Stopped on request or at the configured stop height.
    Stopped,
    /// Halted on an unrecoverable error.
    Failed,
}

impl CrawlerState {
    /// Returns `true` for states the crawler never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for CrawlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Sync => write!(f, "sync"),
            Self::Info => write!(f, "info"),
            Self::Running => write!(f, "running"),
            Self::Rollback => write!(f, "rollback"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of the crawler's progress for health monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub mode: Option<SyncMode>,
    pub state: CrawlerState,
    /// Height of the last committed block.
    pub height: Option<u64>,
    pub hash: Option<String>,
    /// Last head height reported by the node.
    pub node_height: Option<u64>,
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            mode: None,
            state: CrawlerState::Uninitialized,
            height: None,
            hash: None,
            node_height: None,
            last_error: None,
        }
    }
}

impl SyncStatus {
    /// Blocks known to the node but not yet indexed.
    pub fn backlog(&self) -> u64 {
        match (self.node_height, self.height) {
            (Some(node), Some(local)) => node.saturating_sub(local),
            (Some(node), None) => node + 1,
            _ => 0,
        }
    }

    /// Returns `true` once the local head matches the node head.
    pub fn is_synced(&self) -> bool {
        self.node_height.is_some() && self.backlog() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_counts_unindexed_blocks() {
        let mut status = SyncStatus::default();
        assert_eq!(status.backlog(), 0);
        assert!(!status.is_synced());

        status.node_height = Some(10);
        assert_eq!(status.backlog(), 11);

        status.height = Some(7);
        assert_eq!(status.backlog(), 3);

        status.height = Some(10);
        assert!(status.is_synced());
    }

    #[test]
    fn state_display_and_terminal() {
        assert_eq!(CrawlerState::Rollback.to_string(), "rollback");
        assert!(CrawlerState::Failed.is_terminal());
        assert!(!CrawlerState::Running.is_terminal());
    }
}
