//! Fork detection and common-ancestor search.
//!
//! When the node reports a block that does not extend the local head, the
//! detector walks the competing chain backward (following predecessor
//! hashes) until it meets a block the local index already holds. The result
//! is a [`ReorgEvent`] describing which local heights must be rolled back
//! and which remote headers must be replayed, in order.

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::types::BlockHeader;

/// Source of remote headers (the upstream node).
#[async_trait]
pub trait HeaderSource: Send + Sync {
    /// Fetch the header of a block by hash.
    async fn header_by_hash(&self, hash: &str) -> Result<BlockHeader, IndexerError>;
}

/// View of the locally committed chain.
#[async_trait]
pub trait LocalChain: Send + Sync {
    /// Hash of the committed block at `height`, if any.
    async fn local_hash(&self, height: u64) -> Result<Option<String>, IndexerError>;
}

/// Describes a detected chain reorganization.
#[derive(Debug, Clone)]
pub struct ReorgEvent {
    /// Height of the competing block that triggered the search.
    pub detected_at: u64,
    /// Height of the lowest common ancestor.
    pub ancestor: u64,
    /// Number of local blocks above the ancestor that must be rolled back.
    pub depth: u64,
    /// Competing-chain headers from `ancestor + 1` upward (ascending).
    pub replay: Vec<BlockHeader>,
    pub reorg_type: ReorgType,
}

impl ReorgEvent {
    /// Local heights to roll back, strictly descending.
    pub fn rollback_heights(&self, local_head: u64) -> impl Iterator<Item = u64> {
        ((self.ancestor + 1)..=local_head).rev()
    }
}

/// Classification of the reorg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgType {
    /// 1–3 blocks replaced.
    ShortReorg,
    /// More than 3 blocks replaced.
    DeepReorg,
}

impl std::fmt::Display for ReorgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortReorg => write!(f, "short reorg"),
            Self::DeepReorg => write!(f, "deep reorg"),
        }
    }
}

/// Detects forks and locates the common ancestor.
pub struct ReorgDetector {
    /// Maximum number of local blocks a reorg may roll back.
    max_depth: u64,
}

impl ReorgDetector {
    pub fn new(max_depth: u64) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> u64 {
        self.max_depth
    }

    /// Walk back from `candidate` until its ancestry meets the local chain.
    ///
    /// `candidate` is a remote block that was found not to extend the local
    /// head at `local_head`. Fails with [`IndexerError::ReorgTooDeep`] once
    /// the search passes `max_depth` blocks below the local head.
    pub async fn find_common_ancestor<R, L>(
        &self,
        remote: &R,
        local: &L,
        candidate: &BlockHeader,
        local_head: u64,
    ) -> Result<ReorgEvent, IndexerError>
    where
        R: HeaderSource + ?Sized,
        L: LocalChain + ?Sized,
    {
        let mut path = vec![candidate.clone()];
        let mut current = candidate.clone();

        let ancestor = loop {
            let parent_height = current.height.checked_sub(1).ok_or_else(|| {
                IndexerError::invariant(0, "competing chain has a different genesis block")
            })?;

            if parent_height <= local_head {
                if let Some(hash) = local.local_hash(parent_height).await? {
                    if hash == current.predecessor {
                        break parent_height;
                    }
                }
                let depth = local_head - parent_height;
                if depth >= self.max_depth {
                    return Err(IndexerError::ReorgTooDeep {
                        depth: depth + 1,
                        max: self.max_depth,
                        below: parent_height,
                    });
                }
            }

            current = remote.header_by_hash(&current.predecessor).await?;
            if current.height != parent_height {
                return Err(IndexerError::MissingBlockData(format!(
                    "predecessor of block {} reports height {}",
                    parent_height + 1,
                    current.height
                )));
            }
            path.push(current.clone());
        };

        path.reverse();
        let depth = local_head.saturating_sub(ancestor);
        let reorg_type = if depth <= 3 {
            ReorgType::ShortReorg
        } else {
            ReorgType::DeepReorg
        };
        tracing::warn!(
            depth,
            ancestor,
            at = candidate.height,
            reorg_type = %reorg_type,
            "Reorg detected"
        );
        Ok(ReorgEvent {
            detected_at: candidate.height,
            ancestor,
            depth,
            replay: path,
            reorg_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use std::collections::HashMap;

    fn h(height: u64, hash: &str, pred: &str) -> BlockHeader {
        BlockHeader {
            height,
            hash: hash.into(),
            predecessor: pred.into(),
            timestamp: DateTime::from_timestamp(height as i64 * 30, 0).unwrap_or_default(),
        }
    }

    struct Remote(HashMap<String, BlockHeader>);

    #[async_trait]
    impl HeaderSource for Remote {
        async fn header_by_hash(&self, hash: &str) -> Result<BlockHeader, IndexerError> {
            self.0
                .get(hash)
                .cloned()
                .ok_or_else(|| IndexerError::NotFound(hash.to_string()))
        }
    }

    struct Local(HashMap<u64, String>);

    #[async_trait]
    impl LocalChain for Local {
        async fn local_hash(&self, height: u64) -> Result<Option<String>, IndexerError> {
            Ok(self.0.get(&height).cloned())
        }
    }

    /// Local chain A: 0..=11. Remote chain B forks after 9.
    fn fixture() -> (Remote, Local) {
        let local = Local((0..=11).map(|i| (i, format!("A{i}"))).collect());
        let mut remote = HashMap::new();
        for i in 0..=9 {
            let pred = if i == 0 { "genesis".to_string() } else { format!("A{}", i - 1) };
            remote.insert(format!("A{i}"), h(i, &format!("A{i}"), &pred));
        }
        remote.insert("B10".into(), h(10, "B10", "A9"));
        remote.insert("B11".into(), h(11, "B11", "B10"));
        remote.insert("B12".into(), h(12, "B12", "B11"));
        (Remote(remote), local)
    }

    #[tokio::test]
    async fn finds_ancestor_below_local_head() {
        let (remote, local) = fixture();
        let det = ReorgDetector::new(16);
        let candidate = h(12, "B12", "B11");
        let ev = det.find_common_ancestor(&remote, &local, &candidate, 11).await.unwrap();
        assert_eq!(ev.ancestor, 9);
        assert_eq!(ev.depth, 2);
        assert_eq!(ev.reorg_type, ReorgType::ShortReorg);
        let replay: Vec<_> = ev.replay.iter().map(|b| b.hash.as_str()).collect();
        assert_eq!(replay, vec!["B10", "B11", "B12"]);
        let rollback: Vec<_> = ev.rollback_heights(11).collect();
        assert_eq!(rollback, vec![11, 10]);
    }

    #[tokio::test]
    async fn shorter_competing_head() {
        let (remote, local) = fixture();
        let det = ReorgDetector::new(16);
        // node reports B10 as head while we are at A11
        let candidate = h(10, "B10", "A9");
        let ev = det.find_common_ancestor(&remote, &local, &candidate, 11).await.unwrap();
        assert_eq!(ev.ancestor, 9);
        assert_eq!(ev.depth, 2);
        assert_eq!(ev.replay.len(), 1);
    }

    #[tokio::test]
    async fn depth_limit_enforced() {
        let (remote, local) = fixture();
        let det = ReorgDetector::new(1);
        let candidate = h(12, "B12", "B11");
        let err = det
            .find_common_ancestor(&remote, &local, &candidate, 11)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::ReorgTooDeep { max: 1, .. }));
        assert!(err.is_fatal());
    }
}
