//! Shared types for the sync pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// The minimal view of a block needed to track the canonical chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height (level).
    pub height: u64,
    /// Block hash.
    pub hash: String,
    /// Hash of the parent block.
    pub predecessor: String,
    /// Block timestamp.
    pub timestamp: DateTime<Utc>,
}

impl BlockHeader {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.height == parent.height + 1 && self.predecessor == parent.hash
    }
}

// ─── BlockId ──────────────────────────────────────────────────────────────────

/// Addresses a block on the upstream node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockId {
    /// The node's current head.
    Head,
    /// The block at a height on the node's canonical chain.
    Height(u64),
    /// A specific block, canonical or not.
    Hash(String),
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Head => write!(f, "head"),
            Self::Height(h) => write!(f, "{h}"),
            Self::Hash(hash) => write!(f, "{hash}"),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn header(height: u64, hash: &str, pred: &str) -> BlockHeader {
        BlockHeader {
            height,
            hash: hash.into(),
            predecessor: pred.into(),
            timestamp: DateTime::from_timestamp(height as i64 * 30, 0).unwrap_or_default(),
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = header(100, "BLa", "BL0");
        let child = header(101, "BLb", "BLa");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = header(100, "BLa", "BL0");
        let b = header(102, "BLc", "BLa"); // gap
        assert!(!b.extends(&a));
    }

    #[test]
    fn block_id_display() {
        assert_eq!(BlockId::Head.to_string(), "head");
        assert_eq!(BlockId::Height(42).to_string(), "42");
        assert_eq!(BlockId::Hash("BLx".into()).to_string(), "BLx");
    }
}
