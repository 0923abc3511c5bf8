//! The persisted "current head" pointer.
//!
//! The checkpoint is written in the same atomic batch as the rows of the
//! block it points to, so readers never observe a head pointer without the
//! data behind it. On restart the crawler resumes from the checkpoint rather
//! than re-indexing from scratch.

use serde::{Deserialize, Serialize};

use crate::types::BlockHeader;

/// The last fully committed block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Height of the last committed block.
    pub height: u64,
    /// Hash of the last committed block.
    pub hash: String,
    /// Unix timestamp of when this checkpoint was written.
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Checkpoint pointing at `header`.
    pub fn at(header: &BlockHeader) -> Self {
        Self::new(header.height, header.hash.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_from_header() {
        let header = BlockHeader {
            height: 1000,
            hash: "BLabc".into(),
            predecessor: "BLabb".into(),
            timestamp: chrono::Utc::now(),
        };
        let cp = Checkpoint::at(&header);
        assert_eq!(cp.height, 1000);
        assert_eq!(cp.hash, "BLabc");
        assert!(cp.updated_at > 0);
    }
}
