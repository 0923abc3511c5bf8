//! Error types for the chainetl pipeline.

use thiserror::Error;

/// Errors that can occur while crawling, building or indexing blocks.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Transient upstream failure (network, timeout, node busy).
    #[error("RPC error: {0}")]
    Rpc(String),

    /// The node does not (yet) know the requested object.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("missing block data: {0}")]
    MissingBlockData(String),

    #[error("missing protocol constants at height {height}")]
    MissingConstants { height: u64 },

    #[error("missing account {address}")]
    MissingAccount { address: String },

    #[error("missing contract {address}")]
    MissingContract { address: String },

    #[error("malformed script for {address}: {reason}")]
    MalformedScript { address: String, reason: String },

    /// A derived block failed conservation or consistency checks.
    #[error("invariant violated at block {height}: {reason}")]
    Invariant { height: u64, reason: String },

    #[error("reorg depth {depth} exceeds maximum {max} (fork point below height {below})")]
    ReorgTooDeep { depth: u64, max: u64, below: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }

    /// Returns `true` if the error must halt ingestion.
    ///
    /// Retrying identical input reproduces a data inconsistency, so these
    /// are surfaced to the operator instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingBlockData(_)
                | Self::MissingConstants { .. }
                | Self::MissingAccount { .. }
                | Self::MissingContract { .. }
                | Self::MalformedScript { .. }
                | Self::Invariant { .. }
                | Self::ReorgTooDeep { .. }
                | Self::Config(_)
        )
    }

    /// Shorthand for an [`IndexerError::Invariant`].
    pub fn invariant(height: u64, reason: impl Into<String>) -> Self {
        Self::Invariant {
            height,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("row codec: {e}"))
    }
}
