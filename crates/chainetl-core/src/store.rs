//! Table-store abstraction consumed by the indexer.
//!
//! Every index table is a key-ordered collection of [`Row`]s. A row carries
//! its numeric id (primary key), the height it belongs to (for rollback),
//! an optional unique secondary key and a JSON payload. Writes are grouped
//! into a [`WriteBatch`] that a backend must apply atomically together with
//! the head-pointer update.

use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::checkpoint::Checkpoint;
use crate::error::IndexerError;

/// One stored row.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct Row {
    /// Primary key, unique within a table.
    pub id: u64,
    /// Block height that last wrote this row.
    pub height: u64,
    /// Optional unique secondary key (e.g. an address or block hash).
    pub key: Option<String>,
    pub data: serde_json::Value,
}

impl Row {
    /// Encode `value` as a row payload.
    pub fn encode<T: Serialize>(
        id: u64,
        height: u64,
        key: Option<String>,
        value: &T,
    ) -> Result<Self, IndexerError> {
        Ok(Self {
            id,
            height,
            key,
            data: serde_json::to_value(value)?,
        })
    }

    /// Decode the payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, IndexerError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// A single table write inside a batch.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Insert or replace the row with `row.id`.
    Put { table: String, row: Row },
    /// Delete the row with `id` (no-op if absent).
    Delete { table: String, id: u64 },
}

/// New value of the head pointer after a batch is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadUpdate {
    Set(Checkpoint),
    /// The index is empty again (genesis rolled back).
    Clear,
}

/// An ordered set of mutations applied as one unit.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    mutations: Vec<Mutation>,
    head: Option<HeadUpdate>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, table: &str, row: Row) -> &mut Self {
        self.mutations.push(Mutation::Put {
            table: table.to_string(),
            row,
        });
        self
    }

    pub fn delete(&mut self, table: &str, id: u64) -> &mut Self {
        self.mutations.push(Mutation::Delete {
            table: table.to_string(),
            id,
        });
        self
    }

    pub fn set_head(&mut self, checkpoint: Checkpoint) -> &mut Self {
        self.head = Some(HeadUpdate::Set(checkpoint));
        self
    }

    pub fn clear_head(&mut self) -> &mut Self {
        self.head = Some(HeadUpdate::Clear);
        self
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn head(&self) -> Option<&HeadUpdate> {
        self.head.as_ref()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty() && self.head.is_none()
    }

    pub fn into_parts(self) -> (Vec<Mutation>, Option<HeadUpdate>) {
        (self.mutations, self.head)
    }
}

/// Ordered table storage with atomic multi-table commits.
///
/// Readers must only ever observe the state before or after a whole
/// [`TableStore::commit`], never a partially applied batch.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Row by primary key.
    async fn get(&self, table: &str, id: u64) -> Result<Option<Row>, IndexerError>;

    /// Row by unique secondary key.
    async fn get_by_key(&self, table: &str, key: &str) -> Result<Option<Row>, IndexerError>;

    /// Rows with `from <= id <= to`, ascending by id.
    async fn range(&self, table: &str, from: u64, to: u64) -> Result<Vec<Row>, IndexerError>;

    /// Rows written at `height`, ascending by id.
    async fn at_height(&self, table: &str, height: u64) -> Result<Vec<Row>, IndexerError>;

    /// Row with the highest id.
    async fn last(&self, table: &str) -> Result<Option<Row>, IndexerError>;

    /// Current head pointer.
    async fn head(&self) -> Result<Option<Checkpoint>, IndexerError>;

    /// Apply all mutations plus the head update, or nothing.
    async fn commit(&self, batch: WriteBatch) -> Result<(), IndexerError>;

    /// Write a consistent copy of the current state to `path`.
    async fn snapshot(&self, path: &Path) -> Result<(), IndexerError>;
}
