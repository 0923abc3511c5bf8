//! In-memory table store.
//!
//! Holds every table in RAM behind a single `RwLock`, so a commit is applied
//! under one write guard and readers see either the old or the new state.
//! Useful for tests and short-lived indexers that don't need persistence;
//! [`TableStore::snapshot`] writes the whole state as JSON and
//! [`MemoryStore::from_snapshot`] reads it back.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use chainetl_core::checkpoint::Checkpoint;
use chainetl_core::error::IndexerError;
use chainetl_core::store::{HeadUpdate, Mutation, Row, TableStore, WriteBatch};

#[derive(Default)]
struct Table {
    rows: BTreeMap<u64, Row>,
    by_key: HashMap<String, u64>,
    by_height: BTreeMap<u64, BTreeSet<u64>>,
}

impl Table {
    fn remove(&mut self, id: u64) -> Option<Row> {
        let row = self.rows.remove(&id)?;
        if let Some(key) = &row.key {
            self.by_key.remove(key);
        }
        if let Some(ids) = self.by_height.get_mut(&row.height) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_height.remove(&row.height);
            }
        }
        Some(row)
    }

    fn insert(&mut self, table: &str, row: Row) -> Result<Option<Row>, IndexerError> {
        if let Some(key) = &row.key {
            if let Some(&owner) = self.by_key.get(key) {
                if owner != row.id {
                    return Err(IndexerError::Storage(format!(
                        "{table}: duplicate key {key} (rows {owner} and {})",
                        row.id
                    )));
                }
            }
        }
        let prev = self.remove(row.id);
        if let Some(key) = &row.key {
            self.by_key.insert(key.clone(), row.id);
        }
        self.by_height.entry(row.height).or_default().insert(row.id);
        self.rows.insert(row.id, row);
        Ok(prev)
    }
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    head: Option<Checkpoint>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    head: Option<Checkpoint>,
    tables: BTreeMap<String, Vec<Row>>,
}

/// In-memory table store.
///
/// All data is lost when the process exits unless a snapshot was taken.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a storage error after
    /// partially applying their mutations. Used to exercise commit
    /// atomicity.
    pub fn fail_next_commits(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of rows in `table`.
    pub fn count(&self, table: &str) -> usize {
        self.read().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Names of all non-empty tables.
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .read()
            .tables
            .iter()
            .filter(|(_, t)| !t.rows.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Every row of every table, ordered by table name then id.
    pub fn dump(&self) -> BTreeMap<String, Vec<Row>> {
        self.read()
            .tables
            .iter()
            .filter(|(_, t)| !t.rows.is_empty())
            .map(|(name, t)| (name.clone(), t.rows.values().cloned().collect()))
            .collect()
    }

    /// Restore a store from a file written by [`TableStore::snapshot`].
    pub async fn from_snapshot(path: &Path) -> Result<Self, IndexerError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| IndexerError::Storage(format!("read {}: {e}", path.display())))?;
        let file: SnapshotFile = serde_json::from_slice(&bytes)?;
        let mut state = State {
            head: file.head,
            ..Default::default()
        };
        for (name, rows) in file.tables {
            let table = state.tables.entry(name.clone()).or_default();
            for row in rows {
                table.insert(&name, row)?;
            }
        }
        Ok(Self {
            state: RwLock::new(state),
            failures: AtomicU32::new(0),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Undo record for one applied mutation.
struct Undo {
    table: String,
    id: u64,
    prev: Option<Row>,
}

fn revert(state: &mut State, undo: Vec<Undo>) {
    for u in undo.into_iter().rev() {
        let table = state.tables.entry(u.table.clone()).or_default();
        table.remove(u.id);
        if let Some(row) = u.prev {
            // restoring a previously valid row cannot conflict
            let _ = table.insert(&u.table, row);
        }
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn get(&self, table: &str, id: u64) -> Result<Option<Row>, IndexerError> {
        Ok(self
            .read()
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&id))
            .cloned())
    }

    async fn get_by_key(&self, table: &str, key: &str) -> Result<Option<Row>, IndexerError> {
        let state = self.read();
        Ok(state
            .tables
            .get(table)
            .and_then(|t| t.by_key.get(key).and_then(|id| t.rows.get(id)))
            .cloned())
    }

    async fn range(&self, table: &str, from: u64, to: u64) -> Result<Vec<Row>, IndexerError> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .read()
            .tables
            .get(table)
            .map(|t| t.rows.range(from..=to).map(|(_, r)| r.clone()).collect())
            .unwrap_or_default())
    }

    async fn at_height(&self, table: &str, height: u64) -> Result<Vec<Row>, IndexerError> {
        let state = self.read();
        let Some(t) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(t.by_height
            .get(&height)
            .map(|ids| ids.iter().filter_map(|id| t.rows.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn last(&self, table: &str) -> Result<Option<Row>, IndexerError> {
        Ok(self
            .read()
            .tables
            .get(table)
            .and_then(|t| t.rows.values().next_back())
            .cloned())
    }

    async fn head(&self) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.read().head.clone())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), IndexerError> {
        let (mutations, head) = batch.into_parts();
        let n = mutations.len();
        let inject = self.take_failure();
        let mut state = self.write();
        let mut undo = Vec::with_capacity(n);

        for (i, m) in mutations.into_iter().enumerate() {
            if inject && i == n / 2 {
                revert(&mut state, undo);
                return Err(IndexerError::Storage("injected commit failure".into()));
            }
            let applied = match m {
                Mutation::Put { table, row } => {
                    let id = row.id;
                    let t = state.tables.entry(table.clone()).or_default();
                    t.insert(&table, row).map(|prev| Undo { table, id, prev })
                }
                Mutation::Delete { table, id } => {
                    let prev = state.tables.get_mut(&table).and_then(|t| t.remove(id));
                    Ok(Undo { table, id, prev })
                }
            };
            match applied {
                Ok(u) => undo.push(u),
                Err(e) => {
                    revert(&mut state, undo);
                    return Err(e);
                }
            }
        }
        if inject {
            revert(&mut state, undo);
            return Err(IndexerError::Storage("injected commit failure".into()));
        }

        match head {
            Some(HeadUpdate::Set(cp)) => state.head = Some(cp),
            Some(HeadUpdate::Clear) => state.head = None,
            None => {}
        }
        debug!(mutations = n, head = ?state.head.as_ref().map(|c| c.height), "batch committed");
        Ok(())
    }

    async fn snapshot(&self, path: &Path) -> Result<(), IndexerError> {
        let file = {
            let state = self.read();
            SnapshotFile {
                head: state.head.clone(),
                tables: state
                    .tables
                    .iter()
                    .map(|(name, t)| (name.clone(), t.rows.values().cloned().collect()))
                    .collect(),
            }
        };
        let bytes = serde_json::to_vec(&file)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| IndexerError::Storage(format!("create {}: {e}", dir.display())))?;
        }
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| IndexerError::Storage(format!("write {}: {e}", path.display())))?;
        debug!(path = %path.display(), "snapshot written");
        Ok(())
    }
}
