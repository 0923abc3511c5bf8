//! SQLite table store.
//!
//! All index tables share one generic `rows` table keyed by
//! `(tbl, id)` with secondary indexes on `(tbl, key)` and `(tbl, height)`.
//! A [`WriteBatch`] is applied inside one SQLite transaction together with
//! the `head` row, so a failed commit leaves the head pointer untouched.
//!
//! # Usage
//! ```rust,no_run
//! use chainetl_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./index.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, SqlitePool};
use tracing::debug;

use chainetl_core::checkpoint::Checkpoint;
use chainetl_core::error::IndexerError;
use chainetl_core::store::{HeadUpdate, Mutation, Row, TableStore, WriteBatch};

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed table store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        // every connection to `:memory:` is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        // WAL mode
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rows (
                tbl     TEXT    NOT NULL,
                id      INTEGER NOT NULL,
                height  INTEGER NOT NULL,
                key     TEXT,
                data    TEXT    NOT NULL,
                PRIMARY KEY (tbl, id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_rows_key ON rows (tbl, key) WHERE key IS NOT NULL;",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rows_height ON rows (tbl, height);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        // single-row head pointer
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS head (
                slot        INTEGER PRIMARY KEY CHECK (slot = 0),
                height      INTEGER NOT NULL,
                hash        TEXT    NOT NULL,
                updated_at  INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Number of rows in `table`.
    pub async fn count(&self, table: &str) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM rows WHERE tbl = ?")
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }
}

fn decode_row(r: &SqliteRow) -> Result<Row, IndexerError> {
    let data: String = r.get("data");
    Ok(Row {
        id: r.get::<i64, _>("id") as u64,
        height: r.get::<i64, _>("height") as u64,
        key: r.get("key"),
        data: serde_json::from_str(&data)?,
    })
}

fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<Row>, IndexerError> {
    rows.iter().map(decode_row).collect()
}

#[async_trait]
impl TableStore for SqliteStore {
    async fn get(&self, table: &str, id: u64) -> Result<Option<Row>, IndexerError> {
        let row = sqlx::query("SELECT id, height, key, data FROM rows WHERE tbl = ? AND id = ?")
            .bind(table)
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn get_by_key(&self, table: &str, key: &str) -> Result<Option<Row>, IndexerError> {
        let row = sqlx::query("SELECT id, height, key, data FROM rows WHERE tbl = ? AND key = ?")
            .bind(table)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn range(&self, table: &str, from: u64, to: u64) -> Result<Vec<Row>, IndexerError> {
        let rows = sqlx::query(
            "SELECT id, height, key, data FROM rows
             WHERE tbl = ? AND id >= ? AND id <= ? ORDER BY id",
        )
        .bind(table)
        .bind(from as i64)
        .bind(to.min(i64::MAX as u64) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        decode_rows(rows)
    }

    async fn at_height(&self, table: &str, height: u64) -> Result<Vec<Row>, IndexerError> {
        let rows = sqlx::query(
            "SELECT id, height, key, data FROM rows WHERE tbl = ? AND height = ? ORDER BY id",
        )
        .bind(table)
        .bind(height as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        decode_rows(rows)
    }

    async fn last(&self, table: &str) -> Result<Option<Row>, IndexerError> {
        let row = sqlx::query(
            "SELECT id, height, key, data FROM rows WHERE tbl = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn head(&self) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query("SELECT height, hash, updated_at FROM head WHERE slot = 0")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|r| Checkpoint {
            height: r.get::<i64, _>("height") as u64,
            hash: r.get("hash"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), IndexerError> {
        let (mutations, head) = batch.into_parts();
        let n = mutations.len();
        // dropped without commit = rolled back
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        for m in mutations {
            match m {
                Mutation::Put { table, row } => {
                    let data = serde_json::to_string(&row.data)?;
                    sqlx::query(
                        "INSERT INTO rows (tbl, id, height, key, data) VALUES (?, ?, ?, ?, ?)
                         ON CONFLICT (tbl, id) DO UPDATE SET
                             height = excluded.height, key = excluded.key, data = excluded.data",
                    )
                    .bind(&table)
                    .bind(row.id as i64)
                    .bind(row.height as i64)
                    .bind(&row.key)
                    .bind(&data)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
                }
                Mutation::Delete { table, id } => {
                    sqlx::query("DELETE FROM rows WHERE tbl = ? AND id = ?")
                        .bind(&table)
                        .bind(id as i64)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                }
            }
        }

        match head {
            Some(HeadUpdate::Set(cp)) => {
                sqlx::query(
                    "INSERT OR REPLACE INTO head (slot, height, hash, updated_at) VALUES (0, ?, ?, ?)",
                )
                .bind(cp.height as i64)
                .bind(&cp.hash)
                .bind(cp.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            }
            Some(HeadUpdate::Clear) => {
                sqlx::query("DELETE FROM head")
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
            }
            None => {}
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(mutations = n, "batch committed");
        Ok(())
    }

    async fn snapshot(&self, path: &Path) -> Result<(), IndexerError> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| IndexerError::Storage(format!("create {}: {e}", dir.display())))?;
        }
        sqlx::query("VACUUM INTO ?")
            .bind(path.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        debug!(path = %path.display(), "snapshot written");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
