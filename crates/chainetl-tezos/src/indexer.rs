//! Persists built blocks and undoes them on rollback.
//!
//! A block is written as one [`WriteBatch`] spanning every table plus the
//! head pointer, so a reader never sees half a block. Entities that carry
//! state across blocks (accounts, bakers, contracts) keep one history row
//! per write. Rolling back block `h` restores each entity from the history
//! row it pointed at before `h` or deletes it if `h` created it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chainetl_core::checkpoint::Checkpoint;
use chainetl_core::error::IndexerError;
use chainetl_core::reorg::LocalChain;
use chainetl_core::store::{Row, TableStore, WriteBatch};

use crate::builder::BuiltBlock;
use crate::model::{Account, AccountId, Baker, BigmapEvent, Block, Contract, Flow, Op, OpType};
use crate::rpc::Right;

// ─── Tables ───────────────────────────────────────────────────────────────────

pub mod tables {
    pub const BLOCKS: &str = "blocks";
    pub const OPS: &str = "ops";
    pub const ENDORSEMENTS: &str = "endorsements";
    pub const FLOWS: &str = "flows";
    pub const BIGMAPS: &str = "bigmaps";
    pub const RIGHTS: &str = "rights";
    pub const ACCOUNTS: &str = "accounts";
    pub const BAKERS: &str = "bakers";
    pub const CONTRACTS: &str = "contracts";
    pub const ACCOUNTS_HISTORY: &str = "accounts_history";
    pub const BAKERS_HISTORY: &str = "bakers_history";
    pub const CONTRACTS_HISTORY: &str = "contracts_history";

    /// Tables whose rows belong to exactly one block.
    pub const PER_BLOCK: [&str; 5] = [FLOWS, OPS, ENDORSEMENTS, BIGMAPS, RIGHTS];

    /// Entity tables with their history, in rollback order.
    pub const ENTITIES: [(&str, &str); 3] = [
        (CONTRACTS, CONTRACTS_HISTORY),
        (BAKERS, BAKERS_HISTORY),
        (ACCOUNTS, ACCOUNTS_HISTORY),
    ];
}

use tables::*;

/// Rows a single block may write into one per-block table.
pub const ROWS_PER_BLOCK: u64 = 1 << 20;

/// Row id of the `n`-th row a block writes into a per-block table.
///
/// Fails once `n` would spill into the height bits of the next block.
pub fn block_row_id(height: u64, n: u64) -> Result<u64, IndexerError> {
    if n >= ROWS_PER_BLOCK {
        return Err(IndexerError::invariant(
            height,
            format!("row {n} exceeds the per-block limit of {ROWS_PER_BLOCK}"),
        ));
    }
    Ok((height << 20) | n)
}

/// One bigmap change as stored in the `bigmaps` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigmapUpdate {
    pub height: u64,
    pub op_n: u32,
    /// The contract whose operation produced the change.
    pub contract_id: Option<AccountId>,
    #[serde(flatten)]
    pub event: BigmapEvent,
}

/// Entity state written by one block.
#[derive(Debug, Serialize, Deserialize)]
struct History<T> {
    id: u64,
    key: String,
    /// Height of the previous write, `None` if this block created the entity.
    prev_height: Option<u64>,
    entity: T,
}

fn history_key(id: u64, height: u64) -> String {
    format!("{id}@{height}")
}

// ─── Indexer ──────────────────────────────────────────────────────────────────

pub struct Indexer<S> {
    store: Arc<S>,
}

impl<S> Clone for Indexer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: TableStore> Indexer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Persist a built block on top of the current head.
    ///
    /// Fails without writing anything if the block does not extend the
    /// head, the store rejects the batch, or `token` is cancelled first.
    pub async fn commit(
        &self,
        built: BuiltBlock,
        token: &CancellationToken,
    ) -> Result<(), IndexerError> {
        let BuiltBlock {
            block,
            mut cache,
            rights,
        } = built;
        let h = block.height;

        if let Some(head) = self.store.head().await? {
            if head.height + 1 != h || head.hash != block.predecessor {
                return Err(IndexerError::invariant(
                    h,
                    format!(
                        "block {} does not extend head {} at {}",
                        block.hash, head.hash, head.height
                    ),
                ));
            }
        }

        let mut batch = WriteBatch::new();
        batch.put(BLOCKS, Row::encode(h, h, Some(block.hash.clone()), &*block)?);

        let mut n_bigmaps = 0;
        for op in &block.ops {
            let table = if op.op_type == OpType::Endorsement {
                ENDORSEMENTS
            } else {
                OPS
            };
            batch.put(table, Row::encode(block_row_id(h, u64::from(op.op_n))?, h, None, &**op)?);
            for event in &op.bigmap_events {
                let update = BigmapUpdate {
                    height: h,
                    op_n: op.op_n,
                    contract_id: op.receiver_id,
                    event: event.clone(),
                };
                batch.put(BIGMAPS, Row::encode(block_row_id(h, n_bigmaps)?, h, None, &update)?);
                n_bigmaps += 1;
            }
        }
        for (i, flow) in block.flows.iter().enumerate() {
            batch.put(FLOWS, Row::encode(block_row_id(h, i as u64)?, h, None, &**flow)?);
        }
        for (i, right) in rights.iter().enumerate() {
            batch.put(RIGHTS, Row::encode(block_row_id(h, i as u64)?, h, None, right)?);
        }

        let dirty = cache.flush();
        for (i, a) in dirty.accounts.iter().enumerate() {
            put_entity(&mut batch, (ACCOUNTS, ACCOUNTS_HISTORY), h, i, a.id, &a.address, a.stored_height, a)?;
        }
        for (i, b) in dirty.bakers.iter().enumerate() {
            put_entity(&mut batch, (BAKERS, BAKERS_HISTORY), h, i, b.account_id, &b.address, b.stored_height, b)?;
        }
        for (i, c) in dirty.contracts.iter().enumerate() {
            put_entity(&mut batch, (CONTRACTS, CONTRACTS_HISTORY), h, i, c.account_id, &c.address, c.stored_height, c)?;
        }

        if let Some(slots) = block.parent_slots_endorsed {
            self.set_parent_slots(&mut batch, h, slots).await?;
        }

        batch.set_head(Checkpoint::new(h, block.hash.clone()));
        let n = batch.len();
        self.apply(batch, token).await?;
        info!(
            height = h,
            hash = %block.hash,
            ops = block.ops.len(),
            flows = block.flows.len(),
            rows = n,
            "committed block"
        );
        Ok(())
    }

    /// Undo the block at `height`, which must be the current head.
    pub async fn rollback(&self, height: u64, token: &CancellationToken) -> Result<(), IndexerError> {
        let head = self
            .store
            .head()
            .await?
            .ok_or_else(|| IndexerError::invariant(height, "rollback on an empty index"))?;
        if head.height != height {
            return Err(IndexerError::invariant(
                height,
                format!("rollback target is not the head at {}", head.height),
            ));
        }
        let block = self
            .block(height)
            .await?
            .ok_or_else(|| IndexerError::NotFound(format!("block {height}")))?;

        let mut batch = WriteBatch::new();
        for table in PER_BLOCK {
            for row in self.store.at_height(table, height).await? {
                batch.delete(table, row.id);
            }
        }

        let mut restored = 0usize;
        for (table, history) in ENTITIES {
            for row in self.store.at_height(history, height).await? {
                let entry: History<serde_json::Value> = row.decode()?;
                match entry.prev_height {
                    Some(prev) => {
                        let before = self
                            .store
                            .get_by_key(history, &history_key(entry.id, prev))
                            .await?
                            .ok_or_else(|| {
                                IndexerError::Storage(format!(
                                    "{history}: no entry for {} at {prev}",
                                    entry.id
                                ))
                            })?;
                        let before: History<serde_json::Value> = before.decode()?;
                        batch.put(
                            table,
                            Row {
                                id: entry.id,
                                height: prev,
                                key: Some(entry.key),
                                data: before.entity,
                            },
                        );
                    }
                    None => {
                        batch.delete(table, entry.id);
                    }
                }
                batch.delete(history, row.id);
                restored += 1;
            }
        }

        if height > 0 && block.counters.n_endorsements > 0 {
            self.set_parent_slots(&mut batch, height, 0).await?;
        }

        batch.delete(BLOCKS, height);
        match height {
            0 => batch.clear_head(),
            h => batch.set_head(Checkpoint::new(h - 1, block.predecessor.clone())),
        };
        self.apply(batch, token).await?;
        warn!(height, hash = %block.hash, entities = restored, "rolled back block");
        Ok(())
    }

    /// Rewrite the endorsement count of the parent of `height`.
    async fn set_parent_slots(
        &self,
        batch: &mut WriteBatch,
        height: u64,
        slots: u32,
    ) -> Result<(), IndexerError> {
        let Some(row) = self.store.get(BLOCKS, height - 1).await? else {
            debug!(height, "parent block not indexed, skipping endorsement count");
            return Ok(());
        };
        let mut parent: Block = row.decode()?;
        parent.n_slots_endorsed = slots;
        batch.put(BLOCKS, Row::encode(row.id, row.height, row.key, &parent)?);
        Ok(())
    }

    /// Cancellation may drop `store.commit` midway: the memory store reverts
    /// a partial batch and an uncommitted sqlx transaction rolls back on drop,
    /// so the head stays at the last complete commit either way.
    async fn apply(&self, batch: WriteBatch, token: &CancellationToken) -> Result<(), IndexerError> {
        if token.is_cancelled() {
            return Err(IndexerError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(IndexerError::Cancelled),
            r = self.store.commit(batch) => r,
        }
    }

    // ─── Lookups ─────────────────────────────────────────────────────────────

    pub async fn head(&self) -> Result<Option<Checkpoint>, IndexerError> {
        self.store.head().await
    }

    pub async fn block(&self, height: u64) -> Result<Option<Block>, IndexerError> {
        self.store
            .get(BLOCKS, height)
            .await?
            .map(|r| r.decode())
            .transpose()
    }

    pub async fn block_hash(&self, height: u64) -> Result<Option<String>, IndexerError> {
        Ok(self.store.get(BLOCKS, height).await?.and_then(|r| r.key))
    }

    pub async fn block_time(
        &self,
        height: u64,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>, IndexerError> {
        Ok(self.block(height).await?.map(|b| b.timestamp))
    }

    pub async fn address(&self, id: AccountId) -> Result<Option<String>, IndexerError> {
        Ok(self.store.get(ACCOUNTS, id).await?.and_then(|r| r.key))
    }

    pub async fn account_id(&self, address: &str) -> Result<Option<AccountId>, IndexerError> {
        Ok(self.store.get_by_key(ACCOUNTS, address).await?.map(|r| r.id))
    }

    pub async fn account(&self, address: &str) -> Result<Option<Account>, IndexerError> {
        Ok(self.load_account(address).await?.map(|(a, _)| a))
    }

    /// Stored account and the height of its last write.
    pub async fn load_account(&self, address: &str) -> Result<Option<(Account, u64)>, IndexerError> {
        self.store
            .get_by_key(ACCOUNTS, address)
            .await?
            .map(|r| Ok((r.decode()?, r.height)))
            .transpose()
    }

    pub async fn load_baker(&self, id: AccountId) -> Result<Option<(Baker, u64)>, IndexerError> {
        self.store
            .get(BAKERS, id)
            .await?
            .map(|r| Ok((r.decode()?, r.height)))
            .transpose()
    }

    pub async fn load_contract(&self, id: AccountId) -> Result<Option<(Contract, u64)>, IndexerError> {
        self.store
            .get(CONTRACTS, id)
            .await?
            .map(|r| Ok((r.decode()?, r.height)))
            .transpose()
    }

    /// Code and storage hash of a contract.
    pub async fn contract_type(&self, id: AccountId) -> Result<Option<(u64, u64)>, IndexerError> {
        Ok(self
            .load_contract(id)
            .await?
            .map(|(c, _)| (c.code_hash, c.storage_hash)))
    }

    /// Ops and endorsements of a block in block order.
    pub async fn ops(&self, height: u64) -> Result<Vec<Op>, IndexerError> {
        let mut ops = decode_all::<Op>(self.store.at_height(OPS, height).await?)?;
        ops.extend(decode_all::<Op>(self.store.at_height(ENDORSEMENTS, height).await?)?);
        ops.sort_by_key(|o| o.op_n);
        Ok(ops)
    }

    pub async fn flows(&self, height: u64) -> Result<Vec<Flow>, IndexerError> {
        decode_all(self.store.at_height(FLOWS, height).await?)
    }

    pub async fn bigmaps(&self, height: u64) -> Result<Vec<BigmapUpdate>, IndexerError> {
        decode_all(self.store.at_height(BIGMAPS, height).await?)
    }

    pub async fn rights(&self, height: u64) -> Result<Vec<Right>, IndexerError> {
        decode_all(self.store.at_height(RIGHTS, height).await?)
    }

    /// Id the next new account receives.
    pub async fn next_account_id(&self) -> Result<AccountId, IndexerError> {
        Ok(self.store.last(ACCOUNTS).await?.map_or(1, |r| r.id + 1))
    }

    pub async fn snapshot(&self, path: &Path) -> Result<(), IndexerError> {
        self.store.snapshot(path).await
    }
}

#[allow(clippy::too_many_arguments)]
fn put_entity<T: Serialize>(
    batch: &mut WriteBatch,
    (table, history): (&str, &str),
    height: u64,
    n: usize,
    id: u64,
    key: &str,
    prev_height: Option<u64>,
    entity: &T,
) -> Result<(), IndexerError> {
    batch.put(table, Row::encode(id, height, Some(key.to_string()), entity)?);
    let entry = History {
        id,
        key: key.to_string(),
        prev_height,
        entity,
    };
    batch.put(
        history,
        Row::encode(
            block_row_id(height, n as u64)?,
            height,
            Some(history_key(id, height)),
            &entry,
        )?,
    );
    Ok(())
}

fn decode_all<T: serde::de::DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>, IndexerError> {
    rows.iter().map(Row::decode).collect()
}

#[async_trait]
impl<S: TableStore> LocalChain for Indexer<S> {
    async fn local_hash(&self, height: u64) -> Result<Option<String>, IndexerError> {
        self.block_hash(height).await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
