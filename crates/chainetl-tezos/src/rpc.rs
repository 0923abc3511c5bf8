//! Raw client adapter contract.
//!
//! The node's wire protocol is out of scope: implementations of
//! [`RawClient`] translate whatever the node speaks into the normalized
//! shapes below. Only [`RetryingClient`] knows about retries.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use chainetl_core::error::IndexerError;
use chainetl_core::retry::{RetryConfig, RetryPolicy};
use chainetl_core::types::{BlockHeader, BlockId};

/// Transfers to this address destroy the amount.
pub const BURN_ADDRESS: &str = "tz1burnburnburnburnburnburnburjAYjjX";

/// Returns `true` for originated (smart contract) addresses.
pub fn is_contract_address(address: &str) -> bool {
    address.starts_with("KT1")
}

/// First 8 bytes of the SHA-256 of `value`'s JSON encoding.
pub fn hash64(value: &Value) -> u64 {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

// ─── Balance updates ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Contract,
    Freezer,
    Accumulator,
    Minted,
    Burned,
    Commitment,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateCategory {
    #[default]
    None,
    Deposits,
    Rewards,
    Fees,
    LostRewards,
    LostFees,
    BakingRewards,
    BakingBonuses,
    BlockFees,
    EndorsingRewards,
    LostEndorsingRewards,
    LostNonceRewards,
    NonceRevelationRewards,
    DoubleSigningRewards,
    Punishments,
    StorageFees,
    Subsidy,
    Invoice,
    Bootstrap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    #[default]
    Block,
    Migration,
    Subsidy,
}

/// One balance change reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    /// Owner; `None` for sinks and sources (mint, burn, accumulators).
    #[serde(default)]
    pub address: Option<String>,
    pub kind: UpdateKind,
    #[serde(default)]
    pub category: UpdateCategory,
    pub change: i64,
    #[serde(default)]
    pub origin: UpdateOrigin,
}

impl BalanceUpdate {
    pub fn contract(address: &str, category: UpdateCategory, change: i64) -> Self {
        Self {
            address: Some(address.to_string()),
            kind: UpdateKind::Contract,
            category,
            change,
            origin: UpdateOrigin::Block,
        }
    }

    pub fn freezer(address: &str, category: UpdateCategory, change: i64) -> Self {
        Self {
            address: Some(address.to_string()),
            kind: UpdateKind::Freezer,
            category,
            change,
            origin: UpdateOrigin::Block,
        }
    }

    /// An update without an owning account.
    pub fn sink(kind: UpdateKind, category: UpdateCategory, change: i64) -> Self {
        Self {
            address: None,
            kind,
            category,
            change,
            origin: UpdateOrigin::Block,
        }
    }

    pub fn with_origin(mut self, origin: UpdateOrigin) -> Self {
        self.origin = origin;
        self
    }
}

// ─── Scripts and bigmaps ──────────────────────────────────────────────────────

/// A bigmap allocated by a contract's storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigmapDecl {
    pub id: i64,
    pub key_type: Value,
    pub value_type: Value,
}

/// Contract code and initial storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub code: Value,
    pub storage: Value,
    #[serde(default)]
    pub bigmaps: Vec<BigmapDecl>,
}

impl Script {
    /// Reject scripts whose code section is not a non-empty sequence.
    pub fn check(&self, address: &str) -> Result<(), IndexerError> {
        match self.code.as_array() {
            Some(code) if !code.is_empty() => Ok(()),
            _ => Err(IndexerError::MalformedScript {
                address: address.to_string(),
                reason: "code is not a non-empty sequence".into(),
            }),
        }
    }

    pub fn code_hash(&self) -> u64 {
        hash64(&self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BigmapAction {
    Alloc,
    Update,
    Remove,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBigmapDiff {
    pub action: BigmapAction,
    pub id: i64,
    #[serde(default)]
    pub key: Option<Value>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub key_type: Option<Value>,
    #[serde(default)]
    pub value_type: Option<Value>,
    #[serde(default)]
    pub source_id: Option<i64>,
}

// ─── Operations ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    #[default]
    Applied,
    Failed,
    Backtracked,
    Skipped,
}

/// Execution result of a manager or internal operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpResult {
    pub status: OpStatus,
    pub consumed_gas: i64,
    pub paid_storage_size_diff: i64,
    pub balance_updates: Vec<BalanceUpdate>,
    pub originated_contracts: Vec<String>,
    pub storage: Option<Value>,
    pub bigmap_diff: Vec<RawBigmapDiff>,
}

/// Fields shared by all manager operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerOp {
    pub source: String,
    pub fee: i64,
    #[serde(default)]
    pub counter: u64,
    pub gas_limit: i64,
    pub storage_limit: i64,
    /// Fee payment (debit of `source`, credit of the baker or accumulator).
    #[serde(default)]
    pub fee_updates: Vec<BalanceUpdate>,
    #[serde(default)]
    pub result: OpResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub entrypoint: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalKind {
    Transaction,
    Origination,
    Delegation,
}

/// An operation emitted by a contract during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalOp {
    pub kind: InternalKind,
    pub source: String,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub delegate: Option<String>,
    #[serde(default)]
    pub parameters: Option<Parameters>,
    #[serde(default)]
    pub script: Option<Script>,
    #[serde(default)]
    pub result: OpResult,
}

/// Closed set of operation kinds the builder translates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawOpBody {
    Endorsement {
        delegate: String,
        slots: u32,
        #[serde(default)]
        balance_updates: Vec<BalanceUpdate>,
    },
    SeedNonceRevelation {
        level: u64,
        nonce: String,
        #[serde(default)]
        balance_updates: Vec<BalanceUpdate>,
    },
    DoubleBakingEvidence {
        offender: String,
        #[serde(default)]
        balance_updates: Vec<BalanceUpdate>,
    },
    DoubleEndorsementEvidence {
        offender: String,
        #[serde(default)]
        balance_updates: Vec<BalanceUpdate>,
    },
    Activation {
        pkh: String,
        secret: String,
        #[serde(default)]
        balance_updates: Vec<BalanceUpdate>,
    },
    Proposals {
        source: String,
        period: i64,
        proposals: Vec<String>,
    },
    Ballot {
        source: String,
        period: i64,
        proposal: String,
        ballot: String,
    },
    Reveal {
        #[serde(flatten)]
        manager: ManagerOp,
        public_key: String,
    },
    Transaction {
        #[serde(flatten)]
        manager: ManagerOp,
        amount: i64,
        destination: String,
        #[serde(default)]
        parameters: Option<Parameters>,
        #[serde(default)]
        internal: Vec<InternalOp>,
    },
    Origination {
        #[serde(flatten)]
        manager: ManagerOp,
        balance: i64,
        #[serde(default)]
        delegate: Option<String>,
        script: Script,
        #[serde(default)]
        internal: Vec<InternalOp>,
    },
    Delegation {
        #[serde(flatten)]
        manager: ManagerOp,
        #[serde(default)]
        delegate: Option<String>,
    },
    RegisterGlobalConstant {
        #[serde(flatten)]
        manager: ManagerOp,
        value: Value,
    },
    SetDepositsLimit {
        #[serde(flatten)]
        manager: ManagerOp,
        #[serde(default)]
        limit: Option<i64>,
    },
    RollupOrigination {
        #[serde(flatten)]
        manager: ManagerOp,
    },
    RollupTransaction {
        #[serde(flatten)]
        manager: ManagerOp,
        rollup: String,
    },
}

/// One operation of a block's operation lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOperation {
    pub hash: String,
    pub body: RawOpBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplicitKind {
    Origination,
    Transaction,
}

/// A block-level result not tied to any operation (migrations, subsidies).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplicitResult {
    pub kind: ImplicitKind,
    #[serde(default)]
    pub originated_contracts: Vec<String>,
    #[serde(default)]
    pub script: Option<Script>,
    #[serde(default)]
    pub storage: Option<Value>,
    #[serde(default)]
    pub balance_updates: Vec<BalanceUpdate>,
    #[serde(default)]
    pub consumed_gas: i64,
    #[serde(default)]
    pub paid_storage_size_diff: i64,
}

// ─── Blocks ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingPeriodKind {
    #[default]
    Proposal,
    Exploration,
    Cooldown,
    Promotion,
    Adoption,
}

/// A block as delivered by the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
    pub hash: String,
    pub predecessor: String,
    pub height: u64,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub protocol: String,
    pub version: u32,
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub payload_round: u32,
    /// Hex-encoded proof-of-work nonce from the header.
    #[serde(default)]
    pub nonce_hex: String,
    #[serde(default)]
    pub voting_period_kind: Option<VotingPeriodKind>,
    pub baker: String,
    #[serde(default)]
    pub proposer: Option<String>,
    /// Operation lists: consensus, voting, anonymous, manager.
    #[serde(default)]
    pub operations: Vec<Vec<RawOperation>>,
    #[serde(default)]
    pub balance_updates: Vec<BalanceUpdate>,
    #[serde(default)]
    pub implicit_results: Vec<ImplicitResult>,
}

impl RawBlock {
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            height: self.height,
            hash: self.hash.clone(),
            predecessor: self.predecessor.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Every address the block references, in first-seen order.
    pub fn addresses(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let mut add = |a: &str| {
            if seen.insert(a.to_string()) {
                out.push(a.to_string());
            }
        };
        add(&self.baker);
        if let Some(p) = &self.proposer {
            add(p);
        }
        let updates = |list: &[BalanceUpdate], add: &mut dyn FnMut(&str)| {
            for u in list {
                if let Some(a) = &u.address {
                    add(a);
                }
            }
        };
        for op in self.operations.iter().flatten() {
            match &op.body {
                RawOpBody::Endorsement { delegate, balance_updates, .. } => {
                    add(delegate);
                    updates(balance_updates, &mut add);
                }
                RawOpBody::SeedNonceRevelation { balance_updates, .. } => {
                    updates(balance_updates, &mut add);
                }
                RawOpBody::DoubleBakingEvidence { offender, balance_updates }
                | RawOpBody::DoubleEndorsementEvidence { offender, balance_updates } => {
                    add(offender);
                    updates(balance_updates, &mut add);
                }
                RawOpBody::Activation { pkh, balance_updates, .. } => {
                    add(pkh);
                    updates(balance_updates, &mut add);
                }
                RawOpBody::Proposals { source, .. } | RawOpBody::Ballot { source, .. } => {
                    add(source);
                }
                RawOpBody::Transaction { manager, destination, internal, .. } => {
                    add(&manager.source);
                    add(destination);
                    updates(&manager.fee_updates, &mut add);
                    updates(&manager.result.balance_updates, &mut add);
                    for i in internal {
                        add(&i.source);
                        if let Some(d) = i.destination.as_ref().or(i.delegate.as_ref()) {
                            add(d);
                        }
                        updates(&i.result.balance_updates, &mut add);
                    }
                }
                RawOpBody::Origination { manager, delegate, internal, .. } => {
                    add(&manager.source);
                    if let Some(d) = delegate {
                        add(d);
                    }
                    updates(&manager.fee_updates, &mut add);
                    updates(&manager.result.balance_updates, &mut add);
                    for i in internal {
                        add(&i.source);
                        updates(&i.result.balance_updates, &mut add);
                    }
                }
                RawOpBody::Delegation { manager, delegate } => {
                    add(&manager.source);
                    if let Some(d) = delegate {
                        add(d);
                    }
                    updates(&manager.fee_updates, &mut add);
                }
                RawOpBody::Reveal { manager, .. }
                | RawOpBody::RegisterGlobalConstant { manager, .. }
                | RawOpBody::SetDepositsLimit { manager, .. }
                | RawOpBody::RollupOrigination { manager }
                | RawOpBody::RollupTransaction { manager, .. } => {
                    add(&manager.source);
                    updates(&manager.fee_updates, &mut add);
                    updates(&manager.result.balance_updates, &mut add);
                }
            }
        }
        updates(&self.balance_updates, &mut add);
        for r in &self.implicit_results {
            for c in &r.originated_contracts {
                add(c);
            }
            updates(&r.balance_updates, &mut add);
        }
        out
    }
}

// ─── Constants and rights ─────────────────────────────────────────────────────

/// Protocol constants as reported by the node for a given height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constants {
    pub blocks_per_cycle: u64,
    pub preserved_cycles: u64,
    /// Target seconds between blocks.
    pub minimal_block_delay: u64,
    pub consensus_committee_size: u32,
    pub cost_per_byte: i64,
}

impl Default for Constants {
    fn default() -> Self {
        Self {
            blocks_per_cycle: 8192,
            preserved_cycles: 5,
            minimal_block_delay: 30,
            consensus_committee_size: 7000,
            cost_per_byte: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RightKind {
    Baking,
    Endorsing,
}

/// A baking or endorsing right for a future block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Right {
    pub kind: RightKind,
    pub height: u64,
    pub cycle: u64,
    pub round: u32,
    pub address: String,
}

// ─── Client contract ──────────────────────────────────────────────────────────

/// Access to the upstream node.
///
/// Errors for which [`IndexerError::is_transient`] holds may be retried;
/// everything else is final.
#[async_trait]
pub trait RawClient: Send + Sync {
    /// Current head of the node's canonical chain.
    async fn get_head(&self) -> Result<BlockHeader, IndexerError>;

    async fn get_header(&self, id: BlockId) -> Result<BlockHeader, IndexerError>;

    async fn get_block(&self, id: BlockId) -> Result<RawBlock, IndexerError>;

    /// Protocol constants in force at `height`.
    async fn get_constants(&self, height: u64) -> Result<Constants, IndexerError>;

    /// Rights for `cycle`, queried in the context of block `height`.
    async fn fetch_rights_by_cycle(
        &self,
        height: u64,
        cycle: u64,
    ) -> Result<Vec<Right>, IndexerError>;

    async fn get_contract_script(&self, address: &str) -> Result<Script, IndexerError>;
}

/// Wraps a client and retries transient failures with exponential backoff.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: RawClient> RetryingClient<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self {
            inner,
            policy: RetryPolicy::new(config),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, method: &str, mut call: F) -> Result<T, IndexerError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, IndexerError>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    let Some(delay) = self.policy.next_delay(attempt) else {
                        return Err(e);
                    };
                    tracing::warn!(
                        method,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<C: RawClient> RawClient for RetryingClient<C> {
    async fn get_head(&self) -> Result<BlockHeader, IndexerError> {
        self.retry("get_head", || self.inner.get_head()).await
    }

    async fn get_header(&self, id: BlockId) -> Result<BlockHeader, IndexerError> {
        self.retry("get_header", || self.inner.get_header(id.clone())).await
    }

    async fn get_block(&self, id: BlockId) -> Result<RawBlock, IndexerError> {
        self.retry("get_block", || self.inner.get_block(id.clone())).await
    }

    async fn get_constants(&self, height: u64) -> Result<Constants, IndexerError> {
        self.retry("get_constants", || self.inner.get_constants(height)).await
    }

    async fn fetch_rights_by_cycle(
        &self,
        height: u64,
        cycle: u64,
    ) -> Result<Vec<Right>, IndexerError> {
        self.retry("fetch_rights_by_cycle", || {
            self.inner.fetch_rights_by_cycle(height, cycle)
        })
        .await
    }

    async fn get_contract_script(&self, address: &str) -> Result<Script, IndexerError> {
        self.retry("get_contract_script", || self.inner.get_contract_script(address))
            .await
    }
}

/// Adapts a [`RawClient`] to the reorg detector's header source.
pub struct NodeHeaders<'a, C: ?Sized>(pub &'a C);

#[async_trait]
impl<C: RawClient + ?Sized> chainetl_core::reorg::HeaderSource for NodeHeaders<'_, C> {
    async fn header_by_hash(&self, hash: &str) -> Result<BlockHeader, IndexerError> {
        self.0.get_header(BlockId::Hash(hash.to_string())).await
    }
}
