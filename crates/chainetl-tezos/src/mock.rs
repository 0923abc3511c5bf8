//! Deterministic in-memory node and block generators for tests.
//!
//! Every generated block has the same shape: a baking reward, a frozen
//! deposit and a fee credited to [`BAKER`], one transfer from [`ALICE`]
//! (to [`BOB`] on most chains, to [`CAROL`] on chain `"B"`) and, from height
//! 2 on, an endorsement of the parent. Genesis pays invoices to [`ALICE`]
//! and [`BAKER`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use chainetl_core::error::IndexerError;
use chainetl_core::types::{BlockHeader, BlockId};

use crate::params::Params;
use crate::rpc::{
    BalanceUpdate, BigmapDecl, Constants, ImplicitKind, ImplicitResult, ManagerOp, OpResult,
    RawBlock, RawClient, RawOpBody, RawOperation, Right, RightKind, Script, UpdateCategory,
    UpdateKind, UpdateOrigin,
};

pub const BAKER: &str = "tz1MockBaker11111111111111111111111";
pub const ALICE: &str = "tz1MockAlice11111111111111111111111";
pub const BOB: &str = "tz1MockBob1111111111111111111111111";
pub const CAROL: &str = "tz1MockCarol11111111111111111111111";
/// A contract originated by protocol migration.
pub const LB: &str = "KT1MockLiquidityBaking1111111111111";

pub const ALICE_INVOICE: i64 = 1_000_000;
pub const BAKER_INVOICE: i64 = 5_000_000;
pub const BAKING_REWARD: i64 = 10;
pub const DEPOSIT: i64 = 100;
pub const FEE: i64 = 1;
pub const SLOTS: u32 = 5;
pub const AMOUNT: i64 = 1_000;

const GENESIS_TIME: i64 = 1_600_000_000;
const BLOCK_TIME: i64 = 30;

/// Four blocks per cycle, two preserved cycles.
pub fn constants() -> Constants {
    Constants {
        blocks_per_cycle: 4,
        preserved_cycles: 2,
        minimal_block_delay: BLOCK_TIME as u64,
        consensus_committee_size: 32,
        cost_per_byte: 250,
    }
}

/// Block `{tag}{height}` on top of `predecessor`.
pub fn block(tag: &str, height: u64, predecessor: &str, version: u32) -> RawBlock {
    let mut raw = RawBlock {
        hash: format!("{tag}{height}"),
        predecessor: predecessor.to_string(),
        height,
        cycle: height.saturating_sub(1) / constants().blocks_per_cycle,
        timestamp: DateTime::<Utc>::from_timestamp(GENESIS_TIME + height as i64 * BLOCK_TIME, 0)
            .unwrap_or_default(),
        protocol: "PtMock".into(),
        version,
        round: 0,
        payload_round: 0,
        nonce_hex: format!("{height:016x}"),
        voting_period_kind: None,
        baker: BAKER.into(),
        proposer: None,
        operations: vec![Vec::new(), Vec::new(), Vec::new(), Vec::new()],
        balance_updates: Vec::new(),
        implicit_results: Vec::new(),
    };

    if height == 0 {
        raw.balance_updates = vec![
            BalanceUpdate::contract(ALICE, UpdateCategory::Invoice, ALICE_INVOICE)
                .with_origin(UpdateOrigin::Migration),
            BalanceUpdate::contract(BAKER, UpdateCategory::Invoice, BAKER_INVOICE)
                .with_origin(UpdateOrigin::Migration),
        ];
        return raw;
    }

    raw.balance_updates = vec![
        BalanceUpdate::sink(UpdateKind::Minted, UpdateCategory::BakingRewards, -BAKING_REWARD),
        BalanceUpdate::contract(BAKER, UpdateCategory::BakingRewards, BAKING_REWARD),
        BalanceUpdate::contract(BAKER, UpdateCategory::None, -DEPOSIT),
        BalanceUpdate::freezer(BAKER, UpdateCategory::Deposits, DEPOSIT),
        BalanceUpdate::sink(UpdateKind::Accumulator, UpdateCategory::BlockFees, -FEE),
        BalanceUpdate::contract(BAKER, UpdateCategory::BlockFees, FEE),
    ];
    if height >= 2 {
        raw.operations[0].push(RawOperation {
            hash: format!("o{tag}{height}e"),
            body: RawOpBody::Endorsement {
                delegate: BAKER.into(),
                slots: SLOTS,
                balance_updates: Vec::new(),
            },
        });
    }
    let to = if tag == "B" { CAROL } else { BOB };
    raw.operations[3].push(transfer(&format!("o{tag}{height}t"), ALICE, to, AMOUNT));
    raw
}

/// Blocks `from..=to` of chain `tag`.
pub fn chain(tag: &str, from: u64, to: u64) -> Vec<RawBlock> {
    let pred = match from {
        0 => "genesis".to_string(),
        h => format!("{tag}{}", h - 1),
    };
    fork(tag, &pred, from, to)
}

/// Blocks `from..=to` of chain `tag`, the first one on top of `parent`.
pub fn fork(tag: &str, parent: &str, from: u64, to: u64) -> Vec<RawBlock> {
    let mut out = Vec::new();
    let mut pred = parent.to_string();
    for h in from..=to {
        let raw = block(tag, h, &pred, 12);
        pred = raw.hash.clone();
        out.push(raw);
    }
    out
}

/// A successful transfer paying [`FEE`] into the block fee accumulator.
pub fn transfer(hash: &str, from: &str, to: &str, amount: i64) -> RawOperation {
    RawOperation {
        hash: hash.into(),
        body: RawOpBody::Transaction {
            manager: ManagerOp {
                source: from.into(),
                fee: FEE,
                counter: 1,
                gas_limit: 1_500,
                storage_limit: 0,
                fee_updates: vec![
                    BalanceUpdate::contract(from, UpdateCategory::None, -FEE),
                    BalanceUpdate::sink(UpdateKind::Accumulator, UpdateCategory::BlockFees, FEE),
                ],
                result: OpResult {
                    consumed_gas: 1_000,
                    balance_updates: vec![
                        BalanceUpdate::contract(from, UpdateCategory::None, -amount),
                        BalanceUpdate::contract(to, UpdateCategory::None, amount),
                    ],
                    ..Default::default()
                },
            },
            amount,
            destination: to.into(),
            parameters: None,
            internal: Vec::new(),
        },
    }
}

/// A contract script allocating one bigmap.
pub fn script() -> Script {
    Script {
        code: json!([
            { "prim": "parameter", "args": [{ "prim": "unit" }] },
            { "prim": "storage", "args": [{ "prim": "big_map" }] },
            { "prim": "code", "args": [[{ "prim": "CDR" }]] },
        ]),
        storage: json!({ "int": "7" }),
        bigmaps: vec![BigmapDecl {
            id: 7,
            key_type: json!({ "prim": "address" }),
            value_type: json!({ "prim": "nat" }),
        }],
    }
}

/// Migration origination of `address`; without a script the node serves it.
pub fn implicit_origination(address: &str, script: Option<Script>) -> ImplicitResult {
    ImplicitResult {
        kind: ImplicitKind::Origination,
        originated_contracts: vec![address.to_string()],
        script,
        storage: Some(json!({ "int": "7" })),
        balance_updates: Vec::new(),
        consumed_gas: 1_000,
        paid_storage_size_diff: 512,
    }
}

/// Protocol subsidy of `amount` minted to `address`.
pub fn subsidy(address: &str, amount: i64) -> ImplicitResult {
    ImplicitResult {
        kind: ImplicitKind::Transaction,
        originated_contracts: Vec::new(),
        script: None,
        storage: Some(json!({ "int": amount.to_string() })),
        balance_updates: vec![
            BalanceUpdate::sink(UpdateKind::Minted, UpdateCategory::Subsidy, -amount)
                .with_origin(UpdateOrigin::Subsidy),
            BalanceUpdate::contract(address, UpdateCategory::Subsidy, amount)
                .with_origin(UpdateOrigin::Subsidy),
        ],
        consumed_gas: 500,
        paid_storage_size_diff: 0,
    }
}

// ─── MockNode ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct NodeState {
    constants: Option<Constants>,
    canonical: BTreeMap<u64, String>,
    blocks: HashMap<String, RawBlock>,
    scripts: HashMap<String, Script>,
    failures: u32,
    rights_requests: Vec<(u64, u64)>,
}

/// A node serving pushed blocks.
#[derive(Default)]
pub struct MockNode {
    state: Mutex<NodeState>,
}

impl MockNode {
    pub fn new(constants: Constants) -> Self {
        Self {
            state: Mutex::new(NodeState {
                constants: Some(constants),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `blocks` canonical, replacing everything from the first one up.
    /// Replaced blocks stay reachable by hash.
    pub fn push_chain(&self, blocks: Vec<RawBlock>) {
        let mut s = self.lock();
        if let Some(first) = blocks.first() {
            let _ = s.canonical.split_off(&first.height);
        }
        for raw in blocks {
            s.canonical.insert(raw.height, raw.hash.clone());
            s.blocks.insert(raw.hash.clone(), raw);
        }
    }

    /// Fail the next `n` requests with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.lock().failures = n;
    }

    pub fn add_script(&self, address: &str, script: Script) {
        self.lock().scripts.insert(address.to_string(), script);
    }

    /// Stop serving protocol constants.
    pub fn drop_constants(&self) {
        self.lock().constants = None;
    }

    /// `(height, cycle)` of every rights request so far.
    pub fn rights_requests(&self) -> Vec<(u64, u64)> {
        self.lock().rights_requests.clone()
    }

    fn request(&self, what: &str) -> Result<MutexGuard<'_, NodeState>, IndexerError> {
        let mut s = self.lock();
        if s.failures > 0 {
            s.failures -= 1;
            return Err(IndexerError::Rpc(format!("{what}: injected failure")));
        }
        Ok(s)
    }
}

impl NodeState {
    fn find(&self, id: &BlockId) -> Result<&RawBlock, IndexerError> {
        let hash = match id {
            BlockId::Head => self.canonical.values().next_back(),
            BlockId::Height(h) => self.canonical.get(h),
            BlockId::Hash(hash) => Some(hash),
        };
        hash.and_then(|h| self.blocks.get(h))
            .ok_or_else(|| IndexerError::NotFound(format!("block {id}")))
    }
}

#[async_trait]
impl RawClient for MockNode {
    async fn get_head(&self) -> Result<BlockHeader, IndexerError> {
        let s = self.request("get_head")?;
        Ok(s.find(&BlockId::Head)?.header())
    }

    async fn get_header(&self, id: BlockId) -> Result<BlockHeader, IndexerError> {
        let s = self.request("get_header")?;
        Ok(s.find(&id)?.header())
    }

    async fn get_block(&self, id: BlockId) -> Result<RawBlock, IndexerError> {
        let s = self.request("get_block")?;
        Ok(s.find(&id)?.clone())
    }

    async fn get_constants(&self, height: u64) -> Result<Constants, IndexerError> {
        let s = self.request("get_constants")?;
        s.constants
            .clone()
            .ok_or_else(|| IndexerError::NotFound(format!("constants at {height}")))
    }

    async fn fetch_rights_by_cycle(
        &self,
        height: u64,
        cycle: u64,
    ) -> Result<Vec<Right>, IndexerError> {
        let mut s = self.request("fetch_rights_by_cycle")?;
        s.rights_requests.push((height, cycle));
        let constants = s
            .constants
            .clone()
            .ok_or_else(|| IndexerError::NotFound(format!("constants at {height}")))?;
        let params = Params::new(&constants, "PtMock", 12);
        Ok((params.cycle_start_height(cycle)..=params.cycle_end_height(cycle))
            .map(|h| Right {
                kind: RightKind::Baking,
                height: h,
                cycle,
                round: 0,
                address: BAKER.into(),
            })
            .collect())
    }

    async fn get_contract_script(&self, address: &str) -> Result<Script, IndexerError> {
        let s = self.request("get_contract_script")?;
        s.scripts
            .get(address)
            .cloned()
            .ok_or_else(|| IndexerError::MissingBlockData(format!("no script for {address}")))
    }
}
