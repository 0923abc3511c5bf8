//! The block aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chainetl_core::pool::{Pooled, Reset};
use chainetl_core::types::BlockHeader;

use super::flow::Flow;
use super::op::{Op, OpType};
use super::supply::{Chain, Supply};
use super::AccountId;
use crate::rpc::{RawBlock, VotingPeriodKind};

/// Block-level counters, always derived by folding over the block's own
/// ops and flows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCounters {
    pub n_ops_applied: u32,
    pub n_ops_failed: u32,
    pub n_events: u32,
    pub n_calls: u32,
    pub n_rollup_calls: u32,
    pub n_tx: u32,
    pub n_endorsements: u32,
    /// Slots endorsed by this block's endorsements (they endorse the parent).
    pub n_slots_in_block: u32,
    pub volume: i64,
    pub fee: i64,
    pub reward: i64,
    pub deposit: i64,
    pub activated_supply: i64,
    pub minted_supply: i64,
    pub burned_supply: i64,
    pub gas_limit: i64,
    pub gas_used: i64,
    pub storage_paid: i64,
    pub has_proposals: bool,
    pub has_ballots: bool,
    pub has_seeds: bool,
}

impl BlockCounters {
    pub fn fold<'a>(
        ops: impl IntoIterator<Item = &'a Op>,
        flows: impl IntoIterator<Item = &'a Flow>,
    ) -> Self {
        let mut c = Self::default();
        for op in ops {
            if op.is_event {
                c.n_events += 1;
            } else if op.is_success {
                c.n_ops_applied += 1;
            } else {
                c.n_ops_failed += 1;
            }
            match op.op_type {
                OpType::Transaction if op.is_success => {
                    c.n_tx += 1;
                    if op.is_contract {
                        c.n_calls += 1;
                    }
                }
                OpType::RollupTransaction if op.is_success => c.n_rollup_calls += 1,
                OpType::Endorsement => {
                    c.n_endorsements += 1;
                    c.n_slots_in_block += op.slots;
                }
                OpType::Activation if op.is_success => c.activated_supply += op.volume,
                OpType::Proposal => c.has_proposals = true,
                OpType::Ballot => c.has_ballots = true,
                OpType::NonceRevelation => c.has_seeds = true,
                _ => {}
            }
            if op.is_success && !op.is_event {
                c.volume += op.volume;
            }
            c.fee += op.fee;
            c.reward += op.reward;
            c.deposit += op.deposit;
            c.gas_limit += op.gas_limit;
            c.gas_used += op.gas_used;
            c.storage_paid += op.storage_paid;
        }
        for f in flows {
            if f.is_minted {
                c.minted_supply += f.amount_in;
            }
            if f.is_burned {
                c.burned_supply += f.amount_out;
            }
        }
        c
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    pub predecessor: String,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    /// Seconds since the parent block, floored at zero.
    pub solvetime: u64,
    pub protocol: String,
    pub version: u32,
    pub round: u32,
    pub nonce: u64,
    pub voting_period_kind: VotingPeriodKind,
    pub baker_id: Option<AccountId>,
    pub proposer_id: Option<AccountId>,
    pub is_cycle_start: bool,
    pub is_protocol_upgrade: bool,
    /// Slots endorsed by the child block; written when the child commits.
    pub n_slots_endorsed: u32,
    #[serde(flatten)]
    pub counters: BlockCounters,
    pub n_accounts_seen: u32,
    pub n_new_accounts: u32,
    pub n_new_contracts: u32,
    pub n_new_bakers: u32,
    pub n_funded: u32,
    pub n_cleared: u32,
    pub chain: Chain,
    pub supply: Supply,

    #[serde(skip)]
    pub ops: Vec<Pooled<Op>>,
    #[serde(skip)]
    pub flows: Vec<Pooled<Flow>>,
    /// Endorsed slots to record on the parent block at commit.
    #[serde(skip)]
    pub parent_slots_endorsed: Option<u32>,
    #[serde(skip)]
    pub(crate) next_op_n: u32,
}

impl Block {
    /// Seed header fields and running totals from `raw` and its parent.
    pub fn init(&mut self, raw: &RawBlock, parent: Option<&Block>) {
        self.height = raw.height;
        self.hash = raw.hash.clone();
        self.predecessor = raw.predecessor.clone();
        self.cycle = raw.cycle;
        self.timestamp = raw.timestamp;
        self.protocol = raw.protocol.clone();
        // genesis and bootstrap blocks run under the previous protocol
        self.version = if raw.height <= 1 {
            raw.version.saturating_sub(1)
        } else {
            raw.version
        };
        self.round = raw.round + raw.payload_round;
        self.nonce = decode_nonce(&raw.nonce_hex);
        self.voting_period_kind = raw
            .voting_period_kind
            .or(parent.map(|p| p.voting_period_kind))
            .unwrap_or_default();
        match parent {
            Some(p) => {
                let dt = (raw.timestamp - p.timestamp).num_seconds();
                self.solvetime = u64::try_from(dt).unwrap_or(0);
                self.chain = p.chain.clone();
                self.supply = p.supply.clone();
                self.is_protocol_upgrade = p.protocol != raw.protocol;
            }
            None => {
                self.solvetime = 0;
                self.chain = Chain::default();
                self.supply = Supply::default();
                self.is_protocol_upgrade = false;
            }
        }
        self.next_op_n = 0;
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            height: self.height,
            hash: self.hash.clone(),
            predecessor: self.predecessor.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Allocate the next position in the block.
    pub fn next_n(&mut self) -> u32 {
        let n = self.next_op_n;
        self.next_op_n += 1;
        n
    }

    /// Next position without allocating it.
    pub fn peek_n(&self) -> u32 {
        self.next_op_n
    }

    /// Reserve `count` positions starting at the current one.
    pub fn reserve_n(&mut self, count: u32) {
        self.next_op_n += count;
    }
}

impl Reset for Block {
    fn reset(&mut self) {
        let mut ops = std::mem::take(&mut self.ops);
        let mut flows = std::mem::take(&mut self.flows);
        // dropping the guards hands the children back to their pools
        ops.clear();
        flows.clear();
        *self = Block {
            ops,
            flows,
            ..Default::default()
        };
    }
}

/// Big-endian value of the first 8 bytes of a hex nonce.
fn decode_nonce(nonce_hex: &str) -> u64 {
    match hex::decode(nonce_hex) {
        Ok(bytes) => bytes.iter().take(8).fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;
    use chainetl_core::pool::Pool;

    #[test]
    fn nonce_uses_first_eight_bytes() {
        assert_eq!(decode_nonce("0000000000000102ffff"), 0x0102);
        assert_eq!(decode_nonce("zz"), 0);
        assert_eq!(decode_nonce(""), 0);
    }

    #[test]
    fn init_from_parent() {
        let mut parent = Block::default();
        parent.init(&mock::block("A", 4, "A3", 12), None);
        parent.supply.total = 500;
        parent.voting_period_kind = VotingPeriodKind::Exploration;

        let mut raw = mock::block("A", 5, "A4", 12);
        raw.timestamp = parent.timestamp - chrono::Duration::seconds(5);
        raw.protocol = "PtNext".into();
        let mut b = Block::default();
        b.init(&raw, Some(&parent));
        assert_eq!(b.solvetime, 0);
        assert_eq!(b.supply.total, 500);
        assert_eq!(b.voting_period_kind, VotingPeriodKind::Exploration);
        assert!(b.is_protocol_upgrade);
        assert_eq!(b.version, 12);
    }

    #[test]
    fn genesis_runs_previous_version() {
        let mut b = Block::default();
        b.init(&mock::block("A", 1, "A0", 12), None);
        assert_eq!(b.version, 11);
        assert_eq!(b.voting_period_kind, VotingPeriodKind::Proposal);
    }

    #[test]
    fn reset_returns_children() {
        let ops: Pool<Op> = Pool::new(8);
        let blocks: Pool<Block> = Pool::new(1);
        {
            let mut b = blocks.get();
            b.height = 9;
            b.ops.push(ops.get());
            b.ops.push(ops.get());
            assert_eq!(ops.idle(), 0);
        }
        assert_eq!(ops.idle(), 2);
        let b = blocks.get();
        assert_eq!(b.height, 0);
        assert!(b.ops.is_empty());
    }

    #[test]
    fn fold_is_idempotent() {
        let ops = vec![
            Op {
                op_type: OpType::Transaction,
                is_success: true,
                is_contract: true,
                volume: 7,
                fee: 1,
                gas_used: 10,
                ..Default::default()
            },
            Op {
                op_type: OpType::Transaction,
                fee: 1,
                volume: 3,
                ..Default::default()
            },
            Op {
                op_type: OpType::Endorsement,
                is_success: true,
                slots: 4,
                ..Default::default()
            },
        ];
        let flows = vec![Flow {
            amount_in: 5,
            is_minted: true,
            ..Default::default()
        }];
        let a = BlockCounters::fold(&ops, &flows);
        let b = BlockCounters::fold(&ops, &flows);
        assert_eq!(a, b);
        assert_eq!(a.n_ops_applied, 2);
        assert_eq!(a.n_ops_failed, 1);
        assert_eq!(a.n_calls, 1);
        assert_eq!(a.volume, 7);
        assert_eq!(a.fee, 2);
        assert_eq!(a.n_slots_in_block, 4);
        assert_eq!(a.minted_supply, 5);
    }
}
