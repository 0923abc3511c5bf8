//! Operations: explicit ones copied from the block body and synthetic ones
//! derived from flows or block metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainetl_core::pool::Reset;

use super::AccountId;
use crate::rpc::BigmapAction;

/// Closed set of operation types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    #[default]
    Transaction,
    Origination,
    Delegation,
    Reveal,
    Activation,
    Endorsement,
    NonceRevelation,
    DoubleBaking,
    DoubleEndorsement,
    Proposal,
    Ballot,
    RegisterConstant,
    DepositsLimit,
    RollupOrigination,
    RollupTransaction,
    // synthetic
    Bake,
    Bonus,
    Reward,
    Deposit,
    Unfreeze,
    SeedSlash,
    Invoice,
    Subsidy,
}

impl OpType {
    /// Returns `true` for types that only exist as derived events.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            Self::Bake
                | Self::Bonus
                | Self::Reward
                | Self::Deposit
                | Self::Unfreeze
                | Self::SeedSlash
                | Self::Invoice
                | Self::Subsidy
        )
    }
}

/// Which list of the block an op comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpList {
    #[default]
    Consensus,
    Voting,
    Anonymous,
    Manager,
    /// Synthetic events derived from block balance updates.
    Events,
    /// Implicit block-level results.
    BlockHeader,
}

impl OpList {
    pub fn from_index(i: usize) -> Option<Self> {
        match i {
            0 => Some(Self::Consensus),
            1 => Some(Self::Voting),
            2 => Some(Self::Anonymous),
            3 => Some(Self::Manager),
            _ => None,
        }
    }
}

/// A bigmap change caused by an op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigmapEvent {
    pub action: BigmapAction,
    pub bigmap_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Op {
    #[serde(rename = "type")]
    pub op_type: OpType,
    pub height: u64,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    /// Position in the block (unique, monotonic).
    pub op_n: u32,
    pub list: OpList,
    /// Position in the list.
    pub op_p: u32,
    /// Position of an internal op inside its parent (0 = external).
    pub op_i: u32,
    pub hash: Option<String>,
    pub is_success: bool,
    pub is_event: bool,
    pub is_internal: bool,
    pub is_contract: bool,
    pub sender_id: Option<AccountId>,
    pub receiver_id: Option<AccountId>,
    pub creator_id: Option<AccountId>,
    pub baker_id: Option<AccountId>,
    pub volume: i64,
    pub fee: i64,
    pub reward: i64,
    pub deposit: i64,
    pub burned: i64,
    pub gas_limit: i64,
    pub gas_used: i64,
    pub storage_limit: i64,
    pub storage_paid: i64,
    /// Endorsed slots (endorsements only).
    pub slots: u32,
    /// Receiver is the burn address.
    pub is_burn: bool,
    pub entrypoint: Option<String>,
    pub parameters: Option<Value>,
    pub storage_hash: Option<u64>,
    pub is_storage_update: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bigmap_events: Vec<BigmapEvent>,
}

impl Reset for Op {
    fn reset(&mut self) {
        let mut events = std::mem::take(&mut self.bigmap_events);
        events.clear();
        *self = Op {
            bigmap_events: events,
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainetl_core::pool::Pool;

    #[test]
    fn reset_clears_everything() {
        let pool: Pool<Op> = Pool::new(2);
        {
            let mut op = pool.get();
            op.op_type = OpType::Bake;
            op.reward = 10;
            op.sender_id = Some(4);
            op.bigmap_events.push(BigmapEvent {
                action: BigmapAction::Alloc,
                bigmap_id: 1,
                key: None,
                value: None,
                key_type: None,
                value_type: None,
                source_id: None,
            });
        }
        let op = pool.get();
        assert_eq!(*op, Op::default());
    }

    #[test]
    fn event_types() {
        assert!(OpType::SeedSlash.is_event());
        assert!(!OpType::Endorsement.is_event());
    }
}
