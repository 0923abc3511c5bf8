//! Long-lived entities keyed by address.
//!
//! Fields marked `#[serde(skip)]` only live while a block is being built and
//! are never persisted.

use serde::{Deserialize, Serialize};

use super::flow::{Flow, FlowCategory};
use super::AccountId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub address: String,
    pub is_contract: bool,
    pub is_baker: bool,
    pub is_activated: bool,
    pub is_revealed: bool,
    pub is_funded: bool,
    pub baker_id: Option<AccountId>,
    pub creator_id: Option<AccountId>,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Spendable balance.
    pub balance: i64,
    pub frozen_deposits: i64,
    pub frozen_rewards: i64,
    pub frozen_fees: i64,
    pub total_received: i64,
    pub total_sent: i64,
    pub total_burned: i64,
    pub total_fees_paid: i64,
    pub n_ops: u32,
    pub n_ops_failed: u32,

    /// Funding state when the current block started.
    #[serde(skip)]
    pub was_funded: bool,
    /// Created by the current block.
    #[serde(skip)]
    pub is_new: bool,
    /// Modified by the current block.
    #[serde(skip)]
    pub is_dirty: bool,
    /// Height of the stored version this entity was loaded from.
    #[serde(skip)]
    pub stored_height: Option<u64>,
}

impl Account {
    pub fn new(id: AccountId, address: impl Into<String>, height: u64) -> Self {
        let address = address.into();
        Self {
            id,
            is_contract: crate::rpc::is_contract_address(&address),
            address,
            first_seen: height,
            last_seen: height,
            is_new: true,
            is_dirty: true,
            ..Default::default()
        }
    }

    /// Prepare a freshly loaded account for a new block.
    pub fn begin(&mut self, stored_height: u64) {
        self.was_funded = self.is_funded;
        self.is_new = false;
        self.is_dirty = false;
        self.stored_height = Some(stored_height);
    }

    pub fn total_frozen(&self) -> i64 {
        self.frozen_deposits + self.frozen_rewards + self.frozen_fees
    }

    /// Apply one balance movement.
    pub fn apply(&mut self, flow: &Flow) {
        let net = flow.net();
        match flow.category {
            FlowCategory::Balance => {
                self.balance += net;
                if flow.is_fee && flow.amount_out > 0 {
                    self.total_fees_paid += flow.amount_out;
                } else {
                    self.total_sent += flow.amount_out;
                }
                self.total_received += flow.amount_in;
                if flow.is_burned {
                    self.total_burned += flow.amount_out;
                }
            }
            FlowCategory::Deposits => self.frozen_deposits += net,
            FlowCategory::Rewards => self.frozen_rewards += net,
            FlowCategory::Fees => self.frozen_fees += net,
        }
        self.is_funded = self.balance + self.total_frozen() > 0;
        self.last_seen = flow.height;
        self.is_dirty = true;
    }

    pub fn became_funded(&self) -> bool {
        !self.was_funded && self.is_funded
    }

    pub fn became_cleared(&self) -> bool {
        self.was_funded && !self.is_funded
    }
}

/// Staking state of an account registered as baker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baker {
    pub account_id: AccountId,
    pub address: String,
    pub is_active: bool,
    pub baker_since: u64,
    pub deposits_limit: Option<i64>,
    pub blocks_baked: u32,
    pub blocks_proposed: u32,
    pub slots_endorsed: u64,
    pub total_rewards: i64,
    pub total_fees: i64,
    pub total_lost: i64,

    #[serde(skip)]
    pub is_new: bool,
    #[serde(skip)]
    pub is_dirty: bool,
    #[serde(skip)]
    pub stored_height: Option<u64>,
}

impl Baker {
    pub fn new(account: &Account, height: u64) -> Self {
        Self {
            account_id: account.id,
            address: account.address.clone(),
            is_active: true,
            baker_since: height,
            is_new: true,
            is_dirty: true,
            ..Default::default()
        }
    }

    pub fn begin(&mut self, stored_height: u64) {
        self.is_new = false;
        self.is_dirty = false;
        self.stored_height = Some(stored_height);
    }

    /// Account a flow of the baker's own account into its totals.
    pub fn apply(&mut self, flow: &Flow) {
        if flow.is_minted {
            self.total_rewards += flow.amount_in;
        }
        if flow.is_fee && flow.amount_in > 0 {
            self.total_fees += flow.amount_in;
        }
        if flow.is_burned {
            self.total_lost += flow.amount_out;
        }
        self.is_dirty = true;
    }
}

/// Code and storage state of an originated contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub account_id: AccountId,
    pub address: String,
    pub creator_id: Option<AccountId>,
    pub first_seen: u64,
    pub last_seen: u64,
    pub code_hash: u64,
    pub storage_hash: u64,
    pub bigmap_ids: Vec<i64>,
    /// Originated by a protocol migration rather than an operation.
    pub is_implicit: bool,
    pub n_calls: u32,
    pub n_calls_failed: u32,

    #[serde(skip)]
    pub is_new: bool,
    #[serde(skip)]
    pub is_dirty: bool,
    #[serde(skip)]
    pub stored_height: Option<u64>,
}

impl Contract {
    pub fn new(account: &Account, creator_id: Option<AccountId>, height: u64) -> Self {
        Self {
            account_id: account.id,
            address: account.address.clone(),
            creator_id,
            first_seen: height,
            last_seen: height,
            is_new: true,
            is_dirty: true,
            ..Default::default()
        }
    }

    pub fn begin(&mut self, stored_height: u64) {
        self.is_new = false;
        self.is_dirty = false;
        self.stored_height = Some(stored_height);
    }
}
