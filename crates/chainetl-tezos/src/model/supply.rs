//! Running chain-wide totals carried from block to block.

use serde::{Deserialize, Serialize};

use super::flow::{Flow, FlowCategory, FlowType};

/// Token supply after a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supply {
    pub total: i64,
    pub activated: i64,
    pub frozen_deposits: i64,
    pub frozen_rewards: i64,
    pub frozen_fees: i64,
    pub minted: i64,
    pub burned: i64,
    pub minted_baking: i64,
    pub minted_endorsing: i64,
    pub minted_seeding: i64,
    pub minted_airdrop: i64,
    pub minted_other: i64,
    pub burned_double_signing: i64,
    pub burned_seed_miss: i64,
    pub burned_address: i64,
    pub burned_storage: i64,
}

impl Supply {
    pub fn total_frozen(&self) -> i64 {
        self.frozen_deposits + self.frozen_rewards + self.frozen_fees
    }

    /// Add one block's flows. `burned_address` is the amount sent to the
    /// burn address, which is part of the storage burn bucket otherwise.
    pub fn update(&mut self, flows: &[&Flow], activated: i64, burned_address: i64) {
        let mut burned_other = 0;
        for f in flows {
            match f.category {
                FlowCategory::Balance => {}
                FlowCategory::Deposits => self.frozen_deposits += f.net(),
                FlowCategory::Rewards => self.frozen_rewards += f.net(),
                FlowCategory::Fees => self.frozen_fees += f.net(),
            }
            if f.is_minted {
                self.minted += f.amount_in;
                self.total += f.amount_in;
                let bucket = match f.flow_type {
                    FlowType::Baking | FlowType::Bonus => &mut self.minted_baking,
                    FlowType::Reward | FlowType::Endorsement => &mut self.minted_endorsing,
                    FlowType::NonceRevelation => &mut self.minted_seeding,
                    FlowType::Invoice | FlowType::Subsidy => &mut self.minted_airdrop,
                    _ => &mut self.minted_other,
                };
                *bucket += f.amount_in;
            }
            if f.is_burned {
                self.burned += f.amount_out;
                self.total -= f.amount_out;
                match f.flow_type {
                    FlowType::DoubleBaking | FlowType::DoubleEndorsement => {
                        self.burned_double_signing += f.amount_out
                    }
                    FlowType::NonceRevelation | FlowType::Reward => {
                        self.burned_seed_miss += f.amount_out
                    }
                    _ => burned_other += f.amount_out,
                }
            }
        }
        self.activated += activated;
        self.burned_address += burned_address;
        self.burned_storage += burned_other - burned_address;
    }
}

/// Cumulative entity counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub total_accounts: u64,
    pub total_contracts: u64,
    pub total_implicit: u64,
    pub total_bakers: u64,
    pub funded_accounts: u64,
    pub total_ops: u64,
    pub total_ops_failed: u64,
    pub total_events: u64,
    pub total_endorsements: u64,
}
