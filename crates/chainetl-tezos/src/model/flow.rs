//! Balance movements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chainetl_core::pool::Reset;

use super::{AccountId, OpType};

/// Which balance a flow moves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowCategory {
    #[default]
    Balance,
    Deposits,
    Rewards,
    Fees,
}

/// The operation or event a flow belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
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
    RegisterConstant,
    DepositsLimit,
    Rollup,
    Baking,
    Bonus,
    Reward,
    Deposit,
    Internal,
    Invoice,
    Subsidy,
}

impl From<OpType> for FlowType {
    fn from(t: OpType) -> Self {
        match t {
            OpType::Transaction => Self::Transaction,
            OpType::Origination => Self::Origination,
            OpType::Delegation => Self::Delegation,
            OpType::Reveal => Self::Reveal,
            OpType::Activation => Self::Activation,
            OpType::Endorsement => Self::Endorsement,
            OpType::NonceRevelation | OpType::SeedSlash => Self::NonceRevelation,
            OpType::DoubleBaking => Self::DoubleBaking,
            OpType::DoubleEndorsement => Self::DoubleEndorsement,
            OpType::RegisterConstant => Self::RegisterConstant,
            OpType::DepositsLimit => Self::DepositsLimit,
            OpType::RollupOrigination | OpType::RollupTransaction => Self::Rollup,
            OpType::Bake => Self::Baking,
            OpType::Bonus => Self::Bonus,
            OpType::Reward => Self::Reward,
            OpType::Deposit => Self::Deposit,
            OpType::Unfreeze => Self::Internal,
            OpType::Invoice => Self::Invoice,
            OpType::Subsidy => Self::Subsidy,
            OpType::Proposal | OpType::Ballot => Self::Transaction,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub account_id: AccountId,
    pub height: u64,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    /// Position of the op this flow belongs to.
    pub op_n: u32,
    pub category: FlowCategory,
    #[serde(rename = "operation")]
    pub flow_type: FlowType,
    pub amount_in: i64,
    pub amount_out: i64,
    pub is_fee: bool,
    pub is_burned: bool,
    pub is_minted: bool,
    pub is_frozen: bool,
    pub is_unfrozen: bool,
}

impl Flow {
    /// Net effect on total supply.
    pub fn supply_delta(&self) -> i64 {
        let minted = if self.is_minted { self.amount_in } else { 0 };
        let burned = if self.is_burned { self.amount_out } else { 0 };
        minted - burned
    }

    /// Net change of the owner's balance in this flow's category.
    pub fn net(&self) -> i64 {
        self.amount_in - self.amount_out
    }
}

impl Reset for Flow {
    fn reset(&mut self) {
        *self = Flow::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supply_delta_counts_flags_only() {
        let mut f = Flow {
            amount_in: 100,
            amount_out: 40,
            ..Default::default()
        };
        assert_eq!(f.supply_delta(), 0);
        assert_eq!(f.net(), 60);
        f.is_minted = true;
        assert_eq!(f.supply_delta(), 100);
        f.is_burned = true;
        assert_eq!(f.supply_delta(), 60);
    }

    #[test]
    fn op_type_mapping() {
        assert_eq!(FlowType::from(OpType::Bake), FlowType::Baking);
        assert_eq!(FlowType::from(OpType::Unfreeze), FlowType::Internal);
    }
}
