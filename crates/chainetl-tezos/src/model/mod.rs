//! Indexed entities.

pub mod account;
pub mod block;
pub mod flow;
pub mod op;
pub mod supply;

/// Internal account id, assigned in order of first appearance.
pub type AccountId = u64;

pub use account::{Account, Baker, Contract};
pub use block::{Block, BlockCounters};
pub use flow::{Flow, FlowCategory, FlowType};
pub use op::{BigmapEvent, Op, OpList, OpType};
pub use supply::{Chain, Supply};
