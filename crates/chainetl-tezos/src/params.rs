//! Protocol parameters derived from the node's constants.

use serde::{Deserialize, Serialize};

use crate::rpc::Constants;

/// First protocol version that pays invoices as explicit events.
pub const VERSION_INVOICE_EVENTS: u32 = 9;
/// First protocol version with explicit deposits, bonuses and minted seed slashes.
pub const VERSION_ITHACA: u32 = 12;

/// Parameters in force for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    pub protocol: String,
    /// Sequential protocol version number.
    pub version: u32,
    pub blocks_per_cycle: u64,
    pub preserved_cycles: u64,
    pub minimal_block_delay: u64,
    pub consensus_committee_size: u32,
    pub cost_per_byte: i64,
}

impl Params {
    pub fn new(constants: &Constants, protocol: impl Into<String>, version: u32) -> Self {
        Self {
            protocol: protocol.into(),
            version,
            blocks_per_cycle: constants.blocks_per_cycle.max(1),
            preserved_cycles: constants.preserved_cycles,
            minimal_block_delay: constants.minimal_block_delay,
            consensus_committee_size: constants.consensus_committee_size,
            cost_per_byte: constants.cost_per_byte,
        }
    }

    /// Genesis (height 0) precedes cycle 0, whose first block is height 1.
    pub fn cycle_from_height(&self, height: u64) -> u64 {
        height.saturating_sub(1) / self.blocks_per_cycle
    }

    pub fn cycle_start_height(&self, cycle: u64) -> u64 {
        cycle * self.blocks_per_cycle + 1
    }

    pub fn cycle_end_height(&self, cycle: u64) -> u64 {
        self.cycle_start_height(cycle + 1) - 1
    }

    pub fn is_cycle_start(&self, height: u64) -> bool {
        height > 0 && (height - 1) % self.blocks_per_cycle == 0
    }

    pub fn is_cycle_end(&self, height: u64) -> bool {
        height > 0 && height % self.blocks_per_cycle == 0
    }

    /// Cycle whose rights must be fetched while processing `height`, if any.
    ///
    /// Rights for cycle `N` exist from the end of cycle `N - preserved - 1`
    /// but nodes only serve them from the start of cycle `N - preserved`,
    /// so they are fetched there. Fetching starts at cycle 2.
    pub fn rights_cycle(&self, height: u64, cycle: u64) -> Option<u64> {
        (height >= self.cycle_start_height(2) && self.is_cycle_start(height))
            .then(|| cycle + self.preserved_cycles)
    }

    pub fn has_invoice_events(&self) -> bool {
        self.version >= VERSION_INVOICE_EVENTS
    }

    pub fn is_ithaca(&self) -> bool {
        self.version >= VERSION_ITHACA
    }
}
