//! Step 7: consistency checks over a fully derived block.

use std::collections::HashSet;

use chainetl_core::error::IndexerError;

use crate::model::{Block, BlockCounters, OpList};

/// Check the internal consistency of `block` against its `parent`.
///
/// Any violation is an [`IndexerError::Invariant`] and aborts the block.
pub fn validate(block: &Block, parent: Option<&Block>) -> Result<(), IndexerError> {
    let h = block.height;

    let mut last = None;
    let mut positions = HashSet::with_capacity(block.ops.len());
    for op in &block.ops {
        if last.is_some_and(|n| op.op_n <= n) {
            return Err(IndexerError::invariant(
                h,
                format!("op_n {} follows {} out of order", op.op_n, last.unwrap_or_default()),
            ));
        }
        last = Some(op.op_n);
        if !positions.insert((op.list, op.op_p, op.op_i, op.op_n)) {
            return Err(IndexerError::invariant(
                h,
                format!("duplicate op position {:?}/{}/{}", op.list, op.op_p, op.op_n),
            ));
        }
        if op.list == OpList::Events && !block.flows.iter().any(|f| f.op_n == op.op_n) {
            return Err(IndexerError::invariant(
                h,
                format!("event {:?} at {} has no flows", op.op_type, op.op_n),
            ));
        }
    }

    let fresh = BlockCounters::fold(
        block.ops.iter().map(|o| &**o),
        block.flows.iter().map(|f| &**f),
    );
    if fresh != block.counters {
        return Err(IndexerError::invariant(h, "block counters differ from ops and flows"));
    }

    let c = &block.counters;
    let delta = c.minted_supply - c.burned_supply;
    let before = parent.map(|p| p.supply.clone()).unwrap_or_default();
    let s = &block.supply;
    let checks = [
        ("total", before.total + delta, s.total),
        ("minted", before.minted + c.minted_supply, s.minted),
        ("burned", before.burned + c.burned_supply, s.burned),
    ];
    for (name, want, got) in checks {
        if want != got {
            return Err(IndexerError::invariant(
                h,
                format!("{name} supply {got}, expected {want}"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Flow, FlowType, Op, OpType};
    use chainetl_core::pool::Pool;

    struct Parts {
        ops: Pool<Op>,
        flows: Pool<Flow>,
    }

    fn parts() -> Parts {
        Parts {
            ops: Pool::new(8),
            flows: Pool::new(8),
        }
    }

    /// A block with one applied transaction and one bake event with a
    /// minted reward of 10.
    fn block(p: &Parts) -> Block {
        let mut b = Block {
            height: 7,
            ..Default::default()
        };
        let mut tx = p.ops.get();
        tx.op_type = OpType::Transaction;
        tx.list = OpList::Manager;
        tx.op_n = 0;
        tx.is_success = true;
        tx.volume = 50;
        b.ops.push(tx);

        let mut bake = p.ops.get();
        bake.op_type = OpType::Bake;
        bake.list = OpList::Events;
        bake.op_n = 1;
        bake.is_event = true;
        bake.is_success = true;
        bake.reward = 10;
        b.ops.push(bake);

        let mut f = p.flows.get();
        f.op_n = 1;
        f.flow_type = FlowType::Baking;
        f.amount_in = 10;
        f.is_minted = true;
        b.flows.push(f);

        b.counters = BlockCounters::fold(b.ops.iter().map(|o| &**o), b.flows.iter().map(|f| &**f));
        b.supply.total = 1010;
        b.supply.minted = 10;
        b
    }

    fn parent() -> Block {
        let mut p = Block {
            height: 6,
            ..Default::default()
        };
        p.supply.total = 1000;
        p
    }

    #[test]
    fn consistent_block_passes() {
        let p = parts();
        assert!(validate(&block(&p), Some(&parent())).is_ok());
    }

    #[test]
    fn stale_counters_fail() {
        let p = parts();
        let mut b = block(&p);
        b.counters.volume += 1;
        assert!(matches!(
            validate(&b, Some(&parent())),
            Err(IndexerError::Invariant { height: 7, .. })
        ));
    }

    #[test]
    fn supply_must_extend_parent() {
        let p = parts();
        let mut b = block(&p);
        b.supply.total = 1011;
        assert!(validate(&b, Some(&parent())).is_err());
        b.supply.total = 10;
        assert!(validate(&b, None).is_ok());
    }

    #[test]
    fn event_without_flows_fails() {
        let p = parts();
        let mut b = block(&p);
        b.flows.clear();
        b.counters = BlockCounters::fold(b.ops.iter().map(|o| &**o), std::iter::empty());
        b.supply = parent().supply;
        let err = validate(&b, Some(&parent())).unwrap_err();
        assert!(err.to_string().contains("no flows"));
    }

    #[test]
    fn total_supply_follows_minted_and_burned() {
        let p = parts();
        let mut b = block(&p);
        b.flows[0].is_minted = false;
        b.counters = BlockCounters::fold(b.ops.iter().map(|o| &**o), b.flows.iter().map(|f| &**f));
        b.supply.minted = 0;
        let err = validate(&b, Some(&parent())).unwrap_err();
        assert!(err.to_string().contains("total supply 1010, expected 1000"));
    }

    #[test]
    fn op_positions_must_increase() {
        let p = parts();
        let mut b = block(&p);
        b.ops.swap(0, 1);
        assert!(validate(&b, Some(&parent())).is_err());
    }
}
