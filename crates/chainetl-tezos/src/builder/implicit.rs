//! Steps 4 and 5: events derived from block metadata and block-level
//! results without an operation.

use std::collections::{BTreeMap, HashMap};

use chainetl_core::error::IndexerError;
use chainetl_core::pool::{Pool, Pooled};

use super::Ctx;
use crate::model::{AccountId, BigmapEvent, Flow, FlowCategory, FlowType, Op, OpList, OpType};
use crate::params::Params;
use crate::rpc::{
    hash64, BalanceUpdate, BigmapAction, ImplicitKind, ImplicitResult, OpResult, RawBlock,
    UpdateCategory, UpdateKind, UpdateOrigin,
};

/// How one block balance update turns into a flow.
#[derive(Debug, Clone, Copy, Default)]
struct Class {
    flow_type: FlowType,
    category: FlowCategory,
    minted: bool,
    burned: bool,
    fee: bool,
    /// The amount moves in and out again in the same flow.
    in_and_out: bool,
}

fn classify(u: &BalanceUpdate, params: &Params) -> Option<Class> {
    let credit = u.change > 0;
    let class = |flow_type, category| Class {
        flow_type,
        category,
        ..Default::default()
    };
    match u.origin {
        UpdateOrigin::Subsidy => None,
        UpdateOrigin::Migration => (u.kind == UpdateKind::Contract && credit).then(|| Class {
            minted: params.has_invoice_events(),
            ..class(FlowType::Invoice, FlowCategory::Balance)
        }),
        UpdateOrigin::Block => {
            use UpdateCategory as C;
            use UpdateKind as K;
            let deposit = if params.is_ithaca() {
                FlowType::Deposit
            } else {
                FlowType::Baking
            };
            let c = match (u.kind, u.category, credit) {
                (K::Freezer, C::Deposits, true) => class(deposit, FlowCategory::Deposits),
                (K::Contract, C::None, false) => class(deposit, FlowCategory::Balance),
                (K::Freezer, C::Rewards, true) => Class {
                    minted: true,
                    ..class(FlowType::Baking, FlowCategory::Rewards)
                },
                (K::Freezer, C::Fees, true) => class(FlowType::Baking, FlowCategory::Fees),
                (K::Freezer, C::Deposits, false) => class(FlowType::Internal, FlowCategory::Deposits),
                (K::Freezer, C::Rewards, false) => class(FlowType::Internal, FlowCategory::Rewards),
                (K::Freezer, C::Fees, false) => class(FlowType::Internal, FlowCategory::Fees),
                (K::Contract, C::None, true) => class(FlowType::Internal, FlowCategory::Balance),
                (K::Freezer, C::LostRewards, false) => Class {
                    burned: true,
                    ..class(FlowType::NonceRevelation, FlowCategory::Rewards)
                },
                (K::Freezer, C::LostFees, false) => Class {
                    burned: true,
                    ..class(FlowType::NonceRevelation, FlowCategory::Fees)
                },
                (K::Contract, C::LostNonceRewards, true) => Class {
                    minted: params.is_ithaca(),
                    burned: true,
                    in_and_out: true,
                    ..class(FlowType::NonceRevelation, FlowCategory::Balance)
                },
                (K::Contract, C::BakingRewards, true) => Class {
                    minted: true,
                    ..class(FlowType::Baking, FlowCategory::Balance)
                },
                (K::Contract, C::BlockFees, true) => Class {
                    fee: true,
                    ..class(FlowType::Baking, FlowCategory::Balance)
                },
                (K::Contract, C::BakingBonuses, true) => Class {
                    minted: true,
                    ..class(FlowType::Bonus, FlowCategory::Balance)
                },
                (K::Contract, C::EndorsingRewards, true) => Class {
                    minted: true,
                    ..class(FlowType::Reward, FlowCategory::Balance)
                },
                (K::Contract, C::LostEndorsingRewards, true) => Class {
                    minted: true,
                    burned: true,
                    in_and_out: true,
                    ..class(FlowType::Reward, FlowCategory::Balance)
                },
                _ => return None,
            };
            Some(c)
        }
    }
}

/// Build synthetic ops from flows grouped by position.
///
/// The first flow at a position creates the op and sets its accounts.
/// Later flows at the same position add to summed amounts; amounts an
/// event carries once (invoice, reward and deposit) keep the first value.
/// Positions without flows yield no op.
pub fn derive_implicit_events<'a>(
    flows: impl IntoIterator<Item = &'a Flow>,
    params: &Params,
    pool: &Pool<Op>,
) -> Vec<Pooled<Op>> {
    let mut ops: BTreeMap<u32, Pooled<Op>> = BTreeMap::new();
    for f in flows {
        let op_type = match f.flow_type {
            FlowType::Baking => OpType::Bake,
            FlowType::Internal if f.is_unfrozen => OpType::Unfreeze,
            FlowType::NonceRevelation if f.is_burned => OpType::SeedSlash,
            FlowType::Bonus => OpType::Bonus,
            FlowType::Reward => OpType::Reward,
            FlowType::Deposit if f.category == FlowCategory::Deposits => OpType::Deposit,
            FlowType::Invoice if params.has_invoice_events() => OpType::Invoice,
            _ => continue,
        };
        let first = !ops.contains_key(&f.op_n);
        let op = ops.entry(f.op_n).or_insert_with(|| {
            let mut op = pool.get();
            op.op_type = op_type;
            op.height = f.height;
            op.cycle = f.cycle;
            op.timestamp = f.timestamp;
            op.op_n = f.op_n;
            op.list = OpList::Events;
            op.is_event = true;
            op.is_success = true;
            op.sender_id = Some(f.account_id);
            op.baker_id = Some(f.account_id);
            op
        });
        match op_type {
            OpType::Bake => match f.category {
                FlowCategory::Deposits => op.deposit += f.amount_in,
                FlowCategory::Rewards => op.reward += f.amount_in,
                FlowCategory::Fees => op.fee += f.amount_in,
                FlowCategory::Balance if f.is_fee => op.fee += f.amount_in,
                FlowCategory::Balance => op.reward += f.amount_in,
            },
            OpType::Unfreeze => match f.category {
                FlowCategory::Deposits => op.deposit += f.amount_out,
                FlowCategory::Rewards => op.reward += f.amount_out,
                FlowCategory::Fees => op.fee += f.amount_out,
                FlowCategory::Balance => {}
            },
            OpType::SeedSlash => {
                match f.category {
                    FlowCategory::Fees => op.fee += f.amount_out,
                    _ => op.reward += f.amount_out,
                }
                op.burned += f.amount_out;
            }
            OpType::Bonus => op.reward += f.amount_in,
            OpType::Reward if first => {
                op.reward = f.amount_in;
                if f.is_burned {
                    op.burned = f.amount_in;
                }
            }
            OpType::Deposit if first => op.deposit = f.amount_in,
            OpType::Invoice if first => op.reward = f.amount_in,
            _ => {}
        }
    }
    ops.into_values()
        .enumerate()
        .map(|(p, mut op)| {
            op.op_p = p as u32;
            op
        })
        .collect()
}

impl Ctx<'_> {
    /// Step 4: flows from block metadata and the events derived from them.
    pub(super) fn append_implicit_events(&mut self, raw: &RawBlock) -> Result<(), IndexerError> {
        let mut positions: HashMap<(AccountId, FlowType), u32> = HashMap::new();
        let first = self.block.peek_n();
        let mut next = first;
        let mut flows = Vec::new();
        for u in &raw.balance_updates {
            let Some(address) = u.address.as_deref() else {
                continue;
            };
            if u.change == 0 {
                continue;
            }
            let Some(class) = classify(u, self.params) else {
                continue;
            };
            let account_id = self.cache.require(address)?;
            let op_n = *positions
                .entry((account_id, class.flow_type))
                .or_insert_with(|| {
                    next += 1;
                    next - 1
                });
            let mut f = self.flow(account_id, op_n, class.flow_type);
            f.category = class.category;
            let amount = u.change.abs();
            if class.in_and_out {
                f.amount_in = amount;
                f.amount_out = amount;
            } else if u.change > 0 {
                f.amount_in = amount;
            } else {
                f.amount_out = amount;
            }
            f.is_minted = class.minted;
            f.is_burned = class.burned;
            f.is_fee = class.fee;
            f.is_frozen = u.kind == UpdateKind::Freezer && u.change > 0;
            f.is_unfrozen = u.kind == UpdateKind::Freezer && u.change < 0;
            flows.push(f);
        }
        self.block.reserve_n(next - first);

        let events = derive_implicit_events(flows.iter().map(|f| &**f), self.params, &self.pools.ops);
        self.emit_flows(flows);
        for op in events {
            if let Some(id) = op.sender_id {
                self.cache.mark_dirty(id);
            }
            self.push_op(op);
        }
        Ok(())
    }

    /// Step 5: migration originations and protocol subsidies.
    pub(super) fn append_implicit_ops(&mut self, raw: &RawBlock) -> Result<(), IndexerError> {
        for (p, res) in raw.implicit_results.iter().enumerate() {
            match res.kind {
                ImplicitKind::Origination => self.implicit_origination(p as u32, res)?,
                ImplicitKind::Transaction => self.implicit_subsidy(p as u32, res)?,
            }
        }
        Ok(())
    }

    fn implicit_origination(&mut self, op_p: u32, res: &ImplicitResult) -> Result<(), IndexerError> {
        let address = res.originated_contracts.first().ok_or_else(|| {
            IndexerError::MissingBlockData(format!(
                "implicit origination in block {} lists no contract",
                self.block.height
            ))
        })?;
        let id = self.cache.require(address)?;
        let mut op = self.op(OpType::Origination, OpList::BlockHeader, op_p);
        op.is_event = true;
        op.is_success = true;
        op.gas_used = res.consumed_gas;
        op.storage_paid = res.paid_storage_size_diff;

        if self.cache.contract(id).is_none() {
            let script = match res.script.as_ref().or_else(|| self.scripts.get(address)) {
                Some(s) => s.clone(),
                None => {
                    return Err(IndexerError::MissingBlockData(format!(
                        "no script for implicitly originated contract {address}"
                    )))
                }
            };
            let result = OpResult {
                originated_contracts: vec![address.clone()],
                storage: res.storage.clone(),
                ..Default::default()
            };
            self.originate(&mut op, None, &script, &result, true)?;
            patch_bigmap_allocs(&mut op.bigmap_events, &script.bigmaps);
            if let Some(c) = self.cache.contract_mut(id) {
                for ev in &op.bigmap_events {
                    if !c.bigmap_ids.contains(&ev.bigmap_id) {
                        c.bigmap_ids.push(ev.bigmap_id);
                    }
                }
            }
        } else {
            op.receiver_id = Some(id);
            op.is_contract = true;
        }

        // subsidies paid with the origination never change supply
        let mut flows = self.convert(&res.balance_updates, op.op_n, FlowType::Subsidy, false)?;
        for f in flows.iter_mut() {
            f.is_minted = false;
            f.is_burned = false;
        }
        op.volume = flows.iter().map(|f| f.amount_in).sum();
        self.emit_flows(flows);
        self.push_op(op);
        Ok(())
    }

    fn implicit_subsidy(&mut self, op_p: u32, res: &ImplicitResult) -> Result<(), IndexerError> {
        let address = res
            .balance_updates
            .iter()
            .find(|u| u.kind == UpdateKind::Contract && u.change > 0)
            .and_then(|u| u.address.as_deref())
            .ok_or_else(|| {
                IndexerError::MissingBlockData(format!(
                    "subsidy in block {} credits no contract",
                    self.block.height
                ))
            })?;
        let id = self.cache.require(address)?;
        if self.cache.contract(id).is_none() {
            return Err(IndexerError::MissingContract {
                address: address.to_string(),
            });
        }
        let mut op = self.op(OpType::Subsidy, OpList::BlockHeader, op_p);
        op.is_success = true;
        op.is_contract = true;
        op.receiver_id = Some(id);
        op.gas_used = res.consumed_gas;
        op.storage_paid = res.paid_storage_size_diff;
        if let Some(storage) = &res.storage {
            op.storage_hash = Some(hash64(storage));
            op.is_storage_update = true;
        }

        let mut flows = self.convert(&res.balance_updates, op.op_n, FlowType::Subsidy, false)?;
        for f in flows.iter_mut() {
            f.is_minted = f.amount_in > 0;
        }
        op.volume = flows.iter().map(|f| f.amount_in).sum();
        op.reward = op.volume;
        self.emit_flows(flows);

        let height = self.block.height;
        if let Some(c) = self.cache.contract_mut(id) {
            if let Some(h) = op.storage_hash {
                c.storage_hash = h;
            }
            c.last_seen = height;
            c.is_dirty = true;
        }
        self.cache.mark_dirty(id);
        self.push_op(op);
        Ok(())
    }
}

/// Migration results omit alloc diffs for bigmaps in the initial storage.
fn patch_bigmap_allocs(events: &mut Vec<BigmapEvent>, decls: &[crate::rpc::BigmapDecl]) {
    for d in decls {
        let allocated = events
            .iter()
            .any(|e| e.action == BigmapAction::Alloc && e.bigmap_id == d.id);
        if !allocated {
            events.push(BigmapEvent {
                action: BigmapAction::Alloc,
                bigmap_id: d.id,
                key: None,
                value: None,
                key_type: Some(d.key_type.clone()),
                value_type: Some(d.value_type.clone()),
                source_id: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Constants;

    fn params(version: u32) -> Params {
        Params::new(&Constants::default(), "PtTest", version)
    }

    fn flow(op_n: u32, flow_type: FlowType, category: FlowCategory, amount_in: i64) -> Flow {
        Flow {
            account_id: 1,
            height: 100,
            op_n,
            flow_type,
            category,
            amount_in,
            ..Default::default()
        }
    }

    #[test]
    fn bake_event_collects_rewards_and_deposits() {
        let pool = Pool::new(4);
        let flows = vec![
            flow(3, FlowType::Baking, FlowCategory::Rewards, 100),
            flow(3, FlowType::Baking, FlowCategory::Deposits, 200),
        ];
        let ops = derive_implicit_events(&flows, &params(11), &pool);
        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert_eq!(op.op_type, OpType::Bake);
        assert_eq!(op.op_n, 3);
        assert_eq!(op.reward, 100);
        assert_eq!(op.deposit, 200);
        assert_eq!(op.height, 100);
        assert_eq!(op.sender_id, Some(1));
    }

    #[test]
    fn positions_without_flows_are_compacted() {
        let pool = Pool::new(4);
        let mut balance_only = flow(4, FlowType::Deposit, FlowCategory::Balance, 0);
        balance_only.amount_out = 50;
        let flows = vec![
            flow(2, FlowType::Bonus, FlowCategory::Balance, 5),
            balance_only,
            flow(7, FlowType::Reward, FlowCategory::Balance, 9),
        ];
        let ops = derive_implicit_events(&flows, &params(12), &pool);
        let positions: Vec<_> = ops.iter().map(|o| (o.op_n, o.op_p)).collect();
        assert_eq!(positions, vec![(2, 0), (7, 1)]);
        assert_eq!(ops[0].op_type, OpType::Bonus);
        assert_eq!(ops[1].op_type, OpType::Reward);
    }

    #[test]
    fn invoice_events_are_version_gated() {
        let pool = Pool::new(4);
        let flows = vec![flow(0, FlowType::Invoice, FlowCategory::Balance, 1000)];
        assert!(derive_implicit_events(&flows, &params(8), &pool).is_empty());
        let ops = derive_implicit_events(&flows, &params(9), &pool);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].reward, 1000);
        assert_eq!(ops[0].sender_id, Some(1));
        assert_eq!(ops[0].receiver_id, None);
        assert_eq!(ops[0].volume, 0);
    }

    fn unfrozen(op_n: u32, category: FlowCategory, amount_out: i64) -> Flow {
        Flow {
            amount_out,
            is_unfrozen: true,
            ..flow(op_n, FlowType::Internal, category, 0)
        }
    }

    #[test]
    fn unfreeze_sums_freezer_debits() {
        let pool = Pool::new(4);
        let flows = vec![
            unfrozen(5, FlowCategory::Deposits, 40),
            unfrozen(5, FlowCategory::Rewards, 5),
            unfrozen(5, FlowCategory::Fees, 2),
            flow(5, FlowType::Internal, FlowCategory::Balance, 47),
        ];
        let ops = derive_implicit_events(&flows, &params(11), &pool);
        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert_eq!(op.op_type, OpType::Unfreeze);
        assert_eq!((op.deposit, op.reward, op.fee), (40, 5, 2));
        assert_eq!(op.volume, 0);
    }

    #[test]
    fn balance_credit_alone_is_no_unfreeze() {
        let pool = Pool::new(4);
        let flows = vec![flow(5, FlowType::Internal, FlowCategory::Balance, 47)];
        assert!(derive_implicit_events(&flows, &params(11), &pool).is_empty());
    }

    #[test]
    fn later_flows_at_a_position_keep_the_first_accounts() {
        let pool = Pool::new(4);
        let mut other = flow(2, FlowType::Bonus, FlowCategory::Balance, 4);
        other.account_id = 9;
        let flows = vec![flow(2, FlowType::Bonus, FlowCategory::Balance, 3), other];
        let ops = derive_implicit_events(&flows, &params(12), &pool);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type, OpType::Bonus);
        assert_eq!(ops[0].reward, 7);
        assert_eq!(ops[0].sender_id, Some(1));
        assert_eq!(ops[0].baker_id, Some(1));
    }

    #[test]
    fn once_only_amounts_keep_the_first_value() {
        let pool = Pool::new(4);
        let flows = vec![
            flow(1, FlowType::Deposit, FlowCategory::Deposits, 100),
            flow(1, FlowType::Deposit, FlowCategory::Deposits, 50),
            flow(2, FlowType::Reward, FlowCategory::Balance, 9),
            flow(2, FlowType::Reward, FlowCategory::Balance, 4),
            flow(3, FlowType::Invoice, FlowCategory::Balance, 1000),
            flow(3, FlowType::Invoice, FlowCategory::Balance, 1),
        ];
        let ops = derive_implicit_events(&flows, &params(12), &pool);
        let kinds: Vec<_> = ops.iter().map(|o| o.op_type).collect();
        assert_eq!(kinds, vec![OpType::Deposit, OpType::Reward, OpType::Invoice]);
        assert_eq!(ops[0].deposit, 100);
        assert_eq!(ops[1].reward, 9);
        assert_eq!(ops[2].reward, 1000);
    }

    #[test]
    fn burned_reward_records_the_loss() {
        let pool = Pool::new(4);
        let mut f = flow(4, FlowType::Reward, FlowCategory::Balance, 16);
        f.amount_out = 16;
        f.is_burned = true;
        let ops = derive_implicit_events([&f], &params(12), &pool);
        assert_eq!(ops[0].op_type, OpType::Reward);
        assert_eq!((ops[0].reward, ops[0].burned), (16, 16));
    }

    #[test]
    fn seed_slash_burns() {
        let pool = Pool::new(4);
        let mut f = flow(1, FlowType::NonceRevelation, FlowCategory::Rewards, 0);
        f.amount_out = 30;
        f.is_burned = true;
        let ops = derive_implicit_events([&f], &params(11), &pool);
        assert_eq!(ops[0].op_type, OpType::SeedSlash);
        assert_eq!(ops[0].reward, 30);
        assert_eq!(ops[0].burned, 30);
    }

    #[test]
    fn classification_follows_protocol_version() {
        let deposit = BalanceUpdate::freezer("tz1b", UpdateCategory::Deposits, 100);
        assert_eq!(classify(&deposit, &params(11)).unwrap().flow_type, FlowType::Baking);
        assert_eq!(classify(&deposit, &params(12)).unwrap().flow_type, FlowType::Deposit);

        let lost = BalanceUpdate::contract("tz1b", UpdateCategory::LostNonceRewards, 8);
        let pre = classify(&lost, &params(11)).unwrap();
        assert!(pre.burned && !pre.minted && pre.in_and_out);
        assert!(classify(&lost, &params(12)).unwrap().minted);

        let subsidy = BalanceUpdate::contract("KT1lb", UpdateCategory::Subsidy, 5)
            .with_origin(UpdateOrigin::Subsidy);
        assert!(classify(&subsidy, &params(12)).is_none());

        let invoice = BalanceUpdate::contract("tz1a", UpdateCategory::Invoice, 5)
            .with_origin(UpdateOrigin::Migration);
        assert!(!classify(&invoice, &params(8)).unwrap().minted);
        assert!(classify(&invoice, &params(9)).unwrap().minted);
    }

    #[test]
    fn patch_adds_missing_allocs_once() {
        let decl = crate::rpc::BigmapDecl {
            id: 4,
            key_type: serde_json::json!({ "prim": "address" }),
            value_type: serde_json::json!({ "prim": "nat" }),
        };
        let mut events = Vec::new();
        patch_bigmap_allocs(&mut events, &[decl.clone()]);
        patch_bigmap_allocs(&mut events, &[decl]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, BigmapAction::Alloc);
    }
}
