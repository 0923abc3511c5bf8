//! Step 3: translate the block's operation lists.

use serde_json::json;

use chainetl_core::error::IndexerError;
use chainetl_core::pool::Pooled;

use super::Ctx;
use crate::model::{AccountId, BigmapEvent, Flow, FlowCategory, FlowType, Op, OpList, OpType};
use crate::rpc::{
    hash64, is_contract_address, BalanceUpdate, BigmapAction, InternalKind, InternalOp,
    ManagerOp, OpResult, OpStatus, Parameters, RawBigmapDiff, RawBlock, RawOpBody,
    RawOperation, Script, UpdateCategory, UpdateKind, BURN_ADDRESS,
};

fn category_of(u: &BalanceUpdate) -> FlowCategory {
    match (u.kind, u.category) {
        (UpdateKind::Freezer, UpdateCategory::Deposits) => FlowCategory::Deposits,
        (UpdateKind::Freezer, UpdateCategory::Rewards) => FlowCategory::Rewards,
        (UpdateKind::Freezer, UpdateCategory::Fees) => FlowCategory::Fees,
        _ => FlowCategory::Balance,
    }
}

fn bigmap_events(diff: &[RawBigmapDiff]) -> Vec<BigmapEvent> {
    diff.iter()
        .map(|d| BigmapEvent {
            action: d.action,
            bigmap_id: d.id,
            key: d.key.clone(),
            value: d.value.clone(),
            key_type: d.key_type.clone(),
            value_type: d.value_type.clone(),
            source_id: d.source_id,
        })
        .collect()
}

/// Sum credited rewards and deposits into the op.
fn sum_into(op: &mut Op, flows: &[Pooled<Flow>]) {
    for f in flows {
        match f.category {
            FlowCategory::Rewards => op.reward += f.amount_in,
            FlowCategory::Deposits => op.deposit += f.amount_in,
            FlowCategory::Fees => op.fee += f.amount_in,
            FlowCategory::Balance if f.is_minted => op.reward += f.amount_in,
            FlowCategory::Balance => {}
        }
    }
}

impl Ctx<'_> {
    pub(super) fn translate_ops(&mut self, raw: &RawBlock) -> Result<(), IndexerError> {
        for (l, list) in raw.operations.iter().enumerate() {
            let Some(op_list) = OpList::from_index(l) else {
                return Err(IndexerError::MissingBlockData(format!(
                    "block {} has unexpected operation list {l}",
                    raw.hash
                )));
            };
            for (p, rop) in list.iter().enumerate() {
                self.translate(op_list, p as u32, rop, raw)?;
            }
        }
        Ok(())
    }

    /// Convert node balance updates into flows of `op_n`.
    ///
    /// A credit directly preceded by a mint (or credited to frozen rewards)
    /// creates supply; a debit directly followed by a burn destroys it.
    pub(super) fn convert(
        &mut self,
        updates: &[BalanceUpdate],
        op_n: u32,
        flow_type: FlowType,
        is_fee: bool,
    ) -> Result<Vec<Pooled<Flow>>, IndexerError> {
        let mut out = Vec::with_capacity(updates.len());
        for (i, u) in updates.iter().enumerate() {
            let Some(address) = u.address.as_deref() else {
                continue;
            };
            if u.change == 0 || !matches!(u.kind, UpdateKind::Contract | UpdateKind::Freezer) {
                continue;
            }
            let account_id = self.cache.require(address)?;
            let prev = i.checked_sub(1).and_then(|j| updates.get(j));
            let next = updates.get(i + 1);
            let mut f = self.flow(account_id, op_n, flow_type);
            f.category = category_of(u);
            if u.change > 0 {
                f.amount_in = u.change;
            } else {
                f.amount_out = -u.change;
            }
            f.is_fee = is_fee;
            f.is_minted = u.change > 0
                && (prev.is_some_and(|p| p.kind == UpdateKind::Minted)
                    || f.category == FlowCategory::Rewards);
            f.is_burned = u.change < 0 && next.is_some_and(|n| n.kind == UpdateKind::Burned);
            f.is_frozen = u.kind == UpdateKind::Freezer && u.change > 0;
            f.is_unfrozen = u.kind == UpdateKind::Freezer && u.change < 0;
            out.push(f);
        }
        Ok(out)
    }

    fn touch(&mut self, id: AccountId, success: bool) {
        self.cache.mark_dirty(id);
        if let Some(acc) = self.cache.account_mut(id) {
            if success {
                acc.n_ops += 1;
            } else {
                acc.n_ops_failed += 1;
            }
        }
    }

    fn translate(
        &mut self,
        list: OpList,
        op_p: u32,
        rop: &RawOperation,
        raw: &RawBlock,
    ) -> Result<(), IndexerError> {
        match &rop.body {
            RawOpBody::Endorsement {
                delegate,
                slots,
                balance_updates,
            } => {
                let id = self.cache.require(delegate)?;
                let mut op = self.op(OpType::Endorsement, list, op_p);
                op.hash = Some(rop.hash.clone());
                op.is_success = true;
                op.sender_id = Some(id);
                op.baker_id = Some(id);
                op.slots = *slots;
                let flows = self.convert(balance_updates, op.op_n, FlowType::Endorsement, false)?;
                sum_into(&mut op, &flows);
                self.emit_flows(flows);
                self.touch(id, true);
                if let Some(baker) = self.cache.baker_mut(id) {
                    baker.slots_endorsed += u64::from(*slots);
                    baker.is_dirty = true;
                }
                self.push_op(op);
            }
            RawOpBody::SeedNonceRevelation {
                level,
                nonce,
                balance_updates,
            } => {
                let mut op = self.op(OpType::NonceRevelation, list, op_p);
                op.hash = Some(rop.hash.clone());
                op.is_success = true;
                op.parameters = Some(json!({ "level": level, "nonce": nonce }));
                let flows =
                    self.convert(balance_updates, op.op_n, FlowType::NonceRevelation, false)?;
                let sender = match flows.first() {
                    Some(f) => f.account_id,
                    None => self.cache.require(&raw.baker)?,
                };
                op.sender_id = Some(sender);
                op.baker_id = Some(sender);
                sum_into(&mut op, &flows);
                self.emit_flows(flows);
                self.touch(sender, true);
                self.push_op(op);
            }
            RawOpBody::DoubleBakingEvidence {
                offender,
                balance_updates,
            }
            | RawOpBody::DoubleEndorsementEvidence {
                offender,
                balance_updates,
            } => {
                let (op_type, flow_type) = match &rop.body {
                    RawOpBody::DoubleBakingEvidence { .. } => {
                        (OpType::DoubleBaking, FlowType::DoubleBaking)
                    }
                    _ => (OpType::DoubleEndorsement, FlowType::DoubleEndorsement),
                };
                let offender_id = self.cache.require(offender)?;
                let mut op = self.op(op_type, list, op_p);
                op.hash = Some(rop.hash.clone());
                op.is_success = true;
                op.receiver_id = Some(offender_id);
                let mut flows = self.convert(balance_updates, op.op_n, flow_type, false)?;
                let (mut lost, mut gained) = (0, 0);
                for f in flows.iter_mut() {
                    if f.account_id == offender_id && f.amount_out > 0 {
                        f.is_burned = true;
                        lost += f.amount_out;
                    } else if f.amount_in > 0 {
                        f.is_minted = true;
                        gained += f.amount_in;
                    }
                }
                let accuser = flows
                    .iter()
                    .find(|f| f.amount_in > 0)
                    .map(|f| f.account_id)
                    .map_or_else(|| self.cache.require(&raw.baker), Ok)?;
                op.sender_id = Some(accuser);
                op.baker_id = Some(accuser);
                op.reward = gained;
                op.burned = lost - gained;
                op.volume = lost;
                self.emit_flows(flows);
                self.touch(accuser, true);
                self.touch(offender_id, true);
                self.push_op(op);
            }
            RawOpBody::Activation {
                pkh,
                balance_updates,
                ..
            } => {
                let id = self.cache.require(pkh)?;
                let mut op = self.op(OpType::Activation, list, op_p);
                op.hash = Some(rop.hash.clone());
                op.is_success = true;
                op.sender_id = Some(id);
                let flows = self.convert(balance_updates, op.op_n, FlowType::Activation, false)?;
                op.volume = flows.iter().map(|f| f.amount_in).sum();
                self.emit_flows(flows);
                if let Some(acc) = self.cache.account_mut(id) {
                    acc.is_activated = true;
                }
                self.touch(id, true);
                self.push_op(op);
            }
            RawOpBody::Proposals {
                source,
                period,
                proposals,
            } => {
                let id = self.cache.require(source)?;
                let mut op = self.op(OpType::Proposal, list, op_p);
                op.hash = Some(rop.hash.clone());
                op.is_success = true;
                op.sender_id = Some(id);
                op.parameters = Some(json!({ "period": period, "proposals": proposals }));
                self.touch(id, true);
                self.push_op(op);
            }
            RawOpBody::Ballot {
                source,
                period,
                proposal,
                ballot,
            } => {
                let id = self.cache.require(source)?;
                let mut op = self.op(OpType::Ballot, list, op_p);
                op.hash = Some(rop.hash.clone());
                op.is_success = true;
                op.sender_id = Some(id);
                op.parameters = Some(json!({
                    "period": period,
                    "proposal": proposal,
                    "ballot": ballot,
                }));
                self.touch(id, true);
                self.push_op(op);
            }
            RawOpBody::Reveal { manager, .. } => {
                let op = self.manager(OpType::Reveal, list, op_p, rop, manager)?;
                if op.is_success {
                    if let Some(acc) = op.sender_id.and_then(|id| self.cache.account_mut(id)) {
                        acc.is_revealed = true;
                    }
                }
                self.finish_manager(op, &manager.result)?;
            }
            RawOpBody::Transaction {
                manager,
                amount,
                destination,
                parameters,
                internal,
            } => {
                let mut op = self.manager(OpType::Transaction, list, op_p, rop, manager)?;
                let receiver = self.cache.require(destination)?;
                op.receiver_id = Some(receiver);
                op.volume = *amount;
                op.is_burn = destination == BURN_ADDRESS;
                self.call(&mut op, receiver, destination, parameters.as_ref(), &manager.result);
                self.touch(receiver, op.is_success);
                let (success, sender) = (op.is_success, op.sender_id);
                if op.is_burn {
                    self.finish_burn(op, &manager.result)?;
                } else {
                    self.finish_manager(op, &manager.result)?;
                }
                self.internal(list, op_p, rop, internal, success, sender)?;
            }
            RawOpBody::Origination {
                manager,
                balance,
                delegate,
                script,
                internal,
            } => {
                let mut op = self.manager(OpType::Origination, list, op_p, rop, manager)?;
                op.volume = *balance;
                op.is_contract = true;
                if op.is_success {
                    let creator = op.sender_id;
                    self.originate(&mut op, creator, script, &manager.result, false)?;
                    if let Some(d) = delegate {
                        let did = self.cache.require(d)?;
                        op.baker_id = Some(did);
                        if let Some(kt) = op.receiver_id.and_then(|id| self.cache.account_mut(id)) {
                            kt.baker_id = Some(did);
                        }
                    }
                }
                let (success, sender) = (op.is_success, op.sender_id);
                self.finish_manager(op, &manager.result)?;
                self.internal(list, op_p, rop, internal, success, sender)?;
            }
            RawOpBody::Delegation { manager, delegate } => {
                let mut op = self.manager(OpType::Delegation, list, op_p, rop, manager)?;
                if let (true, Some(sender)) = (op.is_success, op.sender_id) {
                    self.delegate(&mut op, sender, delegate.as_deref(), &manager.source)?;
                }
                self.finish_manager(op, &manager.result)?;
            }
            RawOpBody::RegisterGlobalConstant { manager, value } => {
                let mut op = self.manager(OpType::RegisterConstant, list, op_p, rop, manager)?;
                op.parameters = Some(value.clone());
                self.finish_manager(op, &manager.result)?;
            }
            RawOpBody::SetDepositsLimit { manager, limit } => {
                let mut op = self.manager(OpType::DepositsLimit, list, op_p, rop, manager)?;
                op.parameters = Some(json!({ "limit": limit }));
                if let (true, Some(sender)) = (op.is_success, op.sender_id) {
                    if let Some(baker) = self.cache.baker_mut(sender) {
                        baker.deposits_limit = *limit;
                        baker.is_dirty = true;
                    }
                }
                self.finish_manager(op, &manager.result)?;
            }
            RawOpBody::RollupOrigination { manager } => {
                let op = self.manager(OpType::RollupOrigination, list, op_p, rop, manager)?;
                self.finish_manager(op, &manager.result)?;
            }
            RawOpBody::RollupTransaction { manager, rollup } => {
                let mut op = self.manager(OpType::RollupTransaction, list, op_p, rop, manager)?;
                op.parameters = Some(json!({ "rollup": rollup }));
                self.finish_manager(op, &manager.result)?;
            }
        }
        Ok(())
    }

    /// Common part of manager operations: fee payment and limits.
    fn manager(
        &mut self,
        op_type: OpType,
        list: OpList,
        op_p: u32,
        rop: &RawOperation,
        m: &ManagerOp,
    ) -> Result<Pooled<Op>, IndexerError> {
        let sender = self.cache.require(&m.source)?;
        let mut op = self.op(op_type, list, op_p);
        op.hash = Some(rop.hash.clone());
        op.is_success = m.result.status == OpStatus::Applied;
        op.sender_id = Some(sender);
        op.fee = m.fee;
        op.gas_limit = m.gas_limit;
        op.storage_limit = m.storage_limit;
        op.gas_used = m.result.consumed_gas;
        op.storage_paid = m.result.paid_storage_size_diff;
        let fees = self.convert(&m.fee_updates, op.op_n, op_type.into(), true)?;
        self.emit_flows(fees);
        self.touch(sender, op.is_success);
        Ok(op)
    }

    /// Emit the result flows of a manager or internal op and append it.
    fn finish_manager(&mut self, mut op: Pooled<Op>, result: &OpResult) -> Result<(), IndexerError> {
        if op.is_success {
            let flows = self.convert(&result.balance_updates, op.op_n, op.op_type.into(), false)?;
            op.burned += flows
                .iter()
                .filter(|f| f.is_burned)
                .map(|f| f.amount_out)
                .sum::<i64>();
            self.emit_flows(flows);
        }
        self.push_op(op);
        Ok(())
    }

    /// Transfers to the burn address destroy the amount: the sender's debit
    /// is a burn and the burn address is never credited.
    fn finish_burn(&mut self, mut op: Pooled<Op>, result: &OpResult) -> Result<(), IndexerError> {
        if op.is_success {
            let flows = self.convert(&result.balance_updates, op.op_n, FlowType::Transaction, false)?;
            let mut amount_burned = false;
            for mut f in flows {
                if Some(f.account_id) == op.receiver_id {
                    continue;
                }
                if !amount_burned
                    && Some(f.account_id) == op.sender_id
                    && f.amount_out == op.volume
                    && !f.is_burned
                {
                    f.is_burned = true;
                    amount_burned = true;
                } else if f.is_burned {
                    op.burned += f.amount_out;
                }
                self.emit_flow(f);
            }
        }
        self.push_op(op);
        Ok(())
    }

    /// Contract call bookkeeping for a transaction to `receiver`.
    fn call(
        &mut self,
        op: &mut Op,
        receiver: AccountId,
        destination: &str,
        parameters: Option<&Parameters>,
        result: &OpResult,
    ) {
        op.is_contract = is_contract_address(destination);
        if let Some(p) = parameters {
            op.entrypoint = Some(p.entrypoint.clone());
            op.parameters = Some(p.value.clone());
        }
        if !op.is_contract {
            return;
        }
        if op.is_success {
            if let Some(storage) = &result.storage {
                op.storage_hash = Some(hash64(storage));
                op.is_storage_update = true;
            }
            op.bigmap_events = bigmap_events(&result.bigmap_diff);
        }
        let height = self.block.height;
        if let Some(c) = self.cache.contract_mut(receiver) {
            c.last_seen = height;
            c.is_dirty = true;
            if !op.is_success {
                c.n_calls_failed += 1;
                return;
            }
            c.n_calls += 1;
            if let Some(h) = op.storage_hash {
                c.storage_hash = h;
            }
            track_bigmaps(&mut c.bigmap_ids, &op.bigmap_events);
        }
    }

    /// Register a newly originated contract and record its initial state.
    pub(super) fn originate(
        &mut self,
        op: &mut Op,
        creator: Option<AccountId>,
        script: &Script,
        result: &OpResult,
        is_implicit: bool,
    ) -> Result<AccountId, IndexerError> {
        let address = result.originated_contracts.first().ok_or_else(|| {
            IndexerError::MissingBlockData(format!(
                "origination in block {} lists no contract",
                self.block.height
            ))
        })?;
        script.check(address)?;
        let id = self.cache.require(address)?;
        op.receiver_id = Some(id);
        op.creator_id = creator;
        op.is_contract = true;
        let storage = result.storage.as_ref().unwrap_or(&script.storage);
        op.storage_hash = Some(hash64(storage));
        op.bigmap_events = bigmap_events(&result.bigmap_diff);
        let contract = self.cache.register_contract(id, creator)?;
        contract.code_hash = script.code_hash();
        contract.storage_hash = hash64(storage);
        contract.is_implicit = is_implicit;
        contract.is_dirty = true;
        track_bigmaps(&mut contract.bigmap_ids, &op.bigmap_events);
        self.cache.mark_dirty(id);
        Ok(id)
    }

    fn delegate(
        &mut self,
        op: &mut Op,
        sender: AccountId,
        delegate: Option<&str>,
        source: &str,
    ) -> Result<(), IndexerError> {
        let baker = match delegate {
            Some(d) => {
                let did = self.cache.require(d)?;
                if d == source {
                    self.cache.ensure_baker(did)?;
                }
                self.touch(did, true);
                Some(did)
            }
            None => None,
        };
        op.baker_id = baker;
        if let Some(acc) = self.cache.account_mut(sender) {
            acc.baker_id = baker;
            acc.is_dirty = true;
        }
        Ok(())
    }

    /// Operations emitted by contracts while executing their parent op.
    fn internal(
        &mut self,
        list: OpList,
        op_p: u32,
        rop: &RawOperation,
        internal: &[InternalOp],
        parent_success: bool,
        parent_sender: Option<AccountId>,
    ) -> Result<(), IndexerError> {
        for (i, iop) in internal.iter().enumerate() {
            let op_type = match iop.kind {
                InternalKind::Transaction => OpType::Transaction,
                InternalKind::Origination => OpType::Origination,
                InternalKind::Delegation => OpType::Delegation,
            };
            let sender = self.cache.require(&iop.source)?;
            let mut op = self.op(op_type, list, op_p);
            op.op_i = i as u32 + 1;
            op.hash = Some(rop.hash.clone());
            op.is_internal = true;
            op.is_success = parent_success && iop.result.status == OpStatus::Applied;
            op.sender_id = Some(sender);
            op.creator_id = parent_sender;
            op.gas_used = iop.result.consumed_gas;
            op.storage_paid = iop.result.paid_storage_size_diff;
            self.touch(sender, op.is_success);
            match iop.kind {
                InternalKind::Transaction => {
                    let dest = iop.destination.as_deref().ok_or_else(|| {
                        IndexerError::MissingBlockData(format!(
                            "internal transaction {} has no destination",
                            rop.hash
                        ))
                    })?;
                    let receiver = self.cache.require(dest)?;
                    op.receiver_id = Some(receiver);
                    op.volume = iop.amount;
                    op.is_burn = dest == BURN_ADDRESS;
                    self.call(&mut op, receiver, dest, iop.parameters.as_ref(), &iop.result);
                    self.touch(receiver, op.is_success);
                }
                InternalKind::Origination => {
                    op.volume = iop.amount;
                    if op.is_success {
                        let script = iop.script.as_ref().ok_or_else(|| {
                            IndexerError::MissingBlockData(format!(
                                "internal origination {} has no script",
                                rop.hash
                            ))
                        })?;
                        self.originate(&mut op, Some(sender), script, &iop.result, false)?;
                    }
                }
                InternalKind::Delegation => {
                    if op.is_success {
                        self.delegate(&mut op, sender, iop.delegate.as_deref(), &iop.source)?;
                    }
                }
            }
            if op.is_burn {
                self.finish_burn(op, &iop.result)?;
            } else {
                self.finish_manager(op, &iop.result)?;
            }
        }
        Ok(())
    }
}

fn track_bigmaps(ids: &mut Vec<i64>, events: &[BigmapEvent]) {
    for ev in events {
        match ev.action {
            BigmapAction::Alloc | BigmapAction::Copy => {
                if !ids.contains(&ev.bigmap_id) {
                    ids.push(ev.bigmap_id);
                }
            }
            BigmapAction::Remove => ids.retain(|id| *id != ev.bigmap_id),
            BigmapAction::Update => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BlockPools;
    use crate::cache::AccountCache;
    use crate::model::Block;
    use crate::params::Params;
    use crate::rpc::Constants;
    use std::collections::HashMap;

    fn with_ctx<R>(f: impl FnOnce(&mut Ctx<'_>) -> R) -> R {
        let pools = BlockPools::new(1, 8, 8);
        let params = Params::new(&Constants::default(), "PtTest", 12);
        let scripts = HashMap::new();
        let mut block = Block::default();
        block.height = 5;
        let mut cache = AccountCache::new(5, 1);
        cache.get_or_create("tz1alice");
        cache.get_or_create("tz1bob");
        let mut ctx = Ctx {
            block: &mut block,
            cache: &mut cache,
            params: &params,
            pools: &pools,
            scripts: &scripts,
        };
        f(&mut ctx)
    }

    #[test]
    fn convert_flags_mint_and_burn_pairs() {
        with_ctx(|ctx| {
            let updates = vec![
                BalanceUpdate::sink(UpdateKind::Minted, UpdateCategory::BakingRewards, -10),
                BalanceUpdate::contract("tz1alice", UpdateCategory::BakingRewards, 10),
                BalanceUpdate::contract("tz1bob", UpdateCategory::StorageFees, -3),
                BalanceUpdate::sink(UpdateKind::Burned, UpdateCategory::StorageFees, 3),
                BalanceUpdate::freezer("tz1bob", UpdateCategory::Deposits, 50),
            ];
            let flows = ctx.convert(&updates, 0, FlowType::Transaction, false).unwrap();
            assert_eq!(flows.len(), 3);
            assert!(flows[0].is_minted && flows[0].amount_in == 10);
            assert!(flows[1].is_burned && flows[1].amount_out == 3);
            assert_eq!(flows[2].category, FlowCategory::Deposits);
            assert!(flows[2].is_frozen && !flows[2].is_minted);
        });
    }

    #[test]
    fn convert_requires_known_accounts() {
        with_ctx(|ctx| {
            let updates = vec![BalanceUpdate::contract("tz1ghost", UpdateCategory::None, 1)];
            let err = ctx.convert(&updates, 0, FlowType::Transaction, false).unwrap_err();
            assert!(matches!(err, IndexerError::MissingAccount { .. }));
        });
    }

    #[test]
    fn bigmap_tracking() {
        let ev = |action, id| BigmapEvent {
            action,
            bigmap_id: id,
            key: None,
            value: None,
            key_type: None,
            value_type: None,
            source_id: None,
        };
        let mut ids = vec![1];
        track_bigmaps(
            &mut ids,
            &[
                ev(BigmapAction::Alloc, 2),
                ev(BigmapAction::Alloc, 1),
                ev(BigmapAction::Remove, 1),
                ev(BigmapAction::Update, 2),
            ],
        );
        assert_eq!(ids, vec![2]);
    }
}
