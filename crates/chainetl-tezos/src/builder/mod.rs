//! Block builder: raw block + parent context → fully derived [`Block`].
//!
//! The only suspension points are in [`BlockBuilder::build`]'s fetch step
//! (constants, rights, stored entities, scripts). Everything after it runs
//! synchronously on the prefetched state.

mod implicit;
mod ops;
mod validate;

pub use implicit::derive_implicit_events;
pub use validate::validate;

use std::collections::HashMap;

use futures::future::try_join_all;
use tracing::{debug, instrument};

use chainetl_core::error::IndexerError;
use chainetl_core::pool::{Pool, Pooled};
use chainetl_core::store::TableStore;

use crate::cache::AccountCache;
use crate::indexer::Indexer;
use crate::model::{AccountId, Block, BlockCounters, Flow, FlowType, Op, OpList, OpType};
use crate::params::Params;
use crate::rpc::{ImplicitKind, RawBlock, RawClient, Right, Script};

/// Object pools shared by every block a builder produces.
#[derive(Clone)]
pub struct BlockPools {
    pub blocks: Pool<Block>,
    pub ops: Pool<Op>,
    pub flows: Pool<Flow>,
}

impl BlockPools {
    pub fn new(blocks: usize, ops: usize, flows: usize) -> Self {
        Self {
            blocks: Pool::new(blocks),
            ops: Pool::new(ops),
            flows: Pool::new(flows),
        }
    }
}

impl Default for BlockPools {
    fn default() -> Self {
        Self::new(4, 4096, 8192)
    }
}

/// Output of a successful build, consumed by [`Indexer::commit`].
#[derive(Debug)]
pub struct BuiltBlock {
    pub block: Pooled<Block>,
    pub cache: AccountCache,
    pub rights: Vec<Right>,
}

pub struct BlockBuilder {
    pools: BlockPools,
    validate: bool,
}

impl BlockBuilder {
    pub fn new(pools: BlockPools, validate: bool) -> Self {
        Self { pools, validate }
    }

    pub fn pools(&self) -> &BlockPools {
        &self.pools
    }

    /// Build the block for `raw` on top of `parent` (`None` for the first
    /// indexed block).
    #[instrument(skip_all, fields(height = raw.height, hash = %raw.hash))]
    pub async fn build<C, S>(
        &self,
        raw: &RawBlock,
        parent: Option<&Block>,
        client: &C,
        indexer: &Indexer<S>,
    ) -> Result<BuiltBlock, IndexerError>
    where
        C: RawClient + ?Sized,
        S: TableStore,
    {
        if let Some(p) = parent {
            if p.height + 1 != raw.height || p.hash != raw.predecessor {
                return Err(IndexerError::invariant(
                    raw.height,
                    format!("block {} does not extend parent {} at {}", raw.hash, p.hash, p.height),
                ));
            }
        }

        // 1. initialize
        let mut block = self.pools.blocks.get();
        block.init(raw, parent);

        // 2. fetch auxiliary state
        let constants = client.get_constants(raw.height).await.map_err(|e| match e {
            IndexerError::NotFound(_) => IndexerError::MissingConstants { height: raw.height },
            e => e,
        })?;
        let params = Params::new(&constants, raw.protocol.clone(), block.version);
        block.is_cycle_start = params.is_cycle_start(raw.height);

        let rights = match params.rights_cycle(raw.height, raw.cycle) {
            Some(cycle) => {
                let rights = client.fetch_rights_by_cycle(raw.height, cycle).await?;
                debug!(cycle, rights = rights.len(), "fetched rights");
                rights
            }
            None => Vec::new(),
        };

        let mut cache = self.load_cache(raw, indexer).await?;
        let scripts = self.load_scripts(raw, &cache, client).await?;

        // 3.–6. derive
        {
            let mut ctx = Ctx {
                block: &mut block,
                cache: &mut cache,
                params: &params,
                pools: &self.pools,
                scripts: &scripts,
            };
            ctx.init_baker(raw)?;
            ctx.translate_ops(raw)?;
            ctx.append_implicit_events(raw)?;
            ctx.append_implicit_ops(raw)?;
            ctx.aggregate();
        }

        // 7. validate
        if self.validate {
            validate(&block, parent)?;
        }

        debug!(
            ops = block.ops.len(),
            flows = block.flows.len(),
            accounts = block.n_accounts_seen,
            "built block"
        );
        Ok(BuiltBlock {
            block,
            cache,
            rights,
        })
    }

    /// Load every referenced entity that already exists in the index and
    /// register the rest as new accounts, in order of first appearance.
    async fn load_cache<S: TableStore>(
        &self,
        raw: &RawBlock,
        indexer: &Indexer<S>,
    ) -> Result<AccountCache, IndexerError> {
        let addresses = raw.addresses();
        let next_id = indexer.next_account_id().await?;
        let loaded = try_join_all(addresses.iter().map(|a| indexer.load_account(a))).await?;
        let mut cache = AccountCache::new(raw.height, next_id);

        let mut bakers = Vec::new();
        let mut contracts = Vec::new();
        for (account, stored) in loaded.into_iter().flatten() {
            if account.is_baker {
                bakers.push(account.id);
            }
            if account.is_contract {
                contracts.push(account.id);
            }
            cache.insert_loaded(account, stored);
        }
        let bakers = try_join_all(bakers.into_iter().map(|id| indexer.load_baker(id))).await?;
        for (baker, stored) in bakers.into_iter().flatten() {
            cache.insert_loaded_baker(baker, stored);
        }
        let contracts =
            try_join_all(contracts.into_iter().map(|id| indexer.load_contract(id))).await?;
        for (contract, stored) in contracts.into_iter().flatten() {
            cache.insert_loaded_contract(contract, stored);
        }

        for address in &addresses {
            cache.get_or_create(address);
        }
        Ok(cache)
    }

    /// Scripts of implicitly originated contracts that the block omits.
    async fn load_scripts<C: RawClient + ?Sized>(
        &self,
        raw: &RawBlock,
        cache: &AccountCache,
        client: &C,
    ) -> Result<HashMap<String, Script>, IndexerError> {
        let missing: Vec<&String> = raw
            .implicit_results
            .iter()
            .filter(|r| r.kind == ImplicitKind::Origination && r.script.is_none())
            .flat_map(|r| r.originated_contracts.iter())
            .filter(|a| {
                cache
                    .id_of(a)
                    .and_then(|id| cache.contract(id))
                    .is_none()
            })
            .collect();
        let scripts =
            try_join_all(missing.iter().map(|a| client.get_contract_script(a.as_str()))).await?;
        Ok(missing
            .into_iter()
            .cloned()
            .zip(scripts)
            .collect())
    }
}

/// Mutable state shared by the synchronous derivation steps.
pub(crate) struct Ctx<'a> {
    pub block: &'a mut Block,
    pub cache: &'a mut AccountCache,
    pub params: &'a Params,
    pub pools: &'a BlockPools,
    pub scripts: &'a HashMap<String, Script>,
}

impl Ctx<'_> {
    /// A new op at the next block position.
    fn op(&mut self, op_type: OpType, list: OpList, op_p: u32) -> Pooled<Op> {
        let op_n = self.block.next_n();
        let mut op = self.pools.ops.get();
        op.op_type = op_type;
        op.height = self.block.height;
        op.cycle = self.block.cycle;
        op.timestamp = self.block.timestamp;
        op.op_n = op_n;
        op.list = list;
        op.op_p = op_p;
        op.is_event = op_type.is_event();
        op
    }

    fn flow(&self, account_id: AccountId, op_n: u32, flow_type: FlowType) -> Pooled<Flow> {
        let mut f = self.pools.flows.get();
        f.account_id = account_id;
        f.op_n = op_n;
        f.flow_type = flow_type;
        f.height = self.block.height;
        f.cycle = self.block.cycle;
        f.timestamp = self.block.timestamp;
        f
    }

    /// Apply a flow to its owner and append it to the block.
    fn emit_flow(&mut self, flow: Pooled<Flow>) {
        if let Some(acc) = self.cache.account_mut(flow.account_id) {
            acc.apply(&flow);
        }
        if let Some(baker) = self.cache.baker_mut(flow.account_id) {
            baker.apply(&flow);
        }
        self.block.flows.push(flow);
    }

    fn emit_flows(&mut self, flows: Vec<Pooled<Flow>>) {
        for f in flows {
            self.emit_flow(f);
        }
    }

    fn push_op(&mut self, op: Pooled<Op>) {
        self.block.ops.push(op);
    }

    fn init_baker(&mut self, raw: &RawBlock) -> Result<(), IndexerError> {
        let baker_id = self.cache.require(&raw.baker)?;
        self.block.baker_id = Some(baker_id);
        self.cache.mark_dirty(baker_id);
        let baker = self.cache.ensure_baker(baker_id)?;
        baker.blocks_baked += 1;
        baker.is_dirty = true;
        if let Some(proposer) = &raw.proposer {
            let id = self.cache.require(proposer)?;
            self.block.proposer_id = Some(id);
            self.cache.mark_dirty(id);
            let baker = self.cache.ensure_baker(id)?;
            baker.blocks_proposed += 1;
            baker.is_dirty = true;
        }
        Ok(())
    }

    /// Step 6: recompute counters and roll running totals forward.
    fn aggregate(&mut self) {
        let block = &mut *self.block;
        block.counters = BlockCounters::fold(
            block.ops.iter().map(|o| &**o),
            block.flows.iter().map(|f| &**f),
        );
        block.parent_slots_endorsed = (block.height > 0 && block.counters.n_endorsements > 0)
            .then_some(block.counters.n_slots_in_block);

        let (mut seen, mut new, mut funded, mut cleared) = (0u32, 0u32, 0u32, 0u32);
        for acc in self.cache.dirty_accounts() {
            seen += 1;
            if acc.is_new && !acc.is_contract {
                new += 1;
            }
            if acc.became_funded() {
                funded += 1;
            }
            if acc.became_cleared() {
                cleared += 1;
            }
        }
        let new_contracts: Vec<bool> = self
            .cache
            .dirty_contracts()
            .filter(|c| c.is_new)
            .map(|c| c.is_implicit)
            .collect();
        let new_bakers = self.cache.dirty_bakers().filter(|b| b.is_new).count() as u32;

        block.n_accounts_seen = seen;
        block.n_new_accounts = new;
        block.n_new_contracts = new_contracts.len() as u32;
        block.n_new_bakers = new_bakers;
        block.n_funded = funded;
        block.n_cleared = cleared;

        let c = &block.counters;
        let chain = &mut block.chain;
        chain.total_accounts += u64::from(new);
        chain.total_contracts += new_contracts.len() as u64;
        chain.total_implicit += new_contracts.iter().filter(|i| **i).count() as u64;
        chain.total_bakers += u64::from(new_bakers);
        chain.funded_accounts = (chain.funded_accounts + u64::from(funded))
            .saturating_sub(u64::from(cleared));
        chain.total_ops += u64::from(c.n_ops_applied + c.n_ops_failed);
        chain.total_ops_failed += u64::from(c.n_ops_failed);
        chain.total_events += u64::from(c.n_events);
        chain.total_endorsements += u64::from(c.n_endorsements);

        let burned_address: i64 = block
            .ops
            .iter()
            .filter(|o| o.is_burn && o.is_success)
            .map(|o| o.volume)
            .sum();
        let flows: Vec<&Flow> = block.flows.iter().map(|f| &**f).collect();
        block
            .supply
            .update(&flows, block.counters.activated_supply, burned_address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MockNode};
    use crate::rpc::{
        BalanceUpdate, RawOpBody, RawOperation, UpdateCategory, UpdateKind,
        UpdateOrigin, BURN_ADDRESS,
    };
    use chainetl_storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        node: MockNode,
        indexer: Indexer<MemoryStore>,
        builder: BlockBuilder,
        token: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                node: MockNode::new(mock::constants()),
                indexer: Indexer::new(Arc::new(MemoryStore::new())),
                builder: BlockBuilder::new(BlockPools::new(2, 64, 64), true),
                token: CancellationToken::new(),
            }
        }

        async fn build(&self, raw: &RawBlock) -> Result<BuiltBlock, IndexerError> {
            let parent = match raw.height {
                0 => None,
                h => self.indexer.block(h - 1).await.unwrap(),
            };
            self.builder
                .build(raw, parent.as_ref(), &self.node, &self.indexer)
                .await
        }

        async fn apply(&self, raw: &RawBlock) -> Block {
            let built = self.build(raw).await.unwrap();
            self.indexer.commit(built, &self.token).await.unwrap();
            self.indexer.block(raw.height).await.unwrap().unwrap()
        }

        async fn apply_chain(&self, blocks: &[RawBlock]) {
            for raw in blocks {
                self.apply(raw).await;
            }
        }
    }

    #[tokio::test]
    async fn genesis_invoices_mint_supply() {
        let f = Fixture::new();
        let genesis = f.apply(&mock::block("A", 0, "genesis", 12)).await;
        assert_eq!(genesis.version, 11);
        assert_eq!(genesis.counters.minted_supply, mock::ALICE_INVOICE + mock::BAKER_INVOICE);
        assert_eq!(genesis.supply.total, genesis.counters.minted_supply);
        assert_eq!(genesis.counters.n_events, 2);
        assert_eq!(genesis.n_new_accounts, 2);
        assert_eq!(genesis.chain.total_bakers, 1);
        let ops = f.indexer.ops(0).await.unwrap();
        assert!(ops.iter().all(|o| o.op_type == OpType::Invoice));
        let alice = f.indexer.account_id(mock::ALICE).await.unwrap().unwrap();
        let invoice = ops.iter().find(|o| o.sender_id == Some(alice)).unwrap();
        assert_eq!(invoice.reward, mock::ALICE_INVOICE);
        assert_eq!(invoice.receiver_id, None);
        assert_eq!(invoice.volume, 0);
    }

    #[tokio::test]
    async fn updates_for_one_account_and_kind_share_an_event() {
        let f = Fixture::new();
        f.apply_chain(&mock::chain("A", 0, 1)).await;
        let mut raw = mock::block("A", 2, "A1", 12);
        raw.balance_updates.extend([
            BalanceUpdate::contract(mock::BAKER, UpdateCategory::BakingBonuses, 3),
            BalanceUpdate::contract(mock::BAKER, UpdateCategory::BakingBonuses, 4),
        ]);
        f.apply(&raw).await;

        let baker = f.indexer.account_id(mock::BAKER).await.unwrap().unwrap();
        let ops = f.indexer.ops(2).await.unwrap();
        let bonuses: Vec<_> = ops.iter().filter(|o| o.op_type == OpType::Bonus).collect();
        assert_eq!(bonuses.len(), 1);
        assert_eq!(bonuses[0].reward, 7);
        assert_eq!(bonuses[0].sender_id, Some(baker));
        let flows = f.indexer.flows(2).await.unwrap();
        assert_eq!(flows.iter().filter(|fl| fl.op_n == bonuses[0].op_n).count(), 2);
    }

    #[tokio::test]
    async fn unfreeze_collects_every_freezer_category() {
        let f = Fixture::new();
        f.apply_chain(&mock::chain("A", 0, 1)).await;
        let mut raw = mock::block("A", 2, "A1", 11);
        raw.balance_updates.extend([
            BalanceUpdate::freezer(mock::BAKER, UpdateCategory::Deposits, -40),
            BalanceUpdate::freezer(mock::BAKER, UpdateCategory::Rewards, -5),
            BalanceUpdate::freezer(mock::BAKER, UpdateCategory::Fees, -2),
            BalanceUpdate::contract(mock::BAKER, UpdateCategory::None, 47),
        ]);
        let b = f.apply(&raw).await;

        let ops = f.indexer.ops(2).await.unwrap();
        let unfreezes: Vec<_> = ops.iter().filter(|o| o.op_type == OpType::Unfreeze).collect();
        assert_eq!(unfreezes.len(), 1);
        let op = unfreezes[0];
        assert_eq!((op.deposit, op.reward, op.fee), (40, 5, 2));
        assert_eq!(op.volume, 0);
        assert_eq!(b.supply.frozen_deposits, 2 * mock::DEPOSIT - 40);
    }

    #[tokio::test]
    async fn invoices_before_version_9_are_flows_only() {
        let f = Fixture::new();
        let genesis = f.apply(&mock::block("A", 0, "genesis", 8)).await;
        assert_eq!(genesis.counters.minted_supply, 0);
        assert_eq!(genesis.counters.n_events, 0);
        assert_eq!(f.indexer.ops(0).await.unwrap().len(), 0);
        assert_eq!(genesis.supply.total, 0);
        let alice = f.indexer.account(mock::ALICE).await.unwrap().unwrap();
        assert_eq!(alice.balance, mock::ALICE_INVOICE);
    }

    #[tokio::test]
    async fn regular_block_ops_and_events() {
        let f = Fixture::new();
        f.apply_chain(&mock::chain("A", 0, 2)).await;
        let b = f.indexer.block(2).await.unwrap().unwrap();
        let ops = f.indexer.ops(2).await.unwrap();
        let types: Vec<_> = ops.iter().map(|o| o.op_type).collect();
        assert_eq!(
            types,
            vec![OpType::Endorsement, OpType::Transaction, OpType::Bake, OpType::Deposit]
        );
        let bake = &ops[2];
        assert_eq!(bake.reward, mock::BAKING_REWARD);
        assert_eq!(bake.fee, mock::FEE);
        assert_eq!(ops[3].deposit, mock::DEPOSIT);
        assert_eq!(b.counters.n_ops_applied, 2);
        assert_eq!(b.counters.n_events, 2);
        assert_eq!(b.counters.minted_supply, mock::BAKING_REWARD);
        assert_eq!(b.parent_slots_endorsed, None);

        let parent = f.indexer.block(1).await.unwrap().unwrap();
        assert_eq!(parent.n_slots_endorsed, mock::SLOTS);
        assert_eq!(
            b.supply.total,
            parent.supply.total + mock::BAKING_REWARD
        );
        assert_eq!(b.supply.frozen_deposits, 2 * mock::DEPOSIT);
    }

    #[tokio::test]
    async fn rights_fetched_with_quirky_lookahead() {
        let f = Fixture::new();
        let blocks = mock::chain("A", 0, 13);
        f.node.push_chain(blocks.clone());
        for raw in &blocks {
            let built = f.build(raw).await.unwrap();
            let expect = match raw.height {
                9 | 13 => mock::constants().blocks_per_cycle as usize,
                _ => 0,
            };
            assert_eq!(built.rights.len(), expect, "height {}", raw.height);
            f.indexer.commit(built, &f.token).await.unwrap();
        }
        assert_eq!(f.node.rights_requests(), vec![(9, 4), (13, 5)]);
    }

    #[tokio::test]
    async fn burn_address_transfer() {
        let f = Fixture::new();
        f.apply_chain(&mock::chain("A", 0, 1)).await;
        let mut raw = mock::block("A", 2, "A1", 12);
        raw.operations[3] = vec![mock::transfer("oburn", mock::ALICE, BURN_ADDRESS, 500)];
        let b = f.apply(&raw).await;
        let tx = f
            .indexer
            .ops(2)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.op_type == OpType::Transaction)
            .unwrap();
        assert!(tx.is_burn);
        assert_eq!(tx.burned, 0);
        assert_eq!(b.counters.burned_supply, 500);
        assert_eq!(b.supply.burned_address, 500);
        let flows = f.indexer.flows(2).await.unwrap();
        let burn_id = f.indexer.account_id(BURN_ADDRESS).await.unwrap().unwrap();
        assert!(flows.iter().all(|fl| fl.account_id != burn_id));
    }

    #[tokio::test]
    async fn double_baking_evidence_burns_and_mints() {
        let f = Fixture::new();
        f.apply_chain(&mock::chain("A", 0, 1)).await;
        let mut raw = mock::block("A", 2, "A1", 12);
        raw.operations[2] = vec![RawOperation {
            hash: "oevidence".into(),
            body: RawOpBody::DoubleBakingEvidence {
                offender: mock::ALICE.into(),
                balance_updates: vec![
                    BalanceUpdate::contract(mock::ALICE, UpdateCategory::Punishments, -100),
                    BalanceUpdate::sink(UpdateKind::Burned, UpdateCategory::Punishments, 100),
                    BalanceUpdate::sink(UpdateKind::Minted, UpdateCategory::DoubleSigningRewards, -40),
                    BalanceUpdate::contract(mock::BAKER, UpdateCategory::DoubleSigningRewards, 40),
                ],
            },
        }];
        let b = f.apply(&raw).await;
        let ev = f
            .indexer
            .ops(2)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.op_type == OpType::DoubleBaking)
            .unwrap();
        assert_eq!(ev.burned, 60);
        assert_eq!(b.supply.burned_double_signing, 100);
        assert_eq!(b.counters.minted_supply - b.counters.burned_supply, mock::BAKING_REWARD - 60);
    }

    #[tokio::test]
    async fn implicit_origination_registers_contract() {
        let f = Fixture::new();
        f.apply_chain(&mock::chain("A", 0, 1)).await;
        let mut raw = mock::block("A", 2, "A1", 12);
        raw.implicit_results.push(mock::implicit_origination(mock::LB, None));
        f.node.add_script(mock::LB, mock::script());
        f.apply(&raw).await;

        let id = f.indexer.account_id(mock::LB).await.unwrap().unwrap();
        let (code_hash, _) = f.indexer.contract_type(id).await.unwrap().unwrap();
        assert_eq!(code_hash, mock::script().code_hash());
        let ops = f.indexer.ops(2).await.unwrap();
        let orig = ops.iter().find(|o| o.op_type == OpType::Origination).unwrap();
        assert_eq!(orig.list, OpList::BlockHeader);
        assert_eq!(orig.bigmap_events.len(), 1);
        assert_eq!(f.indexer.bigmaps(2).await.unwrap().len(), 1);

        let parent = f.indexer.block(1).await.unwrap().unwrap();
        let b = f.indexer.block(2).await.unwrap().unwrap();
        assert_eq!(b.n_new_accounts, 0);
        assert_eq!(b.n_new_contracts, 1);
        assert_eq!(b.chain.total_accounts, parent.chain.total_accounts);
        assert_eq!(b.chain.total_contracts, parent.chain.total_contracts + 1);
    }

    #[tokio::test]
    async fn implicit_origination_with_malformed_script_fails() {
        let f = Fixture::new();
        f.apply_chain(&mock::chain("A", 0, 1)).await;
        let mut raw = mock::block("A", 2, "A1", 12);
        let mut bad = mock::script();
        bad.code = json!({ "prim": "parameter" });
        raw.implicit_results
            .push(mock::implicit_origination(mock::LB, Some(bad)));
        let err = f.build(&raw).await.unwrap_err();
        assert!(matches!(err, IndexerError::MalformedScript { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn subsidy_requires_known_contract() {
        let f = Fixture::new();
        f.apply_chain(&mock::chain("A", 0, 1)).await;
        let mut raw = mock::block("A", 2, "A1", 12);
        raw.implicit_results.push(mock::subsidy(mock::LB, 25));
        let err = f.build(&raw).await.unwrap_err();
        assert!(matches!(err, IndexerError::MissingContract { .. }));
    }

    #[tokio::test]
    async fn subsidy_mints_to_contract() {
        let f = Fixture::new();
        f.apply_chain(&mock::chain("A", 0, 1)).await;
        f.node.add_script(mock::LB, mock::script());
        let mut raw = mock::block("A", 2, "A1", 12);
        raw.implicit_results.push(mock::implicit_origination(mock::LB, None));
        f.apply(&raw).await;

        let mut raw = mock::block("A", 3, "A2", 12);
        raw.implicit_results.push(mock::subsidy(mock::LB, 25));
        let b = f.apply(&raw).await;
        assert_eq!(b.counters.minted_supply, mock::BAKING_REWARD + 25);
        assert_eq!(b.supply.minted_airdrop, mock::ALICE_INVOICE + mock::BAKER_INVOICE + 25);
        let sub = f
            .indexer
            .ops(3)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.op_type == OpType::Subsidy)
            .unwrap();
        assert_eq!(sub.reward, 25);
        assert!(sub.is_storage_update);
    }

    #[tokio::test]
    async fn missing_constants() {
        let f = Fixture::new();
        f.node.drop_constants();
        let err = f.build(&mock::block("A", 0, "genesis", 12)).await.unwrap_err();
        assert!(matches!(err, IndexerError::MissingConstants { height: 0 }));
    }

    #[tokio::test]
    async fn failed_build_returns_pooled_objects() {
        let f = Fixture::new();
        f.apply_chain(&mock::chain("A", 0, 1)).await;
        let mut raw = mock::block("A", 2, "A1", 12);
        raw.implicit_results.push(mock::subsidy(mock::LB, 25));
        assert!(f.build(&raw).await.is_err());
        assert!(f.builder.pools().blocks.idle() >= 1);
        assert!(f.builder.pools().ops.idle() > 0);
    }

    #[tokio::test]
    async fn rejects_block_not_extending_parent() {
        let f = Fixture::new();
        f.apply_chain(&mock::chain("A", 0, 1)).await;
        let err = f.build(&mock::block("B", 2, "B1", 12)).await.unwrap_err();
        assert!(matches!(err, IndexerError::Invariant { height: 2, .. }));
    }

    #[tokio::test]
    async fn subsidy_origin_updates_are_ignored() {
        let f = Fixture::new();
        f.apply_chain(&mock::chain("A", 0, 1)).await;
        let mut raw = mock::block("A", 2, "A1", 12);
        raw.balance_updates.push(
            BalanceUpdate::contract(mock::ALICE, UpdateCategory::Subsidy, 7)
                .with_origin(UpdateOrigin::Subsidy),
        );
        let b = f.apply(&raw).await;
        assert_eq!(b.counters.minted_supply, mock::BAKING_REWARD);
    }
}
