//! Per-block identity map of accounts, bakers and contracts.
//!
//! Every derivation step of one block sees the same entity instance for a
//! given address, so mutations made by one step are visible to the next.
//! The cache lives for one build and is flushed into the commit batch.

use std::collections::{BTreeMap, HashMap};

use chainetl_core::error::IndexerError;

use crate::model::{Account, AccountId, Baker, Contract};

/// Dirty entities of one block, sorted by account id.
#[derive(Debug, Default)]
pub struct Dirty {
    pub accounts: Vec<Account>,
    pub bakers: Vec<Baker>,
    pub contracts: Vec<Contract>,
}

#[derive(Debug)]
pub struct AccountCache {
    height: u64,
    next_id: AccountId,
    accounts: BTreeMap<AccountId, Account>,
    by_address: HashMap<String, AccountId>,
    bakers: BTreeMap<AccountId, Baker>,
    contracts: BTreeMap<AccountId, Contract>,
}

impl AccountCache {
    /// Empty cache for the block at `height`; new accounts get ids from
    /// `next_id` upward.
    pub fn new(height: u64, next_id: AccountId) -> Self {
        Self {
            height,
            next_id,
            accounts: BTreeMap::new(),
            by_address: HashMap::new(),
            bakers: BTreeMap::new(),
            contracts: BTreeMap::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Add an account loaded from the index. Ignored if the address is
    /// already cached.
    pub fn insert_loaded(&mut self, mut account: Account, stored_height: u64) {
        if self.by_address.contains_key(&account.address) {
            return;
        }
        account.begin(stored_height);
        self.next_id = self.next_id.max(account.id + 1);
        self.by_address.insert(account.address.clone(), account.id);
        self.accounts.insert(account.id, account);
    }

    pub fn insert_loaded_baker(&mut self, mut baker: Baker, stored_height: u64) {
        baker.begin(stored_height);
        self.bakers.entry(baker.account_id).or_insert(baker);
    }

    pub fn insert_loaded_contract(&mut self, mut contract: Contract, stored_height: u64) {
        contract.begin(stored_height);
        self.contracts.entry(contract.account_id).or_insert(contract);
    }

    pub fn get(&self, address: &str) -> Option<&Account> {
        self.by_address.get(address).and_then(|id| self.accounts.get(id))
    }

    pub fn id_of(&self, address: &str) -> Option<AccountId> {
        self.by_address.get(address).copied()
    }

    /// Resolve a known address or fail with [`IndexerError::MissingAccount`].
    pub fn require(&self, address: &str) -> Result<AccountId, IndexerError> {
        self.id_of(address).ok_or_else(|| IndexerError::MissingAccount {
            address: address.to_string(),
        })
    }

    /// Resolve `address`, creating a new account on first sight.
    pub fn get_or_create(&mut self, address: &str) -> &mut Account {
        let height = self.height;
        let id = match self.by_address.get(address) {
            Some(id) => *id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.by_address.insert(address.to_string(), id);
                self.accounts.insert(id, Account::new(id, address, height));
                id
            }
        };
        self.accounts
            .entry(id)
            .or_insert_with(|| Account::new(id, address, height))
    }

    pub fn account(&self, id: AccountId) -> Option<&Account> {
        self.accounts.get(&id)
    }

    pub fn account_mut(&mut self, id: AccountId) -> Option<&mut Account> {
        self.accounts.get_mut(&id)
    }

    pub fn mark_dirty(&mut self, id: AccountId) {
        if let Some(acc) = self.accounts.get_mut(&id) {
            acc.last_seen = self.height;
            acc.is_dirty = true;
        }
    }

    pub fn baker(&self, id: AccountId) -> Option<&Baker> {
        self.bakers.get(&id)
    }

    pub fn baker_mut(&mut self, id: AccountId) -> Option<&mut Baker> {
        self.bakers.get_mut(&id)
    }

    /// Register `id` as baker unless it already is one.
    pub fn ensure_baker(&mut self, id: AccountId) -> Result<&mut Baker, IndexerError> {
        let height = self.height;
        let acc = self
            .accounts
            .get_mut(&id)
            .ok_or_else(|| IndexerError::MissingAccount {
                address: format!("account #{id}"),
            })?;
        if !acc.is_baker {
            acc.is_baker = true;
            acc.baker_id = Some(id);
            acc.is_dirty = true;
        }
        let baker = self.bakers.entry(id).or_insert_with(|| Baker::new(acc, height));
        if !baker.is_active {
            baker.is_active = true;
            baker.is_dirty = true;
        }
        Ok(baker)
    }

    pub fn contract(&self, id: AccountId) -> Option<&Contract> {
        self.contracts.get(&id)
    }

    pub fn contract_mut(&mut self, id: AccountId) -> Option<&mut Contract> {
        self.contracts.get_mut(&id)
    }

    /// Register a new contract for account `id`. Existing contracts are
    /// returned unchanged.
    pub fn register_contract(
        &mut self,
        id: AccountId,
        creator_id: Option<AccountId>,
    ) -> Result<&mut Contract, IndexerError> {
        let height = self.height;
        let acc = self
            .accounts
            .get_mut(&id)
            .ok_or_else(|| IndexerError::MissingAccount {
                address: format!("account #{id}"),
            })?;
        if acc.creator_id.is_none() && creator_id.is_some() {
            acc.creator_id = creator_id;
            acc.is_dirty = true;
        }
        Ok(self
            .contracts
            .entry(id)
            .or_insert_with(|| Contract::new(acc, creator_id, height)))
    }

    pub fn dirty_accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values().filter(|a| a.is_dirty)
    }

    pub fn dirty_bakers(&self) -> impl Iterator<Item = &Baker> {
        self.bakers.values().filter(|b| b.is_dirty)
    }

    pub fn dirty_contracts(&self) -> impl Iterator<Item = &Contract> {
        self.contracts.values().filter(|c| c.is_dirty)
    }

    /// Take every dirty entity out of the cache.
    pub fn flush(&mut self) -> Dirty {
        fn drain<T>(map: &mut BTreeMap<AccountId, T>, dirty: impl Fn(&T) -> bool) -> Vec<T> {
            let ids: Vec<AccountId> = map
                .iter()
                .filter(|(_, v)| dirty(v))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| map.remove(&id)).collect()
        }
        let accounts = drain(&mut self.accounts, |a: &Account| a.is_dirty);
        for a in &accounts {
            self.by_address.remove(&a.address);
        }
        Dirty {
            accounts,
            bakers: drain(&mut self.bakers, |b: &Baker| b.is_dirty),
            contracts: drain(&mut self.contracts, |c: &Contract| c.is_dirty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_map() {
        let mut cache = AccountCache::new(10, 1);
        let id = cache.get_or_create("tz1alice").id;
        cache.get_or_create("tz1alice").balance += 5;
        assert_eq!(cache.get_or_create("tz1alice").id, id);
        assert_eq!(cache.get("tz1alice").map(|a| a.balance), Some(5));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn ids_continue_after_loaded_accounts() {
        let mut cache = AccountCache::new(10, 1);
        cache.insert_loaded(Account::new(7, "tz1bob", 3), 9);
        let bob = cache.get("tz1bob").unwrap();
        assert!(!bob.is_new && !bob.is_dirty);
        assert_eq!(bob.stored_height, Some(9));
        assert_eq!(cache.get_or_create("tz1carol").id, 8);
    }

    #[test]
    fn require_unknown_address() {
        let cache = AccountCache::new(1, 1);
        assert!(matches!(
            cache.require("tz1nobody"),
            Err(IndexerError::MissingAccount { .. })
        ));
    }

    #[test]
    fn flush_returns_only_dirty_entities_sorted() {
        let mut cache = AccountCache::new(10, 1);
        cache.insert_loaded(Account::new(5, "tz1clean", 1), 4);
        cache.insert_loaded(Account::new(3, "tz1touched", 1), 4);
        cache.get_or_create("tz1new");
        cache.mark_dirty(3);
        cache.ensure_baker(3).unwrap();
        let dirty = cache.flush();
        let ids: Vec<_> = dirty.accounts.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![3, 6]);
        assert_eq!(dirty.bakers.len(), 1);
        assert!(dirty.bakers[0].is_new);
        assert!(cache.get("tz1touched").is_none());
        assert!(cache.get("tz1clean").is_some());
    }

    #[test]
    fn contracts_register_once() {
        let mut cache = AccountCache::new(2, 1);
        let creator = cache.get_or_create("tz1alice").id;
        let kt = cache.get_or_create("KT1abc").id;
        cache.register_contract(kt, Some(creator)).unwrap().code_hash = 42;
        let again = cache.register_contract(kt, None).unwrap();
        assert_eq!(again.code_hash, 42);
        assert_eq!(again.creator_id, Some(creator));
        assert!(cache.register_contract(99, None).is_err());
    }
}
