//! Write-back cache of per-slot account batches that have not been flushed
//! into an account file yet.

use {
    sable_sdk::{account::Account, clock::Slot, pubkey::Pubkey},
    std::{
        collections::HashMap,
        sync::{Arc, RwLock},
    },
};

/// One slot's committed batch. Immutable once inserted; the index refers
/// into it by position.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotCache {
    pubkeys: Vec<Pubkey>,
    accounts: Vec<Account>,
}

impl SlotCache {
    pub fn len(&self) -> usize {
        self.pubkeys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pubkeys.is_empty()
    }

    pub fn pubkeys(&self) -> &[Pubkey] {
        &self.pubkeys
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn get(&self, index: usize) -> Option<(&Pubkey, &Account)> {
        Some((self.pubkeys.get(index)?, self.accounts.get(index)?))
    }
}

/// Slot-keyed map of un-flushed batches. A slot lives either here or in the
/// file map, never both; flush performs the hand-off.
#[derive(Debug, Default)]
pub struct AccountsCache {
    cache: RwLock<HashMap<Slot, Arc<SlotCache>>>,
}

impl AccountsCache {
    /// Insert a whole batch. Double-caching a slot means a writer skipped
    /// the purge step and the index would end up with duplicate
    /// `(pubkey, slot)` nodes, so it is fatal.
    pub fn put_batch(
        &self,
        slot: Slot,
        pubkeys: Vec<Pubkey>,
        accounts: Vec<Account>,
    ) -> Arc<SlotCache> {
        assert_eq!(pubkeys.len(), accounts.len());
        let slot_cache = Arc::new(SlotCache { pubkeys, accounts });
        let mut cache = self.cache.write().unwrap();
        let previous = cache.insert(slot, slot_cache.clone());
        assert!(
            previous.is_none(),
            "slot {slot} is already cached; purge it before re-writing",
        );
        slot_cache
    }

    pub fn slot_cache(&self, slot: Slot) -> Option<Arc<SlotCache>> {
        self.cache.read().unwrap().get(&slot).cloned()
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.cache.read().unwrap().contains_key(&slot)
    }

    /// Atomically take the slot's batch out of the cache (flush or purge).
    pub fn remove_slot(&self, slot: Slot) -> Option<Arc<SlotCache>> {
        self.cache.write().unwrap().remove(&slot)
    }

    pub fn cached_slots(&self) -> Vec<Slot> {
        self.cache.read().unwrap().keys().copied().collect()
    }

    pub fn num_slots(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().unwrap().is_empty()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn batch(n: usize) -> (Vec<Pubkey>, Vec<Account>) {
        let pubkeys: Vec<_> = (0..n).map(|_| Pubkey::new_unique()).collect();
        let accounts: Vec<_> = (0..n)
            .map(|i| Account::new(i as u64 + 1, i, &Pubkey::default()))
            .collect();
        (pubkeys, accounts)
    }

    #[test]
    fn test_put_and_read() {
        let cache = AccountsCache::default();
        let (pubkeys, accounts) = batch(3);
        cache.put_batch(200, pubkeys.clone(), accounts.clone());

        let slot_cache = cache.slot_cache(200).unwrap();
        assert_eq!(slot_cache.len(), 3);
        for i in 0..3 {
            let (pubkey, account) = slot_cache.get(i).unwrap();
            assert_eq!(pubkey, &pubkeys[i]);
            assert_eq!(account, &accounts[i]);
        }
        assert!(slot_cache.get(3).is_none());
        assert_eq!(cache.cached_slots(), vec![200]);
    }

    #[test]
    fn test_remove_slot_is_take() {
        let cache = AccountsCache::default();
        let (pubkeys, accounts) = batch(2);
        cache.put_batch(7, pubkeys, accounts);

        let taken = cache.remove_slot(7).unwrap();
        assert_eq!(taken.len(), 2);
        assert!(cache.remove_slot(7).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    #[should_panic(expected = "already cached")]
    fn test_double_cache_panics() {
        let cache = AccountsCache::default();
        let (pubkeys, accounts) = batch(1);
        cache.put_batch(7, pubkeys.clone(), accounts.clone());
        cache.put_batch(7, pubkeys, accounts);
    }
}
