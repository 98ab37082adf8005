//! The file map: the authoritative mapping from file id to the open
//! account file holding one flushed slot, together with that file's
//! liveness counters.
//!
//! Readers take the map's lock just long enough to clone out the entry,
//! then hold the per-file lock for the duration of the access. Clean,
//! shrink, and delete take a per-file write lock only while they adjust
//! counters or retire the file.

use {
    crate::append_vec::{AppendVec, AppendVecError},
    sable_sdk::clock::Slot,
    std::{
        collections::HashMap,
        path::Path,
        sync::{Arc, RwLock},
    },
};

pub type FileId = usize;

/// An account file and its liveness bookkeeping.
#[derive(Debug)]
pub struct AccountStorageEntry {
    id: FileId,
    slot: Slot,
    accounts: AppendVec,
    /// records whose index node is still live
    count: usize,
    /// records written into the file, ever
    num_accounts: usize,
    alive_bytes: usize,
    dead_bytes: usize,
}

impl AccountStorageEntry {
    /// Create the backing file for a flush, sized exactly for the batch.
    pub fn new(accounts_dir: &Path, slot: Slot, id: FileId, size: usize) -> Self {
        let path = accounts_dir.join(AppendVec::file_name(slot, id));
        Self {
            id,
            slot,
            accounts: AppendVec::new(&path, size),
            count: 0,
            num_accounts: 0,
            alive_bytes: 0,
            dead_bytes: 0,
        }
    }

    /// Adopt an already-written file (snapshot load), scanning it once to
    /// populate the record count and alive bytes.
    pub fn new_existing(
        slot: Slot,
        id: FileId,
        accounts: AppendVec,
    ) -> Result<Self, AppendVecError> {
        let num_accounts = accounts.sanitize()?;
        let alive_bytes = accounts.len();
        Ok(Self {
            id,
            slot,
            accounts,
            count: num_accounts,
            num_accounts,
            alive_bytes,
            dead_bytes: 0,
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn accounts(&self) -> &AppendVec {
        &self.accounts
    }

    pub fn accounts_mut(&mut self) -> &mut AppendVec {
        &mut self.accounts
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn num_accounts(&self) -> usize {
        self.num_accounts
    }

    pub fn alive_bytes(&self) -> usize {
        self.alive_bytes
    }

    pub fn dead_bytes(&self) -> usize {
        self.dead_bytes
    }

    pub fn written_bytes(&self) -> usize {
        self.accounts.len()
    }

    /// Record-count and byte bookkeeping after the flush appended the whole
    /// batch.
    pub fn set_metadata_after_flush(&mut self) {
        self.count = self
            .accounts
            .sanitize()
            .expect("file written by flush must validate");
        self.num_accounts = self.count;
        self.alive_bytes = self.accounts.len();
        self.dead_bytes = 0;
    }

    /// A record of `bytes` died (overwritten by a newer rooted version, or
    /// a rooted zero-lamport version).
    pub fn mark_dead(&mut self, bytes: usize) {
        assert!(
            self.count > 0,
            "double remove of account in slot {}/file {}",
            self.slot,
            self.id,
        );
        self.count -= 1;
        self.alive_bytes -= bytes;
        self.dead_bytes += bytes;
        debug_assert!(self.alive_bytes + self.dead_bytes <= self.accounts.capacity() as usize);
    }

    /// Every record is dead; the file can be deleted outright.
    pub fn is_dead(&self) -> bool {
        self.count == 0
    }

    /// Integer percentage of written bytes now dead.
    pub fn dead_ratio_percent(&self) -> usize {
        let len = self.written_bytes().max(1);
        self.dead_bytes * 100 / len
    }
}

/// Map from file id to the open account file.
#[derive(Debug, Default)]
pub struct AccountStorageMap {
    map: RwLock<HashMap<FileId, Arc<RwLock<AccountStorageEntry>>>>,
}

impl AccountStorageMap {
    pub fn insert(&self, entry: AccountStorageEntry) -> Arc<RwLock<AccountStorageEntry>> {
        let id = entry.id();
        let entry = Arc::new(RwLock::new(entry));
        let previous = self.map.write().unwrap().insert(id, entry.clone());
        assert!(previous.is_none(), "file id {id} published twice");
        entry
    }

    pub fn get(&self, id: FileId) -> Option<Arc<RwLock<AccountStorageEntry>>> {
        self.map.read().unwrap().get(&id).cloned()
    }

    pub fn contains(&self, id: FileId) -> bool {
        self.map.read().unwrap().contains_key(&id)
    }

    pub fn remove(&self, id: FileId) -> Option<Arc<RwLock<AccountStorageEntry>>> {
        self.map.write().unwrap().remove(&id)
    }

    pub fn ids(&self) -> Vec<FileId> {
        self.map.read().unwrap().keys().copied().collect()
    }

    pub fn entries(&self) -> Vec<(FileId, Arc<RwLock<AccountStorageEntry>>)> {
        self.map
            .read()
            .unwrap()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    /// The file currently holding `slot`, if any. Slots map to at most one
    /// live file outside of the shrink hand-off.
    pub fn find_by_slot(&self, slot: Slot) -> Option<(FileId, Arc<RwLock<AccountStorageEntry>>)> {
        self.map
            .read()
            .unwrap()
            .iter()
            .find(|(_, entry)| entry.read().unwrap().slot() == slot)
            .map(|(id, entry)| (*id, entry.clone()))
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }
}
