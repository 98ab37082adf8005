//! The account storage engine.
//!
//! Writers commit per-slot batches into the write-back cache; the
//! maintenance loop flushes rooted slots into immutable account files,
//! then cleans superseded versions out of the index, shrinks files that
//! turned mostly dead, and deletes files with nothing alive left. Readers
//! walk the index to a version node and read through the file map into the
//! mmap'd record, never blocking on maintenance beyond short critical
//! sections.

use {
    crate::{
        account_storage::{AccountStorageEntry, AccountStorageMap, FileId},
        accounts_cache::AccountsCache,
        accounts_hash::{self, HashKind, MERKLE_FANOUT},
        accounts_index::{AccountLocation, AccountRef, AccountsIndex, IndexError},
        append_vec::{aligned_stored_size, StoredMeta},
        disk_allocator::{DiskAllocator, IndexAllocator},
    },
    log::*,
    rayon::{prelude::*, ThreadPool, ThreadPoolBuilder},
    sable_measure::measure::Measure,
    sable_metrics::{datapoint_debug, datapoint_info},
    sable_sdk::{account::Account, clock::Slot, hash::Hash, pubkey::Pubkey},
    serde::de::DeserializeOwned,
    std::{
        collections::{HashMap, HashSet},
        fs, io,
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
            Arc, Mutex,
        },
    },
    tempfile::TempDir,
    thiserror::Error,
};

/// Queue a file for shrink once this percentage of its bytes is dead.
pub const ACCOUNT_FILE_SHRINK_THRESHOLD: usize = 70;

pub const DEFAULT_NUMBER_OF_INDEX_SHARDS: usize = 8192;
pub const DEFAULT_ACCOUNTS_PER_FILE_ESTIMATE: usize = 1500;
pub const DEFAULT_MAX_FLUSH_SLOTS_PER_ITER: usize = 32;

/// How often a read re-walks the chain after losing a race with
/// maintenance before giving up.
const LOAD_RETRIES: usize = 5;

#[derive(Error, Debug)]
pub enum AccountsDbError {
    #[error("pubkey is not in the index")]
    PubkeyNotInIndex,

    #[error("slot {0} not found")]
    SlotNotFound(Slot),

    #[error("account file {0} not found")]
    FileIdNotFound(FileId),

    #[error("account file has no record at the referenced offset")]
    AccountFileEmpty,

    #[error("reference memory not found")]
    MemoryNotFound,

    #[error("out of reference memory")]
    OutOfReferenceMemory,

    #[error("failed to deserialize account data: {0}")]
    Deserialize(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<IndexError> for AccountsDbError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::MemoryNotFound => Self::MemoryNotFound,
            IndexError::OutOfReferenceMemory => Self::OutOfReferenceMemory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountsDbConfig {
    /// Where account files live; a temp dir when unset (tests, benches).
    pub accounts_dir: Option<PathBuf>,
    /// Power of two <= 2^24.
    pub number_of_index_shards: usize,
    /// Back index bins and reference arenas with allocator files instead of
    /// anonymous memory.
    pub use_disk_index: bool,
    /// Base path for the disk allocator's files; defaults to a sibling of
    /// the accounts dir.
    pub index_dir: Option<PathBuf>,
    /// 0 means one per core.
    pub num_threads_snapshot_load: usize,
    /// 0 means half the cores.
    pub num_threads_snapshot_unpack: usize,
    /// Sizing multiplier for snapshot-load worker arenas.
    pub accounts_per_file_estimate: usize,
    /// Load only the manifest, skipping account-file ingest.
    pub snapshot_metadata_only: bool,
    /// Persist the index at teardown for the next run.
    pub save_index: bool,
    /// Rebuild the index from the previous run's sidecar instead of
    /// re-parsing account files.
    pub fastload: bool,
    pub max_flush_slots_per_iter: usize,
    /// Percent of dead bytes that queues a file for shrink.
    pub shrink_ratio: usize,
}

impl Default for AccountsDbConfig {
    fn default() -> Self {
        Self {
            accounts_dir: None,
            number_of_index_shards: DEFAULT_NUMBER_OF_INDEX_SHARDS,
            use_disk_index: false,
            index_dir: None,
            num_threads_snapshot_load: 0,
            num_threads_snapshot_unpack: 0,
            accounts_per_file_estimate: DEFAULT_ACCOUNTS_PER_FILE_ESTIMATE,
            snapshot_metadata_only: false,
            save_index: false,
            fastload: false,
            max_flush_slots_per_iter: DEFAULT_MAX_FLUSH_SLOTS_PER_ITER,
            shrink_ratio: ACCOUNT_FILE_SHRINK_THRESHOLD,
        }
    }
}

/// What clean found and removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanResult {
    /// rooted versions superseded by a newer rooted version
    pub old_states: usize,
    /// latest rooted versions holding zero lamports
    pub zero_lamport_states: usize,
}

/// The last full snapshot this engine took or loaded. Incremental
/// snapshots embed these values; they cannot be recomputed later because
/// clean reclaims superseded versions below the base slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullSnapshotInfo {
    pub slot: Slot,
    pub hash: Hash,
    pub capitalization: u64,
}

#[derive(Debug)]
pub struct AccountsDb {
    pub accounts_index: AccountsIndex,
    pub storage: AccountStorageMap,
    pub accounts_cache: AccountsCache,

    accounts_dir: PathBuf,
    /// keeps test/bench dirs alive for the engine's lifetime
    _temp_accounts_dir: Option<TempDir>,
    disk_allocator: Option<Arc<DiskAllocator>>,
    index_allocator: IndexAllocator,

    /// distribute ids across newly created account files
    next_id: AtomicUsize,
    /// global order of stores across the engine's lifetime
    write_version: AtomicU64,
    /// largest root the consensus collaborator reported; never decreases
    largest_rooted_slot: AtomicU64,

    /// freshly flushed files awaiting their first clean
    unclean_files: Mutex<Vec<FileId>>,
    shrink_candidates: Mutex<HashSet<FileId>>,
    delete_candidates: Mutex<HashSet<FileId>>,

    /// base the next incremental snapshot builds on
    latest_full_snapshot: Mutex<Option<FullSnapshotInfo>>,

    /// Thread pool for snapshot load and hashing par_iters
    pub thread_pool: ThreadPool,

    config: AccountsDbConfig,
}

impl AccountsDb {
    pub fn new(config: AccountsDbConfig) -> io::Result<Self> {
        let (accounts_dir, temp_accounts_dir) = match &config.accounts_dir {
            Some(dir) => (dir.clone(), None),
            None => {
                let temp = TempDir::new()?;
                (temp.path().join("accounts"), Some(temp))
            }
        };
        fs::create_dir_all(&accounts_dir)?;

        let (disk_allocator, index_allocator) = if config.use_disk_index {
            let base = config
                .index_dir
                .clone()
                .unwrap_or_else(|| accounts_dir.with_extension("index"))
                .join("index");
            let allocator = Arc::new(DiskAllocator::new(base)?);
            (Some(allocator.clone()), IndexAllocator::Disk(allocator))
        } else {
            (None, IndexAllocator::Heap)
        };

        let accounts_index =
            AccountsIndex::new(config.number_of_index_shards, index_allocator.clone())?;

        let num_threads = match config.num_threads_snapshot_load {
            0 => num_cpus::get(),
            n => n,
        };
        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("sabAccountsDb{i:02}"))
            .build()
            .expect("new rayon threadpool");

        Ok(Self {
            accounts_index,
            storage: AccountStorageMap::default(),
            accounts_cache: AccountsCache::default(),
            accounts_dir,
            _temp_accounts_dir: temp_accounts_dir,
            disk_allocator,
            index_allocator,
            next_id: AtomicUsize::new(0),
            write_version: AtomicU64::new(0),
            largest_rooted_slot: AtomicU64::new(0),
            unclean_files: Mutex::new(vec![]),
            shrink_candidates: Mutex::new(HashSet::new()),
            delete_candidates: Mutex::new(HashSet::new()),
            latest_full_snapshot: Mutex::new(None),
            thread_pool,
            config,
        })
    }

    pub fn new_for_tests(number_of_index_shards: usize) -> Self {
        Self::new(AccountsDbConfig {
            number_of_index_shards,
            num_threads_snapshot_load: 2,
            ..AccountsDbConfig::default()
        })
        .unwrap()
    }

    pub fn config(&self) -> &AccountsDbConfig {
        &self.config
    }

    pub fn accounts_dir(&self) -> &Path {
        &self.accounts_dir
    }

    pub fn index_allocator(&self) -> IndexAllocator {
        self.index_allocator.clone()
    }

    pub fn write_version(&self) -> u64 {
        self.write_version.load(Ordering::Acquire)
    }

    pub fn set_write_version(&self, write_version: u64) {
        self.write_version.store(write_version, Ordering::Release);
    }

    fn next_write_version(&self) -> u64 {
        self.write_version.fetch_add(1, Ordering::AcqRel)
    }

    pub fn next_file_id(&self) -> FileId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn latest_full_snapshot(&self) -> Option<FullSnapshotInfo> {
        *self.latest_full_snapshot.lock().unwrap()
    }

    pub fn set_latest_full_snapshot(&self, info: FullSnapshotInfo) {
        *self.latest_full_snapshot.lock().unwrap() = Some(info);
    }

    /// Record consensus finalizing `slot`. Roots only move forward.
    pub fn add_root(&self, slot: Slot) {
        self.largest_rooted_slot.fetch_max(slot, Ordering::SeqCst);
    }

    pub fn largest_rooted_slot(&self) -> Slot {
        self.largest_rooted_slot.load(Ordering::SeqCst)
    }

    /// Publish a storage entry rebuilt by the snapshot loader, keeping the
    /// id counter ahead of every adopted file.
    pub fn publish_storage(&self, entry: AccountStorageEntry) {
        let id = entry.id();
        self.storage.insert(entry);
        self.next_id.fetch_max(id + 1, Ordering::Relaxed);
    }

    /// Commit one slot's write batch. The batch lands in the cache first,
    /// then every account gets a version node, so a pubkey visible in the
    /// index always resolves.
    pub fn put_batch(
        &self,
        slot: Slot,
        pubkeys: Vec<Pubkey>,
        accounts: Vec<Account>,
    ) -> io::Result<()> {
        assert_eq!(pubkeys.len(), accounts.len());
        assert!(!pubkeys.is_empty(), "empty batch for slot {slot}");

        let slot_cache = self.accounts_cache.put_batch(slot, pubkeys, accounts);
        let block = self
            .accounts_index
            .alloc_reference_block(slot, slot_cache.len())?;
        for (index, pubkey) in slot_cache.pubkeys().iter().enumerate() {
            let node = AccountRef::new(*pubkey, slot, AccountLocation::Cache { index });
            let ptr = self
                .accounts_index
                .push_ref(block, node)
                .expect("reference block was sized for the whole batch");
            self.accounts_index.index_ref(ptr);
        }
        Ok(())
    }

    /// The latest version of the account.
    pub fn get_account(&self, pubkey: &Pubkey) -> Result<Account, AccountsDbError> {
        self.get_account_with_bounds(pubkey, None, None)
    }

    /// The version with the greatest slot in `(min_exclusive,
    /// max_inclusive]` (historical reads).
    pub fn get_account_with_bounds(
        &self,
        pubkey: &Pubkey,
        min_exclusive: Option<Slot>,
        max_inclusive: Option<Slot>,
    ) -> Result<Account, AccountsDbError> {
        let mut result = Err(AccountsDbError::PubkeyNotInIndex);
        for _ in 0..LOAD_RETRIES {
            let node = self
                .accounts_index
                .latest_reference_in_bounds(pubkey, min_exclusive, max_inclusive)
                .ok_or(AccountsDbError::PubkeyNotInIndex)?;
            result = self.load_account(&node);
            match &result {
                Ok(_) => return result,
                // the location moved while it was being resolved (flush or
                // shrink published a new home); the chain has the fresh one
                Err(
                    AccountsDbError::FileIdNotFound(_)
                    | AccountsDbError::AccountFileEmpty
                    | AccountsDbError::SlotNotFound(_),
                ) => continue,
                Err(_) => return result,
            }
        }
        result
    }

    /// `get_account`, then deserialize the account's data with the
    /// system's binary codec.
    pub fn get_account_typed<T: DeserializeOwned>(
        &self,
        pubkey: &Pubkey,
    ) -> Result<T, AccountsDbError> {
        let account = self.get_account(pubkey)?;
        Ok(bincode::deserialize(&account.data)?)
    }

    fn load_account(&self, node: &AccountRef) -> Result<Account, AccountsDbError> {
        match node.location {
            AccountLocation::Cache { index } => {
                let slot_cache = self
                    .accounts_cache
                    .slot_cache(node.slot)
                    .ok_or(AccountsDbError::SlotNotFound(node.slot))?;
                let (_, account) = slot_cache
                    .get(index)
                    .expect("cached batches are immutable; the index position is valid");
                Ok(account.clone())
            }
            AccountLocation::File { file_id, offset } => {
                let entry = self
                    .storage
                    .get(file_id)
                    .ok_or(AccountsDbError::FileIdNotFound(file_id))?;
                let entry = entry.read().unwrap();
                let (stored, _) = entry
                    .accounts()
                    .get_account(offset)
                    .ok_or(AccountsDbError::AccountFileEmpty)?;
                Ok(stored.clone_account())
            }
        }
    }

    fn node_lamports_and_hash(&self, node: &AccountRef) -> Option<(u64, Hash)> {
        match node.location {
            AccountLocation::Cache { index } => {
                let slot_cache = self.accounts_cache.slot_cache(node.slot)?;
                let (pubkey, account) = slot_cache.get(index)?;
                Some((account.lamports, accounts_hash::hash_account(account, pubkey)))
            }
            AccountLocation::File { file_id, offset } => {
                let entry = self.storage.get(file_id)?;
                let entry = entry.read().unwrap();
                let (stored, _) = entry.accounts().get_account(offset)?;
                let lamports = stored.lamports();
                let mut hash = *stored.hash;
                if hash == Hash::default() && lamports != 0 {
                    hash = accounts_hash::hash_account_data(
                        lamports,
                        &stored.account_meta.owner,
                        stored.account_meta.executable,
                        stored.account_meta.rent_epoch,
                        stored.data,
                        stored.pubkey(),
                    );
                }
                Some((lamports, hash))
            }
        }
    }

    /// Move one cached slot into a new account file. Whole-slot: either
    /// every account lands in the file and the index points at it, or the
    /// process dies. Losing a rooted slot's writes is unrecoverable.
    pub fn flush_slot(&self, slot: Slot) -> FileId {
        let mut time = Measure::start("flush_slot");
        let slot_cache = self
            .accounts_cache
            .slot_cache(slot)
            .unwrap_or_else(|| panic!("flush of slot {slot} which is not cached"));

        let total_size: usize = slot_cache
            .accounts()
            .iter()
            .map(|account| aligned_stored_size(account.data.len()))
            .sum();

        let id = self.next_file_id();
        let mut entry = AccountStorageEntry::new(&self.accounts_dir, slot, id, total_size);
        let mut offsets = Vec::with_capacity(slot_cache.len());
        for (pubkey, account) in slot_cache.pubkeys().iter().zip(slot_cache.accounts()) {
            let meta = StoredMeta {
                write_version: self.next_write_version(),
                data_len: account.data.len() as u64,
                pubkey: *pubkey,
            };
            let hash = accounts_hash::hash_account(account, pubkey);
            let offset = entry
                .accounts()
                .append_account(meta, account, hash)
                .unwrap_or_else(|| panic!("flush of slot {slot} overflowed its account file"));
            offsets.push(offset);
        }
        entry.set_metadata_after_flush();
        entry
            .accounts()
            .flush()
            .unwrap_or_else(|err| panic!("flush of slot {slot} failed to sync: {err}"));

        // Publish the file before repointing the index so a reader that
        // sees a file location always finds the file; drop the cache entry
        // last so the in-between reads still resolve.
        self.storage.insert(entry);
        for (pubkey, offset) in slot_cache.pubkeys().iter().zip(offsets) {
            let moved = self.accounts_index.set_location(
                pubkey,
                slot,
                AccountLocation::File {
                    file_id: id,
                    offset,
                },
            );
            assert!(moved, "flushed account {pubkey} lost its index node");
        }
        assert!(self.accounts_cache.remove_slot(slot).is_some());

        self.unclean_files.lock().unwrap().push(id);
        time.stop();
        datapoint_debug!(
            "flush_slot",
            ("slot", slot, i64),
            ("accounts", slot_cache.len(), i64),
            ("bytes", total_size, i64),
            ("time_us", time.as_us(), i64),
        );
        id
    }

    /// Remove a cache-only slot wholesale: batch, version nodes, and arena.
    /// Purging a flushed slot would tear rooted history and is fatal.
    pub fn purge_slot(&self, slot: Slot) {
        let slot_cache = self
            .accounts_cache
            .remove_slot(slot)
            .unwrap_or_else(|| panic!("purge of slot {slot} which is not cached"));
        for pubkey in slot_cache.pubkeys() {
            self.accounts_index.remove_reference(pubkey, slot);
        }
        self.accounts_index.free_reference_block(slot);
    }

    /// Walk the unclean files' records and drop version nodes that a newer
    /// rooted version supersedes, plus latest rooted versions that hold
    /// zero lamports. Dead bytes accrue on whichever file holds each dead
    /// record; files that cross the shrink threshold (or die entirely) are
    /// queued for shrink (or delete).
    pub fn clean_account_files(&self, max_clean_root: Option<Slot>) -> CleanResult {
        let largest_rooted = self.largest_rooted_slot();
        let rooted = max_clean_root.map_or(largest_rooted, |root| root.min(largest_rooted));

        let unclean: Vec<FileId> = std::mem::take(&mut *self.unclean_files.lock().unwrap());
        if unclean.is_empty() {
            return CleanResult::default();
        }

        let mut scan = Measure::start("clean_scan");
        let mut result = CleanResult::default();
        let mut touched: HashSet<FileId> = HashSet::new();

        // A zero-lamport version newer than the last full snapshot must
        // survive: the next incremental snapshot reports the deletion as a
        // blake3(pubkey) contribution, and a rebuilt engine would find the
        // record in the archived files anyway.
        let zero_lamport_clean_ceiling = self
            .latest_full_snapshot()
            .map_or(Slot::MAX, |info| info.slot);

        for file_id in &unclean {
            let Some(entry) = self.storage.get(*file_id) else {
                // deleted while queued; nothing left to clean
                continue;
            };
            touched.insert(*file_id);
            let pubkeys: Vec<Pubkey> = {
                let entry = entry.read().unwrap();
                entry
                    .accounts()
                    .account_iter()
                    .map(|stored| *stored.pubkey())
                    .collect()
            };

            for pubkey in pubkeys {
                let chain = self.accounts_index.collect_chain(&pubkey);
                let Some(latest_rooted) = chain
                    .iter()
                    .filter(|node| node.slot <= rooted)
                    .map(|node| node.slot)
                    .max()
                else {
                    continue;
                };

                for node in chain {
                    let dead_kind = if node.slot < latest_rooted {
                        Some(false)
                    } else if node.slot == latest_rooted && node.slot <= zero_lamport_clean_ceiling
                    {
                        match self.node_lamports_and_hash(&node) {
                            Some((0, _)) => Some(true),
                            _ => None,
                        }
                    } else {
                        None
                    };
                    let Some(zero_lamport) = dead_kind else {
                        continue;
                    };
                    // cached nodes wait for their own flush + clean
                    let AccountLocation::File { file_id, offset } = node.location else {
                        continue;
                    };
                    if !self.accounts_index.remove_reference(&pubkey, node.slot) {
                        continue;
                    }
                    if zero_lamport {
                        result.zero_lamport_states += 1;
                    } else {
                        result.old_states += 1;
                    }

                    if let Some(dead_entry) = self.storage.get(file_id) {
                        let mut dead_entry = dead_entry.write().unwrap();
                        let stored_size = dead_entry
                            .accounts()
                            .get_account(offset)
                            .map(|(stored, _)| stored.stored_size)
                            .expect("dead record must exist in its file");
                        dead_entry.mark_dead(stored_size);
                        touched.insert(file_id);
                    }
                }
            }
        }
        scan.stop();

        let mut shrink_candidates = self.shrink_candidates.lock().unwrap();
        let mut delete_candidates = self.delete_candidates.lock().unwrap();
        for file_id in touched {
            let Some(entry) = self.storage.get(file_id) else {
                continue;
            };
            let entry = entry.read().unwrap();
            if entry.is_dead() {
                shrink_candidates.remove(&file_id);
                delete_candidates.insert(file_id);
            } else if entry.dead_ratio_percent() >= self.config.shrink_ratio {
                shrink_candidates.insert(file_id);
            }
        }

        datapoint_info!(
            "clean_account_files",
            ("unclean_files", unclean.len(), i64),
            ("old_states", result.old_states, i64),
            ("zero_lamport_states", result.zero_lamport_states, i64),
            ("scan_us", scan.as_us(), i64),
        );
        result
    }

    /// Rewrite queued sparse files compactly. Per-file failures only delay
    /// space reclamation, so they are logged and skipped.
    pub fn shrink_account_files(&self) -> usize {
        let candidates: Vec<FileId> = self.shrink_candidates.lock().unwrap().drain().collect();
        let mut shrunk = 0;
        for file_id in candidates {
            match self.shrink_file(file_id) {
                Ok(()) => shrunk += 1,
                Err(err) => warn!("shrink of account file {file_id} failed: {err}"),
            }
        }
        shrunk
    }

    fn shrink_file(&self, file_id: FileId) -> Result<(), AccountsDbError> {
        let mut time = Measure::start("shrink_file");
        let entry = self
            .storage
            .get(file_id)
            .ok_or(AccountsDbError::FileIdNotFound(file_id))?;
        let slot = entry.read().unwrap().slot();

        // a record is alive iff the index still references exactly it
        struct AliveRecord {
            pubkey: Pubkey,
            offset: usize,
        }
        let (alive, alive_bytes, original_bytes) = {
            let entry = entry.read().unwrap();
            let mut alive = vec![];
            let mut alive_bytes = 0usize;
            for stored in entry.accounts().account_iter() {
                let location = AccountLocation::File {
                    file_id,
                    offset: stored.offset,
                };
                let referenced = self
                    .accounts_index
                    .get_slot_reference(stored.pubkey(), slot)
                    .map_or(false, |node| node.location == location);
                if referenced {
                    alive_bytes += stored.stored_size;
                    alive.push(AliveRecord {
                        pubkey: *stored.pubkey(),
                        offset: stored.offset,
                    });
                }
            }
            (alive, alive_bytes, entry.accounts().len())
        };

        if alive.is_empty() {
            // everything died since it was queued; let delete take it
            self.delete_candidates.lock().unwrap().insert(file_id);
            return Ok(());
        }

        let new_id = self.next_file_id();
        let mut new_entry = AccountStorageEntry::new(&self.accounts_dir, slot, new_id, alive_bytes);
        let new_block = self
            .accounts_index
            .alloc_reference_block(slot, alive.len())?;

        let mut new_ptrs = Vec::with_capacity(alive.len());
        {
            let old_entry = entry.read().unwrap();
            for record in &alive {
                let (stored, _) = old_entry
                    .accounts()
                    .get_account(record.offset)
                    .expect("alive record must exist in its file");
                let new_offset = new_entry
                    .accounts()
                    .append_account(stored.meta.clone(), &stored.clone_account(), *stored.hash)
                    .expect("shrunk file was sized for every alive record");
                let node = AccountRef::new(
                    record.pubkey,
                    slot,
                    AccountLocation::File {
                        file_id: new_id,
                        offset: new_offset,
                    },
                );
                new_ptrs.push(
                    self.accounts_index
                        .push_ref(new_block, node)
                        .expect("shrink arena was sized for every alive record"),
                );
            }
        }
        new_entry.set_metadata_after_flush();

        // Publish the new file first so re-linked chains always resolve,
        // re-link every chain node, then release the old arena and file.
        self.storage.insert(new_entry);
        for ptr in new_ptrs {
            assert!(
                self.accounts_index.relink_reference(ptr),
                "alive record vanished from the index during shrink",
            );
        }
        self.accounts_index.replace_slot_blocks(slot, new_block);
        let removed = self.storage.remove(file_id);
        assert!(removed.is_some());

        time.stop();
        datapoint_info!(
            "shrink_account_files",
            ("slot", slot, i64),
            ("alive_accounts", alive.len(), i64),
            ("original_bytes", original_bytes, i64),
            ("shrunk_bytes", alive_bytes, i64),
            ("time_us", time.as_us(), i64),
        );
        Ok(())
    }

    /// Retire queued fully-dead files: unpublish, free the slot's arena,
    /// munmap, and unlink.
    pub fn delete_account_files(&self) -> usize {
        let candidates: Vec<FileId> = self.delete_candidates.lock().unwrap().drain().collect();
        let mut deleted = 0;
        for file_id in candidates {
            let Some(entry) = self.storage.remove(file_id) else {
                warn!("delete of account file {file_id} raced with shrink; skipping");
                continue;
            };
            {
                let entry = entry.read().unwrap();
                debug_assert!(entry.is_dead());
                self.accounts_index.free_reference_block(entry.slot());
            }
            // the AppendVec unlinks its file on drop
            drop(entry);
            deleted += 1;
        }
        deleted
    }

    /// One maintenance cycle: flush rooted cached slots, then clean,
    /// shrink, and delete. Returns how many slots were flushed. `exit` is
    /// observed between stages.
    pub fn maintenance_iteration(&self, exit: &AtomicBool) -> usize {
        let rooted = self.largest_rooted_slot();
        let mut flushable: Vec<Slot> = self
            .accounts_cache
            .cached_slots()
            .into_iter()
            .filter(|slot| *slot <= rooted)
            .collect();
        flushable.sort_unstable();
        flushable.truncate(self.config.max_flush_slots_per_iter);

        for slot in &flushable {
            if exit.load(Ordering::Relaxed) {
                return 0;
            }
            self.flush_slot(*slot);
        }

        if !flushable.is_empty() {
            if exit.load(Ordering::Relaxed) {
                return flushable.len();
            }
            self.clean_account_files(Some(rooted));
            if exit.load(Ordering::Relaxed) {
                return flushable.len();
            }
            self.shrink_account_files();
            if exit.load(Ordering::Relaxed) {
                return flushable.len();
            }
            self.delete_account_files();
        }
        flushable.len()
    }

    /// Merkle root and capitalization over the live accounts selected by
    /// `kind`. Pubkeys are hashed in bin order, sorted within each bin.
    pub fn calculate_accounts_hash(&self, kind: HashKind) -> (Hash, u64) {
        let mut scan = Measure::start("hash_scan");
        let bins = self.accounts_index.num_bins();
        let per_bin: Vec<Vec<(Hash, u64)>> = self.thread_pool.install(|| {
            (0..bins)
                .into_par_iter()
                .map(|bin| {
                    let mut heads = vec![];
                    self.accounts_index
                        .scan_bin(bin, |pubkey, ptr| heads.push((*pubkey, ptr)));

                    let mut items: Vec<(Pubkey, Hash, u64)> = vec![];
                    for (pubkey, head) in heads {
                        let Some(node) = self.accounts_index.latest_in_bounds_from(
                            Some(head),
                            kind.min_exclusive(),
                            kind.max_inclusive(),
                        ) else {
                            continue;
                        };
                        let Some((lamports, hash)) = self.node_lamports_and_hash(&node) else {
                            continue;
                        };
                        match kind {
                            HashKind::Full { .. } => {
                                if lamports != 0 {
                                    items.push((pubkey, hash, lamports));
                                }
                            }
                            HashKind::Incremental { .. } => {
                                if lamports == 0 {
                                    items.push((
                                        pubkey,
                                        accounts_hash::zero_lamport_contribution(&pubkey),
                                        0,
                                    ));
                                } else {
                                    items.push((pubkey, hash, lamports));
                                }
                            }
                        }
                    }
                    items.sort_unstable_by(|a, b| a.0.cmp(&b.0));
                    items
                        .into_iter()
                        .map(|(_, hash, lamports)| (hash, lamports))
                        .collect()
                })
                .collect()
        });
        scan.stop();

        let leaves: Vec<(Hash, u64)> = per_bin.into_iter().flatten().collect();
        let leaf_count = leaves.len();
        let mut hash_time = Measure::start("hash");
        let (hash, capitalization) =
            accounts_hash::compute_merkle_root_and_capitalization(leaves, MERKLE_FANOUT);
        hash_time.stop();
        datapoint_info!(
            "calculate_accounts_hash",
            ("accounts", leaf_count, i64),
            ("scan_us", scan.as_us(), i64),
            ("hash_us", hash_time.as_us(), i64),
        );
        (hash, capitalization)
    }

    /// Merkle root over the hashes of the accounts written at exactly
    /// `slot` (the accounts delta hash).
    pub fn calculate_accounts_delta_hash(&self, slot: Slot) -> Hash {
        let mut newest: HashMap<Pubkey, (u64, Hash)> = HashMap::new();
        let mut record = |pubkey: Pubkey, write_version: u64, hash: Hash| {
            match newest.get(&pubkey) {
                Some((seen, _)) if *seen >= write_version => {}
                _ => {
                    newest.insert(pubkey, (write_version, hash));
                }
            }
        };

        for (_, entry) in self.storage.entries() {
            let entry = entry.read().unwrap();
            if entry.slot() != slot {
                continue;
            }
            for stored in entry.accounts().account_iter() {
                record(*stored.pubkey(), stored.write_version(), *stored.hash);
            }
        }
        if let Some(slot_cache) = self.accounts_cache.slot_cache(slot) {
            for (pubkey, account) in slot_cache.pubkeys().iter().zip(slot_cache.accounts()) {
                record(*pubkey, u64::MAX, accounts_hash::hash_account(account, pubkey));
            }
        }

        let hashes = newest
            .into_iter()
            .map(|(pubkey, (_, hash))| (pubkey, hash))
            .collect();
        accounts_hash::compute_delta_hash(hashes)
    }

    /// The contract surface for the snapshot writer: every live file with
    /// `min_exclusive < slot <= max_inclusive`, sorted by slot.
    pub fn snapshot_storages(
        &self,
        min_exclusive: Option<Slot>,
        max_inclusive: Slot,
    ) -> Vec<(Slot, FileId, Arc<std::sync::RwLock<AccountStorageEntry>>)> {
        let mut storages: Vec<_> = self
            .storage
            .entries()
            .into_iter()
            .filter_map(|(id, entry)| {
                let slot = entry.read().unwrap().slot();
                let in_range =
                    slot <= max_inclusive && min_exclusive.map_or(true, |min| slot > min);
                in_range.then_some((slot, id, entry))
            })
            .collect();
        storages.sort_unstable_by_key(|(slot, id, _)| (*slot, *id));
        storages
    }

    /// Keep account files and allocator files on disk through drop, so the
    /// next run can fastload them.
    pub fn retain_files_on_disk(&self) {
        if let Some(allocator) = &self.disk_allocator {
            allocator.set_retain_files();
        }
        for (_, entry) in self.storage.entries() {
            entry.write().unwrap().accounts_mut().set_no_remove_on_drop();
        }
    }

    /// Ids queued for the next clean; flush fills this.
    pub fn unclean_file_ids(&self) -> Vec<FileId> {
        self.unclean_files.lock().unwrap().clone()
    }

    pub fn shrink_candidate_ids(&self) -> Vec<FileId> {
        self.shrink_candidates.lock().unwrap().iter().copied().collect()
    }

    pub fn delete_candidate_ids(&self) -> Vec<FileId> {
        self.delete_candidates.lock().unwrap().iter().copied().collect()
    }
}

#[cfg(test)]
pub mod tests {
    use {super::*, rand::Rng};

    fn rand_account() -> Account {
        let mut rng = rand::thread_rng();
        let mut account = Account::new(
            rng.gen_range(1..1_000_000),
            rng.gen_range(0..256),
            &Pubkey::new_unique(),
        );
        rng.fill(&mut account.data[..]);
        account
    }

    fn put_one(db: &AccountsDb, slot: Slot, pubkey: Pubkey, account: Account) {
        db.put_batch(slot, vec![pubkey], vec![account]).unwrap();
    }

    #[test]
    fn test_simple_put_get() {
        sable_logger::setup();
        let db = AccountsDb::new_for_tests(4);
        let pubkey = Pubkey::new_unique();
        let account = Account {
            lamports: 100,
            data: vec![1, 2, 3],
            owner: Pubkey::default(),
            executable: false,
            rent_epoch: 0,
        };
        put_one(&db, 19, pubkey, account.clone());
        assert_eq!(db.get_account(&pubkey).unwrap(), account);

        let newer = Account {
            lamports: 20,
            ..account.clone()
        };
        put_one(&db, 28, pubkey, newer.clone());
        assert_eq!(db.get_account(&pubkey).unwrap(), newer);

        // bounded reads still see the slot-19 version
        assert_eq!(
            db.get_account_with_bounds(&pubkey, None, Some(27)).unwrap(),
            account
        );
        assert!(matches!(
            db.get_account(&Pubkey::new_unique()),
            Err(AccountsDbError::PubkeyNotInIndex)
        ));
    }

    #[test]
    fn test_flush_works() {
        sable_logger::setup();
        let db = AccountsDb::new_for_tests(4);
        let pubkeys: Vec<_> = (0..3).map(|_| Pubkey::new_unique()).collect();
        let accounts: Vec<_> = (0..3).map(|_| rand_account()).collect();
        db.put_batch(200, pubkeys.clone(), accounts.clone()).unwrap();

        let id = db.flush_slot(200);
        assert_eq!(db.storage.len(), 1);
        let entry = db.storage.get(id).unwrap();
        assert_eq!(entry.read().unwrap().num_accounts(), 3);
        assert_eq!(db.unclean_file_ids(), vec![id]);
        assert!(db.accounts_cache.is_empty());

        // flush preserves reads
        for (pubkey, account) in pubkeys.iter().zip(&accounts) {
            assert_eq!(&db.get_account(pubkey).unwrap(), account);
        }
    }

    #[test]
    fn test_purge_cache_only_slot() {
        sable_logger::setup();
        let db = AccountsDb::new_for_tests(4);
        let pubkeys: Vec<_> = (0..3).map(|_| Pubkey::new_unique()).collect();
        let accounts: Vec<_> = (0..3).map(|_| rand_account()).collect();
        db.put_batch(200, pubkeys.clone(), accounts).unwrap();

        db.purge_slot(200);
        assert!(db.accounts_cache.is_empty());
        assert!(!db.accounts_index.has_blocks_for_slot(200));
        for pubkey in &pubkeys {
            assert_eq!(db.accounts_index.get_reference(pubkey), None);
        }
    }

    #[test]
    #[should_panic(expected = "not cached")]
    fn test_purge_flushed_slot_panics() {
        let db = AccountsDb::new_for_tests(4);
        put_one(&db, 200, Pubkey::new_unique(), rand_account());
        db.flush_slot(200);
        db.purge_slot(200);
    }

    #[test]
    fn test_clean_then_shrink() {
        sable_logger::setup();
        let db = AccountsDb::new_for_tests(4);
        let pubkeys: Vec<_> = (0..10).map(|_| Pubkey::new_unique()).collect();
        let accounts: Vec<_> = (0..10).map(|_| rand_account()).collect();
        db.put_batch(200, pubkeys.clone(), accounts.clone()).unwrap();
        let old_id = db.flush_slot(200);

        // overwrite 9 of them at slot 500
        let newer: Vec<_> = (0..9).map(|_| rand_account()).collect();
        db.put_batch(500, pubkeys[..9].to_vec(), newer.clone()).unwrap();
        db.flush_slot(500);

        db.add_root(600);
        let result = db.clean_account_files(None);
        assert_eq!(
            result,
            CleanResult {
                old_states: 9,
                zero_lamport_states: 0
            }
        );
        assert_eq!(db.shrink_candidate_ids(), vec![old_id]);
        assert!(db.delete_candidate_ids().is_empty());

        let size_before = db
            .storage
            .get(old_id)
            .unwrap()
            .read()
            .unwrap()
            .written_bytes();
        assert_eq!(db.shrink_account_files(), 1);
        assert!(!db.storage.contains(old_id));

        // the shrunk slot kept only the one un-overwritten account
        let (_, entry) = db.storage.find_by_slot(200).unwrap();
        let entry = entry.read().unwrap();
        assert_eq!(entry.num_accounts(), 1);
        assert!(entry.written_bytes() < size_before);
        drop(entry);

        // shrink preserves value
        assert_eq!(&db.get_account(&pubkeys[9]).unwrap(), &accounts[9]);
        for (pubkey, account) in pubkeys[..9].iter().zip(&newer) {
            assert_eq!(&db.get_account(pubkey).unwrap(), account);
        }
    }

    #[test]
    fn test_clean_then_full_delete() {
        sable_logger::setup();
        let db = AccountsDb::new_for_tests(4);
        let pubkeys: Vec<_> = (0..3).map(|_| Pubkey::new_unique()).collect();
        db.put_batch(200, pubkeys.clone(), (0..3).map(|_| rand_account()).collect())
            .unwrap();
        let old_id = db.flush_slot(200);

        db.put_batch(500, pubkeys, (0..3).map(|_| rand_account()).collect())
            .unwrap();
        db.flush_slot(500);

        db.add_root(600);
        let result = db.clean_account_files(None);
        assert_eq!(result.old_states, 3);
        assert_eq!(db.delete_candidate_ids(), vec![old_id]);
        assert!(db.shrink_candidate_ids().is_empty());

        assert_eq!(db.delete_account_files(), 1);
        assert!(!db.storage.contains(old_id));
        assert!(!db.accounts_index.has_blocks_for_slot(200));
    }

    #[test]
    fn test_zero_lamport_collapse() {
        sable_logger::setup();
        let db = AccountsDb::new_for_tests(4);
        let pubkeys: Vec<_> = (0..10).map(|_| Pubkey::new_unique()).collect();
        let accounts: Vec<_> = (0..10).map(|_| rand_account()).collect();
        db.put_batch(200, pubkeys.clone(), accounts.clone()).unwrap();
        let old_id = db.flush_slot(200);

        let zeroed: Vec<_> = (0..9)
            .map(|_| Account::new(0, 0, &Pubkey::default()))
            .collect();
        db.put_batch(500, pubkeys[..9].to_vec(), zeroed).unwrap();
        db.flush_slot(500);

        db.add_root(600);
        let result = db.clean_account_files(None);
        assert_eq!(
            result,
            CleanResult {
                old_states: 9,
                zero_lamport_states: 9
            }
        );
        assert!(db.shrink_candidate_ids().contains(&old_id));

        // the untouched pubkey still reads its slot-200 value
        assert_eq!(&db.get_account(&pubkeys[9]).unwrap(), &accounts[9]);
        // collapsed pubkeys are gone from the index entirely
        for pubkey in &pubkeys[..9] {
            assert!(matches!(
                db.get_account(pubkey),
                Err(AccountsDbError::PubkeyNotInIndex)
            ));
        }
    }

    #[test]
    fn test_zero_lamport_survives_past_full_snapshot_base() {
        sable_logger::setup();
        let db = AccountsDb::new_for_tests(4);
        let pubkey = Pubkey::new_unique();
        put_one(&db, 10, pubkey, rand_account());
        db.add_root(10);
        db.flush_slot(10);
        db.set_latest_full_snapshot(FullSnapshotInfo {
            slot: 10,
            hash: Hash::default(),
            capitalization: 0,
        });

        put_one(&db, 20, pubkey, Account::new(0, 0, &Pubkey::default()));
        db.flush_slot(20);
        db.add_root(30);

        // the slot-10 version is old, but the newer deletion stays for the
        // next incremental snapshot to report
        let result = db.clean_account_files(None);
        assert_eq!(
            result,
            CleanResult {
                old_states: 1,
                zero_lamport_states: 0
            }
        );
        let chain = db.accounts_index.collect_chain(&pubkey);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].slot, 20);
    }

    #[test]
    fn test_clean_is_idempotent_on_clean_file() {
        sable_logger::setup();
        let db = AccountsDb::new_for_tests(4);
        let pubkeys: Vec<_> = (0..4).map(|_| Pubkey::new_unique()).collect();
        db.put_batch(200, pubkeys, (0..4).map(|_| rand_account()).collect())
            .unwrap();
        let id = db.flush_slot(200);
        db.add_root(300);

        assert_eq!(db.clean_account_files(None), CleanResult::default());
        let alive_bytes = db.storage.get(id).unwrap().read().unwrap().alive_bytes();

        // a second clean (re-queued by hand) changes nothing
        db.unclean_files.lock().unwrap().push(id);
        assert_eq!(db.clean_account_files(None), CleanResult::default());
        let entry = db.storage.get(id).unwrap();
        let entry = entry.read().unwrap();
        assert_eq!(entry.alive_bytes(), alive_bytes);
        assert_eq!(entry.dead_bytes(), 0);
        assert_eq!(entry.num_accounts(), 4);
    }

    #[test]
    fn test_clean_ignores_unrooted_versions() {
        sable_logger::setup();
        let db = AccountsDb::new_for_tests(4);
        let pubkey = Pubkey::new_unique();
        put_one(&db, 200, pubkey, rand_account());
        db.flush_slot(200);
        put_one(&db, 500, pubkey, rand_account());
        db.flush_slot(500);

        // only slot 200 is rooted; the 500 version must not kill it
        db.add_root(200);
        let result = db.clean_account_files(None);
        assert_eq!(result, CleanResult::default());
        assert_eq!(db.accounts_index.collect_chain(&pubkey).len(), 2);
    }

    #[test]
    fn test_maintenance_iteration_flushes_rooted() {
        sable_logger::setup();
        let db = AccountsDb::new_for_tests(4);
        for slot in [10, 20, 30] {
            put_one(&db, slot, Pubkey::new_unique(), rand_account());
        }
        db.add_root(20);

        let exit = AtomicBool::new(false);
        assert_eq!(db.maintenance_iteration(&exit), 2);
        assert_eq!(db.accounts_cache.cached_slots(), vec![30]);
        assert_eq!(db.storage.len(), 2);

        // nothing left to do at the same root
        assert_eq!(db.maintenance_iteration(&exit), 0);
    }

    #[test]
    fn test_get_account_typed() {
        let db = AccountsDb::new_for_tests(4);
        let pubkey = Pubkey::new_unique();
        let account =
            Account::new_data(1, &(42u64, String::from("sable")), &Pubkey::default()).unwrap();
        put_one(&db, 3, pubkey, account);
        let state: (u64, String) = db.get_account_typed(&pubkey).unwrap();
        assert_eq!(state, (42, String::from("sable")));
    }

    #[test]
    fn test_delta_hash_prefers_cache_and_latest_write() {
        let db = AccountsDb::new_for_tests(4);
        let pubkey = Pubkey::new_unique();
        let account = rand_account();
        put_one(&db, 200, pubkey, account.clone());
        let from_cache = db.calculate_accounts_delta_hash(200);
        db.flush_slot(200);
        let from_file = db.calculate_accounts_delta_hash(200);
        assert_eq!(from_cache, from_file);
    }

    #[test]
    fn test_full_hash_skips_zero_lamports() {
        let db = AccountsDb::new_for_tests(4);
        let live = Pubkey::new_unique();
        let dead = Pubkey::new_unique();
        let account = rand_account();
        db.put_batch(
            10,
            vec![live, dead],
            vec![account.clone(), Account::new(0, 0, &Pubkey::default())],
        )
        .unwrap();

        let (_, capitalization) = db.calculate_accounts_hash(HashKind::Full { max_slot: 10 });
        assert_eq!(capitalization, account.lamports);

        let (full_hash, _) = db.calculate_accounts_hash(HashKind::Full { max_slot: 10 });
        let (incremental_hash, incremental_capitalization) =
            db.calculate_accounts_hash(HashKind::Incremental {
                min_slot: 5,
                max_slot: None,
            });
        // the zero-lamport account contributes to the incremental hash
        assert_ne!(full_hash, incremental_hash);
        assert_eq!(incremental_capitalization, account.lamports);
    }

    #[test]
    fn test_hash_bounds_select_versions() {
        let db = AccountsDb::new_for_tests(4);
        let pubkey = Pubkey::new_unique();
        let old = Account::new(10, 0, &Pubkey::default());
        let new = Account::new(30, 0, &Pubkey::default());
        put_one(&db, 100, pubkey, old);
        put_one(&db, 300, pubkey, new);

        let (_, cap_at_100) = db.calculate_accounts_hash(HashKind::Full { max_slot: 100 });
        let (_, cap_at_300) = db.calculate_accounts_hash(HashKind::Full { max_slot: 300 });
        let (_, cap_since_100) =
            db.calculate_accounts_hash(HashKind::Incremental {
                min_slot: 100,
                max_slot: None,
            });
        assert_eq!(cap_at_100, 10);
        assert_eq!(cap_at_300, 30);
        assert_eq!(cap_since_100, 30);
    }

    #[test]
    fn test_snapshot_storages_range() {
        let db = AccountsDb::new_for_tests(4);
        for slot in [10, 20, 30] {
            put_one(&db, slot, Pubkey::new_unique(), rand_account());
            db.flush_slot(slot);
        }

        let all = db.snapshot_storages(None, 30);
        assert_eq!(
            all.iter().map(|(slot, ..)| *slot).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
        let incremental = db.snapshot_storages(Some(10), 20);
        assert_eq!(
            incremental.iter().map(|(slot, ..)| *slot).collect::<Vec<_>>(),
            vec![20]
        );
    }
}
