//! Snapshot archives: discovery, the parallel load pipeline, validation,
//! and generation.
//!
//! Loading runs before the engine is exposed to readers, so the pipeline
//! can hold big locks freely: unpack the archives with striped readers,
//! parse the account files into per-worker partial engines, merge the
//! partial indexes bin-by-bin in parallel, then check the merkle root and
//! capitalization the manifest promised.

use {
    crate::{
        account_storage::{AccountStorageEntry, FileId},
        accounts_db::{AccountsDb, AccountsDbError, FullSnapshotInfo},
        accounts_hash::HashKind,
        accounts_index::{AccountLocation, AccountRef, AccountsIndex, IndexError},
        append_vec::{AppendVec, AppendVecError},
        hardened_unpack::{
            parse_storage_file_name, streaming_unpack_snapshot, ParallelSelector, UnpackError,
        },
        serde_snapshot::{
            self, AccountsDbFields, BankFields, BankHashInfo, BankHashStats,
            BankIncrementalSnapshotPersistence, IndexSidecar, SerializableAccountStorageEntry,
            SnapshotManifest, SnapshotManifests,
        },
    },
    crossbeam_channel::unbounded,
    log::*,
    rayon::prelude::*,
    regex::Regex,
    sable_measure::measure::Measure,
    sable_metrics::datapoint_info,
    sable_sdk::{clock::Slot, hash::Hash},
    std::{
        collections::{HashMap, HashSet},
        fs::{self, File},
        io::{self, Write},
        path::{Path, PathBuf},
        sync::atomic::{AtomicBool, Ordering},
        thread,
    },
    tar::Archive,
    thiserror::Error,
};

pub const SNAPSHOT_STATUS_CACHE_FILE_NAME: &str = "status_cache";
pub const SNAPSHOT_VERSION_FILE_NAME: &str = "version";
pub const SNAPSHOT_VERSION: &str = "1.2.0";
pub const SNAPSHOT_INDEX_SIDECAR_FILE_NAME: &str = "index.bin";
pub const DEFAULT_MAX_SNAPSHOTS_TO_RETAIN: usize = 2;
const TMP_SNAPSHOT_PREFIX: &str = "tmp-snapshot-";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),

    #[error("unpack error: {0}")]
    Unpack(#[from] UnpackError),

    #[error("account file error: {0}")]
    AccountFile(#[from] AppendVecError),

    #[error("accounts db error: {0}")]
    AccountsDb(#[from] AccountsDbError),

    #[error("no usable snapshot archives under {0}")]
    NoSnapshotArchives(PathBuf),

    #[error("missing manifest for slot {0}")]
    MissingManifest(Slot),

    #[error("manifest references missing account file {slot}.{id}")]
    MissingAccountFile { slot: Slot, id: FileId },

    #[error("ran out of reference memory; retry with a larger accounts_per_file_estimate")]
    OutOfReferenceMemory,

    #[error("computed accounts hash {computed} does not match the manifest's {expected}")]
    IncorrectAccountsHash { computed: Hash, expected: Hash },

    #[error("computed capitalization {computed} does not match the manifest's {expected}")]
    IncorrectTotalLamports { computed: u64, expected: u64 },

    #[error("computed incremental capitalization {computed} does not match the manifest's {expected}")]
    IncorrectIncrementalLamports { computed: u64, expected: u64 },

    #[error("computed accounts delta hash {computed} does not match the manifest's {expected}")]
    IncorrectAccountsDeltaHash { computed: Hash, expected: Hash },

    #[error("index sidecar has {sidecar} bins but the engine is configured for {configured}")]
    BinCountMismatch { sidecar: usize, configured: usize },

    #[error("no full snapshot at base slot {0} to layer an incremental on")]
    MissingFullSnapshotBase(Slot),

    #[error("snapshot load cancelled")]
    Cancelled,
}

impl From<IndexError> for SnapshotError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::OutOfReferenceMemory => Self::OutOfReferenceMemory,
            IndexError::MemoryNotFound => Self::AccountsDb(AccountsDbError::MemoryNotFound),
        }
    }
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Archive-side configuration, owned by the CLI collaborator. The download
/// policy fields are carried for it; the engine itself never downloads.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub snapshot_dir: PathBuf,
    pub maximum_snapshots_to_retain: usize,
    pub force_unpack_snapshot: bool,
    pub force_new_snapshot_download: bool,
    pub min_snapshot_download_speed_mbs: u64,
    pub max_number_of_snapshot_download_attempts: u64,
}

impl SnapshotConfig {
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            maximum_snapshots_to_retain: DEFAULT_MAX_SNAPSHOTS_TO_RETAIN,
            force_unpack_snapshot: false,
            force_new_snapshot_download: false,
            min_snapshot_download_speed_mbs: 10,
            max_number_of_snapshot_download_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullSnapshotArchiveInfo {
    pub path: PathBuf,
    pub slot: Slot,
    pub hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalSnapshotArchiveInfo {
    pub path: PathBuf,
    pub base_slot: Slot,
    pub slot: Slot,
    pub hash: Hash,
}

pub fn full_snapshot_archive_file_name(slot: Slot, hash: &Hash) -> String {
    format!("snapshot-{slot}-{hash}.tar.zst")
}

pub fn incremental_snapshot_archive_file_name(base_slot: Slot, slot: Slot, hash: &Hash) -> String {
    format!("incremental-snapshot-{base_slot}-{slot}-{hash}.tar.zst")
}

fn parse_full_snapshot_archive_file_name(file_name: &str) -> Option<(Slot, Hash)> {
    let full_snapshot_archive_regex =
        Regex::new(r"^snapshot-(\d+)-([[:alnum:]]+)\.tar\.zst$").unwrap();
    let captures = full_snapshot_archive_regex.captures(file_name)?;
    let slot = captures.get(1)?.as_str().parse().ok()?;
    let hash = captures.get(2)?.as_str().parse().ok()?;
    Some((slot, hash))
}

fn parse_incremental_snapshot_archive_file_name(file_name: &str) -> Option<(Slot, Slot, Hash)> {
    let incremental_snapshot_archive_regex =
        Regex::new(r"^incremental-snapshot-(\d+)-(\d+)-([[:alnum:]]+)\.tar\.zst$").unwrap();
    let captures = incremental_snapshot_archive_regex.captures(file_name)?;
    let base_slot = captures.get(1)?.as_str().parse().ok()?;
    let slot = captures.get(2)?.as_str().parse().ok()?;
    let hash = captures.get(3)?.as_str().parse().ok()?;
    Some((base_slot, slot, hash))
}

fn snapshot_dir_file_names(snapshot_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(snapshot_dir) else {
        return vec![];
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect()
}

pub fn get_full_snapshot_archives(snapshot_dir: &Path) -> Vec<FullSnapshotArchiveInfo> {
    snapshot_dir_file_names(snapshot_dir)
        .into_iter()
        .filter_map(|file_name| {
            parse_full_snapshot_archive_file_name(&file_name).map(|(slot, hash)| {
                FullSnapshotArchiveInfo {
                    path: snapshot_dir.join(file_name),
                    slot,
                    hash,
                }
            })
        })
        .collect()
}

pub fn get_incremental_snapshot_archives(
    snapshot_dir: &Path,
) -> Vec<IncrementalSnapshotArchiveInfo> {
    snapshot_dir_file_names(snapshot_dir)
        .into_iter()
        .filter_map(|file_name| {
            parse_incremental_snapshot_archive_file_name(&file_name).map(
                |(base_slot, slot, hash)| IncrementalSnapshotArchiveInfo {
                    path: snapshot_dir.join(file_name),
                    base_slot,
                    slot,
                    hash,
                },
            )
        })
        .collect()
}

pub fn get_highest_full_snapshot_archive(snapshot_dir: &Path) -> Option<FullSnapshotArchiveInfo> {
    get_full_snapshot_archives(snapshot_dir)
        .into_iter()
        .max_by_key(|archive| archive.slot)
}

pub fn get_highest_incremental_snapshot_archive(
    snapshot_dir: &Path,
    base_slot: Slot,
) -> Option<IncrementalSnapshotArchiveInfo> {
    get_incremental_snapshot_archives(snapshot_dir)
        .into_iter()
        .filter(|archive| archive.base_slot == base_slot)
        .max_by_key(|archive| archive.slot)
}

/// Delete all but the newest `maximum_snapshots_to_retain` full archives,
/// and every incremental archive whose base is no longer retained.
pub fn purge_old_snapshot_archives(snapshot_dir: &Path, maximum_snapshots_to_retain: usize) {
    let mut full_archives = get_full_snapshot_archives(snapshot_dir);
    full_archives.sort_unstable_by_key(|archive| std::cmp::Reverse(archive.slot));

    let retained_slots: HashSet<Slot> = full_archives
        .iter()
        .take(maximum_snapshots_to_retain.max(1))
        .map(|archive| archive.slot)
        .collect();

    for archive in full_archives
        .iter()
        .skip(maximum_snapshots_to_retain.max(1))
    {
        info!("purging old full snapshot archive {}", archive.path.display());
        if let Err(err) = fs::remove_file(&archive.path) {
            warn!("failed to purge {}: {err}", archive.path.display());
        }
    }
    for archive in get_incremental_snapshot_archives(snapshot_dir) {
        if !retained_slots.contains(&archive.base_slot) {
            info!(
                "purging orphaned incremental snapshot archive {}",
                archive.path.display()
            );
            if let Err(err) = fs::remove_file(&archive.path) {
                warn!("failed to purge {}: {err}", archive.path.display());
            }
        }
    }
}

/// If the process halted mid-package the staging dirs stick around; call
/// this at startup to clean them up.
pub fn remove_tmp_snapshot_archives(snapshot_dir: &Path) {
    if let Ok(entries) = fs::read_dir(snapshot_dir) {
        for entry in entries.filter_map(|entry| entry.ok()) {
            let file_name = entry
                .file_name()
                .into_string()
                .unwrap_or_else(|_| String::new());
            if file_name.starts_with(TMP_SNAPSHOT_PREFIX) {
                if entry.path().is_file() {
                    fs::remove_file(entry.path())
                } else {
                    fs::remove_dir_all(entry.path())
                }
                .unwrap_or_else(|err| {
                    warn!("failed to remove {}: {err}", entry.path().display())
                });
            }
        }
    }
}

fn open_snapshot_archive(
    path: &Path,
) -> Result<Archive<zstd::stream::read::Decoder<'static, io::BufReader<File>>>> {
    let file = File::open(path)?;
    let decoder = zstd::stream::read::Decoder::new(file)?;
    Ok(Archive::new(decoder))
}

/// Unpack one archive with `num_threads` striped readers; each re-opens
/// the compressed stream and takes every Nth account file.
fn parallel_unpack_archive(
    archive_path: &Path,
    unpack_dir: &Path,
    num_threads: usize,
) -> Result<Vec<PathBuf>> {
    let num_threads = num_threads.max(1);
    fs::create_dir_all(unpack_dir)?;
    let (sender, receiver) = unbounded();

    let mut time = Measure::start("unpack");
    thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..num_threads)
            .map(|index| {
                let sender = sender.clone();
                scope.spawn(move || -> Result<()> {
                    let mut archive = open_snapshot_archive(archive_path)?;
                    let parallel_selector = Some(ParallelSelector {
                        index,
                        divisions: num_threads,
                    });
                    streaming_unpack_snapshot(
                        &mut archive,
                        unpack_dir,
                        parallel_selector,
                        &sender,
                    )?;
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("unpack reader panicked")?;
        }
        Ok(())
    })?;
    drop(sender);
    time.stop();

    let unpacked: Vec<PathBuf> = receiver.try_iter().collect();
    info!(
        "unpacked {} account files from {} ({time})",
        unpacked.len(),
        archive_path.display(),
    );
    Ok(unpacked)
}

fn unpacked_manifest_path(unpack_dir: &Path, slot: Slot) -> PathBuf {
    unpack_dir
        .join("snapshots")
        .join(slot.to_string())
        .join(slot.to_string())
}

/// What a completed load hands back to the caller.
#[derive(Debug)]
pub struct SnapshotLoadResult {
    pub bank_fields: BankFields,
    pub full_snapshot_slot: Slot,
    pub incremental_snapshot_slot: Option<Slot>,
    pub accounts_loaded: usize,
}

struct StorageFilePlan {
    slot: Slot,
    id: FileId,
    len: usize,
    path: PathBuf,
}

/// Find the newest full archive (and its newest incremental), unpack,
/// parse, merge, and validate into `accounts_db`. The engine must be
/// empty.
pub fn load_from_snapshot_dir(
    accounts_db: &AccountsDb,
    snapshot_config: &SnapshotConfig,
    exit: &AtomicBool,
) -> Result<SnapshotLoadResult> {
    let snapshot_dir = &snapshot_config.snapshot_dir;
    remove_tmp_snapshot_archives(snapshot_dir);

    let full_archive = get_highest_full_snapshot_archive(snapshot_dir)
        .ok_or_else(|| SnapshotError::NoSnapshotArchives(snapshot_dir.clone()))?;
    let incremental_archive =
        get_highest_incremental_snapshot_archive(snapshot_dir, full_archive.slot);
    info!(
        "loading from full snapshot {} (incremental: {:?})",
        full_archive.path.display(),
        incremental_archive.as_ref().map(|archive| archive.slot),
    );

    // 1: unpack
    let unpack_root = snapshot_dir.join("unpacked");
    let full_unpack_dir = unpack_root.join("full");
    let incremental_unpack_dir = unpack_root.join("incremental");
    let reusable = !snapshot_config.force_unpack_snapshot
        && unpacked_manifest_path(&full_unpack_dir, full_archive.slot).exists()
        && incremental_archive.as_ref().map_or(true, |archive| {
            unpacked_manifest_path(&incremental_unpack_dir, archive.slot).exists()
        });
    if reusable {
        info!("reusing already-unpacked snapshot under {}", unpack_root.display());
    } else {
        if unpack_root.exists() {
            fs::remove_dir_all(&unpack_root)?;
        }
        let num_threads = match accounts_db.config().num_threads_snapshot_unpack {
            0 => (num_cpus::get() / 2).max(1),
            n => n,
        };
        parallel_unpack_archive(&full_archive.path, &full_unpack_dir, num_threads)?;
        if let Some(incremental) = &incremental_archive {
            parallel_unpack_archive(&incremental.path, &incremental_unpack_dir, num_threads)?;
        }
    }
    if exit.load(Ordering::Relaxed) {
        return Err(SnapshotError::Cancelled);
    }

    // 2: read and collapse the manifests
    let full_manifest = serde_snapshot::read_manifest(unpacked_manifest_path(
        &full_unpack_dir,
        full_archive.slot,
    ))
    .map_err(|err| {
        warn!("failed to read full manifest: {err}");
        SnapshotError::MissingManifest(full_archive.slot)
    })?;
    let incremental_manifest = incremental_archive
        .as_ref()
        .map(|archive| {
            serde_snapshot::read_manifest(unpacked_manifest_path(
                &incremental_unpack_dir,
                archive.slot,
            ))
            .map_err(|err| {
                warn!("failed to read incremental manifest: {err}");
                SnapshotError::MissingManifest(archive.slot)
            })
        })
        .transpose()?;

    let full_slot = full_manifest.bank_fields.slot;
    let manifests = SnapshotManifests {
        full: full_manifest,
        incremental: incremental_manifest,
    };
    let (bank_fields, accounts_db_fields) = manifests.collapse()?;

    if accounts_db.config().snapshot_metadata_only {
        info!("snapshot metadata loaded; skipping account-file ingest");
        return Ok(SnapshotLoadResult {
            full_snapshot_slot: full_slot,
            incremental_snapshot_slot: incremental_archive.map(|archive| archive.slot),
            accounts_loaded: 0,
            bank_fields,
        });
    }

    // 3: plan which unpacked files the manifest wants
    let plan = plan_storage_files(
        &accounts_db_fields,
        full_slot,
        &full_unpack_dir.join("accounts"),
        &incremental_unpack_dir.join("accounts"),
    )?;
    if exit.load(Ordering::Relaxed) {
        return Err(SnapshotError::Cancelled);
    }

    // 4: parse in parallel and merge
    let accounts_loaded = parse_and_merge_storage_files(accounts_db, plan)?;
    if exit.load(Ordering::Relaxed) {
        return Err(SnapshotError::Cancelled);
    }

    accounts_db.set_write_version(accounts_db_fields.write_version);
    accounts_db.add_root(bank_fields.slot);

    // 5: validate against the manifest
    validate_load_from_snapshot(
        accounts_db,
        &bank_fields,
        &accounts_db_fields.bank_hash_info,
    )?;

    // remember the full-snapshot base so this node can package incrementals
    let full_info = match &bank_fields.incremental_snapshot_persistence {
        Some(persistence) => FullSnapshotInfo {
            slot: persistence.full_slot,
            hash: persistence.full_hash,
            capitalization: persistence.full_capitalization,
        },
        None => FullSnapshotInfo {
            slot: bank_fields.slot,
            hash: accounts_db_fields.bank_hash_info.accounts_hash,
            capitalization: bank_fields.capitalization,
        },
    };
    accounts_db.set_latest_full_snapshot(full_info);

    datapoint_info!(
        "load_from_snapshot",
        ("full_slot", full_slot, i64),
        (
            "incremental_slot",
            bank_fields.slot.max(full_slot),
            i64
        ),
        ("accounts_loaded", accounts_loaded, i64),
    );
    Ok(SnapshotLoadResult {
        full_snapshot_slot: full_slot,
        incremental_snapshot_slot: (bank_fields.slot > full_slot).then_some(bank_fields.slot),
        accounts_loaded,
        bank_fields,
    })
}

fn plan_storage_files(
    accounts_db_fields: &AccountsDbFields,
    full_slot: Slot,
    full_accounts_dir: &Path,
    incremental_accounts_dir: &Path,
) -> Result<Vec<StorageFilePlan>> {
    let mut referenced: HashSet<(Slot, FileId)> = HashSet::new();
    let mut plan = vec![];
    for (slot, storages) in &accounts_db_fields.storages {
        let accounts_dir = if *slot > full_slot {
            incremental_accounts_dir
        } else {
            full_accounts_dir
        };
        for storage in storages {
            let path = accounts_dir.join(AppendVec::file_name(*slot, storage.id));
            if !path.exists() {
                return Err(SnapshotError::MissingAccountFile {
                    slot: *slot,
                    id: storage.id,
                });
            }
            referenced.insert((*slot, storage.id));
            plan.push(StorageFilePlan {
                slot: *slot,
                id: storage.id,
                len: storage.accounts_current_len,
                path,
            });
        }
    }

    // unreferenced files are dropped so they cannot shadow live state later
    for accounts_dir in [full_accounts_dir, incremental_accounts_dir] {
        for file_name in snapshot_dir_file_names(accounts_dir) {
            let Some((slot, id)) = parse_storage_file_name(&file_name) else {
                continue;
            };
            if !referenced.contains(&(slot, id)) {
                warn!("skipping account file not in the manifest: {file_name}");
                let _ = fs::remove_file(accounts_dir.join(file_name));
            }
        }
    }

    Ok(plan)
}

fn parse_and_merge_storage_files(
    accounts_db: &AccountsDb,
    plan: Vec<StorageFilePlan>,
) -> Result<usize> {
    let num_workers = match accounts_db.config().num_threads_snapshot_load {
        0 => num_cpus::get(),
        n => n,
    }
    .max(1);
    let chunk_size = (plan.len() + num_workers - 1) / num_workers;
    let estimate = accounts_db.config().accounts_per_file_estimate;

    let mut parse = Measure::start("parallel_parse");
    let workers: Vec<(AccountsIndex, Vec<AccountStorageEntry>)> =
        if plan.is_empty() {
            vec![]
        } else {
            accounts_db.thread_pool.install(|| {
                plan.par_chunks(chunk_size)
                    .map(|files| parse_storage_chunk(accounts_db, files, estimate))
                    .collect::<Result<Vec<_>>>()
            })?
        };
    parse.stop();

    // reference memory transfers wholesale; chains stay valid because block
    // ids are engine-global
    let mut merge = Measure::start("merge");
    let (indexes, entry_lists): (Vec<_>, Vec<_>) = workers.into_iter().unzip();
    for index in &indexes {
        accounts_db.accounts_index.absorb_reference_memory(index);
    }

    let bins = accounts_db.accounts_index.num_bins();
    accounts_db.thread_pool.install(|| {
        (0..bins).into_par_iter().for_each(|bin| {
            for worker in &indexes {
                let mut heads = vec![];
                worker.scan_bin(bin, |_pubkey, ptr| heads.push(ptr));
                for head in heads {
                    // collect the whole chain before indexing clears links
                    let mut ptrs = vec![];
                    let mut cursor = Some(head);
                    while let Some(ptr) = cursor {
                        ptrs.push(ptr);
                        cursor = accounts_db.accounts_index.resolve(ptr).next();
                    }
                    for ptr in ptrs {
                        if !accounts_db.accounts_index.index_ref_if_not_duplicate_slot(ptr) {
                            warn!("duplicate account version dropped during index merge");
                        }
                    }
                }
            }
        })
    });
    // workers deinit their bin maps only; the arenas now belong to the
    // merged engine
    drop(indexes);

    let mut accounts_loaded = 0;
    for entry in entry_lists.into_iter().flatten() {
        accounts_loaded += entry.count();
        accounts_db.publish_storage(entry);
    }
    merge.stop();

    datapoint_info!(
        "snapshot_parse_and_merge",
        ("accounts_loaded", accounts_loaded, i64),
        ("parse_us", parse.as_us(), i64),
        ("merge_us", merge.as_us(), i64),
    );
    Ok(accounts_loaded)
}

fn parse_storage_chunk(
    accounts_db: &AccountsDb,
    files: &[StorageFilePlan],
    accounts_per_file_estimate: usize,
) -> Result<(AccountsIndex, Vec<AccountStorageEntry>)> {
    let index = AccountsIndex::new_with_block_counter(
        accounts_db.accounts_index.num_bins(),
        accounts_db.index_allocator(),
        accounts_db.accounts_index.block_counter(),
    )?;
    let slots: Vec<Slot> = files.iter().map(|file| file.slot).collect();
    let block = index
        .alloc_shared_reference_block(&slots, files.len() * accounts_per_file_estimate)?;

    let mut entries = vec![];
    for file in files {
        let append_vec = AppendVec::new_from_file(&file.path, file.len)?;
        let mut entry = AccountStorageEntry::new_existing(file.slot, file.id, append_vec)?;

        let mut duplicates = vec![];
        for stored in entry.accounts().account_iter() {
            let node = AccountRef::new(
                *stored.pubkey(),
                file.slot,
                AccountLocation::File {
                    file_id: file.id,
                    offset: stored.offset,
                },
            );
            let ptr = index.push_ref(block, node)?;
            if !index.index_ref_if_not_duplicate_slot(ptr) {
                duplicates.push(stored.stored_size);
            }
        }
        if !duplicates.is_empty() {
            info!(
                "{} duplicate records in account file {}.{}",
                duplicates.len(),
                file.slot,
                file.id,
            );
            for stored_size in duplicates {
                entry.mark_dead(stored_size);
            }
        }
        entries.push(entry);
    }
    Ok((index, entries))
}

/// Check the rebuilt engine against what the manifest promised: full
/// accounts hash and capitalization, the manifest slot's delta hash, and,
/// for incremental snapshots, the base-full and incremental hashes.
pub fn validate_load_from_snapshot(
    accounts_db: &AccountsDb,
    bank_fields: &BankFields,
    bank_hash_info: &BankHashInfo,
) -> Result<()> {
    let mut time = Measure::start("validate");
    let (accounts_hash, capitalization) =
        accounts_db.calculate_accounts_hash(HashKind::Full {
            max_slot: bank_fields.slot,
        });
    if accounts_hash != bank_hash_info.accounts_hash {
        return Err(SnapshotError::IncorrectAccountsHash {
            computed: accounts_hash,
            expected: bank_hash_info.accounts_hash,
        });
    }
    if capitalization != bank_fields.capitalization {
        return Err(SnapshotError::IncorrectTotalLamports {
            computed: capitalization,
            expected: bank_fields.capitalization,
        });
    }

    let delta_hash = accounts_db.calculate_accounts_delta_hash(bank_fields.slot);
    if delta_hash != bank_hash_info.accounts_delta_hash {
        return Err(SnapshotError::IncorrectAccountsDeltaHash {
            computed: delta_hash,
            expected: bank_hash_info.accounts_delta_hash,
        });
    }

    if let Some(persistence) = &bank_fields.incremental_snapshot_persistence {
        let (full_hash, full_capitalization) =
            accounts_db.calculate_accounts_hash(HashKind::Full {
                max_slot: persistence.full_slot,
            });
        if full_hash != persistence.full_hash {
            return Err(SnapshotError::IncorrectAccountsHash {
                computed: full_hash,
                expected: persistence.full_hash,
            });
        }
        if full_capitalization != persistence.full_capitalization {
            return Err(SnapshotError::IncorrectTotalLamports {
                computed: full_capitalization,
                expected: persistence.full_capitalization,
            });
        }

        let (incremental_hash, incremental_capitalization) =
            accounts_db.calculate_accounts_hash(HashKind::Incremental {
                min_slot: persistence.full_slot,
                max_slot: None,
            });
        if incremental_hash != persistence.incremental_hash {
            return Err(SnapshotError::IncorrectAccountsHash {
                computed: incremental_hash,
                expected: persistence.incremental_hash,
            });
        }
        if incremental_capitalization != persistence.incremental_capitalization {
            return Err(SnapshotError::IncorrectIncrementalLamports {
                computed: incremental_capitalization,
                expected: persistence.incremental_capitalization,
            });
        }
    }
    time.stop();
    info!("snapshot validation passed ({time})");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Full,
    Incremental { base_slot: Slot },
}

/// Emit a snapshot archive for `root_slot` into the snapshot dir,
/// atomically: everything is staged under a `tmp-snapshot-` dir and the
/// finished archive is renamed into place. Cached rooted slots are flushed
/// first so the file set is complete.
///
/// The caller serializes this with the maintenance loop, as the engine's
/// snapshot-writer collaborator does.
pub fn package_snapshot(
    accounts_db: &AccountsDb,
    snapshot_config: &SnapshotConfig,
    root_slot: Slot,
    kind: SnapshotKind,
) -> Result<PathBuf> {
    assert!(
        root_slot <= accounts_db.largest_rooted_slot(),
        "snapshot slot {root_slot} is not rooted",
    );
    let snapshot_dir = &snapshot_config.snapshot_dir;
    fs::create_dir_all(snapshot_dir)?;

    let mut flushable: Vec<Slot> = accounts_db
        .accounts_cache
        .cached_slots()
        .into_iter()
        .filter(|slot| *slot <= root_slot)
        .collect();
    flushable.sort_unstable();
    for slot in flushable {
        accounts_db.flush_slot(slot);
    }

    let mut time = Measure::start("package_snapshot");
    let min_slot = match kind {
        SnapshotKind::Full => None,
        SnapshotKind::Incremental { base_slot } => Some(base_slot),
    };
    let storages = accounts_db.snapshot_storages(min_slot, root_slot);

    // hashes over exactly the packaged range
    let (accounts_hash, capitalization) = accounts_db.calculate_accounts_hash(HashKind::Full {
        max_slot: root_slot,
    });
    let incremental_snapshot_persistence = match kind {
        SnapshotKind::Full => {
            accounts_db.set_latest_full_snapshot(FullSnapshotInfo {
                slot: root_slot,
                hash: accounts_hash,
                capitalization,
            });
            None
        }
        SnapshotKind::Incremental { base_slot } => {
            // the base hash was recorded when the full snapshot was taken;
            // clean has since reclaimed superseded versions below the base,
            // so it cannot be recomputed here
            let base = accounts_db
                .latest_full_snapshot()
                .filter(|info| info.slot == base_slot)
                .ok_or(SnapshotError::MissingFullSnapshotBase(base_slot))?;
            let (incremental_hash, incremental_capitalization) = accounts_db
                .calculate_accounts_hash(HashKind::Incremental {
                    min_slot: base_slot,
                    max_slot: Some(root_slot),
                });
            Some(BankIncrementalSnapshotPersistence {
                full_slot: base_slot,
                full_hash: base.hash,
                full_capitalization: base.capitalization,
                incremental_hash,
                incremental_capitalization,
            })
        }
    };
    let archive_hash = incremental_snapshot_persistence
        .as_ref()
        .map_or(accounts_hash, |persistence| persistence.incremental_hash);

    let mut stats = BankHashStats::default();
    if let Some((_, entry)) = accounts_db.storage.find_by_slot(root_slot) {
        let entry = entry.read().unwrap();
        for stored in entry.accounts().account_iter() {
            stats.update(&stored.clone_account());
        }
    }

    let manifest = SnapshotManifest {
        bank_fields: BankFields {
            slot: root_slot,
            epoch: 0,
            block_height: root_slot,
            parent_slot: root_slot.saturating_sub(1),
            parent_hash: Hash::default(),
            capitalization,
            incremental_snapshot_persistence,
        },
        accounts_db_fields: AccountsDbFields {
            storages: storages.iter().fold(HashMap::new(), |mut map, (slot, id, entry)| {
                map.entry(*slot)
                    .or_insert_with(Vec::new)
                    .push(SerializableAccountStorageEntry {
                        id: *id,
                        accounts_current_len: entry.read().unwrap().written_bytes(),
                    });
                map
            }),
            write_version: accounts_db.write_version(),
            slot: root_slot,
            bank_hash_info: BankHashInfo {
                accounts_delta_hash: accounts_db.calculate_accounts_delta_hash(root_slot),
                accounts_hash,
                stats,
            },
        },
    };

    // stage everything under a tmp dir so a crash leaves no partial archive
    let staging_dir = tempfile::Builder::new()
        .prefix(&format!("{TMP_SNAPSHOT_PREFIX}{root_slot}-"))
        .tempdir_in(snapshot_dir)?;
    let staging_accounts_dir = staging_dir.path().join("accounts");
    let staging_snapshots_dir = staging_dir.path().join("snapshots");
    fs::create_dir_all(&staging_accounts_dir)?;
    fs::create_dir_all(staging_snapshots_dir.join(root_slot.to_string()))?;

    for (slot, id, entry) in &storages {
        let source = entry.read().unwrap().accounts().get_path();
        let target = staging_accounts_dir.join(AppendVec::file_name(*slot, *id));
        if let Err(err) = fs::hard_link(&source, &target) {
            debug!(
                "hard link of {} failed ({err}); copying instead",
                source.display()
            );
            fs::copy(&source, &target)?;
        }
    }
    serde_snapshot::write_manifest(
        unpacked_manifest_path(staging_dir.path(), root_slot),
        &manifest,
    )?;
    // opaque to this engine beyond presence
    fs::write(
        staging_snapshots_dir.join(SNAPSHOT_STATUS_CACHE_FILE_NAME),
        bincode::serialize(&Vec::<Slot>::new())?,
    )?;
    fs::write(
        staging_dir.path().join(SNAPSHOT_VERSION_FILE_NAME),
        SNAPSHOT_VERSION,
    )?;

    let archive_file_name = match kind {
        SnapshotKind::Full => full_snapshot_archive_file_name(root_slot, &archive_hash),
        SnapshotKind::Incremental { base_slot } => {
            incremental_snapshot_archive_file_name(base_slot, root_slot, &archive_hash)
        }
    };
    let archive_path = snapshot_dir.join(&archive_file_name);
    let tmp_archive_path =
        snapshot_dir.join(format!("{TMP_SNAPSHOT_PREFIX}archive-{root_slot}.tar.zst"));
    {
        let archive_file = File::create(&tmp_archive_path)?;
        let encoder = zstd::stream::write::Encoder::new(archive_file, 0)?;
        let mut builder = tar::Builder::new(encoder);
        builder.append_path_with_name(
            staging_dir.path().join(SNAPSHOT_VERSION_FILE_NAME),
            SNAPSHOT_VERSION_FILE_NAME,
        )?;
        builder.append_dir_all("snapshots", &staging_snapshots_dir)?;
        builder.append_dir_all("accounts", &staging_accounts_dir)?;
        let encoder = builder.into_inner()?;
        let mut archive_file = encoder.finish()?;
        archive_file.flush()?;
    }
    fs::rename(&tmp_archive_path, &archive_path)?;

    purge_old_snapshot_archives(snapshot_dir, snapshot_config.maximum_snapshots_to_retain);
    time.stop();

    datapoint_info!(
        "package_snapshot",
        ("slot", root_slot, i64),
        ("files", storages.len(), i64),
        ("time_us", time.as_us(), i64),
    );
    info!("packaged snapshot archive {}", archive_path.display());
    Ok(archive_path)
}

/// Persist the index so the next run can `fastload` without re-parsing
/// account files. Account files and allocator files are retained on disk.
pub fn save_index_sidecar(accounts_db: &AccountsDb, sidecar_path: &Path) -> Result<()> {
    let mut storages = vec![];
    for (id, entry) in accounts_db.storage.entries() {
        let entry = entry.read().unwrap();
        storages.push((
            entry.slot(),
            id,
            entry.written_bytes(),
            entry.accounts().get_path(),
        ));
    }

    let mut references = vec![];
    for bin in 0..accounts_db.accounts_index.num_bins() {
        let mut pubkeys = vec![];
        accounts_db
            .accounts_index
            .scan_bin(bin, |pubkey, _| pubkeys.push(*pubkey));
        for pubkey in pubkeys {
            for node in accounts_db.accounts_index.collect_chain(&pubkey) {
                // un-flushed (cache) versions are unrooted and not persisted
                if let AccountLocation::File { file_id, offset } = node.location {
                    references.push((node.pubkey, node.slot, file_id, offset));
                }
            }
        }
    }

    let sidecar = IndexSidecar {
        bins: accounts_db.accounts_index.num_bins(),
        write_version: accounts_db.write_version(),
        largest_rooted_slot: accounts_db.largest_rooted_slot(),
        storages,
        references,
    };
    serde_snapshot::write_index_sidecar(sidecar_path, &sidecar)?;
    accounts_db.retain_files_on_disk();
    info!(
        "saved index sidecar with {} references to {}",
        sidecar.references.len(),
        sidecar_path.display(),
    );
    Ok(())
}

/// Rebuild index and file map from a prior run's sidecar. No account-file
/// parse and no hash validation happen on this path.
pub fn fastload_from_sidecar(accounts_db: &AccountsDb, sidecar_path: &Path) -> Result<()> {
    let sidecar = serde_snapshot::read_index_sidecar(sidecar_path)?;
    let configured = accounts_db.accounts_index.num_bins();
    if sidecar.bins != configured {
        return Err(SnapshotError::BinCountMismatch {
            sidecar: sidecar.bins,
            configured,
        });
    }

    let mut live: HashMap<FileId, HashSet<usize>> = HashMap::new();
    for (_, _, file_id, offset) in &sidecar.references {
        live.entry(*file_id).or_default().insert(*offset);
    }

    for (slot, id, len, path) in &sidecar.storages {
        let append_vec = AppendVec::new_from_file(path, *len)?;
        let mut entry = AccountStorageEntry::new_existing(*slot, *id, append_vec)?;
        // records the sidecar does not reference died before the save
        let dead_sizes: Vec<usize> = entry
            .accounts()
            .account_iter()
            .filter(|stored| {
                !live
                    .get(id)
                    .map_or(false, |offsets| offsets.contains(&stored.offset))
            })
            .map(|stored| stored.stored_size)
            .collect();
        for stored_size in dead_sizes {
            entry.mark_dead(stored_size);
        }
        accounts_db.publish_storage(entry);
    }

    // per-slot arenas sized by reference count, then chains rebuilt in
    // sidecar order
    let mut per_slot: HashMap<Slot, usize> = HashMap::new();
    for (_, slot, _, _) in &sidecar.references {
        *per_slot.entry(*slot).or_default() += 1;
    }
    let mut blocks = HashMap::new();
    for (slot, count) in per_slot {
        blocks.insert(
            slot,
            accounts_db.accounts_index.alloc_reference_block(slot, count)?,
        );
    }
    for (pubkey, slot, file_id, offset) in sidecar.references {
        let block = blocks[&slot];
        let node = AccountRef::new(
            pubkey,
            slot,
            AccountLocation::File { file_id, offset },
        );
        let ptr = accounts_db.accounts_index.push_ref(block, node)?;
        accounts_db.accounts_index.index_ref(ptr);
    }

    accounts_db.set_write_version(sidecar.write_version);
    accounts_db.add_root(sidecar.largest_rooted_slot);
    info!("fastloaded index from {}", sidecar_path.display());
    Ok(())
}
