//! Bincode types for the snapshot manifest and the persisted-index sidecar.
//!
//! The manifest travels inside the snapshot archive as
//! `snapshots/<slot>/<slot>` and tells the loader which account files to
//! expect, plus the hashes and capitalization the rebuilt engine must
//! reproduce.

use {
    crate::account_storage::FileId,
    bincode::{config::Options, Error},
    sable_sdk::{
        account::Account,
        clock::{Epoch, Slot},
        hash::Hash,
        pubkey::Pubkey,
    },
    serde_derive::{Deserialize, Serialize},
    std::{
        collections::HashMap,
        fs::File,
        io::{self, BufReader, BufWriter},
        path::{Path, PathBuf},
    },
};

/// Deserialization cap; a manifest larger than this is corrupt.
const MAX_STREAM_SIZE: u64 = 32 * 1024 * 1024 * 1024;

/// Running totals over the accounts written at one slot, carried in the
/// manifest for observability.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BankHashStats {
    pub num_updated_accounts: u64,
    pub num_removed_accounts: u64,
    pub num_lamports_stored: u64,
    pub total_data_len: u64,
    pub num_executable_accounts: u64,
}

impl BankHashStats {
    pub fn update(&mut self, account: &Account) {
        if account.lamports == 0 {
            self.num_removed_accounts += 1;
        } else {
            self.num_updated_accounts += 1;
        }
        self.total_data_len = self.total_data_len.wrapping_add(account.data.len() as u64);
        if account.executable {
            self.num_executable_accounts += 1;
        }
        self.num_lamports_stored = self.num_lamports_stored.wrapping_add(account.lamports);
    }

    pub fn merge(&mut self, other: &BankHashStats) {
        self.num_updated_accounts += other.num_updated_accounts;
        self.num_removed_accounts += other.num_removed_accounts;
        self.total_data_len = self.total_data_len.wrapping_add(other.total_data_len);
        self.num_executable_accounts += other.num_executable_accounts;
        self.num_lamports_stored = self
            .num_lamports_stored
            .wrapping_add(other.num_lamports_stored);
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BankHashInfo {
    /// merkle root over the manifest slot's own account hashes
    pub accounts_delta_hash: Hash,
    /// merkle root over all live account hashes at the manifest slot
    pub accounts_hash: Hash,
    pub stats: BankHashStats,
}

/// One account file as recorded in the manifest: its id and how many bytes
/// of it hold records.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerializableAccountStorageEntry {
    pub id: FileId,
    pub accounts_current_len: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountsDbFields {
    pub storages: HashMap<Slot, Vec<SerializableAccountStorageEntry>>,
    pub write_version: u64,
    pub slot: Slot,
    pub bank_hash_info: BankHashInfo,
}

/// Carried by an incremental snapshot's manifest so the loader can check
/// both the full hash it builds on and the incremental hash itself.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BankIncrementalSnapshotPersistence {
    pub full_slot: Slot,
    pub full_hash: Hash,
    pub full_capitalization: u64,
    pub incremental_hash: Hash,
    pub incremental_capitalization: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BankFields {
    pub slot: Slot,
    pub epoch: Epoch,
    pub block_height: u64,
    pub parent_slot: Slot,
    pub parent_hash: Hash,
    pub capitalization: u64,
    pub incremental_snapshot_persistence: Option<BankIncrementalSnapshotPersistence>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotManifest {
    pub bank_fields: BankFields,
    pub accounts_db_fields: AccountsDbFields,
}

fn bincode_options() -> impl Options {
    bincode::options()
        .with_limit(MAX_STREAM_SIZE)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

pub fn read_manifest(path: impl AsRef<Path>) -> Result<SnapshotManifest, Error> {
    let file = File::open(path)?;
    let mut stream = BufReader::new(file);
    bincode_options().deserialize_from(&mut stream)
}

pub fn write_manifest(path: impl AsRef<Path>, manifest: &SnapshotManifest) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut stream = BufWriter::new(file);
    bincode_options().serialize_into(&mut stream, manifest)
}

/// The manifests a load starts from: the full snapshot's, and optionally
/// the incremental one stacked on top of it.
#[derive(Debug)]
pub struct SnapshotManifests {
    pub full: SnapshotManifest,
    pub incremental: Option<SnapshotManifest>,
}

impl SnapshotManifests {
    /// Collapse into the effective bank fields and one storage map. The
    /// incremental snapshot only holds slots past the full snapshot's; any
    /// overlap means the archives do not belong together.
    pub fn collapse(self) -> Result<(BankFields, AccountsDbFields), Error> {
        let Some(incremental) = self.incremental else {
            return Ok((self.full.bank_fields, self.full.accounts_db_fields));
        };

        let full_slot = self.full.bank_fields.slot;
        let full_storages = self.full.accounts_db_fields.storages;
        let mut incremental_fields = incremental.accounts_db_fields;
        incremental_fields
            .storages
            .retain(|slot, _| *slot > full_slot);

        if let Some(slot) = incremental_fields
            .storages
            .keys()
            .find(|slot| full_storages.contains_key(slot))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "snapshots are incompatible: slot {slot} has storages in both the full and \
                     the incremental snapshot"
                ),
            )
            .into());
        }

        let mut combined = full_storages;
        combined.extend(incremental_fields.storages);
        incremental_fields.storages = combined;
        Ok((incremental.bank_fields, incremental_fields))
    }
}

/// Sidecar written next to the unpacked account files when the index is
/// persisted across restarts, so a fastload can rebuild the index without
/// re-parsing every account file.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexSidecar {
    pub bins: usize,
    pub write_version: u64,
    pub largest_rooted_slot: Slot,
    /// (slot, file id, current_len, on-disk path) of every live account file
    pub storages: Vec<(Slot, FileId, usize, PathBuf)>,
    /// every live reference: (pubkey, slot, file id, record offset)
    pub references: Vec<(Pubkey, Slot, FileId, usize)>,
}

pub fn read_index_sidecar(path: impl AsRef<Path>) -> Result<IndexSidecar, Error> {
    let file = File::open(path)?;
    let mut stream = BufReader::new(file);
    bincode_options().deserialize_from(&mut stream)
}

pub fn write_index_sidecar(path: impl AsRef<Path>, sidecar: &IndexSidecar) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut stream = BufWriter::new(file);
    bincode_options().serialize_into(&mut stream, sidecar)
}

#[cfg(test)]
pub mod tests {
    use {super::*, tempfile::TempDir};

    fn manifest_with_storages(slot: Slot, storage_slots: &[Slot]) -> SnapshotManifest {
        let storages = storage_slots
            .iter()
            .map(|slot| {
                (
                    *slot,
                    vec![SerializableAccountStorageEntry {
                        id: *slot as FileId,
                        accounts_current_len: 136,
                    }],
                )
            })
            .collect();
        SnapshotManifest {
            bank_fields: BankFields {
                slot,
                capitalization: 100,
                ..BankFields::default()
            },
            accounts_db_fields: AccountsDbFields {
                storages,
                write_version: 1,
                slot,
                bank_hash_info: BankHashInfo::default(),
            },
        }
    }

    #[test]
    fn test_manifest_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("10");
        let manifest = manifest_with_storages(10, &[5, 10]);
        write_manifest(&path, &manifest).unwrap();
        assert_eq!(read_manifest(&path).unwrap(), manifest);
    }

    #[test]
    fn test_collapse_full_only() {
        let manifests = SnapshotManifests {
            full: manifest_with_storages(10, &[5, 10]),
            incremental: None,
        };
        let (bank_fields, accounts_db_fields) = manifests.collapse().unwrap();
        assert_eq!(bank_fields.slot, 10);
        assert_eq!(accounts_db_fields.storages.len(), 2);
    }

    #[test]
    fn test_collapse_with_incremental() {
        let manifests = SnapshotManifests {
            full: manifest_with_storages(10, &[5, 10]),
            // the <= full slot storage is discarded, not an error
            incremental: Some(manifest_with_storages(25, &[8, 20, 25])),
        };
        let (bank_fields, accounts_db_fields) = manifests.collapse().unwrap();
        assert_eq!(bank_fields.slot, 25);
        let mut slots: Vec<_> = accounts_db_fields.storages.keys().copied().collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![5, 10, 20, 25]);
    }

    #[test]
    fn test_index_sidecar_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.bin");
        let sidecar = IndexSidecar {
            bins: 16,
            write_version: 9,
            largest_rooted_slot: 200,
            storages: vec![(200, 3, 4096, PathBuf::from("accounts/200.3"))],
            references: vec![(Pubkey::new_unique(), 200, 3, 0)],
        };
        write_index_sidecar(&path, &sidecar).unwrap();
        assert_eq!(read_index_sidecar(&path).unwrap(), sidecar);
    }
}
