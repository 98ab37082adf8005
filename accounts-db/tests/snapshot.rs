//! End-to-end snapshot round trips: build an engine, package archives,
//! load them into a fresh engine, and check that validation and reads
//! agree with the original.

use {
    sable_accounts_db::{
        accounts_db::{AccountsDb, AccountsDbConfig},
        snapshot_utils::{
            fastload_from_sidecar, load_from_snapshot_dir, package_snapshot, save_index_sidecar,
            SnapshotConfig, SnapshotError, SnapshotKind, SNAPSHOT_INDEX_SIDECAR_FILE_NAME,
        },
    },
    sable_sdk::{account::Account, clock::Slot, pubkey::Pubkey},
    std::sync::atomic::AtomicBool,
    tempfile::TempDir,
};

fn test_db() -> AccountsDb {
    AccountsDb::new(AccountsDbConfig {
        number_of_index_shards: 16,
        num_threads_snapshot_load: 2,
        num_threads_snapshot_unpack: 2,
        accounts_per_file_estimate: 64,
        ..AccountsDbConfig::default()
    })
    .unwrap()
}

fn put_accounts(db: &AccountsDb, slot: Slot, count: usize) -> Vec<(Pubkey, Account)> {
    let batch: Vec<(Pubkey, Account)> = (0..count)
        .map(|i| {
            let pubkey = Pubkey::new_unique();
            let mut account = Account::new((i as u64 + 1) * 10, i % 17, &Pubkey::new_unique());
            account.data.fill(i as u8);
            (pubkey, account)
        })
        .collect();
    let (pubkeys, accounts): (Vec<Pubkey>, Vec<Account>) = batch.iter().cloned().unzip();
    db.put_batch(slot, pubkeys, accounts).unwrap();
    batch
}

#[test]
fn test_full_snapshot_round_trip() {
    sable_logger::setup();
    let snapshot_dir = TempDir::new().unwrap();
    let snapshot_config = SnapshotConfig::new(snapshot_dir.path());

    let db = test_db();
    let written = put_accounts(&db, 10, 25);
    let overwritten = put_accounts(&db, 20, 5);
    db.add_root(20);

    let archive = package_snapshot(&db, &snapshot_config, 20, SnapshotKind::Full).unwrap();
    assert!(archive.exists());

    // a fresh engine rebuilt from the archive validates and serves the
    // same state
    let restored = test_db();
    let exit = AtomicBool::new(false);
    let result = load_from_snapshot_dir(&restored, &snapshot_config, &exit).unwrap();
    assert_eq!(result.full_snapshot_slot, 20);
    assert_eq!(result.incremental_snapshot_slot, None);
    assert_eq!(result.bank_fields.slot, 20);

    for (pubkey, account) in written.iter().chain(&overwritten) {
        assert_eq!(&restored.get_account(pubkey).unwrap(), account);
    }
}

#[test]
fn test_incremental_snapshot_round_trip() {
    sable_logger::setup();
    let snapshot_dir = TempDir::new().unwrap();
    let snapshot_config = SnapshotConfig::new(snapshot_dir.path());

    let db = test_db();
    let base = put_accounts(&db, 10, 20);
    db.add_root(10);
    package_snapshot(&db, &snapshot_config, 10, SnapshotKind::Full).unwrap();

    // overwrite a few of the base accounts and add new ones past the base
    let (pubkeys, _): (Vec<Pubkey>, Vec<Account>) = base[..4].iter().cloned().unzip();
    let replacements: Vec<Account> = (0..4)
        .map(|i| Account::new(1_000 + i, 3, &Pubkey::new_unique()))
        .collect();
    db.put_batch(30, pubkeys.clone(), replacements.clone()).unwrap();
    let added = put_accounts(&db, 40, 6);
    db.add_root(40);
    package_snapshot(
        &db,
        &snapshot_config,
        40,
        SnapshotKind::Incremental { base_slot: 10 },
    )
    .unwrap();

    let restored = test_db();
    let exit = AtomicBool::new(false);
    let result = load_from_snapshot_dir(&restored, &snapshot_config, &exit).unwrap();
    assert_eq!(result.full_snapshot_slot, 10);
    assert_eq!(result.incremental_snapshot_slot, Some(40));

    for (pubkey, account) in pubkeys.iter().zip(&replacements) {
        assert_eq!(&restored.get_account(pubkey).unwrap(), account);
    }
    for (pubkey, account) in base[4..].iter().chain(&added) {
        assert_eq!(&restored.get_account(pubkey).unwrap(), account);
    }
}

#[test]
fn test_corrupt_manifest_capitalization_fails_load() {
    sable_logger::setup();
    let snapshot_dir = TempDir::new().unwrap();
    let snapshot_config = SnapshotConfig::new(snapshot_dir.path());

    let db = test_db();
    put_accounts(&db, 10, 8);
    db.add_root(10);
    package_snapshot(&db, &snapshot_config, 10, SnapshotKind::Full).unwrap();

    // cook the manifest inside a rebuilt archive
    let restored = test_db();
    let exit = AtomicBool::new(false);
    // first load to unpack, then corrupt the unpacked manifest and reload
    load_from_snapshot_dir(&restored, &snapshot_config, &exit).unwrap();
    let manifest_path = snapshot_dir
        .path()
        .join("unpacked/full/snapshots/10/10");
    let mut manifest = sable_accounts_db::serde_snapshot::read_manifest(&manifest_path).unwrap();
    manifest.bank_fields.capitalization += 1;
    sable_accounts_db::serde_snapshot::write_manifest(&manifest_path, &manifest).unwrap();

    let broken = test_db();
    let result = load_from_snapshot_dir(&broken, &snapshot_config, &exit);
    assert!(matches!(
        result,
        Err(SnapshotError::IncorrectTotalLamports { .. })
    ));
}

#[test]
fn test_metadata_only_load() {
    sable_logger::setup();
    let snapshot_dir = TempDir::new().unwrap();
    let snapshot_config = SnapshotConfig::new(snapshot_dir.path());

    let db = test_db();
    put_accounts(&db, 10, 4);
    db.add_root(10);
    package_snapshot(&db, &snapshot_config, 10, SnapshotKind::Full).unwrap();

    let restored = AccountsDb::new(AccountsDbConfig {
        number_of_index_shards: 16,
        snapshot_metadata_only: true,
        ..AccountsDbConfig::default()
    })
    .unwrap();
    let exit = AtomicBool::new(false);
    let result = load_from_snapshot_dir(&restored, &snapshot_config, &exit).unwrap();
    assert_eq!(result.bank_fields.slot, 10);
    assert_eq!(result.accounts_loaded, 0);
    assert!(restored.storage.is_empty());
}

#[test]
fn test_index_sidecar_fastload() {
    sable_logger::setup();
    let work_dir = TempDir::new().unwrap();
    let accounts_dir = work_dir.path().join("accounts");
    let sidecar_path = work_dir.path().join(SNAPSHOT_INDEX_SIDECAR_FILE_NAME);

    let written = {
        let db = AccountsDb::new(AccountsDbConfig {
            accounts_dir: Some(accounts_dir.clone()),
            number_of_index_shards: 16,
            save_index: true,
            ..AccountsDbConfig::default()
        })
        .unwrap();
        let written = put_accounts(&db, 10, 12);
        db.add_root(10);
        db.flush_slot(10);
        save_index_sidecar(&db, &sidecar_path).unwrap();
        written
    };

    let db = AccountsDb::new(AccountsDbConfig {
        accounts_dir: Some(accounts_dir),
        number_of_index_shards: 16,
        fastload: true,
        ..AccountsDbConfig::default()
    })
    .unwrap();
    fastload_from_sidecar(&db, &sidecar_path).unwrap();
    assert_eq!(db.largest_rooted_slot(), 10);
    for (pubkey, account) in &written {
        assert_eq!(&db.get_account(pubkey).unwrap(), account);
    }
}

#[test]
fn test_sidecar_bin_count_mismatch() {
    sable_logger::setup();
    let work_dir = TempDir::new().unwrap();
    let sidecar_path = work_dir.path().join(SNAPSHOT_INDEX_SIDECAR_FILE_NAME);

    let db = test_db();
    put_accounts(&db, 10, 2);
    db.add_root(10);
    db.flush_slot(10);
    save_index_sidecar(&db, &sidecar_path).unwrap();

    let other = AccountsDb::new(AccountsDbConfig {
        number_of_index_shards: 32,
        ..AccountsDbConfig::default()
    })
    .unwrap();
    assert!(matches!(
        fastload_from_sidecar(&other, &sidecar_path),
        Err(SnapshotError::BinCountMismatch {
            sidecar: 16,
            configured: 32,
        })
    ));
}
