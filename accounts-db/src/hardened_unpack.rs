//! Limit-checked, traversal-safe extraction of snapshot tar archives.
//!
//! Snapshot archives come from other validators over the network, so every
//! entry path is vetted before it touches the filesystem and the unpacked
//! totals are capped. Entries can also be striped across several readers of
//! the same archive with a [`ParallelSelector`], which is how snapshot
//! unpack saturates wide machines.

use {
    crossbeam_channel::Sender,
    log::*,
    sable_sdk::clock::Slot,
    std::{
        fs,
        io::Read,
        path::{
            Component::{self, CurDir, Normal},
            Path, PathBuf,
        },
        time::Instant,
    },
    tar::{
        Archive,
        EntryType::{Directory, GNUSparse, Regular},
    },
    thiserror::Error,
};

#[derive(Error, Debug)]
pub enum UnpackError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Archive error: {0}")]
    Archive(String),
}

pub type Result<T> = std::result::Result<T, UnpackError>;

// 64 TiB: the file size including holes for sparse files, directly related
// to the mmaped data size, so protect against an insane value
const MAX_SNAPSHOT_ARCHIVE_UNPACKED_APPARENT_SIZE: u64 = 64 * 1024 * 1024 * 1024 * 1024;

// 4 TiB: the actually consumed disk usage for sparse files
const MAX_SNAPSHOT_ARCHIVE_UNPACKED_ACTUAL_SIZE: u64 = 4 * 1024 * 1024 * 1024 * 1024;

const MAX_SNAPSHOT_ARCHIVE_UNPACKED_COUNT: u64 = 5_000_000;

fn checked_total_size_sum(total_size: u64, entry_size: u64, limit_size: u64) -> Result<u64> {
    let total_size = total_size.saturating_add(entry_size);
    if total_size > limit_size {
        return Err(UnpackError::Archive(format!(
            "too large archive: {total_size} than limit: {limit_size}",
        )));
    }
    Ok(total_size)
}

fn checked_total_count_increment(total_count: u64, limit_count: u64) -> Result<u64> {
    let total_count = total_count + 1;
    if total_count > limit_count {
        return Err(UnpackError::Archive(format!(
            "too many files in snapshot: {total_count}"
        )));
    }
    Ok(total_count)
}

/// Select only `index` out of each `divisions` of account-file entries, so
/// `divisions` readers of the same archive split the work without
/// coordinating.
#[derive(Debug, Clone, Copy)]
pub struct ParallelSelector {
    pub index: usize,
    pub divisions: usize,
}

impl ParallelSelector {
    pub fn select_index(&self, index: usize) -> bool {
        index % self.divisions == self.index
    }

    /// Entries that exist once per archive (manifest, status cache) belong
    /// to exactly one reader.
    fn primary(&self) -> bool {
        self.index == 0
    }
}

/// `accounts/<slot>.<id>`
pub fn parse_storage_file_name(name: &str) -> Option<(Slot, usize)> {
    let (slot, id) = name.split_once('.')?;
    Some((slot.parse().ok()?, id.parse().ok()?))
}

fn is_slot_string(name: &str) -> bool {
    name.parse::<Slot>().is_ok()
}

fn is_valid_snapshot_archive_entry(parts: &[&str], kind: tar::EntryType) -> bool {
    match (parts, kind) {
        (["accounts"], Directory) => true,
        (["accounts", file], GNUSparse) | (["accounts", file], Regular) => {
            parse_storage_file_name(file).is_some()
        }
        (["snapshots"], Directory) => true,
        (["snapshots", "status_cache"], GNUSparse) | (["snapshots", "status_cache"], Regular) => {
            true
        }
        (["snapshots", dir], Directory) => is_slot_string(dir),
        (["snapshots", dir, file], GNUSparse) | (["snapshots", dir, file], Regular) => {
            is_slot_string(dir) && dir == file
        }
        (["version"], Regular) => true,
        _ => false,
    }
}

/// Unpack a snapshot archive into `unpack_dir`, returning the paths of the
/// unpacked account files.
pub fn unpack_snapshot<A: Read>(
    archive: &mut Archive<A>,
    unpack_dir: &Path,
    parallel_selector: Option<ParallelSelector>,
) -> Result<Vec<PathBuf>> {
    let mut unpacked = vec![];
    unpack_snapshot_with_processor(archive, unpack_dir, parallel_selector, |path| {
        unpacked.push(path)
    })?;
    Ok(unpacked)
}

/// Unpack a snapshot archive, sending each unpacked account file's path
/// through `sender` as soon as it lands, so parsing can start while the
/// unpack is still running.
pub fn streaming_unpack_snapshot<A: Read>(
    archive: &mut Archive<A>,
    unpack_dir: &Path,
    parallel_selector: Option<ParallelSelector>,
    sender: &Sender<PathBuf>,
) -> Result<()> {
    unpack_snapshot_with_processor(archive, unpack_dir, parallel_selector, |path| {
        if let Err(err) = sender.send(path) {
            warn!("streaming unpack receiver hung up: {err}");
        }
    })
}

fn unpack_snapshot_with_processor<A, F>(
    archive: &mut Archive<A>,
    unpack_dir: &Path,
    parallel_selector: Option<ParallelSelector>,
    mut account_file_processor: F,
) -> Result<()>
where
    A: Read,
    F: FnMut(PathBuf),
{
    let mut apparent_total_size: u64 = 0;
    let mut actual_total_size: u64 = 0;
    let mut total_count: u64 = 0;

    let mut total_entries = 0;
    let mut account_file_index = 0;
    let mut last_log_update = Instant::now();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;
        let path_str = path.display().to_string();

        // Fail before the `tar` crate does on odd paths (`..`, absolute, or
        // Windows prefixes) for clearer pattern matching below.
        let parts = path
            .components()
            .map(|p| match p {
                CurDir => Some("."),
                Normal(c) => c.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>();

        // Reject old-style BSD directory entries that aren't explicitly
        // tagged as directories
        let legacy_dir_entry =
            entry.header().as_ustar().is_none() && entry.path_bytes().ends_with(b"/");
        let kind = entry.header().entry_type();
        let reject_legacy_dir_entry = legacy_dir_entry && (kind != Directory);

        let Some(parts) = parts else {
            return Err(UnpackError::Archive(format!(
                "invalid path found: {path_str:?}"
            )));
        };
        if reject_legacy_dir_entry {
            return Err(UnpackError::Archive(format!(
                "invalid path found: {path_str:?}"
            )));
        }

        if !is_valid_snapshot_archive_entry(parts.as_slice(), kind) {
            return Err(UnpackError::Archive(format!(
                "extra entry found: {path_str:?} {kind:?}"
            )));
        }

        let is_account_file = matches!(parts.as_slice(), ["accounts", _]);
        let selected = match (&parallel_selector, is_account_file) {
            (Some(selector), true) => {
                let selected = selector.select_index(account_file_index);
                account_file_index += 1;
                selected
            }
            (Some(selector), false) => selector.primary(),
            (None, _) => true,
        };
        if !selected {
            continue;
        }

        apparent_total_size = checked_total_size_sum(
            apparent_total_size,
            entry.header().size()?,
            MAX_SNAPSHOT_ARCHIVE_UNPACKED_APPARENT_SIZE,
        )?;
        actual_total_size = checked_total_size_sum(
            actual_total_size,
            entry.header().entry_size()?,
            MAX_SNAPSHOT_ARCHIVE_UNPACKED_ACTUAL_SIZE,
        )?;
        total_count =
            checked_total_count_increment(total_count, MAX_SNAPSHOT_ARCHIVE_UNPACKED_COUNT)?;

        let account_path = sanitize_path(&entry.path()?, unpack_dir)?;
        let Some(target) = account_path else {
            continue;
        };

        entry.unpack(&target)?;

        // Sanitize permissions.
        let mode = match kind {
            GNUSparse | Regular => 0o644,
            _ => 0o755,
        };
        set_perms(&target, mode)?;

        if is_account_file {
            account_file_processor(target);
        }

        total_entries += 1;
        let now = Instant::now();
        if now.duration_since(last_log_update).as_secs() >= 10 {
            info!("unpacked {total_entries} entries so far...");
            last_log_update = now;
        }
    }
    debug!("unpacked {total_entries} entries total");

    return Ok(());

    #[cfg(unix)]
    fn set_perms(dst: &Path, mode: u32) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let perm = fs::Permissions::from_mode(mode as _);
        fs::set_permissions(dst, perm)
    }

    #[cfg(windows)]
    fn set_perms(dst: &Path, _mode: u32) -> std::io::Result<()> {
        let mut perm = fs::metadata(dst)?.permissions();
        perm.set_readonly(false);
        fs::set_permissions(dst, perm)
    }
}

// return Err on file system error
// return Some(path) if path is good
// return None if we should skip this file
fn sanitize_path(entry_path: &Path, dst: &Path) -> Result<Option<PathBuf>> {
    // code adapted from tar::Entry::unpack_in, which cannot be used
    // directly because it refuses to unpack into pre-existing directories
    let mut file_dst = dst.to_path_buf();
    const SKIP: Result<Option<PathBuf>> = Ok(None);
    {
        for part in entry_path.components() {
            match part {
                // Leading '/' characters, root paths, and '.' components
                // are just ignored and treated as "empty components"
                Component::Prefix(..) | Component::RootDir | Component::CurDir => continue,

                // If any part of the filename is '..', then skip over
                // unpacking the file to prevent directory traversal
                // security issues.  See, e.g.: CVE-2001-1267,
                // CVE-2002-0399, CVE-2005-1918, CVE-2007-4131
                Component::ParentDir => return SKIP,

                Component::Normal(part) => file_dst.push(part),
            }
        }
    }

    // Skip cases where only slashes or '.' parts were seen, because this is
    // effectively an empty filename.
    if *dst == *file_dst {
        return SKIP;
    }

    // Skip entries without a parent (i.e. outside of FS root)
    let Some(parent) = file_dst.parent() else {
        return SKIP;
    };

    fs::create_dir_all(parent)?;

    // Abort if the canonical parent escaped `dst`
    let canon_parent = parent.canonicalize().map_err(|err| {
        UnpackError::Archive(format!("{err} while canonicalizing {}", parent.display()))
    })?;
    let canon_target = dst.canonicalize().map_err(|err| {
        UnpackError::Archive(format!("{err} while canonicalizing {}", dst.display()))
    })?;
    if !canon_parent.starts_with(&canon_target) {
        return Err(UnpackError::Archive(format!(
            "trying to unpack outside of destination path: {}",
            canon_target.display()
        )));
    }

    let Some(file_name) = entry_path.file_name() else {
        return SKIP;
    };
    Ok(Some(parent.join(file_name)))
}
