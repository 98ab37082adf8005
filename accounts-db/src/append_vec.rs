//! Append-only account file: the on-disk format for a batch of accounts
//! flushed for a single slot.
//!
//! The file is a sequence of records, each starting on an 8-byte boundary:
//! a [`StoredMeta`] header, an [`AccountMeta`], the account hash, then the
//! account data padded out to the next 8-byte boundary. Files are written
//! once during flush (or unpacked from a snapshot) and are immutable
//! afterwards; readers address records by byte offset.

use {
    crate::account_storage::FileId,
    log::*,
    memmap2::MmapMut,
    sable_sdk::{
        account::Account,
        clock::{Epoch, Slot},
        hash::Hash,
        pubkey::Pubkey,
    },
    std::{
        fs::{remove_file, OpenOptions},
        io::{self, Seek, SeekFrom, Write},
        mem,
        path::{Path, PathBuf},
        ptr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    },
    thiserror::Error,
};

/// Data placement in an account file is 8-byte aligned.
macro_rules! u64_align {
    ($addr: expr) => {
        ($addr + (mem::size_of::<u64>() - 1)) & !(mem::size_of::<u64>() - 1)
    };
}

pub(crate) use u64_align;

/// Maximum length of account data a record may carry.
pub const MAX_PERMITTED_DATA_LENGTH: u64 = 10 * 1024 * 1024;

/// Fixed per-record overhead: [`StoredMeta`] + [`AccountMeta`] + hash.
pub const STORED_META_OVERHEAD: usize = 136;

/// On-disk size of a record holding `data_len` bytes of account data.
pub fn aligned_stored_size(data_len: usize) -> usize {
    u64_align!(STORED_META_OVERHEAD + data_len)
}

#[derive(Error, Debug)]
pub enum AppendVecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("account file {path} is {actual} bytes, shorter than its declared length {declared}")]
    InvalidAccountFileLength {
        path: PathBuf,
        actual: u64,
        declared: usize,
    },

    #[error("malformed account record at offset {offset}")]
    InvalidRecord { offset: usize },
}

pub type Result<T> = std::result::Result<T, AppendVecError>;

/// Header of a record; enough context to rebuild the index from the file
/// alone.
///
/// Backed by mmapped data, so the layout must stay stable.
#[repr(C)]
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StoredMeta {
    /// global order of this write across the engine's lifetime
    pub write_version: u64,
    pub data_len: u64,
    /// key for the account
    pub pubkey: Pubkey,
}

/// Account fields that are not part of the account's data.
///
/// Backed by mmapped data, so the layout must stay stable.
#[repr(C)]
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct AccountMeta {
    /// lamports in the account
    pub lamports: u64,
    /// the epoch at which this account will next owe rent
    pub rent_epoch: Epoch,
    /// the program that owns this account. If executable, the program that loads this account.
    pub owner: Pubkey,
    /// this account's data contains a loaded program (and is now read-only)
    pub executable: bool,
}

impl<'a> From<&'a Account> for AccountMeta {
    fn from(account: &'a Account) -> Self {
        Self {
            lamports: account.lamports,
            rent_epoch: account.rent_epoch,
            owner: account.owner,
            executable: account.executable,
        }
    }
}

/// References to a record's pieces inside the mmap. Getting an owned
/// [`Account`] requires cloning (see [`StoredAccountMeta::clone_account`]).
#[derive(PartialEq, Eq, Debug)]
pub struct StoredAccountMeta<'a> {
    pub meta: &'a StoredMeta,
    pub account_meta: &'a AccountMeta,
    pub hash: &'a Hash,
    pub data: &'a [u8],
    pub offset: usize,
    pub stored_size: usize,
}

impl<'a> StoredAccountMeta<'a> {
    pub fn pubkey(&self) -> &'a Pubkey {
        &self.meta.pubkey
    }

    pub fn lamports(&self) -> u64 {
        self.account_meta.lamports
    }

    pub fn data_len(&self) -> u64 {
        self.meta.data_len
    }

    pub fn write_version(&self) -> u64 {
        self.meta.write_version
    }

    pub fn clone_account(&self) -> Account {
        Account {
            lamports: self.account_meta.lamports,
            data: self.data.to_vec(),
            owner: self.account_meta.owner,
            executable: self.account_meta.executable,
            rent_epoch: self.account_meta.rent_epoch,
        }
    }

    /// Check the record's internal consistency without touching the index.
    pub fn sanitize(&self) -> bool {
        self.sanitize_executable() && self.meta.data_len <= MAX_PERMITTED_DATA_LENGTH
    }

    fn sanitize_executable(&self) -> bool {
        // load the executable byte raw since the mmap'd bool is untrusted
        self.ref_executable_byte() < 2
    }

    fn ref_executable_byte(&self) -> u8 {
        // SAFETY: the AccountMeta sits inside the mmap and executable is its
        // last declared field; reading it as a byte is always in bounds.
        unsafe { *(&self.account_meta.executable as *const bool as *const u8) }
    }
}

/// A thread-safe, file-backed block of memory holding the account records
/// of one slot. Append-only: once a record is written it is never moved or
/// mutated, so readers hold zero-copy views while appends proceed.
#[derive(Debug)]
pub struct AppendVec {
    /// The file path where the data is stored.
    path: PathBuf,

    /// A file-backed memory map of the file's contents.
    map: MmapMut,

    /// The next offset to append to, guarded for the one writer at a time.
    /// Duplicates `current_len` so readers never take the lock.
    append_lock: Mutex<usize>,

    /// The number of bytes used, read by readers without locking.
    current_len: AtomicUsize,

    /// The number of bytes available, always a multiple of the page size.
    file_size: u64,

    /// Unlink the backing file when this value is dropped. Cleared when the
    /// index is being persisted across a restart.
    remove_on_drop: bool,
}

impl Drop for AppendVec {
    fn drop(&mut self) {
        if self.remove_on_drop {
            if let Err(err) = remove_file(&self.path) {
                info!("failed to remove account file {}: {err}", self.path.display());
            }
        }
    }
}

impl AppendVec {
    /// Create (or truncate) the file at `path` with room for `size` bytes of
    /// records. Failure to create the backing store is fatal: a flush that
    /// cannot write a rooted slot's accounts is unrecoverable.
    pub fn new(path: &Path, size: usize) -> Self {
        let mut data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap_or_else(|err| {
                panic!(
                    "Unable to create account file {} in {:?}: {err}",
                    path.display(),
                    std::env::current_dir(),
                );
            });

        // Write a zero to the end of the file so that it holds its full size
        // without a resize on every append.
        let file_size = u64_align!(size.max(1)) as u64;
        data.seek(SeekFrom::Start(file_size - 1)).unwrap();
        data.write_all(&[0]).unwrap();
        data.rewind().unwrap();
        data.flush().unwrap();

        let map = unsafe { MmapMut::map_mut(&data) }.unwrap_or_else(|err| {
            panic!("Unable to mmap account file {}: {err}", path.display());
        });

        Self {
            path: path.to_path_buf(),
            map,
            append_lock: Mutex::new(0),
            current_len: AtomicUsize::new(0),
            file_size,
            remove_on_drop: true,
        }
    }

    /// Map an existing file (snapshot unpack or restart), retaining the
    /// externally declared `current_len`. Fails if the file on disk is
    /// shorter than declared.
    pub fn new_from_file(path: impl AsRef<Path>, current_len: usize) -> Result<Self> {
        let path = path.as_ref();
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)?;

        let actual = data.metadata()?.len();
        if actual < current_len as u64 {
            return Err(AppendVecError::InvalidAccountFileLength {
                path: path.to_path_buf(),
                actual,
                declared: current_len,
            });
        }

        let map = unsafe { MmapMut::map_mut(&data)? };
        Ok(Self {
            path: path.to_path_buf(),
            map,
            append_lock: Mutex::new(current_len),
            current_len: AtomicUsize::new(current_len),
            file_size: actual,
            remove_on_drop: true,
        })
    }

    /// The file name account files are stored under, within the accounts
    /// directory.
    pub fn file_name(slot: Slot, id: FileId) -> String {
        format!("{slot}.{id}")
    }

    pub fn set_no_remove_on_drop(&mut self) {
        self.remove_on_drop = false;
    }

    /// How many bytes are used by records.
    pub fn len(&self) -> usize {
        self.current_len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many bytes the backing file holds.
    pub fn capacity(&self) -> u64 {
        self.file_size
    }

    pub fn get_path(&self) -> PathBuf {
        self.path.clone()
    }

    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }

    /// Forget all stored records. Only legal once every record is dead and
    /// no reader can hold an offset into the file.
    pub fn reset(&self) {
        let mut offset = self.append_lock.lock().unwrap();
        self.current_len.store(0, Ordering::Release);
        *offset = 0;
    }

    /// Iterate records from offset 0, verifying each one, and return the
    /// record count. The walk must land exactly on the 8-byte-aligned end
    /// of the declared length, otherwise the file is corrupt.
    pub fn sanitize(&self) -> Result<usize> {
        let aligned_len = u64_align!(self.len());
        let mut offset = 0;
        let mut num_accounts = 0;
        while offset < aligned_len {
            let (account, next) = self
                .get_account(offset)
                .ok_or(AppendVecError::InvalidRecord { offset })?;
            if !account.sanitize() || next > aligned_len {
                return Err(AppendVecError::InvalidRecord { offset });
            }
            offset = next;
            num_accounts += 1;
        }
        if offset != aligned_len {
            return Err(AppendVecError::InvalidRecord { offset });
        }
        Ok(num_accounts)
    }

    /// Get a slice of `size` bytes starting at `offset`, and the offset
    /// after it, if the range is fully inside the used bytes.
    fn get_slice(&self, offset: usize, size: usize) -> Option<(&[u8], usize)> {
        let (next, overflow) = offset.overflowing_add(size);
        if overflow || next > self.len() {
            return None;
        }
        let data = &self.map[offset..next];
        let next = u64_align!(next);
        Some((data, next))
    }

    /// Return a reference to the type at `offset` and the aligned offset
    /// after it.
    ///
    /// SAFETY: callers only request `#[repr(C)]` types whose alignment
    /// divides 8; `offset` is validated to be 8-byte aligned and the mmap
    /// itself is page aligned.
    fn get_type<T>(&self, offset: usize) -> Option<(&T, usize)> {
        let (data, next) = self.get_slice(offset, mem::size_of::<T>())?;
        let ptr = data.as_ptr() as *const T;
        Some((unsafe { &*ptr }, next))
    }

    /// Return the record starting at `offset`, as zero-copy views into the
    /// mmap, along with the offset of the next record. `None` when `offset`
    /// is not a record boundary or the record runs past the used bytes.
    pub fn get_account(&self, offset: usize) -> Option<(StoredAccountMeta, usize)> {
        if offset != u64_align!(offset) {
            return None;
        }
        let (meta, next) = self.get_type::<StoredMeta>(offset)?;
        if meta.data_len > MAX_PERMITTED_DATA_LENGTH {
            return None;
        }
        let (account_meta, next) = self.get_type::<AccountMeta>(next)?;
        let (hash, next) = self.get_type::<Hash>(next)?;
        let (data, next) = self.get_slice(next, meta.data_len as usize)?;
        let stored_size = next - offset;
        Some((
            StoredAccountMeta {
                meta,
                account_meta,
                hash,
                data,
                offset,
                stored_size,
            },
            next,
        ))
    }

    /// Return iterator for account metadata
    pub fn account_iter(&self) -> AppendVecAccountsIter {
        AppendVecAccountsIter::new(self)
    }

    /// Return all the records appended at or after `offset`.
    pub fn accounts(&self, mut offset: usize) -> Vec<StoredAccountMeta> {
        let mut accounts = vec![];
        while let Some((account, next)) = self.get_account(offset) {
            accounts.push(account);
            offset = next;
        }
        accounts
    }

    /// Copy `len` bytes into the file at the aligned position after
    /// `*offset`, zeroing any alignment gap, and advance `*offset`.
    fn append_ptr(&self, offset: &mut usize, src: *const u8, len: usize) {
        let pos = u64_align!(*offset);
        let data = &self.map[pos..(pos + len)];
        // SAFETY: the append lock is held, so no other writer owns this
        // region, and `get_slice` bounds readers by `current_len`, which
        // still excludes it.
        unsafe {
            let dst = data.as_ptr() as *mut u8;
            ptr::copy(src, dst, len);
        };
        *offset = pos + len;
    }

    /// Append one record. Returns the record's starting offset, or `None`
    /// if the file has no room.
    pub fn append_account(&self, meta: StoredMeta, account: &Account, hash: Hash) -> Option<usize> {
        let mut offset = self.append_lock.lock().unwrap();

        let pos = u64_align!(*offset);
        let stored_size = aligned_stored_size(account.data.len());
        if pos + stored_size > self.capacity() as usize {
            return None;
        }

        // StoredMeta has no interior padding; AccountMeta does, so it is
        // staged in a zeroed buffer first and no uninitialized bytes reach
        // the file.
        let account_meta = AccountMeta::from(account);
        let mut account_meta_bytes = [0u8; mem::size_of::<AccountMeta>()];
        account_meta_bytes[0..8].copy_from_slice(&account_meta.lamports.to_le_bytes());
        account_meta_bytes[8..16].copy_from_slice(&account_meta.rent_epoch.to_le_bytes());
        account_meta_bytes[16..48].copy_from_slice(account_meta.owner.as_ref());
        account_meta_bytes[48] = account_meta.executable as u8;

        let mut write_offset = pos;
        self.append_ptr(
            &mut write_offset,
            &meta as *const StoredMeta as *const u8,
            mem::size_of::<StoredMeta>(),
        );
        self.append_ptr(
            &mut write_offset,
            account_meta_bytes.as_ptr(),
            account_meta_bytes.len(),
        );
        self.append_ptr(
            &mut write_offset,
            hash.as_ref().as_ptr(),
            mem::size_of::<Hash>(),
        );
        self.append_ptr(&mut write_offset, account.data.as_ptr(), account.data.len());

        // zero the alignment gap after the data; append_ptr would skip past
        // it, so the gap is written directly
        let data_pad = u64_align!(write_offset) - write_offset;
        if data_pad > 0 {
            let gap = &self.map[write_offset..write_offset + data_pad];
            // SAFETY: same exclusivity argument as append_ptr
            unsafe {
                ptr::write_bytes(gap.as_ptr() as *mut u8, 0, data_pad);
            }
            write_offset += data_pad;
        }

        debug_assert_eq!(write_offset, pos + stored_size);
        *offset = write_offset;
        self.current_len.store(write_offset, Ordering::Release);
        Some(pos)
    }

    /// Append a whole batch, returning each record's starting offset. The
    /// last element is the offset one past the final record, so callers get
    /// `accounts.len() + 1` offsets on success and `None` once the file
    /// runs out of room.
    pub fn append_accounts(
        &self,
        accounts: &[(StoredMeta, &Account)],
        hashes: &[Hash],
    ) -> Option<Vec<usize>> {
        assert_eq!(accounts.len(), hashes.len());
        let mut offsets = Vec::with_capacity(accounts.len() + 1);
        for ((meta, account), hash) in accounts.iter().zip(hashes) {
            let offset = self.append_account(meta.clone(), account, *hash)?;
            offsets.push(offset);
        }
        offsets.push(self.len());
        Some(offsets)
    }
}

/// Iterate over all the accounts in the append vec, in offset order.
pub struct AppendVecAccountsIter<'a> {
    append_vec: &'a AppendVec,
    offset: usize,
}

impl<'a> AppendVecAccountsIter<'a> {
    pub fn new(append_vec: &'a AppendVec) -> Self {
        Self {
            append_vec,
            offset: 0,
        }
    }
}

impl<'a> Iterator for AppendVecAccountsIter<'a> {
    type Item = StoredAccountMeta<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some((account, next_offset)) = self.append_vec.get_account(self.offset) {
            self.offset = next_offset;
            Some(account)
        } else {
            None
        }
    }
}

#[cfg(test)]
pub mod tests {
    use {super::*, rand::Rng, tempfile::TempDir};

    fn rand_account(data_len: usize) -> Account {
        let mut rng = rand::thread_rng();
        let mut account = Account::new(rng.gen_range(1..u32::MAX as u64), data_len, &Pubkey::new_unique());
        rng.fill(&mut account.data[..]);
        account.rent_epoch = rng.gen();
        account
    }

    fn stored_meta(account: &Account, write_version: u64) -> StoredMeta {
        StoredMeta {
            write_version,
            data_len: account.data.len() as u64,
            pubkey: Pubkey::new_unique(),
        }
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(mem::size_of::<StoredMeta>(), 48);
        assert_eq!(mem::size_of::<AccountMeta>(), 56);
        assert_eq!(
            STORED_META_OVERHEAD,
            mem::size_of::<StoredMeta>() + mem::size_of::<AccountMeta>() + mem::size_of::<Hash>()
        );
        assert_eq!(aligned_stored_size(0), 136);
        assert_eq!(aligned_stored_size(1), 144);
        assert_eq!(aligned_stored_size(8), 144);
    }

    #[test]
    fn test_append_and_get() {
        let dir = TempDir::new().unwrap();
        let av = AppendVec::new(&dir.path().join("200.0"), 1024 * 1024);

        let account = rand_account(5);
        let meta = stored_meta(&account, 7);
        let offset = av.append_account(meta.clone(), &account, Hash::default()).unwrap();
        assert_eq!(offset, 0);

        let (stored, next) = av.get_account(offset).unwrap();
        assert_eq!(stored.meta, &meta);
        assert_eq!(stored.clone_account(), account);
        assert_eq!(stored.stored_size, aligned_stored_size(5));
        assert_eq!(next, aligned_stored_size(5));
        assert_eq!(av.len(), next);
    }

    #[test]
    fn test_get_account_off_boundary() {
        let dir = TempDir::new().unwrap();
        let av = AppendVec::new(&dir.path().join("200.0"), 1024 * 1024);
        let account = rand_account(32);
        av.append_account(stored_meta(&account, 0), &account, Hash::default())
            .unwrap();

        assert!(av.get_account(3).is_none());
        // aligned but mid-record: the "data_len" read there is garbage large
        // or walks past the end
        assert!(av.get_account(av.len()).is_none());
    }

    #[test]
    fn test_append_many_and_iterate() {
        let dir = TempDir::new().unwrap();
        let av = AppendVec::new(&dir.path().join("200.0"), 1024 * 1024);

        let accounts: Vec<_> = (0..16).map(|i| rand_account(i * 9)).collect();
        let mut offsets = vec![];
        for (i, account) in accounts.iter().enumerate() {
            offsets.push(
                av.append_account(stored_meta(account, i as u64), account, Hash::default())
                    .unwrap(),
            );
        }

        for (offset, account) in offsets.iter().zip(&accounts) {
            let (stored, _) = av.get_account(*offset).unwrap();
            assert_eq!(&stored.clone_account(), account);
        }

        let iterated: Vec<_> = av.account_iter().map(|stored| stored.clone_account()).collect();
        assert_eq!(iterated, accounts);
        assert_eq!(av.accounts(0).len(), accounts.len());
        assert_eq!(av.sanitize().unwrap(), accounts.len());
    }

    #[test]
    fn test_append_full() {
        let dir = TempDir::new().unwrap();
        let av = AppendVec::new(&dir.path().join("200.0"), aligned_stored_size(0));
        let account = Account::new(1, 0, &Pubkey::new_unique());
        assert!(av
            .append_account(stored_meta(&account, 0), &account, Hash::default())
            .is_some());
        assert!(av
            .append_account(stored_meta(&account, 1), &account, Hash::default())
            .is_none());
    }

    #[test]
    fn test_new_from_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("200.0");
        let account = rand_account(77);
        let len = {
            let av = AppendVec::new(&path, 1024 * 1024);
            av.append_account(stored_meta(&account, 3), &account, Hash::default())
                .unwrap();
            av.flush().unwrap();
            let mut av = av;
            av.set_no_remove_on_drop();
            av.len()
        };

        let av = AppendVec::new_from_file(&path, len).unwrap();
        assert_eq!(av.sanitize().unwrap(), 1);
        let (stored, _) = av.get_account(0).unwrap();
        assert_eq!(stored.clone_account(), account);
    }

    #[test]
    fn test_new_from_file_too_short() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("200.0");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(matches!(
            AppendVec::new_from_file(&path, 1024),
            Err(AppendVecError::InvalidAccountFileLength { .. })
        ));
    }

    #[test]
    fn test_sanitize_rejects_garbage_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("200.0");
        let account = rand_account(16);
        let len = {
            let mut av = AppendVec::new(&path, 1024 * 1024);
            av.append_account(stored_meta(&account, 0), &account, Hash::default())
                .unwrap();
            av.flush().unwrap();
            av.set_no_remove_on_drop();
            av.len()
        };

        // claim more used bytes than were appended; the walk lands inside
        // zeroed space and cannot terminate exactly at the declared end
        let av = AppendVec::new_from_file(&path, len + 8).unwrap();
        assert!(av.sanitize().is_err());
    }

    #[test]
    fn test_sanitize_rejects_bad_executable_byte() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("200.0");
        let account = rand_account(0);
        let (len, exe_offset) = {
            let mut av = AppendVec::new(&path, 4096);
            av.append_account(stored_meta(&account, 0), &account, Hash::default())
                .unwrap();
            av.flush().unwrap();
            av.set_no_remove_on_drop();
            // executable is the last declared field of AccountMeta
            (av.len(), mem::size_of::<StoredMeta>() + 48)
        };

        let mut raw = std::fs::read(&path).unwrap();
        raw[exe_offset] = 3;
        std::fs::write(&path, raw).unwrap();

        let av = AppendVec::new_from_file(&path, len).unwrap();
        assert!(av.sanitize().is_err());
    }
}
