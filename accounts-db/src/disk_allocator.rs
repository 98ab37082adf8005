//! File-backed memory allocator.
//!
//! The index's bins and reference arenas can reach tens of gigabytes;
//! backing them with file-backed mappings lets the operating system page
//! them in and out transparently, and lets a restart reuse the files when
//! the index is being persisted. Allocations are whole mmap'd files named
//! `<base>_<N>`; freeing is just unmapping, and the files themselves stay
//! on disk until the allocator is torn down.
//!
//! There is no resize: callers that outgrow a block allocate a new one and
//! migrate, which is how every user of this allocator behaves anyway
//! (tables rehash, arenas are rebuilt by shrink).

use {
    log::*,
    memmap2::MmapMut,
    std::{
        fs::{remove_file, OpenOptions},
        io::{self, Seek, SeekFrom, Write},
        mem,
        path::PathBuf,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
    },
};

const PAGE_SIZE: usize = 4 * 1024;

fn page_align(size: usize) -> usize {
    (size + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

#[derive(Debug)]
pub struct DiskAllocator {
    /// files are created as `<base>_<N>`
    base: PathBuf,

    /// next file ordinal, and the files created so far; one lock makes
    /// alloc thread-safe and teardown complete
    state: Mutex<AllocatorState>,

    /// leave the files on disk at teardown so a restart can reuse them
    retain_files: AtomicBool,
}

#[derive(Debug, Default)]
struct AllocatorState {
    file_counter: u64,
    files: Vec<PathBuf>,
}

impl DiskAllocator {
    pub fn new(base: impl Into<PathBuf>) -> io::Result<Self> {
        let base = base.into();
        if let Some(parent) = base.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            base,
            state: Mutex::new(AllocatorState::default()),
            retain_files: AtomicBool::new(false),
        })
    }

    /// Create the next `<base>_<N>` file, sized up to the next page
    /// boundary, and hand back its writable mapping. Mappings are page
    /// aligned, which covers every `align` a caller may need. Dropping the
    /// mapping is the `free`; the file stays until the allocator is
    /// dropped.
    pub fn allocate(&self, size: usize, align: usize) -> io::Result<MmapMut> {
        assert!(align.is_power_of_two() && align <= PAGE_SIZE);
        let path = {
            let mut state = self.state.lock().unwrap();
            let path = PathBuf::from(format!("{}_{}", self.base.display(), state.file_counter));
            state.file_counter += 1;
            state.files.push(path.clone());
            path
        };

        let file_size = page_align(size.max(1));
        let mut data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        // write a zero at the end so the file holds its full size up front
        data.seek(SeekFrom::Start(file_size as u64 - 1))?;
        data.write_all(&[0])?;
        data.rewind()?;
        data.flush()?;

        unsafe { MmapMut::map_mut(&data) }
    }

    /// Number of backing files created so far.
    pub fn file_count(&self) -> u64 {
        self.state.lock().unwrap().file_counter
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().files.clone()
    }

    /// Keep the backing files at teardown (index persistence across
    /// restarts).
    pub fn set_retain_files(&self) {
        self.retain_files.store(true, Ordering::Relaxed);
    }
}

impl Drop for DiskAllocator {
    fn drop(&mut self) {
        if self.retain_files.load(Ordering::Relaxed) {
            return;
        }
        let state = self.state.lock().unwrap();
        for path in &state.files {
            if let Err(err) = remove_file(path) {
                warn!("failed to remove allocator file {}: {err}", path.display());
            }
        }
    }
}

/// Where index memory comes from: anonymous mappings when the index fits in
/// RAM, allocator files when it does not (`use_disk_index`). Either way the
/// caller holds a uniform [`IndexBlock`].
#[derive(Clone, Debug)]
pub enum IndexAllocator {
    Heap,
    Disk(Arc<DiskAllocator>),
}

impl IndexAllocator {
    pub fn allocate(&self, bytes: usize) -> io::Result<IndexBlock> {
        let mmap = match self {
            Self::Heap => MmapMut::map_anon(bytes.max(1))?,
            Self::Disk(allocator) => allocator.allocate(bytes, mem::align_of::<u64>())?,
        };
        Ok(IndexBlock { mmap })
    }
}

/// One allocation. Dropping it unmaps the memory; for disk-backed blocks
/// the underlying file is owned by the allocator.
#[derive(Debug)]
pub struct IndexBlock {
    mmap: MmapMut,
}

impl IndexBlock {
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }
}
