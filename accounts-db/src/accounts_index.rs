//! The account index: for every pubkey, a chain of version nodes recording
//! which slots wrote the account and where each version physically lives.
//!
//! The index is sharded into a power-of-two number of bins keyed by the
//! pubkey's leading bytes; each bin is an independently locked
//! [`PubkeyMap`] from pubkey to the head of that key's chain. The nodes
//! themselves live outside the bins in *reference memory*: per-slot blocks
//! of plain [`AccountRef`] structs, allocated together and addressed by a
//! stable [`RefPtr`], so bins only ever store and swap 16-byte pointers.
//!
//! Chain nodes of one pubkey all live in one bin, so mutating a chain
//! (appending, unlinking, updating a node's location) is serialized by that
//! bin's lock even though the nodes sit in blocks shared across bins.

use {
    crate::{
        disk_allocator::{IndexAllocator, IndexBlock},
        pubkey_bins::PubkeyBinCalculator24,
        pubkey_map::PubkeyMap,
    },
    dashmap::DashMap,
    sable_sdk::{clock::Slot, pubkey::Pubkey},
    std::{
        io, mem,
        sync::{
            atomic::{AtomicU64, AtomicUsize, Ordering},
            Arc, RwLock,
        },
    },
    thiserror::Error,
};

use crate::account_storage::FileId;

pub type BlockId = u64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IndexError {
    #[error("reference memory block not found")]
    MemoryNotFound,

    #[error("reference memory block exhausted")]
    OutOfReferenceMemory,
}

/// Where one version of an account physically lives.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountLocation {
    /// byte offset of the record inside a flushed account file
    File { file_id: FileId, offset: usize },
    /// position within the slot's batch in the write-back cache
    Cache { index: usize },
}

/// Stable address of a version node inside the reference memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefPtr {
    block: BlockId,
    index: u32,
}

impl RefPtr {
    /// Chain terminator, stored in place of an `Option` so nodes stay plain
    /// data inside their mmap'd block.
    const NONE: RefPtr = RefPtr {
        block: BlockId::MAX,
        index: u32::MAX,
    };

    fn as_option(self) -> Option<RefPtr> {
        (self != Self::NONE).then_some(self)
    }
}

/// One version node in a pubkey's chain.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountRef {
    pub pubkey: Pubkey,
    pub slot: Slot,
    pub location: AccountLocation,
    /// intrusive link to the next node of the same pubkey
    next: RefPtr,
}

impl AccountRef {
    pub fn new(pubkey: Pubkey, slot: Slot, location: AccountLocation) -> Self {
        Self {
            pubkey,
            slot,
            location,
            next: RefPtr::NONE,
        }
    }

    pub fn next(&self) -> Option<RefPtr> {
        self.next.as_option()
    }
}

/// A contiguous block of version nodes, allocated once and filled in
/// append order. Blocks are owned by one or more slots (snapshot-load
/// workers batch many slots into one block) and are unmapped when the last
/// owning slot releases them.
#[derive(Debug)]
pub struct ReferenceBlock {
    memory: IndexBlock,
    capacity: usize,
    len: AtomicUsize,
    owners: AtomicUsize,
}

impl ReferenceBlock {
    fn new(memory: IndexBlock, capacity: usize, owners: usize) -> Self {
        Self {
            memory,
            capacity,
            len: AtomicUsize::new(0),
            owners: AtomicUsize::new(owners),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ptr(&self) -> *const AccountRef {
        self.memory.as_slice().as_ptr() as *const AccountRef
    }

    fn get(&self, index: u32) -> &AccountRef {
        assert!((index as usize) < self.len(), "reference index out of bounds");
        // SAFETY: in bounds, and nodes below `len` were fully written by
        // `push` before their index was handed out
        unsafe { &*self.ptr().add(index as usize) }
    }

    /// Mutable access to a node through a shared block reference.
    ///
    /// SAFETY: all nodes of one pubkey live in one bin, and every caller
    /// holds that bin's write lock, so two threads never hand out `&mut`
    /// to the same node.
    #[allow(clippy::mut_from_ref)]
    fn get_mut(&self, index: u32) -> &mut AccountRef {
        assert!((index as usize) < self.len(), "reference index out of bounds");
        unsafe { &mut *(self.ptr().add(index as usize) as *mut AccountRef) }
    }

    /// Append a node, returning its index, or `None` when the block is out
    /// of room.
    fn push(&self, node: AccountRef) -> Option<u32> {
        let index = self.len.fetch_add(1, Ordering::AcqRel);
        if index >= self.capacity {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        // SAFETY: `index` was exclusively claimed by the fetch_add above
        unsafe {
            (self.ptr().add(index) as *mut AccountRef).write(node);
        }
        Some(index as u32)
    }
}

/// The sharded account index plus the reference memory owning all version
/// nodes.
#[derive(Debug)]
pub struct AccountsIndex {
    bin_calculator: PubkeyBinCalculator24,
    bins: Vec<RwLock<PubkeyMap<RefPtr>>>,
    blocks: DashMap<BlockId, Arc<ReferenceBlock>>,
    slot_blocks: DashMap<Slot, Vec<BlockId>>,
    next_block_id: Arc<AtomicU64>,
    allocator: IndexAllocator,
}

impl AccountsIndex {
    pub fn new(num_bins: usize, allocator: IndexAllocator) -> io::Result<Self> {
        Self::new_with_block_counter(num_bins, allocator, Arc::new(AtomicU64::new(0)))
    }

    /// Partial indexes built by snapshot-load workers share the block
    /// counter of the engine they merge into, so block ids stay unique
    /// across the transfer.
    pub fn new_with_block_counter(
        num_bins: usize,
        allocator: IndexAllocator,
        next_block_id: Arc<AtomicU64>,
    ) -> io::Result<Self> {
        let bin_calculator = PubkeyBinCalculator24::new(num_bins);
        let bins = (0..num_bins)
            .map(|_| Ok(RwLock::new(PubkeyMap::with_capacity(allocator.clone(), 0)?)))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            bin_calculator,
            bins,
            blocks: DashMap::new(),
            slot_blocks: DashMap::new(),
            next_block_id,
            allocator,
        })
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn block_counter(&self) -> Arc<AtomicU64> {
        self.next_block_id.clone()
    }

    pub fn bin_of(&self, pubkey: &Pubkey) -> usize {
        self.bin_calculator.bin_from_pubkey(pubkey)
    }

    fn block(&self, id: BlockId) -> Arc<ReferenceBlock> {
        self.blocks
            .get(&id)
            .unwrap_or_else(|| panic!("reference block {id} missing from index"))
            .clone()
    }

    /// Copy the node a pointer refers to.
    pub fn resolve(&self, ptr: RefPtr) -> AccountRef {
        *self.block(ptr.block).get(ptr.index)
    }

    /// Allocate a block of `capacity` nodes owned by `slot`.
    pub fn alloc_reference_block(&self, slot: Slot, capacity: usize) -> io::Result<BlockId> {
        self.alloc_shared_reference_block(&[slot], capacity)
    }

    /// Allocate one block backing the nodes of several slots at once (the
    /// snapshot-load worker arena). The block is released when the last of
    /// the owning slots frees it.
    pub fn alloc_shared_reference_block(
        &self,
        slots: &[Slot],
        capacity: usize,
    ) -> io::Result<BlockId> {
        let capacity = capacity.max(1);
        let memory = self
            .allocator
            .allocate(capacity * mem::size_of::<AccountRef>())?;
        let block = Arc::new(ReferenceBlock::new(memory, capacity, slots.len()));
        let id = self.next_block_id.fetch_add(1, Ordering::Relaxed);
        self.blocks.insert(id, block);
        for slot in slots {
            self.slot_blocks.entry(*slot).or_default().push(id);
        }
        Ok(id)
    }

    /// Release `slot`'s claim on its blocks; a block with no owners left is
    /// unmapped. A slot with no blocks is a no-op.
    pub fn free_reference_block(&self, slot: Slot) {
        let Some((_, ids)) = self.slot_blocks.remove(&slot) else {
            return;
        };
        for id in ids {
            let last_owner = self
                .blocks
                .get(&id)
                .map(|block| block.owners.fetch_sub(1, Ordering::AcqRel) == 1)
                .unwrap_or(false);
            if last_owner {
                self.blocks.remove(&id);
            }
        }
    }

    /// Swap `slot`'s blocks for the single freshly built `new_block`
    /// (shrink's arena replacement), releasing the old ones.
    pub fn replace_slot_blocks(&self, slot: Slot, new_block: BlockId) {
        let old = self.slot_blocks.insert(slot, vec![new_block]);
        for id in old.into_iter().flatten() {
            if id == new_block {
                continue;
            }
            let last_owner = self
                .blocks
                .get(&id)
                .map(|block| block.owners.fetch_sub(1, Ordering::AcqRel) == 1)
                .unwrap_or(false);
            if last_owner {
                self.blocks.remove(&id);
            }
        }
    }

    /// Write a node into `block` and return its pointer; the node is not
    /// yet linked into any chain.
    pub fn push_ref(&self, block_id: BlockId, node: AccountRef) -> Result<RefPtr, IndexError> {
        let block = self
            .blocks
            .get(&block_id)
            .ok_or(IndexError::MemoryNotFound)?;
        let index = block.push(node).ok_or(IndexError::OutOfReferenceMemory)?;
        Ok(RefPtr {
            block: block_id,
            index,
        })
    }

    /// Append `ptr`'s node to the end of its pubkey's chain, creating the
    /// chain if absent. Callers must never index two nodes with the same
    /// `(pubkey, slot)` through this path.
    pub fn index_ref(&self, ptr: RefPtr) {
        let node = self.resolve(ptr);
        let bin = self.bin_of(&node.pubkey);
        let mut map = self.bins[bin].write().unwrap();
        let new_capacity = map.len() + 1;
        map.ensure_total_capacity(new_capacity)
            .unwrap_or_else(|err| panic!("failed to grow index bin {bin}: {err}"));

        // the node may carry a stale link from a previous chain (worker
        // merge); it is re-linked at the tail
        self.block(ptr.block).get_mut(ptr.index).next = RefPtr::NONE;

        let (head, inserted) = map.get_or_put(&node.pubkey, ptr);
        if inserted {
            return;
        }
        let mut tail = *head;
        loop {
            let tail_node = self.resolve(tail);
            debug_assert!(
                tail_node.slot != node.slot,
                "duplicate (pubkey, slot) indexed: {} {}",
                node.pubkey,
                node.slot,
            );
            match tail_node.next() {
                Some(next) => tail = next,
                None => break,
            }
        }
        self.block(tail.block).get_mut(tail.index).next = ptr;
    }

    /// As [`Self::index_ref`], but refuse (returning false) when the chain
    /// already holds a node for the same slot. Snapshot load uses this to
    /// tolerate duplicate records across account files.
    pub fn index_ref_if_not_duplicate_slot(&self, ptr: RefPtr) -> bool {
        let node = self.resolve(ptr);
        let bin = self.bin_of(&node.pubkey);
        let mut map = self.bins[bin].write().unwrap();
        let new_capacity = map.len() + 1;
        map.ensure_total_capacity(new_capacity)
            .unwrap_or_else(|err| panic!("failed to grow index bin {bin}: {err}"));

        self.block(ptr.block).get_mut(ptr.index).next = RefPtr::NONE;

        let Some(head) = map.get(&node.pubkey).copied() else {
            map.insert_assume_capacity(node.pubkey, ptr);
            return true;
        };
        let mut tail = head;
        loop {
            let tail_node = self.resolve(tail);
            if tail_node.slot == node.slot {
                return false;
            }
            match tail_node.next() {
                Some(next) => tail = next,
                None => break,
            }
        }
        self.block(tail.block).get_mut(tail.index).next = ptr;
        true
    }

    /// The head of `pubkey`'s chain.
    pub fn get_reference(&self, pubkey: &Pubkey) -> Option<RefPtr> {
        let bin = self.bin_of(pubkey);
        let map = self.bins[bin].read().unwrap();
        map.get(pubkey).copied()
    }

    /// Linear walk for the node written at exactly `slot`.
    pub fn get_slot_reference(&self, pubkey: &Pubkey, slot: Slot) -> Option<AccountRef> {
        let bin = self.bin_of(pubkey);
        let map = self.bins[bin].read().unwrap();
        let mut cursor = map.get(pubkey).copied();
        while let Some(ptr) = cursor {
            let node = self.resolve(ptr);
            if node.slot == slot {
                return Some(node);
            }
            cursor = node.next();
        }
        None
    }

    /// The node with the greatest slot in `(min_exclusive, max_inclusive]`,
    /// either bound optional. This is the version-selection primitive for
    /// point reads and snapshot hashing.
    pub fn latest_reference_in_bounds(
        &self,
        pubkey: &Pubkey,
        min_exclusive: Option<Slot>,
        max_inclusive: Option<Slot>,
    ) -> Option<AccountRef> {
        let bin = self.bin_of(pubkey);
        let map = self.bins[bin].read().unwrap();
        self.latest_in_bounds_from(map.get(pubkey).copied(), min_exclusive, max_inclusive)
    }

    /// As above, from an already-located chain head. Callers hold the bin
    /// lock or otherwise know the chain cannot change underneath them.
    pub fn latest_in_bounds_from(
        &self,
        head: Option<RefPtr>,
        min_exclusive: Option<Slot>,
        max_inclusive: Option<Slot>,
    ) -> Option<AccountRef> {
        let mut best: Option<AccountRef> = None;
        let mut cursor = head;
        while let Some(ptr) = cursor {
            let node = self.resolve(ptr);
            let in_bounds = min_exclusive.map_or(true, |min| node.slot > min)
                && max_inclusive.map_or(true, |max| node.slot <= max);
            if in_bounds && best.map_or(true, |best| node.slot > best.slot) {
                best = Some(node);
            }
            cursor = node.next();
        }
        best
    }

    /// Copy out the whole chain for `pubkey`, head first.
    pub fn collect_chain(&self, pubkey: &Pubkey) -> Vec<AccountRef> {
        let bin = self.bin_of(pubkey);
        let map = self.bins[bin].read().unwrap();
        let mut chain = vec![];
        let mut cursor = map.get(pubkey).copied();
        while let Some(ptr) = cursor {
            let node = self.resolve(ptr);
            chain.push(node);
            cursor = node.next();
        }
        chain
    }

    /// Unlink the node for `(pubkey, slot)`; when it was the last node the
    /// bin entry is removed too. Returns whether a node was removed. The
    /// node's storage is reclaimed with its block, not here.
    pub fn remove_reference(&self, pubkey: &Pubkey, slot: Slot) -> bool {
        let bin = self.bin_of(pubkey);
        let mut map = self.bins[bin].write().unwrap();
        let Some(head) = map.get(pubkey).copied() else {
            return false;
        };

        let head_node = self.resolve(head);
        if head_node.slot == slot {
            match head_node.next() {
                Some(next) => *map.get_mut(pubkey).unwrap() = next,
                None => {
                    map.remove(pubkey);
                }
            }
            return true;
        }

        let mut pred = head;
        let mut cursor = head_node.next();
        while let Some(ptr) = cursor {
            let node = self.resolve(ptr);
            if node.slot == slot {
                self.block(pred.block).get_mut(pred.index).next = node.next;
                return true;
            }
            pred = ptr;
            cursor = node.next();
        }
        false
    }

    /// Update the location of the `(pubkey, slot)` node in place (cache to
    /// file transition during flush). Returns false when no such node
    /// exists.
    pub fn set_location(&self, pubkey: &Pubkey, slot: Slot, location: AccountLocation) -> bool {
        let bin = self.bin_of(pubkey);
        let map = self.bins[bin].write().unwrap();
        let mut cursor = map.get(pubkey).copied();
        while let Some(ptr) = cursor {
            let block = self.block(ptr.block);
            let node = block.get_mut(ptr.index);
            if node.slot == slot {
                node.location = location;
                return true;
            }
            cursor = node.next();
        }
        false
    }

    /// Swap the chain's `(pubkey, slot)` node for the rebuilt `new_ptr`
    /// (shrink). The new node inherits the old node's link; when the old
    /// node was the chain head, even a single-node chain, the bin entry is
    /// repointed.
    pub fn relink_reference(&self, new_ptr: RefPtr) -> bool {
        let new_node = self.resolve(new_ptr);
        let bin = self.bin_of(&new_node.pubkey);
        let mut map = self.bins[bin].write().unwrap();
        let Some(head) = map.get(&new_node.pubkey).copied() else {
            return false;
        };

        let head_node = self.resolve(head);
        if head_node.slot == new_node.slot {
            self.block(new_ptr.block).get_mut(new_ptr.index).next = head_node.next;
            *map.get_mut(&new_node.pubkey).unwrap() = new_ptr;
            return true;
        }

        let mut pred = head;
        let mut cursor = head_node.next();
        while let Some(ptr) = cursor {
            let node = self.resolve(ptr);
            if node.slot == new_node.slot {
                self.block(new_ptr.block).get_mut(new_ptr.index).next = node.next;
                self.block(pred.block).get_mut(pred.index).next = new_ptr;
                return true;
            }
            pred = ptr;
            cursor = node.next();
        }
        false
    }

    /// Visit every chain head in `bin` under the bin's read lock.
    pub fn scan_bin(&self, bin: usize, mut visit: impl FnMut(&Pubkey, RefPtr)) {
        let map = self.bins[bin].read().unwrap();
        for (pubkey, ptr) in map.iter() {
            visit(pubkey, *ptr);
        }
    }

    /// Number of pubkeys in `bin`.
    pub fn bin_len(&self, bin: usize) -> usize {
        self.bins[bin].read().unwrap().len()
    }

    /// Number of pubkeys across all bins.
    pub fn num_keys(&self) -> usize {
        (0..self.num_bins()).map(|bin| self.bin_len(bin)).sum()
    }

    /// Move every reference block of `other` into this index, preserving
    /// block ids (unique because the indexes share a block counter). The
    /// other index keeps its bin maps; its chains stay resolvable through
    /// this index until they are re-linked here.
    pub fn absorb_reference_memory(&self, other: &AccountsIndex) {
        debug_assert!(Arc::ptr_eq(&self.next_block_id, &other.next_block_id));
        let ids: Vec<BlockId> = other.blocks.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, block)) = other.blocks.remove(&id) {
                self.blocks.insert(id, block);
            }
        }
        let slots: Vec<Slot> = other.slot_blocks.iter().map(|entry| *entry.key()).collect();
        for slot in slots {
            if let Some((_, ids)) = other.slot_blocks.remove(&slot) {
                self.slot_blocks.entry(slot).or_default().extend(ids);
            }
        }
    }

    /// Slots that currently own reference blocks.
    pub fn slots_with_blocks(&self) -> Vec<Slot> {
        self.slot_blocks.iter().map(|entry| *entry.key()).collect()
    }

    pub fn has_blocks_for_slot(&self, slot: Slot) -> bool {
        self.slot_blocks.contains_key(&slot)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn new_index(bins: usize) -> AccountsIndex {
        AccountsIndex::new(bins, IndexAllocator::Heap).unwrap()
    }

    fn file_location(file_id: FileId, offset: usize) -> AccountLocation {
        AccountLocation::File { file_id, offset }
    }

    fn index_one(index: &AccountsIndex, pubkey: Pubkey, slot: Slot) -> RefPtr {
        let block = index.alloc_reference_block(slot, 1).unwrap();
        let ptr = index
            .push_ref(block, AccountRef::new(pubkey, slot, file_location(0, 0)))
            .unwrap();
        index.index_ref(ptr);
        ptr
    }

    #[test]
    fn test_index_and_get() {
        let index = new_index(4);
        let pubkey = Pubkey::new_unique();
        assert_eq!(index.get_reference(&pubkey), None);

        let ptr = index_one(&index, pubkey, 19);
        assert_eq!(index.get_reference(&pubkey), Some(ptr));
        let node = index.get_slot_reference(&pubkey, 19).unwrap();
        assert_eq!(node.slot, 19);
        assert_eq!(node.pubkey, pubkey);
        assert_eq!(index.get_slot_reference(&pubkey, 20), None);
    }

    #[test]
    fn test_chain_appends_at_tail() {
        let index = new_index(4);
        let pubkey = Pubkey::new_unique();
        for slot in [19, 28, 5] {
            index_one(&index, pubkey, slot);
        }
        let slots: Vec<Slot> = index
            .collect_chain(&pubkey)
            .iter()
            .map(|node| node.slot)
            .collect();
        assert_eq!(slots, vec![19, 28, 5]);
    }

    #[test]
    fn test_duplicate_slot_rejected() {
        let index = new_index(4);
        let pubkey = Pubkey::new_unique();
        let block = index.alloc_reference_block(7, 2).unwrap();
        let first = index
            .push_ref(block, AccountRef::new(pubkey, 7, file_location(1, 0)))
            .unwrap();
        assert!(index.index_ref_if_not_duplicate_slot(first));

        let dup = index
            .push_ref(block, AccountRef::new(pubkey, 7, file_location(2, 0)))
            .unwrap();
        assert!(!index.index_ref_if_not_duplicate_slot(dup));
        assert_eq!(index.collect_chain(&pubkey).len(), 1);
    }

    #[test]
    fn test_latest_reference_in_bounds() {
        let index = new_index(4);
        let pubkey = Pubkey::new_unique();
        for slot in [10, 30, 20] {
            index_one(&index, pubkey, slot);
        }

        let latest = |min, max| {
            index
                .latest_reference_in_bounds(&pubkey, min, max)
                .map(|node| node.slot)
        };
        assert_eq!(latest(None, None), Some(30));
        assert_eq!(latest(None, Some(29)), Some(20));
        assert_eq!(latest(None, Some(10)), Some(10));
        assert_eq!(latest(None, Some(9)), None);
        assert_eq!(latest(Some(10), Some(20)), Some(20));
        assert_eq!(latest(Some(30), None), None);
        assert_eq!(latest(Some(29), None), Some(30));
    }

    #[test]
    fn test_remove_reference() {
        let index = new_index(4);
        let pubkey = Pubkey::new_unique();
        for slot in [1, 2, 3] {
            index_one(&index, pubkey, slot);
        }

        // middle
        assert!(index.remove_reference(&pubkey, 2));
        let slots: Vec<Slot> = index.collect_chain(&pubkey).iter().map(|n| n.slot).collect();
        assert_eq!(slots, vec![1, 3]);

        // head
        assert!(index.remove_reference(&pubkey, 1));
        let slots: Vec<Slot> = index.collect_chain(&pubkey).iter().map(|n| n.slot).collect();
        assert_eq!(slots, vec![3]);

        // absent
        assert!(!index.remove_reference(&pubkey, 9));

        // last; the bin entry disappears with it
        assert!(index.remove_reference(&pubkey, 3));
        assert_eq!(index.get_reference(&pubkey), None);
        assert_eq!(index.num_keys(), 0);
    }

    #[test]
    fn test_set_location_flush_transition() {
        let index = new_index(4);
        let pubkey = Pubkey::new_unique();
        let block = index.alloc_reference_block(5, 1).unwrap();
        let ptr = index
            .push_ref(block, AccountRef::new(pubkey, 5, AccountLocation::Cache { index: 0 }))
            .unwrap();
        index.index_ref(ptr);

        assert!(index.set_location(&pubkey, 5, file_location(3, 128)));
        assert_eq!(
            index.get_slot_reference(&pubkey, 5).unwrap().location,
            file_location(3, 128)
        );
        assert!(!index.set_location(&pubkey, 6, file_location(3, 0)));
    }

    #[test]
    fn test_out_of_reference_memory() {
        let index = new_index(4);
        let block = index.alloc_reference_block(1, 2).unwrap();
        for _ in 0..2 {
            index
                .push_ref(block, AccountRef::new(Pubkey::new_unique(), 1, file_location(0, 0)))
                .unwrap();
        }
        assert_eq!(
            index.push_ref(
                block,
                AccountRef::new(Pubkey::new_unique(), 1, file_location(0, 0))
            ),
            Err(IndexError::OutOfReferenceMemory)
        );
    }

    #[test]
    fn test_free_reference_block() {
        let index = new_index(4);
        let pubkey = Pubkey::new_unique();
        let ptr = index_one(&index, pubkey, 11);
        assert!(index.has_blocks_for_slot(11));

        // unlink first, then free
        assert!(index.remove_reference(&pubkey, 11));
        index.free_reference_block(11);
        assert!(!index.has_blocks_for_slot(11));
        assert!(!index.blocks.contains_key(&ptr.block));

        // freeing an absent slot is a no-op
        index.free_reference_block(11);
    }

    #[test]
    fn test_shared_block_freed_by_last_owner() {
        let index = new_index(4);
        let block = index.alloc_shared_reference_block(&[1, 2], 4).unwrap();
        index.free_reference_block(1);
        assert!(index.blocks.contains_key(&block));
        index.free_reference_block(2);
        assert!(!index.blocks.contains_key(&block));
    }

    #[test]
    fn test_relink_reference_head_and_middle() {
        let index = new_index(4);
        let pubkey = Pubkey::new_unique();
        for slot in [10, 20] {
            index_one(&index, pubkey, slot);
        }

        // middle (tail) node moves to a new block
        let new_block = index.alloc_reference_block(20, 1).unwrap();
        let new_ptr = index
            .push_ref(new_block, AccountRef::new(pubkey, 20, file_location(9, 64)))
            .unwrap();
        assert!(index.relink_reference(new_ptr));
        let chain = index.collect_chain(&pubkey);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].location, file_location(9, 64));

        // head node, single-ref style: repoint the bin entry
        let new_block = index.alloc_reference_block(10, 1).unwrap();
        let new_ptr = index
            .push_ref(new_block, AccountRef::new(pubkey, 10, file_location(9, 0)))
            .unwrap();
        assert!(index.relink_reference(new_ptr));
        assert_eq!(index.get_reference(&pubkey), Some(new_ptr));
        let chain = index.collect_chain(&pubkey);
        assert_eq!(chain[0].location, file_location(9, 0));
        assert_eq!(chain[1].location, file_location(9, 64));
    }

    #[test]
    fn test_absorb_reference_memory() {
        let main = new_index(4);
        let worker = AccountsIndex::new_with_block_counter(
            4,
            IndexAllocator::Heap,
            main.block_counter(),
        )
        .unwrap();

        let pubkey = Pubkey::new_unique();
        let block = worker.alloc_reference_block(42, 1).unwrap();
        let ptr = worker
            .push_ref(block, AccountRef::new(pubkey, 42, file_location(0, 0)))
            .unwrap();
        worker.index_ref(ptr);

        main.absorb_reference_memory(&worker);
        // chains recorded in the worker's bins resolve through main now
        main.index_ref(ptr);
        assert_eq!(main.get_slot_reference(&pubkey, 42).unwrap().slot, 42);
        assert!(main.has_blocks_for_slot(42));
    }
}
