//! Open-addressed hash map specialized for 32-byte pubkeys.
//!
//! Storage is one contiguous mapping laid out as all entry slots followed by
//! one control byte per slot. Control bytes encode empty / deleted /
//! occupied-with-tag, where the tag is the high 7 bits of the key's hash, so
//! probing a group of 16 slots is a single vector compare against the target
//! tag. The low hash bits pick the starting group; probing is linear over
//! groups.
//!
//! The backing mapping comes from [`IndexAllocator`], so the same map serves
//! the in-RAM and the disk-backed index configurations.

use {
    crate::disk_allocator::{IndexAllocator, IndexBlock},
    sable_sdk::pubkey::Pubkey,
    std::{io, marker::PhantomData, mem},
};

/// Number of slots probed with one control-byte compare.
pub const GROUP_WIDTH: usize = 16;

const EMPTY: u8 = 0b1111_1111;
const DELETED: u8 = 0b1000_0000;

#[inline]
fn is_full(ctrl: u8) -> bool {
    ctrl & 0x80 == 0
}

/// The hash only has to be deterministic and cheap: validator pubkeys are
/// uniformly distributed, so the leading eight bytes are already a good
/// 64-bit hash.
#[inline]
fn hash_pubkey(key: &Pubkey) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key.as_ref()[..8]);
    u64::from_le_bytes(bytes)
}

/// Occupied-tag for a hash: high 7 bits, high control bit clear.
#[inline]
fn tag(hash: u64) -> u8 {
    (hash >> 57) as u8 & 0x7f
}

/// Lanes of one group that matched a control-byte predicate, as a bitmask.
#[derive(Clone, Copy)]
struct BitMask(u16);

impl BitMask {
    #[inline]
    fn any(self) -> bool {
        self.0 != 0
    }

    #[inline]
    fn first(self) -> Option<usize> {
        (self.0 != 0).then(|| self.0.trailing_zeros() as usize)
    }
}

impl Iterator for BitMask {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        let lane = self.first()?;
        self.0 &= self.0 - 1;
        Some(lane)
    }
}

#[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
mod group {
    use super::{BitMask, GROUP_WIDTH};
    use core::arch::x86_64::*;

    /// One group's worth of control bytes, loaded into a vector register.
    #[derive(Clone, Copy)]
    pub(super) struct Group(__m128i);

    impl Group {
        /// SAFETY: `ptr` must point at `GROUP_WIDTH` readable bytes; no
        /// alignment requirement.
        #[inline]
        pub(super) unsafe fn load(ptr: *const u8) -> Self {
            Group(_mm_loadu_si128(ptr as *const __m128i))
        }

        #[inline]
        pub(super) fn match_byte(self, byte: u8) -> BitMask {
            // SAFETY: sse2 is statically enabled for this cfg
            unsafe {
                let cmp = _mm_cmpeq_epi8(self.0, _mm_set1_epi8(byte as i8));
                BitMask(_mm_movemask_epi8(cmp) as u16)
            }
        }

        /// Lanes that are empty or deleted (high control bit set).
        #[inline]
        pub(super) fn match_empty_or_deleted(self) -> BitMask {
            // SAFETY: sse2 is statically enabled for this cfg
            unsafe { BitMask(_mm_movemask_epi8(self.0) as u16) }
        }
    }

    const _: () = assert!(GROUP_WIDTH == 16);
}

#[cfg(not(all(target_arch = "x86_64", target_feature = "sse2")))]
mod group {
    use super::{BitMask, GROUP_WIDTH};

    /// Portable one-byte-at-a-time fallback with the same interface as the
    /// vector path.
    #[derive(Clone, Copy)]
    pub(super) struct Group([u8; GROUP_WIDTH]);

    impl Group {
        /// SAFETY: `ptr` must point at `GROUP_WIDTH` readable bytes.
        #[inline]
        pub(super) unsafe fn load(ptr: *const u8) -> Self {
            let mut bytes = [0u8; GROUP_WIDTH];
            std::ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), GROUP_WIDTH);
            Group(bytes)
        }

        #[inline]
        pub(super) fn match_byte(self, byte: u8) -> BitMask {
            let mut mask = 0u16;
            for (lane, ctrl) in self.0.iter().enumerate() {
                if *ctrl == byte {
                    mask |= 1 << lane;
                }
            }
            BitMask(mask)
        }

        #[inline]
        pub(super) fn match_empty_or_deleted(self) -> BitMask {
            let mut mask = 0u16;
            for (lane, ctrl) in self.0.iter().enumerate() {
                if ctrl & 0x80 != 0 {
                    mask |= 1 << lane;
                }
            }
            BitMask(mask)
        }
    }
}

use group::Group;

#[repr(C)]
struct Entry<V> {
    key: Pubkey,
    value: V,
}

/// Open-addressed pubkey map over an [`IndexBlock`].
///
/// `V` must be plain data (`Copy`); values live directly in the mapping.
pub struct PubkeyMap<V> {
    block: IndexBlock,
    allocator: IndexAllocator,
    /// power-of-two number of 16-slot groups
    groups: usize,
    /// occupied slots
    count: usize,
    /// deleted slots still poisoning probe chains; reclaimed on growth
    tombstones: usize,
    _marker: PhantomData<V>,
}

impl<V: Copy> PubkeyMap<V> {
    /// Bytes needed for `groups` groups: entries first, then control bytes.
    fn layout_bytes(groups: usize) -> usize {
        let slots = groups * GROUP_WIDTH;
        slots * mem::size_of::<Entry<V>>() + slots
    }

    fn groups_for_capacity(capacity: usize) -> usize {
        let mut groups = 1usize;
        while Self::grow_threshold(groups * GROUP_WIDTH) < capacity {
            groups *= 2;
        }
        groups
    }

    /// Occupancy past which probe chains degrade; the classic 7/8 bound.
    fn grow_threshold(slots: usize) -> usize {
        slots / 8 * 7
    }

    pub fn with_capacity(allocator: IndexAllocator, capacity: usize) -> io::Result<Self> {
        let groups = Self::groups_for_capacity(capacity);
        Self::with_capacity_groups(allocator, groups)
    }

    /// Total slots; always `GROUP_WIDTH * 2^k`.
    pub fn capacity(&self) -> usize {
        self.groups * GROUP_WIDTH
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn entries_ptr(&self) -> *const Entry<V> {
        self.block.as_slice().as_ptr() as *const Entry<V>
    }

    fn states_offset(&self) -> usize {
        self.capacity() * mem::size_of::<Entry<V>>()
    }

    fn state(&self, slot: usize) -> u8 {
        self.block.as_slice()[self.states_offset() + slot]
    }

    fn set_state(&mut self, slot: usize, state: u8) {
        let offset = self.states_offset() + slot;
        self.block.as_mut_slice()[offset] = state;
    }

    fn group_states(&self, group: usize) -> Group {
        let offset = self.states_offset() + group * GROUP_WIDTH;
        // SAFETY: `group < self.groups`, so all GROUP_WIDTH bytes are inside
        // the states region
        unsafe { Group::load(self.block.as_slice().as_ptr().add(offset)) }
    }

    fn entry(&self, slot: usize) -> &Entry<V> {
        debug_assert!(slot < self.capacity());
        // SAFETY: slot is in bounds and every occupied slot was fully
        // written before its control byte was set
        unsafe { &*self.entries_ptr().add(slot) }
    }

    fn entry_mut(&mut self, slot: usize) -> &mut Entry<V> {
        debug_assert!(slot < self.capacity());
        // SAFETY: as `entry`, plus `&mut self` gives exclusive access
        unsafe { &mut *(self.entries_ptr().add(slot) as *mut Entry<V>) }
    }

    fn find(&self, key: &Pubkey) -> Option<usize> {
        let hash = hash_pubkey(key);
        let tag = tag(hash);
        let mask = self.groups - 1;
        let mut group = (hash as usize) & mask;
        for _ in 0..self.groups {
            let states = self.group_states(group);
            for lane in states.match_byte(tag) {
                let slot = group * GROUP_WIDTH + lane;
                if self.entry(slot).key == *key {
                    return Some(slot);
                }
            }
            if states.match_byte(EMPTY).any() {
                return None;
            }
            group = (group + 1) & mask;
        }
        None
    }

    pub fn get(&self, key: &Pubkey) -> Option<&V> {
        self.find(key).map(|slot| &self.entry(slot).value)
    }

    pub fn get_mut(&mut self, key: &Pubkey) -> Option<&mut V> {
        let slot = self.find(key)?;
        Some(&mut self.entry_mut(slot).value)
    }

    pub fn contains_key(&self, key: &Pubkey) -> bool {
        self.find(key).is_some()
    }

    /// Insert a key the caller guarantees is not present, into the first
    /// empty-or-deleted lane of its probe sequence. Callers also guarantee
    /// room (see [`Self::ensure_total_capacity`]).
    pub fn insert_assume_capacity(&mut self, key: Pubkey, value: V) {
        let hash = hash_pubkey(&key);
        let tag = tag(hash);
        let mask = self.groups - 1;
        let mut group = (hash as usize) & mask;
        loop {
            let states = self.group_states(group);
            if let Some(lane) = states.match_empty_or_deleted().first() {
                let slot = group * GROUP_WIDTH + lane;
                if self.state(slot) == DELETED {
                    self.tombstones -= 1;
                }
                *self.entry_mut(slot) = Entry { key, value };
                self.set_state(slot, tag);
                self.count += 1;
                return;
            }
            group = (group + 1) & mask;
        }
    }

    /// Return the value for `key`, inserting `default` first if absent;
    /// the flag reports whether the insert happened.
    ///
    /// Unlike [`Self::insert_assume_capacity`] this never reuses a deleted
    /// lane: the key may still live in a later group of the probe sequence,
    /// which only an empty lane rules out.
    pub fn get_or_put(&mut self, key: &Pubkey, default: V) -> (&mut V, bool) {
        let hash = hash_pubkey(key);
        let tag = tag(hash);
        let mask = self.groups - 1;
        let mut group = (hash as usize) & mask;
        loop {
            let states = self.group_states(group);
            for lane in states.match_byte(tag) {
                let slot = group * GROUP_WIDTH + lane;
                if self.entry(slot).key == *key {
                    return (&mut self.entry_mut(slot).value, false);
                }
            }
            if let Some(lane) = states.match_byte(EMPTY).first() {
                let slot = group * GROUP_WIDTH + lane;
                *self.entry_mut(slot) = Entry { key: *key, value: default };
                self.set_state(slot, tag);
                self.count += 1;
                return (&mut self.entry_mut(slot).value, true);
            }
            group = (group + 1) & mask;
        }
    }

    /// Remove `key`, keeping probe chains sound: a lane in a group that
    /// still has an empty lane can go back to empty (no search ever probed
    /// past that group), otherwise it becomes a tombstone.
    pub fn remove(&mut self, key: &Pubkey) -> Option<V> {
        let slot = self.find(key)?;
        let value = self.entry(slot).value;
        let group = slot / GROUP_WIDTH;
        if self.group_states(group).match_byte(EMPTY).any() {
            self.set_state(slot, EMPTY);
        } else {
            self.set_state(slot, DELETED);
            self.tombstones += 1;
        }
        self.count -= 1;
        Some(value)
    }

    /// Make room for `total` entries, doubling as needed. Growth also
    /// reclaims tombstoned lanes.
    pub fn ensure_total_capacity(&mut self, total: usize) -> io::Result<()> {
        while Self::grow_threshold(self.capacity()) < total + self.tombstones {
            self.grow()?;
        }
        Ok(())
    }

    fn grow(&mut self) -> io::Result<()> {
        let mut bigger = Self::with_capacity_groups(self.allocator.clone(), self.groups * 2)?;
        for slot in 0..self.capacity() {
            if is_full(self.state(slot)) {
                let entry = self.entry(slot);
                bigger.insert_assume_capacity(entry.key, entry.value);
            }
        }
        *self = bigger;
        Ok(())
    }

    fn with_capacity_groups(allocator: IndexAllocator, groups: usize) -> io::Result<Self> {
        assert!(groups.is_power_of_two());
        let mut block = allocator.allocate(Self::layout_bytes(groups))?;
        let states_offset = groups * GROUP_WIDTH * mem::size_of::<Entry<V>>();
        block.as_mut_slice()[states_offset..].fill(EMPTY);
        Ok(Self {
            block,
            allocator,
            groups,
            count: 0,
            tombstones: 0,
            _marker: PhantomData,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Pubkey, &V)> + '_ {
        (0..self.capacity()).filter_map(move |slot| {
            is_full(self.state(slot)).then(|| {
                let entry = self.entry(slot);
                (&entry.key, &entry.value)
            })
        })
    }

    /// Keys in this map, copied out so the borrow is released.
    pub fn keys(&self) -> Vec<Pubkey> {
        self.iter().map(|(key, _)| *key).collect()
    }
}

impl<V: Copy> std::fmt::Debug for PubkeyMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubkeyMap")
            .field("capacity", &self.capacity())
            .field("count", &self.count)
            .field("tombstones", &self.tombstones)
            .finish()
    }
}
