//! Guest-physical memory slots and their publication scheme.
//!
//! A VM owns two slot address spaces (normal and SMM). Each address space
//! publishes an immutable, generation-numbered [`MemorySlots`] snapshot
//! behind an [`AddressSpace`] handle. Translation lookups clone the
//! published `Arc` and never block behind a slot change; mutation builds a
//! new table off to the side and swaps it in, and the superseded table is
//! freed once the last reader handle drops.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU16, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::RwLock;

use crate::addr::{Gfn, HostVirtAddr, PAGE_SHIFT};
use crate::mmu::rmap::RmapHead;

/// Slots available to the controlling process.
pub const USER_MEM_SLOTS: usize = 509;
/// Slots reserved for internal pages, never exposed to the controlling
/// process.
pub const PRIVATE_MEM_SLOTS: usize = 3;
pub const MEM_SLOTS_NUM: usize = USER_MEM_SLOTS + PRIVATE_MEM_SLOTS;

pub const TSS_PRIVATE_MEMSLOT: u16 = USER_MEM_SLOTS as u16;
pub const APIC_ACCESS_PAGE_PRIVATE_MEMSLOT: u16 = USER_MEM_SLOTS as u16 + 1;
pub const IDENTITY_PAGETABLE_PRIVATE_MEMSLOT: u16 = USER_MEM_SLOTS as u16 + 2;

/// Slot address spaces per VM: normal and SMM.
pub const ADDRESS_SPACE_NUM: usize = 2;

/// Mappable page sizes: 4 KiB, 2 MiB, 1 GiB.
pub const NR_PAGE_SIZES: usize = 3;

/// Upper bound on a single slot's page count, so per-page bitmaps stay
/// within what the bit operations support.
pub const MEM_MAX_NR_PAGES: usize = (1 << 31) - 1;

/// Number of gfn bits consumed below a mapping of the given level
/// (1 = 4 KiB, 2 = 2 MiB, 3 = 1 GiB).
#[inline]
pub const fn hpage_gfn_shift(level: usize) -> usize {
    (level - 1) * 9
}

#[inline]
pub const fn hpage_size(level: usize) -> usize {
    1 << (PAGE_SHIFT + hpage_gfn_shift(level))
}

bitflags! {
    /// Memory-slot flags. Bits 0..16 are visible to the controlling
    /// process; bit 16 and up are internal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemSlotFlags: u32 {
        /// Track guest writes in the slot's dirty bitmap.
        const LOG_DIRTY_PAGES = 1 << 0;
        const READONLY = 1 << 1;
        /// The slot is being deleted or moved: excluded from translation
        /// lookups, but its reverse mappings may still be draining.
        const INVALID = 1 << 16;
    }
}

/// The slot-flag bits the controlling process may set.
pub const MEMSLOT_USER_FLAGS: u32 = 0xffff;

/// The kinds of change a slot-registration request can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotChange {
    Create,
    Delete,
    Move,
    FlagsOnly,
}

/// A slot-registration request, as the controlling process sees it. Only
/// these fields cross the ABI boundary.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub slot_id: u16,
    pub base_gfn: Gfn,
    pub npages: usize,
    pub userspace_addr: HostVirtAddr,
    pub flags: MemSlotFlags,
}

/// One guest-physical frame range backed by host virtual memory.
///
/// The reverse-mapping heads, large-page disallow counters, write-track
/// counters and the dirty bitmap are shared (`Arc`) across snapshot
/// generations: replacing the table re-describes the slot but keeps the
/// translation bookkeeping, so cached mappings can be drained through the
/// same heads they were registered in.
#[derive(Debug, Clone)]
pub struct MemorySlot {
    id: u16,
    base_gfn: Gfn,
    npages: usize,
    userspace_addr: HostVirtAddr,
    flags: MemSlotFlags,
    dirty_bitmap: Option<Arc<[AtomicU64]>>,
    rmap: [Arc<[RmapHead]>; NR_PAGE_SIZES],
    lpage_disallowed: [Arc<[AtomicI32]>; NR_PAGE_SIZES - 1],
    write_track: Arc<[AtomicU16]>,
}

impl MemorySlot {
    pub fn new(
        id: u16,
        base_gfn: Gfn,
        npages: usize,
        userspace_addr: HostVirtAddr,
        flags: MemSlotFlags,
    ) -> Self {
        let dirty_bitmap = flags
            .contains(MemSlotFlags::LOG_DIRTY_PAGES)
            .then(|| (0..npages.div_ceil(64)).map(|_| AtomicU64::new(0)).collect());

        let rmap = [
            Self::alloc_rmap(base_gfn, npages, 1),
            Self::alloc_rmap(base_gfn, npages, 2),
            Self::alloc_rmap(base_gfn, npages, 3),
        ];

        let lpage_disallowed = [
            Self::alloc_lpage_info(base_gfn, npages, 2),
            Self::alloc_lpage_info(base_gfn, npages, 3),
        ];

        let write_track = (0..npages).map(|_| AtomicU16::new(0)).collect();

        Self {
            id,
            base_gfn,
            npages,
            userspace_addr,
            flags,
            dirty_bitmap,
            rmap,
            lpage_disallowed,
            write_track,
        }
    }

    fn lpage_len(base_gfn: Gfn, npages: usize, level: usize) -> usize {
        let shift = hpage_gfn_shift(level);
        ((base_gfn + npages - 1) >> shift) - (base_gfn >> shift) + 1
    }

    fn alloc_rmap(base_gfn: Gfn, npages: usize, level: usize) -> Arc<[RmapHead]> {
        (0..Self::lpage_len(base_gfn, npages, level))
            .map(|_| RmapHead::new())
            .collect()
    }

    /// Large-page disallow counters for `level`. Head and tail entries that
    /// are not naturally aligned can never be mapped large, so they start
    /// out disallowed.
    fn alloc_lpage_info(base_gfn: Gfn, npages: usize, level: usize) -> Arc<[AtomicI32]> {
        let len = Self::lpage_len(base_gfn, npages, level);
        let info: Arc<[AtomicI32]> = (0..len).map(|_| AtomicI32::new(0)).collect();

        let pages_per = 1usize << hpage_gfn_shift(level);
        if base_gfn % pages_per != 0 {
            info[0].fetch_add(1, Ordering::Relaxed);
        }
        if (base_gfn + npages) % pages_per != 0 {
            info[len - 1].fetch_add(1, Ordering::Relaxed);
        }
        info
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn base_gfn(&self) -> Gfn {
        self.base_gfn
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    pub fn userspace_addr(&self) -> HostVirtAddr {
        self.userspace_addr
    }

    pub fn flags(&self) -> MemSlotFlags {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: MemSlotFlags) {
        self.flags = flags;
    }

    /// Copy of this slot with new flags, sharing all translation
    /// bookkeeping. The dirty bitmap follows the `LOG_DIRTY_PAGES` flag:
    /// kept if already present, allocated when logging turns on, dropped
    /// when it turns off.
    pub(crate) fn with_flags(&self, flags: MemSlotFlags) -> Self {
        let mut slot = self.clone();
        slot.flags = flags;
        slot.dirty_bitmap = flags.contains(MemSlotFlags::LOG_DIRTY_PAGES).then(|| {
            self.dirty_bitmap.clone().unwrap_or_else(|| {
                (0..self.npages.div_ceil(64))
                    .map(|_| AtomicU64::new(0))
                    .collect()
            })
        });
        slot
    }

    pub fn is_valid(&self) -> bool {
        !self.flags.contains(MemSlotFlags::INVALID)
    }

    #[inline]
    pub fn contains(&self, gfn: Gfn) -> bool {
        gfn >= self.base_gfn && gfn < self.base_gfn + self.npages
    }

    /// Host virtual address backing the given guest frame.
    pub fn hva_for(&self, gfn: Gfn) -> HostVirtAddr {
        debug_assert!(self.contains(gfn));
        self.userspace_addr + ((gfn - self.base_gfn) << PAGE_SHIFT)
    }

    fn lpage_index(&self, level: usize, gfn: Gfn) -> usize {
        let shift = hpage_gfn_shift(level);
        (gfn >> shift) - (self.base_gfn >> shift)
    }

    /// Reverse-mapping head for `gfn` at the given mapping level.
    pub(crate) fn rmap_head(&self, level: usize, gfn: Gfn) -> &RmapHead {
        &self.rmap[level - 1][self.lpage_index(level, gfn)]
    }

    pub(crate) fn rmap_level(&self, level: usize) -> &[RmapHead] {
        &self.rmap[level - 1]
    }

    /// Records a guest write for dirty logging. No-op unless the slot logs
    /// dirty pages.
    pub fn mark_dirty(&self, gfn: Gfn) {
        if let Some(bitmap) = &self.dirty_bitmap {
            let rel = gfn - self.base_gfn;
            bitmap[rel / 64].fetch_or(1 << (rel % 64), Ordering::Relaxed);
        }
    }

    /// Snapshots and clears the dirty bitmap for incremental-sync callers.
    pub fn take_dirty_bitmap(&self) -> Option<Vec<u64>> {
        let bitmap = self.dirty_bitmap.as_ref()?;
        Some(
            bitmap
                .iter()
                .map(|word| word.swap(0, Ordering::Relaxed))
                .collect(),
        )
    }

    /// Adds a write-protection reason for `gfn`. The first reason also
    /// disallows large mappings over the containing 2 MiB and 1 GiB
    /// regions.
    pub fn write_track_add(&self, gfn: Gfn) {
        let prev = self.write_track[gfn - self.base_gfn].fetch_add(1, Ordering::Relaxed);
        assert_ne!(prev, u16::MAX, "write-track count overflow");
        if prev == 0 {
            for level in 2..=NR_PAGE_SIZES {
                self.lpage_disallowed[level - 2][self.lpage_index(level, gfn)]
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drops one write-protection reason for `gfn`.
    pub fn write_track_remove(&self, gfn: Gfn) {
        let prev = self.write_track[gfn - self.base_gfn].fetch_sub(1, Ordering::Relaxed);
        assert_ne!(prev, 0, "write-track count underflow");
        if prev == 1 {
            for level in 2..=NR_PAGE_SIZES {
                self.lpage_disallowed[level - 2][self.lpage_index(level, gfn)]
                    .fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    pub fn is_write_tracked(&self, gfn: Gfn) -> bool {
        self.write_track[gfn - self.base_gfn].load(Ordering::Relaxed) > 0
    }

    /// Whether a mapping of `level` covering `gfn` is ruled out by slot
    /// geometry, dirty logging or page tracking.
    pub fn disallow_lpage(&self, level: usize, gfn: Gfn) -> bool {
        if level == 1 {
            return false;
        }
        if self.flags.contains(MemSlotFlags::LOG_DIRTY_PAGES) {
            return true;
        }
        self.lpage_disallowed[level - 2][self.lpage_index(level, gfn)].load(Ordering::Relaxed) > 0
    }

    /// Largest mapping level usable for `gfn` in this slot.
    pub fn max_mapping_level(&self, gfn: Gfn) -> usize {
        for level in (2..=NR_PAGE_SIZES).rev() {
            if !self.disallow_lpage(level, gfn) {
                return level;
            }
        }
        1
    }
}

/// One published generation of a slot address space.
///
/// Slots are kept in a dense array sorted by descending base frame with an
/// id-to-index side table, replacing intrusive list/hash bookkeeping. The
/// atomic hint caches the last hit for the common case of repeated faults
/// in one slot.
#[derive(Debug)]
pub struct MemorySlots {
    generation: u64,
    slots: Vec<MemorySlot>,
    id_to_index: [i16; MEM_SLOTS_NUM],
    lru_slot: AtomicUsize,
}

impl Clone for MemorySlots {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            slots: self.slots.clone(),
            id_to_index: self.id_to_index,
            lru_slot: AtomicUsize::new(self.lru_slot.load(Ordering::Relaxed)),
        }
    }
}

impl Default for MemorySlots {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySlots {
    pub fn new() -> Self {
        Self {
            generation: 0,
            slots: Vec::new(),
            id_to_index: [-1; MEM_SLOTS_NUM],
            lru_slot: AtomicUsize::new(0),
        }
    }

    /// Generation of this snapshot; strictly increases on every
    /// replacement. Any translation cached against an older generation must
    /// be treated as potentially stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn used_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemorySlot> {
        self.slots.iter()
    }

    /// Finds the valid slot containing `gfn`, if any. Lock-free: operates
    /// entirely on this immutable snapshot.
    pub fn lookup(&self, gfn: Gfn) -> Option<&MemorySlot> {
        let hint = self.lru_slot.load(Ordering::Relaxed);
        if let Some(slot) = self.slots.get(hint) {
            if slot.contains(gfn) && slot.is_valid() {
                return Some(slot);
            }
        }

        let index = self.slots.partition_point(|slot| slot.base_gfn() > gfn);
        let slot = self.slots.get(index)?;
        if slot.contains(gfn) && slot.is_valid() {
            self.lru_slot.store(index, Ordering::Relaxed);
            Some(slot)
        } else {
            None
        }
    }

    /// Like [`MemorySlots::lookup`], but also returns slots marked
    /// `INVALID`. Used by bookkeeping paths that drain reverse mappings
    /// while a deleted slot is still in flight.
    pub(crate) fn lookup_any(&self, gfn: Gfn) -> Option<&MemorySlot> {
        let index = self.slots.partition_point(|slot| slot.base_gfn() > gfn);
        self.slots.get(index).filter(|slot| slot.contains(gfn))
    }

    pub fn slot_by_id(&self, id: u16) -> Option<&MemorySlot> {
        let index = *self.id_to_index.get(id as usize)?;
        (index >= 0).then(|| &self.slots[index as usize])
    }

    pub(crate) fn slot_by_id_mut(&mut self, id: u16) -> Option<&mut MemorySlot> {
        let index = *self.id_to_index.get(id as usize)?;
        (index >= 0).then(|| &mut self.slots[index as usize])
    }

    /// Whether `[base_gfn, base_gfn + npages)` intersects any slot other
    /// than `skip_id`.
    pub fn overlaps(&self, base_gfn: Gfn, npages: usize, skip_id: u16) -> bool {
        self.slots.iter().any(|slot| {
            slot.id() != skip_id
                && base_gfn < slot.base_gfn() + slot.npages()
                && slot.base_gfn() < base_gfn + npages
        })
    }

    pub(crate) fn insert(&mut self, slot: MemorySlot) {
        debug_assert!(self.slot_by_id(slot.id()).is_none());
        debug_assert!(self.slots.len() < MEM_SLOTS_NUM);
        let index = self
            .slots
            .partition_point(|other| other.base_gfn() > slot.base_gfn());
        self.slots.insert(index, slot);
        self.reindex();
    }

    pub(crate) fn remove(&mut self, id: u16) -> Option<MemorySlot> {
        let index = *self.id_to_index.get(id as usize)?;
        if index < 0 {
            return None;
        }
        let slot = self.slots.remove(index as usize);
        self.reindex();
        Some(slot)
    }

    fn reindex(&mut self) {
        self.id_to_index = [-1; MEM_SLOTS_NUM];
        for (index, slot) in self.slots.iter().enumerate() {
            self.id_to_index[slot.id() as usize] = index as i16;
        }
        self.lru_slot.store(0, Ordering::Relaxed);
    }
}

/// Published handle to the active [`MemorySlots`] snapshot of one address
/// space.
///
/// Readers clone the `Arc` and keep using their snapshot regardless of
/// concurrent publication; the reference count is the grace period that
/// delays reclamation of a superseded table until its readers drain.
/// Publications themselves are serialized by the VM's slots lock.
#[derive(Debug)]
pub struct AddressSpace {
    current: RwLock<Arc<MemorySlots>>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(MemorySlots::new())),
        }
    }

    /// The snapshot visible at this instant.
    pub fn snapshot(&self) -> Arc<MemorySlots> {
        self.current.read().clone()
    }

    /// Atomically replaces the active table. The new table's generation is
    /// set to the successor of the replaced one, and the replaced snapshot
    /// is returned so the caller can finish draining against it.
    pub fn install(&self, mut next: MemorySlots) -> Arc<MemorySlots> {
        let mut current = self.current.write();
        next.set_generation(current.generation() + 1);
        core::mem::replace(&mut *current, Arc::new(next))
    }
}
