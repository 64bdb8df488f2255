//! The VM aggregate: the vCPU table, the two slot address spaces, the
//! shadow-page inventory, and the synchronization discipline binding
//! them.
//!
//! Locking order: a vCPU's arch lock before the mmu lock; the slots lock
//! is independent and only serializes publications. The mmu lock is taken
//! inside guest-fault resolution and is never held across an operation
//! that can block on host memory reclamation.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use axerrno::{AxResult, ax_err, ax_err_type};
use spin::{Mutex, RwLock};

use crate::addr::{Gfn, GuestPhysAddr};
use crate::hal::VmmHal;
use crate::mmu::{MmuPages, PageFaultErrorCode, TranslateResult, write_protect_gfn};
use crate::slots::{
    ADDRESS_SPACE_NUM, AddressSpace, MEM_MAX_NR_PAGES, MEM_SLOTS_NUM, MEMSLOT_USER_FLAGS,
    MemSlotFlags, MemorySlot, MemorySlots, MemoryRegion, NR_PAGE_SIZES, SlotChange,
};
use crate::svm::{CpuData, GuestEntry, REQ_TLB_FLUSH, SvmVcpu, VcpuMode};

/// Hard cap on vCPUs per VM.
pub const MAX_VCPUS: usize = 288;
/// Preferred maximum; crossing it is legal but logged.
pub const SOFT_MAX_VCPUS: usize = 240;
pub const MAX_VCPU_ID: u32 = 1023;

pub const DEFAULT_MAX_MMU_PAGES: usize = 2048;

#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Use hardware nested paging; otherwise guest tables are shadowed in
    /// software.
    pub nested_paging: bool,
    /// Cap on software-managed page-table nodes.
    pub n_max_mmu_pages: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            nested_paging: true,
            n_max_mmu_pages: DEFAULT_MAX_MMU_PAGES,
        }
    }
}

/// One virtual machine.
#[derive(Debug)]
pub struct Vm<H: VmmHal> {
    nested_paging: bool,
    address_spaces: [AddressSpace; ADDRESS_SPACE_NUM],
    /// Serializes slot mutation. Lookups never take it.
    slots_lock: Mutex<()>,
    /// A vCPU's entry is stable for its lifetime once published.
    vcpus: RwLock<Vec<Option<Arc<SvmVcpu<H>>>>>,
    /// Incremented only after the vCPU pointer is visible in the table.
    online_vcpus: AtomicU32,
    /// Also serves as the VM creation lock.
    created_vcpus: Mutex<u32>,
    /// The mmu lock: shadow-page inventory and reverse-mapping mutation.
    mmu_pages: Mutex<MmuPages<H>>,
    mmu_notifier_seq: AtomicU64,
    mmu_notifier_count: AtomicI64,
    tlbs_dirty: AtomicU64,
}

impl<H: VmmHal> Vm<H> {
    pub fn new(config: VmConfig) -> Arc<Self> {
        info!(
            "[SvmVm] created VM ({} paging, {} max mmu pages)",
            if config.nested_paging { "nested" } else { "shadow" },
            config.n_max_mmu_pages
        );
        Arc::new(Self {
            nested_paging: config.nested_paging,
            address_spaces: [AddressSpace::new(), AddressSpace::new()],
            slots_lock: Mutex::new(()),
            vcpus: RwLock::new(alloc::vec![None; MAX_VCPUS]),
            online_vcpus: AtomicU32::new(0),
            created_vcpus: Mutex::new(0),
            mmu_pages: Mutex::new(MmuPages::new(config.n_max_mmu_pages)),
            mmu_notifier_seq: AtomicU64::new(0),
            mmu_notifier_count: AtomicI64::new(0),
            tlbs_dirty: AtomicU64::new(0),
        })
    }

    pub fn nested_paging(&self) -> bool {
        self.nested_paging
    }

    pub fn online_vcpus(&self) -> u32 {
        self.online_vcpus.load(Ordering::Acquire)
    }

    pub fn created_vcpus(&self) -> u32 {
        *self.created_vcpus.lock()
    }

    pub fn n_used_mmu_pages(&self) -> usize {
        self.mmu_pages.lock().n_used_mmu_pages()
    }

    pub fn tlbs_dirty(&self) -> u64 {
        self.tlbs_dirty.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // vCPUs
    // ------------------------------------------------------------------

    pub fn create_vcpu(&self, vcpu_id: u32) -> AxResult<Arc<SvmVcpu<H>>> {
        if vcpu_id > MAX_VCPU_ID {
            return ax_err!(InvalidInput, "vcpu id out of range");
        }

        let idx;
        {
            let mut created = self.created_vcpus.lock();
            if *created as usize >= MAX_VCPUS {
                return ax_err!(ResourceBusy, "vcpu hard cap reached");
            }
            if self
                .vcpus
                .read()
                .iter()
                .flatten()
                .any(|vcpu| vcpu.vcpu_id() == vcpu_id)
            {
                return ax_err!(AlreadyExists, "vcpu id already in use");
            }
            idx = *created;
            *created += 1;
            if *created as usize > SOFT_MAX_VCPUS {
                warn!(
                    "[SvmVm] {} vcpus exceed the preferred maximum of {}",
                    *created, SOFT_MAX_VCPUS
                );
            }
        }

        // Built outside the creation lock. A failure here tears down a
        // vCPU that was never published: it holds no hardware state and
        // needs no quiescence.
        let vcpu = match SvmVcpu::new(idx, vcpu_id, self.nested_paging) {
            Ok(vcpu) => Arc::new(vcpu),
            Err(err) => {
                *self.created_vcpus.lock() -= 1;
                return Err(err);
            }
        };

        self.vcpus.write()[idx as usize] = Some(vcpu.clone());
        self.online_vcpus.fetch_add(1, Ordering::Release);
        Ok(vcpu)
    }

    pub fn vcpu(&self, idx: u32) -> Option<Arc<SvmVcpu<H>>> {
        self.vcpus.read().get(idx as usize)?.clone()
    }

    /// Builds a vCPU's reset state and, under nested paging, installs its
    /// translation root into the control block.
    pub fn setup_vcpu(&self, vcpu: &SvmVcpu<H>, entry: GuestPhysAddr) -> AxResult {
        let mut arch = vcpu.arch();
        arch.setup(entry)?;
        if self.nested_paging {
            let slots = self.memslots(arch.address_space_id());
            let root = {
                let mut pages = self.mmu_pages.lock();
                arch.mmu().install_root(&mut pages, &slots)?
            };
            arch.set_nested_root(root);
        }
        Ok(())
    }

    /// Snapshot of every online vCPU handle.
    pub fn vcpus(&self) -> Vec<Arc<SvmVcpu<H>>> {
        self.vcpus.read().iter().flatten().cloned().collect()
    }

    /// Posts `req` to every online vCPU. Returns how many are currently
    /// executing guest code and must be kicked by the caller; requests
    /// carrying [`crate::svm::REQUEST_WAIT`] require the caller to wait
    /// for those vCPUs to acknowledge before relying on the effect.
    pub fn make_all_vcpus_request(&self, req: u64) -> usize {
        self.vcpus
            .read()
            .iter()
            .flatten()
            .filter(|vcpu| vcpu.make_request(req))
            .count()
    }

    /// Queues a TLB flush on every vCPU.
    pub fn flush_remote_tlbs(&self) -> usize {
        self.tlbs_dirty.fetch_add(1, Ordering::Relaxed);
        self.make_all_vcpus_request(REQ_TLB_FLUSH)
    }

    /// Readies `vcpu` for hardware entry, refusing while a
    /// memory-notifier invalidation is in flight so stale translations
    /// cannot race into hardware.
    pub fn prepare_vcpu_entry(
        &self,
        vcpu: &SvmVcpu<H>,
        cpu: &mut CpuData<H>,
    ) -> AxResult<GuestEntry> {
        if self.mmu_notifier_count.load(Ordering::Acquire) > 0 {
            return ax_err!(WouldBlock, "memory-notifier invalidation in flight");
        }
        vcpu.prepare_entry(cpu)
    }

    // ------------------------------------------------------------------
    // Memory slots
    // ------------------------------------------------------------------

    /// The published slot table of an address space.
    pub fn memslots(&self, as_id: usize) -> Arc<MemorySlots> {
        self.address_spaces[as_id].snapshot()
    }

    /// Creates, deletes, moves or reflags a memory slot.
    ///
    /// Conflicting requests are rejected synchronously with no partial
    /// mutation. Deletes and moves publish an intermediate table with the
    /// slot marked invalid, drain its cached translations, then publish
    /// the final table.
    pub fn set_memory_region(&self, as_id: usize, region: MemoryRegion) -> AxResult {
        if as_id >= ADDRESS_SPACE_NUM {
            return ax_err!(InvalidInput, "bad address space id");
        }
        if region.slot_id as usize >= MEM_SLOTS_NUM {
            return ax_err!(InvalidInput, "slot id out of range");
        }
        if region.flags.bits() & !MEMSLOT_USER_FLAGS != 0 {
            return ax_err!(InvalidInput, "reserved slot flags");
        }
        if region.npages > MEM_MAX_NR_PAGES
            || region.base_gfn.checked_add(region.npages).is_none()
        {
            return ax_err!(InvalidInput, "slot range too large");
        }

        let _guard = self.slots_lock.lock();
        let current = self.memslots(as_id);
        let old = current.slot_by_id(region.slot_id);

        let change = if region.npages == 0 {
            if old.is_none() {
                return ax_err!(NotFound, "no such slot");
            }
            SlotChange::Delete
        } else {
            match old {
                None => SlotChange::Create,
                Some(old) => {
                    if old.npages() != region.npages {
                        return ax_err!(InvalidInput, "slots cannot be resized in place");
                    }
                    if old.base_gfn() != region.base_gfn {
                        SlotChange::Move
                    } else if old.flags() != region.flags {
                        SlotChange::FlagsOnly
                    } else {
                        return Ok(());
                    }
                }
            }
        };

        if matches!(change, SlotChange::Create | SlotChange::Move)
            && current.overlaps(region.base_gfn, region.npages, region.slot_id)
        {
            return ax_err!(AlreadyExists, "slot range overlaps an active slot");
        }

        match change {
            SlotChange::Create => {
                if current.used_slots() >= MEM_SLOTS_NUM {
                    return ax_err!(ResourceBusy, "slot table full");
                }
                let mut next = (*current).clone();
                next.insert(MemorySlot::new(
                    region.slot_id,
                    region.base_gfn,
                    region.npages,
                    region.userspace_addr,
                    region.flags,
                ));
                self.address_spaces[as_id].install(next);
            }
            SlotChange::FlagsOnly => {
                let mut next = (*current).clone();
                let slot = next.slot_by_id_mut(region.slot_id).unwrap();
                let rebuilt = slot.with_flags(region.flags);
                let drained = rebuilt.clone();
                *slot = rebuilt;
                self.address_spaces[as_id].install(next);
                if region.flags.contains(MemSlotFlags::LOG_DIRTY_PAGES) {
                    // Existing writable mappings must start faulting so
                    // every write lands in the log.
                    self.zap_slot_mappings(&drained);
                    self.flush_remote_tlbs();
                }
            }
            SlotChange::Delete | SlotChange::Move => {
                let drained = old.unwrap().clone();

                // Phase 1: lookups stop seeing the slot.
                let mut invalid = (*current).clone();
                let slot = invalid.slot_by_id_mut(region.slot_id).unwrap();
                slot.set_flags(slot.flags() | MemSlotFlags::INVALID);
                self.address_spaces[as_id].install(invalid);

                // Drain cached translations through the shared rmap heads
                // before the grace period lets the old table go.
                self.zap_slot_mappings(&drained);
                self.flush_remote_tlbs();

                // Phase 2: publish the final table.
                let current = self.memslots(as_id);
                let mut next = (*current).clone();
                next.remove(region.slot_id);
                if change == SlotChange::Move {
                    next.insert(MemorySlot::new(
                        region.slot_id,
                        region.base_gfn,
                        region.npages,
                        region.userspace_addr,
                        region.flags,
                    ));
                }
                self.address_spaces[as_id].install(next);
            }
        }

        debug!(
            "[SvmVm] as{} slot {}: {:?} (gfn {:#x} +{:#x} pages)",
            as_id, region.slot_id, change, region.base_gfn, region.npages
        );
        Ok(())
    }

    /// Harvests and clears a slot's dirty bitmap. Harvested pages are
    /// write-protected again so the next write is observed.
    pub fn get_dirty_log(&self, as_id: usize, slot_id: u16) -> AxResult<Vec<u64>> {
        let slots = self.memslots(as_id);
        let slot = slots
            .slot_by_id(slot_id)
            .ok_or_else(|| ax_err_type!(NotFound, "no such slot"))?;
        let log = slot
            .take_dirty_bitmap()
            .ok_or_else(|| ax_err_type!(InvalidInput, "slot does not log dirty pages"))?;
        self.zap_slot_mappings(slot);
        self.flush_remote_tlbs();
        Ok(log)
    }

    fn zap_slot_mappings(&self, slot: &MemorySlot) {
        let mut pages = self.mmu_pages.lock();
        for level in 1..=NR_PAGE_SIZES {
            for head in slot.rmap_level(level) {
                for spte in head.take() {
                    pages.clear_spte(spte);
                }
            }
        }
        pages.flush_zapped();
    }

    // ------------------------------------------------------------------
    // Guest faults
    // ------------------------------------------------------------------

    /// Resolves a guest fault for `vcpu`, retrying if a memory-notifier
    /// invalidation raced the translation.
    pub fn vcpu_page_fault(
        &self,
        vcpu: &SvmVcpu<H>,
        addr: usize,
        error_code: PageFaultErrorCode,
    ) -> AxResult<TranslateResult> {
        loop {
            let seq = self.mmu_notifier_seq.load(Ordering::Acquire);
            if self.mmu_notifier_count.load(Ordering::Acquire) > 0 {
                core::hint::spin_loop();
                continue;
            }

            let mut arch = vcpu.arch();
            let slots = self.memslots(arch.address_space_id());
            let info = arch.walk_info();
            let result = {
                let mut pages = self.mmu_pages.lock();
                arch.mmu().page_fault(&mut pages, &slots, &info, addr, error_code)?
            };
            drop(arch);

            if self.mmu_notifier_retry(seq) {
                continue;
            }
            return Ok(result);
        }
    }

    // ------------------------------------------------------------------
    // Host memory-notifier boundary
    // ------------------------------------------------------------------

    pub fn mmu_notifier_seq(&self) -> u64 {
        self.mmu_notifier_seq.load(Ordering::Acquire)
    }

    pub fn mmu_notifier_count(&self) -> i64 {
        self.mmu_notifier_count.load(Ordering::Acquire)
    }

    /// Whether a translation started at `seq` may have raced a notifier
    /// and must be retried.
    pub fn mmu_notifier_retry(&self, seq: u64) -> bool {
        self.mmu_notifier_count.load(Ordering::Acquire) > 0
            || self.mmu_notifier_seq.load(Ordering::Acquire) != seq
    }

    /// Host memory pressure: drop every cached translation for
    /// `[start, end)` across both address spaces.
    pub fn notifier_invalidate_range_start(&self, start: Gfn, end: Gfn) {
        self.mmu_notifier_count.fetch_add(1, Ordering::AcqRel);
        for address_space in &self.address_spaces {
            let slots = address_space.snapshot();
            let mut pages = self.mmu_pages.lock();
            for slot in slots.iter() {
                let lo = start.max(slot.base_gfn());
                let hi = end.min(slot.base_gfn() + slot.npages());
                for gfn in lo..hi {
                    for level in 1..=NR_PAGE_SIZES {
                        for spte in slot.rmap_head(level, gfn).take() {
                            pages.clear_spte(spte);
                        }
                    }
                }
            }
            pages.flush_zapped();
        }
        self.flush_remote_tlbs();
    }

    pub fn notifier_invalidate_range_end(&self) {
        self.mmu_notifier_seq.fetch_add(1, Ordering::AcqRel);
        let outstanding = self.mmu_notifier_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(outstanding > 0);
    }

    // ------------------------------------------------------------------
    // Page-track boundary
    // ------------------------------------------------------------------

    /// Adds a write-protection reason for `gfn` and downgrades its
    /// existing mappings so the next write faults to the emulator.
    pub fn track_write(&self, as_id: usize, gfn: Gfn) -> AxResult {
        let slots = self.memslots(as_id);
        let slot = slots
            .lookup(gfn)
            .ok_or_else(|| ax_err_type!(NotFound, "gfn not backed by a slot"))?;
        slot.write_track_add(gfn);
        {
            let pages = self.mmu_pages.lock();
            write_protect_gfn(&pages, slot, gfn);
        }
        self.flush_remote_tlbs();
        Ok(())
    }

    /// Drops one write-protection reason for `gfn`.
    pub fn untrack_write(&self, as_id: usize, gfn: Gfn) -> AxResult {
        let slots = self.memslots(as_id);
        let slot = slots
            .lookup(gfn)
            .ok_or_else(|| ax_err_type!(NotFound, "gfn not backed by a slot"))?;
        slot.write_track_remove(gfn);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Tears the VM down: every vCPU must be quiesced, then MMU state is
    /// released, then the slot registries.
    pub fn destroy(&self) -> AxResult {
        {
            let vcpus = self.vcpus.read();
            if vcpus
                .iter()
                .flatten()
                .any(|vcpu| vcpu.mode() != VcpuMode::OutsideGuestMode)
            {
                return ax_err!(BadState, "vcpu is not quiesced");
            }
            for vcpu in vcpus.iter().flatten() {
                let mut arch = vcpu.arch();
                let slots = self.memslots(arch.address_space_id());
                let mut pages = self.mmu_pages.lock();
                arch.mmu().release(&mut pages, &slots);
            }
        }

        self.vcpus.write().iter_mut().for_each(|slot| *slot = None);
        self.online_vcpus.store(0, Ordering::Release);

        let _guard = self.slots_lock.lock();
        for address_space in &self.address_spaces {
            address_space.install(MemorySlots::new());
        }
        info!("[SvmVm] VM destroyed");
        Ok(())
    }
}
