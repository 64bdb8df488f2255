//! The two-level memory translation layer.
//!
//! Each vCPU owns an [`Mmu`] instance that resolves guest addresses to
//! host-physical pages: first guest-virtual to guest-physical (walked in
//! software under shadow paging, done by hardware under nested paging),
//! then guest-physical to host-physical through the memory-slot registry
//! and a tree of software-managed page-table nodes drawn from the VM-wide
//! [`MmuPages`] inventory.

mod pages;
mod paging;
pub(crate) mod rmap;
pub(crate) mod walk;

pub use pages::{MmuPages, PTE_PER_TABLE, ShadowPage};
pub use paging::{NestedPaging, PagingMode, ShadowPaging, paging_mode};
pub use walk::GuestWalkInfo;

use alloc::boxed::Box;
use alloc::vec::Vec;

use axerrno::AxResult;
use bit_field::BitField;
use bitflags::bitflags;
use page_table_entry::{GenericPTE, MappingFlags, x86_64::X64PTE};

use crate::addr::{
    Gfn, GuestPhysAddr, GuestVirtAddr, HostPhysAddr, INVALID_PAGE, gpa_to_gfn, page_offset,
};
use crate::hal::VmmHal;
use crate::slots::{MemSlotFlags, MemorySlot, MemorySlots, NR_PAGE_SIZES};
use rmap::SpteRef;

bitflags! {
    /// Page-fault error-code bits, in the hardware #PF/#NPF layout. Bits
    /// 32/33 distinguish the two fault sources nested paging introduces.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFaultErrorCode: u64 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const RSVD = 1 << 3;
        const FETCH = 1 << 4;
        const PK = 1 << 5;
        /// The fault hit the final guest-physical translation.
        const GUEST_FINAL = 1 << 32;
        /// The fault hit a guest page table during the walk.
        const GUEST_PAGE = 1 << 33;
    }
}

impl PageFaultErrorCode {
    /// The bits describing the access itself, as opposed to its outcome.
    pub const ACCESS_MASK: Self = Self::WRITE
        .union(Self::USER)
        .union(Self::FETCH)
        .union(Self::PK);
}

/// A guest access the MMU could not translate, reported upward for the
/// emulator/trampoline to inject or treat as MMIO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationFault {
    /// Faulting guest address: virtual for guest-page-table faults,
    /// physical for final-translation faults.
    pub addr: usize,
    pub error_code: PageFaultErrorCode,
    /// Translation level the fault occurred at.
    pub level: usize,
}

/// Outcome of a resolve: the installed host-physical address, or the fault
/// to surface.
pub type TranslateResult = Result<HostPhysAddr, TranslationFault>;

/// Guest pte-access bits in the permission table's ACC format.
pub const ACC_EXEC: u8 = 1 << 0;
pub const ACC_WRITE: u8 = 1 << 1;
pub const ACC_USER: u8 = 1 << 2;
pub const ACC_ALL: u8 = ACC_EXEC | ACC_WRITE | ACC_USER;

/// Per-vCPU translation state.
#[derive(Debug)]
pub struct Mmu {
    mode: Box<dyn PagingMode>,
    root_hpa: HostPhysAddr,
    root_sp: Option<u64>,
    /// 0 until a root is installed.
    root_level: usize,
    shadow_root_level: usize,
    /// Bit set = permission fault. Byte index: fault error code [4:1],
    /// bit index: pte permissions in ACC format.
    permissions: [u8; 16],
}

impl Mmu {
    pub fn new(nested: bool) -> Self {
        let mut mmu = Self {
            mode: paging_mode(nested),
            root_hpa: INVALID_PAGE,
            root_sp: None,
            root_level: 0,
            shadow_root_level: 4,
            permissions: [0; 16],
        };
        mmu.update_permissions(true);
        mmu
    }

    pub fn is_nested(&self) -> bool {
        self.mode.is_nested()
    }

    /// Host-physical root of the translation tree, [`INVALID_PAGE`] until
    /// installed.
    pub fn root_hpa(&self) -> HostPhysAddr {
        self.root_hpa
    }

    pub fn root_level(&self) -> usize {
        self.root_level
    }

    pub fn shadow_root_level(&self) -> usize {
        self.shadow_root_level
    }

    /// Installs (or re-installs after a release) the top-level translation
    /// table and returns its host-physical address. The root node never
    /// participates in LRU reclamation.
    pub fn install_root<H: VmmHal>(
        &mut self,
        pages: &mut MmuPages<H>,
        slots: &MemorySlots,
    ) -> AxResult<HostPhysAddr> {
        if let Some(id) = self.root_sp {
            if pages.get(id).is_some() {
                return Ok(self.root_hpa);
            }
        }
        let id = pages.alloc(slots, self.shadow_root_level, 0, None, &[])?;
        self.root_sp = Some(id);
        self.root_hpa = pages.get(id).unwrap().table_paddr();
        self.root_level = self.shadow_root_level;
        debug!("[SvmVm] installed MMU root at {:#x}", self.root_hpa);
        Ok(self.root_hpa)
    }

    /// Resolves a faulting guest access, installing or updating the
    /// translation on success.
    ///
    /// The outer `Err` is host-side failure (node cap exhausted beyond
    /// reclamation); the inner `Err` is a guest-visible fault for the
    /// caller to inject or treat as MMIO.
    pub fn page_fault<H: VmmHal>(
        &mut self,
        pages: &mut MmuPages<H>,
        slots: &MemorySlots,
        info: &GuestWalkInfo,
        addr: usize,
        error_code: PageFaultErrorCode,
    ) -> AxResult<TranslateResult> {
        let access = error_code & PageFaultErrorCode::ACCESS_MASK;
        let gpa = if self.mode.is_nested() {
            GuestPhysAddr::from_usize(addr)
        } else {
            match self
                .mode
                .gva_to_gpa(slots, info, GuestVirtAddr::from_usize(addr), error_code)
            {
                Ok(gpa) => gpa,
                Err(fault) => return Ok(Err(fault)),
            }
        };

        let gfn = gpa_to_gfn(gpa);
        let write = access.contains(PageFaultErrorCode::WRITE);

        let Some(slot) = slots.lookup(gfn) else {
            // No backing slot: MMIO or out-of-bounds, decided by the caller.
            return Ok(Err(TranslationFault {
                addr: gpa.as_usize(),
                error_code: access | PageFaultErrorCode::GUEST_FINAL,
                level: 1,
            }));
        };

        if write
            && (slot.flags().contains(MemSlotFlags::READONLY) || slot.is_write_tracked(gfn))
        {
            // Read-only backing and write-tracked frames never take a
            // writable mapping; the access goes to the emulator.
            return Ok(Err(TranslationFault {
                addr: gpa.as_usize(),
                error_code: access
                    | PageFaultErrorCode::PRESENT
                    | PageFaultErrorCode::GUEST_FINAL,
                level: 1,
            }));
        }

        let level = slot.max_mapping_level(gfn);
        let map_gfn = gfn & !((1usize << (9 * (level - 1))) - 1);
        let Some(map_hpa) = H::virt_to_phys(slot.hva_for(map_gfn)) else {
            return Ok(Err(TranslationFault {
                addr: gpa.as_usize(),
                error_code: access | PageFaultErrorCode::GUEST_FINAL,
                level,
            }));
        };

        // Dirty-logged slots map read-only until a write fault arrives, so
        // every guest write is observed.
        let writable = !slot.flags().contains(MemSlotFlags::READONLY)
            && !slot.is_write_tracked(gfn)
            && (write || !slot.flags().contains(MemSlotFlags::LOG_DIRTY_PAGES));

        self.install_mapping(pages, slots, slot, map_gfn, level, map_hpa, writable)?;
        if write {
            slot.mark_dirty(gfn);
        }

        let Some(frame_hpa) = H::virt_to_phys(slot.hva_for(gfn)) else {
            return Ok(Err(TranslationFault {
                addr: gpa.as_usize(),
                error_code: access | PageFaultErrorCode::GUEST_FINAL,
                level,
            }));
        };
        let hpa = frame_hpa + page_offset(gpa.as_usize());

        // The walk is complete: deferred zaps can be freed.
        pages.flush_zapped();
        Ok(Ok(hpa))
    }

    fn install_mapping<H: VmmHal>(
        &mut self,
        pages: &mut MmuPages<H>,
        slots: &MemorySlots,
        slot: &MemorySlot,
        gfn: Gfn,
        level: usize,
        hpa: HostPhysAddr,
        writable: bool,
    ) -> AxResult<()> {
        self.install_root(pages, slots)?;
        let root = self.root_sp.unwrap();
        let mut pinned: Vec<u64> = Vec::with_capacity(self.shadow_root_level);
        pinned.push(root);

        let mut sp_id = root;
        let mut cur_level = self.shadow_root_level;
        while cur_level > level {
            let index = ShadowPage::<H>::index_of(cur_level, gfn);
            let existing = {
                let sp = pages.get(sp_id).expect("walk path node vanished");
                let pte = sp.entry(index);
                if pte.is_present() && pte.is_huge() {
                    // A larger leaf is in the way; drop it before building
                    // the finer-grained table below it.
                    let old_gfn = sp.gfn_at(index);
                    if let Some(old_slot) = slots.lookup_any(old_gfn) {
                        old_slot
                            .rmap_head(cur_level, old_gfn)
                            .remove(SpteRef { sp: sp_id, index });
                    }
                    sp.clear_entry(index);
                    None
                } else {
                    pte.is_present().then(|| pte.paddr())
                }
            };

            let child = match existing {
                Some(paddr) => pages
                    .child_of(paddr)
                    .expect("present table entry without a tracked node"),
                None => {
                    let child_span = 1usize << (9 * (cur_level - 1));
                    let base = gfn & !(child_span - 1);
                    let id = pages.alloc(
                        slots,
                        cur_level - 1,
                        base,
                        Some(SpteRef { sp: sp_id, index }),
                        &pinned,
                    )?;
                    let paddr = pages.get(id).unwrap().table_paddr();
                    pages
                        .get(sp_id)
                        .unwrap()
                        .set_entry(index, X64PTE::new_table(paddr));
                    id
                }
            };
            pages.touch(child);
            pinned.push(child);
            sp_id = child;
            cur_level -= 1;
        }

        let index = ShadowPage::<H>::index_of(level, gfn);
        if level > 1 {
            // A finer-grained table may sit where the large leaf goes.
            let existing = pages.get(sp_id).unwrap().entry(index);
            if existing.is_present() && !existing.is_huge() {
                if let Some(child) = pages.child_of(existing.paddr()) {
                    pages.zap_page(slots, child);
                }
            }
        }
        let mut flags = MappingFlags::READ | MappingFlags::EXECUTE | MappingFlags::USER;
        if writable {
            flags |= MappingFlags::WRITE;
        }
        pages
            .get(sp_id)
            .unwrap()
            .set_entry(index, X64PTE::new_page(hpa, flags, level > 1));
        slot.rmap_head(level, gfn).add(SpteRef { sp: sp_id, index });
        Ok(())
    }

    /// Removes every translation covering the guest frame behind `gpa`,
    /// at all mapping levels. Invalidating an unmapped frame is a no-op.
    pub fn invalidate_page<H: VmmHal>(
        &mut self,
        pages: &mut MmuPages<H>,
        slots: &MemorySlots,
        gpa: GuestPhysAddr,
    ) {
        let gfn = gpa_to_gfn(gpa);
        if let Some(slot) = slots.lookup_any(gfn) {
            for level in 1..=NR_PAGE_SIZES {
                for spte in slot.rmap_head(level, gfn).take() {
                    pages.clear_spte(spte);
                }
            }
        }
    }

    /// Tears down every node reachable from this MMU's root. Used on vCPU
    /// and VM teardown.
    pub fn release<H: VmmHal>(&mut self, pages: &mut MmuPages<H>, slots: &MemorySlots) {
        if let Some(root) = self.root_sp.take() {
            pages.zap_page(slots, root);
            pages.flush_zapped();
        }
        self.root_hpa = INVALID_PAGE;
        self.root_level = 0;
    }

    /// Rebuilds the permission-fault table for the current CR0.WP value.
    pub fn update_permissions(&mut self, wp: bool) {
        for (byte_index, byte) in self.permissions.iter_mut().enumerate() {
            let pfec = (byte_index as u32) << 1;
            let wf = pfec & PageFaultErrorCode::WRITE.bits() as u32 != 0;
            let uf = pfec & PageFaultErrorCode::USER.bits() as u32 != 0;
            let rsvd = pfec & PageFaultErrorCode::RSVD.bits() as u32 != 0;
            let ff = pfec & PageFaultErrorCode::FETCH.bits() as u32 != 0;

            let mut bits = 0u8;
            for acc in 0..8u8 {
                let mut fault = rsvd;
                if ff && acc & ACC_EXEC == 0 {
                    fault = true;
                }
                if uf && acc & ACC_USER == 0 {
                    fault = true;
                }
                if wf && acc & ACC_WRITE == 0 && (uf || wp) {
                    fault = true;
                }
                bits.set_bit(acc as usize, fault);
            }
            *byte = bits;
        }
    }

    /// Whether an access with fault-error-code `pfec` faults against a pte
    /// granting `acc` permissions.
    pub fn permission_fault(&self, pfec: u32, acc: u8) -> bool {
        debug_assert!(acc <= ACC_ALL);
        self.permissions[((pfec >> 1) & 0xf) as usize].get_bit(acc as usize)
    }
}

/// Downgrades every 4 KiB mapping of `gfn` to read-only and drops any
/// large mapping covering it. Called when a write-protection reason is
/// added for a tracked frame.
pub(crate) fn write_protect_gfn<H: VmmHal>(pages: &MmuPages<H>, slot: &MemorySlot, gfn: Gfn) {
    for spte in slot.rmap_head(1, gfn).collect() {
        if let Some(page) = pages.get(spte.sp) {
            let mut pte = page.entry(spte.index);
            if pte.is_present() {
                pte.set_flags(pte.flags() & !MappingFlags::WRITE, false);
                page.set_entry(spte.index, pte);
            }
        }
    }
    for level in 2..=NR_PAGE_SIZES {
        for spte in slot.rmap_head(level, gfn).take() {
            pages.clear_spte(spte);
        }
    }
}
