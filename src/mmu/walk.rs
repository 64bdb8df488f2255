// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Software walk of the guest's own page tables, used by shadow paging to
//! resolve guest-virtual to guest-physical before the slot registry is
//! consulted.

use super::{PageFaultErrorCode, TranslationFault};
use crate::addr::{GuestPhysAddr, GuestVirtAddr, PAGE_SHIFT, gpa_to_gfn, page_offset};
use crate::slots::MemorySlots;

const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_HUGE: u64 = 1 << 7;
const PTE_NX: u64 = 1 << 63;

/// The guest paging state a walk needs, captured from the vCPU at fault
/// time.
#[derive(Debug, Clone, Copy)]
pub struct GuestWalkInfo {
    /// Guest CR3: physical base of the top-level guest page table.
    pub cr3: u64,
    /// Guest page table levels (4 for long mode).
    pub level: usize,
    /// EFER.NXE: no-execute checking enabled.
    pub nxe: bool,
    /// CR0.WP: supervisor writes honor read-only mappings.
    pub wp: bool,
}

/// Resolves `gva` through the guest page tables.
///
/// A denial by the guest's own tables comes back as a fault descriptor to
/// inject; a guest page table living outside every memory slot comes back
/// with `GUEST_PAGE` set so the caller can treat it as MMIO or an error.
pub fn walk_guest_tables(
    slots: &MemorySlots,
    info: &GuestWalkInfo,
    gva: GuestVirtAddr,
    access: PageFaultErrorCode,
) -> Result<GuestPhysAddr, TranslationFault> {
    let access = access & PageFaultErrorCode::ACCESS_MASK;
    let mut table_gpa = (info.cr3 & PTE_ADDR_MASK) as usize;
    let mut level = info.level;

    loop {
        let index = (gva.as_usize() >> (PAGE_SHIFT + 9 * (level - 1))) & 0x1ff;
        let pte_gpa = GuestPhysAddr::from_usize(table_gpa + index * 8);
        let pte = read_guest_u64(slots, pte_gpa).ok_or(TranslationFault {
            addr: gva.as_usize(),
            error_code: access | PageFaultErrorCode::GUEST_PAGE,
            level,
        })?;

        if pte & PTE_PRESENT == 0 {
            return Err(TranslationFault {
                addr: gva.as_usize(),
                error_code: access,
                level,
            });
        }

        let user = access.contains(PageFaultErrorCode::USER);
        let protection = (access.contains(PageFaultErrorCode::WRITE)
            && pte & PTE_WRITABLE == 0
            && (user || info.wp))
            || (user && pte & PTE_USER == 0)
            || (access.contains(PageFaultErrorCode::FETCH) && info.nxe && pte & PTE_NX != 0);
        if protection {
            return Err(TranslationFault {
                addr: gva.as_usize(),
                error_code: access | PageFaultErrorCode::PRESENT,
                level,
            });
        }

        if level == 1 || (pte & PTE_HUGE != 0 && level <= 3) {
            let page_bits = PAGE_SHIFT + 9 * (level - 1);
            let base = (pte & PTE_ADDR_MASK) as usize & !((1 << page_bits) - 1);
            let offset = gva.as_usize() & ((1 << page_bits) - 1);
            return Ok(GuestPhysAddr::from_usize(base | offset));
        }

        table_gpa = (pte & PTE_ADDR_MASK) as usize;
        level -= 1;
    }
}

/// Reads one naturally-aligned u64 of guest physical memory through the
/// slot registry.
pub(crate) fn read_guest_u64(slots: &MemorySlots, gpa: GuestPhysAddr) -> Option<u64> {
    let slot = slots.lookup(gpa_to_gfn(gpa))?;
    let hva = slot.hva_for(gpa_to_gfn(gpa)) + page_offset(gpa.as_usize());
    Some(unsafe { (hva.as_ptr() as *const u64).read_volatile() })
}
