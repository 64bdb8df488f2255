//! The two ways first-level translation can work: shadowing the guest's
//! page tables in software, or letting the hardware walk them under nested
//! paging. One of the two is picked when the VM is created, based on
//! hardware capability.

use alloc::boxed::Box;

use super::walk::{GuestWalkInfo, walk_guest_tables};
use super::{PageFaultErrorCode, TranslationFault};
use crate::addr::{GuestPhysAddr, GuestVirtAddr};
use crate::slots::MemorySlots;

/// First-level translation behavior of a vCPU's MMU.
pub trait PagingMode: Send + Sync + core::fmt::Debug {
    /// Whether the hardware performs the guest-virtual to guest-physical
    /// step itself (nested paging).
    fn is_nested(&self) -> bool;

    /// Resolves the guest-virtual side of a fault to a guest-physical
    /// address.
    fn gva_to_gpa(
        &self,
        slots: &MemorySlots,
        info: &GuestWalkInfo,
        gva: GuestVirtAddr,
        access: PageFaultErrorCode,
    ) -> Result<GuestPhysAddr, TranslationFault>;
}

/// Software-shadowed guest page tables: every fault walks the guest's
/// tables by hand.
#[derive(Debug)]
pub struct ShadowPaging;

impl PagingMode for ShadowPaging {
    fn is_nested(&self) -> bool {
        false
    }

    fn gva_to_gpa(
        &self,
        slots: &MemorySlots,
        info: &GuestWalkInfo,
        gva: GuestVirtAddr,
        access: PageFaultErrorCode,
    ) -> Result<GuestPhysAddr, TranslationFault> {
        walk_guest_tables(slots, info, gva, access)
    }
}

/// Hardware nested paging: faulting addresses arrive already
/// guest-physical, the walk is skipped entirely.
#[derive(Debug)]
pub struct NestedPaging;

impl PagingMode for NestedPaging {
    fn is_nested(&self) -> bool {
        true
    }

    fn gva_to_gpa(
        &self,
        _slots: &MemorySlots,
        _info: &GuestWalkInfo,
        gva: GuestVirtAddr,
        _access: PageFaultErrorCode,
    ) -> Result<GuestPhysAddr, TranslationFault> {
        Ok(GuestPhysAddr::from_usize(gva.as_usize()))
    }
}

pub fn paging_mode(nested: bool) -> Box<dyn PagingMode> {
    if nested {
        Box::new(NestedPaging)
    } else {
        Box::new(ShadowPaging)
    }
}
