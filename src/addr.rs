//! Address and frame-number types shared across the crate.

use memory_addr::PAGE_SIZE_4K;

/// Host virtual address.
pub type HostVirtAddr = memory_addr::VirtAddr;
/// Host physical address.
pub type HostPhysAddr = memory_addr::PhysAddr;

memory_addr::def_usize_addr! {
    /// Guest virtual address.
    pub type GuestVirtAddr;
    /// Guest physical address.
    pub type GuestPhysAddr;
}

memory_addr::def_usize_addr_formatter! {
    GuestVirtAddr = "GVA:{}";
    GuestPhysAddr = "GPA:{}";
}

/// Guest frame number: a guest physical address shifted right by the page
/// shift.
pub type Gfn = usize;

pub const PAGE_SHIFT: usize = 12;

/// Sentinel meaning "no translation root installed".
pub const INVALID_PAGE: HostPhysAddr = HostPhysAddr::from_usize(usize::MAX);

#[inline]
pub const fn gpa_to_gfn(gpa: GuestPhysAddr) -> Gfn {
    gpa.as_usize() >> PAGE_SHIFT
}

#[inline]
pub const fn gfn_to_gpa(gfn: Gfn) -> GuestPhysAddr {
    GuestPhysAddr::from_usize(gfn << PAGE_SHIFT)
}

/// Offset of an address within its 4 KiB frame.
#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE_4K - 1)
}
