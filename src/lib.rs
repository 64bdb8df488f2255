#![no_std]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

mod addr;
mod frame;
mod hal;
mod mmu;
mod regs;
mod slots;
mod svm;
mod vm;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use addr::{
    Gfn, GuestPhysAddr, GuestVirtAddr, HostPhysAddr, HostVirtAddr, INVALID_PAGE, PAGE_SHIFT,
    gfn_to_gpa, gpa_to_gfn,
};
pub use hal::VmmHal;
pub use mmu::{
    GuestWalkInfo, Mmu, MmuPages, NestedPaging, PTE_PER_TABLE, PageFaultErrorCode, PagingMode,
    ShadowPage, ShadowPaging, TranslateResult, TranslationFault,
};
pub use regs::{
    EXREG_CR3, EXREG_PDPTR, EXREG_RFLAGS, EXREG_SEGMENTS, GeneralRegisters, GuestReg,
    NR_GUEST_REGS, RegisterCache,
};
pub use slots::{
    ADDRESS_SPACE_NUM, APIC_ACCESS_PAGE_PRIVATE_MEMSLOT, AddressSpace,
    IDENTITY_PAGETABLE_PRIVATE_MEMSLOT, MEM_SLOTS_NUM, MemSlotFlags, MemorySlot, MemorySlots,
    MemoryRegion, NR_PAGE_SIZES, SlotChange, TSS_PRIVATE_MEMSLOT, USER_MEM_SLOTS,
    hpage_gfn_shift, hpage_size,
};
#[cfg(target_arch = "x86_64")]
pub use svm::max_asid_from_cpuid;
pub use svm::{
    AsidAssignment, CR0_GUEST_OWNED_BITS, CpuData, GuestEntry, HFlags, IOPm, MIN_ASID, MSRPm,
    REQ_TLB_FLUSH, REQUEST_MASK, REQUEST_NO_WAKEUP, REQUEST_WAIT, SvmExitCode, SvmExitInfo,
    SvmIntercept, SvmVcpu, TLB_CONTROL_DO_NOTHING, TLB_CONTROL_FLUSH_ALL, TLB_CONTROL_FLUSH_ASID,
    TLB_CONTROL_FLUSH_ASID_LOCAL, VMCB_CLEAN_ALL, VcpuArch, VcpuMode, VmcbDirty, VmcbFrame,
    has_hardware_support,
};
pub use vm::{DEFAULT_MAX_MMU_PAGES, MAX_VCPU_ID, MAX_VCPUS, SOFT_MAX_VCPUS, Vm, VmConfig};
