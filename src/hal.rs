//! Host services the VM core depends on.

use crate::addr::{HostPhysAddr, HostVirtAddr};

/// Interface to the host kernel or unikernel hosting the hypervisor.
///
/// Everything the core needs from its environment goes through this trait:
/// physical frame allocation for hardware-consumed structures (VMCB,
/// permission maps, host-save area, shadow page tables) and translation
/// between host-physical and host-virtual views of those frames.
///
/// Implementations must hand out frames that stay mapped and pinned for the
/// lifetime of the returned address.
pub trait VmmHal: Sized + Send + Sync + 'static {
    /// Allocates one 4 KiB physical frame.
    fn alloc_frame() -> Option<HostPhysAddr>;

    /// Deallocates a frame previously returned by [`VmmHal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);

    /// Allocates `count` physically contiguous 4 KiB frames.
    fn alloc_contiguous_frames(count: usize) -> Option<HostPhysAddr>;

    /// Deallocates frames from [`VmmHal::alloc_contiguous_frames`].
    fn dealloc_contiguous_frames(paddr: HostPhysAddr, count: usize);

    /// Maps a host-physical address to a directly accessible host-virtual
    /// address.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;

    /// Resolves a host-virtual address (e.g. the userspace backing of a
    /// memory slot) to the host-physical frame behind it, pinning it for
    /// guest use. Returns `None` if the address is not backed.
    fn virt_to_phys(vaddr: HostVirtAddr) -> Option<HostPhysAddr>;
}
