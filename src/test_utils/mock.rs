//! A mock host: identity-mapped frames drawn from the test heap.

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::addr::{HostPhysAddr, HostVirtAddr};
use crate::frame::PAGE_SIZE;
use crate::hal::VmmHal;

static ALLOCS: Mutex<BTreeMap<usize, usize>> = Mutex::new(BTreeMap::new());

/// Host interface backed by the test allocator. Host-physical and
/// host-virtual addresses coincide.
pub struct MockHal;

impl MockHal {
    /// Per-test bookkeeping hook; frames owned by live RAII wrappers stay
    /// valid across it.
    pub fn reset() {}
}

impl VmmHal for MockHal {
    fn alloc_frame() -> Option<HostPhysAddr> {
        Self::alloc_contiguous_frames(1)
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        Self::dealloc_contiguous_frames(paddr, 1)
    }

    fn alloc_contiguous_frames(count: usize) -> Option<HostPhysAddr> {
        let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        ALLOCS.lock().insert(ptr as usize, count);
        Some(HostPhysAddr::from(ptr as usize))
    }

    fn dealloc_contiguous_frames(paddr: HostPhysAddr, count: usize) {
        let removed = ALLOCS.lock().remove(&paddr.as_usize());
        debug_assert_eq!(removed, Some(count));
        let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { dealloc(paddr.as_usize() as *mut u8, layout) }
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }

    fn virt_to_phys(vaddr: HostVirtAddr) -> Option<HostPhysAddr> {
        Some(HostPhysAddr::from(vaddr.as_usize()))
    }
}
