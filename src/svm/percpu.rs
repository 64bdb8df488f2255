//! Per-physical-core SVM state: the host-save area and the ASID
//! allocator.
//!
//! ASIDs tag TLB entries so guest/host switches need no flush. Each core
//! hands them out monotonically; when the space is exhausted the core's
//! generation is bumped and numbering restarts, which implicitly
//! invalidates every vCPU's cached ASID on that core. A vCPU whose cached
//! generation mismatches pays reassignment plus a TLB-flush marker on its
//! next entry, so the full-flush cost is only paid at rollover.
//!
//! Reference: AMD64 APM Vol.2, Sections 15.5 and 15.30.4.

use axerrno::{AxResult, ax_err};

use crate::addr::HostPhysAddr;
use crate::frame::PhysFrame;
use crate::hal::VmmHal;

/// First ASID handed to guests; ASID 0 belongs to the host.
pub const MIN_ASID: u32 = 1;

/// A fresh ASID with the generation it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsidAssignment {
    pub asid: u32,
    pub generation: u64,
}

/// Per-core allocator state plus the VMRUN host-save area.
///
/// The save-area page is registered with the hardware (`MSR_VM_HSAVE_PA`)
/// by the platform glue before the first entry on this core.
#[derive(Debug)]
pub struct CpuData<H: VmmHal> {
    cpu: usize,
    asid_generation: u64,
    max_asid: u32,
    next_asid: u32,
    save_area: PhysFrame<H>,
}

impl<H: VmmHal> CpuData<H> {
    pub fn new(cpu: usize, max_asid: u32) -> AxResult<Self> {
        if max_asid < MIN_ASID {
            return ax_err!(InvalidInput, "core supports no assignable ASIDs");
        }
        let data = Self {
            cpu,
            asid_generation: 1,
            max_asid,
            next_asid: MIN_ASID,
            save_area: PhysFrame::alloc_zero()?,
        };
        info!(
            "[SvmVm] cpu{}: ASIDs {}..={} (hsave @ {:#x})",
            cpu,
            MIN_ASID,
            max_asid,
            data.save_area_paddr()
        );
        Ok(data)
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Current allocator generation. Compared against every vCPU's cached
    /// stamp on guest entry.
    pub fn generation(&self) -> u64 {
        self.asid_generation
    }

    pub fn max_asid(&self) -> u32 {
        self.max_asid
    }

    pub fn save_area_paddr(&self) -> HostPhysAddr {
        self.save_area.start_paddr()
    }

    /// Hands out the next ASID. Exhaustion is not an error: the generation
    /// is bumped and numbering restarts at [`MIN_ASID`], staling every
    /// other vCPU on this core.
    pub fn new_asid(&mut self) -> AsidAssignment {
        if self.next_asid > self.max_asid {
            self.asid_generation += 1;
            self.next_asid = MIN_ASID;
            debug!(
                "[SvmVm] cpu{}: ASID space exhausted, generation -> {}",
                self.cpu, self.asid_generation
            );
        }
        let asid = self.next_asid;
        self.next_asid += 1;
        AsidAssignment {
            asid,
            generation: self.asid_generation,
        }
    }
}

/// Maximum assignable guest ASID reported by CPUID leaf 0x8000_000A
/// (the count minus the host's ASID 0).
#[cfg(target_arch = "x86_64")]
pub fn max_asid_from_cpuid() -> Option<u32> {
    let count = raw_cpuid::CpuId::new().get_svm_info()?.supported_asids();
    (count > 1).then(|| count - 1)
}
