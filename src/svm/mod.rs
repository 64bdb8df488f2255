//! AMD-V (SVM) specifics: the VMCB and its dirty-segment discipline, the
//! per-core ASID allocator, and the vCPU.

mod definitions;
mod percpu;
mod structs;
mod vcpu;
mod vmcb;

pub use definitions::{SvmExitCode, SvmIntercept};
#[cfg(target_arch = "x86_64")]
pub use percpu::max_asid_from_cpuid;
pub use percpu::{AsidAssignment, CpuData, MIN_ASID};
pub use structs::{IOPm, MSRPm, VmcbFrame};
pub use vcpu::{
    CR0_GUEST_OWNED_BITS, GuestEntry, HFlags, REQ_TLB_FLUSH, REQUEST_MASK, REQUEST_NO_WAKEUP,
    REQUEST_WAIT, SvmVcpu, VcpuArch, VcpuMode,
};
pub use vmcb::{
    SvmExitInfo, TLB_CONTROL_DO_NOTHING, TLB_CONTROL_FLUSH_ALL, TLB_CONTROL_FLUSH_ASID,
    TLB_CONTROL_FLUSH_ASID_LOCAL, VMCB_CLEAN_ALL, VmcbDirty, VmcbStruct,
};

/// Whether this processor supports AMD-V.
pub fn has_hardware_support() -> bool {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            raw_cpuid::CpuId::new()
                .get_extended_processor_and_feature_identifiers()
                .is_some_and(|ext| ext.has_svm())
        } else {
            false
        }
    }
}
