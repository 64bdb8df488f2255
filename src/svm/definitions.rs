//! #VMEXIT codes and intercept selectors.
//!
//! Reference: AMD64 APM Vol.2, Appendix C "SVM Intercept Exit Codes".

#![allow(non_camel_case_types)]

numeric_enum_macro::numeric_enum! {
    #[repr(u64)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Exit codes reported in the VMCB after a #VMEXIT. Exception
    /// intercepts (0x40..0x5f) are decoded by the emulator and not listed
    /// here.
    pub enum SvmExitCode {
        INTR = 0x60,
        NMI = 0x61,
        SMI = 0x62,
        INIT = 0x63,
        VINTR = 0x64,
        CPUID = 0x72,
        IRET = 0x74,
        PAUSE = 0x77,
        HLT = 0x78,
        INVLPG = 0x79,
        INVLPGA = 0x7a,
        IOIO = 0x7b,
        MSR = 0x7c,
        SHUTDOWN = 0x7f,
        VMRUN = 0x80,
        VMMCALL = 0x81,
        VMLOAD = 0x82,
        VMSAVE = 0x83,
        STGI = 0x84,
        CLGI = 0x85,
        SKINIT = 0x86,
        NPF = 0x400,
        INVALID = 0xffff_ffff_ffff_ffff,
    }
}

/// Instructions and events a VMCB can be told to intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvmIntercept {
    // vector 3
    INTR,
    NMI,
    SMI,
    INIT,
    VINTR,
    CPUID,
    IRET,
    PAUSE,
    HLT,
    INVLPG,
    INVLPGA,
    IOIO_PROT,
    MSR_PROT,
    TASK_SWITCH,
    SHUTDOWN,
    // vector 4
    VMRUN,
    VMMCALL,
    VMLOAD,
    VMSAVE,
    STGI,
    CLGI,
    SKINIT,
}
