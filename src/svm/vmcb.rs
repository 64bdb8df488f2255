//! The Virtual-Machine Control Block.
//!
//! A VMCB is a single 4 KiB page: a control area at offset 0x0 and a
//! state-save area at offset 0x400, every field at a hardware-fixed
//! offset. tock-registers generates typed accessors over the raw page so
//! field access compiles to plain loads and stores.
//!
//! The control block is consumed incrementally: the hardware only reloads
//! the segments whose clean bit is unset. [`VmcbDirty`] is the software
//! side of that contract, recording which segments were touched since the
//! last `VMRUN` so the clean word can be derived before entry.
//!
//! Reference: AMD64 APM Vol.2, Appendix B "VMCB Layout".

#![allow(non_camel_case_types)]

use bitflags::bitflags;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

use super::definitions::{SvmExitCode, SvmIntercept};
use super::structs::VmcbFrame;
use crate::hal::VmmHal;

register_bitfields![u32,
    pub InterceptVec3 [
        INTR OFFSET(0) NUMBITS(1) [],
        NMI OFFSET(1) NUMBITS(1) [],
        SMI OFFSET(2) NUMBITS(1) [],
        INIT OFFSET(3) NUMBITS(1) [],
        VINTR OFFSET(4) NUMBITS(1) [],
        CR0_SEL_WRITE OFFSET(5) NUMBITS(1) [],
        IDTR_READ OFFSET(6) NUMBITS(1) [],
        GDTR_READ OFFSET(7) NUMBITS(1) [],
        LDTR_READ OFFSET(8) NUMBITS(1) [],
        TR_READ OFFSET(9) NUMBITS(1) [],
        IDTR_WRITE OFFSET(10) NUMBITS(1) [],
        GDTR_WRITE OFFSET(11) NUMBITS(1) [],
        LDTR_WRITE OFFSET(12) NUMBITS(1) [],
        TR_WRITE OFFSET(13) NUMBITS(1) [],
        RDTSC OFFSET(14) NUMBITS(1) [],
        RDPMC OFFSET(15) NUMBITS(1) [],
        PUSHF OFFSET(16) NUMBITS(1) [],
        POPF OFFSET(17) NUMBITS(1) [],
        CPUID OFFSET(18) NUMBITS(1) [],
        RSM OFFSET(19) NUMBITS(1) [],
        IRET OFFSET(20) NUMBITS(1) [],
        SWINT OFFSET(21) NUMBITS(1) [],
        INVD OFFSET(22) NUMBITS(1) [],
        PAUSE OFFSET(23) NUMBITS(1) [],
        HLT OFFSET(24) NUMBITS(1) [],
        INVLPG OFFSET(25) NUMBITS(1) [],
        INVLPGA OFFSET(26) NUMBITS(1) [],
        IOIO_PROT OFFSET(27) NUMBITS(1) [],
        MSR_PROT OFFSET(28) NUMBITS(1) [],
        TASK_SWITCH OFFSET(29) NUMBITS(1) [],
        FERR_FREEZE OFFSET(30) NUMBITS(1) [],
        SHUTDOWN OFFSET(31) NUMBITS(1) [],
    ],

    pub InterceptVec4 [
        VMRUN OFFSET(0) NUMBITS(1) [],
        VMMCALL OFFSET(1) NUMBITS(1) [],
        VMLOAD OFFSET(2) NUMBITS(1) [],
        VMSAVE OFFSET(3) NUMBITS(1) [],
        STGI OFFSET(4) NUMBITS(1) [],
        CLGI OFFSET(5) NUMBITS(1) [],
        SKINIT OFFSET(6) NUMBITS(1) [],
        RDTSCP OFFSET(7) NUMBITS(1) [],
        ICEBP OFFSET(8) NUMBITS(1) [],
        WBINVD OFFSET(9) NUMBITS(1) [],
        MONITOR OFFSET(10) NUMBITS(1) [],
        MWAIT OFFSET(11) NUMBITS(1) [],
        MWAIT_CONDITIONAL OFFSET(12) NUMBITS(1) [],
        XSETBV OFFSET(13) NUMBITS(1) [],
        RDPRU OFFSET(14) NUMBITS(1) [],
        EFER_WRITE_TRAP OFFSET(15) NUMBITS(1) [],
    ],
];

register_bitfields![u64,
    pub NestedCtl [
        NP_ENABLE OFFSET(0) NUMBITS(1) [],
        SEV_ENABLE OFFSET(1) NUMBITS(1) [],
        SEV_ES_ENABLE OFFSET(2) NUMBITS(1) [],
    ],
];

/// `tlb_control` values (APM 15.16.2).
pub const TLB_CONTROL_DO_NOTHING: u8 = 0;
pub const TLB_CONTROL_FLUSH_ALL: u8 = 1;
pub const TLB_CONTROL_FLUSH_ASID: u8 = 3;
pub const TLB_CONTROL_FLUSH_ASID_LOCAL: u8 = 7;

/// `int_control` bits.
pub const V_TPR_MASK: u32 = 0x0f;
pub const V_INTR_MASKING_MASK: u32 = 1 << 24;

bitflags! {
    /// VMCB segments touched by software since the last hardware
    /// consumption. Bit positions match the hardware clean-bits encoding,
    /// so the clean word handed to `VMRUN` is the complement over
    /// [`VmcbDirty::all`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmcbDirty: u32 {
        /// Intercept vectors, TSC offset, pause filter.
        const INTERCEPTS = 1 << 0;
        /// IOPM and MSRPM base addresses.
        const PERM_MAP = 1 << 1;
        const ASID = 1 << 2;
        /// int_control, int_vector.
        const INTR = 1 << 3;
        /// Nested-paging enable, nested CR3, guest PAT.
        const NPT = 1 << 4;
        /// CR0, CR3, CR4, EFER.
        const CR = 1 << 5;
        /// DR6, DR7.
        const DR = 1 << 6;
        /// GDTR, IDTR.
        const DT = 1 << 7;
        /// Segment registers and CPL.
        const SEG = 1 << 8;
        const CR2 = 1 << 9;
        /// DBGCTL and last-branch records.
        const LBR = 1 << 10;
        /// AVIC backing page and table pointers.
        const AVIC = 1 << 11;
    }
}

impl VmcbDirty {
    /// TPR and CR2 are written unconditionally before every VMRUN.
    pub const ALWAYS_DIRTY: Self = Self::INTR.union(Self::CR2);
}

/// Clean-bits word claiming every segment is unchanged.
pub const VMCB_CLEAN_ALL: u32 = VmcbDirty::all().bits();

register_structs![
    pub VmcbControlArea {
        (0x0000 => pub intercept_cr:          ReadWrite<u32>),
        (0x0004 => pub intercept_dr:          ReadWrite<u32>),
        (0x0008 => pub intercept_exceptions:  ReadWrite<u32>),
        (0x000C => pub intercept_vector3:     ReadWrite<u32, InterceptVec3::Register>),
        (0x0010 => pub intercept_vector4:     ReadWrite<u32, InterceptVec4::Register>),
        (0x0014 => pub intercept_vector5:     ReadWrite<u32>),
        (0x0018 => _reserved_0018),
        (0x003C => pub pause_filter_thresh:   ReadWrite<u16>),
        (0x003E => pub pause_filter_count:    ReadWrite<u16>),
        (0x0040 => pub iopm_base_pa:          ReadWrite<u64>),
        (0x0048 => pub msrpm_base_pa:         ReadWrite<u64>),
        (0x0050 => pub tsc_offset:            ReadWrite<u64>),
        (0x0058 => pub guest_asid:            ReadWrite<u32>),
        (0x005C => pub tlb_control:           ReadWrite<u8>),
        (0x005D => _reserved_005D),
        (0x0060 => pub int_control:           ReadWrite<u32>),
        (0x0064 => pub int_vector:            ReadWrite<u32>),
        (0x0068 => pub int_state:             ReadWrite<u32>),
        (0x006C => _reserved_006C),
        (0x0070 => pub exit_code:             ReadWrite<u64>),
        (0x0078 => pub exit_info_1:           ReadWrite<u64>),
        (0x0080 => pub exit_info_2:           ReadWrite<u64>),
        (0x0088 => pub exit_int_info:         ReadWrite<u32>),
        (0x008C => pub exit_int_info_err:     ReadWrite<u32>),
        (0x0090 => pub nested_ctl:            ReadWrite<u64, NestedCtl::Register>),
        (0x0098 => pub avic_vapic_bar:        ReadWrite<u64>),
        (0x00A0 => _reserved_00A0),
        (0x00A8 => pub event_inj:             ReadWrite<u32>),
        (0x00AC => pub event_inj_err:         ReadWrite<u32>),
        (0x00B0 => pub nested_cr3:            ReadWrite<u64>),
        (0x00B8 => pub virt_ext:              ReadWrite<u64>),
        (0x00C0 => pub clean_bits:            ReadWrite<u32>),
        (0x00C4 => _reserved_00C4),
        (0x00C8 => pub next_rip:              ReadWrite<u64>),
        (0x00D0 => pub insn_len:              ReadWrite<u8>),
        (0x00D1 => pub insn_bytes:            [ReadWrite<u8>; 15]),
        (0x00E0 => pub avic_backing_page:     ReadWrite<u64>),
        (0x00E8 => _reserved_00E8),
        (0x00F0 => pub avic_logical_id:       ReadWrite<u64>),
        (0x00F8 => pub avic_physical_id:      ReadWrite<u64>),
        (0x0100 => _reserved_0100),
        (0x0400 => @END),
    }
];

register_structs![
    pub VmcbSegment {
        (0x0 => pub selector: ReadWrite<u16>),
        (0x2 => pub attr:     ReadWrite<u16>),
        (0x4 => pub limit:    ReadWrite<u32>),
        (0x8 => pub base:     ReadWrite<u64>),
        (0x10 => @END),
    }
];

register_structs![
    pub VmcbStateSaveArea {
        (0x0000 => pub es:   VmcbSegment),
        (0x0010 => pub cs:   VmcbSegment),
        (0x0020 => pub ss:   VmcbSegment),
        (0x0030 => pub ds:   VmcbSegment),
        (0x0040 => pub fs:   VmcbSegment),
        (0x0050 => pub gs:   VmcbSegment),
        (0x0060 => pub gdtr: VmcbSegment),
        (0x0070 => pub ldtr: VmcbSegment),
        (0x0080 => pub idtr: VmcbSegment),
        (0x0090 => pub tr:   VmcbSegment),
        (0x00A0 => _reserved_00A0),
        (0x00CB => pub cpl:  ReadWrite<u8>),
        (0x00CC => _reserved_00CC),
        (0x00D0 => pub efer: ReadWrite<u64>),
        (0x00D8 => _reserved_00D8),
        (0x0148 => pub cr4:    ReadWrite<u64>),
        (0x0150 => pub cr3:    ReadWrite<u64>),
        (0x0158 => pub cr0:    ReadWrite<u64>),
        (0x0160 => pub dr7:    ReadWrite<u64>),
        (0x0168 => pub dr6:    ReadWrite<u64>),
        (0x0170 => pub rflags: ReadWrite<u64>),
        (0x0178 => pub rip:    ReadWrite<u64>),
        (0x0180 => _reserved_0180),
        (0x01D8 => pub rsp:    ReadWrite<u64>),
        (0x01E0 => _reserved_01E0),
        (0x01F8 => pub rax:    ReadWrite<u64>),
        (0x0200 => pub star:           ReadWrite<u64>),
        (0x0208 => pub lstar:          ReadWrite<u64>),
        (0x0210 => pub cstar:          ReadWrite<u64>),
        (0x0218 => pub sfmask:         ReadWrite<u64>),
        (0x0220 => pub kernel_gs_base: ReadWrite<u64>),
        (0x0228 => pub sysenter_cs:    ReadWrite<u64>),
        (0x0230 => pub sysenter_esp:   ReadWrite<u64>),
        (0x0238 => pub sysenter_eip:   ReadWrite<u64>),
        (0x0240 => pub cr2:            ReadWrite<u64>),
        (0x0248 => _reserved_0248),
        (0x0268 => pub g_pat:          ReadWrite<u64>),
        (0x0270 => pub dbgctl:         ReadWrite<u64>),
        (0x0278 => pub br_from:        ReadWrite<u64>),
        (0x0280 => pub br_to:          ReadWrite<u64>),
        (0x0288 => pub last_excp_from: ReadWrite<u64>),
        (0x0290 => pub last_excp_to:   ReadWrite<u64>),
        (0x0298 => _reserved_0298),
        (0x0C00 => @END),
    }
];

register_structs![
    pub VmcbStruct {
        (0x0000 => pub control: VmcbControlArea),
        (0x0400 => pub state:   VmcbStateSaveArea),
        (0x1000 => @END),
    }
];

impl<H: VmmHal> VmcbFrame<H> {
    /// # Safety
    ///
    /// The backing page must be mapped, and the caller must not create
    /// aliasing mutable references.
    pub unsafe fn as_vmcb(&self) -> &mut VmcbStruct {
        unsafe { (self.as_mut_ptr() as *mut VmcbStruct).as_mut().unwrap() }
    }
}

/// Flat-segment initialization used while building the guest reset state.
pub fn set_vmcb_segment(seg: &VmcbSegment, selector: u16, attr: u16) {
    seg.selector.set(selector);
    seg.base.set(0);
    seg.limit.set(0xffff);
    seg.attr.set(attr);
}

impl VmcbControlArea {
    pub fn set_intercept(&self, intercept: SvmIntercept) {
        use SvmIntercept::*;
        match intercept {
            INTR => self.intercept_vector3.modify(InterceptVec3::INTR::SET),
            NMI => self.intercept_vector3.modify(InterceptVec3::NMI::SET),
            SMI => self.intercept_vector3.modify(InterceptVec3::SMI::SET),
            INIT => self.intercept_vector3.modify(InterceptVec3::INIT::SET),
            VINTR => self.intercept_vector3.modify(InterceptVec3::VINTR::SET),
            CPUID => self.intercept_vector3.modify(InterceptVec3::CPUID::SET),
            IRET => self.intercept_vector3.modify(InterceptVec3::IRET::SET),
            PAUSE => self.intercept_vector3.modify(InterceptVec3::PAUSE::SET),
            HLT => self.intercept_vector3.modify(InterceptVec3::HLT::SET),
            INVLPG => self.intercept_vector3.modify(InterceptVec3::INVLPG::SET),
            INVLPGA => self.intercept_vector3.modify(InterceptVec3::INVLPGA::SET),
            IOIO_PROT => self.intercept_vector3.modify(InterceptVec3::IOIO_PROT::SET),
            MSR_PROT => self.intercept_vector3.modify(InterceptVec3::MSR_PROT::SET),
            TASK_SWITCH => self
                .intercept_vector3
                .modify(InterceptVec3::TASK_SWITCH::SET),
            SHUTDOWN => self.intercept_vector3.modify(InterceptVec3::SHUTDOWN::SET),
            VMRUN => self.intercept_vector4.modify(InterceptVec4::VMRUN::SET),
            VMMCALL => self.intercept_vector4.modify(InterceptVec4::VMMCALL::SET),
            VMLOAD => self.intercept_vector4.modify(InterceptVec4::VMLOAD::SET),
            VMSAVE => self.intercept_vector4.modify(InterceptVec4::VMSAVE::SET),
            STGI => self.intercept_vector4.modify(InterceptVec4::STGI::SET),
            SKINIT => self.intercept_vector4.modify(InterceptVec4::SKINIT::SET),
            CLGI => self.intercept_vector4.modify(InterceptVec4::CLGI::SET),
        }
    }
}

/// Decoded #VMEXIT information handed back by the trampoline boundary.
#[derive(Debug)]
pub struct SvmExitInfo {
    pub exit_code: core::result::Result<SvmExitCode, u64>,
    pub exit_info_1: u64,
    pub exit_info_2: u64,
    pub guest_rip: u64,
    pub guest_next_rip: u64,
}

impl VmcbStruct {
    pub fn exit_info(&self) -> SvmExitInfo {
        SvmExitInfo {
            exit_code: self.control.exit_code.get().try_into(),
            exit_info_1: self.control.exit_info_1.get(),
            exit_info_2: self.control.exit_info_2.get(),
            guest_rip: self.state.rip.get(),
            guest_next_rip: self.control.next_rip.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmcb_size_check() {
        use core::mem::size_of;

        assert_eq!(size_of::<VmcbControlArea>(), 0x400);
        assert_eq!(size_of::<VmcbStateSaveArea>(), 0xC00);
        assert_eq!(size_of::<VmcbStruct>(), 0x1000);
    }

    #[test]
    fn vmcb_offset_check() {
        use memoffset::offset_of;

        assert_eq!(offset_of!(VmcbStruct, control), 0x0000);
        assert_eq!(offset_of!(VmcbStruct, state), 0x0400);

        macro_rules! assert_vmcb_ctrl_offset {
            ($field:ident, $offset:expr) => {
                assert_eq!(offset_of!(VmcbControlArea, $field), $offset);
            };
        }

        macro_rules! assert_vmcb_save_offset {
            ($field:ident, $offset:expr) => {
                assert_eq!(offset_of!(VmcbStateSaveArea, $field), $offset);
            };
        }

        assert_vmcb_ctrl_offset!(intercept_vector3, 0x0C);
        assert_vmcb_ctrl_offset!(intercept_vector4, 0x10);
        assert_vmcb_ctrl_offset!(iopm_base_pa, 0x40);
        assert_vmcb_ctrl_offset!(msrpm_base_pa, 0x48);
        assert_vmcb_ctrl_offset!(guest_asid, 0x58);
        assert_vmcb_ctrl_offset!(tlb_control, 0x5C);
        assert_vmcb_ctrl_offset!(int_control, 0x60);
        assert_vmcb_ctrl_offset!(exit_code, 0x70);
        assert_vmcb_ctrl_offset!(exit_info_1, 0x78);
        assert_vmcb_ctrl_offset!(exit_info_2, 0x80);
        assert_vmcb_ctrl_offset!(nested_ctl, 0x90);
        assert_vmcb_ctrl_offset!(event_inj, 0xA8);
        assert_vmcb_ctrl_offset!(nested_cr3, 0xB0);
        assert_vmcb_ctrl_offset!(clean_bits, 0xC0);
        assert_vmcb_ctrl_offset!(next_rip, 0xC8);
        assert_vmcb_ctrl_offset!(avic_backing_page, 0xE0);
        assert_vmcb_ctrl_offset!(avic_physical_id, 0xF8);

        assert_vmcb_save_offset!(cs, 0x10);
        assert_vmcb_save_offset!(tr, 0x90);
        assert_vmcb_save_offset!(cpl, 0xCB);
        assert_vmcb_save_offset!(efer, 0xD0);
        assert_vmcb_save_offset!(cr4, 0x148);
        assert_vmcb_save_offset!(cr3, 0x150);
        assert_vmcb_save_offset!(cr0, 0x158);
        assert_vmcb_save_offset!(rflags, 0x170);
        assert_vmcb_save_offset!(rip, 0x178);
        assert_vmcb_save_offset!(rsp, 0x1D8);
        assert_vmcb_save_offset!(rax, 0x1F8);
        assert_vmcb_save_offset!(cr2, 0x240);
        assert_vmcb_save_offset!(g_pat, 0x268);
        assert_vmcb_save_offset!(last_excp_to, 0x290);
    }

    #[test]
    fn clean_bits_encoding() {
        assert_eq!(VmcbDirty::ALWAYS_DIRTY.bits(), (1 << 3) | (1 << 9));
        assert_eq!(VMCB_CLEAN_ALL, 0xfff);
        let dirty = VmcbDirty::ASID | VmcbDirty::ALWAYS_DIRTY;
        let clean = VMCB_CLEAN_ALL & !dirty.bits();
        assert_eq!(clean & (1 << 2), 0);
        assert_ne!(clean & (1 << 5), 0);
    }
}
