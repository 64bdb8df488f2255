//! The virtual CPU: execution context, register cache, VMCB dirty
//! discipline and the run-state machine.
//!
//! A vCPU hands the entry/exit trampoline a fully flushed VMCB plus a
//! valid ASID ([`SvmVcpu::prepare_entry`]) and consumes the decoded
//! #VMEXIT on the way back ([`SvmVcpu::handle_exit`]). Everything between
//! those two points belongs to the hardware; everything outside them goes
//! through the software register cache.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use axerrno::{AxResult, ax_err, ax_err_type};
use bitflags::bitflags;
use spin::{Mutex, MutexGuard};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;

use super::definitions::SvmIntercept;
use super::percpu::CpuData;
use super::structs::{IOPm, MSRPm, VmcbFrame};
use super::vmcb::{
    NestedCtl, SvmExitInfo, TLB_CONTROL_DO_NOTHING, TLB_CONTROL_FLUSH_ALL,
    TLB_CONTROL_FLUSH_ASID, V_INTR_MASKING_MASK, V_TPR_MASK, VMCB_CLEAN_ALL, VmcbDirty,
    VmcbStruct, set_vmcb_segment,
};
use crate::addr::{GuestPhysAddr, HostPhysAddr};
use crate::hal::VmmHal;
use crate::mmu::walk::read_guest_u64;
use crate::mmu::{GuestWalkInfo, Mmu};
use crate::regs::{
    EXREG_CR3, EXREG_PDPTR, EXREG_RFLAGS, GeneralRegisters, GuestReg, RegisterCache,
};
use crate::slots::MemorySlots;

/// CR0 bits the guest owns while in guest mode: hardware updates them
/// without an intercept, so the cached copy must be re-read on every exit.
pub const CR0_GUEST_OWNED_BITS: u64 = Cr0Flags::TASK_SWITCHED
    .union(Cr0Flags::MONITOR_COPROCESSOR)
    .bits();

numeric_enum_macro::numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Run state of a vCPU. `ReadingShadowPageTables` is entered from
    /// outside-guest-mode by agents needing a consistent view of the
    /// shadow structures; it is mutually exclusive with guest entry.
    pub enum VcpuMode {
        OutsideGuestMode = 0,
        InGuestMode = 1,
        ExitingGuestMode = 2,
        ReadingShadowPageTables = 3,
    }
}

bitflags! {
    /// Hardware-flags word of a vCPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HFlags: u32 {
        /// Global interrupts enabled (STGI state).
        const GIF = 1 << 0;
        /// The vCPU is executing guest code.
        const GUEST = 1 << 5;
        /// System-management mode; selects the secondary slot address
        /// space.
        const SMM = 1 << 6;
    }
}

/// Low bits of a request encode the action; the high bits say whether the
/// requester blocks until acknowledgement and whether an idle vCPU should
/// be woken.
pub const REQUEST_MASK: u64 = 0xff;
pub const REQUEST_NO_WAKEUP: u64 = 1 << 8;
pub const REQUEST_WAIT: u64 = 1 << 9;

/// Flush this vCPU's TLB tag before the next guest entry.
pub const REQ_TLB_FLUSH: u64 = 0 | REQUEST_WAIT | REQUEST_NO_WAKEUP;

/// What the entry/exit trampoline receives for one `VMRUN`: a fully
/// flushed control block and a valid ASID.
#[derive(Debug, Clone, Copy)]
pub struct GuestEntry {
    pub vmcb_pa: HostPhysAddr,
    pub asid: u32,
}

/// A virtual CPU. The atomic mode and request words are shared with other
/// agents; the execution context behind the lock is owned exclusively by
/// the vCPU's host thread across guest-mode states.
#[derive(Debug)]
pub struct SvmVcpu<H: VmmHal> {
    idx: u32,
    vcpu_id: u32,
    mode: AtomicU32,
    requests: AtomicU64,
    arch: Mutex<VcpuArch<H>>,
}

impl<H: VmmHal> SvmVcpu<H> {
    pub fn new(idx: u32, vcpu_id: u32, nested: bool) -> AxResult<Self> {
        let arch = VcpuArch::new(nested)?;
        info!(
            "[SvmVm] created vcpu {} (vmcb: {:#x})",
            vcpu_id,
            arch.vmcb_pa()
        );
        Ok(Self {
            idx,
            vcpu_id,
            mode: AtomicU32::new(VcpuMode::OutsideGuestMode as u32),
            requests: AtomicU64::new(0),
            arch: Mutex::new(arch),
        })
    }

    /// Stable index of this vCPU in the VM's table.
    pub fn idx(&self) -> u32 {
        self.idx
    }

    pub fn vcpu_id(&self) -> u32 {
        self.vcpu_id
    }

    pub fn mode(&self) -> VcpuMode {
        VcpuMode::try_from(self.mode.load(Ordering::Acquire)).unwrap()
    }

    fn cas_mode(&self, from: VcpuMode, to: VcpuMode) -> bool {
        self.mode
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Locks the execution context. Callers must not hold the VM's mmu
    /// lock already; the locking order is vCPU arch first, mmu lock
    /// second.
    pub fn arch(&self) -> MutexGuard<'_, VcpuArch<H>> {
        self.arch.lock()
    }

    /// Posts an asynchronous request. Returns `true` if the vCPU is
    /// currently executing guest code and must be kicked out by the
    /// caller; waking an idle vCPU is skipped when the request carries
    /// [`REQUEST_NO_WAKEUP`].
    pub fn make_request(&self, req: u64) -> bool {
        let bit = 1u64 << (req & REQUEST_MASK);
        self.requests.fetch_or(bit, Ordering::AcqRel);
        self.mode() == VcpuMode::InGuestMode
    }

    pub fn has_request(&self, req: u64) -> bool {
        self.requests.load(Ordering::Acquire) & (1 << (req & REQUEST_MASK)) != 0
    }

    /// Consumes a pending request, returning whether it was set.
    pub fn check_request(&self, req: u64) -> bool {
        let bit = 1u64 << (req & REQUEST_MASK);
        self.requests.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub fn has_any_request(&self) -> bool {
        self.requests.load(Ordering::Acquire) != 0
    }

    /// Claims the vCPU for a consistent read of its shadow structures.
    /// Fails if the vCPU is anywhere but outside guest mode.
    pub fn begin_shadow_read(&self) -> AxResult {
        if self.cas_mode(
            VcpuMode::OutsideGuestMode,
            VcpuMode::ReadingShadowPageTables,
        ) {
            Ok(())
        } else {
            ax_err!(ResourceBusy, "vcpu is not outside guest mode")
        }
    }

    pub fn end_shadow_read(&self) {
        let released = self.cas_mode(
            VcpuMode::ReadingShadowPageTables,
            VcpuMode::OutsideGuestMode,
        );
        assert!(released, "end_shadow_read without a matching begin");
    }

    /// Readies the vCPU for hardware entry: revalidates the ASID
    /// generation against this core, applies pending TLB requests,
    /// flushes all dirty register and control-block state, and moves to
    /// `InGuestMode`.
    ///
    /// Fails if the vCPU is not outside guest mode (including an
    /// in-progress shadow-table read).
    pub fn prepare_entry(&self, cpu: &mut CpuData<H>) -> AxResult<GuestEntry> {
        if !self.cas_mode(VcpuMode::OutsideGuestMode, VcpuMode::InGuestMode) {
            return ax_err!(BadState, "vcpu is not outside guest mode");
        }

        let mut arch = self.arch.lock();
        arch.vmcb().control.tlb_control.set(TLB_CONTROL_DO_NOTHING);
        if self.check_request(REQ_TLB_FLUSH) {
            arch.vmcb().control.tlb_control.set(TLB_CONTROL_FLUSH_ASID);
        }
        arch.validate_asid(cpu);
        arch.flush_dirty_regs();
        arch.sync_always_dirty();
        arch.write_clean_bits();
        arch.hflags.insert(HFlags::GUEST);

        Ok(GuestEntry {
            vmcb_pa: arch.vmcb_pa(),
            asid: arch.asid(),
        })
    }

    /// Completes a #VMEXIT: reads back hardware state, re-reads the
    /// guest-owned control-register bits, drops the register cache, and
    /// returns the decoded exit for the emulator/trampoline.
    pub fn handle_exit(&self) -> AxResult<SvmExitInfo> {
        if !self.cas_mode(VcpuMode::InGuestMode, VcpuMode::ExitingGuestMode) {
            return ax_err!(BadState, "vcpu is not in guest mode");
        }
        let exit = self.arch.lock().sync_from_exit();
        let outside = self.cas_mode(VcpuMode::ExitingGuestMode, VcpuMode::OutsideGuestMode);
        debug_assert!(outside);
        Ok(exit)
    }
}

/// The lock-protected execution context of a vCPU.
#[derive(Debug)]
pub struct VcpuArch<H: VmmHal> {
    guest_regs: GeneralRegisters,
    cache: RegisterCache,
    pdptrs: [u64; 4],
    cr0: u64,
    cr0_guest_owned_bits: u64,
    cr2: u64,
    cr3: u64,
    cr4: u64,
    cr4_guest_owned_bits: u64,
    cr8: u64,
    rflags: u64,
    hflags: HFlags,
    efer: u64,
    vmcb: VmcbFrame<H>,
    vmcb_pa: HostPhysAddr,
    dirty: VmcbDirty,
    iopm: IOPm<H>,
    msrpm: MSRPm<H>,
    launched: bool,
    asid: u32,
    asid_generation: u64,
    mmu: Mmu,
}

impl<H: VmmHal> VcpuArch<H> {
    fn new(nested: bool) -> AxResult<Self> {
        let vmcb = VmcbFrame::new()?;
        let vmcb_pa = vmcb.phys_addr();
        Ok(Self {
            guest_regs: GeneralRegisters::default(),
            cache: RegisterCache::new(),
            pdptrs: [0; 4],
            cr0: 0,
            cr0_guest_owned_bits: CR0_GUEST_OWNED_BITS,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            cr4_guest_owned_bits: 0,
            cr8: 0,
            rflags: 0,
            hflags: HFlags::GIF,
            efer: 0,
            vmcb,
            vmcb_pa,
            dirty: VmcbDirty::empty(),
            iopm: IOPm::passthrough_all()?,
            msrpm: MSRPm::passthrough_all()?,
            launched: false,
            asid: 0,
            asid_generation: 0,
            mmu: Mmu::new(nested),
        })
    }

    fn vmcb(&self) -> &VmcbStruct {
        unsafe { self.vmcb.as_vmcb() }
    }

    pub fn vmcb_pa(&self) -> HostPhysAddr {
        self.vmcb_pa
    }

    pub fn asid(&self) -> u32 {
        self.asid
    }

    pub fn asid_generation(&self) -> u64 {
        self.asid_generation
    }

    pub fn hflags(&self) -> HFlags {
        self.hflags
    }

    pub fn set_smm(&mut self, smm: bool) {
        self.hflags.set(HFlags::SMM, smm);
    }

    /// Slot address space this vCPU currently translates through.
    pub fn address_space_id(&self) -> usize {
        self.hflags.contains(HFlags::SMM) as usize
    }

    pub fn mmu(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    pub fn mmu_ref(&self) -> &Mmu {
        &self.mmu
    }

    /// Marks a control-block segment as modified. Every mutating accessor
    /// calls this at the mutation point; batching the marks would let an
    /// entry skip a segment the hardware still considers clean.
    fn mark_dirty(&mut self, segment: VmcbDirty) {
        self.dirty |= segment;
    }

    /// Builds the guest reset state and intercept configuration.
    pub fn setup(&mut self, entry: GuestPhysAddr) -> AxResult {
        let cr0 =
            Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE | Cr0Flags::EXTENSION_TYPE;
        self.set_cr0(cr0.bits());
        self.set_cr4(0);

        set_vmcb_segment(&self.vmcb().state.cs, 0, 0x9b);
        set_vmcb_segment(&self.vmcb().state.ds, 0, 0x93);
        set_vmcb_segment(&self.vmcb().state.es, 0, 0x93);
        set_vmcb_segment(&self.vmcb().state.fs, 0, 0x93);
        set_vmcb_segment(&self.vmcb().state.gs, 0, 0x93);
        set_vmcb_segment(&self.vmcb().state.ss, 0, 0x93);
        set_vmcb_segment(&self.vmcb().state.ldtr, 0, 0x82);
        set_vmcb_segment(&self.vmcb().state.tr, 0, 0x8b);
        self.mark_dirty(VmcbDirty::SEG);

        self.vmcb().state.gdtr.base.set(0);
        self.vmcb().state.gdtr.limit.set(0xffff);
        self.vmcb().state.idtr.base.set(0);
        self.vmcb().state.idtr.limit.set(0xffff);
        self.mark_dirty(VmcbDirty::DT);

        self.vmcb().state.dr6.set(0xffff_0ff0);
        self.vmcb().state.dr7.set(0x400);
        self.mark_dirty(VmcbDirty::DR);

        // PAT reset value; the guest reprograms it as it likes.
        self.vmcb().state.g_pat.set(0x0007_0406_0007_0406);

        self.set_efer(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE.bits());
        self.set_rflags(0x2);
        self.register_write(GuestReg::Rsp, 0);
        self.register_write(GuestReg::Rip, entry.as_usize() as u64);

        for intercept in [
            SvmIntercept::INTR,
            SvmIntercept::NMI,
            SvmIntercept::CPUID,
            SvmIntercept::HLT,
            SvmIntercept::IOIO_PROT,
            SvmIntercept::MSR_PROT,
            SvmIntercept::SHUTDOWN,
            SvmIntercept::VMRUN,
            SvmIntercept::VMMCALL,
            SvmIntercept::VMLOAD,
            SvmIntercept::VMSAVE,
            SvmIntercept::STGI,
            SvmIntercept::CLGI,
            SvmIntercept::SKINIT,
        ] {
            self.vmcb().control.set_intercept(intercept);
        }
        self.mark_dirty(VmcbDirty::INTERCEPTS);

        let iopm_pa = self.iopm.phys_addr().as_usize() as u64;
        let msrpm_pa = self.msrpm.phys_addr().as_usize() as u64;
        self.vmcb().control.iopm_base_pa.set(iopm_pa);
        self.vmcb().control.msrpm_base_pa.set(msrpm_pa);
        self.mark_dirty(VmcbDirty::PERM_MAP);

        self.vmcb().control.int_control.set(V_INTR_MASKING_MASK);
        self.mark_dirty(VmcbDirty::INTR);

        if self.mmu.is_nested() {
            self.vmcb().control.nested_ctl.modify(NestedCtl::NP_ENABLE::SET);
            self.mark_dirty(VmcbDirty::NPT);
        }

        // Nothing is tagged in the TLB yet.
        self.vmcb().control.tlb_control.set(TLB_CONTROL_FLUSH_ALL);
        Ok(())
    }

    /// Points the hardware at the nested-paging root produced by the MMU.
    pub fn set_nested_root(&mut self, root: HostPhysAddr) {
        debug_assert!(self.mmu.is_nested());
        self.vmcb().control.nested_cr3.set(root.as_usize() as u64);
        self.mark_dirty(VmcbDirty::NPT);
    }

    // ------------------------------------------------------------------
    // Register cache discipline
    // ------------------------------------------------------------------

    /// Reads a guest register, pulling the true value from the control
    /// block or the trampoline-saved block on first access.
    pub fn register_read(&mut self, reg: GuestReg) -> u64 {
        if !self.cache.is_avail(reg) {
            let value = match reg {
                GuestReg::Rax => self.vmcb().state.rax.get(),
                GuestReg::Rsp => self.vmcb().state.rsp.get(),
                GuestReg::Rip => self.vmcb().state.rip.get(),
                _ => self.guest_regs.get_reg_of_index(reg as u8),
            };
            self.cache.fill(reg, value);
        }
        self.cache.read(reg)
    }

    /// Caches a guest register write; it reaches hardware state at the
    /// next flush.
    pub fn register_write(&mut self, reg: GuestReg, value: u64) {
        self.cache.write(reg, value);
    }

    /// Pushes every dirty register to the state the hardware consumes and
    /// retires the cached values.
    pub fn flush_dirty_regs(&mut self) {
        let vmcb = unsafe { self.vmcb.as_vmcb() };
        let guest_regs = &mut self.guest_regs;
        self.cache.flush_dirty(|reg, value| match reg {
            GuestReg::Rax => vmcb.state.rax.set(value),
            GuestReg::Rsp => vmcb.state.rsp.set(value),
            GuestReg::Rip => vmcb.state.rip.set(value),
            _ => guest_regs.set_reg_of_index(reg as u8, value),
        });
    }

    pub fn rflags(&mut self) -> u64 {
        if !self.cache.is_ex_avail(EXREG_RFLAGS) {
            self.rflags = self.vmcb().state.rflags.get();
            self.cache.set_ex_avail(EXREG_RFLAGS, true);
        }
        self.rflags
    }

    pub fn set_rflags(&mut self, value: u64) {
        self.rflags = value;
        self.vmcb().state.rflags.set(value);
        self.cache.set_ex_avail(EXREG_RFLAGS, true);
    }

    pub fn cr3(&mut self) -> u64 {
        if !self.cache.is_ex_avail(EXREG_CR3) {
            self.cr3 = self.vmcb().state.cr3.get();
            self.cache.set_ex_avail(EXREG_CR3, true);
        }
        self.cr3
    }

    pub fn set_cr3(&mut self, value: u64) {
        self.cr3 = value;
        self.vmcb().state.cr3.set(value);
        self.cache.set_ex_avail(EXREG_CR3, true);
        self.mark_dirty(VmcbDirty::CR);
    }

    /// The four PAE page-directory pointers, loaded from guest memory on
    /// first use.
    pub fn load_pdptrs(&mut self, slots: &MemorySlots) -> AxResult<[u64; 4]> {
        if !self.cache.is_ex_avail(EXREG_PDPTR) {
            let base = (self.cr3() & 0xffff_ffe0) as usize;
            for (i, pdptr) in self.pdptrs.iter_mut().enumerate() {
                *pdptr = read_guest_u64(slots, GuestPhysAddr::from_usize(base + i * 8))
                    .ok_or_else(|| {
                        ax_err_type!(BadAddress, "guest PDPT outside memory slots")
                    })?;
            }
            self.cache.set_ex_avail(EXREG_PDPTR, true);
        }
        Ok(self.pdptrs)
    }

    pub fn cr0(&self) -> u64 {
        self.cr0
    }

    pub fn set_cr0(&mut self, value: u64) {
        self.cr0 = value;
        self.vmcb().state.cr0.set(value);
        self.mark_dirty(VmcbDirty::CR);
        self.mmu
            .update_permissions(value & Cr0Flags::WRITE_PROTECT.bits() != 0);
    }

    pub fn cr2(&self) -> u64 {
        self.cr2
    }

    pub fn set_cr2(&mut self, value: u64) {
        self.cr2 = value;
        self.mark_dirty(VmcbDirty::CR2);
    }

    pub fn cr4(&self) -> u64 {
        self.cr4
    }

    pub fn set_cr4(&mut self, value: u64) {
        self.cr4 = value;
        self.vmcb().state.cr4.set(value);
        self.mark_dirty(VmcbDirty::CR);
    }

    pub fn cr8(&self) -> u64 {
        self.cr8
    }

    /// CR8 is virtualized through the TPR field of `int_control`.
    pub fn set_cr8(&mut self, value: u64) {
        self.cr8 = value;
        let int_control = self.vmcb().control.int_control.get();
        self.vmcb()
            .control
            .int_control
            .set((int_control & !V_TPR_MASK) | (value as u32 & V_TPR_MASK));
        self.mark_dirty(VmcbDirty::INTR);
    }

    pub fn efer(&self) -> u64 {
        self.efer
    }

    pub fn set_efer(&mut self, value: u64) {
        self.efer = value;
        self.vmcb().state.efer.set(value);
        self.mark_dirty(VmcbDirty::CR);
    }

    /// Guest paging state for the software page-table walk.
    pub fn walk_info(&mut self) -> GuestWalkInfo {
        let level = if self.efer & EferFlags::LONG_MODE_ACTIVE.bits() != 0 {
            4
        } else if self.cr4 & Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits() != 0 {
            3
        } else {
            2
        };
        GuestWalkInfo {
            cr3: self.cr3(),
            level,
            nxe: self.efer & EferFlags::NO_EXECUTE_ENABLE.bits() != 0,
            wp: self.cr0 & Cr0Flags::WRITE_PROTECT.bits() != 0,
        }
    }

    // ------------------------------------------------------------------
    // I/O and MSR permission maps
    // ------------------------------------------------------------------

    pub fn set_io_intercept_of_range(&mut self, port_base: u32, count: u32, intercept: bool) {
        self.iopm.set_intercept_of_range(port_base, count, intercept);
        self.mark_dirty(VmcbDirty::PERM_MAP);
    }

    pub fn set_msr_intercept(&mut self, msr: u32, is_write: bool, intercept: bool) {
        self.msrpm.set_intercept(msr, is_write, intercept);
        self.mark_dirty(VmcbDirty::PERM_MAP);
    }

    // ------------------------------------------------------------------
    // Entry/exit plumbing
    // ------------------------------------------------------------------

    /// Assigns a fresh ASID if this vCPU's cached generation no longer
    /// matches the core's, marking the control block for a TLB flush as
    /// the hardware requires.
    fn validate_asid(&mut self, cpu: &mut CpuData<H>) {
        if self.asid_generation == cpu.generation() {
            return;
        }
        let assignment = cpu.new_asid();
        self.asid = assignment.asid;
        self.asid_generation = assignment.generation;
        self.vmcb().control.guest_asid.set(assignment.asid);
        self.vmcb().control.tlb_control.set(TLB_CONTROL_FLUSH_ASID);
        self.mark_dirty(VmcbDirty::ASID);
    }

    /// TPR and CR2 are pushed unconditionally before every entry.
    fn sync_always_dirty(&mut self) {
        self.vmcb().state.cr2.set(self.cr2);
        self.mark_dirty(VmcbDirty::ALWAYS_DIRTY);
    }

    /// Clean-bits word as the hardware will see it. Diagnostic surface;
    /// the word is only meaningful between a prepare and the `VMRUN`.
    pub fn vmcb_clean_bits(&self) -> u32 {
        self.vmcb().control.clean_bits.get()
    }

    /// Derives the hardware clean-bits word from the dirty mask and
    /// resets the mask. The first entry claims nothing clean.
    fn write_clean_bits(&mut self) {
        let clean = if self.launched {
            VMCB_CLEAN_ALL & !self.dirty.bits()
        } else {
            0
        };
        self.vmcb().control.clean_bits.set(clean);
        self.dirty = VmcbDirty::empty();
    }

    /// After #VMEXIT the control block is the source of truth: drop the
    /// register cache, clear the dirty mask, and re-read the guest-owned
    /// control-register bits hardware may have changed.
    fn sync_from_exit(&mut self) -> SvmExitInfo {
        let exit = self.vmcb().exit_info();

        self.cache.invalidate();
        self.dirty = VmcbDirty::empty();

        let hw_cr0 = self.vmcb().state.cr0.get();
        self.cr0 = (self.cr0 & !self.cr0_guest_owned_bits) | (hw_cr0 & self.cr0_guest_owned_bits);
        let hw_cr4 = self.vmcb().state.cr4.get();
        self.cr4 = (self.cr4 & !self.cr4_guest_owned_bits) | (hw_cr4 & self.cr4_guest_owned_bits);
        self.cr2 = self.vmcb().state.cr2.get();
        self.cr8 = (self.vmcb().control.int_control.get() & V_TPR_MASK) as u64;
        self.efer = self.vmcb().state.efer.get();

        self.hflags.remove(HFlags::GUEST);
        self.launched = true;
        exit
    }
}
