//! VM aggregate: vCPU lifecycle, request broadcast, notifier windows and
//! teardown.

use alloc::sync::Arc;

use crate::addr::gfn_to_gpa;
use crate::mmu::PageFaultErrorCode;
use crate::slots::{MemSlotFlags, MemoryRegion};
use crate::svm::{CpuData, REQ_TLB_FLUSH, SvmVcpu};
use crate::test_utils::{GuestRam, mock::MockHal};
use crate::vm::{MAX_VCPU_ID, Vm, VmConfig};

fn new_vm() -> Arc<Vm<MockHal>> {
    Vm::new(VmConfig {
        nested_paging: true,
        n_max_mmu_pages: 64,
    })
}

fn new_cpu() -> CpuData<MockHal> {
    CpuData::new(0, 16).unwrap()
}

#[test]
fn online_never_exceeds_created() {
    let vm = new_vm();
    assert_eq!(vm.created_vcpus(), 0);
    assert_eq!(vm.online_vcpus(), 0);

    vm.create_vcpu(0).unwrap();
    vm.create_vcpu(1).unwrap();
    assert_eq!(vm.created_vcpus(), 2);
    assert!(vm.online_vcpus() <= vm.created_vcpus());
    assert_eq!(vm.online_vcpus(), 2);
}

#[test]
fn duplicate_vcpu_ids_are_rejected() {
    let vm = new_vm();
    vm.create_vcpu(5).unwrap();
    assert!(vm.create_vcpu(5).is_err());
    assert_eq!(vm.created_vcpus(), 1);
}

#[test]
fn vcpu_id_range_is_enforced() {
    let vm = new_vm();
    assert!(vm.create_vcpu(MAX_VCPU_ID + 1).is_err());
    vm.create_vcpu(MAX_VCPU_ID).unwrap();
}

#[test]
fn vcpu_slots_are_stable_once_published() {
    let vm = new_vm();
    let first = vm.create_vcpu(7).unwrap();
    let second = vm.create_vcpu(9).unwrap();
    assert!(Arc::ptr_eq(&vm.vcpu(first.idx()).unwrap(), &first));
    assert!(Arc::ptr_eq(&vm.vcpu(second.idx()).unwrap(), &second));
}

#[test]
fn request_broadcast_reaches_every_vcpu() {
    let vm = new_vm();
    let a = vm.create_vcpu(0).unwrap();
    let b = vm.create_vcpu(1).unwrap();

    let kicks = vm.make_all_vcpus_request(REQ_TLB_FLUSH);
    assert_eq!(kicks, 0);
    assert!(a.has_request(REQ_TLB_FLUSH));
    assert!(b.has_request(REQ_TLB_FLUSH));
}

#[test]
fn vcpus_in_guest_mode_need_a_kick() {
    let vm = new_vm();
    let a = vm.create_vcpu(0).unwrap();
    let b = vm.create_vcpu(1).unwrap();
    let mut cpu = new_cpu();

    a.prepare_entry(&mut cpu).unwrap();
    assert_eq!(vm.make_all_vcpus_request(REQ_TLB_FLUSH), 1);
    a.handle_exit().unwrap();

    assert!(b.has_request(REQ_TLB_FLUSH));
}

#[test]
fn notifier_window_blocks_guest_entry() {
    let vm = new_vm();
    let vcpu = vm.create_vcpu(0).unwrap();
    let mut cpu = new_cpu();

    vm.notifier_invalidate_range_start(0, 0);
    assert!(vm.prepare_vcpu_entry(&vcpu, &mut cpu).is_err());
    vm.notifier_invalidate_range_end();

    vm.prepare_vcpu_entry(&vcpu, &mut cpu).unwrap();
    vcpu.handle_exit().unwrap();
}

#[test]
fn notifier_races_are_detectable() {
    let vm = new_vm();

    let seq = vm.mmu_notifier_seq();
    assert!(!vm.mmu_notifier_retry(seq));

    vm.notifier_invalidate_range_start(0, 0);
    assert!(vm.mmu_notifier_retry(seq));
    vm.notifier_invalidate_range_end();

    // The sequence moved: a translation started before the window must
    // retry, one started after it need not.
    assert!(vm.mmu_notifier_retry(seq));
    assert!(!vm.mmu_notifier_retry(vm.mmu_notifier_seq()));
}

#[test]
fn notifier_invalidation_drops_cached_translations() {
    let vm = new_vm();
    let vcpu = vm.create_vcpu(0).unwrap();
    let ram = GuestRam::new(8);
    vm.set_memory_region(
        0,
        MemoryRegion {
            slot_id: 0,
            base_gfn: 0x100,
            npages: 8,
            userspace_addr: ram.hva(),
            flags: MemSlotFlags::empty(),
        },
    )
    .unwrap();

    let gpa = gfn_to_gpa(0x101).as_usize();
    vm.vcpu_page_fault(&vcpu, gpa, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap();

    vm.notifier_invalidate_range_start(0x100, 0x108);
    vm.notifier_invalidate_range_end();

    // The invalidation queued a flush and the frame faults back in.
    assert!(vcpu.has_request(REQ_TLB_FLUSH));
    vm.vcpu_page_fault(&vcpu, gpa, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap();
}

#[test]
fn destroy_requires_quiescence() {
    let vm = new_vm();
    let vcpu = vm.create_vcpu(0).unwrap();
    let mut cpu = new_cpu();

    vcpu.prepare_entry(&mut cpu).unwrap();
    assert!(vm.destroy().is_err());

    vcpu.handle_exit().unwrap();
    vm.destroy().unwrap();
    assert_eq!(vm.online_vcpus(), 0);
    assert_eq!(vm.n_used_mmu_pages(), 0);
}

#[test]
fn unpublished_vcpus_tear_down_without_quiescence() {
    // A vCPU that was created but never entered guest mode holds no
    // hardware state; dropping it needs no teardown protocol.
    let vcpu = SvmVcpu::<MockHal>::new(0, 0, true).unwrap();
    assert_eq!(vcpu.mode(), crate::svm::VcpuMode::OutsideGuestMode);
    drop(vcpu);
}
