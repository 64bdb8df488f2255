//! Translation layer: resolve, invalidate, reclaim, large pages and the
//! guest page-table walk.

use alloc::sync::Arc;

use crate::addr::{GuestPhysAddr, gfn_to_gpa};
use crate::mmu::{
    ACC_ALL, ACC_EXEC, ACC_USER, ACC_WRITE, GuestWalkInfo, Mmu, MmuPages, PageFaultErrorCode,
};
use crate::slots::{MemSlotFlags, MemorySlot, MemorySlots, MemoryRegion};
use crate::svm::SvmVcpu;
use crate::test_utils::{GuestRam, mock::MockHal};
use crate::vm::{Vm, VmConfig};

const BASE_GFN: usize = 0x1000;

fn vm_with_ram(
    npages: usize,
    flags: MemSlotFlags,
) -> (Arc<Vm<MockHal>>, Arc<SvmVcpu<MockHal>>, GuestRam) {
    let vm = Vm::new(VmConfig {
        nested_paging: true,
        n_max_mmu_pages: 64,
    });
    let vcpu = vm.create_vcpu(0).unwrap();
    let ram = GuestRam::new(npages);
    vm.set_memory_region(
        0,
        MemoryRegion {
            slot_id: 0,
            base_gfn: BASE_GFN,
            npages,
            userspace_addr: ram.hva(),
            flags,
        },
    )
    .unwrap();
    (vm, vcpu, ram)
}

#[test]
fn install_then_resolve_round_trip() {
    let (vm, vcpu, ram) = vm_with_ram(16, MemSlotFlags::empty());

    let gpa = gfn_to_gpa(BASE_GFN + 5).as_usize() + 0x123;
    let resolved = vm
        .vcpu_page_fault(&vcpu, gpa, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap();
    assert_eq!(resolved.as_usize(), ram.hva().as_usize() + 5 * 0x1000 + 0x123);

    let again = vm
        .vcpu_page_fault(&vcpu, gpa, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap();
    assert_eq!(resolved, again);
}

#[test]
fn access_outside_every_slot_is_surfaced() {
    let (vm, vcpu, _ram) = vm_with_ram(16, MemSlotFlags::empty());

    let gpa = gfn_to_gpa(0x9_0000).as_usize();
    let fault = vm
        .vcpu_page_fault(&vcpu, gpa, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap_err();
    assert_eq!(fault.addr, gpa);
    assert!(fault.error_code.contains(PageFaultErrorCode::GUEST_FINAL));
}

#[test]
fn deleted_slot_does_not_serve_stale_translations() {
    // A slot covering [0x1000, 0x1100) with a cached translation for
    // 0x1050: after deletion, resolution must report not-found.
    let (vm, vcpu, _ram) = vm_with_ram(0x100, MemSlotFlags::empty());

    let gpa = gfn_to_gpa(0x1050).as_usize();
    assert!(
        vm.vcpu_page_fault(&vcpu, gpa, PageFaultErrorCode::WRITE)
            .unwrap()
            .is_ok()
    );

    vm.set_memory_region(
        0,
        MemoryRegion {
            slot_id: 0,
            base_gfn: BASE_GFN,
            npages: 0,
            userspace_addr: crate::addr::HostVirtAddr::from(0),
            flags: MemSlotFlags::empty(),
        },
    )
    .unwrap();

    let fault = vm
        .vcpu_page_fault(&vcpu, gpa, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap_err();
    assert!(fault.error_code.contains(PageFaultErrorCode::GUEST_FINAL));
}

#[test]
fn invalidate_is_idempotent() {
    let mut pages = MmuPages::<MockHal>::new(64);
    let mut slots = MemorySlots::new();
    let ram = GuestRam::new(8);
    slots.insert(MemorySlot::new(
        0,
        BASE_GFN,
        8,
        ram.hva(),
        MemSlotFlags::empty(),
    ));

    let mut mmu = Mmu::new(true);
    let info = GuestWalkInfo {
        cr3: 0,
        level: 4,
        nxe: false,
        wp: true,
    };
    let gpa = gfn_to_gpa(BASE_GFN + 2).as_usize();

    let first = mmu
        .page_fault(&mut pages, &slots, &info, gpa, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap();

    mmu.invalidate_page(&mut pages, &slots, GuestPhysAddr::from(gpa));
    mmu.invalidate_page(&mut pages, &slots, GuestPhysAddr::from(gpa));

    let again = mmu
        .page_fault(&mut pages, &slots, &info, gpa, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap();
    assert_eq!(first, again);
}

#[test]
fn release_tears_down_every_node() {
    let mut pages = MmuPages::<MockHal>::new(64);
    let mut slots = MemorySlots::new();
    let ram = GuestRam::new(8);
    slots.insert(MemorySlot::new(
        0,
        BASE_GFN,
        8,
        ram.hva(),
        MemSlotFlags::empty(),
    ));

    let mut mmu = Mmu::new(true);
    let info = GuestWalkInfo {
        cr3: 0,
        level: 4,
        nxe: false,
        wp: true,
    };
    mmu.page_fault(
        &mut pages,
        &slots,
        &info,
        gfn_to_gpa(BASE_GFN).as_usize(),
        PageFaultErrorCode::WRITE,
    )
    .unwrap()
    .unwrap();
    assert!(pages.n_used_mmu_pages() > 0);

    mmu.release(&mut pages, &slots);
    assert_eq!(pages.n_used_mmu_pages(), 0);

    // A fresh fault rebuilds the tree from a new root.
    mmu.page_fault(
        &mut pages,
        &slots,
        &info,
        gfn_to_gpa(BASE_GFN).as_usize(),
        PageFaultErrorCode::WRITE,
    )
    .unwrap()
    .unwrap();
}

#[test]
fn node_cap_reclaims_least_recently_used() {
    let vm = Vm::<MockHal>::new(VmConfig {
        nested_paging: true,
        n_max_mmu_pages: 4,
    });
    let vcpu = vm.create_vcpu(0).unwrap();
    let ram_a = GuestRam::new(8);
    let ram_b = GuestRam::new(8);
    vm.set_memory_region(
        0,
        MemoryRegion {
            slot_id: 0,
            base_gfn: 0x1000,
            npages: 8,
            userspace_addr: ram_a.hva(),
            flags: MemSlotFlags::empty(),
        },
    )
    .unwrap();
    vm.set_memory_region(
        0,
        MemoryRegion {
            slot_id: 1,
            base_gfn: 0x8000,
            npages: 8,
            userspace_addr: ram_b.hva(),
            flags: MemSlotFlags::empty(),
        },
    )
    .unwrap();

    let gpa_a = gfn_to_gpa(0x1001).as_usize();
    let gpa_b = gfn_to_gpa(0x8001).as_usize();

    assert!(
        vm.vcpu_page_fault(&vcpu, gpa_a, PageFaultErrorCode::WRITE)
            .unwrap()
            .is_ok()
    );
    assert_eq!(vm.n_used_mmu_pages(), 4);

    // The second region needs a new leaf table; the first one's is the
    // least recently used and gets zapped.
    assert!(
        vm.vcpu_page_fault(&vcpu, gpa_b, PageFaultErrorCode::WRITE)
            .unwrap()
            .is_ok()
    );
    assert!(vm.n_used_mmu_pages() <= 4);

    // And the first region can still be faulted back in.
    assert!(
        vm.vcpu_page_fault(&vcpu, gpa_a, PageFaultErrorCode::WRITE)
            .unwrap()
            .is_ok()
    );
    assert!(vm.n_used_mmu_pages() <= 4);
}

#[test]
fn node_cap_exhaustion_is_fatal_when_nothing_reclaims() {
    let vm = Vm::<MockHal>::new(VmConfig {
        nested_paging: true,
        n_max_mmu_pages: 2,
    });
    let vcpu = vm.create_vcpu(0).unwrap();
    let ram = GuestRam::new(8);
    vm.set_memory_region(
        0,
        MemoryRegion {
            slot_id: 0,
            base_gfn: BASE_GFN,
            npages: 8,
            userspace_addr: ram.hva(),
            flags: MemSlotFlags::empty(),
        },
    )
    .unwrap();

    // Every node of the walk path is pinned, so nothing can be reclaimed.
    assert!(
        vm.vcpu_page_fault(
            &vcpu,
            gfn_to_gpa(BASE_GFN).as_usize(),
            PageFaultErrorCode::WRITE
        )
        .is_err()
    );
}

#[test]
fn write_tracked_frames_fault_to_the_emulator() {
    let (vm, vcpu, _ram) = vm_with_ram(16, MemSlotFlags::empty());
    let gfn = BASE_GFN + 3;
    let gpa = gfn_to_gpa(gfn).as_usize();

    vm.track_write(0, gfn).unwrap();

    let fault = vm
        .vcpu_page_fault(&vcpu, gpa, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap_err();
    assert!(fault.error_code.contains(PageFaultErrorCode::PRESENT));

    // Reads still map, read-only.
    assert!(
        vm.vcpu_page_fault(&vcpu, gpa, PageFaultErrorCode::empty())
            .unwrap()
            .is_ok()
    );

    vm.untrack_write(0, gfn).unwrap();
    assert!(
        vm.vcpu_page_fault(&vcpu, gpa, PageFaultErrorCode::WRITE)
            .unwrap()
            .is_ok()
    );
}

#[test]
fn dirty_logging_observes_every_write() {
    let (vm, vcpu, _ram) = vm_with_ram(16, MemSlotFlags::LOG_DIRTY_PAGES);
    let gpa = gfn_to_gpa(BASE_GFN + 1).as_usize();

    vm.vcpu_page_fault(&vcpu, gpa, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap();

    let log = vm.get_dirty_log(0, 0).unwrap();
    assert_eq!(log[0], 1 << 1);

    // The harvest cleared the log and write-protected the page.
    let empty = vm.get_dirty_log(0, 0).unwrap();
    assert_eq!(empty[0], 0);

    vm.vcpu_page_fault(&vcpu, gpa, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap();
    assert_eq!(vm.get_dirty_log(0, 0).unwrap()[0], 1 << 1);
}

#[test]
fn aligned_regions_map_large_pages() {
    let vm = Vm::<MockHal>::new(VmConfig {
        nested_paging: true,
        n_max_mmu_pages: 64,
    });
    let vcpu = vm.create_vcpu(0).unwrap();
    let ram = GuestRam::new(1024);
    vm.set_memory_region(
        0,
        MemoryRegion {
            slot_id: 0,
            base_gfn: 0x200,
            npages: 1024,
            userspace_addr: ram.hva(),
            flags: MemSlotFlags::empty(),
        },
    )
    .unwrap();

    let resolved = vm
        .vcpu_page_fault(
            &vcpu,
            gfn_to_gpa(0x207).as_usize(),
            PageFaultErrorCode::WRITE,
        )
        .unwrap()
        .unwrap();
    assert_eq!(resolved.as_usize(), ram.hva().as_usize() + 7 * 0x1000);

    // One node per level above the 2 MiB leaf: root, L3, L2.
    assert_eq!(vm.n_used_mmu_pages(), 3);
}

#[test]
fn write_tracking_disallows_large_pages() {
    let vm = Vm::<MockHal>::new(VmConfig {
        nested_paging: true,
        n_max_mmu_pages: 64,
    });
    let vcpu = vm.create_vcpu(0).unwrap();
    let ram = GuestRam::new(1024);
    vm.set_memory_region(
        0,
        MemoryRegion {
            slot_id: 0,
            base_gfn: 0x200,
            npages: 1024,
            userspace_addr: ram.hva(),
            flags: MemSlotFlags::empty(),
        },
    )
    .unwrap();

    // A tracked frame inside the 2 MiB region forces 4 KiB mappings.
    vm.track_write(0, 0x210).unwrap();
    vm.vcpu_page_fault(
        &vcpu,
        gfn_to_gpa(0x207).as_usize(),
        PageFaultErrorCode::WRITE,
    )
    .unwrap()
    .unwrap();
    assert_eq!(vm.n_used_mmu_pages(), 4);
}

#[test]
fn shadow_paging_walks_guest_tables() {
    use x86_64::registers::model_specific::EferFlags;

    let vm = Vm::<MockHal>::new(VmConfig {
        nested_paging: false,
        n_max_mmu_pages: 64,
    });
    let vcpu = vm.create_vcpu(0).unwrap();
    let ram = GuestRam::new(32);
    vm.set_memory_region(
        0,
        MemoryRegion {
            slot_id: 0,
            base_gfn: 0,
            npages: 32,
            userspace_addr: ram.hva(),
            flags: MemSlotFlags::empty(),
        },
    )
    .unwrap();

    // Long-mode tables: PML4 @ 0x0, PDPT @ 0x1000, PD @ 0x2000,
    // PT @ 0x3000, data page @ 0x5000, all in guest-physical terms.
    const PTE_FLAGS: u64 = 0x1 | 0x2 | 0x4; // present | writable | user
    ram.write_u64(0x0000, 0x1000 | PTE_FLAGS);
    ram.write_u64(0x1000, 0x2000 | PTE_FLAGS);
    ram.write_u64(0x2000, 0x3000 | PTE_FLAGS);
    ram.write_u64(0x3000, 0x5000 | PTE_FLAGS);

    {
        let mut arch = vcpu.arch();
        arch.set_cr3(0);
        arch.set_efer(EferFlags::LONG_MODE_ACTIVE.bits());
    }

    let resolved = vm
        .vcpu_page_fault(&vcpu, 0x10, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap();
    assert_eq!(resolved.as_usize(), ram.hva().as_usize() + 0x5000 + 0x10);

    // An address the guest never mapped faults back to the guest with a
    // non-present error code.
    let fault = vm
        .vcpu_page_fault(&vcpu, 0x20_0000, PageFaultErrorCode::WRITE)
        .unwrap()
        .unwrap_err();
    assert_eq!(fault.addr, 0x20_0000);
    assert!(!fault.error_code.contains(PageFaultErrorCode::PRESENT));
    assert!(!fault.error_code.contains(PageFaultErrorCode::GUEST_PAGE));
}

#[test]
fn permission_table_matches_access_rules() {
    let mut mmu = Mmu::new(true); // CR0.WP semantics

    let write = PageFaultErrorCode::WRITE.bits() as u32;
    let user = PageFaultErrorCode::USER.bits() as u32;
    let fetch = PageFaultErrorCode::FETCH.bits() as u32;
    let rsvd = PageFaultErrorCode::RSVD.bits() as u32;

    assert!(mmu.permission_fault(write, ACC_EXEC | ACC_USER));
    assert!(!mmu.permission_fault(write, ACC_ALL));
    assert!(mmu.permission_fault(user, ACC_EXEC | ACC_WRITE));
    assert!(mmu.permission_fault(fetch, ACC_WRITE | ACC_USER));
    assert!(mmu.permission_fault(rsvd, ACC_ALL));
    assert!(!mmu.permission_fault(0, ACC_EXEC));

    // Without CR0.WP a supervisor write ignores read-only protection.
    mmu.update_permissions(false);
    assert!(!mmu.permission_fault(write, ACC_EXEC | ACC_USER));
    assert!(mmu.permission_fault(write | user, ACC_EXEC | ACC_USER));
}
