//! Memory-slot registry: registration, lookup, and snapshot publication.

use alloc::sync::Arc;

use crate::addr::HostVirtAddr;
use crate::slots::{MEM_SLOTS_NUM, MemSlotFlags, MemoryRegion, TSS_PRIVATE_MEMSLOT};
use crate::test_utils::mock::MockHal;
use crate::vm::{Vm, VmConfig};

fn new_vm() -> Arc<Vm<MockHal>> {
    Vm::new(VmConfig {
        nested_paging: true,
        n_max_mmu_pages: 64,
    })
}

fn region(slot_id: u16, base_gfn: usize, npages: usize) -> MemoryRegion {
    MemoryRegion {
        slot_id,
        base_gfn,
        npages,
        userspace_addr: HostVirtAddr::from(0x100_0000),
        flags: MemSlotFlags::empty(),
    }
}

#[test]
fn create_and_lookup() {
    let vm = new_vm();
    vm.set_memory_region(0, region(0, 0x100, 0x10)).unwrap();

    let slots = vm.memslots(0);
    let slot = slots.lookup(0x105).unwrap();
    assert_eq!(slot.id(), 0);
    assert_eq!(slot.base_gfn(), 0x100);
    assert_eq!(slot.npages(), 0x10);

    assert!(slots.lookup(0x0ff).is_none());
    assert!(slots.lookup(0x110).is_none());
}

#[test]
fn lookup_works_across_many_slots() {
    let vm = new_vm();
    for i in 0..8u16 {
        vm.set_memory_region(0, region(i, 0x1000 * (i as usize + 1), 0x10))
            .unwrap();
    }
    let slots = vm.memslots(0);
    for i in 0..8u16 {
        let slot = slots.lookup(0x1000 * (i as usize + 1) + 5).unwrap();
        assert_eq!(slot.id(), i);
        // a second hit goes through the hint and must agree
        assert_eq!(slots.lookup(0x1000 * (i as usize + 1) + 5).unwrap().id(), i);
    }
}

#[test]
fn overlap_is_rejected_without_mutation() {
    let vm = new_vm();
    vm.set_memory_region(0, region(0, 0x100, 0x10)).unwrap();
    let generation = vm.memslots(0).generation();

    assert!(vm.set_memory_region(0, region(1, 0x108, 0x10)).is_err());

    let slots = vm.memslots(0);
    assert_eq!(slots.used_slots(), 1);
    assert_eq!(slots.generation(), generation);
}

#[test]
fn delete_of_unknown_slot_is_rejected() {
    let vm = new_vm();
    assert!(vm.set_memory_region(0, region(7, 0, 0)).is_err());
}

#[test]
fn in_place_resize_is_rejected() {
    let vm = new_vm();
    vm.set_memory_region(0, region(0, 0x100, 0x10)).unwrap();
    assert!(vm.set_memory_region(0, region(0, 0x100, 0x20)).is_err());
}

#[test]
fn slot_id_out_of_range_is_rejected() {
    let vm = new_vm();
    assert!(
        vm.set_memory_region(0, region(MEM_SLOTS_NUM as u16, 0x100, 0x10))
            .is_err()
    );
}

#[test]
fn generation_strictly_increases() {
    let vm = new_vm();
    let mut last = vm.memslots(0).generation();

    vm.set_memory_region(0, region(0, 0x100, 0x10)).unwrap();
    let after_create = vm.memslots(0).generation();
    assert!(after_create > last);
    last = after_create;

    let mut flagged = region(0, 0x100, 0x10);
    flagged.flags = MemSlotFlags::LOG_DIRTY_PAGES;
    vm.set_memory_region(0, flagged).unwrap();
    let after_flags = vm.memslots(0).generation();
    assert!(after_flags > last);
    last = after_flags;

    vm.set_memory_region(0, region(0, 0x100, 0)).unwrap();
    assert!(vm.memslots(0).generation() > last);
}

#[test]
fn readers_keep_their_snapshot_across_publication() {
    let vm = new_vm();
    vm.set_memory_region(0, region(0, 0x100, 0x10)).unwrap();

    // A reader entered before the delete and holds the old table.
    let old = vm.memslots(0);
    vm.set_memory_region(0, region(0, 0x100, 0)).unwrap();

    assert!(old.lookup(0x105).is_some());
    assert!(vm.memslots(0).lookup(0x105).is_none());
}

#[test]
fn flags_change_preserves_slot_identity() {
    let vm = new_vm();
    vm.set_memory_region(0, region(3, 0x400, 0x20)).unwrap();

    let mut flagged = region(3, 0x400, 0x20);
    flagged.flags = MemSlotFlags::READONLY;
    vm.set_memory_region(0, flagged).unwrap();

    let slots = vm.memslots(0);
    let slot = slots.slot_by_id(3).unwrap();
    assert_eq!(slot.base_gfn(), 0x400);
    assert_eq!(slot.npages(), 0x20);
    assert!(slot.flags().contains(MemSlotFlags::READONLY));
}

#[test]
fn private_slot_move_preserves_id() {
    let vm = new_vm();
    vm.set_memory_region(0, region(TSS_PRIVATE_MEMSLOT, 0xfeb0, 3))
        .unwrap();
    vm.set_memory_region(0, region(TSS_PRIVATE_MEMSLOT, 0xfec0, 3))
        .unwrap();

    let slots = vm.memslots(0);
    let slot = slots.slot_by_id(TSS_PRIVATE_MEMSLOT).unwrap();
    assert_eq!(slot.base_gfn(), 0xfec0);
    assert!(slots.lookup(0xfeb0).is_none());
    assert!(slots.lookup(0xfec1).is_some());
}

#[test]
fn address_spaces_are_independent() {
    let vm = new_vm();
    vm.set_memory_region(0, region(0, 0x100, 0x10)).unwrap();

    assert!(vm.memslots(0).lookup(0x105).is_some());
    assert!(vm.memslots(1).lookup(0x105).is_none());
}

#[test]
fn dirty_log_requires_the_logging_flag() {
    let vm = new_vm();
    vm.set_memory_region(0, region(0, 0x100, 0x10)).unwrap();
    assert!(vm.get_dirty_log(0, 0).is_err());

    let mut logged = region(1, 0x400, 0x90);
    logged.flags = MemSlotFlags::LOG_DIRTY_PAGES;
    vm.set_memory_region(0, logged).unwrap();
    let log = vm.get_dirty_log(0, 1).unwrap();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|word| *word == 0));
}
