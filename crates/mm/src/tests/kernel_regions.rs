use std::sync::Arc;

use super::{DEVICE_MEMORY, MIB, TestEnv, USER_BASE};
use crate::address::{Paddr, Ppn, Vaddr, VaddrRange};
use crate::config::PAGE_SIZE;
use crate::error::MmError;
use crate::frame_allocator::PoolKind;
use crate::memory_space::{Access, AllocationStrategy, Region, RegionBacking, VmObject};
use crate::page_table::{PageTableEntry, PteFlags};

fn kernel_entry(env: &TestEnv, vaddr: crate::address::Vaddr) -> Option<PageTableEntry> {
    let inner = env.mm.kernel_space().lock();
    env.mm.page_tables().lookup(&inner.tables, vaddr)
}

#[test]
fn anonymous_kernel_region_round_trip() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let used = env.used_frames();
    let region = mm
        .allocate_kernel_region(3 * PAGE_SIZE, "scratch", Access::READ_WRITE, AllocationStrategy::AllocateNow)
        .expect("region");
    assert_eq!(region.size(), 3 * PAGE_SIZE);
    let entry = kernel_entry(&env, region.start()).expect("populated");
    assert!(entry.flags().contains(PteFlags::GLOBAL | PteFlags::WRITABLE));
    assert!(!entry.flags().contains(PteFlags::USER));

    let at = region.start() + PAGE_SIZE + 100;
    mm.write_bytes(mm.kernel_space(), at, b"kernel").expect("write");
    let mut out = [0u8; 6];
    mm.read_bytes(mm.kernel_space(), at, &mut out).expect("read");
    assert_eq!(&out, b"kernel");

    mm.deallocate_kernel_region(region).expect("deallocate");
    assert!(kernel_entry(&env, region.start()).is_none());
    // 内核半区的页表可能保留下来，帧本身全部归还
    assert!(env.used_frames() <= used + 2);
    mm.physical().verify_invariants();
}

#[test]
fn contiguous_region_comes_from_the_super_pool() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let before = mm.physical().stats(PoolKind::Super);
    let region = mm
        .allocate_contiguous_kernel_region(4 * PAGE_SIZE, "dma", Access::READ_WRITE)
        .expect("region");
    assert_eq!(mm.physical().stats(PoolKind::Super).used, before.used + 4);

    let first = kernel_entry(&env, region.start()).expect("mapped").ppn();
    for page in 1..4 {
        let ppn = kernel_entry(&env, region.start() + page * PAGE_SIZE).expect("mapped").ppn();
        assert_eq!(ppn, Ppn(first.0 + page));
    }
    let mut out = [0xffu8; 32];
    mm.read_bytes(mm.kernel_space(), region.start() + 3 * PAGE_SIZE, &mut out).expect("read");
    assert_eq!(out, [0; 32]);

    mm.deallocate_kernel_region(region).expect("deallocate");
    assert_eq!(mm.physical().stats(PoolKind::Super), before);
}

#[test]
fn identity_and_device_regions_map_physical_memory() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let paddr = Paddr::new(DEVICE_MEMORY);
    let identity = mm
        .allocate_kernel_region_identity(paddr, 2 * PAGE_SIZE, "apic", Access::READ_WRITE)
        .expect("identity");
    assert_eq!(identity.start().0, paddr.0);
    let entry = kernel_entry(&env, identity.start() + PAGE_SIZE).expect("mapped");
    assert_eq!(entry.ppn().start_addr(), paddr + PAGE_SIZE);

    // 同一段恒等地址不能再分配
    assert!(
        mm.allocate_kernel_region_identity(paddr, PAGE_SIZE, "again", Access::READ)
            .is_err()
    );

    let device = mm
        .allocate_kernel_region_for_physical(paddr, PAGE_SIZE, "mmio", Access::READ_WRITE, false)
        .expect("device");
    let entry = kernel_entry(&env, device.start()).expect("mapped");
    assert!(entry.flags().contains(PteFlags::NO_CACHE));
    assert_eq!(entry.ppn().start_addr(), paddr);

    mm.deallocate_kernel_region(device).expect("device");
    mm.deallocate_kernel_region(identity).expect("identity");
    assert!(
        mm.allocate_kernel_region_identity(paddr, PAGE_SIZE, "again", Access::READ)
            .is_ok()
    );
}

#[test]
fn user_physical_mappings_are_limited_to_reserved_memory() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let space = mm.create_address_space().expect("space");
    let range = VaddrRange::from_start_len(USER_BASE, PAGE_SIZE);

    let ram = Region::new(range, Access::READ, "ram", RegionBacking::Physical {
        base: Paddr::new(4 * MIB),
    });
    assert!(mm.map_region(&space, ram).is_err());

    let device = Region::new(range, Access::READ_WRITE, "framebuffer", RegionBacking::Physical {
        base: Paddr::new(DEVICE_MEMORY),
    });
    mm.map_region(&space, device).expect("device mapping");
    let entry = {
        let inner = space.lock();
        mm.page_tables().lookup(&inner.tables, USER_BASE).expect("eager")
    };
    assert!(entry.flags().contains(PteFlags::USER | PteFlags::WRITABLE));
    mm.destroy_address_space(space);
}

#[test]
fn overlapping_or_misaligned_regions_are_rejected() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let space = env.user_space_with(4, Access::READ_WRITE, AllocationStrategy::Reserve);
    let overlap = Region::new(
        VaddrRange::from_start_len(USER_BASE + 2 * PAGE_SIZE, 4 * PAGE_SIZE),
        Access::READ,
        "overlap",
        RegionBacking::anonymous(AllocationStrategy::None),
    );
    assert!(mm.map_region(&space, overlap).is_err());
    let misaligned = Region::new(
        VaddrRange::from_start_len(USER_BASE + 64 * PAGE_SIZE + 8, PAGE_SIZE),
        Access::READ,
        "misaligned",
        RegionBacking::anonymous(AllocationStrategy::None),
    );
    assert!(mm.map_region(&space, misaligned).is_err());
    assert_eq!(space.region_count(), 1);
    assert!(mm.unmap_region(&space, USER_BASE + PAGE_SIZE).is_err());
    mm.destroy_address_space(space);
}

#[test]
fn memory_stats_track_reservations() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let before = mm.memory_stats();
    let space = env.user_space_with(8, Access::READ_WRITE, AllocationStrategy::Reserve);
    let during = mm.memory_stats();
    assert_eq!(during.user.committed, before.user.committed + 8);
    assert!(during.user.is_consistent());
    mm.destroy_address_space(space);
    assert_eq!(mm.memory_stats().user, before.user);
}

#[test]
fn user_stack_validation_requires_a_stack_region() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let space = env.user_space_with(2, Access::READ_WRITE, AllocationStrategy::None);
    let stack_at = USER_BASE + 64 * PAGE_SIZE;
    let stack = Region::new(
        VaddrRange::from_start_len(stack_at, 4 * PAGE_SIZE),
        Access::READ_WRITE,
        "stack",
        RegionBacking::anonymous(AllocationStrategy::Reserve),
    )
    .with_stack(true);
    mm.map_region(&space, stack).expect("map stack");

    assert!(mm.validate_user_stack(&space, stack_at + 3 * PAGE_SIZE + 8));
    assert!(!mm.validate_user_stack(&space, stack_at + 4 * PAGE_SIZE));
    assert!(!mm.validate_user_stack(&space, USER_BASE));
    {
        let inner = space.lock();
        assert!(mm.validate_user_stack_locked(&inner, stack_at));
    }
    // 内核区域不是用户栈
    let kernel = mm
        .allocate_kernel_region(PAGE_SIZE, "kstack", Access::READ_WRITE, AllocationStrategy::Reserve)
        .expect("region");
    assert!(!mm.validate_user_stack(mm.kernel_space(), kernel.start()));
    mm.deallocate_kernel_region(kernel).expect("deallocate");
    mm.destroy_address_space(space);
}

#[test]
fn region_lookup_prefers_the_kernel_space() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let space = env.user_space_with(2, Access::READ_WRITE, AllocationStrategy::None);
    let kernel = mm
        .allocate_kernel_region(2 * PAGE_SIZE, "lookup", Access::READ, AllocationStrategy::Reserve)
        .expect("region");

    let found = mm.kernel_region_from_vaddr(kernel.start() + PAGE_SIZE).expect("kernel region");
    assert_eq!(found.name, "lookup");
    assert_eq!(found.range, kernel.range());
    assert!(!found.user);
    assert_eq!(mm.find_region_from_vaddr(&space, kernel.start()), Some(found));

    let user = mm.find_region_from_vaddr(&space, USER_BASE + PAGE_SIZE).expect("user region");
    assert!(user.user);
    assert_eq!(user.access, Access::READ_WRITE);
    assert!(mm.kernel_region_from_vaddr(USER_BASE).is_none());
    assert!(mm.find_region_from_vaddr(&space, USER_BASE + 2 * PAGE_SIZE).is_none());

    mm.dump_kernel_regions();
    mm.deallocate_kernel_region(kernel).expect("deallocate");
    assert!(mm.kernel_region_from_vaddr(kernel.start()).is_none());
    mm.destroy_address_space(space);
}

#[test]
fn kernel_page_protection_updates_live_entries() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let region = mm
        .allocate_kernel_region(4 * PAGE_SIZE, "image", Access::READ_WRITE, AllocationStrategy::AllocateNow)
        .expect("region");
    let text = VaddrRange::from_start_len(region.start(), 2 * PAGE_SIZE);
    let data = VaddrRange::from_start_len(region.start() + 2 * PAGE_SIZE, PAGE_SIZE);
    let late = VaddrRange::from_start_len(region.start() + 3 * PAGE_SIZE, PAGE_SIZE);

    mm.protect_kernel_image(text, data).expect("protect image");
    for vaddr in text.pages() {
        let entry = kernel_entry(&env, vaddr).expect("mapped");
        assert!(!entry.is_writable());
    }
    let entry = kernel_entry(&env, data.start).expect("mapped");
    assert!(entry.is_writable());
    assert!(entry.flags().contains(PteFlags::NO_EXECUTE));

    mm.protect_readonly_after_init(late).expect("protect late data");
    assert!(!kernel_entry(&env, late.start).expect("mapped").is_writable());

    mm.set_page_writable_direct(text.start + 16, true).expect("unprotect");
    assert!(kernel_entry(&env, text.start).expect("mapped").is_writable());
    assert!(!kernel_entry(&env, text.start + PAGE_SIZE).expect("mapped").is_writable());

    let unmapped = Vaddr::new(0xffff_c000_3fff_f000);
    assert_eq!(
        mm.set_page_writable_direct(unmapped, false),
        Err(MmError::InvalidMapping { vaddr: unmapped })
    );
    mm.deallocate_kernel_region(region).expect("deallocate");
}

#[test]
fn kernel_region_over_a_shared_object() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let object = Arc::new(VmObject::new(2));
    let region = mm
        .allocate_kernel_region_with_vmobject(Arc::clone(&object), 2 * PAGE_SIZE, "object", Access::READ_WRITE, true)
        .expect("region");
    // 页在第一次访问时建立
    assert!(object.page(1).is_none());
    mm.write_bytes(mm.kernel_space(), region.start() + PAGE_SIZE, b"object")
        .expect("write");
    let frame = object.page(1).expect("resident");
    assert_eq!(kernel_entry(&env, region.start() + PAGE_SIZE).expect("mapped").ppn(), frame);
    assert_eq!(&mm.quickmap(frame).bytes()[..6], b"object");

    mm.deallocate_kernel_region(region).expect("deallocate");
    // 对象仍被持有，页不随区域释放
    assert_eq!(object.page(1), Some(frame));
    assert_eq!(object.release_pages(mm.physical()), 1);
}
