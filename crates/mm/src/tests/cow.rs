use std::sync::Arc;

use super::{TestEnv, USER_BASE};
use crate::address::{Vaddr, VaddrRange};
use crate::config::PAGE_SIZE;
use crate::error::MmError;
use crate::frame_allocator::PoolKind;
use crate::memory_space::{Access, AddressSpace, AllocationStrategy, Region, RegionBacking, VmObject};

fn read(env: &TestEnv, space: &AddressSpace, vaddr: Vaddr, len: usize) -> Vec<u8> {
    let mut out = vec![0; len];
    env.mm.read_bytes(space, vaddr, &mut out).expect("read");
    out
}

fn frame_at(env: &TestEnv, space: &AddressSpace, vaddr: Vaddr) -> crate::address::Ppn {
    let inner = space.lock();
    env.mm
        .page_tables()
        .lookup(&inner.tables, vaddr)
        .expect("mapped")
        .ppn()
}

fn group_is_shared(env: &TestEnv, space: &AddressSpace, vaddr: Vaddr) -> bool {
    let inner = space.lock();
    env.mm
        .page_tables()
        .walk(&inner.tables, vaddr, 1)
        .is_some_and(|directory| directory.is_copy_on_write())
}

#[test]
fn fork_shares_then_each_writer_duplicates() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let used_before = env.used_frames();
    let parent = env.user_space_with(1, Access::READ_WRITE, AllocationStrategy::Reserve);
    mm.write_bytes(&parent, USER_BASE, b"parent data").expect("write");
    let original = frame_at(&env, &parent, USER_BASE);

    let child = mm.fork(&parent).expect("fork");
    assert!(group_is_shared(&env, &parent, USER_BASE));
    assert!(group_is_shared(&env, &child, USER_BASE));
    assert_eq!(frame_at(&env, &child, USER_BASE), original);
    let table = parent.lock().tables.leaf_for(USER_BASE).expect("leaf table");
    assert_eq!(mm.physical().ref_count(table), Some(2));
    assert_eq!(read(&env, &child, USER_BASE, 11), b"parent data");

    mm.write_bytes(&child, USER_BASE, b"child  data").expect("child write");
    let copied = frame_at(&env, &child, USER_BASE);
    assert_ne!(copied, original);
    assert!(!group_is_shared(&env, &child, USER_BASE));
    assert_eq!(frame_at(&env, &parent, USER_BASE), original);
    assert_eq!(read(&env, &parent, USER_BASE, 11), b"parent data");
    assert_eq!(read(&env, &child, USER_BASE, 11), b"child  data");
    assert_eq!(mm.physical().ref_count(table), Some(1));

    // 父空间仍标记为共享，写入时独立复制
    assert!(group_is_shared(&env, &parent, USER_BASE));
    mm.write_bytes(&parent, USER_BASE, b"parent 2").expect("parent write");
    assert!(!group_is_shared(&env, &parent, USER_BASE));
    assert_eq!(read(&env, &parent, USER_BASE, 11), b"parent 2ata");
    assert_eq!(read(&env, &child, USER_BASE, 11), b"child  data");

    mm.destroy_address_space(child);
    mm.destroy_address_space(parent);
    assert_eq!(env.used_frames(), used_before);
    mm.physical().verify_invariants();
}

#[test]
fn read_of_untouched_page_in_shared_group_resolves_privately() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let parent = env.user_space_with(4, Access::READ_WRITE, AllocationStrategy::None);
    mm.write_bytes(&parent, USER_BASE, &[7; 16]).expect("write");
    let child = mm.fork(&parent).expect("fork");

    // 第二页从未被访问，读它需要在共享页表里新建表项
    assert_eq!(read(&env, &child, USER_BASE + PAGE_SIZE, 4), [0; 4]);
    assert!(!group_is_shared(&env, &child, USER_BASE));
    assert_eq!(frame_at(&env, &child, USER_BASE + PAGE_SIZE), mm.shared_zero_frame());
    assert!(group_is_shared(&env, &parent, USER_BASE));
    {
        let inner = parent.lock();
        assert!(mm.page_tables().lookup(&inner.tables, USER_BASE + PAGE_SIZE).is_none());
    }
    assert_eq!(read(&env, &child, USER_BASE, 16), [7; 16]);

    mm.destroy_address_space(child);
    mm.destroy_address_space(parent);
}

#[test]
fn shared_object_pages_stay_shared_across_duplication() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let parent = env.user_space_with(1, Access::READ_WRITE, AllocationStrategy::Reserve);
    let object = Arc::new(VmObject::new(1));
    let shared_at = USER_BASE + 16 * PAGE_SIZE;
    let region = Region::new(
        VaddrRange::from_start_len(shared_at, PAGE_SIZE),
        Access::READ_WRITE,
        "shm",
        RegionBacking::Shared(Arc::clone(&object)),
    );
    mm.map_region(&parent, region).expect("map shared");
    mm.write_bytes(&parent, USER_BASE, b"anon").expect("write anon");
    mm.write_bytes(&parent, shared_at, b"before").expect("write shared");

    let child = mm.fork(&parent).expect("fork");
    mm.write_bytes(&child, USER_BASE, b"mine").expect("child anon write");
    assert_eq!(frame_at(&env, &child, shared_at), object.page(0).expect("resident"));

    mm.write_bytes(&child, shared_at, b"after!").expect("child shared write");
    assert_eq!(read(&env, &parent, shared_at, 6), b"after!");
    assert_eq!(read(&env, &parent, USER_BASE, 4), b"anon");

    mm.destroy_address_space(child);
    mm.destroy_address_space(parent);
    // 映射都已撤销，对象持有最后一个引用
    assert_eq!(object.release_pages(mm.physical()), 1);
}

#[test]
fn unmapping_inside_a_shared_group_leaves_the_other_side_intact() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let parent = env.user_space_with(2, Access::READ_WRITE, AllocationStrategy::AllocateNow);
    mm.write_bytes(&parent, USER_BASE, b"kept").expect("write");
    let child = mm.fork(&parent).expect("fork");

    mm.unmap_region(&child, USER_BASE).expect("unmap");
    assert_eq!(child.region_count(), 0);
    assert_eq!(read(&env, &parent, USER_BASE, 4), b"kept");
    assert!(mm.read_bytes(&child, USER_BASE, &mut [0; 4]).is_err());

    mm.write_bytes(&parent, USER_BASE, b"more").expect("parent write");
    assert_eq!(read(&env, &parent, USER_BASE, 4), b"more");

    mm.destroy_address_space(child);
    mm.destroy_address_space(parent);
    mm.physical().verify_invariants();
}

#[test]
fn unmapping_a_whole_group_drops_the_shared_table() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let parent = env.user_space_with(512, Access::READ_WRITE, AllocationStrategy::None);
    mm.write_bytes(&parent, USER_BASE + 5 * PAGE_SIZE, b"whole").expect("write");
    let child = mm.fork(&parent).expect("fork");
    let table = parent.lock().tables.leaf_for(USER_BASE).expect("leaf table");
    let copy = frame_at(&env, &parent, USER_BASE + 5 * PAGE_SIZE);

    mm.unmap_region(&child, USER_BASE).expect("unmap");
    // 整组放弃，不复制
    assert_eq!(mm.physical().ref_count(table), Some(1));
    assert_eq!(mm.physical().ref_count(copy), Some(1));
    assert!(child.lock().tables.leaf_for(USER_BASE).is_none());
    // 变空的页目录和 PDPT 一并释放
    assert_eq!(child.lock().tables.len(), 0);
    assert_eq!(read(&env, &parent, USER_BASE + 5 * PAGE_SIZE, 5), b"whole");

    mm.destroy_address_space(child);
    mm.destroy_address_space(parent);
}

#[test]
fn fork_reserves_frames_for_later_copies() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let committed_before = mm.physical().stats(PoolKind::User).committed;
    let parent = env.user_space_with(2, Access::READ_WRITE, AllocationStrategy::Reserve);
    mm.write_bytes(&parent, USER_BASE, b"first").expect("write");
    let child = mm.fork(&parent).expect("fork");

    let hoard = env.exhaust_uncommitted();
    assert_eq!(mm.physical().stats(PoolKind::User).uncommitted, 0);
    mm.write_bytes(&child, USER_BASE, b"child").expect("copy served from the reserve");
    assert!(!group_is_shared(&env, &child, USER_BASE));
    assert_eq!(read(&env, &parent, USER_BASE, 5), b"first");
    // 最后一个共享者收回页表，不需要新帧
    mm.write_bytes(&parent, USER_BASE, b"again").expect("parent takes the table back");
    assert!(!group_is_shared(&env, &parent, USER_BASE));

    env.release_frames(hoard);
    mm.destroy_address_space(child);
    mm.destroy_address_space(parent);
    assert_eq!(mm.physical().stats(PoolKind::User).committed, committed_before);
    mm.physical().verify_invariants();
}

#[test]
fn failed_duplication_rolls_back() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let parent = env.user_space_with(2, Access::READ_WRITE, AllocationStrategy::None);
    mm.write_bytes(&parent, USER_BASE, b"one").expect("write");
    mm.write_bytes(&parent, USER_BASE + PAGE_SIZE, b"two").expect("write");
    let child = mm.fork(&parent).expect("fork");
    let table = parent.lock().tables.leaf_for(USER_BASE).expect("leaf table");
    let frames = [frame_at(&env, &parent, USER_BASE), frame_at(&env, &parent, USER_BASE + PAGE_SIZE)];

    // 预留已经花光：只够新页表和第一页，第二页的复制失败
    let drained = {
        let inner = child.lock();
        let reserve = inner.regions[&USER_BASE].cow_reserve().expect("reserve");
        std::iter::from_fn(|| reserve.take().then_some(())).count()
    };
    mm.physical().uncommit(drained);
    let mut hoard = env.exhaust_uncommitted();
    env.release_frames(hoard.split_off(hoard.len() - 2));
    let stats = mm.physical().stats(PoolKind::User);

    assert_eq!(mm.write_bytes(&child, USER_BASE, b"x"), Err(MmError::OutOfMemory));
    assert_eq!(mm.physical().stats(PoolKind::User), stats);
    assert_eq!(mm.physical().ref_count(table), Some(2));
    for frame in frames {
        assert_eq!(mm.physical().ref_count(frame), Some(1));
    }
    assert!(group_is_shared(&env, &child, USER_BASE));
    assert_eq!(frame_at(&env, &child, USER_BASE), frames[0]);
    mm.physical().verify_invariants();

    env.release_frames(hoard);
    mm.write_bytes(&child, USER_BASE, b"x").expect("write after memory returns");
    assert_eq!(read(&env, &parent, USER_BASE, 3), b"one");
    mm.destroy_address_space(child);
    mm.destroy_address_space(parent);
    mm.physical().verify_invariants();
}
