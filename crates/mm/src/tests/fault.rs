use test_support::cpu;

use super::{TestEnv, USER_BASE};
use crate::address::Vaddr;
use crate::config::PAGE_SIZE;
use crate::error::MmError;
use crate::fault::{FaultAccess, PageFault, PageFaultCode, PageFaultResponse};
use crate::memory_space::{Access, AllocationStrategy};

const IP: Vaddr = Vaddr::new(0x40_1000);

fn fault(code: PageFaultCode, vaddr: Vaddr) -> PageFault {
    PageFault::new(code.bits(), vaddr, IP)
}

#[test]
fn error_code_decodes_access() {
    let write = fault(PageFaultCode::WRITE | PageFaultCode::USER, USER_BASE);
    assert_eq!(write.access(), FaultAccess::Write);
    assert!(write.is_user());
    let fetch = fault(PageFaultCode::INSTRUCTION_FETCH, USER_BASE);
    assert_eq!(fetch.access(), FaultAccess::Execute);
    assert_eq!(PageFault::new(0, USER_BASE, IP).access(), FaultAccess::Read);
}

#[test]
fn read_fault_maps_the_shared_zero_frame() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let space = env.user_space_with(2, Access::READ_WRITE, AllocationStrategy::Reserve);
    let used = env.used_frames();

    let response = mm.handle_page_fault(&space, &fault(PageFaultCode::USER, USER_BASE + 8));
    assert_eq!(response, PageFaultResponse::Continue);
    let entry = {
        let inner = space.lock();
        mm.page_tables().lookup(&inner.tables, USER_BASE).expect("mapped")
    };
    assert_eq!(entry.ppn(), mm.shared_zero_frame());
    assert!(!entry.is_writable());
    // 零帧不占新帧，只有新建的页表
    assert_eq!(env.used_frames(), used + 3);

    let response = mm.handle_page_fault(
        &space,
        &fault(PageFaultCode::PRESENT | PageFaultCode::WRITE | PageFaultCode::USER, USER_BASE),
    );
    assert_eq!(response, PageFaultResponse::Continue);
    let entry = {
        let inner = space.lock();
        mm.page_tables().lookup(&inner.tables, USER_BASE).expect("mapped")
    };
    assert_ne!(entry.ppn(), mm.shared_zero_frame());
    assert!(entry.is_writable());
    mm.destroy_address_space(space);
}

#[test]
fn spurious_fault_continues() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let space = env.user_space_with(1, Access::READ_WRITE, AllocationStrategy::AllocateNow);
    let response = mm.handle_page_fault(
        &space,
        &fault(PageFaultCode::PRESENT | PageFaultCode::WRITE | PageFaultCode::USER, USER_BASE),
    );
    assert_eq!(response, PageFaultResponse::Continue);
    mm.destroy_address_space(space);
}

#[test]
fn faults_outside_regions_or_rights_crash() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let space = env.user_space_with(1, Access::READ, AllocationStrategy::None);

    let unmapped = fault(PageFaultCode::USER, USER_BASE + 64 * PAGE_SIZE);
    assert_eq!(mm.handle_page_fault(&space, &unmapped), PageFaultResponse::ShouldCrash);

    let write = fault(PageFaultCode::WRITE | PageFaultCode::USER, USER_BASE);
    assert_eq!(mm.handle_page_fault(&space, &write), PageFaultResponse::ShouldCrash);

    let fetch = fault(PageFaultCode::INSTRUCTION_FETCH | PageFaultCode::USER, USER_BASE);
    assert_eq!(mm.handle_page_fault(&space, &fetch), PageFaultResponse::ShouldCrash);

    // 用户态访问内核区域
    let kernel = mm
        .allocate_kernel_region(PAGE_SIZE, "private", Access::READ_WRITE, AllocationStrategy::Reserve)
        .expect("kernel region");
    let user_into_kernel = fault(PageFaultCode::USER, kernel.start());
    assert_eq!(
        mm.handle_page_fault(&space, &user_into_kernel),
        PageFaultResponse::ShouldCrash
    );
    assert_eq!(
        mm.handle_page_fault(&space, &fault(PageFaultCode::empty(), kernel.start())),
        PageFaultResponse::Continue
    );
    mm.deallocate_kernel_region(kernel).expect("deallocate");
    mm.destroy_address_space(space);
}

#[test]
fn fault_in_interrupt_context_crashes() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let space = env.user_space_with(1, Access::READ_WRITE, AllocationStrategy::Reserve);
    cpu::set_in_irq(true);
    let response = mm.handle_page_fault(&space, &fault(PageFaultCode::USER, USER_BASE));
    cpu::set_in_irq(false);
    assert_eq!(response, PageFaultResponse::ShouldCrash);
    mm.destroy_address_space(space);
}

#[test]
#[should_panic(expected = "address space corruption")]
fn reserved_bit_fault_is_fatal() {
    let env = TestEnv::new(1);
    let space = env.user_space_with(1, Access::READ_WRITE, AllocationStrategy::Reserve);
    env.mm.handle_page_fault(
        &space,
        &fault(PageFaultCode::PRESENT | PageFaultCode::RESERVED_WRITE, USER_BASE),
    );
}

#[test]
fn demand_faults_consume_the_commitment() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let stats = || mm.physical().stats(crate::frame_allocator::PoolKind::User);
    let before = stats();
    let space = env.user_space_with(3, Access::READ_WRITE, AllocationStrategy::Reserve);
    assert_eq!(stats().committed, before.committed + 3);

    for page in 0..3 {
        mm.write_bytes(&space, USER_BASE + page * PAGE_SIZE, &[1]).expect("write");
    }
    assert_eq!(stats().committed, before.committed);
    mm.destroy_address_space(space);
    assert_eq!(stats(), before);
}

#[test]
fn byte_access_reports_exhaustion_as_out_of_memory() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let space = env.user_space_with(2, Access::READ_WRITE, AllocationStrategy::None);
    mm.write_bytes(&space, USER_BASE, b"tables").expect("write");
    let fresh = env.user_space_with(1, Access::READ_WRITE, AllocationStrategy::None);
    let hoard = env.exhaust_uncommitted();

    let second = USER_BASE + PAGE_SIZE;
    assert_eq!(mm.write_bytes(&space, second, b"x"), Err(MmError::OutOfMemory));
    // 页表需要新帧，读也会失败
    assert_eq!(mm.read_bytes(&fresh, USER_BASE, &mut [0; 4]), Err(MmError::OutOfMemory));
    // 越界访问仍是无效映射
    assert_eq!(
        mm.write_bytes(&space, USER_BASE + 2 * PAGE_SIZE, b"x"),
        Err(MmError::InvalidMapping { vaddr: USER_BASE + 2 * PAGE_SIZE })
    );
    let response = mm.handle_page_fault(&space, &fault(PageFaultCode::WRITE | PageFaultCode::USER, second));
    assert_eq!(response, PageFaultResponse::ShouldCrash);

    env.release_frames(hoard);
    mm.write_bytes(&space, second, b"x").expect("write after memory returns");
    mm.destroy_address_space(fresh);
    mm.destroy_address_space(space);
}
