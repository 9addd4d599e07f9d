use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;

use super::{TestEnv, setup};
use crate::config::{HEAP_CHUNK_SIZE, PAGE_SIZE};
use crate::frame_allocator::PoolKind;
use crate::heap::{
    ExpandHeap, ExpandableHeap, HEADER_SIZE, Heap, HeapScrub, KernelHeap, KernelRegionExpander,
    MemoryBlock, NoExpansion,
};

const CHUNK: usize = HEAP_CHUNK_SIZE;

/// 16 字节对齐的宿主内存，测试进程内永久存在
fn arena(size: usize) -> NonNull<u8> {
    let words = vec![0u128; size / 16].into_boxed_slice();
    NonNull::from(Box::leak(words)).cast()
}

fn bytes_for(chunks: usize) -> usize {
    chunks * CHUNK - HEADER_SIZE
}

#[test]
fn small_allocations_take_whole_chunks() {
    let mut heap = unsafe { Heap::<CHUNK>::new(arena(64 * 1024), 64 * 1024, HeapScrub::NONE) };
    assert_eq!(heap.total_chunks(), 64 * 1024 * 8 / (CHUNK * 8 + 1));
    let a = heap.allocate(1).expect("a");
    let b = heap.allocate(bytes_for(1)).expect("b");
    let c = heap.allocate(bytes_for(1) + 1).expect("c");
    assert_eq!(heap.allocated_chunks(), 4);
    assert_eq!(a.as_ptr() as usize % HEADER_SIZE, 0);
    assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, CHUNK);
    assert!(heap.contains(c.as_ptr()));
    unsafe {
        heap.deallocate(b);
        heap.deallocate(a);
        heap.deallocate(c);
    }
    assert_eq!(heap.free_chunks(), heap.total_chunks());
}

#[test]
fn oversized_request_leaves_the_bitmap_alone() {
    let mut heap = unsafe { Heap::<CHUNK>::new(arena(8 * 1024), 8 * 1024, HeapScrub::NONE) };
    let kept = heap.allocate(100).expect("kept");
    let free = heap.free_chunks();
    assert!(heap.allocate(heap.free_bytes()).is_none());
    assert_eq!(heap.free_chunks(), free);
    assert!(heap.allocate(bytes_for(free)).is_some());
    assert_eq!(heap.free_chunks(), 0);
    unsafe { heap.deallocate(kept) };
}

#[test]
fn large_requests_use_best_fit_and_small_ones_first_fit() {
    let mut heap = unsafe { Heap::<CHUNK>::new(arena(64 * 1024), 64 * 1024, HeapScrub::NONE) };
    let a = heap.allocate(bytes_for(200)).expect("a");
    let _b = heap.allocate(bytes_for(1)).expect("b");
    let c = heap.allocate(bytes_for(150)).expect("c");
    let _d = heap.allocate(bytes_for(1)).expect("d");
    unsafe {
        heap.deallocate(a);
        heap.deallocate(c);
    }
    // 200、150 和尾部三段空闲，140 分块选最小的 150
    let big = heap.allocate(bytes_for(140)).expect("big");
    assert_eq!(big, c);
    let small = heap.allocate(bytes_for(10)).expect("small");
    assert_eq!(small, a);
}

#[test]
fn scrub_bytes_mark_fresh_and_freed_memory() {
    let memory = arena(8 * 1024);
    let mut heap = unsafe { Heap::<CHUNK>::new(memory, 8 * 1024, HeapScrub::DEBUG) };
    let ptr = heap.allocate(48).expect("alloc");
    let fresh = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 48) };
    assert!(fresh.iter().all(|b| *b == 0xbb));
    unsafe { heap.deallocate(ptr) };
    let freed = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 48) };
    assert!(freed.iter().all(|b| *b == 0xbd));
}

#[test]
#[should_panic(expected = "address space corruption")]
fn double_free_is_fatal() {
    setup();
    let mut heap = unsafe { Heap::<CHUNK>::new(arena(8 * 1024), 8 * 1024, HeapScrub::NONE) };
    let ptr = heap.allocate(8).expect("alloc");
    unsafe {
        heap.deallocate(ptr);
        heap.deallocate(ptr);
    }
}

/// 从宿主内存扩展的策略
#[derive(Default)]
struct HostExpander {
    decline_removal: bool,
    refuse: bool,
    added: Mutex<Vec<MemoryBlock>>,
    removed: Mutex<usize>,
}

impl ExpandHeap for HostExpander {
    fn add_memory(&self, request: usize) -> Option<MemoryBlock> {
        if self.refuse {
            return None;
        }
        let size = request.next_multiple_of(PAGE_SIZE);
        let block = MemoryBlock {
            start: arena(size),
            size,
        };
        self.added.lock().expect("added").push(block);
        Some(block)
    }

    fn remove_memory(&self, _block: MemoryBlock) -> bool {
        if self.decline_removal {
            return false;
        }
        *self.removed.lock().expect("removed") += 1;
        true
    }
}

#[test]
fn expandable_heap_grows_and_returns_empty_sub_heaps() {
    let mut heap: ExpandableHeap<CHUNK, HostExpander> =
        unsafe { ExpandableHeap::new(arena(4096), 4096, HostExpander::default(), HeapScrub::NONE) };
    let small = heap.allocate(64).expect("primordial");
    let big = heap.allocate(16 * 1024).expect("expanded");
    assert_eq!(heap.sub_heap_count(), 1);
    assert_eq!(heap.policy().added.lock().expect("added").len(), 1);
    assert!(heap.contains(big.as_ptr()));

    unsafe { heap.deallocate(big) };
    assert_eq!(heap.sub_heap_count(), 0);
    assert_eq!(*heap.policy().removed.lock().expect("removed"), 1);

    // 初始堆变空时不归还
    unsafe { heap.deallocate(small) };
    assert_eq!(heap.allocated_bytes(), 0);
}

#[test]
fn declined_removal_keeps_the_sub_heap() {
    let policy = HostExpander {
        decline_removal: true,
        ..HostExpander::default()
    };
    let mut heap: ExpandableHeap<CHUNK, HostExpander> =
        unsafe { ExpandableHeap::new(arena(4096), 4096, policy, HeapScrub::NONE) };
    let big = heap.allocate(16 * 1024).expect("expanded");
    unsafe { heap.deallocate(big) };
    assert_eq!(heap.sub_heap_count(), 1);
    // 保留下来的子堆可以直接复用
    let again = heap.allocate(16 * 1024).expect("reused");
    assert_eq!(heap.policy().added.lock().expect("added").len(), 1);
    unsafe { heap.deallocate(again) };
}

#[test]
fn refused_expansion_fails_the_allocation() {
    let policy = HostExpander {
        refuse: true,
        ..HostExpander::default()
    };
    let mut heap: ExpandableHeap<CHUNK, HostExpander> =
        unsafe { ExpandableHeap::new(arena(4096), 4096, policy, HeapScrub::NONE) };
    assert!(heap.allocate(16 * 1024).is_none());
    assert!(heap.allocate(64).is_some());
}

#[test]
fn sub_heaps_stay_address_ordered() {
    let mut heap: ExpandableHeap<CHUNK, HostExpander> =
        unsafe { ExpandableHeap::new(arena(4096), 4096, HostExpander::default(), HeapScrub::NONE) };
    let blocks: Vec<_> = (0..3).map(|_| heap.allocate(8 * 1024).expect("expanded")).collect();
    assert_eq!(heap.sub_heap_count(), 3);
    for ptr in blocks {
        unsafe { heap.deallocate(ptr) };
    }
    assert_eq!(heap.sub_heap_count(), 0);
    assert_eq!(*heap.policy().removed.lock().expect("removed"), 3);
}

#[test]
fn global_alloc_honours_large_alignment() {
    setup();
    let heap = KernelHeap::new(NoExpansion);
    unsafe { heap.init(arena(16 * 1024), 16 * 1024, HeapScrub::DEBUG) };
    let layout = Layout::from_size_align(100, 256).expect("layout");
    let ptr = unsafe { heap.alloc(layout) };
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % 256, 0);
    unsafe { ptr.write_bytes(0x5a, 100) };

    let plain = Layout::from_size_align(24, 8).expect("layout");
    let other = unsafe { heap.alloc(plain) };
    assert_eq!(other as usize % HEADER_SIZE, 0);

    unsafe {
        heap.dealloc(ptr, layout);
        heap.dealloc(other, plain);
    }
    assert_eq!(heap.usage().1, 0);
    assert!(unsafe { heap.alloc(Layout::from_size_align(64 * 1024, 8).expect("layout")) }.is_null());
}

#[test]
fn kernel_heap_expands_with_contiguous_kernel_regions() {
    let env = TestEnv::new(1);
    let mm = env.mm;
    let heap: &'static KernelHeap<KernelRegionExpander> =
        Box::leak(Box::new(KernelHeap::new(KernelRegionExpander::new())));
    unsafe { heap.init(arena(4096), 4096, HeapScrub::DEBUG) };

    // 接入之前不能扩展
    assert!(heap.heap_allocate(32 * 1024).is_none());

    heap.expander().attach(mm);
    let super_before = mm.physical().stats(PoolKind::Super);
    let ptr = heap.heap_allocate(32 * 1024).expect("expanded allocation");
    assert_eq!(heap.expander().region_count(), 1);
    assert!(mm.physical().stats(PoolKind::Super).used > super_before.used);
    unsafe { ptr.as_ptr().write_bytes(0x11, 32 * 1024) };

    unsafe { heap.heap_deallocate(ptr) };
    assert_eq!(heap.expander().region_count(), 0);
    assert_eq!(mm.physical().stats(PoolKind::Super), super_before);
}

#[test]
fn kernel_heap_shares_the_expansion_rules() {
    setup();
    let policy = HostExpander {
        decline_removal: true,
        ..HostExpander::default()
    };
    let heap = KernelHeap::new(policy);
    unsafe { heap.init(arena(4096), 4096, HeapScrub::NONE) };

    let big = heap.heap_allocate(16 * 1024).expect("expanded");
    unsafe { heap.heap_deallocate(big) };
    // 策略拒绝收回，子堆留在堆里供下次使用
    let again = heap.heap_allocate(16 * 1024).expect("reused");
    assert_eq!(heap.expander().added.lock().expect("added").len(), 1);
    unsafe { heap.heap_deallocate(again) };
    assert_eq!(heap.usage().1, 0);

    let refused = KernelHeap::new(HostExpander {
        refuse: true,
        ..HostExpander::default()
    });
    unsafe { refused.init(arena(4096), 4096, HeapScrub::NONE) };
    assert!(refused.heap_allocate(16 * 1024).is_none());
    assert!(refused.heap_allocate(64).is_some());
}
