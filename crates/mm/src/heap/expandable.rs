//! 可扩展堆
//!
//! 初始堆（primordial）之外的子堆组成一条按地址排序的侵入式链表，
//! 子堆的描述结构放在它自己那块内存的开头。
//!
//! 扩展的流程（先在现有子堆中分配，不足时向策略要内存，最多扩展
//! [`MAX_EXPANSIONS`] 次）只有 [`allocate_expanding`] 一份实现。它经 [`HeapAccess`]
//! 访问子堆，每一步访问之间调用策略：[`ExpandableHeap`] 直接独占子堆，
//! [`super::KernelHeap`] 每一步重新获取堆锁，策略因此在锁外运行。

use core::ops::ControlFlow;
use core::ptr::NonNull;

use super::chunk_heap::Heap;
use super::{ExpandHeap, HEADER_SIZE, HeapScrub, MemoryBlock};
use crate::error::corruption;

/// 一次分配最多触发的扩展次数
pub const MAX_EXPANSIONS: usize = 2;

#[repr(C)]
struct SubHeap<const CHUNK: usize> {
    heap: Heap<CHUNK>,
    next: Option<NonNull<SubHeap<CHUNK>>>,
    block: MemoryBlock,
}

/// 初始堆与子堆链表，不含扩展策略
pub struct SubHeaps<const CHUNK: usize> {
    primordial: Heap<CHUNK>,
    sub_heaps: Option<NonNull<SubHeap<CHUNK>>>,
    expanding: bool,
    scrub: HeapScrub,
}

// Safety: 子堆链表只由持有堆的一方访问
unsafe impl<const CHUNK: usize> Send for SubHeaps<CHUNK> {}

impl<const CHUNK: usize> SubHeaps<CHUNK> {
    const SUB_HEAP_HEADER: usize = core::mem::size_of::<SubHeap<CHUNK>>().next_multiple_of(HEADER_SIZE);

    /// 一个子堆要满足 `bytes` 字节的分配所需的内存
    pub const fn calculate_memory_for_bytes(bytes: usize) -> usize {
        Self::SUB_HEAP_HEADER + Heap::<CHUNK>::calculate_memory_for_bytes(bytes)
    }

    /// 在 `memory` 上建立初始堆
    ///
    /// # Safety
    /// 同 [`Heap::new`]。
    pub unsafe fn new(memory: NonNull<u8>, memory_size: usize, scrub: HeapScrub) -> Self {
        Self {
            // SAFETY: 调用者保证
            primordial: unsafe { Heap::new(memory, memory_size, scrub) },
            sub_heaps: None,
            expanding: false,
            scrub,
        }
    }

    fn sub_heap_ptrs(&self) -> impl Iterator<Item = NonNull<SubHeap<CHUNK>>> + '_ {
        let mut cursor = self.sub_heaps;
        core::iter::from_fn(move || {
            let node = cursor?;
            // SAFETY: 链表中的节点都是 add_subheap 建立的
            cursor = unsafe { node.as_ref().next };
            Some(node)
        })
    }

    fn heaps(&self) -> impl Iterator<Item = &Heap<CHUNK>> + '_ {
        // SAFETY: 节点在从链表摘下之前一直有效
        core::iter::once(&self.primordial).chain(self.sub_heap_ptrs().map(|node| unsafe { &(*node.as_ptr()).heap }))
    }

    /// 只在现有子堆中分配，不扩展
    pub fn try_allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.primordial.allocate(size) {
            return Some(ptr);
        }
        let mut cursor = self.sub_heaps;
        while let Some(node) = cursor {
            // SAFETY: 节点有效，且 &mut self 保证独占
            let sub = unsafe { &mut *node.as_ptr() };
            if let Some(ptr) = sub.heap.allocate(size) {
                return Some(ptr);
            }
            cursor = sub.next;
        }
        None
    }

    /// 标记扩展开始；已在扩展中时返回 `false`
    ///
    /// 扩展期间不摘除空子堆，扩展策略自身的分配也不会再触发扩展。
    pub fn begin_expansion(&mut self) -> bool {
        !core::mem::replace(&mut self.expanding, true)
    }

    /// 标记扩展结束
    pub fn end_expansion(&mut self) {
        self.expanding = false;
    }

    /// 是否在扩展中
    pub fn is_expanding(&self) -> bool {
        self.expanding
    }

    /// 把一块内存作为新子堆挂入链表；内存太小时返回 `false`
    ///
    /// # Safety
    /// `block` 必须按 [`HEADER_SIZE`] 对齐，在子堆被摘除之前有效且独占。
    pub unsafe fn add_subheap(&mut self, block: MemoryBlock) -> bool {
        if block.start.as_ptr() as usize % HEADER_SIZE != 0 {
            corruption("heap memory block is misaligned");
        }
        if block.size <= Self::SUB_HEAP_HEADER + CHUNK {
            return false;
        }
        let node = block.start.cast::<SubHeap<CHUNK>>();
        // SAFETY: 调用者保证内存有效；描述结构之后的部分交给分块堆
        unsafe {
            let memory = block.start.add(Self::SUB_HEAP_HEADER);
            let heap = Heap::new(memory, block.size - Self::SUB_HEAP_HEADER, self.scrub);
            node.write(SubHeap { heap, next: None, block });
        }

        let mut link = &mut self.sub_heaps;
        // SAFETY: 链表节点有效
        unsafe {
            while let Some(next) = *link
                && next < node
            {
                link = &mut (*next.as_ptr()).next;
            }
            (*node.as_ptr()).next = *link;
        }
        *link = Some(node);
        log::debug!("MM: heap gained sub-heap at {:p} ({} bytes)", block.start, block.size);
        true
    }

    /// 释放；所在子堆因此变空且不在扩展中时，把它摘下并返回其内存块
    ///
    /// # Safety
    /// `ptr` 必须是本堆分配且尚未释放的指针。
    pub unsafe fn deallocate_and_detach(&mut self, ptr: NonNull<u8>) -> Option<MemoryBlock> {
        if self.primordial.contains(ptr.as_ptr()) {
            // SAFETY: 调用者保证
            unsafe { self.primordial.deallocate(ptr) };
            return None;
        }

        let mut link = &mut self.sub_heaps;
        while let Some(node) = *link {
            // SAFETY: 节点有效，&mut self 保证独占
            let sub = unsafe { &mut *node.as_ptr() };
            if sub.heap.contains(ptr.as_ptr()) {
                // SAFETY: 调用者保证
                unsafe { sub.heap.deallocate(ptr) };
                if sub.heap.allocated_chunks() != 0 || self.expanding {
                    return None;
                }
                *link = sub.next;
                log::debug!("MM: heap released empty sub-heap at {:p}", sub.block.start);
                return Some(sub.block);
            }
            link = &mut sub.next;
        }
        corruption("heap pointer does not belong to any sub-heap");
    }

    /// 摘下全部子堆交还策略，策略拒绝的内存就此泄漏
    pub fn release_all<E: ExpandHeap + ?Sized>(&mut self, expand: &E) {
        while let Some(node) = self.sub_heaps {
            // SAFETY: 节点有效；先摘下再交还
            let block = unsafe {
                self.sub_heaps = (*node.as_ptr()).next;
                (*node.as_ptr()).block
            };
            if !expand.remove_memory(block) {
                log::warn!("MM: heap sub-heap at {:p} leaked on drop", block.start);
            }
        }
    }

    /// 指针是否属于本堆
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.heaps().any(|heap| heap.contains(ptr))
    }

    /// 子堆数量（不含初始堆）
    pub fn sub_heap_count(&self) -> usize {
        self.sub_heap_ptrs().count()
    }

    /// 总字节数
    pub fn total_bytes(&self) -> usize {
        self.heaps().map(Heap::total_bytes).sum()
    }

    /// 空闲字节数
    pub fn free_bytes(&self) -> usize {
        self.heaps().map(Heap::free_bytes).sum()
    }

    /// 已分配字节数
    pub fn allocated_bytes(&self) -> usize {
        self.heaps().map(Heap::allocated_bytes).sum()
    }
}

/// 扩展流程访问子堆的方式
pub trait HeapAccess<const CHUNK: usize> {
    /// 在独占访问下运行 `f`；堆尚不可用时返回 `None`
    fn with_heap<R>(&mut self, f: impl FnOnce(&mut SubHeaps<CHUNK>) -> R) -> Option<R>;
}

impl<const CHUNK: usize> HeapAccess<CHUNK> for &mut SubHeaps<CHUNK> {
    fn with_heap<R>(&mut self, f: impl FnOnce(&mut SubHeaps<CHUNK>) -> R) -> Option<R> {
        Some(f(&mut **self))
    }
}

/// 分配 `size` 字节；现有子堆都不够时向 `expand` 要内存，最多 [`MAX_EXPANSIONS`] 次
pub fn allocate_expanding<const CHUNK: usize, A, E>(heap: &mut A, expand: &E, size: usize) -> Option<NonNull<u8>>
where
    A: HeapAccess<CHUNK>,
    E: ExpandHeap + ?Sized,
{
    for attempt in 0..=MAX_EXPANSIONS {
        let step = heap.with_heap(|heaps| match heaps.try_allocate(size) {
            Some(ptr) => ControlFlow::Break(ptr),
            None => ControlFlow::Continue(attempt < MAX_EXPANSIONS && heaps.begin_expansion()),
        })?;
        match step {
            ControlFlow::Break(ptr) => return Some(ptr),
            ControlFlow::Continue(false) => break,
            ControlFlow::Continue(true) => {}
        }

        let block = expand.add_memory(SubHeaps::<CHUNK>::calculate_memory_for_bytes(size));
        let added = heap.with_heap(|heaps| {
            heaps.end_expansion();
            // SAFETY: 策略交出的内存块由堆独占
            block.is_some_and(|block| unsafe { heaps.add_subheap(block) })
        })?;
        if !added {
            break;
        }
    }
    None
}

/// 释放，并把变空的子堆交还 `expand`；策略拒绝时子堆重新挂回
///
/// # Safety
/// `ptr` 必须是本堆分配且尚未释放的指针。
pub unsafe fn deallocate_returning<const CHUNK: usize, A, E>(heap: &mut A, expand: &E, ptr: NonNull<u8>)
where
    A: HeapAccess<CHUNK>,
    E: ExpandHeap + ?Sized,
{
    // SAFETY: 调用者保证
    let Some(Some(block)) = heap.with_heap(|heaps| unsafe { heaps.deallocate_and_detach(ptr) }) else {
        return;
    };
    if !expand.remove_memory(block) {
        // SAFETY: 策略拒绝收回，内存仍归堆所有
        heap.with_heap(|heaps| unsafe { heaps.add_subheap(block) });
    }
}

/// 由初始堆、子堆和扩展策略组成的堆
pub struct ExpandableHeap<const CHUNK: usize, E: ExpandHeap> {
    heaps: SubHeaps<CHUNK>,
    expand: E,
}

impl<const CHUNK: usize, E: ExpandHeap> ExpandableHeap<CHUNK, E> {
    /// 一个子堆要满足 `bytes` 字节的分配所需的内存
    pub const fn calculate_memory_for_bytes(bytes: usize) -> usize {
        SubHeaps::<CHUNK>::calculate_memory_for_bytes(bytes)
    }

    /// 在 `memory` 上建立初始堆
    ///
    /// # Safety
    /// 同 [`Heap::new`]。
    pub unsafe fn new(memory: NonNull<u8>, memory_size: usize, expand: E, scrub: HeapScrub) -> Self {
        Self {
            // SAFETY: 调用者保证
            heaps: unsafe { SubHeaps::new(memory, memory_size, scrub) },
            expand,
        }
    }

    /// 扩展策略
    pub fn policy(&self) -> &E {
        &self.expand
    }

    /// 分配；空间不足时最多扩展 [`MAX_EXPANSIONS`] 次
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        allocate_expanding::<CHUNK, _, _>(&mut &mut self.heaps, &self.expand, size)
    }

    /// 释放，并把变空的子堆交还扩展策略
    ///
    /// # Safety
    /// `ptr` 必须是本堆分配且尚未释放的指针。
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        // SAFETY: 调用者保证
        unsafe { deallocate_returning::<CHUNK, _, _>(&mut &mut self.heaps, &self.expand, ptr) }
    }

    /// 指针是否属于本堆
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.heaps.contains(ptr)
    }

    /// 子堆数量（不含初始堆）
    pub fn sub_heap_count(&self) -> usize {
        self.heaps.sub_heap_count()
    }

    /// 已分配字节数
    pub fn allocated_bytes(&self) -> usize {
        self.heaps.allocated_bytes()
    }
}

impl<const CHUNK: usize, E: ExpandHeap> Drop for ExpandableHeap<CHUNK, E> {
    fn drop(&mut self) {
        self.heaps.release_all(&self.expand);
    }
}
