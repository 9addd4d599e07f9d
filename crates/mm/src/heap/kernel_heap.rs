//! 全局分配器前端
//!
//! 堆本体放在自旋锁里；扩展策略在锁外运行，策略自身的分配（区域名、区域表节点）
//! 可以从剩余空间满足，而不会在同一 CPU 上重入堆锁。

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use sync::{SpinLock, SpinLockGuard};

use super::expandable::{HeapAccess, SubHeaps, allocate_expanding, deallocate_returning};
use super::{ExpandHeap, HEADER_SIZE, HeapScrub};
use crate::config::HEAP_CHUNK_SIZE;
use crate::error::reentrancy;

type InnerHeap = SubHeaps<HEAP_CHUNK_SIZE>;

const NO_OWNER: usize = usize::MAX;

/// 内核堆
pub struct KernelHeap<E: ExpandHeap> {
    heap: SpinLock<Option<InnerHeap>>,
    expander: E,
    /// 持有堆锁的 CPU
    owner: AtomicUsize,
}

struct HeapGuard<'a> {
    owner: &'a AtomicUsize,
    heap: SpinLockGuard<'a, Option<InnerHeap>>,
}

impl Drop for HeapGuard<'_> {
    fn drop(&mut self) {
        self.owner.store(NO_OWNER, Ordering::Release);
    }
}

/// 扩展流程的每一步都重新获取堆锁
struct Locked<'a, E: ExpandHeap>(&'a KernelHeap<E>);

impl<E: ExpandHeap> HeapAccess<HEAP_CHUNK_SIZE> for Locked<'_, E> {
    fn with_heap<R>(&mut self, f: impl FnOnce(&mut InnerHeap) -> R) -> Option<R> {
        let mut guard = self.0.lock_heap();
        guard.heap.as_mut().map(f)
    }
}

impl<E: ExpandHeap> KernelHeap<E> {
    /// 创建尚未初始化的内核堆
    pub const fn new(expander: E) -> Self {
        Self {
            heap: SpinLock::new(None),
            expander,
            owner: AtomicUsize::new(NO_OWNER),
        }
    }

    /// 用启动时预留的内存初始化初始堆
    ///
    /// # Safety
    /// 同 [`super::Heap::new`]；只能调用一次。
    pub unsafe fn init(&self, memory: NonNull<u8>, size: usize, scrub: HeapScrub) {
        let mut guard = self.lock_heap();
        assert!(guard.heap.is_none(), "kernel heap initialized twice");
        // SAFETY: 调用者保证
        *guard.heap = Some(unsafe { SubHeaps::new(memory, size, scrub) });
        log::info!("MM: kernel heap initialized with {} bytes at {:p}", size, memory);
    }

    /// 扩展策略
    pub fn expander(&self) -> &E {
        &self.expander
    }

    fn lock_heap(&self) -> HeapGuard<'_> {
        let cpu = sync::arch_ops().cpu_id();
        if self.owner.load(Ordering::Acquire) == cpu {
            reentrancy("kernel heap re-entered on the same CPU");
        }
        let heap = self.heap.lock();
        self.owner.store(cpu, Ordering::Release);
        HeapGuard {
            owner: &self.owner,
            heap,
        }
    }

    /// 分配 `size` 字节，返回的指针按 16 字节对齐
    pub fn heap_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = allocate_expanding::<HEAP_CHUNK_SIZE, _, _>(&mut Locked(self), &self.expander, size);
        if ptr.is_none() {
            log::warn!("MM: kernel heap cannot satisfy {} bytes", size);
        }
        ptr
    }

    /// 释放
    ///
    /// # Safety
    /// `ptr` 必须是 [`Self::heap_allocate`] 返回且尚未释放的指针。
    pub unsafe fn heap_deallocate(&self, ptr: NonNull<u8>) {
        // SAFETY: 调用者保证
        unsafe { deallocate_returning::<HEAP_CHUNK_SIZE, _, _>(&mut Locked(self), &self.expander, ptr) }
    }

    /// (总字节数, 已分配字节数)
    pub fn usage(&self) -> (usize, usize) {
        let guard = self.lock_heap();
        guard
            .heap
            .as_ref()
            .map_or((0, 0), |heap| (heap.total_bytes(), heap.allocated_bytes()))
    }
}

impl<E: ExpandHeap> Drop for KernelHeap<E> {
    fn drop(&mut self) {
        if let Some(heap) = self.heap.get_mut().as_mut() {
            heap.release_all(&self.expander);
        }
    }
}

// 超过 16 字节的对齐：多分配 `align` 字节，把原始指针存在对齐后指针的前一个字里
unsafe impl<E: ExpandHeap + Sync> GlobalAlloc for KernelHeap<E> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= HEADER_SIZE {
            return self.heap_allocate(layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr);
        }
        let Some(size) = layout.size().checked_add(layout.align()) else {
            return ptr::null_mut();
        };
        let Some(raw) = self.heap_allocate(size) else {
            return ptr::null_mut();
        };
        let raw = raw.as_ptr();
        let mut offset = raw.align_offset(layout.align());
        if offset == 0 {
            offset = layout.align();
        }
        // SAFETY: offset 至少 16 且不超过 align，对齐后的指针和回指都在分配内
        unsafe {
            let aligned = raw.add(offset);
            (aligned as *mut *mut u8).sub(1).write(raw);
            aligned
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let raw = if layout.align() <= HEADER_SIZE {
            ptr
        } else {
            // SAFETY: alloc 在对齐指针前存了原始指针
            unsafe { (ptr as *const *mut u8).sub(1).read() }
        };
        if let Some(raw) = NonNull::new(raw) {
            // SAFETY: GlobalAlloc 的调用约定保证指针来自 alloc
            unsafe { self.heap_deallocate(raw) };
        }
    }
}
