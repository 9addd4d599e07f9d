//! 分块堆
//!
//! 内存布局：
//!
//! ```text
//! +-------------------------------+----------------+
//! | total_chunks * CHUNK 字节分块   | 占用位图        |
//! +-------------------------------+----------------+
//! ```
//!
//! 每次分配占用连续若干分块，第一个分块以 16 字节的分配头开始，
//! 记录本次分配的分块数，释放时只需要指针。

use core::ptr::NonNull;

use super::{HEADER_SIZE, HeapScrub};
use crate::config::BEST_FIT_THRESHOLD;
use crate::error::corruption;

#[repr(C)]
struct AllocationHeader {
    size_in_chunks: usize,
    _alignment: usize,
}

const _: () = assert!(core::mem::size_of::<AllocationHeader>() == HEADER_SIZE);

/// 分块堆
pub struct Heap<const CHUNK: usize> {
    chunks: *mut u8,
    total_chunks: usize,
    allocated_chunks: usize,
    scrub: HeapScrub,
}

// Safety: 堆独占它管理的内存
unsafe impl<const CHUNK: usize> Send for Heap<CHUNK> {}

impl<const CHUNK: usize> Heap<CHUNK> {
    const VALID_CHUNK: () = assert!(CHUNK >= HEADER_SIZE && CHUNK.is_power_of_two());

    /// `memory_size` 字节能容纳的分块数（每个分块另需 1 位位图）
    pub const fn calculate_chunks(memory_size: usize) -> usize {
        (memory_size * 8) / (CHUNK * 8 + 1)
    }

    /// 一次 `bytes` 字节的分配所需的内存（含分配头和位图）
    pub const fn calculate_memory_for_bytes(bytes: usize) -> usize {
        let chunks = (HEADER_SIZE + bytes).div_ceil(CHUNK);
        chunks * CHUNK + chunks.div_ceil(8)
    }

    /// 在 `memory` 上建立堆
    ///
    /// # Safety
    /// `memory` 必须按 [`HEADER_SIZE`] 对齐，`memory_size` 字节在堆的生命周期内有效且独占。
    pub unsafe fn new(memory: NonNull<u8>, memory_size: usize, scrub: HeapScrub) -> Self {
        let () = Self::VALID_CHUNK;
        let total_chunks = Self::calculate_chunks(memory_size);
        let heap = Self {
            chunks: memory.as_ptr(),
            total_chunks,
            allocated_chunks: 0,
            scrub,
        };
        debug_assert!(total_chunks * CHUNK + total_chunks.div_ceil(8) <= memory_size);
        // SAFETY: 位图在调用者提供的内存之内
        unsafe { core::ptr::write_bytes(heap.bitmap_ptr(), 0, total_chunks.div_ceil(8)) };
        heap
    }

    fn bitmap_ptr(&self) -> *mut u8 {
        // SAFETY: 位图紧跟在分块之后
        unsafe { self.chunks.add(self.total_chunks * CHUNK) }
    }

    fn bitmap(&self) -> &[u8] {
        // SAFETY: 位图长度由构造函数确定
        unsafe { core::slice::from_raw_parts(self.bitmap_ptr(), self.total_chunks.div_ceil(8)) }
    }

    fn bitmap_mut(&mut self) -> &mut [u8] {
        // SAFETY: 同上
        unsafe { core::slice::from_raw_parts_mut(self.bitmap_ptr(), self.total_chunks.div_ceil(8)) }
    }

    fn is_used(&self, chunk: usize) -> bool {
        self.bitmap()[chunk / 8] & (1 << (chunk % 8)) != 0
    }

    fn set_range(&mut self, start: usize, count: usize, used: bool) {
        let bitmap = self.bitmap_mut();
        for chunk in start..start + count {
            let mask = 1 << (chunk % 8);
            if (bitmap[chunk / 8] & mask != 0) == used {
                corruption("heap bitmap bit already in the requested state");
            }
            bitmap[chunk / 8] ^= mask;
        }
    }

    /// 依次产出空闲段 (起点, 长度)
    fn free_runs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut chunk = 0;
        core::iter::from_fn(move || {
            while chunk < self.total_chunks && self.is_used(chunk) {
                chunk += 1;
            }
            if chunk >= self.total_chunks {
                return None;
            }
            let start = chunk;
            while chunk < self.total_chunks && !self.is_used(chunk) {
                chunk += 1;
            }
            Some((start, chunk - start))
        })
    }

    fn find_first_fit(&self, count: usize) -> Option<usize> {
        self.free_runs()
            .find(|&(_, len)| len >= count)
            .map(|(start, _)| start)
    }

    fn find_best_fit(&self, count: usize) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (start, len) in self.free_runs().filter(|&(_, len)| len >= count) {
            if len == count {
                return Some(start);
            }
            if best.is_none_or(|(_, best_len)| len < best_len) {
                best = Some((start, len));
            }
        }
        best.map(|(start, _)| start)
    }

    /// 分配至少 `size` 字节，返回的指针按 16 字节对齐。空间不足时不修改位图。
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let real_size = size.checked_add(HEADER_SIZE)?;
        let needed = real_size.div_ceil(CHUNK);
        if needed > self.free_chunks() {
            return None;
        }
        let first = if needed < BEST_FIT_THRESHOLD {
            self.find_first_fit(needed)
        } else {
            self.find_best_fit(needed)
        }?;

        self.set_range(first, needed, true);
        self.allocated_chunks += needed;
        // SAFETY: 分块在堆内，且刚刚标记为占用
        unsafe {
            let header = self.chunks.add(first * CHUNK) as *mut AllocationHeader;
            header.write(AllocationHeader {
                size_in_chunks: needed,
                _alignment: 0,
            });
            let data = header.add(1) as *mut u8;
            if let Some(byte) = self.scrub.on_allocate {
                core::ptr::write_bytes(data, byte, needed * CHUNK - HEADER_SIZE);
            }
            NonNull::new(data)
        }
    }

    /// 释放
    ///
    /// # Safety
    /// `ptr` 必须是本堆 [`Self::allocate`] 返回且尚未释放的指针。
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        if !self.contains(ptr.as_ptr()) {
            corruption("heap pointer freed to a heap that does not contain it");
        }
        // SAFETY: 调用者保证 ptr 前面是分配头
        let header = unsafe { (ptr.as_ptr() as *mut AllocationHeader).sub(1) };
        let offset = header as usize - self.chunks as usize;
        if offset % CHUNK != 0 {
            corruption("heap pointer is not at a chunk boundary");
        }
        let start = offset / CHUNK;
        // SAFETY: 同上
        let count = unsafe { (*header).size_in_chunks };
        if !self.is_used(start) || count == 0 || start + count > self.total_chunks {
            corruption("heap allocation header is damaged");
        }
        if self.allocated_chunks < count {
            corruption("heap frees more chunks than are allocated");
        }
        self.set_range(start, count, false);
        self.allocated_chunks -= count;
        if let Some(byte) = self.scrub.on_free {
            // SAFETY: 这些分块刚刚归还
            unsafe { core::ptr::write_bytes(header as *mut u8, byte, count * CHUNK) };
        }
    }

    /// 指针是否落在本堆的分块区域内
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.chunks as usize + HEADER_SIZE;
        let end = self.chunks as usize + self.total_chunks * CHUNK;
        (start..end).contains(&(ptr as usize))
    }

    /// 管理的内存起点
    pub fn memory(&self) -> *mut u8 {
        self.chunks
    }

    /// 分块总数
    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// 分块总字节数
    pub fn total_bytes(&self) -> usize {
        self.total_chunks * CHUNK
    }

    /// 空闲分块数
    pub fn free_chunks(&self) -> usize {
        self.total_chunks - self.allocated_chunks
    }

    /// 空闲字节数
    pub fn free_bytes(&self) -> usize {
        self.free_chunks() * CHUNK
    }

    /// 已分配分块数
    pub fn allocated_chunks(&self) -> usize {
        self.allocated_chunks
    }

    /// 已分配字节数
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_chunks * CHUNK
    }
}
