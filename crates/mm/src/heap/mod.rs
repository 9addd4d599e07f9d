//! 内核堆
//!
//! - [`Heap`]：一块内存切成定长分块，分块占用情况记录在内存末尾的位图里
//! - [`ExpandableHeap`]：若干子堆组成的链表，耗尽时向扩展策略（[`ExpandHeap`]）要新内存
//! - [`KernelHeap`]：`GlobalAlloc` 前端，与 [`ExpandableHeap`] 共用同一套扩展流程，
//!   但扩展策略在堆锁之外运行
//! - [`KernelRegionExpander`]：用物理连续的内核区域扩展堆
//!
//! 堆从不移动或压缩已分配的内存。

mod chunk_heap;
mod expandable;
mod expander;
mod kernel_heap;

use core::ptr::NonNull;

pub use chunk_heap::Heap;
pub use expandable::ExpandableHeap;
pub use expander::KernelRegionExpander;
pub use kernel_heap::KernelHeap;

/// 分配头的大小，也是返回指针的对齐
pub const HEADER_SIZE: usize = 16;

/// 填充字节，用于暴露未初始化读取和释放后使用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapScrub {
    /// 分配时写入的字节
    pub on_allocate: Option<u8>,
    /// 释放时写入的字节
    pub on_free: Option<u8>,
}

impl HeapScrub {
    /// 不填充
    pub const NONE: Self = Self {
        on_allocate: None,
        on_free: None,
    };

    /// 调试构建使用的填充
    pub const DEBUG: Self = Self {
        on_allocate: Some(0xbb),
        on_free: Some(0xbd),
    };

    /// 按配置选择
    pub const fn enabled(enabled: bool) -> Self {
        if enabled { Self::DEBUG } else { Self::NONE }
    }
}

/// 交给堆管理的一块内存
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    /// 起始地址，至少按 [`HEADER_SIZE`] 对齐
    pub start: NonNull<u8>,
    /// 字节数
    pub size: usize,
}

// Safety: 内存块只是一个地址范围，访问由堆的锁保护
unsafe impl Send for MemoryBlock {}

/// 堆扩展策略
pub trait ExpandHeap {
    /// 提供一块新内存，至少能容纳一次 `request` 字节的分配
    fn add_memory(&self, request: usize) -> Option<MemoryBlock>;

    /// 收回一块已经空闲的内存；拒绝时返回 `false`，堆会继续保留它
    fn remove_memory(&self, block: MemoryBlock) -> bool;
}

/// 从不扩展的策略
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExpansion;

impl ExpandHeap for NoExpansion {
    fn add_memory(&self, _request: usize) -> Option<MemoryBlock> {
        None
    }

    fn remove_memory(&self, _block: MemoryBlock) -> bool {
        false
    }
}
