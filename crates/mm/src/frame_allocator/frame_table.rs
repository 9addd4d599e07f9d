//! 帧元数据数组
//!
//! 以物理页号为下标的定长数组，大小取决于最高的可用物理地址，
//! 提供 O(1) 的帧到元数据查找。数组本身放在从物理内存中切出的帧里，
//! 通过启动阶段的永久映射访问。

use core::sync::atomic::{AtomicU32, Ordering};

use crate::address::{Ppn, PpnRange, UsizeConvert};
use crate::config::PAGE_SIZE;

/// 单个帧的元数据
#[repr(C)]
pub struct FrameEntry {
    ref_count: AtomicU32,
    /// 0 表示不受任何区域管理，否则为区域编号加一
    owner: AtomicU32,
}

impl FrameEntry {
    /// 当前引用计数
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// 所属区域编号，未受管理时为 `None`
    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id - 1),
        }
    }

    pub(super) fn set_owner(&self, region: u32) {
        self.owner.store(region + 1, Ordering::Relaxed);
    }

    pub(super) fn reset(&self, count: u32) {
        self.ref_count.store(count, Ordering::Release);
    }

    pub(super) fn increment(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel)
    }

    pub(super) fn decrement(&self) -> u32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel)
    }
}

/// 帧元数据数组
pub struct FrameTable {
    entries: *const FrameEntry,
    len: usize,
    backing: PpnRange,
}

// Safety: 元数据只通过原子操作修改
unsafe impl Send for FrameTable {}
unsafe impl Sync for FrameTable {}

impl FrameTable {
    /// 覆盖 `count` 个物理页所需的帧数
    pub const fn frames_needed(count: usize) -> usize {
        (count * core::mem::size_of::<FrameEntry>()).div_ceil(PAGE_SIZE)
    }

    /// 在 `memory` 处构建数组并清零
    ///
    /// # Safety
    /// `memory` 必须指向 `backing` 这些帧的永久映射，且至少能容纳 `len` 项。
    pub unsafe fn new(memory: *mut u8, len: usize, backing: PpnRange) -> Self {
        debug_assert!(Self::frames_needed(len) <= backing.len());
        // SAFETY: 调用者保证内存有效且独占
        unsafe { core::ptr::write_bytes(memory, 0, backing.len() * PAGE_SIZE) };
        Self {
            entries: memory as *const FrameEntry,
            len,
            backing,
        }
    }

    /// 数组覆盖的物理页数
    pub fn len(&self) -> usize {
        self.len
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 数组占用的物理帧
    pub fn backing(&self) -> PpnRange {
        self.backing
    }

    /// 查找帧的元数据
    pub fn entry(&self, ppn: Ppn) -> Option<&FrameEntry> {
        let idx = ppn.as_usize();
        if idx >= self.len {
            return None;
        }
        // SAFETY: 下标已检查，数组在内核生命周期内有效
        Some(unsafe { &*self.entries.add(idx) })
    }
}
