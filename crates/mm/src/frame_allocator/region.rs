//! 物理区域
//!
//! 一个物理区域是一段连续的物理帧，使用位图（bitmap）跟踪每一帧的分配状态：
//!
//! - **bitmap**：每个 bit 表示一个物理帧（0=空闲，1=已分配）
//! - **last_alloc_hint**：上次分配位置提示，利用局部性加速查找
//!
//! 分配流程：
//!
//! 1. 单帧分配：从 last_alloc_hint 开始循环查找第一个空闲位
//! 2. 连续帧分配：从对齐边界开始查找满足要求的连续空闲帧
//!
//! 区域只负责位图本身；提交（commit）记账由 [`super::PhysicalAllocator`] 在池级别维护。

use alloc::vec::Vec;

use crate::address::{Ppn, PpnRange, UsizeConvert};

/// 物理池的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// 普通池，服务页表、匿名内存和内核区域
    User,
    /// 内核保留池，服务需要物理连续的内核区域
    Super,
}

/// 物理区域
pub struct PhysicalRegion {
    /// 区域编号，也是帧元数据里 owner 字段减一的值
    id: u32,
    pool: PoolKind,
    range: PpnRange,
    /// 位图数据，使用 Vec<u64> 存储，利用 64 位操作优化查找。
    bitmap: Vec<u64>,
    used: usize,
    last_alloc_hint: usize,
}

impl PhysicalRegion {
    /// 创建区域，所有帧初始为空闲
    pub fn new(id: u32, pool: PoolKind, range: PpnRange) -> Self {
        let words = range.len().div_ceil(64);
        Self {
            id,
            pool,
            range,
            bitmap: alloc::vec![0u64; words],
            used: 0,
            last_alloc_hint: 0,
        }
    }

    /// 区域编号
    pub fn id(&self) -> u32 {
        self.id
    }

    /// 所属池
    pub fn pool(&self) -> PoolKind {
        self.pool
    }

    /// 覆盖的物理页范围
    pub fn range(&self) -> PpnRange {
        self.range
    }

    /// 总帧数
    pub fn size(&self) -> usize {
        self.range.len()
    }

    /// 已分配帧数
    pub fn used(&self) -> usize {
        self.used
    }

    /// 空闲帧数
    pub fn free(&self) -> usize {
        self.size() - self.used
    }

    /// 是否包含该帧
    pub fn contains(&self, ppn: Ppn) -> bool {
        self.range.contains(ppn)
    }

    #[inline]
    fn is_free(&self, frame_idx: usize) -> bool {
        let word_idx = frame_idx / 64;
        let bit_idx = frame_idx % 64;
        (self.bitmap[word_idx] & (1u64 << bit_idx)) == 0
    }

    #[inline]
    fn mark_allocated(&mut self, frame_idx: usize) {
        let word_idx = frame_idx / 64;
        let bit_idx = frame_idx % 64;
        self.bitmap[word_idx] |= 1u64 << bit_idx;
    }

    #[inline]
    fn mark_free(&mut self, frame_idx: usize) {
        let word_idx = frame_idx / 64;
        let bit_idx = frame_idx % 64;
        self.bitmap[word_idx] &= !(1u64 << bit_idx);
    }

    /// 该帧是否已分配
    pub fn is_allocated(&self, ppn: Ppn) -> bool {
        self.contains(ppn) && !self.is_free(ppn.as_usize() - self.range.start.as_usize())
    }

    /// 取出一个空闲帧
    pub fn take_free_frame(&mut self) -> Option<Ppn> {
        let bitmap_len = self.bitmap.len();
        if bitmap_len == 0 || self.free() == 0 {
            return None;
        }

        // 循环查找：[hint, end) + [0, hint)
        let start_idx = self.last_alloc_hint;
        for offset in 0..bitmap_len {
            let idx = (start_idx + offset) % bitmap_len;
            let word = self.bitmap[idx];

            // 快速跳过全满的 u64
            if word == u64::MAX {
                continue;
            }

            let bit_pos = (!word).trailing_zeros() as usize;
            let frame_idx = idx * 64 + bit_pos;
            // 最后一个字的高位不属于区域
            if frame_idx >= self.size() {
                continue;
            }

            self.mark_allocated(frame_idx);
            self.used += 1;
            self.last_alloc_hint = idx;
            return Some(self.range.start + frame_idx);
        }

        None
    }

    /// 取出 `count` 个连续空闲帧，起始帧号按 `align_pages` 对齐
    pub fn take_contiguous_free_frames(&mut self, count: usize, align_pages: usize) -> Option<Ppn> {
        if count == 0 || count > self.free() {
            return None;
        }
        debug_assert!(align_pages.is_power_of_two(), "Alignment must be power of 2");

        let base = self.range.start.as_usize();
        let total = self.size();
        let mut frame_idx = 0;
        while frame_idx < total {
            // 对齐的是物理页号而不是区域内下标
            let aligned_ppn = (base + frame_idx + align_pages - 1) & !(align_pages - 1);
            let aligned_idx = aligned_ppn - base;
            if aligned_idx + count > total {
                break;
            }

            match (0..count).find(|i| !self.is_free(aligned_idx + i)) {
                Some(busy) => frame_idx = aligned_idx + busy + 1,
                None => {
                    for i in 0..count {
                        self.mark_allocated(aligned_idx + i);
                    }
                    self.used += count;
                    return Some(self.range.start + aligned_idx);
                }
            }
        }

        None
    }

    /// 归还一个帧。帧不属于本区域或未被分配时返回 `Err`。
    pub fn return_frame(&mut self, ppn: Ppn) -> Result<(), &'static str> {
        if !self.contains(ppn) {
            return Err("frame returned to a region that does not contain it");
        }
        let frame_idx = ppn.as_usize() - self.range.start.as_usize();
        if self.is_free(frame_idx) {
            return Err("double free of physical frame");
        }
        self.mark_free(frame_idx);
        self.used -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_tracks_allocation_and_release() {
        let mut region = PhysicalRegion::new(0, PoolKind::User, PpnRange::from_start_len(Ppn(100), 70));
        let frames: Vec<Ppn> = (0..70).filter_map(|_| region.take_free_frame()).collect();
        assert_eq!(frames.len(), 70);
        assert_eq!(region.take_free_frame(), None);
        assert!(frames.iter().all(|f| region.contains(*f)));

        region.return_frame(Ppn(150)).expect("allocated frame");
        assert_eq!(region.return_frame(Ppn(150)), Err("double free of physical frame"));
        assert_eq!(region.take_free_frame(), Some(Ppn(150)));
        assert_eq!(region.used(), 70);
    }

    #[test]
    fn contiguous_allocation_respects_alignment() {
        let mut region = PhysicalRegion::new(0, PoolKind::Super, PpnRange::from_start_len(Ppn(3), 64));
        let first = region.take_contiguous_free_frames(4, 8).expect("room for 4");
        assert_eq!(first, Ppn(8));
        let second = region.take_contiguous_free_frames(8, 8).expect("room for 8");
        assert_eq!(second, Ppn(16));
        assert_eq!(region.used(), 12);
        assert!(region.take_contiguous_free_frames(64, 1).is_none());
    }
}
