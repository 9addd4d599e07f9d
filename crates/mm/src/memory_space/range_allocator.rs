//! 虚拟地址范围分配器
//!
//! 首次适配，空闲区间按地址升序保存，归还时与相邻区间合并。

use alloc::vec;
use alloc::vec::Vec;

use crate::address::{AlignOps, Vaddr, VaddrRange};
use crate::error::corruption;

/// 虚拟地址范围分配器
#[derive(Debug)]
pub struct RangeAllocator {
    total: VaddrRange,
    free: Vec<VaddrRange>,
}

impl RangeAllocator {
    /// 管理 `total` 整个范围
    pub fn new(total: VaddrRange) -> Self {
        Self {
            total,
            free: vec![total],
        }
    }

    /// 管理的范围
    pub fn total(&self) -> VaddrRange {
        self.total
    }

    /// 剩余字节数
    pub fn free_bytes(&self) -> usize {
        self.free.iter().map(VaddrRange::size).sum()
    }

    /// 分配 `size` 字节，起点按 `align` 对齐
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<VaddrRange> {
        if size == 0 {
            return None;
        }
        let (index, start) = self.free.iter().enumerate().find_map(|(i, range)| {
            let start = range.start.align_up(align);
            let end = start.0.checked_add(size)?;
            (start < range.end && end <= range.end.0).then_some((i, start))
        })?;
        let wanted = VaddrRange::from_start_len(start, size);
        self.carve(index, wanted);
        Some(wanted)
    }

    /// 分配指定的范围，范围不完全空闲时失败
    pub fn allocate_specific(&mut self, wanted: VaddrRange) -> bool {
        if wanted.is_empty() {
            return false;
        }
        match self.free.iter().position(|r| r.contains_range(&wanted)) {
            Some(index) => {
                self.carve(index, wanted);
                true
            }
            None => false,
        }
    }

    fn carve(&mut self, index: usize, wanted: VaddrRange) {
        let range = self.free.remove(index);
        let mut at = index;
        if range.start < wanted.start {
            self.free.insert(at, VaddrRange::new(range.start, wanted.start));
            at += 1;
        }
        if wanted.end < range.end {
            self.free.insert(at, VaddrRange::new(wanted.end, range.end));
        }
    }

    /// 归还范围
    ///
    /// # Panics
    /// 范围越界或与空闲区间重叠视为记账损坏。
    pub fn deallocate(&mut self, range: VaddrRange) {
        if !self.total.contains_range(&range) || self.free.iter().any(|r| r.overlaps(&range)) {
            corruption("virtual range returned twice or outside its allocator");
        }
        let index = self.free.partition_point(|r| r.start < range.start);
        self.free.insert(index, range);
        if index + 1 < self.free.len() && self.free[index].end == self.free[index + 1].start {
            self.free[index].end = self.free[index + 1].end;
            self.free.remove(index + 1);
        }
        if index > 0 && self.free[index - 1].end == self.free[index].start {
            self.free[index - 1].end = self.free[index].end;
            self.free.remove(index);
        }
    }

    /// `vaddr` 是否在管理范围内
    pub fn manages(&self, vaddr: Vaddr) -> bool {
        self.total.contains(vaddr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: usize, end: usize) -> VaddrRange {
        VaddrRange::new(Vaddr::new(start), Vaddr::new(end))
    }

    #[test]
    fn first_fit_splits_and_merges_back() {
        let mut ranges = RangeAllocator::new(range(0x1000, 0x10000));
        let a = ranges.allocate(0x2000, 0x1000).expect("a");
        let b = ranges.allocate(0x1000, 0x4000).expect("b");
        assert_eq!(a, range(0x1000, 0x3000));
        assert_eq!(b, range(0x4000, 0x5000));
        assert_eq!(ranges.free_bytes(), 0xf000 - 0x3000);

        ranges.deallocate(a);
        ranges.deallocate(b);
        assert_eq!(ranges.free, vec![range(0x1000, 0x10000)]);
    }

    #[test]
    fn specific_allocation_requires_a_free_range() {
        let mut ranges = RangeAllocator::new(range(0, 0x8000));
        assert!(ranges.allocate_specific(range(0x2000, 0x3000)));
        assert!(!ranges.allocate_specific(range(0x2000, 0x4000)));
        assert_eq!(ranges.allocate(0x3000, 0x1000), Some(range(0x3000, 0x6000)));
    }
}
