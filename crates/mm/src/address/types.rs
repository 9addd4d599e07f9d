//! 物理地址与虚拟地址类型

use crate::address::operations::UsizeConvert;
use crate::config::{ENTRIES_PER_TABLE, PAGE_SHIFT, PAGE_SIZE};

/// 物理地址
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Paddr(pub usize);
crate::impl_usize_newtype!(Paddr);

/// 虚拟地址
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Vaddr(pub usize);
crate::impl_usize_newtype!(Vaddr);

impl Paddr {
    /// 创建物理地址
    pub const fn new(value: usize) -> Self {
        Self(value)
    }
}

impl Vaddr {
    /// 创建虚拟地址
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// 第 `level` 级页表中的索引（0 = PT，3 = PML4）
    #[inline]
    pub const fn table_index(self, level: usize) -> usize {
        (self.0 >> (PAGE_SHIFT + 9 * level)) & (ENTRIES_PER_TABLE - 1)
    }

    /// 第 `level` 级页表中一项所覆盖的字节数
    #[inline]
    pub const fn entry_coverage(level: usize) -> usize {
        PAGE_SIZE << (9 * level)
    }

    /// 向下对齐到第 `level` 级页表的覆盖范围（即该页表本身覆盖的区间起点）
    #[inline]
    pub const fn table_base(self, level: usize) -> Vaddr {
        let span = Self::entry_coverage(level + 1);
        Vaddr(self.0 & !(span - 1))
    }
}

/// 虚拟地址半开区间 `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VaddrRange {
    /// 起始地址（包含）
    pub start: Vaddr,
    /// 结束地址（不包含）
    pub end: Vaddr,
}

impl VaddrRange {
    /// 创建区间
    pub const fn new(start: Vaddr, end: Vaddr) -> Self {
        Self { start, end }
    }

    /// 从起始地址和长度创建区间
    pub fn from_start_len(start: Vaddr, len: usize) -> Self {
        Self {
            start,
            end: Vaddr(start.as_usize() + len),
        }
    }

    /// 区间字节数
    pub fn size(&self) -> usize {
        self.end.as_usize() - self.start.as_usize()
    }

    /// 区间覆盖的页数
    pub fn page_count(&self) -> usize {
        self.size().div_ceil(PAGE_SIZE)
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// 是否包含地址
    pub fn contains(&self, addr: Vaddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// 是否完整包含另一个区间
    pub fn contains_range(&self, other: &Self) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// 是否与另一个区间重叠（相邻不算重叠）
    pub fn overlaps(&self, other: &Self) -> bool {
        !(self.end <= other.start || self.start >= other.end)
    }

    /// 按页迭代起始地址
    pub fn pages(&self) -> impl Iterator<Item = Vaddr> + use<> {
        let start = self.start.as_usize();
        let end = self.end.as_usize();
        (start..end).step_by(PAGE_SIZE).map(Vaddr)
    }
}

/// 物理地址半开区间 `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PaddrRange {
    /// 起始地址（包含）
    pub start: Paddr,
    /// 结束地址（不包含）
    pub end: Paddr,
}

impl PaddrRange {
    /// 创建区间
    pub const fn new(start: Paddr, end: Paddr) -> Self {
        Self { start, end }
    }

    /// 从起始地址和长度创建区间
    pub const fn from_start_len(start: Paddr, len: usize) -> Self {
        Self {
            start,
            end: Paddr(start.0 + len),
        }
    }

    /// 区间字节数
    pub const fn size(&self) -> usize {
        self.end.0.saturating_sub(self.start.0)
    }

    /// 是否为空
    pub const fn is_empty(&self) -> bool {
        self.start.0 >= self.end.0
    }

    /// 是否包含地址
    pub fn contains(&self, addr: Paddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// 是否与另一个区间重叠（相邻不算重叠）
    pub fn overlaps(&self, other: &Self) -> bool {
        !(self.end <= other.start || self.start >= other.end)
    }

    /// 是否完整包含另一个区间
    pub fn contains_range(&self, other: &Self) -> bool {
        other.start >= self.start && other.end <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AlignOps;

    #[test]
    fn table_indices_follow_x86_64_layout() {
        let v = Vaddr::new(0xffff_8000_4020_3123);
        assert_eq!(v.table_index(3), 256);
        assert_eq!(v.table_index(2), 1);
        assert_eq!(v.table_index(1), 1);
        assert_eq!(v.table_index(0), 3);
        assert_eq!(v.page_offset(), 0x123);
        assert_eq!(v.table_base(0), Vaddr::new(0xffff_8000_4020_0000));
    }

    #[test]
    fn range_overlap_is_half_open() {
        let a = VaddrRange::new(Vaddr(0x1000), Vaddr(0x3000));
        let b = VaddrRange::new(Vaddr(0x3000), Vaddr(0x4000));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&VaddrRange::new(Vaddr(0x2fff), Vaddr(0x3001))));
        assert_eq!(a.pages().count(), 2);
    }
}
