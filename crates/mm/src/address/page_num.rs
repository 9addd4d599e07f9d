//! 页号类型
//!
//! 页号是地址右移 `PAGE_SHIFT` 后的索引。物理页号同时是帧元数据数组的下标。

use crate::address::operations::UsizeConvert;
use crate::address::types::{Paddr, Vaddr};
use crate::config::PAGE_SHIFT;

/// 物理页号
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ppn(pub usize);
crate::impl_usize_newtype!(Ppn);

/// 虚拟页号
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Vpn(pub usize);
crate::impl_usize_newtype!(Vpn);

impl Ppn {
    /// 包含该物理地址的页（向下取整）
    pub const fn from_addr_floor(addr: Paddr) -> Self {
        Self(addr.0 >> PAGE_SHIFT)
    }

    /// 页的起始物理地址
    pub const fn start_addr(self) -> Paddr {
        Paddr(self.0 << PAGE_SHIFT)
    }
}

impl Vpn {
    /// 包含该虚拟地址的页（向下取整）
    pub const fn from_addr_floor(addr: Vaddr) -> Self {
        Self(addr.0 >> PAGE_SHIFT)
    }

    /// 页的起始虚拟地址
    pub const fn start_addr(self) -> Vaddr {
        Vaddr(self.0 << PAGE_SHIFT)
    }
}

/// 物理页号半开区间 `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PpnRange {
    /// 起始页（包含）
    pub start: Ppn,
    /// 结束页（不包含）
    pub end: Ppn,
}

impl PpnRange {
    /// 创建区间
    pub const fn new(start: Ppn, end: Ppn) -> Self {
        Self { start, end }
    }

    /// 从起始页和页数创建区间
    pub fn from_start_len(start: Ppn, len: usize) -> Self {
        Self {
            start,
            end: Ppn::from_usize(start.as_usize() + len),
        }
    }

    /// 页数
    pub fn len(&self) -> usize {
        self.end.0.saturating_sub(self.start.0)
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否包含页
    pub fn contains(&self, ppn: Ppn) -> bool {
        ppn >= self.start && ppn < self.end
    }

    /// 按页迭代
    pub fn iter(&self) -> impl Iterator<Item = Ppn> + use<> {
        (self.start.0..self.end.0).map(Ppn)
    }
}
