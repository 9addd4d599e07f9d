//! 地址空间
//!
//! 地址空间拥有一棵页表和一组互不重叠的区域。页表集合和区域表放在同一把锁下，
//! 不同地址空间可以并发修改，只在需要物理帧时竞争全局锁。
//! 加锁顺序固定为：全局锁，然后地址空间锁。

use alloc::collections::BTreeMap;

use sync::{SpinLock, SpinLockGuard};

use super::region::{Access, Region};
use crate::address::{Paddr, Ppn, Vaddr, VaddrRange};
use crate::page_table::{PageTables, SpaceKind};

/// 地址空间锁保护的内容
pub struct SpaceInner {
    /// 页表集合
    pub tables: PageTables,
    /// 区域，按起始地址索引
    pub regions: BTreeMap<Vaddr, Region>,
}

impl SpaceInner {
    /// 包含 `vaddr` 的区域
    pub fn region_containing(&self, vaddr: Vaddr) -> Option<&Region> {
        find_region(&self.regions, vaddr)
    }

    /// 与 `range` 重叠的区域是否存在
    pub fn overlaps(&self, range: &VaddrRange) -> bool {
        self.regions.values().any(|region| region.range().overlaps(range))
    }
}

/// 在区域表中查找包含 `vaddr` 的区域
pub fn find_region(regions: &BTreeMap<Vaddr, Region>, vaddr: Vaddr) -> Option<&Region> {
    regions
        .range(..=vaddr)
        .next_back()
        .map(|(_, region)| region)
        .filter(|region| region.range().contains(vaddr))
}

/// 可变版本的 [`find_region`]
pub fn find_region_mut(regions: &mut BTreeMap<Vaddr, Region>, vaddr: Vaddr) -> Option<&mut Region> {
    regions
        .range_mut(..=vaddr)
        .next_back()
        .map(|(_, region)| region)
        .filter(|region| region.range().contains(vaddr))
}

/// 地址空间
pub struct AddressSpace {
    root: Ppn,
    kind: SpaceKind,
    inner: SpinLock<SpaceInner>,
}

impl AddressSpace {
    pub(crate) fn new(tables: PageTables) -> Self {
        Self {
            root: tables.root(),
            kind: tables.kind(),
            inner: SpinLock::new(SpaceInner {
                tables,
                regions: BTreeMap::new(),
            }),
        }
    }

    /// 根页表
    pub fn root(&self) -> Ppn {
        self.root
    }

    /// 根页表的物理地址，即装入 CR3 的值
    pub fn root_paddr(&self) -> Paddr {
        self.root.start_addr()
    }

    /// 地址空间种类
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// 锁住地址空间
    pub fn lock(&self) -> SpinLockGuard<'_, SpaceInner> {
        self.inner.lock()
    }

    pub(crate) fn into_inner(self) -> SpaceInner {
        self.inner.into_inner()
    }

    /// 包含 `vaddr` 的区域的范围与权限
    pub fn region_at(&self, vaddr: Vaddr) -> Option<(VaddrRange, Access)> {
        self.lock()
            .region_containing(vaddr)
            .map(|region| (region.range(), region.access()))
    }

    /// 区域数量
    pub fn region_count(&self) -> usize {
        self.lock().regions.len()
    }

    /// 拥有的非根页表数量
    pub fn table_count(&self) -> usize {
        self.lock().tables.len()
    }
}
