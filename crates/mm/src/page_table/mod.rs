//! 页表管理
//!
//! - [`entry`]：页表项格式
//! - [`quickmap`]：按 CPU 的临时映射槽，所有页表内容都经它访问
//! - [`manager`]：确保/释放表项、查找、销毁整棵页表
//!
//! 每个地址空间用一张 [`PageTables`] 记录自己拥有的全部非根页表，
//! 键是 (级别, 该页表覆盖区间的起点)。页表树本身只能经 quickmap 访问，
//! 这张表让销毁、级联释放和写时复制都不必遍历物理页表。

mod entry;
mod manager;
mod quickmap;

use alloc::collections::BTreeMap;

pub use entry::{PageTableEntry, PteFlags};
pub use manager::PageTableManager;
pub use quickmap::{EntryRef, Quickmap, QuickmapGuard, SlotKind};

use crate::address::{Paddr, Ppn, Vaddr};

/// 地址空间种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// 内核地址空间，只有一个
    Kernel,
    /// 用户地址空间
    User,
}

/// 页表在地址空间中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableKey {
    /// 级别：0 = PT，1 = PD，2 = PDPT
    pub level: u8,
    /// 该页表覆盖的虚拟区间起点
    pub base: Vaddr,
}

impl TableKey {
    /// 覆盖 `vaddr` 的第 `level` 级页表
    pub const fn covering(vaddr: Vaddr, level: usize) -> Self {
        Self {
            level: level as u8,
            base: vaddr.table_base(level),
        }
    }
}

/// 一个地址空间拥有的页表
#[derive(Debug)]
pub struct PageTables {
    root: Ppn,
    kind: SpaceKind,
    tables: BTreeMap<TableKey, Ppn>,
}

impl PageTables {
    /// 只有根页表的空集合
    pub fn new(root: Ppn, kind: SpaceKind) -> Self {
        Self {
            root,
            kind,
            tables: BTreeMap::new(),
        }
    }

    /// 根页表
    pub fn root(&self) -> Ppn {
        self.root
    }

    /// 地址空间种类
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// TLB 刷新时使用的根页表过滤条件。内核地址对所有 CPU 生效，返回 `None`。
    pub fn flush_root(&self) -> Option<Paddr> {
        match self.kind {
            SpaceKind::Kernel => None,
            SpaceKind::User => Some(self.root.start_addr()),
        }
    }

    /// 非根页表中的目录项标志
    pub fn directory_flags(&self) -> PteFlags {
        match self.kind {
            SpaceKind::Kernel => PteFlags::PRESENT | PteFlags::WRITABLE,
            SpaceKind::User => PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
        }
    }

    /// 查找页表
    pub fn get(&self, key: TableKey) -> Option<Ppn> {
        self.tables.get(&key).copied()
    }

    /// 覆盖 `vaddr` 的叶子页表
    pub fn leaf_for(&self, vaddr: Vaddr) -> Option<Ppn> {
        self.get(TableKey::covering(vaddr, 0))
    }

    /// 非根页表的数量
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// 是否只有根页表
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// 按 (级别, 起点) 升序遍历，叶子页表在前
    pub fn iter(&self) -> impl Iterator<Item = (TableKey, Ppn)> + '_ {
        self.tables.iter().map(|(k, v)| (*k, *v))
    }

    /// 遍历叶子页表，返回 (覆盖起点, 页表)
    pub fn leaves(&self) -> impl Iterator<Item = (Vaddr, Ppn)> + '_ {
        self.iter()
            .take_while(|(key, _)| key.level == 0)
            .map(|(key, ppn)| (key.base, ppn))
    }

    pub(crate) fn insert(&mut self, key: TableKey, table: Ppn) -> Option<Ppn> {
        self.tables.insert(key, table)
    }

    pub(crate) fn remove(&mut self, key: TableKey) -> Option<Ppn> {
        self.tables.remove(&key)
    }

    pub(crate) fn into_parts(self) -> (Ppn, BTreeMap<TableKey, Ppn>) {
        (self.root, self.tables)
    }
}
