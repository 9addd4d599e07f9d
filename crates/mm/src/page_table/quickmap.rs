//! quickmap：按 CPU 划分的临时映射槽
//!
//! 每个 CPU 在 `quickmap_base` 之上拥有两个相邻的虚拟页：
//!
//! | 槽位              | 地址                                   | 用途                     |
//! |-------------------|----------------------------------------|--------------------------|
//! | [`SlotKind::Page`]  | `base + (2 * cpu) * PAGE_SIZE`         | 清零、复制任意物理帧     |
//! | [`SlotKind::Table`] | `base + (2 * cpu + 1) * PAGE_SIZE`     | 页表遍历时的页表窗口     |
//!
//! 两类槽位分开，页表遍历中途分配新页表并清零时不会互相覆盖。
//! 槽位的页表项集中在启动时建立的一张内核页表里，经启动阶段的永久映射直接改写。
//!
//! 守卫在存活期间保持本地中断关闭并持有槽位锁，drop 时撤销映射并失效本地 TLB。
//! 同一 CPU 上对同一槽位的嵌套使用是致命错误。

use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};

use sync::{IntrGuard, SpinLock, SpinLockGuard};

use super::entry::{PageTableEntry, PteFlags};
use crate::address::{Paddr, Ppn, Vaddr};
use crate::arch_ops::ArchMmOps;
use crate::config::{ENTRIES_PER_TABLE, PAGE_SIZE};
use crate::error::{corruption, reentrancy};

/// 槽位种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// 访问任意帧内容
    Page = 0,
    /// 访问页表
    Table = 1,
}

/// 所有 CPU 的 quickmap 槽位
pub struct Quickmap {
    arch: &'static dyn ArchMmOps,
    base: Vaddr,
    slot_table: Paddr,
    slots: Vec<SpinLock<Option<Ppn>>>,
}

impl Quickmap {
    /// 创建槽位集合，`slot_table` 是覆盖 `base` 起 2 MiB 的页表
    pub fn new(arch: &'static dyn ArchMmOps, base: Vaddr, slot_table: Paddr, cpus: usize) -> Self {
        assert!(
            base.table_index(0) + cpus * 2 <= ENTRIES_PER_TABLE,
            "quickmap slots must fit in one page table"
        );
        let slots = (0..cpus * 2).map(|_| SpinLock::new(None)).collect();
        Self {
            arch,
            base,
            slot_table,
            slots,
        }
    }

    /// 槽位所在的页表
    pub fn slot_table(&self) -> Paddr {
        self.slot_table
    }

    /// 槽位的虚拟地址
    pub fn slot_vaddr(&self, cpu: usize, kind: SlotKind) -> Vaddr {
        self.base + (cpu * 2 + kind as usize) * PAGE_SIZE
    }

    fn slot_entry(&self, index: usize) -> *mut PageTableEntry {
        let table = self.arch.phys_to_virt(self.slot_table) as *mut PageTableEntry;
        // SAFETY: index < 512，由构造函数的断言保证
        unsafe { table.add(self.base.table_index(0) + index) }
    }

    fn install(&self, index: usize, vaddr: Vaddr, ppn: Ppn) {
        let new = PageTableEntry::new(ppn, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::NO_EXECUTE);
        let entry = self.slot_entry(index);
        // SAFETY: 槽位页表项只由持有该槽位锁的 CPU 修改
        unsafe {
            if entry.read_volatile() != new {
                entry.write_volatile(new);
                self.arch.invalidate_page(vaddr);
            }
        }
    }

    fn uninstall(&self, index: usize, vaddr: Vaddr) {
        // SAFETY: 同 install
        unsafe { self.slot_entry(index).write_volatile(PageTableEntry::EMPTY) };
        self.arch.invalidate_page(vaddr);
    }

    /// 把物理帧映射到当前 CPU 的槽位
    ///
    /// # Panics
    /// 当前 CPU 的同类槽位已在使用中（嵌套 quickmap）。
    pub fn map(&self, ppn: Ppn, kind: SlotKind) -> QuickmapGuard<'_> {
        let irq = IntrGuard::new();
        let cpu = self.arch.cpu_id();
        let index = cpu * 2 + kind as usize;
        let Some(slot) = self.slots.get(index) else {
            corruption("quickmap requested on a CPU without slots");
        };
        // 中断已关闭，同一 CPU 上只可能是嵌套使用
        let Some(mut lock) = slot.try_lock() else {
            reentrancy("nested quickmap on the same CPU slot");
        };
        let vaddr = self.slot_vaddr(cpu, kind);
        self.install(index, vaddr, ppn);
        *lock = Some(ppn);
        let ptr = self.arch.virt_ptr(vaddr);
        QuickmapGuard {
            quickmap: self,
            index,
            vaddr,
            ppn,
            ptr,
            slot_lock: lock,
            _irq: irq,
        }
    }
}

/// quickmap 守卫，drop 时撤销映射
pub struct QuickmapGuard<'a> {
    quickmap: &'a Quickmap,
    index: usize,
    vaddr: Vaddr,
    ppn: Ppn,
    ptr: *mut u8,
    // 先释放槽位锁，再恢复中断
    slot_lock: SpinLockGuard<'a, Option<Ppn>>,
    _irq: IntrGuard,
}

impl QuickmapGuard<'_> {
    /// 当前映射的帧
    pub fn ppn(&self) -> Ppn {
        self.ppn
    }

    /// 槽位虚拟地址
    pub fn vaddr(&self) -> Vaddr {
        self.vaddr
    }

    /// 映射的起始指针
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// 把槽位改指向另一帧，不释放槽位
    pub fn remap(&mut self, ppn: Ppn) {
        if ppn == self.ppn {
            return;
        }
        self.quickmap.install(self.index, self.vaddr, ppn);
        self.ppn = ppn;
        *self.slot_lock = Some(ppn);
        self.ptr = self.quickmap.arch.virt_ptr(self.vaddr);
    }

    /// 帧内容
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: 槽位映射了一整页，且在守卫存活期间独占
        unsafe { core::slice::from_raw_parts(self.ptr, PAGE_SIZE) }
    }

    /// 可写的帧内容
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: 同上
        unsafe { core::slice::from_raw_parts_mut(self.ptr, PAGE_SIZE) }
    }

    /// 把帧视为页表
    pub fn entries(&self) -> &[PageTableEntry] {
        // SAFETY: 帧按页对齐，恰好容纳 512 个 8 字节表项
        unsafe { core::slice::from_raw_parts(self.ptr as *const PageTableEntry, ENTRIES_PER_TABLE) }
    }

    /// 把帧视为可写的页表
    pub fn entries_mut(&mut self) -> &mut [PageTableEntry] {
        // SAFETY: 同上
        unsafe { core::slice::from_raw_parts_mut(self.ptr as *mut PageTableEntry, ENTRIES_PER_TABLE) }
    }

    /// 显式撤销映射
    pub fn unquickmap(self) {}
}

impl Drop for QuickmapGuard<'_> {
    fn drop(&mut self) {
        self.quickmap.uninstall(self.index, self.vaddr);
        *self.slot_lock = None;
    }
}

/// 页表中某一项的可变引用，持有页表窗口
pub struct EntryRef<'a> {
    window: QuickmapGuard<'a>,
    index: usize,
}

impl<'a> EntryRef<'a> {
    pub(super) fn new(window: QuickmapGuard<'a>, index: usize) -> Self {
        Self { window, index }
    }

    /// 表项所在的页表
    pub fn table(&self) -> Ppn {
        self.window.ppn()
    }

    /// 表项在页表中的下标
    pub fn index(&self) -> usize {
        self.index
    }

    /// 所在页表的全部表项
    pub fn siblings(&self) -> &[PageTableEntry] {
        self.window.entries()
    }
}

impl Deref for EntryRef<'_> {
    type Target = PageTableEntry;

    fn deref(&self) -> &PageTableEntry {
        &self.window.entries()[self.index]
    }
}

impl DerefMut for EntryRef<'_> {
    fn deref_mut(&mut self) -> &mut PageTableEntry {
        let index = self.index;
        &mut self.window.entries_mut()[index]
    }
}
