//! 页表管理器
//!
//! 负责页表树的结构性修改：按需创建中间页表、释放表项并级联回收空页表、
//! 查找、以及地址空间销毁时的整体回收。叶子表项内容的语义（映射什么、什么权限）
//! 由调用者决定。

use alloc::vec::Vec;

use log::{debug, info, warn};

use super::entry::PageTableEntry;
use super::quickmap::{EntryRef, Quickmap, QuickmapGuard, SlotKind};
use super::{PageTables, SpaceKind, TableKey};
use crate::address::{AlignOps, Ppn, Vaddr};
use crate::arch_ops::ArchMmOps;
use crate::config::{ENTRIES_PER_TABLE, KERNEL_ROOT_INDEX, MmConfig, PAGE_SIZE, PAGE_TABLE_LEVELS};
use crate::error::{MmError, MmResult, corruption};
use crate::frame_allocator::{PhysicalAllocator, PoolKind};
use crate::tlb::TlbCoordinator;

const ROOT_LEVEL: usize = PAGE_TABLE_LEVELS - 1;

/// 一次确保操作中新建的页表
#[derive(Clone, Copy)]
struct CreatedTable {
    key: TableKey,
    parent: Ppn,
    index: usize,
    table: Ppn,
}

/// 页表管理器
pub struct PageTableManager {
    arch: &'static dyn ArchMmOps,
    quickmap: Quickmap,
}

impl PageTableManager {
    /// 建立内核根页表
    ///
    /// 内核半区（根索引 256..512）的全部 PDPT 在这里一次建好，此后永不释放，
    /// 用户根页表复制这些根表项即可共享整个内核半区。
    /// quickmap 槽位所在的 PD 与 PT 也在这里建立。
    pub fn bootstrap(
        arch: &'static dyn ArchMmOps,
        config: &dyn MmConfig,
        pfa: &PhysicalAllocator,
    ) -> MmResult<(Self, PageTables)> {
        let base = config.quickmap_base();
        if !base.is_aligned(Vaddr::entry_coverage(1)) || base.table_index(ROOT_LEVEL) < KERNEL_ROOT_INDEX {
            corruption("quickmap base must be 2 MiB aligned and in the kernel half");
        }

        let root = boot_table(arch, pfa)?;
        let mut tables = PageTables::new(root, SpaceKind::Kernel);
        let directory = tables.directory_flags();
        for index in KERNEL_ROOT_INDEX..ENTRIES_PER_TABLE {
            let pdpt = boot_table(arch, pfa)?;
            // SAFETY: 引导页表刚分配，只有这里在使用
            unsafe { boot_entries(arch, root)[index] = PageTableEntry::new(pdpt, directory) };
            tables.insert(TableKey::covering(canonical(index), 2), pdpt);
        }

        let mut table = root;
        for level in (1..=ROOT_LEVEL).rev() {
            let index = base.table_index(level);
            // SAFETY: 同上
            let entry = unsafe { boot_entries(arch, table)[index] };
            table = if entry.is_present() {
                entry.ppn()
            } else {
                let child = boot_table(arch, pfa)?;
                // SAFETY: 同上
                unsafe { boot_entries(arch, table)[index] = PageTableEntry::new(child, directory) };
                tables.insert(TableKey::covering(base, level - 1), child);
                child
            };
        }

        let quickmap = Quickmap::new(arch, base, table.start_addr(), arch.num_cpus());
        info!(
            "MM: kernel root table at {}, quickmap slots at {} ({} tables)",
            root.start_addr(),
            base,
            tables.len()
        );
        // SAFETY: 内核半区已完整建立
        unsafe { arch.write_root_table(root.start_addr()) };
        Ok((Self { arch, quickmap }, tables))
    }

    /// quickmap 槽位
    pub fn quickmap(&self) -> &Quickmap {
        &self.quickmap
    }

    /// 映射任意帧到当前 CPU 的页槽
    pub fn map_page(&self, ppn: Ppn) -> QuickmapGuard<'_> {
        self.quickmap.map(ppn, SlotKind::Page)
    }

    /// 分配一张清零的页表
    pub fn allocate_table(&self, pfa: &PhysicalAllocator) -> Option<Ppn> {
        self.allocate_table_from(pfa, false)
    }

    /// 同 [`Self::allocate_table`]，`committed` 为真时消耗已提交的额度
    pub fn allocate_table_from(&self, pfa: &PhysicalAllocator, committed: bool) -> Option<Ppn> {
        let table = pfa.allocate(PoolKind::User, committed)?;
        self.map_page(table).bytes_mut().fill(0);
        Some(table)
    }

    /// 创建一张用户根页表，内核半区的根表项从内核根页表复制
    pub fn create_user_root(&self, pfa: &PhysicalAllocator, kernel_root: Ppn) -> MmResult<PageTables> {
        let root = self.allocate_table(pfa).ok_or(MmError::OutOfMemory)?;
        // 内核半区的根表项在启动后不再变化，无需持有内核地址空间的锁
        let mut window = self.quickmap.map(kernel_root, SlotKind::Table);
        let kernel_half: Vec<PageTableEntry> = window.entries()[KERNEL_ROOT_INDEX..].to_vec();
        window.remap(root);
        window.entries_mut()[KERNEL_ROOT_INDEX..].copy_from_slice(&kernel_half);
        Ok(PageTables::new(root, SpaceKind::User))
    }

    /// 确保 `vaddr` 的叶子表项存在，必要时创建中间页表。
    ///
    /// 失败（无法分配页表）时本次调用新建的页表全部回滚，返回 `None`。
    ///
    /// # Panics
    /// 叶子页表正被写时复制共享时视为调用者错误：修改前必须先解除共享。
    pub fn ensure_entry<'a>(
        &'a self,
        pfa: &PhysicalAllocator,
        tables: &mut PageTables,
        vaddr: Vaddr,
    ) -> Option<EntryRef<'a>> {
        self.ensure_at(pfa, tables, vaddr, 0)
    }

    /// 确保覆盖 `vaddr` 的页目录项所在的页目录存在，返回该目录项
    pub fn ensure_directory_entry<'a>(
        &'a self,
        pfa: &PhysicalAllocator,
        tables: &mut PageTables,
        vaddr: Vaddr,
    ) -> Option<EntryRef<'a>> {
        self.ensure_at(pfa, tables, vaddr, 1)
    }

    fn ensure_at<'a>(
        &'a self,
        pfa: &PhysicalAllocator,
        tables: &mut PageTables,
        vaddr: Vaddr,
        stop_level: usize,
    ) -> Option<EntryRef<'a>> {
        let directory = tables.directory_flags();
        let mut created: [Option<CreatedTable>; ROOT_LEVEL] = [None; ROOT_LEVEL];
        let mut window = self.quickmap.map(tables.root(), SlotKind::Table);

        for level in (stop_level + 1..=ROOT_LEVEL).rev() {
            let index = vaddr.table_index(level);
            let entry = window.entries()[index];
            let child = if entry.is_present() {
                if level == 1 && stop_level == 0 && entry.is_copy_on_write() {
                    corruption("mutable walk into a copy-on-write page table");
                }
                entry.ppn()
            } else {
                let Some(table) = self.allocate_table(pfa) else {
                    warn!("MM: no frame for a level {} page table mapping {}", level - 1, vaddr);
                    self.rollback(pfa, tables, window, &created);
                    return None;
                };
                window.entries_mut()[index] = PageTableEntry::new(table, directory);
                let key = TableKey::covering(vaddr, level - 1);
                if tables.insert(key, table).is_some() {
                    corruption("page table map tracks a table behind an empty directory entry");
                }
                created[level - 1] = Some(CreatedTable {
                    key,
                    parent: window.ppn(),
                    index,
                    table,
                });
                table
            };
            window.remap(child);
        }

        Some(EntryRef::new(window, vaddr.table_index(stop_level)))
    }

    fn rollback(
        &self,
        pfa: &PhysicalAllocator,
        tables: &mut PageTables,
        mut window: QuickmapGuard<'_>,
        created: &[Option<CreatedTable>],
    ) {
        // 自下而上撤销，新表还没有被任何 CPU 用来翻译叶子地址
        for c in created.iter().flatten() {
            window.remap(c.parent);
            window.entries_mut()[c.index].clear();
            tables.remove(c.key);
            debug!("MM: rolled back page table at {}", c.table.start_addr());
            pfa.unref_frame(c.table);
        }
    }

    /// 沿已有页表走到第 `level` 级页表中覆盖 `vaddr` 的表项，不创建任何页表
    pub fn walk<'a>(&'a self, tables: &PageTables, vaddr: Vaddr, level: usize) -> Option<EntryRef<'a>> {
        let mut window = self.quickmap.map(tables.root(), SlotKind::Table);
        for current in (level + 1..=ROOT_LEVEL).rev() {
            let entry = window.entries()[vaddr.table_index(current)];
            if !entry.is_present() {
                return None;
            }
            window.remap(entry.ppn());
        }
        Some(EntryRef::new(window, vaddr.table_index(level)))
    }

    /// 查找 `vaddr` 的叶子表项，不存在时返回 `None`
    pub fn lookup(&self, tables: &PageTables, vaddr: Vaddr) -> Option<PageTableEntry> {
        self.walk(tables, vaddr, 0)
            .map(|entry| *entry)
            .filter(|entry| !entry.is_null())
    }

    /// 清除 `vaddr` 的叶子表项并返回原值。
    ///
    /// 当 `last_in_range` 为真或该表项是页表的最后一项时，检查页表是否已空，
    /// 空页表从父目录中摘除，并向上级联（根页表与内核半区的 PDPT 除外）。
    /// 返回前已完成 TLB 广播，摘除的页表随后才被释放。
    ///
    /// 只清除表项本身，叶子帧的引用由调用者处理。
    pub fn release_entry(
        &self,
        pfa: &PhysicalAllocator,
        tlb: &TlbCoordinator,
        tables: &mut PageTables,
        vaddr: Vaddr,
        last_in_range: bool,
    ) -> Option<PageTableEntry> {
        let mut detached = Vec::new();
        let old = self.detach_entry(tables, vaddr, last_in_range, &mut detached)?;
        if old.is_present() || !detached.is_empty() {
            tlb.flush_broadcast(tables.flush_root(), vaddr.align_down_to_page(), 1);
        }
        self.free_detached(pfa, detached);
        Some(old)
    }

    /// [`Self::release_entry`] 的批量形式：清除表项，摘下变空的页表并记入 `detached`，
    /// 既不刷新 TLB 也不释放页表。
    ///
    /// 调用者对整个范围广播一次 TLB 失效后，再用 [`Self::free_detached`] 释放页表。
    pub fn detach_entry(
        &self,
        tables: &mut PageTables,
        vaddr: Vaddr,
        last_in_range: bool,
        detached: &mut Vec<Ppn>,
    ) -> Option<PageTableEntry> {
        let index = vaddr.table_index(0);
        let old = {
            let mut window = self.quickmap.map(tables.root(), SlotKind::Table);
            for level in (1..=ROOT_LEVEL).rev() {
                let entry = window.entries()[vaddr.table_index(level)];
                if !entry.is_present() {
                    return None;
                }
                if level == 1 && entry.is_copy_on_write() {
                    corruption("release of an entry in a copy-on-write page table");
                }
                window.remap(entry.ppn());
            }
            let old = window.entries()[index];
            window.entries_mut()[index].clear();
            old
        };
        if last_in_range || index == ENTRIES_PER_TABLE - 1 {
            self.prune_empty(tables, vaddr, 0, detached);
        }
        Some(old)
    }

    /// 从第 `level` 级开始，向上摘除覆盖 `vaddr` 且已经没有有效表项的页表。
    ///
    /// 遇到非空页表即停止；根页表与内核半区的 PDPT 永不摘除。
    /// 摘下的页表按自下而上的顺序记入 `detached`。
    pub fn prune_empty(&self, tables: &mut PageTables, vaddr: Vaddr, level: usize, detached: &mut Vec<Ppn>) {
        for level in level..ROOT_LEVEL {
            // 内核半区的 PDPT 被所有用户根页表共享
            if level + 1 == ROOT_LEVEL && vaddr.table_index(ROOT_LEVEL) >= KERNEL_ROOT_INDEX {
                break;
            }
            let key = TableKey::covering(vaddr, level);
            let Some(table) = tables.get(key) else {
                corruption("page table on the walked path is not tracked by its address space");
            };
            let empty = self
                .quickmap
                .map(table, SlotKind::Table)
                .entries()
                .iter()
                .all(|e| !e.is_present());
            if !empty {
                break;
            }
            let parent = if level + 1 == ROOT_LEVEL {
                tables.root()
            } else {
                let Some(parent) = tables.get(TableKey::covering(vaddr, level + 1)) else {
                    corruption("parent of a tracked page table is not tracked");
                };
                parent
            };
            {
                let mut window = self.quickmap.map(parent, SlotKind::Table);
                let entry = &mut window.entries_mut()[vaddr.table_index(level + 1)];
                if entry.ppn() != table {
                    corruption("emptied page table is not linked from its parent");
                }
                entry.clear();
            }
            tables.remove(key);
            detached.push(table);
        }
    }

    /// 释放摘下的页表。调用者必须已经让所有 CPU 停止经由它们翻译。
    pub fn free_detached(&self, pfa: &PhysicalAllocator, detached: Vec<Ppn>) {
        for table in detached {
            debug!("MM: released empty page table at {}", table.start_addr());
            pfa.unref_frame(table);
        }
    }

    /// 放弃对一张叶子页表的引用。最后一个引用者同时放弃表中所有帧的引用。
    ///
    /// 调用者必须已经让所有 CPU 停止经由这张页表翻译。
    pub fn release_leaf_table(&self, pfa: &PhysicalAllocator, table: Ppn) {
        // 引用计数的检查与释放必须在全局锁下成对完成
        let _global = pfa.lock_global();
        if pfa.ref_count(table) == Some(1) {
            let frames: Vec<Ppn> = {
                let window = self.quickmap.map(table, SlotKind::Table);
                window
                    .entries()
                    .iter()
                    .filter(|e| e.is_present())
                    .map(|e| e.ppn())
                    .collect()
            };
            for frame in frames {
                pfa.unref_frame(frame);
            }
        }
        pfa.unref_frame(table);
    }

    /// 销毁一个用户地址空间的全部页表。内核半区不属于用户页表集合，不受影响。
    pub fn destroy(&self, pfa: &PhysicalAllocator, tables: PageTables) {
        if tables.kind() == SpaceKind::Kernel {
            corruption("attempt to destroy the kernel page tables");
        }
        let _global = pfa.lock_global();
        let (root, owned) = tables.into_parts();
        let count = owned.len();
        for (key, table) in owned {
            if key.level == 0 {
                self.release_leaf_table(pfa, table);
            } else {
                pfa.unref_frame(table);
            }
        }
        pfa.unref_frame(root);
        debug!("MM: destroyed page tables rooted at {} ({} tables)", root.start_addr(), count);
    }

    /// 架构操作
    pub fn arch(&self) -> &'static dyn ArchMmOps {
        self.arch
    }
}

/// 根页表第 `index` 项覆盖区间的规范地址
const fn canonical(index: usize) -> Vaddr {
    let addr = index << (12 + 9 * ROOT_LEVEL);
    if addr & (1 << 47) != 0 {
        Vaddr::new(addr | 0xffff_0000_0000_0000)
    } else {
        Vaddr::new(addr)
    }
}

fn boot_table(arch: &dyn ArchMmOps, pfa: &PhysicalAllocator) -> MmResult<Ppn> {
    let table = pfa.allocate(PoolKind::User, false).ok_or(MmError::OutOfMemory)?;
    // SAFETY: 新分配的帧，经启动阶段的永久映射访问
    unsafe { core::ptr::write_bytes(arch.phys_to_virt(table.start_addr()), 0, PAGE_SIZE) };
    Ok(table)
}

/// # Safety
/// 只能在启动阶段用于尚未被 quickmap 接管的引导页表。
unsafe fn boot_entries(arch: &dyn ArchMmOps, table: Ppn) -> &'static mut [PageTableEntry] {
    // SAFETY: 调用者保证独占
    unsafe {
        core::slice::from_raw_parts_mut(
            arch.phys_to_virt(table.start_addr()) as *mut PageTableEntry,
            ENTRIES_PER_TABLE,
        )
    }
}

const _: () = assert!(canonical(KERNEL_ROOT_INDEX).0 == 0xffff_8000_0000_0000);
