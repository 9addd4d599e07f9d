//! 写时复制
//!
//! fork 之后父子地址空间共享同一张叶子页表，指向它的目录项被标记为
//! [`PteFlags::COPY_ON_WRITE`] 并去掉写权限。任何一方第一次写入该组（2 MiB）时，
//! 整组被复制到一张新的私有页表中：
//!
//! - 共享对象、物理区域和共享零帧的页继续引用同一帧
//! - 其余页分配新帧并逐字节复制
//!
//! 新页表和复制的帧优先消耗区域在 fork 时提交的预留（[`CowReserve`]）。
//!
//! 新页表装入后广播失效 TLB，最后才放弃对旧页表的引用。
//! 其它共享者都已复制或放弃之后，剩下的一方直接收回旧页表，不再复制。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::{debug, warn};

use crate::address::{Ppn, Vaddr};
use crate::config::{ENTRIES_PER_TABLE, PAGE_SIZE};
use crate::error::{MmError, MmResult, corruption};
use crate::frame_allocator::PoolKind;
use crate::manager::MemoryManager;
use crate::memory_space::{CowReserve, Region, find_region};
use crate::page_table::{PageTableEntry, PageTables, PteFlags, SlotKind, TableKey};

impl MemoryManager {
    /// 复制覆盖 `vaddr` 的写时复制组。调用者持有地址空间的锁。
    pub(crate) fn resolve_copy_on_write(
        &self,
        tables: &mut PageTables,
        regions: &BTreeMap<Vaddr, Region>,
        vaddr: Vaddr,
    ) -> MmResult<()> {
        let _global = self.physical().lock_global();
        let quickmap = self.page_tables().quickmap();
        let base = vaddr.table_base(0);
        let key = TableKey::covering(vaddr, 0);

        let (shared, directory_flags) = {
            let Some(directory) = self.page_tables().walk(tables, vaddr, 1) else {
                corruption("copy-on-write fault without a page directory");
            };
            if !directory.is_present() || !directory.is_copy_on_write() {
                corruption("copy-on-write resolution of a private page table");
            }
            (directory.ppn(), directory.flags())
        };
        if tables.get(key) != Some(shared) {
            corruption("shared page table is not tracked by its address space");
        }

        if self.physical().ref_count(shared) == Some(1) {
            {
                let Some(mut directory) = self.page_tables().walk(tables, vaddr, 1) else {
                    corruption("page directory vanished during copy-on-write");
                };
                directory.remove(PteFlags::COPY_ON_WRITE);
                directory.insert(PteFlags::WRITABLE);
            }
            self.tlb().flush_broadcast(tables.flush_root(), base, ENTRIES_PER_TABLE);
            debug!("MM: took back copy-on-write group at {}", base);
            return Ok(());
        }

        let snapshot: Vec<PageTableEntry> = quickmap.map(shared, SlotKind::Table).entries().to_vec();
        let regions_of: Vec<Option<&Region>> = snapshot
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let region = find_region(regions, base + index * PAGE_SIZE);
                let private = entry.is_present()
                    && entry.ppn() != self.shared_zero_frame()
                    && region.is_some_and(|region| !region.backing().shares_frames());
                region.filter(|_| private)
            })
            .collect();

        // 新页表的预留记在组内第一个私有页所在的区域上
        let table_reserve = regions_of
            .iter()
            .flatten()
            .next()
            .and_then(|region| region.cow_reserve())
            .filter(|reserve| reserve.take());
        let Some(private) = self
            .page_tables()
            .allocate_table_from(self.physical(), table_reserve.is_some())
        else {
            if let Some(reserve) = table_reserve {
                reserve.add(1);
            }
            return Err(MmError::OutOfMemory);
        };

        let mut resolved = snapshot.clone();
        let mut reserved: Vec<&CowReserve> = table_reserve.into_iter().collect();
        for (index, entry) in snapshot.iter().enumerate() {
            if !entry.is_present() {
                continue;
            }
            let Some(region) = regions_of[index] else {
                self.physical().ref_frame(entry.ppn());
                continue;
            };
            let reserve = region.cow_reserve().filter(|reserve| reserve.take());
            // 消耗了预留的分配不会失败
            let Some(frame) = self.physical().allocate(PoolKind::User, reserve.is_some()) else {
                warn!("MM: out of memory duplicating the copy-on-write group at {}", base);
                self.abandon(&resolved[..index], private, &reserved);
                return Err(MmError::OutOfMemory);
            };
            reserved.extend(reserve);
            self.copy_frame(entry.ppn(), frame);
            resolved[index].set_ppn(frame);
        }
        let copied = resolved
            .iter()
            .zip(&snapshot)
            .filter(|(new, old)| new.ppn() != old.ppn())
            .count();

        quickmap
            .map(private, SlotKind::Table)
            .entries_mut()
            .copy_from_slice(&resolved);
        {
            let Some(mut directory) = self.page_tables().walk(tables, vaddr, 1) else {
                corruption("page directory vanished during copy-on-write");
            };
            let mut flags = directory_flags;
            flags.remove(PteFlags::COPY_ON_WRITE);
            flags.insert(PteFlags::WRITABLE);
            *directory = PageTableEntry::new(private, flags);
        }
        tables.insert(key, private);

        // 旧页表的帧可能马上被释放，所有 CPU 必须先停止经由它翻译
        self.tlb().flush_broadcast(tables.flush_root(), base, ENTRIES_PER_TABLE);
        self.page_tables().release_leaf_table(self.physical(), shared);
        debug!(
            "MM: duplicated copy-on-write group at {}: {} frames copied",
            base, copied
        );
        Ok(())
    }

    /// 撤销一次未完成的复制：放弃已经取得的帧引用和新页表，归还已消耗的预留
    fn abandon(&self, resolved: &[PageTableEntry], private: Ppn, reserved: &[&CowReserve]) {
        for entry in resolved.iter().filter(|e| e.is_present()) {
            self.physical().unref_frame(entry.ppn());
        }
        self.physical().unref_frame(private);
        if reserved.is_empty() {
            return;
        }
        // 复制出的帧已经回到未提交部分，至少能重新提交同样多
        if self.physical().commit(reserved.len()).is_err() {
            corruption("copies released during rollback did not return their frames");
        }
        for reserve in reserved {
            reserve.add(1);
        }
    }

    fn copy_frame(&self, from: Ppn, to: Ppn) {
        let quickmap = self.page_tables().quickmap();
        let source = quickmap.map(from, SlotKind::Page);
        let mut target = quickmap.map(to, SlotKind::Table);
        target.bytes_mut().copy_from_slice(source.bytes());
    }
}
