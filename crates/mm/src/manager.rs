//! 内存管理器
//!
//! [`MemoryManager`] 是内存核心的上下文对象：启动代码构造一次，再显式交给
//! 需要它的子系统。它把物理帧分配器、页表管理器、TLB 协调器和内核地址空间
//! 组合起来，对外提供帧分配、地址空间生命周期、区域映射和内核区域等操作。
//! 缺页处理与写时复制分别在 [`crate::fault`] 和 [`crate::cow`] 中实现。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, info, trace, warn};
use sync::SpinLock;

use crate::address::{AlignOps, Paddr, Ppn, Vaddr, VaddrRange};
use crate::arch_ops::ArchMmOps;
use crate::config::{ENTRIES_PER_TABLE, KERNEL_SPACE_BASE, MmConfig, PAGE_SIZE};
use crate::error::{MmError, MmResult, corruption};
use crate::fault::{FaultAccess, PageFault};
use crate::frame_allocator::{BootInfo, PhysicalAllocator, PoolKind, PoolStats, Purgeable, ShouldZeroFill};
use crate::memory_space::{
    Access, AddressSpace, AllocationStrategy, RangeAllocator, Region, RegionBacking, RegionInfo,
    SpaceInner, VmObject, find_region,
};
use crate::page_table::{
    PageTableEntry, PageTableManager, PageTables, PteFlags, QuickmapGuard, SlotKind, SpaceKind,
    TableKey,
};
use crate::tlb::TlbCoordinator;

/// 内核区域的虚拟地址来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KernelRegionKind {
    /// 来自内核区域窗口
    Window,
    /// 虚拟地址等于物理地址
    Identity,
}

/// 内核区域句柄，交还给 [`MemoryManager::deallocate_kernel_region`] 释放
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelRegion {
    range: VaddrRange,
    kind: KernelRegionKind,
}

impl KernelRegion {
    /// 虚拟地址范围
    pub fn range(&self) -> VaddrRange {
        self.range
    }

    /// 起始地址
    pub fn start(&self) -> Vaddr {
        self.range.start
    }

    /// 字节数
    pub fn size(&self) -> usize {
        self.range.size()
    }
}

/// 内存计数快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// user 池
    pub user: PoolStats,
    /// super 池
    pub super_pool: PoolStats,
    /// 内核地址空间拥有的非根页表数
    pub kernel_tables: usize,
    /// 内核区域窗口的剩余字节数
    pub free_kernel_window: usize,
}

/// 内存管理器
pub struct MemoryManager {
    arch: &'static dyn ArchMmOps,
    config: &'static dyn MmConfig,
    physical: PhysicalAllocator,
    tables: PageTableManager,
    tlb: TlbCoordinator,
    kernel_space: AddressSpace,
    kernel_ranges: SpinLock<RangeAllocator>,
    identity_ranges: SpinLock<RangeAllocator>,
    shared_zero_frame: Ppn,
}

impl MemoryManager {
    /// 在启动 CPU 上建立内存核心，装入内核根页表
    pub fn new(
        arch: &'static dyn ArchMmOps,
        config: &'static dyn MmConfig,
        boot: &BootInfo<'_>,
    ) -> MmResult<Self> {
        let user_end = config.user_space_end();
        let window = config.kernel_region_window();
        assert!(
            user_end.is_page_aligned() && user_end.0 <= KERNEL_SPACE_BASE,
            "user space must end below the kernel half"
        );
        assert!(
            window.start.0 >= KERNEL_SPACE_BASE
                && !window.contains(config.quickmap_base())
                && window.start.is_page_aligned(),
            "kernel region window must be page aligned, in the kernel half and clear of quickmap"
        );

        let physical = PhysicalAllocator::initialize(arch, config, boot)?;
        let (tables, kernel_tables) = PageTableManager::bootstrap(arch, config, &physical)?;
        let tlb = TlbCoordinator::new(arch, config);
        let shared_zero_frame = physical
            .allocate(PoolKind::User, false)
            .ok_or(MmError::OutOfMemory)?;
        tables.map_page(shared_zero_frame).bytes_mut().fill(0);

        info!(
            "MM: memory manager ready: kernel window {}..{}, shared zero frame {}",
            window.start,
            window.end,
            shared_zero_frame.start_addr()
        );
        Ok(Self {
            arch,
            config,
            physical,
            tables,
            tlb,
            kernel_space: AddressSpace::new(kernel_tables),
            kernel_ranges: SpinLock::new(RangeAllocator::new(window)),
            identity_ranges: SpinLock::new(RangeAllocator::new(config.identity_window())),
            shared_zero_frame,
        })
    }

    /// 副处理器上线：装入内核根页表并开始接收 TLB 广播
    pub fn initialize_secondary_cpu(&self) {
        // SAFETY: 内核根页表在启动 CPU 上已完整建立
        unsafe { self.arch.write_root_table(self.kernel_space.root_paddr()) };
        self.tlb.set_online(self.arch.cpu_id());
        info!("MM: CPU {} online", self.arch.cpu_id());
    }

    /// 架构操作
    pub fn arch(&self) -> &'static dyn ArchMmOps {
        self.arch
    }

    /// 布局配置
    pub fn config(&self) -> &'static dyn MmConfig {
        self.config
    }

    /// 物理帧分配器
    pub fn physical(&self) -> &PhysicalAllocator {
        &self.physical
    }

    /// 页表管理器
    pub fn page_tables(&self) -> &PageTableManager {
        &self.tables
    }

    /// TLB 协调器
    pub fn tlb(&self) -> &TlbCoordinator {
        &self.tlb
    }

    /// 内核地址空间
    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    /// 共享零帧，所有从未写过的匿名页只读地映射它
    pub fn shared_zero_frame(&self) -> Ppn {
        self.shared_zero_frame
    }

    /// 计数快照
    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            user: self.physical.stats(PoolKind::User),
            super_pool: self.physical.stats(PoolKind::Super),
            kernel_tables: self.kernel_space.table_count(),
            free_kernel_window: self.kernel_ranges.lock().free_bytes(),
        }
    }

    // ---- 帧 ----

    /// 分配一帧，按需清零
    pub fn allocate_frame(&self, pool: PoolKind, zero_fill: ShouldZeroFill, committed: bool) -> MmResult<Ppn> {
        let frame = self
            .physical
            .allocate(pool, committed)
            .ok_or(MmError::OutOfMemory)?;
        if zero_fill == ShouldZeroFill::Yes {
            self.tables.map_page(frame).bytes_mut().fill(0);
        }
        Ok(frame)
    }

    /// 放弃一帧的引用；对刚分配的帧就是归还它
    pub fn deallocate_frame(&self, frame: Ppn) {
        self.physical.unref_frame(frame);
    }

    /// 预留 `n` 帧
    pub fn commit(&self, n: usize) -> MmResult<()> {
        self.physical.commit(n)
    }

    /// 撤销 `n` 帧的预留
    pub fn uncommit(&self, n: usize) {
        self.physical.uncommit(n)
    }

    /// 把任意帧临时映射到当前 CPU
    pub fn quickmap(&self, frame: Ppn) -> QuickmapGuard<'_> {
        self.tables.map_page(frame)
    }

    /// 撤销临时映射
    pub fn unquickmap(&self, guard: QuickmapGuard<'_>) {
        guard.unquickmap();
    }

    /// 注册一个内存紧张时可清除的对象
    pub fn register_purgeable(&self, object: &Arc<VmObject>) {
        let weak: alloc::sync::Weak<dyn Purgeable> = Arc::downgrade(object) as _;
        self.physical.register_purgeable(weak);
    }

    // ---- 地址空间 ----

    /// 创建用户地址空间，内核半区与内核地址空间共享
    pub fn create_address_space(&self) -> MmResult<AddressSpace> {
        let tables = self
            .tables
            .create_user_root(&self.physical, self.kernel_space.root())?;
        debug!("MM: created address space rooted at {}", tables.root().start_addr());
        Ok(AddressSpace::new(tables))
    }

    /// 销毁用户地址空间，释放它拥有的全部页表、帧和预留额度
    ///
    /// # Panics
    /// 销毁内核地址空间或当前 CPU 正在使用的地址空间。
    pub fn destroy_address_space(&self, space: AddressSpace) {
        if space.kind() == SpaceKind::Kernel {
            corruption("attempt to destroy the kernel address space");
        }
        if self.arch.read_root_table() == space.root_paddr() {
            corruption("attempt to destroy the address space loaded on this CPU");
        }
        let _global = self.physical.lock_global();
        let SpaceInner { tables, regions } = space.into_inner();
        for region in regions.into_values() {
            self.release_region_backing(region);
        }
        self.tables.destroy(&self.physical, tables);
    }

    /// 在当前 CPU 上切换到 `space`
    pub fn enter_space(&self, space: &AddressSpace) {
        // SAFETY: 每个地址空间的根页表都带有完整的内核半区
        unsafe { self.arch.write_root_table(space.root_paddr()) };
    }

    /// 复制用户地址空间
    ///
    /// 父空间的每张叶子页表都被子空间共享并标记为写时复制，
    /// 任何一方第一次写入某个 2 MiB 组时才复制该组。
    pub fn fork(&self, parent: &AddressSpace) -> MmResult<AddressSpace> {
        if parent.kind() != SpaceKind::User {
            corruption("fork of the kernel address space");
        }
        let child = self.create_address_space()?;
        let result = {
            let _global = self.physical.lock_global();
            let mut parent_inner = parent.lock();
            let mut child_inner = child.lock();
            let result = self.share_into(&mut parent_inner, &mut child_inner);
            // 无论成败，父空间的目录项可能已经改为只读
            let user_pages = self.config.user_space_end().0 / PAGE_SIZE;
            self.tlb
                .flush_broadcast(parent_inner.tables.flush_root(), Vaddr::new(0), user_pages);
            result
        };
        match result {
            Ok(()) => {
                debug!(
                    "MM: forked {} into {} ({} shared tables)",
                    parent.root_paddr(),
                    child.root_paddr(),
                    child.table_count()
                );
                Ok(child)
            }
            Err(err) => {
                warn!("MM: fork of {} failed: {}", parent.root_paddr(), err);
                self.destroy_address_space(child);
                Err(err)
            }
        }
    }

    fn share_into(&self, parent: &mut SpaceInner, child: &mut SpaceInner) -> MmResult<()> {
        // 子空间继承未消耗的提交额度；已驻留的私有页在任何一方写入时都要复制，
        // 为它们预留同样多的帧。全部额度一次提交，失败时父空间保持原样。
        let resident = self.resident_private_pages(&parent.tables, &parent.regions);
        let needed: usize = parent
            .regions
            .iter()
            .map(|(start, region)| match &region.backing {
                RegionBacking::Anonymous { committed_pages, .. } => {
                    committed_pages + resident.get(start).copied().unwrap_or(0)
                }
                _ => 0,
            })
            .sum();
        if needed > 0 {
            self.physical.commit(needed)?;
        }
        for (start, region) in parent.regions.iter_mut() {
            if let RegionBacking::Anonymous { cow_reserve, .. } = &mut region.backing {
                if let Some(&pages) = resident.get(start) {
                    cow_reserve.get_or_insert_with(Default::default).add(pages);
                }
            }
            child.regions.insert(*start, region.clone());
        }

        let leaves: Vec<(Vaddr, Ppn)> = parent.tables.leaves().collect();
        for (base, table) in leaves {
            let shared = {
                let Some(mut directory) = self.tables.walk(&parent.tables, base, 1) else {
                    corruption("tracked leaf table has no directory entry");
                };
                if !directory.is_present() || directory.ppn() != table {
                    corruption("directory entry disagrees with the page table map");
                }
                directory.insert(PteFlags::COPY_ON_WRITE);
                directory.remove(PteFlags::WRITABLE);
                *directory
            };
            let Some(mut directory) = self
                .tables
                .ensure_directory_entry(&self.physical, &mut child.tables, base)
            else {
                return Err(MmError::OutOfMemory);
            };
            self.physical.ref_frame(table);
            *directory = shared;
            drop(directory);
            child.tables.insert(TableKey::covering(base, 0), table);
        }
        Ok(())
    }

    /// 每个匿名区域要为写时复制预留的帧数，按区域起点索引
    ///
    /// 已驻留的私有页各需一帧；每组复制时的新页表也需一帧，
    /// 记在组内第一个私有页所在的区域上。
    fn resident_private_pages(
        &self,
        tables: &PageTables,
        regions: &BTreeMap<Vaddr, Region>,
    ) -> BTreeMap<Vaddr, usize> {
        let mut resident = BTreeMap::new();
        for (base, table) in tables.leaves() {
            let window = self.tables.quickmap().map(table, SlotKind::Table);
            let mut group_counted = false;
            for (index, entry) in window.entries().iter().enumerate() {
                if !entry.is_present() || entry.ppn() == self.shared_zero_frame {
                    continue;
                }
                let page = base + index * PAGE_SIZE;
                if let Some(region) = find_region(regions, page).filter(|r| !r.backing().shares_frames()) {
                    let pages = resident.entry(region.range().start).or_insert(0);
                    *pages += if group_counted { 1 } else { 2 };
                    group_counted = true;
                }
            }
        }
        resident
    }

    // ---- 区域 ----

    /// 把区域加入地址空间
    ///
    /// `Reserve` 与 `AllocateNow` 在这里提交全部页数，`AllocateNow` 与物理区域
    /// 立即建立表项，其余页在第一次访问时由缺页处理建立。
    pub fn map_region(&self, space: &AddressSpace, region: Region) -> MmResult<()> {
        let range = region.range();
        let invalid = MmError::InvalidMapping { vaddr: range.start };
        if range.is_empty() || !range.start.is_page_aligned() || !range.end.is_page_aligned() {
            return Err(invalid);
        }
        let user = space.kind() == SpaceKind::User;
        let in_bounds = if user {
            range.end <= self.config.user_space_end()
        } else {
            range.start.0 >= KERNEL_SPACE_BASE || self.config.identity_window().contains_range(&range)
        };
        if !in_bounds {
            return Err(invalid);
        }

        let _global = self.physical.lock_global();
        let mut inner = space.lock();
        if inner.overlaps(&range) {
            return Err(invalid);
        }

        let mut region = region;
        region.set_user(user);
        let pages = range.page_count();
        let eager = match &mut region.backing {
            RegionBacking::Anonymous {
                strategy,
                committed_pages,
                cow_reserve,
            } => {
                *committed_pages = 0;
                *cow_reserve = None;
                if *strategy != AllocationStrategy::None {
                    self.physical.commit(pages)?;
                    *committed_pages = pages;
                }
                *strategy == AllocationStrategy::AllocateNow
            }
            RegionBacking::Shared(object) => {
                if object.page_count() < pages {
                    return Err(invalid);
                }
                false
            }
            RegionBacking::Physical { base } => {
                let base = *base;
                if !base.is_page_aligned()
                    || (user && !self.physical.is_allowed_to_map_to_userspace(base, range.size()))
                {
                    warn!("MM: refusing to map physical {} at {}", base, range.start);
                    return Err(invalid);
                }
                true
            }
        };

        if eager {
            let SpaceInner { tables, .. } = &mut *inner;
            for vaddr in range.pages() {
                if let Err(err) = self.populate_page(tables, &mut region, vaddr, true) {
                    self.release_pages(tables, VaddrRange::new(range.start, vaddr));
                    self.release_region_backing(region);
                    return Err(err);
                }
            }
        }

        debug!(
            "MM: mapped {} {}..{} {:?} in {}",
            region.name(),
            range.start,
            range.end,
            region.access(),
            space.root_paddr()
        );
        inner.regions.insert(range.start, region);
        Ok(())
    }

    /// 移除从 `start` 开始的区域，释放它的所有页
    pub fn unmap_region(&self, space: &AddressSpace, start: Vaddr) -> MmResult<()> {
        let _global = self.physical.lock_global();
        let mut inner = space.lock();
        let SpaceInner { tables, regions } = &mut *inner;
        let Some(range) = regions.get(&start).map(Region::range) else {
            return Err(MmError::InvalidMapping { vaddr: start });
        };
        self.unshare_range(tables, regions, range)?;
        self.release_pages(tables, range);
        if let Some(region) = regions.remove(&start) {
            debug!("MM: unmapped {} {}..{}", region.name(), range.start, range.end);
            self.release_region_backing(region);
        }
        Ok(())
    }

    /// 让 `range` 涉及的写时复制组不再共享：完全落在范围内的组直接放弃，其余的复制
    fn unshare_range(
        &self,
        tables: &mut PageTables,
        regions: &BTreeMap<Vaddr, Region>,
        range: VaddrRange,
    ) -> MmResult<()> {
        let group = Vaddr::entry_coverage(1);
        let mut base = range.start.table_base(0);
        while base < range.end {
            let shared = self
                .tables
                .walk(tables, base, 1)
                .filter(|directory| directory.is_present() && directory.is_copy_on_write())
                .map(|mut directory| {
                    let table = directory.ppn();
                    if range.contains_range(&VaddrRange::from_start_len(base, group)) {
                        directory.clear();
                    }
                    (table, directory.is_null())
                });
            match shared {
                Some((table, true)) => {
                    tables.remove(TableKey::covering(base, 0));
                    let mut detached = Vec::new();
                    self.tables.prune_empty(tables, base, 1, &mut detached);
                    self.tlb
                        .flush_broadcast(tables.flush_root(), base, ENTRIES_PER_TABLE);
                    self.tables.release_leaf_table(&self.physical, table);
                    self.tables.free_detached(&self.physical, detached);
                }
                Some((_, false)) => self.resolve_copy_on_write(tables, regions, base)?,
                None => {}
            }
            base = base + group;
        }
        Ok(())
    }

    /// 清除 `range` 的全部叶子表项，对整个范围广播一次 TLB 失效后再释放帧和空页表
    fn release_pages(&self, tables: &mut PageTables, range: VaddrRange) {
        let mut frames = Vec::new();
        let mut detached = Vec::new();
        for vaddr in range.pages() {
            let last = vaddr + PAGE_SIZE == range.end;
            let released = self.tables.detach_entry(tables, vaddr, last, &mut detached);
            if let Some(entry) = released.filter(|e| e.is_present()) {
                frames.push(entry.ppn());
            }
        }
        if frames.is_empty() && detached.is_empty() {
            return;
        }
        self.tlb
            .flush_broadcast(tables.flush_root(), range.start, range.page_count());
        for frame in frames {
            self.physical.unref_frame(frame);
        }
        self.tables.free_detached(&self.physical, detached);
    }

    fn release_region_backing(&self, region: Region) {
        match region.backing {
            RegionBacking::Anonymous {
                committed_pages,
                cow_reserve,
                ..
            } => {
                // 最后一个持有者归还剩余的写时复制预留
                let leftover = cow_reserve.and_then(Arc::into_inner).map_or(0, |r| r.pages());
                if committed_pages + leftover > 0 {
                    self.physical.uncommit(committed_pages + leftover);
                }
            }
            RegionBacking::Shared(object) => {
                if let Some(object) = Arc::into_inner(object) {
                    object.release_pages(&self.physical);
                }
            }
            _ => {}
        }
    }

    /// 按区域的后备内存为 `vaddr` 建立叶子表项
    pub(crate) fn populate_page(
        &self,
        tables: &mut PageTables,
        region: &mut Region,
        vaddr: Vaddr,
        write: bool,
    ) -> MmResult<()> {
        let index = region.page_index(vaddr);
        let mut consumed_commit = false;
        let (frame, writable) = match &mut region.backing {
            RegionBacking::Anonymous {
                strategy,
                committed_pages,
                ..
            } => {
                if !write && *strategy != AllocationStrategy::AllocateNow {
                    self.physical.ref_frame(self.shared_zero_frame);
                    (self.shared_zero_frame, false)
                } else {
                    consumed_commit = take_commit(committed_pages);
                    let frame = self.allocate_frame(PoolKind::User, ShouldZeroFill::Yes, consumed_commit)?;
                    (frame, true)
                }
            }
            RegionBacking::Shared(object) => {
                let frame = self.shared_page(object, index)?;
                self.physical.ref_frame(frame);
                (frame, true)
            }
            RegionBacking::Physical { base } => {
                let frame = Ppn::from_addr_floor(*base + index * PAGE_SIZE);
                self.physical.ref_frame(frame);
                (frame, true)
            }
        };

        let flags = self.leaf_flags(tables.kind(), region, writable);
        let Some(mut entry) = self.tables.ensure_entry(&self.physical, tables, vaddr) else {
            self.physical.unref_frame(frame);
            if consumed_commit {
                // 刚归还的帧让 uncommitted 至少为 1
                self.physical.commit(1)?;
                if let RegionBacking::Anonymous { committed_pages, .. } = &mut region.backing {
                    *committed_pages += 1;
                }
            }
            return Err(MmError::OutOfMemory);
        };
        if entry.is_present() {
            corruption("demand fill of an entry that is already present");
        }
        *entry = PageTableEntry::new(frame, flags);
        drop(entry);
        self.tlb.flush_local(tables.flush_root(), vaddr, 1);
        Ok(())
    }

    /// 把映射共享零帧的页换成私有帧
    pub(crate) fn materialize_zero_page(
        &self,
        tables: &mut PageTables,
        region: &mut Region,
        vaddr: Vaddr,
    ) -> MmResult<()> {
        let committed = match &mut region.backing {
            RegionBacking::Anonymous { committed_pages, .. } => take_commit(committed_pages),
            _ => corruption("shared zero frame mapped outside an anonymous region"),
        };
        let frame = self.allocate_frame(PoolKind::User, ShouldZeroFill::Yes, committed)?;
        let flags = self.leaf_flags(tables.kind(), region, true);
        {
            let Some(mut entry) = self.tables.walk(tables, vaddr, 0) else {
                corruption("zero page lost its page table");
            };
            if entry.ppn() != self.shared_zero_frame {
                corruption("materialized page does not map the shared zero frame");
            }
            *entry = PageTableEntry::new(frame, flags);
        }
        // 其它 CPU 可能还缓存着只读的零帧翻译
        self.tlb.flush_broadcast(tables.flush_root(), vaddr, 1);
        self.physical.unref_frame(self.shared_zero_frame);
        Ok(())
    }

    fn shared_page(&self, object: &VmObject, index: usize) -> MmResult<Ppn> {
        if let Some(frame) = object.page(index) {
            return Ok(frame);
        }
        // 分配可能触发清除，清除会获取对象的锁
        let frame = self.allocate_frame(PoolKind::User, ShouldZeroFill::Yes, false)?;
        match object.install(index, frame) {
            Ok(()) => Ok(frame),
            Err(existing) => {
                self.physical.unref_frame(frame);
                if existing == frame {
                    corruption("shared object page index out of range");
                }
                Ok(existing)
            }
        }
    }

    fn leaf_flags(&self, kind: SpaceKind, region: &Region, writable: bool) -> PteFlags {
        let mut flags = PteFlags::PRESENT;
        if writable && region.access().contains(Access::WRITE) {
            flags |= PteFlags::WRITABLE;
        }
        if region.is_user() {
            flags |= PteFlags::USER;
        }
        if !region.access().contains(Access::EXECUTE) {
            flags |= PteFlags::NO_EXECUTE;
        }
        if !region.is_cacheable() {
            flags |= PteFlags::NO_CACHE;
        }
        if kind == SpaceKind::Kernel {
            flags |= PteFlags::GLOBAL;
        }
        flags
    }

    // ---- 字节访问 ----

    /// 从地址空间读取字节，必要时像缺页一样建立映射
    pub fn read_bytes(&self, space: &AddressSpace, vaddr: Vaddr, out: &mut [u8]) -> MmResult<()> {
        let mut done = 0;
        while done < out.len() {
            let current = vaddr + done;
            let offset = current.page_offset();
            let take = (out.len() - done).min(PAGE_SIZE - offset);
            let _global = self.physical.lock_global();
            let frame = self.frame_for_access(space, current, FaultAccess::Read)?;
            let window = self.tables.map_page(frame);
            out[done..done + take].copy_from_slice(&window.bytes()[offset..offset + take]);
            done += take;
        }
        Ok(())
    }

    /// 向地址空间写入字节，写时复制和零页按写缺页处理
    pub fn write_bytes(&self, space: &AddressSpace, vaddr: Vaddr, bytes: &[u8]) -> MmResult<()> {
        let mut done = 0;
        while done < bytes.len() {
            let current = vaddr + done;
            let offset = current.page_offset();
            let take = (bytes.len() - done).min(PAGE_SIZE - offset);
            let _global = self.physical.lock_global();
            let frame = self.frame_for_access(space, current, FaultAccess::Write)?;
            let mut window = self.tables.map_page(frame);
            window.bytes_mut()[offset..offset + take].copy_from_slice(&bytes[done..done + take]);
            done += take;
        }
        Ok(())
    }

    fn frame_for_access(&self, space: &AddressSpace, vaddr: Vaddr, access: FaultAccess) -> MmResult<Ppn> {
        let invalid = MmError::InvalidMapping { vaddr };
        if space.kind() == SpaceKind::User && vaddr >= self.config.user_space_end() {
            return Err(invalid);
        }
        let mut fixed = false;
        loop {
            let ready = {
                let inner = space.lock();
                let leaf = self.tables.lookup(&inner.tables, vaddr).filter(|e| e.is_present());
                match leaf {
                    Some(leaf) if access != FaultAccess::Write => Some(leaf.ppn()),
                    Some(leaf) => self
                        .tables
                        .walk(&inner.tables, vaddr, 1)
                        .filter(|directory| directory.is_writable() && leaf.is_writable())
                        .map(|_| leaf.ppn()),
                    None => None,
                }
            };
            match ready {
                Some(frame) => return Ok(frame),
                None if fixed => return Err(invalid),
                None => {}
            }
            let fault = PageFault::for_access(vaddr, access, space.kind() == SpaceKind::User);
            self.resolve_fault(space, &fault)?;
            fixed = true;
        }
    }

    // ---- 区域查询 ----

    /// 包含 `vaddr` 的内核区域
    pub fn kernel_region_from_vaddr(&self, vaddr: Vaddr) -> Option<RegionInfo> {
        self.kernel_space
            .lock()
            .region_containing(vaddr)
            .map(Region::info)
    }

    /// 包含 `vaddr` 的区域，先查内核地址空间，再查 `space`
    pub fn find_region_from_vaddr(&self, space: &AddressSpace, vaddr: Vaddr) -> Option<RegionInfo> {
        self.kernel_region_from_vaddr(vaddr)
            .or_else(|| space.lock().region_containing(vaddr).map(Region::info))
    }

    /// `vaddr` 是否落在 `space` 的某个用户栈区域中
    pub fn validate_user_stack(&self, space: &AddressSpace, vaddr: Vaddr) -> bool {
        let inner = space.lock();
        self.validate_user_stack_locked(&inner, vaddr)
    }

    /// 已持有地址空间锁时的 [`Self::validate_user_stack`]
    pub fn validate_user_stack_locked(&self, inner: &SpaceInner, vaddr: Vaddr) -> bool {
        vaddr < self.config.user_space_end()
            && inner
                .region_containing(vaddr)
                .is_some_and(|region| region.is_user() && region.is_stack())
    }

    /// 把全部内核区域写入日志
    pub fn dump_kernel_regions(&self) {
        let inner = self.kernel_space.lock();
        info!("MM: kernel regions ({}):", inner.regions.len());
        for region in inner.regions.values() {
            let range = region.range();
            let access = region.access();
            let flag = |set: bool, c: char| if set { c } else { ' ' };
            info!(
                "MM: {} -- {} {:#10x} {}{}{}{}{} {}",
                range.start,
                range.end,
                range.size(),
                flag(access.contains(Access::READ), 'R'),
                flag(access.contains(Access::WRITE), 'W'),
                flag(access.contains(Access::EXECUTE), 'X'),
                flag(matches!(region.backing(), RegionBacking::Shared(_)), 'S'),
                flag(region.is_stack(), 'T'),
                region.name()
            );
        }
    }

    // ---- 内核页保护 ----

    /// 直接修改一个已映射内核页的可写位
    pub fn set_page_writable_direct(&self, vaddr: Vaddr, writable: bool) -> MmResult<()> {
        self.update_kernel_page(vaddr, |entry| {
            if writable {
                entry.insert(PteFlags::WRITABLE);
            } else {
                entry.remove(PteFlags::WRITABLE);
            }
        })
    }

    /// 内核映像的代码段改为只读，数据段改为不可执行
    pub fn protect_kernel_image(&self, text: VaddrRange, data: VaddrRange) -> MmResult<()> {
        for vaddr in text.pages() {
            self.update_kernel_page(vaddr, |entry| entry.remove(PteFlags::WRITABLE))?;
        }
        for vaddr in data.pages() {
            self.update_kernel_page(vaddr, |entry| entry.insert(PteFlags::NO_EXECUTE))?;
        }
        info!(
            "MM: kernel image protected: text {}..{}, data {}..{}",
            text.start, text.end, data.start, data.end
        );
        Ok(())
    }

    /// 启动结束后把只在初始化阶段写入的数据改为只读
    pub fn protect_readonly_after_init(&self, range: VaddrRange) -> MmResult<()> {
        for vaddr in range.pages() {
            self.update_kernel_page(vaddr, |entry| entry.remove(PteFlags::WRITABLE))?;
        }
        info!("MM: {}..{} is read-only from now on", range.start, range.end);
        Ok(())
    }

    fn update_kernel_page(&self, vaddr: Vaddr, update: impl FnOnce(&mut PageTableEntry)) -> MmResult<()> {
        let vaddr = vaddr.align_down_to_page();
        let _global = self.physical.lock_global();
        let inner = self.kernel_space.lock();
        let changed = {
            let Some(mut entry) = self
                .tables
                .walk(&inner.tables, vaddr, 0)
                .filter(|entry| entry.is_present())
            else {
                return Err(MmError::InvalidMapping { vaddr });
            };
            let before = *entry;
            update(&mut *entry);
            *entry != before
        };
        if changed {
            trace!("MM: kernel page {} flags changed", vaddr);
            self.tlb.flush_broadcast(None, vaddr, 1);
        }
        Ok(())
    }

    // ---- 内核区域 ----

    /// 在内核区域窗口中分配匿名内存
    pub fn allocate_kernel_region(
        &self,
        size: usize,
        name: &str,
        access: Access,
        strategy: AllocationStrategy,
    ) -> MmResult<KernelRegion> {
        let range = self.reserve_window(size)?;
        let region = Region::new(range, access, name, RegionBacking::anonymous(strategy));
        self.map_window_region(region)
    }

    /// 从 super 池分配物理连续的内核区域，内容清零
    pub fn allocate_contiguous_kernel_region(
        &self,
        size: usize,
        name: &str,
        access: Access,
    ) -> MmResult<KernelRegion> {
        let pages = size.div_ceil(PAGE_SIZE);
        let frames = self
            .physical
            .allocate_contiguous(pages, 1)
            .ok_or(MmError::OutOfMemory)?;
        for frame in frames.iter() {
            self.tables.map_page(frame).bytes_mut().fill(0);
        }
        let mapped = self.reserve_window(size).and_then(|range| {
            let backing = RegionBacking::Physical {
                base: frames.start.start_addr(),
            };
            self.map_window_region(Region::new(range, access, name, backing))
        });
        // 分配时的引用交给映射，解除映射时帧回到 super 池
        for frame in frames.iter() {
            self.physical.unref_frame(frame);
        }
        mapped
    }

    /// 建立虚拟地址等于物理地址的内核区域
    pub fn allocate_kernel_region_identity(
        &self,
        paddr: Paddr,
        size: usize,
        name: &str,
        access: Access,
    ) -> MmResult<KernelRegion> {
        let range = VaddrRange::from_start_len(Vaddr::new(paddr.0), size.div_ceil(PAGE_SIZE) * PAGE_SIZE);
        if !paddr.is_page_aligned() || !self.identity_ranges.lock().allocate_specific(range) {
            return Err(MmError::InvalidMapping { vaddr: range.start });
        }
        let region = Region::new(range, access, name, RegionBacking::Physical { base: paddr });
        match self.map_region(&self.kernel_space, region) {
            Ok(()) => Ok(KernelRegion {
                range,
                kind: KernelRegionKind::Identity,
            }),
            Err(err) => {
                self.identity_ranges.lock().deallocate(range);
                Err(err)
            }
        }
    }

    /// 把一段物理内存（通常是设备内存）映射到内核区域窗口
    pub fn allocate_kernel_region_for_physical(
        &self,
        paddr: Paddr,
        size: usize,
        name: &str,
        access: Access,
        cacheable: bool,
    ) -> MmResult<KernelRegion> {
        let range = self.reserve_window(size)?;
        let region = Region::new(range, access, name, RegionBacking::Physical { base: paddr })
            .with_cacheable(cacheable);
        self.map_window_region(region)
    }

    /// 把共享匿名对象映射到内核区域窗口，页在第一次访问时建立
    pub fn allocate_kernel_region_with_vmobject(
        &self,
        object: Arc<VmObject>,
        size: usize,
        name: &str,
        access: Access,
        cacheable: bool,
    ) -> MmResult<KernelRegion> {
        let range = self.reserve_window(size)?;
        let region = Region::new(range, access, name, RegionBacking::Shared(object)).with_cacheable(cacheable);
        self.map_window_region(region)
    }

    /// 释放内核区域
    pub fn deallocate_kernel_region(&self, region: KernelRegion) -> MmResult<()> {
        self.unmap_region(&self.kernel_space, region.range.start)?;
        match region.kind {
            KernelRegionKind::Window => self.kernel_ranges.lock().deallocate(region.range),
            KernelRegionKind::Identity => self.identity_ranges.lock().deallocate(region.range),
        }
        Ok(())
    }

    fn reserve_window(&self, size: usize) -> MmResult<VaddrRange> {
        if size == 0 {
            return Err(MmError::InvalidMapping {
                vaddr: self.config.kernel_region_window().start,
            });
        }
        self.kernel_ranges
            .lock()
            .allocate(size.div_ceil(PAGE_SIZE) * PAGE_SIZE, PAGE_SIZE)
            .ok_or(MmError::OutOfMemory)
    }

    fn map_window_region(&self, region: Region) -> MmResult<KernelRegion> {
        let range = region.range();
        match self.map_region(&self.kernel_space, region) {
            Ok(()) => Ok(KernelRegion {
                range,
                kind: KernelRegionKind::Window,
            }),
            Err(err) => {
                self.kernel_ranges.lock().deallocate(range);
                Err(err)
            }
        }
    }
}

fn take_commit(committed_pages: &mut usize) -> bool {
    if *committed_pages > 0 {
        *committed_pages -= 1;
        true
    } else {
        false
    }
}
