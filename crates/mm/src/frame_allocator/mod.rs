//! 物理帧分配器
//!
//! 本模块把固件内存映射整理成若干物理区域（[`PhysicalRegion`]），并维护两个池：
//!
//! - **user 池**：页表、匿名内存、内核区域使用的普通帧，支持提交（commit）记账
//! - **super 池**：启动时预留的一段连续帧，只服务需要物理连续的内核区域
//!
//! ## 提交记账
//!
//! user 池的每一帧在任意时刻恰好处于三种状态之一：
//!
//! - `uncommitted`：空闲且没有被任何人预留
//! - `committed`：空闲，但已经通过 [`PhysicalAllocator::commit`] 预留给某个将来的分配
//! - `used`：已分配
//!
//! 因此 `committed + uncommitted + used == total` 始终成立。
//! 带 `committed` 标志的分配消耗预留额度，不会失败；
//! 不带标志的分配在池耗尽时会对所有可清除对象调用一次 `purge` 后重试一次，这是唯一的重试路径。
//!
//! ## 并发
//!
//! 全部状态由一把全局递归自旋锁保护。该锁同时也是全局虚拟内存簿记锁
//! （见 [`PhysicalAllocator::lock_global`]），同一 CPU 可以嵌套获取。

mod frame_table;
mod memory_map;
mod region;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;

use log::{info, warn};
use sync::{RecursiveSpinLock, RecursiveSpinLockGuard};

pub use frame_table::{FrameEntry, FrameTable};
pub use memory_map::{
    BootInfo, MemoryLayout, MemoryMapEntry, MemoryRangeType, ReservedRange, UsedRange,
    UsedRangeKind,
};
pub use region::{PhysicalRegion, PoolKind};

use crate::address::{Paddr, PaddrRange, Ppn, PpnRange, UsizeConvert};
use crate::arch_ops::ArchMmOps;
use crate::config::{MmConfig, PAGE_SIZE};
use crate::error::{MmError, MmResult, corruption};

/// 可在内存紧张时释放帧的对象（例如被标记为 volatile 的匿名内存对象）
pub trait Purgeable: Send + Sync {
    /// 释放能释放的帧，返回释放的帧数
    fn purge(&self, allocator: &PhysicalAllocator) -> usize;
}

/// 池的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 总帧数
    pub total: usize,
    /// 已分配帧数
    pub used: usize,
    /// 已预留但未分配的帧数
    pub committed: usize,
    /// 既未预留也未分配的帧数
    pub uncommitted: usize,
}

impl PoolStats {
    /// `committed + uncommitted + used == total`
    pub fn is_consistent(&self) -> bool {
        self.committed + self.uncommitted + self.used == self.total
    }
}

/// 全局锁保护的状态
pub struct PhysicalState {
    regions: Vec<PhysicalRegion>,
    user: PoolStats,
    super_pool: PoolStats,
    purgeables: Vec<Weak<dyn Purgeable>>,
}

impl PhysicalState {
    fn pool_mut(&mut self, pool: PoolKind) -> &mut PoolStats {
        match pool {
            PoolKind::User => &mut self.user,
            PoolKind::Super => &mut self.super_pool,
        }
    }

    /// 取出一帧并更新计数
    fn take(&mut self, pool: PoolKind, committed: bool) -> Option<Ppn> {
        let stats = self.pool_mut(pool);
        if committed {
            if stats.committed == 0 {
                corruption("committed allocation without a matching commit");
            }
        } else if stats.uncommitted == 0 {
            return None;
        }

        let ppn = self
            .regions
            .iter_mut()
            .filter(|r| r.pool() == pool)
            .find_map(PhysicalRegion::take_free_frame);
        let Some(ppn) = ppn else {
            corruption("pool counters report free frames but every region bitmap is full");
        };

        let stats = self.pool_mut(pool);
        if committed {
            stats.committed -= 1;
        } else {
            stats.uncommitted -= 1;
        }
        stats.used += 1;
        Some(ppn)
    }

    fn take_contiguous(&mut self, count: usize, align_pages: usize) -> Option<Ppn> {
        if self.super_pool.uncommitted < count {
            return None;
        }
        let ppn = self
            .regions
            .iter_mut()
            .filter(|r| r.pool() == PoolKind::Super)
            .find_map(|r| r.take_contiguous_free_frames(count, align_pages))?;
        self.super_pool.uncommitted -= count;
        self.super_pool.used += count;
        Some(ppn)
    }
}

/// 全局内存管理锁的守卫
pub struct GlobalLock<'a> {
    _guard: RecursiveSpinLockGuard<'a, RefCell<PhysicalState>>,
}

/// 物理帧分配器
pub struct PhysicalAllocator {
    state: RecursiveSpinLock<RefCell<PhysicalState>>,
    frames: FrameTable,
    layout: MemoryLayout,
}

impl PhysicalAllocator {
    /// 解析内存映射并建立帧池
    pub fn initialize(
        arch: &dyn ArchMmOps,
        config: &dyn MmConfig,
        boot: &BootInfo<'_>,
    ) -> MmResult<Self> {
        let mut layout = MemoryLayout::parse(boot);
        let mut ranges: Vec<PpnRange> = layout
            .usable
            .iter()
            .map(|r| {
                PpnRange::new(
                    Ppn::from_addr_floor(r.start),
                    Ppn::from_addr_floor(r.end),
                )
            })
            .collect();

        let super_frames = config.super_pool_frames();
        let super_range = if super_frames > 0 {
            let Some(range) = carve_from_first_fitting(&mut ranges, super_frames) else {
                warn!("MM: no physical range can hold the {} frame super pool", super_frames);
                return Err(MmError::OutOfMemory);
            };
            layout.mark_used(UsedRangeKind::SuperPool, ppn_range_to_paddr(range));
            Some(range)
        } else {
            None
        };

        let highest = ranges
            .iter()
            .chain(super_range.iter())
            .map(|r| r.end.as_usize())
            .max()
            .unwrap_or(0);
        let metadata_frames = FrameTable::frames_needed(highest);
        let Some(metadata) = carve_from_first_fitting(&mut ranges, metadata_frames) else {
            warn!("MM: no physical range can hold {} frames of frame metadata", metadata_frames);
            return Err(MmError::OutOfMemory);
        };
        layout.mark_used(UsedRangeKind::FrameMetadata, ppn_range_to_paddr(metadata));
        info!(
            "MM: frame metadata for {} pages at {} ({} frames)",
            highest,
            metadata.start.start_addr(),
            metadata_frames
        );
        // SAFETY: 这些帧刚从可用内存中切出，没有其他使用者
        let frames = unsafe {
            FrameTable::new(arch.phys_to_virt(metadata.start.start_addr()), highest, metadata)
        };

        let mut regions = Vec::new();
        let mut user = PoolStats::default();
        let mut super_pool = PoolStats::default();
        if let Some(range) = super_range {
            regions.push(PhysicalRegion::new(0, PoolKind::Super, range));
            super_pool.total = range.len();
            super_pool.uncommitted = range.len();
        }
        for range in ranges.into_iter().filter(|r| !r.is_empty()) {
            let id = regions.len() as u32;
            regions.push(PhysicalRegion::new(id, PoolKind::User, range));
            user.total += range.len();
            user.uncommitted += range.len();
        }
        for region in &regions {
            for ppn in region.range().iter() {
                if let Some(entry) = frames.entry(ppn) {
                    entry.set_owner(region.id());
                }
            }
            info!(
                "MM: {:?} physical region {}..{} ({} frames)",
                region.pool(),
                region.range().start.start_addr(),
                region.range().end.start_addr(),
                region.size()
            );
        }
        info!(
            "MM: user pool {} frames, super pool {} frames",
            user.total, super_pool.total
        );

        Ok(Self {
            state: RecursiveSpinLock::new(RefCell::new(PhysicalState {
                regions,
                user,
                super_pool,
                purgeables: Vec::new(),
            })),
            frames,
            layout,
        })
    }

    /// 获取全局内存管理锁。同一 CPU 可以嵌套获取。
    pub fn lock_global(&self) -> GlobalLock<'_> {
        GlobalLock {
            _guard: self.state.lock(),
        }
    }

    /// 分配一帧，新帧的引用计数为 1。
    ///
    /// `committed` 为真时消耗之前 [`Self::commit`] 预留的额度，不会失败。
    /// 否则在池耗尽时清除一次可清除对象后重试一次。
    pub fn allocate(&self, pool: PoolKind, committed: bool) -> Option<Ppn> {
        let guard = self.state.lock();
        let first = guard.borrow_mut().take(pool, committed);
        let ppn = match first {
            Some(ppn) => ppn,
            None if pool == PoolKind::Super => return None,
            None => {
                let purgeables: Vec<Arc<dyn Purgeable>> = {
                    let mut state = guard.borrow_mut();
                    state.purgeables.retain(|p| p.strong_count() > 0);
                    state.purgeables.iter().filter_map(Weak::upgrade).collect()
                };
                warn!(
                    "MM: user pool exhausted, purging {} purgeable objects",
                    purgeables.len()
                );
                // 清除回调会释放帧，此时不能持有状态的借用
                let purged: usize = purgeables.iter().map(|p| p.purge(self)).sum();
                drop(purgeables);
                match guard.borrow_mut().take(pool, false) {
                    Some(ppn) => ppn,
                    None => {
                        warn!("MM: no physical frames available after purging {} frames", purged);
                        return None;
                    }
                }
            }
        };
        self.reset_frame(ppn, 1);
        Some(ppn)
    }

    /// 从 super 池分配 `count` 个物理连续的帧，起始帧号按 `align_pages` 对齐
    pub fn allocate_contiguous(&self, count: usize, align_pages: usize) -> Option<PpnRange> {
        let guard = self.state.lock();
        let start = guard.borrow_mut().take_contiguous(count, align_pages)?;
        let range = PpnRange::from_start_len(start, count);
        for ppn in range.iter() {
            self.reset_frame(ppn, 1);
        }
        Some(range)
    }

    fn reset_frame(&self, ppn: Ppn, count: u32) {
        match self.frames.entry(ppn) {
            Some(entry) => entry.reset(count),
            None => corruption("allocated frame lies beyond the frame metadata array"),
        }
    }

    /// 归还一帧
    ///
    /// # Panics
    /// 找不到所属区域或重复释放时视为内存记账损坏。
    pub fn deallocate(&self, ppn: Ppn) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let Some(index) = state.regions.iter().position(|r| r.contains(ppn)) else {
            log::error!(
                "MM: deallocate couldn't figure out region for frame @ {}",
                ppn.start_addr()
            );
            corruption("freed frame is not owned by any physical region");
        };
        let region = &mut state.regions[index];
        let owner = self.frames.entry(ppn).and_then(FrameEntry::owner);
        if owner != Some(region.id()) {
            corruption("frame metadata owner disagrees with containing region");
        }
        if let Err(what) = region.return_frame(ppn) {
            log::error!("MM: bad free of frame @ {}", ppn.start_addr());
            corruption(what);
        }
        let pool = region.pool();
        let stats = state.pool_mut(pool);
        stats.used -= 1;
        stats.uncommitted += 1;
        drop(state);
        self.reset_frame(ppn, 0);
    }

    /// 增加一帧的引用计数。不受管理的帧（例如设备内存）被忽略。
    pub fn ref_frame(&self, ppn: Ppn) {
        if let Some(entry) = self.frames.entry(ppn).filter(|e| e.owner().is_some()) {
            if entry.increment() == 0 {
                corruption("reference taken on a free frame");
            }
        }
    }

    /// 释放一帧的引用，最后一个引用释放时归还该帧。返回是否已归还。
    pub fn unref_frame(&self, ppn: Ppn) -> bool {
        let Some(entry) = self.frames.entry(ppn).filter(|e| e.owner().is_some()) else {
            return false;
        };
        match entry.decrement() {
            0 => corruption("frame reference count underflow"),
            1 => {
                self.deallocate(ppn);
                true
            }
            _ => false,
        }
    }

    /// 一帧的引用计数，不受管理的帧返回 `None`
    pub fn ref_count(&self, ppn: Ppn) -> Option<u32> {
        self.frames
            .entry(ppn)
            .filter(|e| e.owner().is_some())
            .map(FrameEntry::ref_count)
    }

    /// 预留 `n` 帧，保证之后 `n` 次带 `committed` 标志的分配成功
    pub fn commit(&self, n: usize) -> MmResult<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.user.uncommitted < n {
            return Err(MmError::OutOfMemory);
        }
        state.user.uncommitted -= n;
        state.user.committed += n;
        Ok(())
    }

    /// 撤销 `n` 帧的预留
    ///
    /// # Panics
    /// 撤销量超过当前预留量视为记账损坏。
    pub fn uncommit(&self, n: usize) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.user.committed < n {
            corruption("uncommit of more frames than are committed");
        }
        state.user.committed -= n;
        state.user.uncommitted += n;
    }

    /// 池的计数快照
    pub fn stats(&self, pool: PoolKind) -> PoolStats {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        *state.pool_mut(pool)
    }

    /// 检查池计数与区域位图一致
    ///
    /// # Panics
    /// 任何不一致都视为记账损坏。
    pub fn verify_invariants(&self) {
        let guard = self.state.lock();
        let state = guard.borrow();
        for (pool, stats) in [(PoolKind::User, state.user), (PoolKind::Super, state.super_pool)] {
            if !stats.is_consistent() {
                corruption("committed + uncommitted + used != total");
            }
            let used: usize = state
                .regions
                .iter()
                .filter(|r| r.pool() == pool)
                .map(PhysicalRegion::used)
                .sum();
            if used != stats.used {
                corruption("pool used counter disagrees with region bitmaps");
            }
        }
    }

    /// 注册一个可清除对象
    pub fn register_purgeable(&self, object: Weak<dyn Purgeable>) {
        let guard = self.state.lock();
        guard.borrow_mut().purgeables.push(object);
    }

    /// 物理内存布局
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// 帧元数据数组
    pub fn frame_table(&self) -> &FrameTable {
        &self.frames
    }

    /// 物理区间能否映射给用户态
    pub fn is_allowed_to_map_to_userspace(&self, start: Paddr, size: usize) -> bool {
        self.layout.is_allowed_to_map_to_userspace(start, size)
    }

    /// 该帧当前是否处于某个区域的已分配状态
    pub fn is_allocated(&self, ppn: Ppn) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.regions.iter().any(|r| r.is_allocated(ppn))
    }
}

fn carve_from_first_fitting(ranges: &mut Vec<PpnRange>, count: usize) -> Option<PpnRange> {
    let index = ranges.iter().position(|r| r.len() >= count)?;
    let range = &mut ranges[index];
    let carved = PpnRange::from_start_len(range.start, count);
    range.start = carved.end;
    if range.is_empty() {
        ranges.remove(index);
    }
    Some(carved)
}

fn ppn_range_to_paddr(range: PpnRange) -> PaddrRange {
    PaddrRange::new(range.start.start_addr(), range.end.start_addr())
}

/// 分配后是否清零
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldZeroFill {
    /// 清零
    Yes,
    /// 保留原内容
    No,
}

const _: () = assert!(PAGE_SIZE % core::mem::size_of::<FrameEntry>() == 0);
