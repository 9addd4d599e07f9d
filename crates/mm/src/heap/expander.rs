//! 用内核区域扩展堆

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use sync::SpinLock;

use super::{ExpandHeap, MemoryBlock};
use crate::config::PAGE_SIZE;
use crate::manager::{KernelRegion, MemoryManager};
use crate::memory_space::Access;

/// 同时存在的扩展区域上限
pub const MAX_EXPANSION_REGIONS: usize = 32;

/// 单次扩展的最小字节数
pub const MIN_EXPANSION_SIZE: usize = 256 * 1024;

/// 从 super 池分配物理连续、已清零的内核区域作为子堆
///
/// 区域在 [`MemoryManager`] 就绪后通过 [`Self::attach`] 接入，此前所有扩展请求都被拒绝。
pub struct KernelRegionExpander {
    mm: AtomicPtr<MemoryManager>,
    regions: SpinLock<[Option<KernelRegion>; MAX_EXPANSION_REGIONS]>,
}

impl KernelRegionExpander {
    /// 创建未接入的扩展策略
    pub const fn new() -> Self {
        Self {
            mm: AtomicPtr::new(core::ptr::null_mut()),
            regions: SpinLock::new([None; MAX_EXPANSION_REGIONS]),
        }
    }

    /// 接入内存管理器
    pub fn attach(&self, mm: &'static MemoryManager) {
        self.mm
            .store(mm as *const MemoryManager as *mut MemoryManager, Ordering::Release);
    }

    fn manager(&self) -> Option<&'static MemoryManager> {
        // SAFETY: attach 只接受 'static 引用
        unsafe { self.mm.load(Ordering::Acquire).as_ref() }
    }

    /// 当前持有的扩展区域数
    pub fn region_count(&self) -> usize {
        self.regions.lock().iter().flatten().count()
    }
}

impl Default for KernelRegionExpander {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpandHeap for KernelRegionExpander {
    fn add_memory(&self, request: usize) -> Option<MemoryBlock> {
        let mm = self.manager()?;
        if self.regions.lock().iter().all(Option::is_some) {
            log::warn!("MM: kernel heap expansion limit reached");
            return None;
        }
        let size = request.max(MIN_EXPANSION_SIZE).next_multiple_of(PAGE_SIZE);
        let region = match mm.allocate_contiguous_kernel_region(size, "kernel heap", Access::READ_WRITE) {
            Ok(region) => region,
            Err(err) => {
                log::warn!("MM: kernel heap expansion of {} bytes failed: {}", size, err);
                return None;
            }
        };

        let recorded = {
            let mut regions = self.regions.lock();
            regions.iter_mut().find(|slot| slot.is_none()).map(|slot| *slot = Some(region))
        };
        let start = NonNull::new(mm.arch().virt_ptr(region.start()));
        match (recorded, start) {
            (Some(()), Some(start)) => {
                log::debug!("MM: kernel heap expanded by {} bytes at {}", size, region.start());
                Some(MemoryBlock {
                    start,
                    size: region.size(),
                })
            }
            _ => {
                self.forget(region);
                if let Err(err) = mm.deallocate_kernel_region(region) {
                    log::warn!("MM: kernel heap could not return region: {}", err);
                }
                None
            }
        }
    }

    fn remove_memory(&self, block: MemoryBlock) -> bool {
        let Some(mm) = self.manager() else {
            return false;
        };
        let found = self
            .regions
            .lock()
            .iter()
            .flatten()
            .copied()
            .find(|region| mm.arch().virt_ptr(region.start()) == block.start.as_ptr());
        let Some(region) = found else {
            return false;
        };
        match mm.deallocate_kernel_region(region) {
            Ok(()) => {
                self.forget(region);
                log::debug!("MM: kernel heap returned {} bytes at {}", region.size(), region.start());
                true
            }
            Err(err) => {
                log::warn!("MM: kernel heap could not return region: {}", err);
                false
            }
        }
    }
}

impl KernelRegionExpander {
    fn forget(&self, region: KernelRegion) {
        let mut regions = self.regions.lock();
        if let Some(slot) = regions.iter_mut().find(|slot| **slot == Some(region)) {
            *slot = None;
        }
    }
}
