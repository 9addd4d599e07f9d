//! 共享匿名内存对象
//!
//! 对象持有自己每一页的一个帧引用，每个映射这些页的表项再各持有一个。
//! 对象本身由映射它的区域通过 `Arc` 共享，最后一个区域解除映射时
//! 由内存管理器调用 [`VmObject::release_pages`]。

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use sync::SpinLock;

use crate::address::Ppn;
use crate::frame_allocator::{PhysicalAllocator, Purgeable};

/// 共享匿名内存对象
pub struct VmObject {
    pages: SpinLock<Vec<Option<Ppn>>>,
    volatile: AtomicBool,
}

impl VmObject {
    /// 创建 `page_count` 页的空对象
    pub fn new(page_count: usize) -> Self {
        Self {
            pages: SpinLock::new(vec![None; page_count]),
            volatile: AtomicBool::new(false),
        }
    }

    /// 页数
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// 已经有帧的页数
    pub fn resident_pages(&self) -> usize {
        self.pages.lock().iter().flatten().count()
    }

    /// 内容可丢弃时，内存紧张会清除对象的页
    pub fn set_volatile(&self, volatile: bool) {
        self.volatile.store(volatile, Ordering::Release);
    }

    /// 是否可丢弃
    pub fn is_volatile(&self) -> bool {
        self.volatile.load(Ordering::Acquire)
    }

    /// 第 `index` 页当前的帧
    pub fn page(&self, index: usize) -> Option<Ppn> {
        self.pages.lock().get(index).copied().flatten()
    }

    /// 安装第 `index` 页。已有帧时返回已有的帧，`frame` 由调用者处理。
    pub(crate) fn install(&self, index: usize, frame: Ppn) -> Result<(), Ppn> {
        let mut pages = self.pages.lock();
        match pages.get_mut(index) {
            Some(Some(existing)) => Err(*existing),
            Some(slot) => {
                *slot = Some(frame);
                Ok(())
            }
            None => Err(frame),
        }
    }

    /// 放弃对象持有的全部帧引用
    pub fn release_pages(&self, allocator: &PhysicalAllocator) -> usize {
        let frames: Vec<Ppn> = self.pages.lock().iter_mut().filter_map(Option::take).collect();
        frames.into_iter().filter(|ppn| allocator.unref_frame(*ppn)).count()
    }
}

impl Purgeable for VmObject {
    fn purge(&self, allocator: &PhysicalAllocator) -> usize {
        if !self.is_volatile() {
            return 0;
        }
        let freed = self.release_pages(allocator);
        debug!("MM: purged {} frames from a volatile object", freed);
        freed
    }
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject")
            .field("pages", &self.page_count())
            .field("resident", &self.resident_pages())
            .field("volatile", &self.is_volatile())
            .finish()
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let resident = self.pages.get_mut().iter().flatten().count();
        if resident != 0 {
            warn!("MM: shared object dropped with {} resident pages", resident);
        }
    }
}
