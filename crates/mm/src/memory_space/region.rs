//! 地址空间中的区域
//!
//! 区域描述一段虚拟地址的访问权限和后备内存。页表项只是区域的缓存：
//! 缺页时总是先查区域，再决定如何建立表项。

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use super::vm_object::VmObject;
use crate::address::{Paddr, Vaddr, VaddrRange};

bitflags! {
    /// 区域访问权限
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        /// 可读
        const READ = 1 << 0;
        /// 可写
        const WRITE = 1 << 1;
        /// 可执行
        const EXECUTE = 1 << 2;
    }
}

impl Access {
    /// 读写
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
}

/// 匿名内存的物理帧分配策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// 建立区域时提交全部页数，之后的按需分配不会失败
    Reserve,
    /// 建立区域时立即分配并映射全部页
    AllocateNow,
    /// 不预留，按需分配可能失败
    None,
}

/// 区域的后备内存
#[derive(Debug, Clone)]
pub enum RegionBacking {
    /// 私有匿名内存，fork 后写时复制
    Anonymous {
        /// 分配策略
        strategy: AllocationStrategy,
        /// 尚未消耗的提交额度
        committed_pages: usize,
        /// fork 时为写时复制预留的额度，区域的所有副本共用
        cow_reserve: Option<Arc<CowReserve>>,
    },
    /// 共享匿名对象，所有映射它的区域看到同一组帧
    Shared(Arc<VmObject>),
    /// 固定的物理内存（设备内存或预先分配的连续帧）
    Physical {
        /// 区域起点对应的物理地址
        base: Paddr,
    },
}

impl RegionBacking {
    /// 私有匿名内存
    pub fn anonymous(strategy: AllocationStrategy) -> Self {
        Self::Anonymous {
            strategy,
            committed_pages: 0,
            cow_reserve: None,
        }
    }

    /// 写时复制时是否与原表项共享同一帧
    pub fn shares_frames(&self) -> bool {
        matches!(self, Self::Shared(_) | Self::Physical { .. })
    }
}

/// 写时复制预留额度
///
/// fork 时按区域中已驻留的私有页数提交，之后每复制一帧消耗一份。
/// 最后一个持有者释放时，剩余额度归还给帧分配器。
#[derive(Debug, Default)]
pub struct CowReserve {
    pages: AtomicUsize,
}

impl CowReserve {
    /// 剩余额度
    pub fn pages(&self) -> usize {
        self.pages.load(Ordering::Acquire)
    }

    pub(crate) fn add(&self, pages: usize) {
        self.pages.fetch_add(pages, Ordering::AcqRel);
    }

    /// 消耗一份额度，额度用尽时返回 `false`
    pub(crate) fn take(&self) -> bool {
        self.pages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pages| pages.checked_sub(1))
            .is_ok()
    }
}

/// 区域的快照，不持有区域的后备内存
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// 虚拟地址范围
    pub range: VaddrRange,
    /// 访问权限
    pub access: Access,
    /// 用户态是否可访问
    pub user: bool,
    /// 是否为线程栈
    pub stack: bool,
    /// 是否映射共享对象
    pub shared: bool,
    /// 名称
    pub name: String,
}

/// 区域
#[derive(Debug, Clone)]
pub struct Region {
    range: VaddrRange,
    access: Access,
    user: bool,
    cacheable: bool,
    stack: bool,
    name: String,
    pub(crate) backing: RegionBacking,
}

impl Region {
    /// 创建区域描述，映射到地址空间时才生效
    pub fn new(range: VaddrRange, access: Access, name: &str, backing: RegionBacking) -> Self {
        Self {
            range,
            access,
            user: false,
            cacheable: true,
            stack: false,
            name: String::from(name),
            backing,
        }
    }

    /// 设置是否可缓存
    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// 标记为线程栈
    pub fn with_stack(mut self, stack: bool) -> Self {
        self.stack = stack;
        self
    }

    pub(crate) fn set_user(&mut self, user: bool) {
        self.user = user;
    }

    /// 虚拟地址范围
    pub fn range(&self) -> VaddrRange {
        self.range
    }

    /// 访问权限
    pub fn access(&self) -> Access {
        self.access
    }

    /// 用户态是否可访问
    pub fn is_user(&self) -> bool {
        self.user
    }

    /// 是否可缓存
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// 是否为线程栈
    pub fn is_stack(&self) -> bool {
        self.stack
    }

    /// 名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 后备内存
    pub fn backing(&self) -> &RegionBacking {
        &self.backing
    }

    /// 快照
    pub fn info(&self) -> RegionInfo {
        RegionInfo {
            range: self.range,
            access: self.access,
            user: self.user,
            stack: self.stack,
            shared: matches!(self.backing, RegionBacking::Shared(_)),
            name: self.name.clone(),
        }
    }

    /// fork 后的写时复制预留
    pub fn cow_reserve(&self) -> Option<&CowReserve> {
        match &self.backing {
            RegionBacking::Anonymous { cow_reserve, .. } => cow_reserve.as_deref(),
            _ => None,
        }
    }

    /// 页在区域中的下标
    pub fn page_index(&self, vaddr: Vaddr) -> usize {
        (vaddr.0 - self.range.start.0) / crate::config::PAGE_SIZE
    }
}
