//! 内存管理配置
//!
//! 编译期常量描述 x86-64 四级分页的固定几何；
//! 运行期的虚拟内存布局由启动代码实现 [`MmConfig`] 并注入 [`crate::MemoryManager`]。

use crate::address::{Vaddr, VaddrRange};

/// 页大小
pub const PAGE_SIZE: usize = 4096;
/// 页大小的位移
pub const PAGE_SHIFT: usize = 12;
/// 每级页表的项数
pub const ENTRIES_PER_TABLE: usize = 512;
/// 页表级数（PML4、PDPT、PD、PT）
pub const PAGE_TABLE_LEVELS: usize = 4;
/// 支持的最大 CPU 数量（受 TLB 挂起位图宽度限制）
pub const MAX_CPUS: usize = 64;
/// 低端内存的结束地址，这部分永远不交给分配器
pub const LOW_MEMORY_END: usize = 0x10_0000;
/// 根页表中内核半区的第一个索引
pub const KERNEL_ROOT_INDEX: usize = 256;
/// 内核半区的起始地址
pub const KERNEL_SPACE_BASE: usize = 0xffff_8000_0000_0000;
/// TLB 消息池容量
pub const TLB_MESSAGE_POOL_SIZE: usize = 64;
/// 内核堆的分块大小
pub const HEAP_CHUNK_SIZE: usize = 32;
/// 内核堆从首次适配切换到最佳适配的分块数阈值
pub const BEST_FIT_THRESHOLD: usize = 128;

/// 内存布局配置
///
/// 此 trait 提供内存管理所需的布局参数。内核启动代码实现并注入。
pub trait MmConfig: Send + Sync {
    /// 用户地址空间的结束地址（不包含）
    fn user_space_end(&self) -> Vaddr;

    /// 内核区域（`allocate_kernel_region` 等）可使用的虚拟地址窗口
    fn kernel_region_window(&self) -> VaddrRange;

    /// 恒等映射区域（虚拟地址等于物理地址）可使用的窗口
    fn identity_window(&self) -> VaddrRange;

    /// quickmap 槽位的起始地址，必须 2 MiB 对齐且位于内核半区
    fn quickmap_base(&self) -> Vaddr;

    /// super 池的帧数
    fn super_pool_frames(&self) -> usize {
        256
    }

    /// 内核堆是否写入填充字节以暴露释放后使用
    fn heap_scrub(&self) -> bool {
        cfg!(debug_assertions)
    }

    /// 超过此页数的范围刷新改为整体刷新
    fn tlb_full_flush_threshold(&self) -> usize {
        32
    }
}
