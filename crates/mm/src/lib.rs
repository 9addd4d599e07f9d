//! 内存核心
//!
//! x86-64 四级分页之上的内核内存管理：
//!
//! - [`frame_allocator`]：物理帧池、引用计数与提交记账
//! - [`page_table`]：页表的建立、遍历与回收，以及按 CPU 的 quickmap 槽位
//! - [`memory_space`]：地址空间与区域
//! - 写时复制：fork 共享整张叶子页表，首次写入时按 2 MiB 组复制
//! - [`tlb`]：跨 CPU 的 TLB 失效广播
//! - [`heap`]：内核堆与全局分配器前端
//!
//! # 架构解耦
//!
//! 硬件访问经 [`ArchMmOps`] 注入，虚拟内存布局经 [`MmConfig`] 注入，
//! 二者在构造 [`MemoryManager`] 时给出，内存核心本身不持有全局状态。
//! 锁依赖 `sync` crate，使用前必须调用 `sync::register_arch_ops`。
//!
//! # 锁顺序
//!
//! 全局递归锁（[`PhysicalAllocator::lock_global`]）→ 地址空间锁 → 内存对象锁。
//! 持有内存对象锁时不得分配物理帧，内存紧张时的清除回调会获取同一把锁。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod arch_ops;
mod cow;
mod error;
mod fault;
mod manager;

pub mod address;
pub mod config;
pub mod frame_allocator;
pub mod heap;
pub mod memory_space;
pub mod page_table;
pub mod tlb;

#[cfg(test)]
mod tests;

pub use arch_ops::ArchMmOps;
pub use config::MmConfig;
pub use error::{MmError, MmResult};
pub use fault::{FaultAccess, PageFault, PageFaultCode, PageFaultResponse};
pub use manager::{KernelRegion, MemoryManager, MemoryStats};
pub use tlb::TlbCoordinator;

pub use address::{AlignOps, Paddr, PaddrRange, Ppn, PpnRange, UsizeConvert, Vaddr, VaddrRange, Vpn};
pub use frame_allocator::{BootInfo, PhysicalAllocator, PoolKind, PoolStats, Purgeable, ShouldZeroFill};
pub use heap::{ExpandHeap, ExpandableHeap, Heap, HeapScrub, KernelHeap, KernelRegionExpander};
pub use memory_space::{
    Access, AddressSpace, AllocationStrategy, CowReserve, Region, RegionBacking, RegionInfo, VmObject,
};
pub use page_table::{PageTableEntry, PageTableManager, PteFlags, SpaceKind};
