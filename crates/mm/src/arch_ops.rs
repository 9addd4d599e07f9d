//! 架构相关内存管理操作
//!
//! 所有直接的硬件访问（控制寄存器、TLB 失效、处理器间中断）都隔离在 [`ArchMmOps`] 之后。
//! 每个目标架构实现一次，注入 [`crate::MemoryManager`]。

use crate::address::{Paddr, Vaddr};

/// 架构相关内存管理操作
pub trait ArchMmOps: Send + Sync {
    /// 启动阶段的永久映射：返回可直接访问物理地址 `paddr` 的指针。
    ///
    /// 只用于启动结构（帧元数据数组、引导页表、quickmap 页表）。
    /// 任意物理帧的访问必须通过 quickmap。
    fn phys_to_virt(&self, paddr: Paddr) -> *mut u8;

    /// 经 MMU 访问当前 CPU 上的虚拟地址。
    ///
    /// 真实硬件上是恒等转换；模拟环境在这里执行页表遍历与 TLB 查找。
    fn virt_ptr(&self, vaddr: Vaddr) -> *mut u8;

    /// 当前 CPU 编号
    fn cpu_id(&self) -> usize;

    /// CPU 数量
    fn num_cpus(&self) -> usize;

    /// 本地中断是否开启
    fn interrupts_enabled(&self) -> bool;

    /// 当前是否处于中断处理上下文
    fn in_irq(&self) -> bool;

    /// 读取当前 CPU 的根页表物理地址（CR3）
    fn read_root_table(&self) -> Paddr;

    /// 写入当前 CPU 的根页表物理地址
    ///
    /// # Safety
    /// `root` 必须是一个完整的根页表，内核半区与当前正在执行的代码一致。
    unsafe fn write_root_table(&self, root: Paddr);

    /// 使当前 CPU 上一页的翻译失效
    fn invalidate_page(&self, vaddr: Vaddr);

    /// 使当前 CPU 上全部翻译失效（包括全局项）
    fn invalidate_all(&self);

    /// 向指定 CPU 发送处理器间中断，目标应调用 [`crate::TlbCoordinator::process_pending`]
    fn send_ipi(&self, cpu: usize);
}
