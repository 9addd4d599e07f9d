//! 线程局部的 CPU 状态
//!
//! 每个测试线程通过 [`bind_cpu`] 绑定到一个模拟 CPU。
//! 中断使能位和“是否处于中断上下文”同样是线程局部的。

use std::cell::Cell;

/// RFLAGS.IF
pub const INTERRUPT_ENABLE_MASK: usize = 1 << 9;

thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(0) };
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
    static IN_IRQ: Cell<bool> = const { Cell::new(false) };
    static RELAX_HOOK: Cell<Option<fn()>> = const { Cell::new(None) };
}

/// 将当前线程绑定为指定 CPU
pub fn bind_cpu(id: usize) {
    CPU_ID.with(|c| c.set(id));
}

/// 当前线程扮演的 CPU
pub fn current_cpu() -> usize {
    CPU_ID.with(Cell::get)
}

/// 当前 CPU 的中断是否开启
pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.with(Cell::get)
}

/// 标记当前线程是否正在处理中断
pub fn set_in_irq(value: bool) {
    IN_IRQ.with(|c| c.set(value));
}

/// 当前线程是否正在处理中断
pub fn in_irq() -> bool {
    IN_IRQ.with(Cell::get)
}

/// 设置自旋等待时调用的钩子
pub fn set_relax_hook(hook: Option<fn()>) {
    RELAX_HOOK.with(|c| c.set(hook));
}

/// Mock 架构操作
///
/// 所有状态都是线程局部的，因此可以作为 `'static` 单例被多个测试线程共享。
pub struct MockArchOps;

impl MockArchOps {
    /// 创建实例
    pub const fn new() -> Self {
        Self
    }

    /// 读取并关闭中断
    ///
    /// # Safety
    /// 与真实实现保持相同的签名，mock 本身没有不安全操作。
    pub unsafe fn read_and_disable_interrupts(&self) -> usize {
        let was = INTERRUPTS_ENABLED.with(|c| c.replace(false));
        if was { INTERRUPT_ENABLE_MASK } else { 0 }
    }

    /// 恢复中断状态
    ///
    /// # Safety
    /// flags 必须来自 [`Self::read_and_disable_interrupts`]
    pub unsafe fn restore_interrupts(&self, flags: usize) {
        INTERRUPTS_ENABLED.with(|c| c.set(flags & INTERRUPT_ENABLE_MASK != 0));
    }

    /// 中断使能位掩码
    pub fn interrupt_enable_mask(&self) -> usize {
        INTERRUPT_ENABLE_MASK
    }

    /// 当前 CPU
    pub fn cpu_id(&self) -> usize {
        current_cpu()
    }

    /// 自旋等待钩子
    pub fn relax(&self) {
        match RELAX_HOOK.with(Cell::get) {
            Some(hook) => hook(),
            None => std::hint::spin_loop(),
        }
    }
}

impl Default for MockArchOps {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_ARCH_OPS: MockArchOps = MockArchOps::new();
