//! 递归自旋锁
//!
//! 基于 `lock_api::ReentrantMutex` 构建：同一 CPU 可以嵌套获取，
//! 其它 CPU 则自旋等待。最外层获取时禁用本地中断，最外层释放时恢复。
//!
//! 所有者标识取 `cpu_id + 1`。持锁期间中断已关闭、执行流不会迁移，
//! 因此“当前 CPU 与所有者相同”等价于“当前执行流就是持锁者”。

use crate::arch_ops;
use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use lock_api::{GetThreadId, GuardNoSend, RawMutex};

/// 关中断的原始自旋互斥量，实现 [`lock_api::RawMutex`]。
///
/// 获取时保存并关闭中断，释放时恢复保存的状态。
pub struct RawIrqSpinMutex {
    locked: AtomicBool,
    saved_flags: AtomicUsize,
}

unsafe impl RawMutex for RawIrqSpinMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawIrqSpinMutex {
        locked: AtomicBool::new(false),
        saved_flags: AtomicUsize::new(0),
    };

    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        // SAFETY: 保存的 flags 在 unlock 时恢复。
        let flags = unsafe { arch_ops().read_and_disable_interrupts() };
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                arch_ops().relax();
            }
        }
        self.saved_flags.store(flags, Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        // SAFETY: 失败时立即恢复。
        let flags = unsafe { arch_ops().read_and_disable_interrupts() };
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.saved_flags.store(flags, Ordering::Relaxed);
            true
        } else {
            unsafe { arch_ops().restore_interrupts(flags) };
            false
        }
    }

    unsafe fn unlock(&self) {
        let flags = self.saved_flags.load(Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        // SAFETY: flags 来自 lock/try_lock 保存的值
        unsafe { arch_ops().restore_interrupts(flags) };
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// 以 CPU 编号作为 `ReentrantMutex` 的所有者标识。
pub struct CpuOwnerId;

unsafe impl GetThreadId for CpuOwnerId {
    const INIT: Self = CpuOwnerId;

    fn nonzero_thread_id(&self) -> NonZeroUsize {
        // cpu_id + 1 不可能为 0
        NonZeroUsize::MIN.saturating_add(arch_ops().cpu_id())
    }
}

/// 按 CPU 可重入的自旋锁。
///
/// 守卫只提供共享引用，需要修改的数据应放在 `RefCell` 中。
///
/// # 示例
/// ```ignore
/// let lock = RecursiveSpinLock::new(RefCell::new(0));
/// let outer = lock.lock();
/// let inner = lock.lock(); // 同一 CPU 上不会死锁
/// *inner.borrow_mut() += 1;
/// ```
pub type RecursiveSpinLock<T> = lock_api::ReentrantMutex<RawIrqSpinMutex, CpuOwnerId, T>;

/// [`RecursiveSpinLock`] 的守卫
pub type RecursiveSpinLockGuard<'a, T> =
    lock_api::ReentrantMutexGuard<'a, RawIrqSpinMutex, CpuOwnerId, T>;
