//! 自旋锁
//!
//! 在 [`RawSpinLock`] 之上携带被保护的数据。持锁期间本地中断保持关闭，
//! 因此同一把锁也可以在中断处理路径里使用。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::raw_spin_lock::{RawSpinLock, RawSpinLockGuard};

/// 带数据的自旋锁
///
/// # 示例
/// ```ignore
/// static COUNTER: SpinLock<usize> = SpinLock::new(0);
/// *COUNTER.lock() += 1;
/// ```
///
/// 不可重入：同一 CPU 在持锁时再次 `lock` 会永远自旋。
/// 可能在同一 CPU 上嵌套获取的场景请使用 [`crate::RecursiveSpinLock`]，
/// 需要检测嵌套的场景请使用 [`SpinLock::try_lock`]。
#[derive(Debug)]
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// Safety: 对 data 的访问总是经过 raw 的互斥
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建自旋锁
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// 获取锁
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        SpinLockGuard {
            lock: self,
            _raw: self.raw.lock(),
        }
    }

    /// 立即尝试获取锁，锁已被占用时返回 `None`
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let raw = self.raw.try_lock()?;
        Some(SpinLockGuard { lock: self, _raw: raw })
    }

    /// 持有独占引用时无需加锁
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// 取出数据
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// 锁当前是否被占用，结果只适合用于断言
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// [`SpinLock`] 的守卫，drop 时先释放锁再恢复中断
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    _raw: RawSpinLockGuard<'a>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: 守卫存活期间锁被本 CPU 独占
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: 同上
        unsafe { &mut *self.lock.data.get() }
    }
}
