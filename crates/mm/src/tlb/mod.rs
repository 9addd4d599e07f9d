//! TLB 协调器
//!
//! 维护各 CPU 翻译缓存的一致性：
//!
//! - [`TlbCoordinator::flush_local`]：只失效本 CPU，适用于别处不可能缓存的变化
//! - [`TlbCoordinator::flush_broadcast`]：失效本 CPU 后，向其它在线 CPU 发送请求并等待全部确认。
//!   返回之后，任何 CPU 都不会再使用旧的翻译，对应的帧才可以被重新使用。
//!
//! 每个 CPU 有一个挂起位图，位 `i` 表示消息池第 `i` 个槽位有发给它的消息。
//! 处理器间中断只是提醒；消息真正被处理是在目标 CPU 排空自己的挂起队列时，
//! 包括在中断处理函数里、离开 [`CriticalSection`] 时、以及任何自旋等待期间。
//! 等待确认的发送方自己也在排空队列，两个 CPU 同时广播不会互相死等。

mod message;

use core::sync::atomic::{AtomicU64, Ordering};

use log::trace;
use sync::IntrGuard;

pub use message::{MessageKind, MessagePool};

use crate::address::{Paddr, Vaddr};
use crate::arch_ops::ArchMmOps;
use crate::config::{MAX_CPUS, MmConfig, PAGE_SIZE};
use crate::error::corruption;

/// TLB 协调器
pub struct TlbCoordinator {
    arch: &'static dyn ArchMmOps,
    full_flush_threshold: usize,
    pool: MessagePool,
    pending: [AtomicU64; MAX_CPUS],
    online: AtomicU64,
}

impl TlbCoordinator {
    /// 创建协调器，当前 CPU 视为在线
    pub fn new(arch: &'static dyn ArchMmOps, config: &dyn MmConfig) -> Self {
        assert!(arch.num_cpus() <= MAX_CPUS, "more CPUs than TLB pending bitmaps");
        Self {
            arch,
            full_flush_threshold: config.tlb_full_flush_threshold(),
            pool: MessagePool::new(),
            pending: core::array::from_fn(|_| AtomicU64::new(0)),
            online: AtomicU64::new(1 << arch.cpu_id()),
        }
    }

    /// 标记一个 CPU 上线，此后它会收到广播
    pub fn set_online(&self, cpu: usize) {
        self.online.fetch_or(1 << cpu, Ordering::AcqRel);
    }

    /// 在线 CPU 位图
    pub fn online_cpus(&self) -> u64 {
        self.online.load(Ordering::Acquire)
    }

    /// 消息池
    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }

    /// 只失效本 CPU 上的翻译
    ///
    /// `root` 不为空时，只有本 CPU 正在使用该地址空间才需要失效。
    pub fn flush_local(&self, root: Option<Paddr>, start: Vaddr, pages: usize) {
        if let Some(root) = root {
            if self.arch.read_root_table() != root {
                return;
            }
        }
        if pages > self.full_flush_threshold {
            self.arch.invalidate_all();
        } else {
            for i in 0..pages {
                self.arch.invalidate_page(start + i * PAGE_SIZE);
            }
        }
    }

    /// 失效所有 CPU 上的翻译，等待全部确认后返回
    pub fn flush_broadcast(&self, root: Option<Paddr>, start: Vaddr, pages: usize) {
        let _irq = IntrGuard::new();
        self.flush_local(root, start, pages);
        self.send(MessageKind::FlushRange { root, start, pages }, true);
    }

    /// 在其它所有 CPU 上执行回调。`wait` 为假时不等待确认。
    pub fn broadcast_callback(&self, func: fn(usize), arg: usize, wait: bool) {
        let _irq = IntrGuard::new();
        self.send(MessageKind::Callback { func, arg }, wait);
    }

    fn send(&self, kind: MessageKind, wait: bool) {
        let me = self.arch.cpu_id();
        let cpu_mask = if self.arch.num_cpus() >= 64 {
            u64::MAX
        } else {
            (1u64 << self.arch.num_cpus()) - 1
        };
        let targets = self.online_cpus() & cpu_mask & !(1 << me);
        if targets == 0 {
            return;
        }

        let index = loop {
            if let Some(index) = self.pool.try_acquire() {
                break index;
            }
            // 池耗尽时其它 CPU 可能正等着本 CPU 确认
            self.process_pending();
            core::hint::spin_loop();
        };
        let slot = self.pool.slot(index);
        *slot.kind.lock() = Some(kind);
        slot.is_async.store(!wait, Ordering::Release);
        slot.refs.store(targets.count_ones(), Ordering::Release);

        let mut remaining = targets;
        while remaining != 0 {
            let cpu = remaining.trailing_zeros() as usize;
            remaining &= remaining - 1;
            self.pending[cpu].fetch_or(1 << index, Ordering::AcqRel);
            self.arch.send_ipi(cpu);
        }
        trace!("TLB: cpu {} sent {:?} to {:#x}", me, kind, targets);

        if wait {
            while slot.refs.load(Ordering::Acquire) != 0 {
                self.process_pending();
                core::hint::spin_loop();
            }
            self.pool.release(index);
        }
    }

    /// 处理发给本 CPU 的全部挂起消息，返回处理的条数。处理器间中断的处理函数调用它。
    pub fn process_pending(&self) -> usize {
        let _irq = IntrGuard::new();
        let me = self.arch.cpu_id();
        let mut bits = self.pending[me].swap(0, Ordering::AcqRel);
        let mut handled = 0;
        while bits != 0 {
            let index = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            let slot = self.pool.slot(index);
            let kind = *slot.kind.lock();
            match kind {
                Some(MessageKind::FlushRange { root, start, pages }) => {
                    self.flush_local(root, start, pages)
                }
                Some(MessageKind::Callback { func, arg }) => func(arg),
                None => corruption("pending TLB message without a payload"),
            }
            handled += 1;
            if slot.refs.fetch_sub(1, Ordering::AcqRel) == 1 && slot.is_async.load(Ordering::Acquire) {
                self.pool.release(index);
            }
        }
        handled
    }

    /// 进入一段临界区，离开时排空挂起队列
    pub fn enter_critical(&self) -> CriticalSection<'_> {
        CriticalSection {
            tlb: self,
            _irq: IntrGuard::new(),
        }
    }
}

/// 关中断的临界区，drop 时处理本 CPU 的挂起消息
pub struct CriticalSection<'a> {
    tlb: &'a TlbCoordinator,
    _irq: IntrGuard,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.tlb.process_pending();
    }
}
