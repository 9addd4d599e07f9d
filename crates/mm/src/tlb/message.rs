//! TLB 消息与消息池
//!
//! 消息池容量固定，槽位的占用情况记录在一个 `AtomicU64` 位图里，
//! 申请和归还都是无锁的 CAS 操作，不会在发送路径上分配堆内存。

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use sync::SpinLock;

use crate::address::{Paddr, Vaddr};
use crate::config::TLB_MESSAGE_POOL_SIZE;
use crate::error::corruption;

/// 跨核消息的内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// 失效一段虚拟地址的翻译
    FlushRange {
        /// 所属地址空间的根页表；`None` 表示内核地址，所有 CPU 都要处理
        root: Option<Paddr>,
        /// 起始地址
        start: Vaddr,
        /// 页数
        pages: usize,
    },
    /// 在目标 CPU 上执行回调
    Callback {
        /// 回调函数
        func: fn(usize),
        /// 回调参数
        arg: usize,
    },
}

pub(super) struct MessageSlot {
    pub kind: SpinLock<Option<MessageKind>>,
    /// 尚未确认的目标 CPU 数
    pub refs: AtomicU32,
    /// 异步消息由最后一个确认者归还
    pub is_async: AtomicBool,
}

impl MessageSlot {
    const fn new() -> Self {
        Self {
            kind: SpinLock::new(None),
            refs: AtomicU32::new(0),
            is_async: AtomicBool::new(false),
        }
    }
}

/// 定长消息池
pub struct MessagePool {
    slots: [MessageSlot; TLB_MESSAGE_POOL_SIZE],
    /// 置位表示空闲
    free: AtomicU64,
}

const _: () = assert!(TLB_MESSAGE_POOL_SIZE == u64::BITS as usize);

impl MessagePool {
    /// 创建全部空闲的消息池
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| MessageSlot::new()),
            free: AtomicU64::new(u64::MAX),
        }
    }

    pub(super) fn slot(&self, index: usize) -> &MessageSlot {
        &self.slots[index]
    }

    /// 申请一个槽位
    pub fn try_acquire(&self) -> Option<usize> {
        let mut current = self.free.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            let index = current.trailing_zeros() as usize;
            match self.free.compare_exchange_weak(
                current,
                current & !(1 << index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => current = actual,
            }
        }
    }

    /// 归还槽位
    pub fn release(&self, index: usize) {
        *self.slots[index].kind.lock() = None;
        let previous = self.free.fetch_or(1 << index, Ordering::AcqRel);
        if previous & (1 << index) != 0 {
            corruption("TLB message returned to the pool twice");
        }
    }

    /// 空闲槽位数
    pub fn available(&self) -> usize {
        self.free.load(Ordering::Acquire).count_ones() as usize
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new()
    }
}
