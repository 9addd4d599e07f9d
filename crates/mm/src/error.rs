//! 内存核心的错误类型

use crate::address::Vaddr;

/// 内存核心的错误
///
/// `OutOfMemory` 与 `InvalidMapping` 是可恢复的，会返回给调用者；
/// `AddressSpaceCorruption` 与 `ReentrancyViolation` 只通过 [`MmError::fatal`] 报告，
/// 永远不会作为返回值出现。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MmError {
    /// 物理帧或堆空间耗尽
    #[error("out of memory")]
    OutOfMemory,
    /// 内存记账的不变量被破坏
    #[error("address space corruption: {0}")]
    AddressSpaceCorruption(&'static str),
    /// 访问了未映射或权限不允许的地址
    #[error("invalid mapping at {vaddr}")]
    InvalidMapping {
        /// 出错的虚拟地址
        vaddr: Vaddr,
    },
    /// quickmap 或堆扩展被嵌套使用
    #[error("reentrancy violation: {0}")]
    ReentrancyViolation(&'static str),
}

/// 内存核心操作的结果类型
pub type MmResult<T> = Result<T, MmError>;

impl MmError {
    /// 记录诊断信息并停机
    #[cold]
    #[track_caller]
    pub fn fatal(self) -> ! {
        log::error!("MM: fatal: {}", self);
        panic!("{}", self);
    }
}

/// 不变量被破坏时停机
#[cold]
#[track_caller]
pub(crate) fn corruption(what: &'static str) -> ! {
    MmError::AddressSpaceCorruption(what).fatal()
}

/// 检测到重入时停机
#[cold]
#[track_caller]
pub(crate) fn reentrancy(what: &'static str) -> ! {
    MmError::ReentrancyViolation(what).fatal()
}
