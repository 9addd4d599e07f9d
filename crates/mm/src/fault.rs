//! 缺页处理
//!
//! 处理顺序：
//!
//! 1. 中断上下文中的缺页一律致命
//! 2. 内核半区地址交给内核地址空间处理
//! 3. 没有区域、权限不符、用户态访问内核区域：返回 [`PageFaultResponse::ShouldCrash`]，
//!    由进程层转成信号
//! 4. 写入写时复制组，或需要在其中新建表项：先复制整组
//! 5. 表项不存在：按区域的后备内存按需建立（匿名内存的读访问映射共享零帧）
//! 6. 写入共享零帧：换成私有帧
//! 7. 其余情况是别的 CPU 已经修好的伪缺页，刷新本地 TLB 后继续

use bitflags::bitflags;
use log::{error, trace, warn};

use crate::address::{AlignOps, Vaddr};
use crate::error::{MmError, MmResult, corruption};
use crate::manager::MemoryManager;
use crate::memory_space::{Access, AddressSpace, SpaceInner, find_region, find_region_mut};
use crate::page_table::SpaceKind;

bitflags! {
    /// x86 缺页错误码
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u32 {
        /// 页存在（保护违例）；未置位表示页不存在
        const PRESENT = 1 << 0;
        /// 写访问
        const WRITE = 1 << 1;
        /// 用户态访问
        const USER = 1 << 2;
        /// 页表项中置位了保留位
        const RESERVED_WRITE = 1 << 3;
        /// 取指
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// 访问类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    /// 读
    Read,
    /// 写
    Write,
    /// 取指
    Execute,
}

impl FaultAccess {
    fn required(self) -> Access {
        match self {
            Self::Read => Access::READ,
            Self::Write => Access::WRITE,
            Self::Execute => Access::EXECUTE,
        }
    }
}

/// 缺页处理的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultResponse {
    /// 已修复，重新执行出错的指令
    Continue,
    /// 非法访问
    ShouldCrash,
}

/// 一次缺页
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    code: PageFaultCode,
    vaddr: Vaddr,
    ip: Vaddr,
}

impl PageFault {
    /// 由硬件错误码、出错地址（CR2）和指令地址构造
    pub fn new(code: u32, vaddr: Vaddr, ip: Vaddr) -> Self {
        Self {
            code: PageFaultCode::from_bits_truncate(code),
            vaddr,
            ip,
        }
    }

    /// 内核代替某个访问合成的缺页
    pub(crate) fn for_access(vaddr: Vaddr, access: FaultAccess, user: bool) -> Self {
        let mut code = PageFaultCode::empty();
        match access {
            FaultAccess::Read => {}
            FaultAccess::Write => code |= PageFaultCode::WRITE,
            FaultAccess::Execute => code |= PageFaultCode::INSTRUCTION_FETCH,
        }
        if user {
            code |= PageFaultCode::USER;
        }
        Self {
            code,
            vaddr,
            ip: Vaddr::new(0),
        }
    }

    /// 错误码
    pub fn code(&self) -> PageFaultCode {
        self.code
    }

    /// 出错地址
    pub fn vaddr(&self) -> Vaddr {
        self.vaddr
    }

    /// 出错指令地址
    pub fn ip(&self) -> Vaddr {
        self.ip
    }

    /// 访问类型
    pub fn access(&self) -> FaultAccess {
        if self.code.contains(PageFaultCode::INSTRUCTION_FETCH) {
            FaultAccess::Execute
        } else if self.code.contains(PageFaultCode::WRITE) {
            FaultAccess::Write
        } else {
            FaultAccess::Read
        }
    }

    /// 是否来自用户态
    pub fn is_user(&self) -> bool {
        self.code.contains(PageFaultCode::USER)
    }
}

impl MemoryManager {
    /// 处理一次缺页。`space` 是出错时 CPU 正在使用的地址空间。
    pub fn handle_page_fault(&self, space: &AddressSpace, fault: &PageFault) -> PageFaultResponse {
        if self.arch().in_irq() {
            error!(
                "MM: page fault in interrupt context at {} (ip {}, {:?})",
                fault.vaddr(),
                fault.ip(),
                fault.code()
            );
            return PageFaultResponse::ShouldCrash;
        }
        if fault.code().contains(PageFaultCode::RESERVED_WRITE) {
            corruption("reserved bit set in a page table entry");
        }
        match self.resolve_fault(space, fault) {
            Ok(()) => PageFaultResponse::Continue,
            Err(MmError::OutOfMemory) => {
                warn!(
                    "MM: out of memory handling fault at {} in {}",
                    fault.vaddr(),
                    region_kind(space)
                );
                PageFaultResponse::ShouldCrash
            }
            Err(_) => PageFaultResponse::ShouldCrash,
        }
    }

    /// 修复一次缺页。非法访问返回 [`MmError::InvalidMapping`]，
    /// 帧或页表分配失败返回 [`MmError::OutOfMemory`]。
    pub(crate) fn resolve_fault(&self, space: &AddressSpace, fault: &PageFault) -> MmResult<()> {
        let space = if fault.vaddr() >= self.config().user_space_end() {
            self.kernel_space()
        } else {
            space
        };
        let vaddr = fault.vaddr().align_down_to_page();
        let access = fault.access();
        let write = access == FaultAccess::Write;
        let invalid = MmError::InvalidMapping { vaddr: fault.vaddr() };

        let _global = self.physical().lock_global();
        let mut inner = space.lock();
        let SpaceInner { tables, regions } = &mut *inner;

        let Some(region) = find_region(regions, vaddr) else {
            warn!(
                "MM: {:?} fault at {} (ip {}) outside any region",
                access,
                fault.vaddr(),
                fault.ip()
            );
            return Err(invalid);
        };
        if !region.access().contains(access.required()) || (fault.is_user() && !region.is_user()) {
            warn!(
                "MM: {:?} fault at {} (ip {}) violates {} {:?}",
                access,
                fault.vaddr(),
                fault.ip(),
                region.name(),
                region.access()
            );
            return Err(invalid);
        }

        // 共享组里的表项不能就地修改：写入或需要新建表项时先复制整组
        let shared_group = self
            .page_tables()
            .walk(tables, vaddr, 1)
            .is_some_and(|directory| directory.is_present() && directory.is_copy_on_write());
        let needs_entry = !self
            .page_tables()
            .lookup(tables, vaddr)
            .is_some_and(|entry| entry.is_present());
        if shared_group && (write || needs_entry) {
            if let Err(err) = self.resolve_copy_on_write(tables, regions, vaddr) {
                warn!("MM: copy-on-write at {} failed: {}", vaddr, err);
                return Err(err);
            }
        }

        let Some(region) = find_region_mut(regions, vaddr) else {
            corruption("region vanished while its space was locked");
        };
        let leaf = self
            .page_tables()
            .lookup(tables, vaddr)
            .filter(|entry| entry.is_present());
        match leaf {
            None => self.populate_page(tables, region, vaddr, write),
            Some(entry) if write && !entry.is_writable() => {
                if entry.ppn() != self.shared_zero_frame() {
                    error!(
                        "MM: write fault at {} on a read-only entry of writable region {}",
                        vaddr,
                        region.name()
                    );
                    return Err(invalid);
                }
                self.materialize_zero_page(tables, region, vaddr)
            }
            Some(_) => {
                trace!("MM: spurious fault at {}", vaddr);
                self.tlb().flush_local(tables.flush_root(), vaddr, 1);
                Ok(())
            }
        }
    }
}

fn region_kind(space: &AddressSpace) -> &'static str {
    match space.kind() {
        SpaceKind::Kernel => "kernel space",
        SpaceKind::User => "user space",
    }
}
