//! 页表项
//!
//! x86-64 四级页表中所有级别的表项格式相同：物理页号加标志位。
//! 第 9 位是留给软件使用的位，这里用来在目录项上标记“指向的页表被写时复制共享”。

use bitflags::bitflags;

use crate::address::{Ppn, UsizeConvert};
use crate::config::PAGE_SHIFT;

bitflags! {
    /// 页表项标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// 有效
        const PRESENT = 1 << 0;
        /// 可写
        const WRITABLE = 1 << 1;
        /// 用户态可访问
        const USER = 1 << 2;
        /// 直写
        const WRITE_THROUGH = 1 << 3;
        /// 禁止缓存
        const NO_CACHE = 1 << 4;
        /// 已访问（硬件设置）
        const ACCESSED = 1 << 5;
        /// 已写（硬件设置）
        const DIRTY = 1 << 6;
        /// 大页
        const HUGE = 1 << 7;
        /// 全局，切换根页表时不失效
        const GLOBAL = 1 << 8;
        /// 软件位：目录项指向的页表被多个地址空间写时复制共享
        const COPY_ON_WRITE = 1 << 9;
        /// 禁止执行
        const NO_EXECUTE = 1 << 63;
    }
}

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// 页表项
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// 空表项
    pub const EMPTY: Self = Self(0);

    /// 由物理页号和标志构造
    pub fn new(ppn: Ppn, flags: PteFlags) -> Self {
        Self(((ppn.as_usize() as u64) << PAGE_SHIFT) & ADDR_MASK | flags.bits())
    }

    /// 原始值
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// 是否全零
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// 指向的物理页号
    pub fn ppn(self) -> Ppn {
        Ppn::from_usize(((self.0 & ADDR_MASK) >> PAGE_SHIFT) as usize)
    }

    /// 标志位
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// 是否有效
    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// 是否可写
    pub fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    /// 是否被标记为写时复制共享
    pub fn is_copy_on_write(self) -> bool {
        self.flags().contains(PteFlags::COPY_ON_WRITE)
    }

    /// 替换物理页号，保留标志
    pub fn set_ppn(&mut self, ppn: Ppn) {
        *self = Self::new(ppn, self.flags());
    }

    /// 替换全部标志，保留物理页号
    pub fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & ADDR_MASK) | flags.bits();
    }

    /// 添加标志
    pub fn insert(&mut self, flags: PteFlags) {
        self.0 |= flags.bits();
    }

    /// 清除标志
    pub fn remove(&mut self, flags: PteFlags) {
        self.0 &= !flags.bits();
    }

    /// 清空表项
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("ppn", &self.ppn())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_packs_frame_and_flags() {
        let mut e = PageTableEntry::new(Ppn(0x1234), PteFlags::PRESENT | PteFlags::NO_EXECUTE);
        assert_eq!(e.ppn(), Ppn(0x1234));
        assert!(e.is_present());
        assert!(!e.is_writable());
        e.insert(PteFlags::WRITABLE | PteFlags::COPY_ON_WRITE);
        assert!(e.is_copy_on_write());
        e.set_ppn(Ppn(7));
        assert_eq!(e.bits(), 7 << 12 | (1 << 63) | 0b10_0000_0011);
        e.clear();
        assert!(e.is_null());
    }
}
