//! 固件内存映射解析
//!
//! 把引导程序交来的内存映射整理成三类区间：
//! - 可用区间：页对齐、扣除已占用部分、相邻区间合并后的物理内存
//! - 已占用区间：低端内存、内核映像、引导模块，以及之后切出去的元数据和 super 池
//! - 保留区间：所有非可用类型的连续范围，用于判断物理地址能否映射给用户态

use alloc::vec::Vec;
use log::{debug, info};

use crate::address::{AlignOps, Paddr, PaddrRange, UsizeConvert};
use crate::config::{LOW_MEMORY_END, PAGE_SIZE};

/// 固件报告的内存区间类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRangeType {
    /// 可用内存
    Usable,
    /// 保留
    Reserved,
    /// ACPI 表，读取后可回收
    AcpiReclaimable,
    /// ACPI 非易失存储
    AcpiNvs,
    /// 损坏的内存
    BadMemory,
    /// 未知类型
    Unknown,
}

impl MemoryRangeType {
    /// 按 multiboot 的类型编码转换
    pub fn from_multiboot(code: u32) -> Self {
        match code {
            1 => Self::Usable,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            _ => Self::Unknown,
        }
    }
}

/// 内存映射中的一项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    /// 起始物理地址
    pub start: Paddr,
    /// 字节长度
    pub length: usize,
    /// 类型
    pub kind: MemoryRangeType,
}

impl MemoryMapEntry {
    /// 创建一项
    pub const fn new(start: usize, length: usize, kind: MemoryRangeType) -> Self {
        Self {
            start: Paddr::new(start),
            length,
            kind,
        }
    }
}

/// 已占用区间的用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsedRangeKind {
    /// 1 MiB 以下的低端内存
    LowMemory,
    /// 内核映像
    KernelImage,
    /// 引导模块
    BootModule,
    /// 帧元数据数组
    FrameMetadata,
    /// super 池
    SuperPool,
}

/// 已占用的物理区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedRange {
    /// 用途
    pub kind: UsedRangeKind,
    /// 区间
    pub range: PaddrRange,
}

/// 连续的保留（非可用）区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedRange {
    /// 第一段的类型
    pub kind: MemoryRangeType,
    /// 区间
    pub range: PaddrRange,
}

/// 引导信息
#[derive(Debug, Clone, Copy)]
pub struct BootInfo<'a> {
    /// 固件内存映射，按地址排序
    pub memory_map: &'a [MemoryMapEntry],
    /// 内核映像的物理区间（由链接脚本符号给出）
    pub kernel_image: PaddrRange,
    /// 引导模块的物理区间
    pub boot_modules: &'a [PaddrRange],
}

/// 解析后的物理内存布局
#[derive(Debug, Clone, Default)]
pub struct MemoryLayout {
    /// 可用区间，按地址升序且互不相邻
    pub usable: Vec<PaddrRange>,
    /// 已占用区间
    pub used: Vec<UsedRange>,
    /// 保留区间
    pub reserved: Vec<ReservedRange>,
}

impl MemoryLayout {
    /// 解析引导信息
    pub fn parse(boot: &BootInfo<'_>) -> Self {
        let mut layout = MemoryLayout::default();
        layout.used.push(UsedRange {
            kind: UsedRangeKind::LowMemory,
            range: PaddrRange::new(Paddr::new(0), Paddr::new(LOW_MEMORY_END)),
        });
        layout.used.push(UsedRange {
            kind: UsedRangeKind::KernelImage,
            range: boot.kernel_image,
        });
        for module in boot.boot_modules {
            layout.used.push(UsedRange {
                kind: UsedRangeKind::BootModule,
                range: *module,
            });
        }

        for entry in boot.memory_map {
            info!(
                "MM: memory map: address={}, length={:#x}, type={:?}",
                entry.start, entry.length, entry.kind
            );
            let raw = PaddrRange::from_start_len(entry.start, entry.length);

            if entry.kind != MemoryRangeType::Usable {
                layout.add_reserved(entry.kind, raw);
                continue;
            }

            let start = entry.start.align_up_to_page();
            let end = raw.end.align_down_to_page();
            if end <= start || end.as_usize() - start.as_usize() < PAGE_SIZE {
                debug!("MM: skipping usable range {} shorter than a page", entry.start);
                continue;
            }

            let mut pieces = Vec::new();
            pieces.push(PaddrRange::new(start, end));
            for used in &layout.used {
                pieces = subtract(pieces, &used.range);
            }
            layout.usable.extend(pieces.into_iter().filter(|r| r.size() >= PAGE_SIZE));
        }

        layout.usable.sort();
        layout.usable = coalesce(core::mem::take(&mut layout.usable));
        for range in &layout.usable {
            info!("MM: usable physical range {}..{}", range.start, range.end);
        }
        layout
    }

    fn add_reserved(&mut self, kind: MemoryRangeType, range: PaddrRange) {
        if let Some(last) = self.reserved.last_mut() {
            if last.range.end == range.start {
                last.range.end = range.end;
                return;
            }
        }
        self.reserved.push(ReservedRange { kind, range });
    }

    /// 记录一段被内存核心自己切走的区间
    pub fn mark_used(&mut self, kind: UsedRangeKind, range: PaddrRange) {
        self.used.push(UsedRange { kind, range });
    }

    /// 物理区间能否映射给用户态。
    ///
    /// 只有完整落在某个保留区间内、且不与任何已占用区间重叠的物理内存才可以。
    /// 普通 RAM 永远不允许通过物理映射交给用户态。
    pub fn is_allowed_to_map_to_userspace(&self, start: Paddr, size: usize) -> bool {
        let wanted = PaddrRange::from_start_len(start, size);
        if wanted.is_empty() {
            return false;
        }
        if self.used.iter().any(|u| u.range.overlaps(&wanted)) {
            return false;
        }
        self.reserved.iter().any(|r| r.range.contains_range(&wanted))
    }
}

/// 从每个片段中扣除 `hole`
fn subtract(pieces: Vec<PaddrRange>, hole: &PaddrRange) -> Vec<PaddrRange> {
    let mut out = Vec::with_capacity(pieces.len() + 1);
    for piece in pieces {
        if !piece.overlaps(hole) {
            out.push(piece);
            continue;
        }
        if piece.start < hole.start {
            out.push(PaddrRange::new(piece.start, hole.start.align_down_to_page()));
        }
        if hole.end < piece.end {
            out.push(PaddrRange::new(hole.end.align_up_to_page(), piece.end));
        }
    }
    out.retain(|r| !r.is_empty());
    out
}

/// 合并首尾相接的区间，输入必须已排序
fn coalesce(sorted: Vec<PaddrRange>) -> Vec<PaddrRange> {
    let mut out: Vec<PaddrRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match out.last_mut() {
            Some(last) if last.end >= range.start => {
                if range.end > last.end {
                    last.end = range.end;
                }
            }
            _ => out.push(range),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 0x10_0000;

    #[test]
    fn usable_ranges_are_aligned_split_and_coalesced() {
        let map = [
            MemoryMapEntry::new(0, 0x9f000, MemoryRangeType::Usable),
            MemoryMapEntry::new(0xf0000, 0x10000, MemoryRangeType::Reserved),
            MemoryMapEntry::new(MIB + 0x10, 3 * MIB, MemoryRangeType::Usable),
            MemoryMapEntry::new(4 * MIB + 0x10, 4 * MIB, MemoryRangeType::Usable),
            MemoryMapEntry::new(9 * MIB, 0x800, MemoryRangeType::Usable),
            MemoryMapEntry::new(0xfec0_0000, 0x1000, MemoryRangeType::from_multiboot(2)),
        ];
        let module = PaddrRange::from_start_len(Paddr::new(6 * MIB), 0x1800);
        let boot = BootInfo {
            memory_map: &map,
            kernel_image: PaddrRange::new(Paddr::new(MIB), Paddr::new(2 * MIB)),
            boot_modules: core::slice::from_ref(&module),
        };
        let layout = MemoryLayout::parse(&boot);

        assert_eq!(
            layout.usable,
            vec![
                // 低端内存与内核映像被扣除，首个范围页对齐后向内收缩
                PaddrRange::new(Paddr::new(2 * MIB), Paddr::new(4 * MIB)),
                PaddrRange::new(Paddr::new(4 * MIB + 0x1000), Paddr::new(6 * MIB)),
                PaddrRange::new(Paddr::new(6 * MIB + 0x2000), Paddr::new(8 * MIB)),
            ]
        );
        assert_eq!(layout.reserved.len(), 2);
    }

    #[test]
    fn only_reserved_non_ram_may_reach_userspace() {
        let map = [
            MemoryMapEntry::new(MIB, 8 * MIB, MemoryRangeType::Usable),
            MemoryMapEntry::new(0xfd00_0000, 0x40_0000, MemoryRangeType::Reserved),
        ];
        let boot = BootInfo {
            memory_map: &map,
            kernel_image: PaddrRange::new(Paddr::new(MIB), Paddr::new(2 * MIB)),
            boot_modules: &[],
        };
        let layout = MemoryLayout::parse(&boot);
        assert!(layout.is_allowed_to_map_to_userspace(Paddr::new(0xfd00_0000), 0x1000));
        assert!(!layout.is_allowed_to_map_to_userspace(Paddr::new(0xfd3f_f000), 0x2000));
        assert!(!layout.is_allowed_to_map_to_userspace(Paddr::new(3 * MIB), 0x1000));
    }
}
