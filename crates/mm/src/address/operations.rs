//! 地址与页号的公共操作

use crate::config::PAGE_SIZE;

/// 在类型和 usize 之间进行转换
pub trait UsizeConvert: Copy {
    /// 转换为 usize
    fn as_usize(&self) -> usize;
    /// 从 usize 构造
    fn from_usize(value: usize) -> Self;
}

/// 地址对齐操作
pub trait AlignOps: UsizeConvert {
    /// 向下对齐到 `align`（必须是 2 的幂）
    fn align_down(self, align: usize) -> Self {
        debug_assert!(align.is_power_of_two());
        Self::from_usize(self.as_usize() & !(align - 1))
    }

    /// 向上对齐到 `align`（必须是 2 的幂）
    fn align_up(self, align: usize) -> Self {
        debug_assert!(align.is_power_of_two());
        Self::from_usize((self.as_usize() + align - 1) & !(align - 1))
    }

    /// 是否按 `align` 对齐
    fn is_aligned(self, align: usize) -> bool {
        self.as_usize() & (align - 1) == 0
    }

    /// 向下对齐到页边界
    fn align_down_to_page(self) -> Self {
        self.align_down(PAGE_SIZE)
    }

    /// 向上对齐到页边界
    fn align_up_to_page(self) -> Self {
        self.align_up(PAGE_SIZE)
    }

    /// 是否页对齐
    fn is_page_aligned(self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }

    /// 页内偏移
    fn page_offset(self) -> usize {
        self.as_usize() & (PAGE_SIZE - 1)
    }
}

/// 为单字段元组结构体实现 [`UsizeConvert`]、[`AlignOps`] 以及十六进制的调试输出。
#[macro_export]
macro_rules! impl_usize_newtype {
    ($type:ident) => {
        impl $crate::address::operations::UsizeConvert for $type {
            fn as_usize(&self) -> usize {
                self.0
            }

            fn from_usize(value: usize) -> Self {
                Self(value)
            }
        }

        impl $crate::address::operations::AlignOps for $type {}

        impl core::fmt::Debug for $type {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({:#x})", stringify!($type), self.0)
            }
        }

        impl core::fmt::Display for $type {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl core::ops::Add<usize> for $type {
            type Output = Self;

            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl core::ops::Sub<usize> for $type {
            type Output = Self;

            fn sub(self, rhs: usize) -> Self {
                Self(self.0 - rhs)
            }
        }
    };
}
