//! 地址模块
//!
//! 物理地址、虚拟地址与页号的强类型封装。
//!
//! - [`Paddr`] / [`Vaddr`]：物理地址和虚拟地址
//! - [`Ppn`] / [`Vpn`]：物理页号和虚拟页号
//! - [`VaddrRange`] / [`PaddrRange`] / [`PpnRange`]：半开区间 `[start, end)`
//!
//! 两类地址不能混用，需要转换时必须显式经过页号或 `as_usize`。
pub mod operations;
pub mod page_num;
pub mod types;

pub use operations::{AlignOps, UsizeConvert};
pub use page_num::{Ppn, PpnRange, Vpn};
pub use types::{Paddr, PaddrRange, Vaddr, VaddrRange};
