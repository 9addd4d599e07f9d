//! 地址空间与区域
//!
//! 本模块定义地址空间（[`AddressSpace`]）、其中的区域（[`Region`]），
//! 以及区域可能引用的共享匿名对象（[`VmObject`]）和内核虚拟地址的范围分配器。

mod address_space;
mod range_allocator;
mod region;
mod vm_object;

pub use address_space::{AddressSpace, SpaceInner, find_region, find_region_mut};
pub use range_allocator::RangeAllocator;
pub use region::{Access, AllocationStrategy, CowReserve, Region, RegionBacking, RegionInfo};
pub use vm_object::VmObject;
