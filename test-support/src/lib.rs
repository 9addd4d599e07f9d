//! 测试支持 crate
//!
//! 在宿主机上模拟内存核心所依赖的硬件：
//! - [`cpu`]：线程局部的 CPU 身份与中断状态，每个测试线程扮演一个 CPU
//! - [`machine`]：模拟物理内存、每 CPU 的页表根寄存器和软件 TLB，
//!   以及一个 x86-64 四级页表遍历器
//!
//! 各 crate 的测试用本地类型包装这里的实现，再为其实现各自的 trait。

pub mod cpu;
pub mod machine;

pub use cpu::MockArchOps;
pub use machine::{SimulatedMachine, TlbEntry};
