//! 在模拟机器上运行的内存核心测试
//!
//! 每个测试建立自己的 [`SimulatedMachine`] 和 [`MemoryManager`]，
//! 测试线程扮演 CPU 0；多核测试为其余 CPU 另开线程。

mod cow;
mod fault;
mod heap;
mod kernel_regions;

use std::sync::Once;

use test_support::SimulatedMachine;
use test_support::cpu::{self, MOCK_ARCH_OPS};

use crate::address::{Paddr, PaddrRange, Ppn, Vaddr, VaddrRange};
use crate::arch_ops::ArchMmOps;
use crate::config::MmConfig;
use crate::frame_allocator::{BootInfo, MemoryMapEntry, MemoryRangeType};
use crate::manager::MemoryManager;
use crate::memory_space::{Access, AddressSpace, AllocationStrategy, Region, RegionBacking};

pub(crate) const MIB: usize = 0x10_0000;
pub(crate) const RAM_SIZE: usize = 16 * MIB;
/// 模拟机器之外的设备内存
pub(crate) const DEVICE_MEMORY: usize = 0xfd00_0000;
/// 用户区域的默认起点，2 MiB 对齐
pub(crate) const USER_BASE: Vaddr = Vaddr::new(0x40_0000);

struct SyncArch;

impl sync::ArchOps for SyncArch {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        unsafe { MOCK_ARCH_OPS.read_and_disable_interrupts() }
    }

    unsafe fn restore_interrupts(&self, flags: usize) {
        unsafe { MOCK_ARCH_OPS.restore_interrupts(flags) }
    }

    fn interrupt_enable_mask(&self) -> usize {
        MOCK_ARCH_OPS.interrupt_enable_mask()
    }

    fn cpu_id(&self) -> usize {
        MOCK_ARCH_OPS.cpu_id()
    }

    fn max_cpu_count(&self) -> usize {
        8
    }

    fn relax(&self) {
        MOCK_ARCH_OPS.relax();
    }
}

static SYNC_ARCH: SyncArch = SyncArch;
static REGISTER: Once = Once::new();

pub(crate) struct TestArch {
    machine: &'static SimulatedMachine,
}

impl ArchMmOps for TestArch {
    fn phys_to_virt(&self, paddr: Paddr) -> *mut u8 {
        self.machine.phys_ptr(paddr.0)
    }

    fn virt_ptr(&self, vaddr: Vaddr) -> *mut u8 {
        self.machine.virt_ptr(cpu::current_cpu(), vaddr.0)
    }

    fn cpu_id(&self) -> usize {
        cpu::current_cpu()
    }

    fn num_cpus(&self) -> usize {
        self.machine.num_cpus()
    }

    fn interrupts_enabled(&self) -> bool {
        cpu::interrupts_enabled()
    }

    fn in_irq(&self) -> bool {
        cpu::in_irq()
    }

    fn read_root_table(&self) -> Paddr {
        Paddr::new(self.machine.root(cpu::current_cpu()) as usize)
    }

    unsafe fn write_root_table(&self, root: Paddr) {
        self.machine.set_root(cpu::current_cpu(), root.0 as u64);
    }

    fn invalidate_page(&self, vaddr: Vaddr) {
        self.machine.invalidate_page(cpu::current_cpu(), vaddr.0);
    }

    fn invalidate_all(&self) {
        self.machine.invalidate_all(cpu::current_cpu());
    }

    fn send_ipi(&self, cpu: usize) {
        self.machine.send_ipi(cpu);
    }
}

pub(crate) struct TestConfig {
    super_pool_frames: usize,
}

impl MmConfig for TestConfig {
    fn user_space_end(&self) -> Vaddr {
        Vaddr::new(0x0000_8000_0000_0000)
    }

    fn kernel_region_window(&self) -> VaddrRange {
        VaddrRange::new(Vaddr::new(0xffff_c000_0000_0000), Vaddr::new(0xffff_c000_4000_0000))
    }

    fn identity_window(&self) -> VaddrRange {
        VaddrRange::new(Vaddr::new(0xc000_0000), Vaddr::new(0x1_0000_0000))
    }

    fn quickmap_base(&self) -> Vaddr {
        Vaddr::new(0xffff_ff80_0000_0000)
    }

    fn super_pool_frames(&self) -> usize {
        self.super_pool_frames
    }

    fn heap_scrub(&self) -> bool {
        true
    }
}

static CONFIG: TestConfig = TestConfig { super_pool_frames: 256 };
/// 没有 super 池，便于精确计数
pub(crate) static NO_SUPER_POOL: TestConfig = TestConfig { super_pool_frames: 0 };

pub(crate) fn setup() {
    REGISTER.call_once(|| unsafe { sync::register_arch_ops(&SYNC_ARCH) });
    cpu::bind_cpu(0);
}

/// 一台模拟机器的架构操作，在测试进程内永久存在
pub(crate) fn machine(ram_size: usize, cpus: usize) -> (&'static SimulatedMachine, &'static TestArch) {
    let machine: &'static SimulatedMachine = Box::leak(Box::new(SimulatedMachine::new(ram_size, cpus)));
    let arch: &'static TestArch = Box::leak(Box::new(TestArch { machine }));
    (machine, arch)
}

pub(crate) struct TestEnv {
    pub mm: &'static MemoryManager,
    pub machine: &'static SimulatedMachine,
}

impl TestEnv {
    pub fn new(cpus: usize) -> Self {
        setup();
        let (machine, arch) = machine(RAM_SIZE, cpus);
        let map = [
            MemoryMapEntry::new(0, RAM_SIZE, MemoryRangeType::Usable),
            MemoryMapEntry::new(DEVICE_MEMORY, MIB, MemoryRangeType::Reserved),
        ];
        let boot = BootInfo {
            memory_map: &map,
            kernel_image: PaddrRange::new(Paddr::new(MIB), Paddr::new(2 * MIB)),
            boot_modules: &[],
        };
        let mm = MemoryManager::new(arch, &CONFIG, &boot).expect("memory manager bootstrap");
        Self {
            mm: Box::leak(Box::new(mm)),
            machine,
        }
    }

    /// 新建用户地址空间并映射一个匿名区域
    pub fn user_space_with(&self, pages: usize, access: Access, strategy: AllocationStrategy) -> AddressSpace {
        let space = self.mm.create_address_space().expect("address space");
        self.map_anonymous(&space, USER_BASE, pages, access, strategy);
        space
    }

    pub fn map_anonymous(
        &self,
        space: &AddressSpace,
        start: Vaddr,
        pages: usize,
        access: Access,
        strategy: AllocationStrategy,
    ) {
        let range = VaddrRange::from_start_len(start, pages * crate::config::PAGE_SIZE);
        let region = Region::new(range, access, "test", RegionBacking::anonymous(strategy));
        self.mm.map_region(space, region).expect("map region");
    }

    /// 分配掉 user 池中全部未提交的帧，返回它们以便之后归还
    pub fn exhaust_uncommitted(&self) -> Vec<Ppn> {
        let physical = self.mm.physical();
        std::iter::from_fn(|| physical.allocate(crate::frame_allocator::PoolKind::User, false)).collect()
    }

    pub fn release_frames(&self, frames: Vec<Ppn>) {
        for frame in frames {
            self.mm.physical().unref_frame(frame);
        }
    }

    /// 当前已分配的 user 池帧数
    pub fn used_frames(&self) -> usize {
        self.mm.physical().stats(crate::frame_allocator::PoolKind::User).used
    }
}
