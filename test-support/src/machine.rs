//! 模拟机器
//!
//! 一块页对齐的宿主内存充当物理内存（物理地址 0 对应缓冲区起点），
//! 每个 CPU 拥有自己的页表根寄存器和软件 TLB。
//!
//! TLB 的行为刻意贴近硬件：命中时直接返回缓存的翻译，不会重新遍历页表，
//! 因此遗漏的 TLB 失效会在测试中表现为读到旧的物理帧。

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const PAGE_SIZE: usize = 4096;
const PRESENT: u64 = 1;
const WRITABLE: u64 = 1 << 1;
const USER: u64 = 1 << 2;
const HUGE: u64 = 1 << 7;
const GLOBAL: u64 = 1 << 8;
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// 一条缓存的翻译
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    /// 物理页号
    pub ppn: u64,
    /// 整条路径都可写
    pub writable: bool,
    /// 整条路径都允许用户态访问
    pub user: bool,
    /// 叶子项带 GLOBAL 位，切换根表时保留
    pub global: bool,
}

struct CpuState {
    root: AtomicU64,
    tlb: Mutex<HashMap<usize, TlbEntry>>,
    ipis: AtomicUsize,
}

/// 模拟的多核机器
pub struct SimulatedMachine {
    ram: *mut u8,
    size: usize,
    cpus: Vec<CpuState>,
}

// Safety: 物理内存的并发访问由被测代码自己的锁保证，和真实硬件一样。
unsafe impl Send for SimulatedMachine {}
unsafe impl Sync for SimulatedMachine {}

impl SimulatedMachine {
    /// 创建一台拥有 `ram_size` 字节物理内存和 `cpus` 个 CPU 的机器
    pub fn new(ram_size: usize, cpus: usize) -> Self {
        assert!(ram_size % PAGE_SIZE == 0 && ram_size > 0);
        assert!(cpus > 0);
        let layout = Self::layout(ram_size);
        // SAFETY: layout 大小非零
        let ram = unsafe { alloc_zeroed(layout) };
        assert!(!ram.is_null(), "host allocation for simulated RAM failed");
        let cpus = (0..cpus)
            .map(|_| CpuState {
                root: AtomicU64::new(0),
                tlb: Mutex::new(HashMap::new()),
                ipis: AtomicUsize::new(0),
            })
            .collect();
        Self {
            ram,
            size: ram_size,
            cpus,
        }
    }

    fn layout(size: usize) -> Layout {
        match Layout::from_size_align(size, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(e) => panic!("invalid RAM layout: {e}"),
        }
    }

    /// 物理内存大小
    pub fn ram_size(&self) -> usize {
        self.size
    }

    /// CPU 数量
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// 物理地址在宿主上的指针
    pub fn phys_ptr(&self, paddr: usize) -> *mut u8 {
        assert!(
            paddr < self.size,
            "physical address {paddr:#x} outside simulated RAM"
        );
        // SAFETY: 已检查范围
        unsafe { self.ram.add(paddr) }
    }

    /// 读取一个物理 u64
    pub fn read_phys_u64(&self, paddr: usize) -> u64 {
        // SAFETY: phys_ptr 检查了范围；页表项按 8 字节对齐
        unsafe { (self.phys_ptr(paddr) as *const u64).read_volatile() }
    }

    /// 读取 CPU 的页表根（CR3）
    pub fn root(&self, cpu: usize) -> u64 {
        self.cpus[cpu].root.load(Ordering::Acquire)
    }

    /// 写入 CPU 的页表根，丢弃所有非全局翻译
    pub fn set_root(&self, cpu: usize, root: u64) {
        let state = &self.cpus[cpu];
        state.root.store(root, Ordering::Release);
        self.tlb(cpu).retain(|_, e| e.global);
    }

    fn tlb(&self, cpu: usize) -> std::sync::MutexGuard<'_, HashMap<usize, TlbEntry>> {
        match self.cpus[cpu].tlb.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 按 x86-64 四级页表遍历，返回叶子项
    pub fn walk(&self, root: u64, vaddr: usize) -> Option<u64> {
        let mut table = (root & ADDR_MASK) as usize;
        for level in (0..4).rev() {
            let index = (vaddr >> (12 + 9 * level)) & 0x1ff;
            let entry = self.read_phys_u64(table + index * 8);
            if entry & PRESENT == 0 {
                return None;
            }
            if level == 0 {
                return Some(entry);
            }
            assert!(entry & HUGE == 0, "huge pages are not simulated");
            table = (entry & ADDR_MASK) as usize;
        }
        None
    }

    fn walk_permissions(&self, root: u64, vaddr: usize) -> Option<TlbEntry> {
        let mut table = (root & ADDR_MASK) as usize;
        let mut writable = true;
        let mut user = true;
        for level in (0..4).rev() {
            let index = (vaddr >> (12 + 9 * level)) & 0x1ff;
            let entry = self.read_phys_u64(table + index * 8);
            if entry & PRESENT == 0 {
                return None;
            }
            writable &= entry & WRITABLE != 0;
            user &= entry & USER != 0;
            if level == 0 {
                return Some(TlbEntry {
                    ppn: (entry & ADDR_MASK) >> 12,
                    writable,
                    user,
                    global: entry & GLOBAL != 0,
                });
            }
            table = (entry & ADDR_MASK) as usize;
        }
        None
    }

    /// 翻译虚拟地址：先查 TLB，未命中再遍历并填充
    pub fn translate(&self, cpu: usize, vaddr: usize) -> Option<TlbEntry> {
        let vpn = vaddr / PAGE_SIZE;
        if let Some(entry) = self.tlb(cpu).get(&vpn) {
            return Some(*entry);
        }
        let entry = self.walk_permissions(self.root(cpu), vaddr)?;
        self.tlb(cpu).insert(vpn, entry);
        Some(entry)
    }

    /// 查看 TLB 中缓存的翻译，不触发遍历
    pub fn cached(&self, cpu: usize, vaddr: usize) -> Option<TlbEntry> {
        self.tlb(cpu).get(&(vaddr / PAGE_SIZE)).copied()
    }

    /// 通过 MMU 访问虚拟地址，得到宿主指针
    ///
    /// # Panics
    /// 翻译不存在时视为模拟的缺页异常，直接 panic。
    pub fn virt_ptr(&self, cpu: usize, vaddr: usize) -> *mut u8 {
        match self.translate(cpu, vaddr) {
            Some(entry) => {
                self.phys_ptr(entry.ppn as usize * PAGE_SIZE + vaddr % PAGE_SIZE)
            }
            None => panic!("simulated page fault on cpu {cpu} at {vaddr:#x}"),
        }
    }

    /// 失效单页翻译
    pub fn invalidate_page(&self, cpu: usize, vaddr: usize) {
        self.tlb(cpu).remove(&(vaddr / PAGE_SIZE));
    }

    /// 失效全部翻译（包括全局项）
    pub fn invalidate_all(&self, cpu: usize) {
        self.tlb(cpu).clear();
    }

    /// 记录一次发往 `cpu` 的处理器间中断
    pub fn send_ipi(&self, cpu: usize) {
        self.cpus[cpu].ipis.fetch_add(1, Ordering::AcqRel);
    }

    /// 发往 `cpu` 的处理器间中断数量
    pub fn ipi_count(&self, cpu: usize) -> usize {
        self.cpus[cpu].ipis.load(Ordering::Acquire)
    }
}

impl Drop for SimulatedMachine {
    fn drop(&mut self) {
        // SAFETY: ram 由 new 使用相同的 layout 分配
        unsafe { dealloc(self.ram, Self::layout(self.size)) };
    }
}
