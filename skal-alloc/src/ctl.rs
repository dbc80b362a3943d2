//! Benchmark Control Surface
//!
//! The handle a benchmark driver uses to hammer the allocator: configure a
//! core count and batch size, then issue bulk page allocations and bulk
//! frees from each core, reading per-CPU counters back out. This is test
//! and measurement plumbing, not part of the allocator contract.

use arrayvec::ArrayVec;
use skal_arch::cpu::cpu_id;
use skal_arch::sync::IrqSpinLock;

use crate::allocator::KernelMemory;
use crate::config::{MAX_CPUS, PAGE_SIZE};

/// Set the core count and batch size; resets counters and held pages.
pub const OP_CONFIGURE: u32 = 0;
/// Allocate a batch of pages on the calling CPU.
pub const OP_ALLOC: u32 = 1;
/// Free everything the calling CPU holds.
pub const OP_FREE: u32 = 2;

/// Most pages a single CPU will hold at once.
pub const MAX_BATCH: usize = 512;

/// Per-CPU counters reported to the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuOpStats {
    /// Allocations that came back empty-handed.
    pub ndelay: u64,
    /// Pages freed.
    pub nfree: u64,
    /// Commands executed.
    pub nrun: u64,
    /// Cycles spent in commands. Needs a platform cycle counter; stays
    /// zero until one is wired up.
    pub ncycles: u64,
    /// Individual page operations attempted.
    pub nop: u64,
    /// Pages allocated.
    pub nalloc: u64,
}

#[derive(Debug, Clone, Copy)]
struct CtlConfig {
    ncore: usize,
    batch: usize,
}

#[derive(Default)]
struct CtlSlot {
    held: ArrayVec<usize, MAX_BATCH>,
    stats: CpuOpStats,
}

/// The control endpoint. One per benchmark run.
pub struct MemCtl {
    config: IrqSpinLock<CtlConfig>,
    slots: [IrqSpinLock<CtlSlot>; MAX_CPUS],
}

impl Default for MemCtl {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCtl {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: IrqSpinLock::new(CtlConfig { ncore: 1, batch: 32 }),
            slots: core::array::from_fn(|_| IrqSpinLock::new(CtlSlot::default())),
        }
    }

    /// Execute one driver command on the calling CPU.
    ///
    /// `ncore` and `batch` are only read by [`OP_CONFIGURE`]; the other ops
    /// use whatever was configured last. Commands from CPUs at or beyond
    /// the configured core count are ignored.
    pub fn command(&self, km: &KernelMemory, ncore: usize, batch: usize, op: u32) {
        match op {
            OP_CONFIGURE => {
                *self.config.lock() = CtlConfig {
                    ncore: ncore.min(MAX_CPUS),
                    batch: batch.min(MAX_BATCH),
                };
                for slot in &self.slots {
                    let mut slot = slot.lock();
                    while let Some(page) = slot.held.pop() {
                        km.kfree(page as *mut u8, PAGE_SIZE);
                    }
                    slot.stats = CpuOpStats::default();
                }
            }
            OP_ALLOC => {
                let config = *self.config.lock();
                if cpu_id() >= config.ncore {
                    return;
                }
                let mut slot = self.slots[cpu_id()].lock();
                for _ in 0..config.batch {
                    if slot.held.is_full() {
                        break;
                    }
                    slot.stats.nop += 1;
                    let page = km.kalloc(Some("memctl"), PAGE_SIZE);
                    if page.is_null() {
                        slot.stats.ndelay += 1;
                    } else {
                        slot.held.push(page as usize);
                        slot.stats.nalloc += 1;
                    }
                }
                slot.stats.nrun += 1;
            }
            OP_FREE => {
                if cpu_id() >= self.config.lock().ncore {
                    return;
                }
                let mut slot = self.slots[cpu_id()].lock();
                while let Some(page) = slot.held.pop() {
                    km.kfree(page as *mut u8, PAGE_SIZE);
                    slot.stats.nop += 1;
                    slot.stats.nfree += 1;
                }
                slot.stats.nrun += 1;
            }
            _ => log::warn!("memctl: unknown op {op}"),
        }
    }

    /// Snapshot every CPU's counters.
    #[must_use]
    pub fn per_cpu_stats(&self) -> [CpuOpStats; MAX_CPUS] {
        core::array::from_fn(|cpu| self.slots[cpu].lock().stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMachine;
    use skal_arch::cpu::set_cpu_id_for_thread;

    #[test]
    fn test_bulk_alloc_then_free() {
        let m = TestMachine::single_node(64, 1);
        let ctl = MemCtl::new();
        let total = m.km.free_bytes() + m.km.cached_bytes();

        set_cpu_id_for_thread(0);
        ctl.command(&m.km, 1, 16, OP_CONFIGURE);
        ctl.command(&m.km, 0, 0, OP_ALLOC);
        let stats = ctl.per_cpu_stats()[0];
        assert_eq!(stats.nalloc, 16);
        assert_eq!(stats.ndelay, 0);
        assert_eq!(stats.nop, 16);
        assert_eq!(stats.nrun, 1);

        ctl.command(&m.km, 0, 0, OP_FREE);
        let stats = ctl.per_cpu_stats()[0];
        assert_eq!(stats.nfree, 16);
        assert_eq!(stats.nrun, 2);
        assert_eq!(m.km.free_bytes() + m.km.cached_bytes(), total);
    }

    #[test]
    fn test_delays_counted_when_memory_runs_out() {
        let m = TestMachine::single_node(16, 1);
        let ctl = MemCtl::new();
        set_cpu_id_for_thread(0);
        // Ask for far more pages than the machine has.
        ctl.command(&m.km, 1, MAX_BATCH, OP_CONFIGURE);
        ctl.command(&m.km, 0, 0, OP_ALLOC);
        let stats = ctl.per_cpu_stats()[0];
        assert!(stats.nalloc > 0);
        assert!(stats.ndelay > 0);
        assert_eq!(stats.nalloc + stats.ndelay, stats.nop);
        ctl.command(&m.km, 0, 0, OP_FREE);
        assert_eq!(ctl.per_cpu_stats()[0].nfree, stats.nalloc);
    }

    #[test]
    fn test_unconfigured_cores_are_ignored() {
        let m = TestMachine::single_node(64, 2);
        let ctl = MemCtl::new();
        ctl.command(&m.km, 1, 8, OP_CONFIGURE);

        set_cpu_id_for_thread(1);
        ctl.command(&m.km, 0, 0, OP_ALLOC);
        assert_eq!(ctl.per_cpu_stats()[1], CpuOpStats::default());
        set_cpu_id_for_thread(0);
    }

    #[test]
    fn test_reconfigure_releases_held_pages() {
        let m = TestMachine::single_node(64, 1);
        let ctl = MemCtl::new();
        let total = m.km.free_bytes() + m.km.cached_bytes();

        set_cpu_id_for_thread(0);
        ctl.command(&m.km, 1, 8, OP_CONFIGURE);
        ctl.command(&m.km, 0, 0, OP_ALLOC);
        assert!(m.km.free_bytes() + m.km.cached_bytes() < total);

        ctl.command(&m.km, 1, 8, OP_CONFIGURE);
        assert_eq!(m.km.free_bytes() + m.km.cached_bytes(), total);
        assert_eq!(ctl.per_cpu_stats()[0], CpuOpStats::default());
    }
}
