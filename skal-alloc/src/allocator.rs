//! Allocator Façade
//!
//! [`KernelMemory`] ties the pieces together: the buddy table, the per-CPU
//! state (steal order, home pool, hot-page cache), the slab classes, the
//! page-metadata table, and the event counters.
//!
//! Two routing modes exist and one is selected per build:
//! - the default steal-order mode walks the CPU's buddy plan per request;
//! - the `load-balance` mode pins each CPU to its home pool and pulls bulk
//!   donations from peers when it runs dry.
//!
//! Locking is deliberately flat: one lock per buddy, at most one held at a
//! time, and a per-CPU lock that stands in for the interrupt masking the
//! hot-page cache needs on real hardware.

use core::ptr;

use arrayvec::ArrayVec;
use skal_arch::cpu::cpu_id;
use skal_arch::sync::IrqSpinLock;

use crate::config::{MAX_BUDDIES, MAX_CPUS, PAGE_SIZE};
use crate::hot::{HotPageCache, FLUSH_PAGES};
use crate::page_info::{PageInfo, PageInfoTable};
use crate::pool::{Balancer, LockedBuddy, MemPool};
use crate::slab::{SlabClass, SlabKind, SLAB_COUNT};
use crate::stats::{inc, KallocStats, StatsSnapshot};
use crate::steal::StealOrder;

/// Default tracing label for unnamed allocations.
const DEFAULT_NAME: &str = "kmem";

/// Per-CPU allocator state. Only the owning CPU writes it, with interrupts
/// masked; the lock enforces exactly that discipline.
#[derive(Debug, Default)]
pub struct CpuMem {
    /// The CPU's buddy plan, local range first.
    pub steal: StealOrder,
    /// Home pool index, used by the load-balance mode.
    pub pool: usize,
    /// Recently freed single pages.
    pub hot: HotPageCache,
}

/// The assembled allocator.
pub struct KernelMemory {
    buddies: ArrayVec<LockedBuddy, MAX_BUDDIES>,
    pools: ArrayVec<MemPool, MAX_BUDDIES>,
    cpu_mem: [IrqSpinLock<CpuMem>; MAX_CPUS],
    ncpus: usize,
    slabs: [SlabClass; SLAB_COUNT],
    page_info: PageInfoTable,
    balancer: Balancer,
    stats: KallocStats,
}

impl KernelMemory {
    pub(crate) fn assemble(
        buddies: ArrayVec<LockedBuddy, MAX_BUDDIES>,
        pools: ArrayVec<MemPool, MAX_BUDDIES>,
        cpu_mem: [IrqSpinLock<CpuMem>; MAX_CPUS],
        ncpus: usize,
        slabs: [SlabClass; SLAB_COUNT],
        page_info: PageInfoTable,
    ) -> Self {
        Self {
            buddies,
            pools,
            cpu_mem,
            ncpus,
            slabs,
            page_info,
            balancer: Balancer,
            stats: KallocStats::new(),
        }
    }

    /// Allocate `size` bytes, labelled `name` for tracing.
    ///
    /// Returns null when no memory can be found anywhere; requests beyond
    /// the largest buddy block also surface as null.
    #[must_use]
    pub fn kalloc(&self, name: Option<&str>, size: usize) -> *mut u8 {
        #[cfg(feature = "load-balance")]
        {
            self.kalloc_balanced(name, size)
        }
        #[cfg(not(feature = "load-balance"))]
        {
            self.kalloc_stealing(name, size)
        }
    }

    /// Free `size` bytes at `ptr`, previously returned by [`Self::kalloc`].
    ///
    /// # Panics
    ///
    /// Panics if `ptr` lies in no buddy's window: freeing foreign memory is
    /// unrecoverable corruption.
    pub fn kfree(&self, ptr: *mut u8, size: usize) {
        #[cfg(feature = "load-balance")]
        {
            self.kfree_balanced(ptr, size);
        }
        #[cfg(not(feature = "load-balance"))]
        {
            self.kfree_stealing(ptr, size);
        }
    }

    /// Allocate from the named slab class.
    #[must_use]
    pub fn slab_alloc(&self, kind: SlabKind) -> *mut u8 {
        let class = self.slabs[kind as usize];
        self.kalloc(Some(class.name), class.bytes())
    }

    /// Free a block obtained from [`Self::slab_alloc`].
    pub fn slab_free(&self, kind: SlabKind, ptr: *mut u8) {
        let class = self.slabs[kind as usize];
        self.kfree(ptr, class.bytes());
    }

    // -- Steal-order mode

    /// Allocation through the per-request steal order.
    #[must_use]
    pub fn kalloc_stealing(&self, name: Option<&str>, size: usize) -> *mut u8 {
        let mut res = ptr::null_mut();
        if size == PAGE_SIZE {
            let mut mem = self.cpu_mem[cpu_id()].lock();
            if mem.hot.is_empty() {
                self.refill_hot(&mut mem);
            }
            if let Some(page) = mem.hot.pop() {
                inc(&self.stats.kalloc_page_alloc_count);
                res = page as *mut u8;
            }
        }
        if res.is_null() {
            // General path: non-page sizes, or a refill that came up dry.
            res = self.steal_alloc(size);
        }
        self.finish_alloc(res, size, name)
    }

    /// Free through the steal order: pages to the hot cache, everything
    /// else to the first buddy whose window contains it.
    pub fn kfree_stealing(&self, ptr: *mut u8, size: usize) {
        self.prepare_free(ptr, size);
        if size == PAGE_SIZE {
            let mut mem = self.cpu_mem[cpu_id()].lock();
            if mem.hot.is_full() {
                self.flush_hot(&mut mem);
            }
            mem.hot.push(ptr as usize);
            inc(&self.stats.kalloc_page_free_count);
            return;
        }
        let steal = self.cpu_mem[cpu_id()].lock().steal.clone();
        for idx in steal.iter() {
            if self.buddies[idx].contains(ptr as usize) {
                // SAFETY: The block came from this window's buddies and the
                // caller is done with it.
                unsafe { self.buddies[idx].lock().free(ptr, size) };
                return;
            }
        }
        panic!("kfree: pointer {ptr:p} is not in an allocated region");
    }

    /// Walk the steal order, trying each buddy in turn.
    fn steal_alloc(&self, size: usize) -> *mut u8 {
        let steal = self.cpu_mem[cpu_id()].lock().steal.clone();
        for idx in steal.iter() {
            let res = self.buddies[idx].lock().alloc(size);
            if !res.is_null() {
                return res;
            }
        }
        ptr::null_mut()
    }

    /// Fill half the hot cache from the steal order. Caller holds the
    /// CPU's lock.
    fn refill_hot(&self, mem: &mut CpuMem) {
        inc(&self.stats.kalloc_hot_list_refill_count);
        let steal = mem.steal.clone();
        for idx in steal.iter() {
            let mut buddy = self.buddies[idx].lock();
            while mem.hot.len() < FLUSH_PAGES {
                let page = buddy.alloc(PAGE_SIZE);
                if page.is_null() {
                    break;
                }
                if !mem.steal.is_local(idx) {
                    inc(&self.stats.kalloc_hot_list_steal_count);
                }
                mem.hot.push(page as usize);
            }
            if mem.hot.len() >= FLUSH_PAGES {
                break;
            }
        }
    }

    /// Return the oldest half of a full hot cache to the owning buddies.
    /// The half is drained sorted, so consecutive pages usually share a
    /// buddy and the lock is reused; when the next page belongs elsewhere
    /// the current lock is released before the next is taken. Caller holds
    /// the CPU's lock.
    fn flush_hot(&self, mem: &mut CpuMem) {
        inc(&self.stats.kalloc_hot_list_flush_count);
        let pages = mem.hot.drain_flush_half();

        let mut held: Option<usize> = None;
        let mut guard = None;
        for &page in &pages {
            let reuse = held.is_some_and(|idx| self.buddies[idx].contains(page));
            if !reuse {
                // Release before re-acquiring; never two buddy locks.
                drop(guard.take());
                // First match in steal order, in case windows overlap.
                let idx = mem
                    .steal
                    .iter()
                    .find(|&i| self.buddies[i].contains(page))
                    .unwrap_or_else(|| {
                        panic!("kfree: page {page:#x} is not in an allocated region")
                    });
                held = Some(idx);
                guard = Some(self.buddies[idx].lock());
            }
            let idx = held.expect("guard set above");
            if !mem.steal.is_local(idx) {
                inc(&self.stats.kalloc_hot_list_remote_free_count);
            }
            // SAFETY: Pages in the hot cache are free and unreferenced.
            unsafe {
                guard
                    .as_mut()
                    .expect("guard set above")
                    .free(page as *mut u8, PAGE_SIZE);
            }
        }
    }

    // -- Load-balance mode

    /// Allocation pinned to the CPU's home pool, with one balance-and-retry
    /// when the pool is exhausted.
    #[must_use]
    pub fn kalloc_balanced(&self, name: Option<&str>, size: usize) -> *mut u8 {
        let mut res = ptr::null_mut();
        if size == PAGE_SIZE {
            let mut mem = self.cpu_mem[cpu_id()].lock();
            if let Some(page) = mem.hot.pop() {
                inc(&self.stats.kalloc_page_alloc_count);
                res = page as *mut u8;
            }
        }
        if res.is_null() {
            let home = self.cpu_mem[cpu_id()].lock().pool;
            res = self.pools[home].kalloc(&self.buddies, size);
            if res.is_null() {
                let moved = self.balancer.balance(&self.buddies, &self.pools, home);
                if moved > 0 {
                    // Not exactly hot-list stealing, but it is stealing.
                    inc(&self.stats.kalloc_hot_list_steal_count);
                }
                res = self.pools[home].kalloc(&self.buddies, size);
            }
        }
        self.finish_alloc(res, size, name)
    }

    /// Free through the pool table.
    pub fn kfree_balanced(&self, ptr: *mut u8, size: usize) {
        self.prepare_free(ptr, size);
        if size == PAGE_SIZE {
            let mut mem = self.cpu_mem[cpu_id()].lock();
            if mem.hot.is_full() {
                inc(&self.stats.kalloc_hot_list_flush_count);
                let home = mem.pool;
                let pages = mem.hot.drain_flush_half();
                for &page in &pages {
                    self.kfree_pool_from(home, page as *mut u8, PAGE_SIZE);
                }
            }
            mem.hot.push(ptr as usize);
            inc(&self.stats.kalloc_page_free_count);
            return;
        }
        let home = self.cpu_mem[cpu_id()].lock().pool;
        self.kfree_pool_from(home, ptr, size);
    }

    /// Return a block to the pool whose home range contains it.
    pub fn kfree_pool(&self, ptr: *mut u8, size: usize) {
        let home = self.cpu_mem[cpu_id()].lock().pool;
        self.kfree_pool_from(home, ptr, size);
    }

    fn kfree_pool_from(&self, home: usize, ptr: *mut u8, size: usize) {
        let addr = ptr as usize;
        let pool = if self.pools[home].contains_local(addr) {
            home
        } else {
            // Remote memory: home ranges are disjoint and sorted by limit,
            // so binary search finds the owner.
            let idx = self.pools.partition_point(|p| p.limit() <= addr);
            if idx == self.pools.len() || addr < self.pools[idx].base() {
                panic!("kfree: pointer {ptr:p} is not in an allocated region");
            }
            idx
        };
        // SAFETY: The block belongs to this pool's buddy window and the
        // caller is done with it.
        unsafe { self.pools[pool].kfree(&self.buddies, ptr, size) };
    }

    // -- Poison discipline

    /// Post-allocation checks and tracing label.
    fn finish_alloc(&self, res: *mut u8, size: usize, name: Option<&str>) -> *mut u8 {
        if res.is_null() {
            inc(&self.stats.kalloc_out_of_memory);
            log::warn!("kalloc: out of memory ({size} bytes)");
            return res;
        }
        #[cfg(feature = "debug-poison")]
        if size <= crate::config::POISON_CHECK_MAX {
            if let Some(offset) = crate::poison::verify_free_poison(res, size) {
                dump_block(res, size);
                panic!("kalloc: free memory was overwritten at {res:p}+{offset:#x}");
            }
            crate::poison::poison_alloc(res, size);
        }
        log::trace!(
            "kalloc: {size} bytes for \"{}\" at {res:p}",
            name.unwrap_or(DEFAULT_NAME)
        );
        res
    }

    /// Pre-free poisoning and tracing unlabel.
    fn prepare_free(&self, ptr: *mut u8, size: usize) {
        #[cfg(feature = "debug-poison")]
        crate::poison::poison_free(ptr, size);
        log::trace!("kfree: {size} bytes at {ptr:p}");
    }

    // -- Introspection

    /// Event-counter snapshot.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Free bytes across every buddy.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.buddies.iter().map(|b| b.stats().free).sum()
    }

    /// Bytes parked in the hot-page caches.
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        (0..self.ncpus)
            .map(|cpu| self.cpu_mem[cpu].lock().hot.len() * PAGE_SIZE)
            .sum()
    }

    /// The page-metadata table.
    #[must_use]
    pub fn page_info(&self) -> &PageInfoTable {
        &self.page_info
    }

    /// Metadata for the page containing `ptr`, if tracked.
    #[must_use]
    pub fn page_of(&self, ptr: *const u8) -> Option<&PageInfo> {
        self.page_info.get(crate::translate::v2p(ptr))
    }

    /// Log per-CPU free memory, local buddies only.
    pub fn log_stats(&self) {
        for cpu in 0..self.ncpus {
            let local = self.cpu_mem[cpu].lock().steal.local();
            for idx in local.low..local.high {
                let stats = self.buddies[idx].stats();
                log::info!(
                    "cpu {cpu} buddy {idx}: {} bytes free, by order {:?}",
                    stats.free,
                    stats.nfree
                );
            }
        }
    }

    pub(crate) fn buddies(&self) -> &[LockedBuddy] {
        &self.buddies
    }

    pub(crate) fn pools(&self) -> &[MemPool] {
        &self.pools
    }

    pub(crate) fn cpu_mem(&self, cpu: usize) -> &IrqSpinLock<CpuMem> {
        &self.cpu_mem[cpu]
    }
}

/// Log a bounded hex dump of a corrupt block.
#[cfg(feature = "debug-poison")]
fn dump_block(ptr: *const u8, len: usize) {
    // SAFETY: The block was just handed out by a buddy; it is readable.
    let block = unsafe { core::slice::from_raw_parts(ptr, len.min(256)) };
    for (i, chunk) in block.chunks(16).enumerate() {
        log::error!("kalloc: {:#x}: {chunk:02x?}", ptr as usize + i * 16);
    }
}
