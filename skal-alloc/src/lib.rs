//! # skal-alloc
//!
//! A scalable, NUMA-aware kernel physical-memory allocator. Physical
//! memory arrives as a dirty firmware map, gets cleaned into a canonical
//! region map, and is split across NUMA nodes into per-CPU buddy
//! allocators. Requests route for locality:
//!
//! 1. a per-CPU **hot-page cache** absorbs single-page traffic without
//!    touching any shared lock;
//! 2. the CPU's **steal order** walks its own subnode buddies first, then
//!    the node, then the whole machine;
//! 3. under the `load-balance` feature, CPUs instead pin to a home pool
//!    and a **balancer** bulk-moves memory from the fullest peer when the
//!    pool runs dry.
//!
//! # Features
//!
//! - `debug-poison` (default): freed memory is filled with a sentinel and
//!   verified when handed out again; a corrupt block is a fatal panic with
//!   a hex dump.
//! - `load-balance`: selects the home-pool/balancer routing mode instead
//!   of the per-request steal order.
//!
//! # Usage
//!
//! ```ignore
//! // Early boot, before anything allocates:
//! skal_alloc::boot_init(kernel_end, boot_limit);
//! let early_page = skal_alloc::kalloc(None, PAGE_SIZE);
//!
//! // Once firmware and topology are parsed:
//! skal_alloc::init_kalloc(&firmware_map, &numa_topology);
//!
//! // Steady state, from any CPU, including interrupt context:
//! let p = skal_alloc::kalloc(Some("inode"), 4096);
//! skal_alloc::kfree(p, 4096);
//! ```
//!
//! The global allocator is initialised exactly once; everything after init
//! sees fully published state.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocator;
pub mod bootmem;
pub mod config;
pub mod ctl;
pub mod hot;
pub mod init;
pub mod page_info;
pub mod phys_map;
pub mod pool;
pub mod slab;
pub mod stats;
pub mod steal;
pub mod translate;

#[cfg(feature = "debug-poison")]
pub mod poison;

#[cfg(test)]
pub(crate) mod testutil;

pub use allocator::{CpuMem, KernelMemory};
pub use init::build_kernel_memory;
pub use slab::SlabKind;
pub use stats::StatsSnapshot;

use skal_arch::sync::IrqSpinLock;
use skal_common::{FirmwareMap, NumaTopology};
use spin::Once;

use crate::bootmem::BootAlloc;
use crate::config::PAGE_SIZE;

/// The machine's allocator, published exactly once by [`init_kalloc`].
static KALLOC: Once<KernelMemory> = Once::new();

/// The boot allocator, live between [`boot_init`] and [`init_kalloc`].
static BOOT: IrqSpinLock<Option<BootAlloc>> = IrqSpinLock::new(None);

/// Hand the boot allocator the memory right after the kernel image.
/// Called once, before anything allocates.
///
/// # Panics
///
/// Panics on a second call.
pub fn boot_init(kernel_end: usize, limit: usize) {
    let mut boot = BOOT.lock();
    assert!(boot.is_none(), "boot allocator initialised twice");
    *boot = Some(BootAlloc::new(kernel_end, limit));
}

/// Build and publish the allocator from the firmware map and NUMA
/// topology. The boot allocator's high-water mark becomes the start of
/// tracked memory. Idempotent: later calls return the first result.
pub fn init_kalloc(
    firmware: &FirmwareMap,
    topology: &NumaTopology,
) -> &'static KernelMemory {
    KALLOC.call_once(|| {
        let newend = BOOT
            .lock()
            .as_ref()
            .expect("boot allocator not initialised")
            .newend();
        init::build_kernel_memory(firmware, topology, newend)
    })
}

/// True once [`init_kalloc`] has published the allocator.
#[must_use]
pub fn kinited() -> bool {
    KALLOC.get().is_some()
}

/// The published allocator, if init has run.
#[must_use]
pub fn kernel_memory() -> Option<&'static KernelMemory> {
    KALLOC.get()
}

/// Allocate `size` bytes, labelled `name` for tracing. Null on OOM.
///
/// Before init, only page-size allocations are accepted and they come from
/// the boot allocator, zero-filled.
#[must_use]
pub fn kalloc(name: Option<&str>, size: usize) -> *mut u8 {
    match KALLOC.get() {
        Some(km) => km.kalloc(name, size),
        None => {
            assert_eq!(size, PAGE_SIZE, "boot allocator serves single pages only");
            BOOT.lock()
                .as_mut()
                .expect("boot allocator not initialised")
                .pgalloc()
        }
    }
}

/// Free a block from [`kalloc`]. A no-op before init; boot pages are never
/// reclaimed.
pub fn kfree(ptr: *mut u8, size: usize) {
    if let Some(km) = KALLOC.get() {
        km.kfree(ptr, size);
    }
}

/// Allocate from a slab class.
///
/// # Panics
///
/// Panics before init.
#[must_use]
pub fn slab_alloc(kind: SlabKind) -> *mut u8 {
    KALLOC
        .get()
        .expect("kalloc not initialised")
        .slab_alloc(kind)
}

/// Free a block from [`slab_alloc`].
///
/// # Panics
///
/// Panics before init.
pub fn slab_free(kind: SlabKind, ptr: *mut u8) {
    KALLOC
        .get()
        .expect("kalloc not initialised")
        .slab_free(kind, ptr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use skal_common::firmware::{FirmwareRegion, RegionKind};

    /// The one end-to-end test of the global façade: the process-wide
    /// singletons can only be initialised once, so boot, init, steady
    /// state, slabs and the control surface are all driven here in order.
    #[test]
    fn test_boot_to_steady_state() {
        // Leak the backing arena: the global allocator lives forever.
        let pages = 128;
        let layout =
            std::alloc::Layout::from_size_align(pages * PAGE_SIZE, 1 << 22).unwrap();
        let base = unsafe { std::alloc::alloc(layout) } as usize;
        assert_ne!(base, 0);

        // Boot phase: page-size, zero-filled bump allocations.
        assert!(!kinited());
        boot_init(base, base + pages * PAGE_SIZE);
        let early = kalloc(None, PAGE_SIZE);
        assert_eq!(early as usize % PAGE_SIZE, 0);
        let page = unsafe { core::slice::from_raw_parts(early, PAGE_SIZE) };
        assert!(page.iter().all(|&b| b == 0));
        // Pre-init frees are a quiet no-op.
        kfree(early, PAGE_SIZE);

        // Full init from firmware map and topology.
        let mut firmware = FirmwareMap::new();
        firmware.push(FirmwareRegion::new(
            base,
            pages * PAGE_SIZE,
            RegionKind::Usable,
        ));
        let topo = NumaTopology::single_node(1, base, pages * PAGE_SIZE);
        let km = init_kalloc(&firmware, &topo);
        assert!(kinited());
        let total = km.free_bytes() + km.cached_bytes();
        assert!(total > 0);

        // Steady state through the free functions.
        let p = kalloc(Some("test"), 2 * PAGE_SIZE);
        assert!(!p.is_null());
        kfree(p, 2 * PAGE_SIZE);
        let q = kalloc(None, PAGE_SIZE);
        assert!(!q.is_null());
        kfree(q, PAGE_SIZE);
        assert_eq!(km.free_bytes() + km.cached_bytes(), total);

        // Slabs ride on the façade.
        let stack = slab_alloc(SlabKind::Stack);
        assert!(!stack.is_null());
        slab_free(SlabKind::Stack, stack);

        // And the benchmark control surface drives the same instance.
        let ctl = ctl::MemCtl::new();
        ctl.command(km, 1, 8, ctl::OP_CONFIGURE);
        ctl.command(km, 0, 0, ctl::OP_ALLOC);
        ctl.command(km, 0, 0, ctl::OP_FREE);
        let stats = ctl.per_cpu_stats()[0];
        assert_eq!(stats.nalloc, 8);
        assert_eq!(stats.nfree, 8);
        assert_eq!(km.free_bytes() + km.cached_bytes(), total);

        km.log_stats();
    }
}
