//! Topology Binding and Allocator Construction
//!
//! Builds the whole allocator from three inputs: the raw firmware memory
//! map, the NUMA topology, and the boot allocator's high-water mark. The
//! firmware map is scrubbed into a canonical [`PhysMap`], the page-metadata
//! array is placed, each node's memory is carved into per-CPU subnode
//! buddies, and every CPU gets its steal order wired up: local subnodes
//! first, then the node, then the whole machine.

use arrayvec::ArrayVec;
use skal_arch::sync::IrqSpinLock;
use skal_buddy::BuddyPool;
use skal_common::addr::{align_down, align_up};
use skal_common::{FirmwareMap, NumaTopology};

use crate::allocator::{CpuMem, KernelMemory};
use crate::config::{MAX_BUDDIES, MAX_CPUS, PAGE_SIZE};
use crate::page_info::{PageInfo, PageInfoTable};
use crate::phys_map::PhysMap;
use crate::pool::{LockedBuddy, MemPool};
use crate::translate::p2v;

/// Build the allocator. `kernel_end` is the physical address of the first
/// byte past everything the boot allocator handed out.
///
/// # Panics
///
/// Panics if firmware provided no memory map, if a node has CPUs but no
/// usable memory, or if usable memory is left over after every node's
/// claim has been carved out.
#[must_use]
pub fn build_kernel_memory(
    firmware: &FirmwareMap,
    topology: &NumaTopology,
    kernel_end: usize,
) -> KernelMemory {
    build_with_windows(
        firmware,
        topology,
        kernel_end,
        cfg!(feature = "load-balance"),
    )
}

/// As [`build_kernel_memory`], with the buddy-window policy explicit:
/// `wide_windows` gives every buddy the machine-spanning window the
/// load-balance mode needs to accept donated memory.
#[must_use]
pub(crate) fn build_with_windows(
    firmware: &FirmwareMap,
    topology: &NumaTopology,
    kernel_end: usize,
    wide_windows: bool,
) -> KernelMemory {
    let mut mem = parse_firmware_map(firmware);

    // Consider the first 1 MiB unusable.
    mem.remove(0, 0x10_0000);

    for reg in mem.regions() {
        log::debug!("phys: {:#018x}-{:#018x}", reg.base, reg.end - 1);
    }

    let mut newend = align_up(kernel_end, PAGE_SIZE);

    // Place the page metadata array at the current beginning of free
    // memory. If that works, it only needs to cover the pages *after*
    // itself; there is no point tracking the pages that store it.
    let mut page_info_len =
        1 + (mem.max() - newend) / (core::mem::size_of::<PageInfo>() + PAGE_SIZE);
    let mut page_info_bytes = page_info_len * core::mem::size_of::<PageInfo>();
    let mut array_pa = mem.alloc(newend, page_info_bytes, core::mem::align_of::<PageInfo>());
    let page_info_base;
    if array_pa == newend {
        newend = align_up(newend + page_info_bytes, PAGE_SIZE);
        page_info_base = newend;
    } else {
        // The first hole was too small; re-size to cover all of memory and
        // punch the array's footprint out of the map.
        log::info!("first memory hole too small for the page metadata array");
        page_info_len = 1 + mem.max() / PAGE_SIZE;
        page_info_bytes = page_info_len * core::mem::size_of::<PageInfo>();
        array_pa = mem.alloc(newend, page_info_bytes, core::mem::align_of::<PageInfo>());
        page_info_base = 0;
        mem.remove(array_pa, array_pa + page_info_bytes);
    }
    // SAFETY: The storage was just carved out of the physical map and
    // nothing else will ever reference it.
    let page_info = unsafe {
        PageInfoTable::new(p2v(array_pa).cast::<PageInfo>(), page_info_len, page_info_base)
    };

    // Everything below newend belongs to the kernel image, the boot
    // allocator, or the metadata array.
    mem.remove(0, newend);

    log::info!(
        "kalloc: {} KiB usable, tracking {} pages from {:#x}",
        mem.bytes() >> 10,
        page_info.len(),
        page_info.base_pa()
    );

    // Machine-spanning window, for buddies that must accept any memory.
    let machine_base = align_down(mem.base(), PAGE_SIZE);
    let machine_size = align_up(mem.max(), PAGE_SIZE) - machine_base;

    let mut buddies: ArrayVec<LockedBuddy, MAX_BUDDIES> = ArrayVec::new();
    let mut pools: ArrayVec<MemPool, MAX_BUDDIES> = ArrayVec::new();
    let mut cpu_mem: [IrqSpinLock<CpuMem>; MAX_CPUS] =
        core::array::from_fn(|_| IrqSpinLock::new(CpuMem::default()));

    for node in &topology.nodes {
        // Intersect the node's claim with the physical map to get the
        // memory actually available on the node, then take it out of the
        // map in case node claims overlap.
        let mut node_mem = PhysMap::new();
        for range in &node.mems {
            node_mem.add(range.base, range.end());
        }
        node_mem.intersect(&mem);
        mem.remove_map(&node_mem);

        let subnodes = node.cpus.len();
        assert!(subnodes > 0, "NUMA node {} has no CPUs", node.id);
        let size_limit = align_up(node_mem.bytes().div_ceil(subnodes).max(1), PAGE_SIZE);

        #[cfg(feature = "debug-poison")]
        for reg in node_mem.regions() {
            log::debug!("node {}: scrubbing {:#x}..{:#x}", node.id, reg.base, reg.end);
            crate::poison::poison_free(p2v(reg.base), reg.bytes());
        }

        // Divide the node into at most one buddy per CPU.
        let node_low = buddies.len();
        for reg in node_mem.regions() {
            let reg_base = align_up(reg.base, PAGE_SIZE);
            let reg_end = align_down(reg.end, PAGE_SIZE);
            let mut base = reg_base;
            while base < reg_end {
                let subsize = (reg_end - base).min(size_limit);
                let (window_pa, window_size) = if wide_windows {
                    (machine_base, machine_size)
                } else {
                    (reg_base, reg_end - reg_base)
                };
                // SAFETY: This subrange was carved out of the physical map
                // exactly once; the buddy takes ownership of it.
                let buddy = unsafe {
                    BuddyPool::new(
                        p2v(window_pa) as usize,
                        window_size,
                        p2v(base) as usize,
                        subsize,
                    )
                };
                if !buddy.empty() {
                    buddies.push(LockedBuddy::new(buddy));
                    pools.push(MemPool::new(
                        buddies.len() - 1,
                        p2v(base) as usize,
                        subsize,
                    ));
                }
                base += subsize;
            }
        }
        let node_buddies = buddies.len() - node_low;
        assert!(
            node_buddies > 0,
            "NUMA node {} has CPUs but no usable memory",
            node.id
        );

        // Divvy the subnodes up between the node's CPUs. If there are more
        // CPUs than subnodes, neighbouring CPUs share one.
        for (i, &cpu) in node.cpus.iter().enumerate() {
            assert!(cpu < MAX_CPUS, "CPU id {cpu} out of range");
            let cpu_low = node_low + i * node_buddies / subnodes;
            let mut cpu_high = node_low + (i + 1) * node_buddies / subnodes;
            if cpu_low == cpu_high {
                cpu_high += 1;
            }
            assert!(cpu_high <= node_low + node_buddies);

            let state = cpu_mem[cpu].get_mut();
            // First allocate from this CPU's own subnodes, then from the
            // whole node (a no-op when the node has a single subnode).
            state.steal.add(cpu_low, cpu_high);
            state.steal.add(node_low, node_low + node_buddies);
            state.pool = cpu_low;
        }
    }

    // Finally, allow every CPU to steal from any buddy.
    let nbuddies = buddies.len();
    for node in &topology.nodes {
        for &cpu in &node.cpus {
            let state = cpu_mem[cpu].get_mut();
            state.steal.add(0, nbuddies);
            log::debug!("cpu {cpu}: steal order {}", state.steal);
        }
    }

    if !mem.is_empty() {
        panic!("physical memory regions missing from NUMA map");
    }

    // Home ranges are created in address order per node; the pool router's
    // binary search depends on that.
    debug_assert!(pools.windows(2).all(|w| w[0].limit() <= w[1].base()));

    let slabs = crate::slab::configure();
    let ncpus = topology.cpu_count();
    log::info!(
        "kalloc: {nbuddies} buddies across {} nodes for {ncpus} CPUs",
        topology.nodes.len()
    );

    KernelMemory::assemble(buddies, pools, cpu_mem, ncpus, slabs, page_info)
}

/// Clean the raw firmware records into a canonical map. Usable records are
/// added and merged first; reserved records are subtracted afterwards, so a
/// late reservation overrides an early usable claim.
fn parse_firmware_map(firmware: &FirmwareMap) -> PhysMap {
    assert!(!firmware.is_empty(), "firmware provided no memory map");
    let mut mem = PhysMap::new();
    for record in firmware.iter() {
        if record.kind.is_usable() {
            mem.add(record.base, record.end());
        }
    }
    for record in firmware.iter() {
        if !record.kind.is_usable() {
            mem.remove(record.base, record.end());
        }
    }
    mem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steal::Segment;
    use crate::testutil::TestMachine;
    use skal_common::firmware::{FirmwareRegion, RegionKind};
    use skal_common::numa::{MemRange, NumaNode};

    #[test]
    fn test_single_node_machine() {
        let m = TestMachine::single_node(64, 2);
        let km = &m.km;

        // Two CPUs, two subnodes; everything the arena offered minus the
        // metadata overhead is free in the buddies.
        assert_eq!(km.buddies().len(), 2);
        assert_eq!(km.pools().len(), 2);
        assert!(km.free_bytes() > 0);
        assert!(km.free_bytes() < m.arena_bytes());

        // Each CPU's local range is its own subnode, the node fills in the
        // rest, and the machine stratum adds nothing new.
        let steal0 = km.cpu_mem(0).lock().steal.clone();
        assert_eq!(steal0.local(), Segment { low: 0, high: 1 });
        let visited: Vec<usize> = steal0.iter().collect();
        assert_eq!(visited, vec![0, 1]);

        let steal1 = km.cpu_mem(1).lock().steal.clone();
        assert_eq!(steal1.local(), Segment { low: 1, high: 2 });
    }

    #[test]
    fn test_page_metadata_covers_tracked_memory() {
        let m = TestMachine::single_node(64, 1);
        let table = m.km.page_info();
        assert!(table.len() > 0);
        // Every byte a buddy can hand out must be tracked.
        let p = m.km.kalloc(None, crate::config::PAGE_SIZE);
        assert!(!p.is_null());
        let info = m.km.page_of(p).expect("allocated page is tracked");
        assert_eq!(info.refcount(), 0);
        m.km.kfree(p, crate::config::PAGE_SIZE);
    }

    #[test]
    fn test_more_cpus_than_subnodes_share_a_buddy() {
        // Three CPUs but only two pages of node memory: two subnode
        // buddies, and the first two CPUs share one.
        let m = TestMachine::single_node(5, 3);
        let km = &m.km;
        assert_eq!(km.buddies().len(), 2);
        let local0 = km.cpu_mem(0).lock().steal.local();
        let local1 = km.cpu_mem(1).lock().steal.local();
        let local2 = km.cpu_mem(2).lock().steal.local();
        assert_eq!(local0, local1);
        assert_ne!(local0, local2);
    }

    #[test]
    fn test_two_node_machine_steal_orders() {
        let m = TestMachine::two_nodes(64, false);
        let km = &m.km;
        // One subnode per node.
        assert_eq!(km.buddies().len(), 2);

        // CPU 0 is on node 0: local buddy 0, then the machine.
        let steal0 = km.cpu_mem(0).lock().steal.clone();
        assert_eq!(steal0.local(), Segment { low: 0, high: 1 });
        let visited: Vec<usize> = steal0.iter().collect();
        assert_eq!(visited, vec![0, 1]);

        let steal1 = km.cpu_mem(1).lock().steal.clone();
        assert_eq!(steal1.local(), Segment { low: 1, high: 2 });
        let visited: Vec<usize> = steal1.iter().collect();
        assert_eq!(visited, vec![1, 0]);
    }

    #[test]
    #[should_panic(expected = "firmware provided no memory map")]
    fn test_empty_firmware_map_is_fatal() {
        let _ = parse_firmware_map(&FirmwareMap::new());
    }

    #[test]
    #[should_panic(expected = "physical memory regions missing from NUMA map")]
    fn test_unclaimed_memory_is_fatal() {
        // Topology only claims the lower half of the firmware's memory.
        let arena = crate::testutil::TestArena::new(64);
        let mut firmware = FirmwareMap::new();
        firmware.push(FirmwareRegion::new(
            arena.base(),
            arena.len(),
            RegionKind::Usable,
        ));
        let mut topo = NumaTopology::new();
        let mut node = NumaNode::new(0);
        node.cpus.push(0);
        node.mems.push(MemRange::new(arena.base(), arena.len() / 2));
        topo.nodes.push(node);
        let _ = build_kernel_memory(&firmware, &topo, arena.base());
    }

    #[test]
    fn test_reserved_records_override_usable() {
        // A reserved record later in the firmware list punches a hole in
        // an earlier usable one.
        let mut firmware = FirmwareMap::new();
        firmware.push(FirmwareRegion::new(0x100000, 0x100000, RegionKind::Usable));
        firmware.push(FirmwareRegion::new(0x140000, 0x20000, RegionKind::Reserved));
        let mem = parse_firmware_map(&firmware);
        let spans: Vec<(usize, usize)> =
            mem.regions().iter().map(|r| (r.base, r.end)).collect();
        assert_eq!(spans, vec![(0x100000, 0x140000), (0x160000, 0x200000)]);
    }
}
