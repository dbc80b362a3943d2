//! Test Support
//!
//! Hosted tests stand a machine up from a plain heap arena: the arena's
//! addresses are the "physical" memory (the direct map defaults to
//! identity), the firmware map covers the arena, and a synthetic topology
//! splits it across nodes. Test threads play CPUs via
//! `skal_arch::cpu::set_cpu_id_for_thread`.

use std::alloc::{alloc, dealloc, Layout};

use skal_common::firmware::{FirmwareMap, FirmwareRegion, RegionKind};
use skal_common::numa::{MemRange, NumaNode, NumaTopology};
use skal_common::PAGE_SIZE;

use crate::allocator::KernelMemory;
use crate::init::build_with_windows;

/// Arena alignment: generous, so buddy carving is predictable.
const ARENA_ALIGN: usize = 1 << 22;

/// A page-granular backing arena.
pub struct TestArena {
    ptr: *mut u8,
    layout: Layout,
}

impl TestArena {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, ARENA_ALIGN).unwrap();
        let ptr = unsafe { alloc(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    pub fn base(&self) -> usize {
        self.ptr as usize
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for TestArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// An arena plus the allocator built over it.
pub struct TestMachine {
    pub arena: TestArena,
    pub km: KernelMemory,
}

impl TestMachine {
    /// One node owning the whole arena, CPUs `0..cpus`.
    pub fn single_node(pages: usize, cpus: usize) -> Self {
        let arena = TestArena::new(pages);
        let mut firmware = FirmwareMap::new();
        firmware.push(FirmwareRegion::new(
            arena.base(),
            arena.len(),
            RegionKind::Usable,
        ));
        let topo = NumaTopology::single_node(cpus, arena.base(), arena.len());
        let km = build_with_windows(&firmware, &topo, arena.base(), false);
        Self { arena, km }
    }

    /// Two nodes of `pages_per_node` pages each, one CPU per node.
    pub fn two_nodes(pages_per_node: usize, wide_windows: bool) -> Self {
        Self::two_nodes_with_cpus(pages_per_node, &[0], &[1], wide_windows)
    }

    /// Two nodes of `pages_per_node` pages each with explicit CPU lists:
    /// node 0 owns the lower half of the arena, node 1 the upper half.
    pub fn two_nodes_with_cpus(
        pages_per_node: usize,
        node0_cpus: &[usize],
        node1_cpus: &[usize],
        wide_windows: bool,
    ) -> Self {
        let arena = TestArena::new(2 * pages_per_node);
        let half = pages_per_node * PAGE_SIZE;
        let mut firmware = FirmwareMap::new();
        firmware.push(FirmwareRegion::new(
            arena.base(),
            arena.len(),
            RegionKind::Usable,
        ));

        let mut topo = NumaTopology::new();
        let mut node0 = NumaNode::new(0);
        node0.cpus.extend(node0_cpus.iter().copied());
        node0.mems.push(MemRange::new(arena.base(), half));
        topo.nodes.push(node0);
        let mut node1 = NumaNode::new(1);
        node1.cpus.extend(node1_cpus.iter().copied());
        node1.mems.push(MemRange::new(arena.base() + half, half));
        topo.nodes.push(node1);

        let km = build_with_windows(&firmware, &topo, arena.base(), wide_windows);
        Self { arena, km }
    }

    pub fn arena_bytes(&self) -> usize {
        self.arena.len()
    }

    /// True if `ptr` falls in the upper (node 1) half of the arena.
    pub fn in_upper_half(&self, ptr: *const u8) -> bool {
        ptr as usize >= self.arena.base() + self.arena.len() / 2
    }
}
