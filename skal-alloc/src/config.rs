//! Allocator configuration constants

/// Page size in bytes.
pub const PAGE_SIZE: usize = skal_common::PAGE_SIZE;

/// Depth of each CPU's hot-page cache.
pub const HOT_PAGES: usize = 16;

/// Maximum CPUs the allocator is built for.
pub const MAX_CPUS: usize = 16;

/// Maximum NUMA nodes.
pub const MAX_NUMA_NODES: usize = 8;

/// Maximum number of buddy allocators. Each CPU needs at least one, with
/// margin for CPU memory regions that span physical holes.
pub const MAX_BUDDIES: usize = MAX_CPUS + 16;

/// Allocations at most this large are poison-checked on the way out.
pub const POISON_CHECK_MAX: usize = 16384;

/// Kernel stack slab size in bytes.
pub const KSTACK_SIZE: usize = 16384;

/// Perf-buffer slab size in bytes.
pub const PERF_SIZE: usize = 8192;

/// Work-queue slab size in bytes.
pub const WQUEUE_SIZE: usize = PAGE_SIZE;
