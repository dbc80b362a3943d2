//! Allocator event counters
//!
//! Relaxed atomic counters matching the exported `kalloc_*` names. They are
//! incremented without cross-CPU synchronisation; occasional lost updates
//! are acceptable, the numbers are diagnostics, not accounting.

use core::sync::atomic::{AtomicU64, Ordering};

/// The allocator's event counters.
#[derive(Debug, Default)]
pub struct KallocStats {
    /// Page-size allocations served (hot cache or refill).
    pub kalloc_page_alloc_count: AtomicU64,
    /// Page-size frees accepted into the hot cache.
    pub kalloc_page_free_count: AtomicU64,
    /// Hot-cache refills triggered by an empty cache.
    pub kalloc_hot_list_refill_count: AtomicU64,
    /// Hot-cache half-flushes triggered by a full cache.
    pub kalloc_hot_list_flush_count: AtomicU64,
    /// Blocks pulled from a non-local buddy.
    pub kalloc_hot_list_steal_count: AtomicU64,
    /// Pages returned to a non-local buddy during a flush.
    pub kalloc_hot_list_remote_free_count: AtomicU64,
    /// Allocations that failed everywhere.
    pub kalloc_out_of_memory: AtomicU64,
}

/// Point-in-time copy of the counters, for tests and reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub page_alloc_count: u64,
    pub page_free_count: u64,
    pub hot_list_refill_count: u64,
    pub hot_list_flush_count: u64,
    pub hot_list_steal_count: u64,
    pub hot_list_remote_free_count: u64,
    pub out_of_memory: u64,
}

impl KallocStats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kalloc_page_alloc_count: AtomicU64::new(0),
            kalloc_page_free_count: AtomicU64::new(0),
            kalloc_hot_list_refill_count: AtomicU64::new(0),
            kalloc_hot_list_flush_count: AtomicU64::new(0),
            kalloc_hot_list_steal_count: AtomicU64::new(0),
            kalloc_hot_list_remote_free_count: AtomicU64::new(0),
            kalloc_out_of_memory: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            page_alloc_count: self.kalloc_page_alloc_count.load(Ordering::Relaxed),
            page_free_count: self.kalloc_page_free_count.load(Ordering::Relaxed),
            hot_list_refill_count: self.kalloc_hot_list_refill_count.load(Ordering::Relaxed),
            hot_list_flush_count: self.kalloc_hot_list_flush_count.load(Ordering::Relaxed),
            hot_list_steal_count: self.kalloc_hot_list_steal_count.load(Ordering::Relaxed),
            hot_list_remote_free_count: self
                .kalloc_hot_list_remote_free_count
                .load(Ordering::Relaxed),
            out_of_memory: self.kalloc_out_of_memory.load(Ordering::Relaxed),
        }
    }
}

/// Bump one counter; tolerates concurrent unsynchronised increments.
#[inline]
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_sees_increments() {
        let stats = KallocStats::new();
        inc(&stats.kalloc_page_alloc_count);
        inc(&stats.kalloc_page_alloc_count);
        inc(&stats.kalloc_out_of_memory);
        let snap = stats.snapshot();
        assert_eq!(snap.page_alloc_count, 2);
        assert_eq!(snap.out_of_memory, 1);
        assert_eq!(snap.hot_list_flush_count, 0);
    }
}
