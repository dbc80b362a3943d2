//! Locked Buddies, Balanceable Pools, and the Balancer
//!
//! [`LockedBuddy`] pairs a [`BuddyPool`] with its lock; a buddy's identity
//! is its index in the global table, stable for the life of the system.
//! The window is mirrored outside the lock so containment queries never
//! contend with allocation.
//!
//! [`MemPool`] views a buddy as a balanceable pool: the home portion of a
//! NUMA node's memory, able to report its free count and donate a bounded
//! chunk to a starved peer. The [`Balancer`] picks the donor.

use skal_arch::sync::{IrqSpinGuard, IrqSpinLock};
use skal_buddy::{BuddyPool, BuddyStats};

/// A buddy allocator pinned by its lock.
pub struct LockedBuddy {
    window_base: usize,
    window_size: usize,
    pool: IrqSpinLock<BuddyPool>,
}

impl LockedBuddy {
    #[must_use]
    pub fn new(pool: BuddyPool) -> Self {
        Self {
            window_base: pool.window_base(),
            window_size: pool.window_size(),
            pool: IrqSpinLock::new(pool),
        }
    }

    /// True if `ptr` lies in this buddy's managed window. Lock-free: the
    /// window never changes after construction.
    #[inline]
    #[must_use]
    pub fn contains(&self, ptr: usize) -> bool {
        ptr >= self.window_base && ptr < self.window_base + self.window_size
    }

    /// Acquire the buddy. The lock is held across a single buddy call and
    /// nothing else.
    #[must_use]
    pub fn lock(&self) -> IrqSpinGuard<'_, BuddyPool> {
        self.pool.lock()
    }

    /// Free-memory snapshot, taken under the lock.
    #[must_use]
    pub fn stats(&self) -> BuddyStats {
        self.lock().stats()
    }
}

/// The capability set the balancer needs from a pool.
pub trait BalancePool {
    /// Free bytes this pool could donate from.
    fn balance_count(&self, buddies: &[LockedBuddy]) -> usize;

    /// Donate a bounded chunk to `target`. Returns the bytes requested
    /// from the donor, or 0 if nothing could be moved.
    fn balance_move_to(&self, buddies: &[LockedBuddy], target: &Self) -> usize;
}

/// A buddy viewed as a balanceable pool.
///
/// `base..limit` is the pool's *home* range: the memory that originated on
/// its NUMA node. The buddy behind it can hold any physical memory, which
/// is what lets pools trade blocks.
#[derive(Debug, Clone, Copy)]
pub struct MemPool {
    buddy: usize,
    base: usize,
    limit: usize,
}

impl MemPool {
    #[must_use]
    pub fn new(buddy: usize, base: usize, size: usize) -> Self {
        Self {
            buddy,
            base,
            limit: base + size,
        }
    }

    /// Index of the buddy backing this pool.
    #[must_use]
    pub fn buddy_index(&self) -> usize {
        self.buddy
    }

    /// Base of the home range.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    /// First address beyond the home range.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// True if `ptr` lies in this pool's home range.
    #[must_use]
    pub fn contains_local(&self, ptr: usize) -> bool {
        self.base <= ptr && ptr < self.limit
    }

    /// Allocate from the backing buddy.
    #[must_use]
    pub fn kalloc(&self, buddies: &[LockedBuddy], size: usize) -> *mut u8 {
        buddies[self.buddy].lock().alloc(size)
    }

    /// Free into the backing buddy.
    ///
    /// # Safety
    ///
    /// `ptr` must be an unreferenced block of `size` bytes inside the
    /// backing buddy's window.
    pub unsafe fn kfree(&self, buddies: &[LockedBuddy], ptr: *mut u8, size: usize) {
        // SAFETY: Forwarded caller contract.
        unsafe { buddies[self.buddy].lock().free(ptr, size) };
    }
}

impl BalancePool for MemPool {
    fn balance_count(&self, buddies: &[LockedBuddy]) -> usize {
        buddies[self.buddy].stats().free
    }

    fn balance_move_to(&self, buddies: &[LockedBuddy], target: &Self) -> usize {
        let avail = self.balance_count(buddies);
        // Steal no more than half of the donor, and no more than the
        // largest single buddy block.
        let steal = BuddyPool::MAX_SIZE.min(avail / 2);
        if steal == 0 {
            return 0;
        }
        let block = buddies[self.buddy].lock().alloc(steal);
        if block.is_null() {
            return 0;
        }
        log::debug!(
            "balance: moved {steal} bytes at {block:p} from buddy {} to buddy {}",
            self.buddy,
            target.buddy
        );
        // The donor lock is already released; the block changes pool
        // ownership here.
        // SAFETY: The block was just allocated and nothing references it.
        unsafe { target.kfree(buddies, block, steal) };
        steal
    }
}

/// Cross-pool donation: when a pool is exhausted, pick one donor and pull a
/// chunk from it.
#[derive(Debug, Default)]
pub struct Balancer;

impl Balancer {
    /// Move memory from the fullest peer into `acceptor`.
    ///
    /// Returns the bytes moved, 0 if every peer is empty too.
    pub fn balance(
        &self,
        buddies: &[LockedBuddy],
        pools: &[MemPool],
        acceptor: usize,
    ) -> usize {
        let mut donor: Option<(usize, usize)> = None;
        for (i, pool) in pools.iter().enumerate() {
            if i == acceptor {
                continue;
            }
            let free = pool.balance_count(buddies);
            if free > 0 && donor.map_or(true, |(_, best)| free > best) {
                donor = Some((i, free));
            }
        }
        match donor {
            Some((i, _)) => pools[i].balance_move_to(buddies, &pools[acceptor]),
            None => 0,
        }
    }
}
