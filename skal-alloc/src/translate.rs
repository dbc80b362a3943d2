//! Physical-to-Virtual Address Translation
//!
//! The allocator computes in physical addresses but touches memory through
//! kernel-virtual pointers. The two differ by one direct-map offset, set
//! once during early init before any translation happens. The default of
//! zero is an identity map, which is what hosted tests run under.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Direct-map offset: `virt = phys + offset`.
static PHYS_TO_VIRT_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Set the direct-map offset (called once during early init).
pub fn set_phys_to_virt_offset(offset: usize) {
    PHYS_TO_VIRT_OFFSET.store(offset, Ordering::Relaxed);
}

/// Translate a physical address to a kernel-virtual pointer.
#[inline]
#[must_use]
pub fn p2v(phys: usize) -> *mut u8 {
    (phys + PHYS_TO_VIRT_OFFSET.load(Ordering::Relaxed)) as *mut u8
}

/// Translate a kernel-virtual pointer to its physical address.
#[inline]
#[must_use]
pub fn v2p(virt: *const u8) -> usize {
    (virt as usize) - PHYS_TO_VIRT_OFFSET.load(Ordering::Relaxed)
}
