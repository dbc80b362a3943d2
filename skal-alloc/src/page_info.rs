//! Per-Page Metadata
//!
//! A flat array of [`PageInfo`] covering tracked physical memory, placed by
//! init in the first hole large enough to hold it. The array itself never
//! changes after init; only the per-page fields do. Indexing is by page
//! frame, offset by the physical address the array starts tracking at.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::PAGE_SIZE;

/// Metadata for one physical page.
#[derive(Debug)]
#[repr(C)]
pub struct PageInfo {
    refcount: AtomicU32,
}

impl PageInfo {
    /// Current reference count.
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Take a reference.
    pub fn inc_ref(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a reference, returning the previous count.
    pub fn dec_ref(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::Release)
    }
}

/// The page-metadata array: base physical address of the first tracked
/// page, plus the array storage carved out of physical memory at init.
#[derive(Debug)]
pub struct PageInfoTable {
    base_pa: usize,
    array: *mut PageInfo,
    len: usize,
}

// SAFETY: The storage is owned by the table for the life of the system and
// every per-page field is atomic.
unsafe impl Send for PageInfoTable {}
unsafe impl Sync for PageInfoTable {}

impl PageInfoTable {
    /// Take over `len` entries of zeroed metadata storage at `array`,
    /// tracking pages from physical address `base_pa` upward.
    ///
    /// # Safety
    ///
    /// `array` must point to storage for `len` entries that nothing else
    /// references; the table zero-fills and owns it from here on.
    #[must_use]
    pub unsafe fn new(array: *mut PageInfo, len: usize, base_pa: usize) -> Self {
        // SAFETY: Caller hands us the storage; an all-zero PageInfo is a
        // valid PageInfo.
        unsafe {
            core::ptr::write_bytes(array, 0, len);
        }
        Self {
            base_pa,
            array,
            len,
        }
    }

    /// Number of pages tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical address of the first tracked page.
    #[must_use]
    pub fn base_pa(&self) -> usize {
        self.base_pa
    }

    /// Metadata for the page containing physical address `pa`, or `None`
    /// if the page is not tracked.
    #[must_use]
    pub fn get(&self, pa: usize) -> Option<&PageInfo> {
        if pa < self.base_pa {
            return None;
        }
        let index = (pa - self.base_pa) / PAGE_SIZE;
        if index >= self.len {
            return None;
        }
        // SAFETY: Bounds-checked; the storage lives as long as the table.
        Some(unsafe { &*self.array.add(index) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_refcount() {
        let mut storage: Vec<PageInfo> = (0..8)
            .map(|_| PageInfo {
                refcount: AtomicU32::new(0xFFFF),
            })
            .collect();
        let base_pa = 0x10_0000;
        let table = unsafe { PageInfoTable::new(storage.as_mut_ptr(), storage.len(), base_pa) };

        // Construction zeroed the stale storage.
        assert_eq!(table.len(), 8);
        let info = table.get(base_pa + PAGE_SIZE + 123).unwrap();
        assert_eq!(info.refcount(), 0);

        info.inc_ref();
        info.inc_ref();
        assert_eq!(info.dec_ref(), 2);
        assert_eq!(info.refcount(), 1);

        // Below and beyond the tracked range.
        assert!(table.get(base_pa - 1).is_none());
        assert!(table.get(base_pa + 8 * PAGE_SIZE).is_none());
    }
}
