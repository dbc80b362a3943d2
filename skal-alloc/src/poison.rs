//! Memory poisoning patterns
//!
//! Feature-gated under the `debug-poison` feature.
//! Freed memory is filled with a sentinel and verified when it is handed
//! out again, catching writes through dangling references. The first
//! `2 * size_of::<usize>()` bytes of every page are exempt: buddy free-list
//! links live there.

use crate::config::PAGE_SIZE;

/// Pattern for freed memory.
pub const FREE_POISON: u8 = 0x01;

/// Pattern for freshly allocated memory.
pub const ALLOC_POISON: u8 = 0x02;

/// Bytes at the start of each page the verifier skips.
const LINK_BYTES: usize = 2 * core::mem::size_of::<usize>();

/// Fill a block with the freed-memory pattern.
pub fn poison_free(ptr: *mut u8, len: usize) {
    // SAFETY: Caller must ensure ptr is valid for len bytes.
    unsafe {
        core::ptr::write_bytes(ptr, FREE_POISON, len);
    }
}

/// Fill a block with the allocated-memory pattern.
pub fn poison_alloc(ptr: *mut u8, len: usize) {
    // SAFETY: Caller must ensure ptr is valid for len bytes.
    unsafe {
        core::ptr::write_bytes(ptr, ALLOC_POISON, len);
    }
}

/// Verify a block still carries the freed-memory pattern.
///
/// Skips the link words at the head of each page. Returns the offset of the
/// first corrupt byte, or `None` if the block is clean.
#[must_use]
pub fn verify_free_poison(ptr: *const u8, len: usize) -> Option<usize> {
    // SAFETY: Caller must ensure ptr is valid for len bytes.
    let block = unsafe { core::slice::from_raw_parts(ptr, len) };
    for (i, &byte) in block.iter().enumerate() {
        if (ptr as usize + i) % PAGE_SIZE < LINK_BYTES {
            continue;
        }
        if byte != FREE_POISON {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poison_roundtrip() {
        let mut buf = [0u8; 64];
        poison_free(buf.as_mut_ptr(), buf.len());
        assert!(buf.iter().all(|&b| b == FREE_POISON));
        poison_alloc(buf.as_mut_ptr(), buf.len());
        assert!(buf.iter().all(|&b| b == ALLOC_POISON));
    }

    #[test]
    fn test_verify_skips_page_links() {
        // A page-aligned buffer whose head bytes hold fake list links.
        let layout = std::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { std::alloc::alloc(layout) };
        poison_free(ptr, PAGE_SIZE);
        unsafe {
            core::ptr::write_bytes(ptr, 0xAB, LINK_BYTES);
        }
        assert_eq!(verify_free_poison(ptr, PAGE_SIZE), None);

        // A corrupt byte past the links is reported at its offset.
        unsafe { *ptr.add(100) = 0x7F };
        assert_eq!(verify_free_poison(ptr, PAGE_SIZE), Some(100));
        unsafe { std::alloc::dealloc(ptr, layout) };
    }
}
