//! Interrupt-Safe Spinlock
//!
//! [`IrqSpinLock`] masks local interrupts before spinning, preventing the
//! classic deadlock where an interrupt handler tries to take a lock its own
//! CPU already holds. The guard restores the saved interrupt state on drop,
//! on every exit path.
//!
//! # Safety Invariants
//!
//! - The lock must be released before sleeping or blocking
//! - Critical sections should be kept short
//! - A holder must not acquire the same lock again

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu::{disable_interrupts, restore_interrupts, IrqFlags};

/// A spinlock that disables local interrupts while held.
///
/// Uses test-and-set with exponential backoff; appropriate for the short
/// critical sections the allocator takes around a single buddy call.
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: IrqSpinLock provides mutual exclusion for its data; the data is
// only reachable through a guard that holds the lock.
unsafe impl<T: Send> Send for IrqSpinLock<T> {}
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    /// Create a new lock wrapping `data`.
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, masking interrupts first.
    ///
    /// Interrupts stay masked until the returned guard drops.
    #[must_use]
    pub fn lock(&self) -> IrqSpinGuard<'_, T> {
        let flags = disable_interrupts();

        let mut backoff = 1u32;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            for _ in 0..backoff {
                spin_loop();
            }
            backoff = (backoff * 2).min(64);
        }

        IrqSpinGuard {
            lock: self,
            flags,
            _not_send: PhantomData,
        }
    }

    /// Try to acquire the lock without spinning.
    ///
    /// Interrupts are only left masked if the lock was acquired.
    #[must_use]
    pub fn try_lock(&self) -> Option<IrqSpinGuard<'_, T>> {
        let flags = disable_interrupts();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinGuard {
                lock: self,
                flags,
                _not_send: PhantomData,
            })
        } else {
            restore_interrupts(flags);
            None
        }
    }

    /// Get a mutable reference to the data. Safe: `&mut self` proves
    /// exclusive access, no locking needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for IrqSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Guard for a held [`IrqSpinLock`]. Restores interrupt state on drop.
pub struct IrqSpinGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    flags: IrqFlags,
    // Saved interrupt state is meaningful only on the acquiring CPU.
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for IrqSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: We hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: We hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore_interrupts(self.flags);
    }
}
