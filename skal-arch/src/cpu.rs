//! CPU Identification and Interrupt Masking
//!
//! `cpu_id()` names the executing CPU; `disable_interrupts()` /
//! `restore_interrupts()` bracket short critical sections. Saved flags are
//! opaque to callers and must be passed back exactly as received.

/// Saved interrupt state, returned by [`disable_interrupts`].
pub type IrqFlags = u64;

#[cfg(target_os = "none")]
mod imp {
    use super::IrqFlags;
    use core::arch::asm;

    /// Get the current CPU id (MPIDR_EL1 Aff0 field).
    #[must_use]
    pub fn cpu_id() -> usize {
        let mpidr: u64;
        // SAFETY: Reading MPIDR_EL1 is always safe in kernel mode.
        unsafe {
            asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack));
        }
        (mpidr & 0xFF) as usize
    }

    /// Mask local interrupts, returning the previous DAIF state.
    #[must_use]
    pub fn disable_interrupts() -> IrqFlags {
        let daif: u64;
        // SAFETY: Reading and setting DAIF is safe in kernel mode.
        unsafe {
            asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack));
            asm!("msr daifset, #0xf", options(nomem, nostack));
        }
        daif
    }

    /// Restore a DAIF state saved by [`disable_interrupts`].
    pub fn restore_interrupts(flags: IrqFlags) {
        // SAFETY: Writing a previously read DAIF value is safe in kernel mode.
        unsafe {
            asm!("msr daif, {}", in(reg) flags, options(nomem, nostack));
        }
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    use super::IrqFlags;
    use std::cell::Cell;

    std::thread_local! {
        static CPU_ID: Cell<usize> = const { Cell::new(0) };
        static IRQ_DEPTH: Cell<u64> = const { Cell::new(0) };
    }

    /// Get the current CPU id.
    ///
    /// Hosted builds treat each thread as a CPU; the id defaults to 0 and is
    /// set with [`set_cpu_id_for_thread`].
    #[must_use]
    pub fn cpu_id() -> usize {
        CPU_ID.with(Cell::get)
    }

    /// Pin the calling thread to a CPU id (hosted builds only).
    pub fn set_cpu_id_for_thread(id: usize) {
        CPU_ID.with(|c| c.set(id));
    }

    /// Mask local interrupts. Hosted builds track nesting depth only.
    #[must_use]
    pub fn disable_interrupts() -> IrqFlags {
        IRQ_DEPTH.with(|d| {
            let depth = d.get();
            d.set(depth + 1);
            depth
        })
    }

    /// Restore interrupt state saved by [`disable_interrupts`].
    pub fn restore_interrupts(flags: IrqFlags) {
        IRQ_DEPTH.with(|d| d.set(flags));
    }
}

pub use imp::{cpu_id, disable_interrupts, restore_interrupts};

#[cfg(not(target_os = "none"))]
pub use imp::set_cpu_id_for_thread;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_id_is_per_thread() {
        assert_eq!(cpu_id(), 0);
        set_cpu_id_for_thread(3);
        assert_eq!(cpu_id(), 3);

        let handle = std::thread::spawn(|| {
            assert_eq!(cpu_id(), 0);
            set_cpu_id_for_thread(1);
            cpu_id()
        });
        assert_eq!(handle.join().unwrap(), 1);
        assert_eq!(cpu_id(), 3);
        set_cpu_id_for_thread(0);
    }

    #[test]
    fn test_interrupt_nesting() {
        let outer = disable_interrupts();
        let inner = disable_interrupts();
        restore_interrupts(inner);
        restore_interrupts(outer);
    }
}
