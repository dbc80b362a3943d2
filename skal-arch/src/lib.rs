//! # skal-arch
//!
//! The thin architecture seam the allocator stands on:
//! - [`cpu`]: current-CPU identification and local interrupt masking
//! - [`sync`]: [`IrqSpinLock`], a spinlock that masks interrupts while held
//!
//! On bare metal (`target_os = "none"`, aarch64) these drive MPIDR and DAIF
//! directly. On a hosted target the same signatures are backed by a
//! thread-local CPU id and a saved-flags shim, so the allocator and its
//! tests run unmodified on a development machine with test threads standing
//! in for CPUs.

#![cfg_attr(target_os = "none", no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cpu;
pub mod sync;

pub use cpu::cpu_id;
pub use sync::IrqSpinLock;
