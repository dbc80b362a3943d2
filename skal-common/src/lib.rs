//! # skal-common
//!
//! Shared types and constants for the skal physical-memory allocator:
//! - [`addr`]: address alignment arithmetic
//! - [`FirmwareMap`](firmware::FirmwareMap): the raw memory map handed over by firmware
//! - [`NumaTopology`](numa::NumaTopology): NUMA nodes with their CPUs and memory ranges
//!
//! This crate is the foundation every other skal crate depends on.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod firmware;
pub mod numa;

pub use firmware::{FirmwareMap, FirmwareRegion, RegionKind};
pub use numa::{MemRange, NumaNode, NumaTopology};

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;
