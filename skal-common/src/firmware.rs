//! Firmware Memory Map
//!
//! The record list firmware hands over at boot. It may be unsorted, records
//! may overlap, and later records override earlier ones; the allocator's
//! init path is responsible for cleaning it into a canonical map.

use arrayvec::ArrayVec;

/// Maximum number of firmware records we accept.
pub const MAX_FIRMWARE_REGIONS: usize = 128;

/// Classification of a firmware memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Conventional RAM, available for kernel use.
    Usable,
    /// Firmware, MMIO, or otherwise untouchable memory.
    Reserved,
}

impl RegionKind {
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }
}

/// One record of the firmware memory map.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareRegion {
    /// Physical base address.
    pub base: usize,
    /// Length in bytes.
    pub length: usize,
    /// Usable or reserved.
    pub kind: RegionKind,
}

impl FirmwareRegion {
    #[must_use]
    pub const fn new(base: usize, length: usize, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    /// First address beyond this record.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.length
    }
}

/// The raw firmware memory map, in firmware order.
#[derive(Debug, Clone, Default)]
pub struct FirmwareMap {
    regions: ArrayVec<FirmwareRegion, MAX_FIRMWARE_REGIONS>,
}

impl FirmwareMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: ArrayVec::new(),
        }
    }

    /// Append a record. Records are kept in firmware order; overlap and
    /// ordering are resolved by the consumer.
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_FIRMWARE_REGIONS`] records are added.
    pub fn push(&mut self, region: FirmwareRegion) {
        self.regions.push(region);
    }

    /// True if firmware provided no memory map at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FirmwareRegion> {
        self.regions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_end() {
        let r = FirmwareRegion::new(0x1000, 0x2000, RegionKind::Usable);
        assert_eq!(r.end(), 0x3000);
        assert!(r.kind.is_usable());
    }

    #[test]
    fn test_map_preserves_firmware_order() {
        let mut map = FirmwareMap::new();
        map.push(FirmwareRegion::new(0x8000, 0x1000, RegionKind::Usable));
        map.push(FirmwareRegion::new(0x1000, 0x1000, RegionKind::Reserved));
        let bases: ArrayVec<usize, 8> = map.iter().map(|r| r.base).collect();
        assert_eq!(&bases[..], &[0x8000, 0x1000]);
    }
}
