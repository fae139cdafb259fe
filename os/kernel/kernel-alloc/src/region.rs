//! Virtual ranges and the records the memory manager keeps about them.

use core::cmp::Ordering;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::MappingConfig;

/// A contiguous virtual range `[address, address + size)`.
///
/// `size` is 64-bit so the whole 4 GiB space is expressible.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Region {
    pub address: u32,
    pub size: u64,
}

impl Region {
    #[must_use]
    pub const fn new(address: u32, size: u64) -> Self {
        Self { address, size }
    }

    /// Exclusive end.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.address as u64 + self.size
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        VirtualAddress::new(self.address)
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        (self.address as u64) < other.end() && (other.address as u64) < self.end()
    }

    #[must_use]
    pub const fn contains(&self, address: u32) -> bool {
        self.address <= address && (address as u64) < self.end()
    }
}

impl Ord for Region {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address
            .cmp(&other.address)
            .then(self.size.cmp(&other.size))
    }
}

impl PartialOrd for Region {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#010x}, {:#011x})", self.address, self.end())
    }
}

/// What the memory manager knows about one region of an address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub region: Region,
    /// Physical address backing `region.address`.
    pub physical: PhysicalAddress,
    /// Page table entries exist for the region.
    pub mapped: bool,
    /// The record describes a real region. `false` reports a failed
    /// placement request.
    pub present: bool,
    /// The memory manager owns the physical frames and frees them with the
    /// region. Borrowed ranges (MMIO, direct map) are not allocated.
    pub allocated: bool,
    pub config: MappingConfig,
}

impl MemoryRegion {
    /// The answer to a placement request that collided with an existing
    /// region.
    #[must_use]
    pub const fn not_present(region: Region, config: MappingConfig) -> Self {
        Self {
            region,
            physical: PhysicalAddress::zero(),
            mapped: false,
            present: false,
            allocated: false,
            config,
        }
    }

    #[must_use]
    pub const fn address(&self) -> VirtualAddress {
        self.region.start()
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.region.size
    }

    /// The region start as a pointer.
    #[must_use]
    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.address().as_mut_ptr()
    }

    /// Physical address of `va` inside this region.
    #[must_use]
    pub fn physical_of(&self, va: u32) -> Option<PhysicalAddress> {
        if !self.mapped || !self.region.contains(va) {
            return None;
        }
        Some(self.physical + (va - self.region.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_and_containment() {
        let a = Region::new(0x1000, 0x2000);
        assert!(a.contains(0x1000));
        assert!(a.contains(0x2FFF));
        assert!(!a.contains(0x3000));
        assert!(a.overlaps(&Region::new(0x2000, 0x1000)));
        assert!(!a.overlaps(&Region::new(0x3000, 0x1000)));
        assert!(!a.overlaps(&Region::new(0, 0x1000)));
    }

    #[test]
    fn full_space_region() {
        let all = Region::new(0, 1 << 32);
        assert_eq!(all.end(), 1 << 32);
        assert!(all.contains(u32::MAX));
    }

    #[test]
    fn physical_offset() {
        let r = MemoryRegion {
            region: Region::new(0xE000_0000, 0x2000),
            physical: PhysicalAddress::new(0x40_0000),
            mapped: true,
            present: true,
            allocated: true,
            config: MappingConfig::kernel_data(),
        };
        assert_eq!(r.physical_of(0xE000_1010), Some(PhysicalAddress::new(0x40_1010)));
        assert_eq!(r.physical_of(0xE000_2000), None);
    }
}
