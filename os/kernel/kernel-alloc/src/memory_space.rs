//! An address space: its page directory plus the tree of regions in it.

use crate::region::MemoryRegion;
use crate::region_tree::RegionTree;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PagingSpace;

/// Owns one [`PagingSpace`] and the [`RegionTree`] describing it.
///
/// Created and destroyed through the
/// [`VirtualMemoryManager`](crate::vmm::VirtualMemoryManager); the user half
/// of a space is only ever touched through `&mut MemorySpace`.
pub struct MemorySpace {
    pub(crate) paging: PagingSpace,
    pub(crate) regions: RegionTree,
}

impl MemorySpace {
    pub(crate) const fn new(paging: PagingSpace) -> Self {
        Self {
            paging,
            regions: RegionTree::new(),
        }
    }

    /// Physical address of the page directory.
    #[must_use]
    pub const fn directory(&self) -> PhysicalAddress {
        self.paging.directory()
    }

    #[must_use]
    pub const fn regions(&self) -> &RegionTree {
        &self.regions
    }

    /// The region containing `address`, if any.
    #[must_use]
    pub fn find_region(&self, address: u32) -> Option<MemoryRegion> {
        self.regions.find_containing(address).copied()
    }

    /// Bytes covered by mapped regions.
    #[must_use]
    pub fn mapped_bytes(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.mapped)
            .map(MemoryRegion::size)
            .sum()
    }

    /// Bytes backed by frames the memory manager owns.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.allocated)
            .map(MemoryRegion::size)
            .sum()
    }
}

impl core::fmt::Debug for MemorySpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemorySpace")
            .field("directory", &self.directory())
            .field("regions", &self.regions.len())
            .finish()
    }
}
