//! # Direct-map `PhysMapper`
//!
//! The kernel half maps physical memory `[0, DIRECT_MAP_SIZE)` linearly at
//! `DIRECT_MAP_BASE`. Every frame the physical memory manager hands out lies
//! in that range, so page tables and fresh frames are always reachable from
//! any address space without temporary mappings.

use kernel_info::memory::physical_to_direct_map;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] through the kernel direct map.
///
/// # Safety
/// - The direct map must be loaded, which holds for every space the kernel
///   creates.
/// - Only physical memory below `DIRECT_MAP_SIZE` is reachable.
#[derive(Debug, Default, Copy, Clone)]
pub struct DirectMapper;

impl PhysMapper for DirectMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let Some(va) = physical_to_direct_map(pa.as_u32()) else {
            panic!("{pa} lies outside the direct map");
        };
        unsafe { &mut *(va as usize as *mut T) }
    }
}
