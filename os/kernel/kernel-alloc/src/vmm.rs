//! # Virtual Memory Manager
//!
//! The single authority for where things live in virtual memory. It keeps one
//! [`RegionTree`](crate::region_tree::RegionTree) for the kernel (shared,
//! behind a spinlock) and one per user [`MemorySpace`], draws frames from the
//! [`PhysicalMemoryManager`] and edits page tables through
//! [`PagingSpace`].
//!
//! ## Windows
//!
//! | Target  | Search range | Fixed placement range | Walk bound |
//! |---------|--------------|-----------------------|------------|
//! | Kernel  | `[0xE000_0000, 0xFFC0_0000)` | `[0xC000_0000, 0xFFC0_0000)` | `2^32` |
//! | User    | `[0x0040_0000, 0xC000_0000)` | same | `0xC000_0000` |
//!
//! The kernel tree starts with records for the direct map and the recursive
//! window so neither is ever handed out.
//!
//! ## Failure policy
//!
//! Exhaustion and invariant violations panic with the formatted
//! [`VmmError`]. Fixed placements that collide return a record with
//! `present == false` instead.

use crate::memory_space::MemorySpace;
use crate::pmm::{PhysicalMemoryManager, PmmError};
use crate::region::{MemoryRegion, Region};
use crate::region_tree::Span;
use alloc::vec::Vec;
use kernel_info::memory::{
    DIRECT_MAP_BASE, DIRECT_MAP_SIZE, KERNEL_BOUNDARY, KERNEL_REGIONS_START, PAGE_SIZE,
    RECURSIVE_TABLES_BASE, USERSPACE_START,
};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress, align_down, align_up};
use kernel_sync::{CriticalGuard, SpinLock};
use kernel_vmem::{MappingConfig, PagingError, PagingSpace, PagingUnit, PhysMapper};

const PAGE: u64 = PAGE_SIZE as u64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error(transparent)]
    Paging(#[from] PagingError),
    #[error(transparent)]
    Physical(#[from] PmmError),
    #[error("no free virtual range of {size:#x} bytes")]
    AddressSpaceExhausted { size: u64 },
    #[error("zero-sized region")]
    ZeroSize,
    #[error("address {0:#010x} is not page aligned")]
    Unaligned(u32),
    #[error("no region contains {0:#010x}")]
    UnknownRegion(u32),
    #[error("region {0:?} was never placed")]
    NotPresent(Region),
}

/// Which address space an operation works on.
pub enum AllocationTarget<'s> {
    /// The shared kernel half.
    Kernel,
    /// The user half of one space, owned by the caller.
    User(&'s mut MemorySpace),
}

/// Snapshot of the kernel tree and, optionally, one user space.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct VmmStats {
    pub kernel_regions: usize,
    /// Bytes mapped in the kernel regions window (direct map excluded).
    pub kernel_mapped: u64,
    /// Bytes backed by frames the manager owns.
    pub kernel_allocated: u64,
    /// Zero unless a user space was passed to
    /// [`stats`](VirtualMemoryManager::stats).
    pub user_regions: usize,
    pub user_mapped: u64,
    pub user_allocated: u64,
}

struct Window {
    search_lower: u32,
    fixed_lower: u32,
    upper: u64,
    bound: u64,
}

const KERNEL_WINDOW: Window = Window {
    search_lower: KERNEL_REGIONS_START,
    fixed_lower: KERNEL_BOUNDARY,
    upper: RECURSIVE_TABLES_BASE as u64,
    bound: 1 << 32,
};

const USER_WINDOW: Window = Window {
    search_lower: USERSPACE_START,
    fixed_lower: USERSPACE_START,
    upper: KERNEL_BOUNDARY as u64,
    bound: KERNEL_BOUNDARY as u64,
};

#[derive(Copy, Clone)]
enum Backing {
    /// Fresh zeroed frames from the physical memory manager.
    Allocate,
    /// Somebody else's memory, e.g. device registers.
    Borrow(PhysicalAddress),
}

pub struct VirtualMemoryManager<'p, M, U> {
    pmm: &'p PhysicalMemoryManager,
    mapper: M,
    unit: U,
    kernel: SpinLock<MemorySpace>,
}

impl<'p, M, U> VirtualMemoryManager<'p, M, U>
where
    M: PhysMapper,
    U: PagingUnit,
{
    /// Build the kernel space and its tree. The space is not loaded; see
    /// [`load_kernel_space`](Self::load_kernel_space).
    ///
    /// # Errors
    /// [`VmmError::Paging`] if the kernel page tables cannot be allocated.
    pub fn new(pmm: &'p PhysicalMemoryManager, mapper: M, unit: U) -> Result<Self, VmmError> {
        let paging = PagingSpace::create_kernel_space(&mapper, pmm, DIRECT_MAP_SIZE)?;
        let mut kernel = MemorySpace::new(paging);

        let fixed = [
            MemoryRegion {
                region: Region::new(DIRECT_MAP_BASE, u64::from(DIRECT_MAP_SIZE)),
                physical: PhysicalAddress::zero(),
                mapped: true,
                present: true,
                allocated: false,
                config: MappingConfig::kernel_data(),
            },
            MemoryRegion {
                region: Region::new(RECURSIVE_TABLES_BASE, (1 << 32) - u64::from(RECURSIVE_TABLES_BASE)),
                physical: PhysicalAddress::zero(),
                mapped: true,
                present: true,
                allocated: false,
                config: MappingConfig::kernel_data(),
            },
        ];
        for record in fixed {
            if let Err(existing) = kernel.regions.insert(record) {
                panic!("kernel layout overlaps itself at {:?}", existing.region);
            }
        }

        log::info!("vmm: kernel directory at {}", kernel.directory());
        Ok(Self {
            pmm,
            mapper,
            unit,
            kernel: SpinLock::new(kernel),
        })
    }

    #[must_use]
    pub const fn pmm(&self) -> &'p PhysicalMemoryManager {
        self.pmm
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn unit(&self) -> &U {
        &self.unit
    }

    /// Physical address of the kernel page directory.
    #[must_use]
    pub fn kernel_directory(&self) -> PhysicalAddress {
        self.kernel.lock().directory()
    }

    fn with_target<R>(
        &self,
        target: AllocationTarget<'_>,
        f: impl FnOnce(&mut MemorySpace, &Window) -> R,
    ) -> R {
        match target {
            AllocationTarget::Kernel => {
                let mut kernel = self.kernel.lock();
                f(&mut kernel, &KERNEL_WINDOW)
            }
            AllocationTarget::User(space) => f(space, &USER_WINDOW),
        }
    }

    /// Allocate and map `size` bytes anywhere in the target.
    ///
    /// # Panics
    /// If physical or virtual memory is exhausted.
    pub fn allocate_region(
        &self,
        target: AllocationTarget<'_>,
        size: u64,
        config: MappingConfig,
    ) -> MemoryRegion {
        self.with_target(target, |space, window| {
            self.place(space, window, None, size, Backing::Allocate, config)
        })
        .unwrap_or_else(|err| fatal("allocate_region", err))
    }

    /// Allocate and map `size` bytes at `address`.
    ///
    /// Returns a record with `present == false` if the range is taken or lies
    /// outside the target's window.
    ///
    /// # Panics
    /// If `address` is unaligned or physical memory is exhausted.
    pub fn allocate_region_at(
        &self,
        target: AllocationTarget<'_>,
        address: u32,
        size: u64,
        config: MappingConfig,
    ) -> MemoryRegion {
        self.with_target(target, |space, window| {
            self.place(space, window, Some(address), size, Backing::Allocate, config)
        })
        .unwrap_or_else(|err| fatal("allocate_region_at", err))
    }

    /// Map the physical range `[physical, physical + size)` anywhere in the
    /// target. The frames stay owned by the caller.
    ///
    /// # Panics
    /// If `physical` is unaligned or the address space is exhausted.
    pub fn map_region(
        &self,
        target: AllocationTarget<'_>,
        physical: PhysicalAddress,
        size: u64,
        config: MappingConfig,
    ) -> MemoryRegion {
        self.with_target(target, |space, window| {
            self.place(space, window, None, size, Backing::Borrow(physical), config)
        })
        .unwrap_or_else(|err| fatal("map_region", err))
    }

    /// Map the physical range at `address`; `present == false` on collision.
    ///
    /// # Panics
    /// If either address is unaligned.
    pub fn map_region_at(
        &self,
        target: AllocationTarget<'_>,
        physical: PhysicalAddress,
        address: u32,
        size: u64,
        config: MappingConfig,
    ) -> MemoryRegion {
        self.with_target(target, |space, window| {
            self.place(
                space,
                window,
                Some(address),
                size,
                Backing::Borrow(physical),
                config,
            )
        })
        .unwrap_or_else(|err| fatal("map_region_at", err))
    }

    /// Map device memory into the kernel. `physical` need not be aligned; the
    /// returned region starts at the corresponding offset.
    ///
    /// # Panics
    /// If the kernel window is exhausted.
    pub fn map_physical(
        &self,
        physical: PhysicalAddress,
        size: u64,
        config: MappingConfig,
    ) -> MemoryRegion {
        let offset = physical.as_u64() % PAGE;
        let base = PhysicalAddress::new(align_down(physical.as_u64(), PAGE) as u32);
        let span = align_up(offset + size.max(1), PAGE);
        let mut record = self.map_region(AllocationTarget::Kernel, base, span, config);
        record.region = Region::new(record.region.address + offset as u32, size);
        record.physical = physical;
        record
    }

    /// Map a device structure of type `T` at `physical` into the kernel.
    ///
    /// # Panics
    /// If the kernel window is exhausted.
    #[must_use]
    pub fn map_typed<T>(&self, physical: PhysicalAddress) -> *mut T {
        self.map_physical(physical, size_of::<T>() as u64, MappingConfig::mmio())
            .as_mut_ptr()
    }

    /// Unmap and forget the region containing `address`; its frames are
    /// released if the manager allocated them.
    ///
    /// # Panics
    /// If no region contains `address`.
    pub fn free_address(&self, target: AllocationTarget<'_>, address: u32) {
        self.with_target(target, |space, _| self.release(space, address))
            .unwrap_or_else(|err| fatal("free", err));
    }

    /// Free a region returned by one of the placement calls.
    ///
    /// # Panics
    /// If the region was never placed (`present == false`) or is unknown.
    pub fn free(&self, target: AllocationTarget<'_>, region: &MemoryRegion) {
        if !region.present {
            fatal("free", VmmError::NotPresent(region.region));
        }
        self.free_address(target, region.region.address);
    }

    /// The region containing `address`.
    pub fn find_region(&self, target: AllocationTarget<'_>, address: u32) -> Option<MemoryRegion> {
        self.with_target(target, |space, _| space.find_region(address))
    }

    /// Start of the first hole of `size` bytes in the target's search window.
    ///
    /// # Panics
    /// If there is none.
    pub fn find_free_region(&self, target: AllocationTarget<'_>, size: u64) -> u32 {
        self.with_target(target, |space, window| {
            let size = align_up(size.max(1), PAGE);
            space
                .regions
                .find_free(size, window.search_lower, window.upper)
                .ok_or(VmmError::AddressSpaceExhausted { size })
        })
        .unwrap_or_else(|err| fatal("find_free_region", err))
    }

    /// Tile the target with its regions and the holes between them.
    pub fn traverse_all(&self, target: AllocationTarget<'_>) -> Vec<Span> {
        self.with_target(target, |space, window| space.regions.traverse_all(window.bound))
    }

    /// Translate `va` in the target; both table levels must be present.
    ///
    /// # Panics
    /// If `va` is not mapped.
    pub fn as_physical(&self, target: AllocationTarget<'_>, va: VirtualAddress) -> PhysicalAddress {
        self.with_target(target, |space, _| space.paging.as_physical(&self.mapper, va))
    }

    /// A new space with an empty user half.
    ///
    /// # Panics
    /// If no frame is left for the page directory.
    pub fn create_memory_space(&self) -> MemorySpace {
        let kernel = self.kernel.lock();
        let paging = PagingSpace::create_memory_space(&kernel.paging, &self.mapper, self.pmm)
            .unwrap_or_else(|err| fatal("create_memory_space", err.into()));
        log::debug!("vmm: new memory space at {}", paging.directory());
        MemorySpace::new(paging)
    }

    /// Free every region of `space`, keeping the directory.
    pub fn free_userspace(&self, space: &mut MemorySpace) {
        let addresses: Vec<u32> = space.regions.iter().map(|r| r.region.address).collect();
        for address in addresses {
            if let Err(err) = self.release(space, address) {
                fatal("free_userspace", err);
            }
        }
    }

    /// Free every region of `space` and tear down its page tables.
    ///
    /// # Panics
    /// If `space` is loaded on the calling core.
    pub fn destroy_memory_space(&self, mut space: MemorySpace) {
        assert!(
            !space.paging.is_active(&self.unit),
            "destroying the active memory space"
        );
        self.free_userspace(&mut space);
        let MemorySpace { paging, .. } = space;
        log::debug!("vmm: destroy memory space at {}", paging.directory());
        paging.destroy(&self.mapper, self.pmm);
    }

    /// An eager copy of `source`: allocated regions get fresh frames with the
    /// same contents, borrowed regions map the same physical range again.
    ///
    /// # Panics
    /// If physical memory is exhausted.
    pub fn copy_memory_space(&self, source: &MemorySpace) -> MemorySpace {
        let mut copy = self.create_memory_space();
        for record in source.regions.iter() {
            let backing = if record.allocated || !record.mapped {
                Backing::Allocate
            } else {
                Backing::Borrow(record.physical)
            };
            let placed = self
                .place(
                    &mut copy,
                    &USER_WINDOW,
                    Some(record.region.address),
                    record.region.size,
                    backing,
                    record.config,
                )
                .unwrap_or_else(|err| fatal("copy_memory_space", err));
            assert!(placed.present, "copy collided at {:?}", record.region);

            if record.allocated {
                let frames = (record.region.size / PAGE) as u32;
                for i in 0..frames {
                    let from = (record.physical + i * PAGE_SIZE).page::<Size4K>();
                    let to = (placed.physical + i * PAGE_SIZE).page::<Size4K>();
                    self.mapper.copy_frame(from, to);
                }
            }
        }
        log::debug!(
            "vmm: copied {} regions into {}",
            copy.regions.len(),
            copy.directory()
        );
        copy
    }

    /// Make `space` the active address space of the calling core.
    pub fn load_memory_space(&self, space: &MemorySpace) {
        let _critical = CriticalGuard::new();
        // Every space shares the kernel half, so code, stacks and kernel data
        // stay mapped across the switch.
        unsafe { space.paging.load(&self.unit) }
    }

    /// Make the kernel space the active address space of the calling core.
    pub fn load_kernel_space(&self) {
        let _critical = CriticalGuard::new();
        let kernel = self.kernel.lock();
        unsafe { kernel.paging.load(&self.unit) }
    }

    /// Counters of the kernel space, plus those of `user` if given.
    #[must_use]
    pub fn stats(&self, user: Option<&MemorySpace>) -> VmmStats {
        let kernel = self.kernel.lock();
        let window = |r: &&MemoryRegion| r.region.address >= KERNEL_REGIONS_START
            && r.region.end() <= u64::from(RECURSIVE_TABLES_BASE);
        let stats = VmmStats {
            kernel_regions: kernel.regions.len(),
            kernel_mapped: kernel
                .regions
                .iter()
                .filter(window)
                .filter(|r| r.mapped)
                .map(MemoryRegion::size)
                .sum(),
            kernel_allocated: kernel.allocated_bytes(),
            ..VmmStats::default()
        };
        match user {
            Some(space) => VmmStats {
                user_regions: space.regions.len(),
                user_mapped: space.mapped_bytes(),
                user_allocated: space.allocated_bytes(),
                ..stats
            },
            None => stats,
        }
    }

    fn place(
        &self,
        space: &mut MemorySpace,
        window: &Window,
        address: Option<u32>,
        size: u64,
        backing: Backing,
        config: MappingConfig,
    ) -> Result<MemoryRegion, VmmError> {
        if size == 0 {
            return Err(VmmError::ZeroSize);
        }
        let size = align_up(size, PAGE);

        let address = match address {
            Some(address) => {
                if !VirtualAddress::new(address).is_aligned::<Size4K>() {
                    return Err(VmmError::Unaligned(address));
                }
                let region = Region::new(address, size);
                let inside = address >= window.fixed_lower && region.end() <= window.upper;
                if !inside || space.regions.find_overlapping(&region).is_some() {
                    log::debug!("vmm: placement at {region:?} rejected");
                    return Ok(MemoryRegion::not_present(region, config));
                }
                address
            }
            None => space
                .regions
                .find_free(size, window.search_lower, window.upper)
                .ok_or(VmmError::AddressSpaceExhausted { size })?,
        };

        let guard = !config.readable;
        let (physical, allocated) = match backing {
            Backing::Borrow(physical) => {
                if !physical.is_aligned::<Size4K>() {
                    return Err(VmmError::Unaligned(physical.as_u32()));
                }
                (physical, false)
            }
            Backing::Allocate if guard => (PhysicalAddress::zero(), false),
            Backing::Allocate => {
                let physical = self.pmm.try_alloc(size, &config.constraints)?;
                for i in 0..(size / PAGE) as u32 {
                    self.mapper.zero_frame((physical + i * PAGE_SIZE).page());
                }
                (physical, true)
            }
        };

        let record = MemoryRegion {
            region: Region::new(address, size),
            physical,
            mapped: !guard,
            present: true,
            allocated,
            config,
        };

        if record.mapped
            && let Err(err) = space.paging.map(
                &self.mapper,
                self.pmm,
                &self.unit,
                physical,
                VirtualAddress::new(address),
                size,
                &config,
            )
        {
            if allocated {
                self.pmm.free(physical, size);
            }
            return Err(err.into());
        }

        if let Err(existing) = space.regions.insert(record) {
            panic!(
                "region tree out of sync: {:?} overlaps {:?}",
                record.region, existing.region
            );
        }
        log::debug!(
            "vmm: {:?} -> {} ({})",
            record.region,
            record.physical,
            if allocated { "allocated" } else { "borrowed" }
        );
        Ok(record)
    }

    fn release(&self, space: &mut MemorySpace, address: u32) -> Result<(), VmmError> {
        let record = space
            .find_region(address)
            .ok_or(VmmError::UnknownRegion(address))?;
        // Only the kernel tree holds records at these addresses.
        assert!(
            record.region.address != DIRECT_MAP_BASE
                && record.region.address != RECURSIVE_TABLES_BASE,
            "freeing fixed kernel layout at {:?}",
            record.region
        );

        if record.mapped {
            space.paging.unmap(
                &self.mapper,
                self.pmm,
                &self.unit,
                record.address(),
                record.size(),
            )?;
        }
        space.regions.remove(record.region.address);
        if record.allocated {
            self.pmm.free(record.physical, record.size());
        }
        log::debug!("vmm: released {:?}", record.region);
        Ok(())
    }
}

fn fatal(operation: &str, err: VmmError) -> ! {
    log::error!("vmm: {operation}: {err}");
    panic!("{operation}: {err}");
}
