//! # Paging space
//!
//! One page directory and the operations that shape it. The directory frame
//! is owned exclusively by its [`PagingSpace`]; tables of the user half are
//! owned as well, tables of the kernel half are shared by every space.
//!
//! ## Layout
//!
//! - Slots `768..896` map the first 512 MiB of physical memory with 4 MiB
//!   pages (the direct map, which also covers the kernel image).
//! - Slots `896..1023` point at page tables created once together with the
//!   kernel space. Copying these entries into a new directory is enough for
//!   every later kernel mapping to show up in all spaces.
//! - Slot `1023` points back at the directory itself.
//!
//! ## Errors
//!
//! Every mutating operation validates the whole range first, and `map`
//! allocates all missing page tables before it writes a single entry. A
//! failing `map` or `unmap` leaves the tables as they were.

use crate::entry::{DirectoryEntryKind, PageDirectoryEntry, PageTableEntry};
use crate::info::{
    DIRECT_MAP_BASE, KERNEL_DIRECTORY_START, KERNEL_REGIONS_DIRECTORY_START, LARGE_PAGE_SIZE,
    PAGE_SIZE, RECURSIVE_SLOT, RECURSIVE_TABLES_BASE,
};
use crate::{FrameAlloc, MappingConfig, PagingError, PagingUnit, PhysMapper, recursive};
use core::ops::RangeInclusive;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress};

/// A single address space rooted at a page directory.
#[derive(Debug, PartialEq, Eq)]
pub struct PagingSpace {
    directory: PhysicalPage<Size4K>,
}

/// One bit per directory slot.
#[derive(Default)]
struct SlotSet([u32; 32]);

impl SlotSet {
    const fn insert(&mut self, slot: usize) {
        self.0[slot / 32] |= 1 << (slot % 32);
    }

    const fn contains(&self, slot: usize) -> bool {
        self.0[slot / 32] & (1 << (slot % 32)) != 0
    }
}

enum Lookup {
    NoTable,
    Large(PhysicalPage<Size4M>),
    Entry(PhysicalPage<Size4K>, PageTableEntry),
}

impl PagingSpace {
    /// Adopt an existing directory, e.g. the one the boot code built.
    #[must_use]
    pub const fn from_directory(directory: PhysicalPage<Size4K>) -> Self {
        Self { directory }
    }

    /// Physical address of the page directory, as loaded into `CR3`.
    #[must_use]
    pub const fn directory(&self) -> PhysicalAddress {
        self.directory.base()
    }

    /// Build the kernel's directory: direct map, shared kernel tables and the
    /// recursive slot.
    ///
    /// `direct_map_size` is rounded up to whole 4 MiB pages and capped at the
    /// direct map window.
    ///
    /// # Errors
    /// [`PagingError::OutOfMemory`] if the frame allocator runs dry; all
    /// frames taken so far are returned.
    #[allow(clippy::cast_possible_truncation)]
    pub fn create_kernel_space<M, A>(
        mapper: &M,
        alloc: &A,
        direct_map_size: u32,
    ) -> Result<Self, PagingError>
    where
        M: PhysMapper,
        A: FrameAlloc,
    {
        let frame = alloc.alloc_frame().ok_or(PagingError::OutOfMemory)?;
        mapper.zero_frame(frame);
        let space = Self { directory: frame };
        let dir = mapper.directory_mut(frame);

        let direct_slots = KERNEL_REGIONS_DIRECTORY_START - KERNEL_DIRECTORY_START;
        let large_pages = (direct_map_size.div_ceil(LARGE_PAGE_SIZE) as usize).min(direct_slots);
        for i in 0..large_pages {
            let pa = PhysicalAddress::new((i as u32) << 22);
            dir.set(
                KERNEL_DIRECTORY_START + i,
                PageDirectoryEntry::large(pa.page(), true, true),
            );
        }

        for slot in KERNEL_REGIONS_DIRECTORY_START..RECURSIVE_SLOT {
            let Some(table) = alloc.alloc_frame() else {
                for taken in KERNEL_REGIONS_DIRECTORY_START..slot {
                    if let Some(table) = dir.get(taken).table_frame() {
                        alloc.free_frame(table);
                    }
                }
                alloc.free_frame(frame);
                return Err(PagingError::OutOfMemory);
            };
            mapper.zero_frame(table);
            dir.set(slot, PageDirectoryEntry::table(table, false));
        }

        dir.set(RECURSIVE_SLOT, PageDirectoryEntry::table(frame, false));
        log::debug!(
            "kernel paging space at {}: {large_pages} direct map pages from {:#010x}",
            space.directory(),
            DIRECT_MAP_BASE
        );
        Ok(space)
    }

    /// A fresh space sharing the kernel half of `kernel` and with an empty
    /// user half.
    ///
    /// # Errors
    /// [`PagingError::OutOfMemory`] if no frame is left for the directory.
    pub fn create_memory_space<M, A>(
        kernel: &Self,
        mapper: &M,
        alloc: &A,
    ) -> Result<Self, PagingError>
    where
        M: PhysMapper,
        A: FrameAlloc,
    {
        let frame = alloc.alloc_frame().ok_or(PagingError::OutOfMemory)?;
        mapper.zero_frame(frame);
        let src = mapper.directory_mut(kernel.directory);
        let dst = mapper.directory_mut(frame);
        for slot in KERNEL_DIRECTORY_START..RECURSIVE_SLOT {
            dst.set(slot, src.get(slot));
        }
        dst.set(RECURSIVE_SLOT, PageDirectoryEntry::table(frame, false));
        Ok(Self { directory: frame })
    }

    /// Whether this space is the one loaded on the calling core.
    pub fn is_active<U: PagingUnit>(&self, unit: &U) -> bool {
        unit.active_directory() == self.directory()
    }

    /// Kernel-half tables are shared by every space, so changes there are
    /// flushed from the local TLB whichever space is loaded.
    fn needs_flush<U: PagingUnit>(&self, unit: &U, virt: VirtualAddress) -> bool {
        virt.directory_index() >= KERNEL_DIRECTORY_START || self.is_active(unit)
    }

    /// Load this space into `CR3`.
    ///
    /// # Safety
    /// See [`PagingUnit::load_directory`].
    pub unsafe fn load<U: PagingUnit>(&self, unit: &U) {
        unsafe { unit.load_directory(self.directory()) }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn page_count(virt: VirtualAddress, size: u64) -> Result<u32, PagingError> {
        let end = virt.as_u64() + size;
        if end > u64::from(RECURSIVE_TABLES_BASE) {
            return Err(PagingError::ReservedWindow(virt));
        }
        Ok((size / u64::from(PAGE_SIZE)) as u32)
    }

    fn check_alignment(
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: u64,
    ) -> Result<(), PagingError> {
        let aligned = virt.is_aligned::<Size4K>()
            && phys.is_aligned::<Size4K>()
            && size != 0
            && size.is_multiple_of(u64::from(PAGE_SIZE))
            && phys.as_u64() + size <= 1 << 32;
        if aligned {
            Ok(())
        } else {
            Err(PagingError::Unaligned { virt, phys, size })
        }
    }

    fn lookup<M: PhysMapper>(&self, mapper: &M, va: VirtualAddress) -> Lookup {
        let pde = mapper.directory_mut(self.directory).get(va.directory_index());
        match pde.kind() {
            None => Lookup::NoTable,
            Some(DirectoryEntryKind::Large(page)) => Lookup::Large(page),
            Some(DirectoryEntryKind::Table(table)) => {
                Lookup::Entry(table, mapper.table_mut(table).get(va.table_index()))
            }
        }
    }

    /// Give every slot in `slots` a page table. Tables installed here are
    /// taken out again if a later slot fails, so on error the directory is
    /// as it was.
    #[allow(clippy::cast_possible_truncation)]
    fn reserve_tables<M, A, U>(
        &self,
        mapper: &M,
        alloc: &A,
        unit: &U,
        slots: RangeInclusive<usize>,
    ) -> Result<(), PagingError>
    where
        M: PhysMapper,
        A: FrameAlloc,
        U: PagingUnit,
    {
        let dir = mapper.directory_mut(self.directory);
        let mut installed = SlotSet::default();
        for slot in slots.clone() {
            let pde = dir.get(slot);
            if pde.table_frame().is_some() {
                continue;
            }
            let table = if pde.is_unused() {
                alloc.alloc_frame().ok_or(PagingError::OutOfMemory)
            } else {
                Err(PagingError::AlreadyMapped(VirtualAddress::new((slot as u32) << 22)))
            };
            let table = match table {
                Ok(table) => table,
                Err(err) => {
                    self.release_installed(mapper, alloc, unit, slots, &installed);
                    return Err(err);
                }
            };
            mapper.zero_frame(table);
            dir.set(slot, PageDirectoryEntry::table(table, slot < KERNEL_DIRECTORY_START));
            installed.insert(slot);
        }
        Ok(())
    }

    fn release_installed<M, A, U>(
        &self,
        mapper: &M,
        alloc: &A,
        unit: &U,
        slots: RangeInclusive<usize>,
        installed: &SlotSet,
    ) where
        M: PhysMapper,
        A: FrameAlloc,
        U: PagingUnit,
    {
        let dir = mapper.directory_mut(self.directory);
        let active = self.is_active(unit);
        for slot in slots.filter(|&slot| installed.contains(slot)) {
            if let Some(table) = dir.get(slot).table_frame() {
                dir.set(slot, PageDirectoryEntry::new());
                alloc.free_frame(table);
                if active {
                    unit.invalidate(recursive::table_address(slot));
                }
            }
        }
    }

    /// Map `size` bytes at `virt` to `phys`.
    ///
    /// # Errors
    /// - [`PagingError::Unaligned`] for unaligned or empty ranges.
    /// - [`PagingError::ReservedWindow`] if the range reaches the recursive window.
    /// - [`PagingError::AlreadyMapped`] if any page is already mapped, including
    ///   pages covered by the direct map.
    /// - [`PagingError::OutOfMemory`] if a page table cannot be allocated.
    #[allow(clippy::too_many_arguments)]
    pub fn map<M, A, U>(
        &self,
        mapper: &M,
        alloc: &A,
        unit: &U,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        size: u64,
        config: &MappingConfig,
    ) -> Result<(), PagingError>
    where
        M: PhysMapper,
        A: FrameAlloc,
        U: PagingUnit,
    {
        Self::check_alignment(virt, phys, size)?;
        let pages = Self::page_count(virt, size)?;

        for i in 0..pages {
            let va = virt + i * PAGE_SIZE;
            match self.lookup(mapper, va) {
                Lookup::NoTable => {}
                Lookup::Large(_) => return Err(PagingError::AlreadyMapped(va)),
                Lookup::Entry(_, pte) if pte.present() => {
                    return Err(PagingError::AlreadyMapped(va));
                }
                Lookup::Entry(..) => {}
            }
        }

        let last = virt + (pages - 1) * PAGE_SIZE;
        self.reserve_tables(mapper, alloc, unit, virt.directory_index()..=last.directory_index())?;

        let flush = self.needs_flush(unit, virt);
        for i in 0..pages {
            let va = virt + i * PAGE_SIZE;
            if let Lookup::Entry(table, _) = self.lookup(mapper, va) {
                let pa = phys + i * PAGE_SIZE;
                mapper
                    .table_mut(table)
                    .set(va.table_index(), PageTableEntry::leaf(pa.page(), config));
            }
            if flush {
                unit.invalidate(va);
            }
        }
        Ok(())
    }

    /// Remove the mapping of `size` bytes at `virt`. Page tables of the user
    /// half that become empty are returned to `alloc`.
    ///
    /// # Errors
    /// - [`PagingError::Unaligned`] for unaligned or empty ranges.
    /// - [`PagingError::NotMapped`] if any page in the range is not mapped.
    pub fn unmap<M, A, U>(
        &self,
        mapper: &M,
        alloc: &A,
        unit: &U,
        virt: VirtualAddress,
        size: u64,
    ) -> Result<(), PagingError>
    where
        M: PhysMapper,
        A: FrameAlloc,
        U: PagingUnit,
    {
        Self::check_alignment(virt, PhysicalAddress::zero(), size)?;
        let pages = Self::page_count(virt, size)?;

        for i in 0..pages {
            let va = virt + i * PAGE_SIZE;
            match self.lookup(mapper, va) {
                Lookup::Entry(_, pte) if pte.present() => {}
                _ => return Err(PagingError::NotMapped(va)),
            }
        }

        let flush = self.needs_flush(unit, virt);
        let active = self.is_active(unit);
        for i in 0..pages {
            let va = virt + i * PAGE_SIZE;
            if let Lookup::Entry(table, _) = self.lookup(mapper, va) {
                mapper
                    .table_mut(table)
                    .set(va.table_index(), PageTableEntry::new());
            }
            if flush {
                unit.invalidate(va);
            }
        }

        let first = virt.directory_index();
        let last = (virt + (pages - 1) * PAGE_SIZE).directory_index();
        let dir = mapper.directory_mut(self.directory);
        for slot in (first..=last).take_while(|&slot| slot < KERNEL_DIRECTORY_START) {
            let Some(table) = dir.get(slot).table_frame() else {
                continue;
            };
            if mapper.table_mut(table).is_empty() {
                dir.set(slot, PageDirectoryEntry::new());
                alloc.free_frame(table);
                if active {
                    unit.invalidate(recursive::table_address(slot));
                }
            }
        }
        Ok(())
    }

    /// Translate `va`, or `None` if it is not mapped.
    pub fn translate<M: PhysMapper>(&self, mapper: &M, va: VirtualAddress) -> Option<PhysicalAddress> {
        match self.lookup(mapper, va) {
            Lookup::NoTable => None,
            Lookup::Large(page) => Some(page.join(va.offset::<Size4M>())),
            Lookup::Entry(_, pte) => pte.frame_page().map(|f| f.join(va.offset::<Size4K>())),
        }
    }

    /// Translate `va`; both levels must be present.
    ///
    /// # Panics
    /// If `va` is not mapped.
    pub fn as_physical<M: PhysMapper>(&self, mapper: &M, va: VirtualAddress) -> PhysicalAddress {
        match self.lookup(mapper, va) {
            Lookup::NoTable => panic!("as_physical({va}): no page table"),
            Lookup::Large(page) => page.join(va.offset::<Size4M>()),
            Lookup::Entry(_, pte) => match pte.frame_page() {
                Some(frame) => frame.join(va.offset::<Size4K>()),
                None => panic!("as_physical({va}): page not present"),
            },
        }
    }

    /// The leaf entry for `va`, if a page table covers it.
    pub fn entry<M: PhysMapper>(&self, mapper: &M, va: VirtualAddress) -> Option<PageTableEntry> {
        match self.lookup(mapper, va) {
            Lookup::Entry(_, pte) => Some(pte),
            Lookup::NoTable | Lookup::Large(_) => None,
        }
    }

    /// Number of page tables owned by the user half.
    pub fn user_table_count<M: PhysMapper>(&self, mapper: &M) -> usize {
        let dir = mapper.directory_mut(self.directory);
        (0..KERNEL_DIRECTORY_START)
            .filter(|&slot| dir.get(slot).table_frame().is_some())
            .count()
    }

    fn release_tables<M, A>(&self, mapper: &M, alloc: &A, slots: core::ops::Range<usize>)
    where
        M: PhysMapper,
        A: FrameAlloc,
    {
        let dir = mapper.directory_mut(self.directory);
        for slot in slots {
            if let Some(table) = dir.get(slot).table_frame() {
                dir.set(slot, PageDirectoryEntry::new());
                alloc.free_frame(table);
            }
        }
    }

    /// Free the user-half page tables and the directory. Leaf frames are not
    /// touched; they belong to whoever mapped them.
    ///
    /// The space must not be loaded on any core.
    pub fn destroy<M, A>(self, mapper: &M, alloc: &A)
    where
        M: PhysMapper,
        A: FrameAlloc,
    {
        self.release_tables(mapper, alloc, 0..KERNEL_DIRECTORY_START);
        alloc.free_frame(self.directory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{KERNEL_REGIONS_START, RECURSIVE_DIRECTORY};
    use crate::testing::{RecordingUnit, TestFrames, TestPhys};

    const FRAMES: usize = 256;

    fn setup() -> (TestPhys, TestFrames, RecordingUnit) {
        (
            TestPhys::with_frames(FRAMES),
            TestFrames::new(1, FRAMES),
            RecordingUnit::default(),
        )
    }

    fn kernel(phys: &TestPhys, frames: &TestFrames) -> PagingSpace {
        PagingSpace::create_kernel_space(phys, frames, 16 * 1024 * 1024).unwrap()
    }

    #[test]
    fn kernel_space_layout() {
        let (phys, frames, _) = setup();
        let space = kernel(&phys, &frames);
        let dir = phys.directory_mut(space.directory);

        // 16 MiB direct map = 4 large pages.
        assert_eq!(
            dir.get(KERNEL_DIRECTORY_START).kind(),
            Some(DirectoryEntryKind::Large(PhysicalAddress::zero().page()))
        );
        assert!(dir.get(KERNEL_DIRECTORY_START + 3).page_size());
        assert!(dir.get(KERNEL_DIRECTORY_START + 4).is_unused());

        // Shared tables and recursive slot.
        for slot in KERNEL_REGIONS_DIRECTORY_START..RECURSIVE_SLOT {
            assert!(dir.get(slot).table_frame().is_some());
        }
        assert_eq!(dir.get(RECURSIVE_SLOT).table_frame(), Some(space.directory));
        assert_eq!(frames.allocated(), 1 + (RECURSIVE_SLOT - KERNEL_REGIONS_DIRECTORY_START));
    }

    #[test]
    fn direct_map_translates() {
        let (phys, frames, _) = setup();
        let space = kernel(&phys, &frames);
        assert_eq!(
            space.translate(&phys, VirtualAddress::new(0xC012_3456)),
            Some(PhysicalAddress::new(0x0012_3456))
        );
        assert_eq!(space.translate(&phys, VirtualAddress::new(0x1000)), None);
    }

    #[test]
    fn kernel_mapping_is_visible_in_user_spaces() {
        let (phys, frames, unit) = setup();
        let kernel = kernel(&phys, &frames);
        let user = PagingSpace::create_memory_space(&kernel, &phys, &frames).unwrap();

        let va = VirtualAddress::new(KERNEL_REGIONS_START + 0x5000);
        let pa = PhysicalAddress::new(0x40_0000);
        kernel
            .map(&phys, &frames, &unit, pa, va, 0x1000, &MappingConfig::kernel_data())
            .unwrap();

        assert_eq!(user.translate(&phys, va), Some(pa));
        let own = phys.directory_mut(user.directory).get(RECURSIVE_SLOT);
        assert_eq!(own.table_frame(), Some(user.directory));
    }

    #[test]
    fn map_and_unmap_user_range() {
        let (phys, frames, unit) = setup();
        let kernel = kernel(&phys, &frames);
        let user = PagingSpace::create_memory_space(&kernel, &phys, &frames).unwrap();
        let before = frames.allocated();

        // Straddles a directory boundary: needs two tables.
        let va = VirtualAddress::new(0x007F_E000);
        let pa = PhysicalAddress::new(0x0020_0000);
        user.map(&phys, &frames, &unit, pa, va, 0x4000, &MappingConfig::user_data())
            .unwrap();
        assert_eq!(frames.allocated(), before + 2);
        assert_eq!(user.user_table_count(&phys), 2);

        let pte = user.entry(&phys, va + 0x3000).unwrap();
        assert!(pte.present() && pte.user() && pte.writable());
        assert_eq!(user.as_physical(&phys, va + 0x3010), pa + 0x3010);

        user.unmap(&phys, &frames, &unit, va, 0x4000).unwrap();
        assert_eq!(user.translate(&phys, va), None);
        assert_eq!(user.user_table_count(&phys), 0);
        assert_eq!(frames.allocated(), before);
    }

    #[test]
    fn map_without_enough_tables_leaves_space_untouched() {
        let phys = TestPhys::with_frames(FRAMES);
        // Kernel directory and shared tables, one user directory, one spare.
        let frames = TestFrames::new(1, 4 + (RECURSIVE_SLOT - KERNEL_REGIONS_DIRECTORY_START));
        let unit = RecordingUnit::default();
        let kernel = kernel(&phys, &frames);
        let user = PagingSpace::create_memory_space(&kernel, &phys, &frames).unwrap();
        let before = frames.allocated();

        // Needs two tables, only one frame is left.
        let va = VirtualAddress::new(0x007F_E000);
        let pa = PhysicalAddress::new(0x0020_0000);
        let cfg = MappingConfig::user_data();
        let err = user.map(&phys, &frames, &unit, pa, va, 0x4000, &cfg).unwrap_err();
        assert_eq!(err, PagingError::OutOfMemory);
        assert_eq!(user.translate(&phys, va), None);
        assert_eq!(user.translate(&phys, va + 0x1000), None);
        assert_eq!(user.user_table_count(&phys), 0);
        assert_eq!(frames.allocated(), before);

        // The spare frame still serves a mapping inside one table.
        user.map(&phys, &frames, &unit, pa, va, 0x2000, &cfg).unwrap();
        assert_eq!(user.translate(&phys, va + 0x1000), Some(pa + 0x1000));
        assert_eq!(frames.allocated(), before + 1);
    }

    #[test]
    fn double_map_is_rejected_without_side_effects() {
        let (phys, frames, unit) = setup();
        let space = kernel(&phys, &frames);
        let cfg = MappingConfig::kernel_data();
        let va = VirtualAddress::new(0x0040_0000);

        space
            .map(&phys, &frames, &unit, PhysicalAddress::new(0x10_0000), va + 0x1000, 0x1000, &cfg)
            .unwrap();
        let err = space
            .map(&phys, &frames, &unit, PhysicalAddress::new(0x20_0000), va, 0x3000, &cfg)
            .unwrap_err();
        assert_eq!(err, PagingError::AlreadyMapped(va + 0x1000));
        assert_eq!(space.translate(&phys, va), None);
        assert_eq!(
            space.translate(&phys, va + 0x1000),
            Some(PhysicalAddress::new(0x10_0000))
        );
    }

    #[test]
    fn direct_map_and_recursive_window_are_reserved() {
        let (phys, frames, unit) = setup();
        let space = kernel(&phys, &frames);
        let cfg = MappingConfig::kernel_data();

        let err = space
            .map(&phys, &frames, &unit, PhysicalAddress::zero(), VirtualAddress::new(0xC000_0000), 0x1000, &cfg)
            .unwrap_err();
        assert!(matches!(err, PagingError::AlreadyMapped(_)));

        let err = space
            .map(&phys, &frames, &unit, PhysicalAddress::zero(), VirtualAddress::new(RECURSIVE_DIRECTORY), 0x1000, &cfg)
            .unwrap_err();
        assert!(matches!(err, PagingError::ReservedWindow(_)));
    }

    #[test]
    fn unaligned_requests_fail() {
        let (phys, frames, unit) = setup();
        let space = kernel(&phys, &frames);
        let cfg = MappingConfig::kernel_data();
        let err = space
            .map(&phys, &frames, &unit, PhysicalAddress::new(0x1001), VirtualAddress::new(0x40_0000), 0x1000, &cfg)
            .unwrap_err();
        assert!(matches!(err, PagingError::Unaligned { .. }));
        assert!(matches!(
            space.unmap(&phys, &frames, &unit, VirtualAddress::new(0x40_0000), 0),
            Err(PagingError::Unaligned { .. })
        ));
    }

    #[test]
    fn unmap_of_unmapped_page_fails() {
        let (phys, frames, unit) = setup();
        let space = kernel(&phys, &frames);
        let va = VirtualAddress::new(0x0040_0000);
        assert_eq!(
            space.unmap(&phys, &frames, &unit, va, 0x1000),
            Err(PagingError::NotMapped(va))
        );
    }

    #[test]
    fn active_space_invalidates_tlb() {
        let (phys, frames, unit) = setup();
        let space = kernel(&phys, &frames);
        unsafe { space.load(&unit) };
        assert!(space.is_active(&unit));

        let va = VirtualAddress::new(0x0040_0000);
        let cfg = MappingConfig::kernel_data();
        space
            .map(&phys, &frames, &unit, PhysicalAddress::new(0x30_0000), va, 0x2000, &cfg)
            .unwrap();
        assert_eq!(unit.invalidated(), vec![va, va + 0x1000]);

        space.unmap(&phys, &frames, &unit, va, 0x2000).unwrap();
        let inv = unit.invalidated();
        assert!(inv.contains(&recursive::table_address(va.directory_index())));
    }

    #[test]
    #[should_panic(expected = "no page table")]
    fn as_physical_panics_when_unmapped() {
        let (phys, frames, _) = setup();
        let space = kernel(&phys, &frames);
        let _ = space.as_physical(&phys, VirtualAddress::new(0x1234));
    }

    #[test]
    fn destroy_returns_user_tables_and_directory() {
        let (phys, frames, unit) = setup();
        let kernel = kernel(&phys, &frames);
        let before = frames.allocated();
        let user = PagingSpace::create_memory_space(&kernel, &phys, &frames).unwrap();
        user.map(
            &phys,
            &frames,
            &unit,
            PhysicalAddress::new(0x50_0000),
            VirtualAddress::new(0x1000_0000),
            0x1000,
            &MappingConfig::user_data(),
        )
        .unwrap();
        user.destroy(&phys, &frames);
        assert_eq!(frames.allocated(), before);
    }

    #[test]
    fn out_of_frames_is_reported() {
        let phys = TestPhys::with_frames(8);
        let frames = TestFrames::new(1, 8);
        assert_eq!(
            PagingSpace::create_kernel_space(&phys, &frames, 0),
            Err(PagingError::OutOfMemory)
        );
        assert_eq!(frames.allocated(), 0);
    }
}
