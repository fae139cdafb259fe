//! # Recursive window
//!
//! Directory slot 1023 points at the directory itself. The MMU then treats
//! the directory as a page table for the top 4 MiB, which exposes
//!
//! - page table `n` of the active space at `0xFFC0_0000 + n * 4096`, and
//! - the directory itself at `0xFFFF_F000`.
//!
//! Only the active space is reachable this way; inactive spaces are edited
//! through the direct map instead.

use crate::entry::{DirectoryEntryKind, PageDirectoryEntry, PageTableEntry};
use crate::info::{RECURSIVE_DIRECTORY, RECURSIVE_TABLES_BASE};
use kernel_memory_addresses::{PhysicalAddress, Size4K, Size4M, VirtualAddress};

/// Address at which page table `directory_index` of the active space appears.
#[must_use]
pub const fn table_address(directory_index: usize) -> VirtualAddress {
    VirtualAddress::new(RECURSIVE_TABLES_BASE + (directory_index as u32) * 4096)
}

/// Address of the active page directory.
#[must_use]
pub const fn directory_address() -> VirtualAddress {
    VirtualAddress::new(RECURSIVE_DIRECTORY)
}

/// Address of the page table entry that maps `va`.
#[must_use]
pub const fn table_entry_address(va: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(RECURSIVE_TABLES_BASE + (va.as_u32() >> 12) * 4)
}

/// Address of the directory entry covering `va`.
#[must_use]
pub const fn directory_entry_address(va: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(RECURSIVE_DIRECTORY + (va.directory_index() as u32) * 4)
}

/// Whether `va` lies inside the recursive window.
#[must_use]
pub const fn contains(va: VirtualAddress) -> bool {
    va.as_u32() >= RECURSIVE_TABLES_BASE
}

/// Loads from the recursive window of the running core.
pub trait RecursiveWindow {
    /// Read the 32-bit paging entry at `va`.
    ///
    /// # Safety
    /// `va` must lie inside the window, and paging must be enabled with a
    /// directory whose slot 1023 is recursive.
    unsafe fn read_entry(&self, va: VirtualAddress) -> u32;
}

/// Read the directory entry for `va` through the window.
///
/// # Safety
/// See [`RecursiveWindow::read_entry`].
#[must_use]
pub unsafe fn active_directory_entry<W: RecursiveWindow>(
    window: &W,
    va: VirtualAddress,
) -> PageDirectoryEntry {
    PageDirectoryEntry::from_bits(unsafe { window.read_entry(directory_entry_address(va)) })
}

/// Read the leaf entry for `va` through the window, or `None` if no page
/// table covers it (or a 4 MiB page does).
///
/// # Safety
/// See [`RecursiveWindow::read_entry`].
#[must_use]
pub unsafe fn active_table_entry<W: RecursiveWindow>(
    window: &W,
    va: VirtualAddress,
) -> Option<PageTableEntry> {
    let pde = unsafe { active_directory_entry(window, va) };
    pde.table_frame()?;
    Some(PageTableEntry::from_bits(unsafe {
        window.read_entry(table_entry_address(va))
    }))
}

/// Translate `va` in the active space without touching the direct map.
///
/// # Safety
/// See [`RecursiveWindow::read_entry`].
#[must_use]
pub unsafe fn active_translate<W: RecursiveWindow>(
    window: &W,
    va: VirtualAddress,
) -> Option<PhysicalAddress> {
    match unsafe { active_directory_entry(window, va) }.kind()? {
        DirectoryEntryKind::Large(page) => Some(page.join(va.offset::<Size4M>())),
        DirectoryEntryKind::Table(_) => unsafe { active_table_entry(window, va) }?
            .frame_page()
            .map(|frame| frame.join(va.offset::<Size4K>())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingUnit, TestFrames, TestPhys, WindowWalk};
    use crate::{MappingConfig, PagingSpace};

    #[test]
    fn window_addresses() {
        assert_eq!(table_address(0).as_u32(), 0xFFC0_0000);
        assert_eq!(table_address(768).as_u32(), 0xFFF0_0000);
        assert_eq!(table_address(1023), directory_address());
    }

    #[test]
    fn entry_addresses() {
        let va = VirtualAddress::new(0xE000_5123);
        assert_eq!(directory_entry_address(va).as_u32(), 0xFFFF_F000 + 896 * 4);
        assert_eq!(table_entry_address(va).as_u32(), 0xFFC0_0000 + (0xE000_5 * 4));

        // The entry of the entry lands in the directory.
        let pte = table_entry_address(va);
        assert_eq!(table_entry_address(pte).as_u32() & !0xFFF, 0xFFFF_F000);
    }

    #[test]
    fn active_space_reads_through_the_window() {
        let phys = TestPhys::with_frames(256);
        let frames = TestFrames::new(1, 256);
        let unit = RecordingUnit::default();
        let space = PagingSpace::create_kernel_space(&phys, &frames, 16 * 1024 * 1024).unwrap();
        unsafe { space.load(&unit) };

        let va = VirtualAddress::new(0x0040_3000);
        let pa = PhysicalAddress::new(0x0030_0000);
        space
            .map(&phys, &frames, &unit, pa, va, 0x1000, &MappingConfig::kernel_data())
            .unwrap();

        let window = WindowWalk::new(&phys, &unit);
        unsafe {
            assert_eq!(
                active_table_entry(&window, va).map(PageTableEntry::into_bits),
                space.entry(&phys, va).map(PageTableEntry::into_bits)
            );
            assert_eq!(active_translate(&window, va + 0x10), Some(pa + 0x10));
            assert_eq!(active_translate(&window, va + 0x1000), None);

            // Direct map: a 4 MiB entry, no table behind it.
            let direct = VirtualAddress::new(0xC012_3456);
            assert!(active_directory_entry(&window, direct).page_size());
            assert!(active_table_entry(&window, direct).is_none());
            assert_eq!(active_translate(&window, direct), Some(PhysicalAddress::new(0x0012_3456)));

            assert_eq!(active_translate(&window, VirtualAddress::new(0x0080_0000)), None);
        }
    }

    #[test]
    fn window_follows_the_loaded_space() {
        let phys = TestPhys::with_frames(256);
        let frames = TestFrames::new(1, 256);
        let unit = RecordingUnit::default();
        let kernel = PagingSpace::create_kernel_space(&phys, &frames, 0).unwrap();
        let user = PagingSpace::create_memory_space(&kernel, &phys, &frames).unwrap();

        let va = VirtualAddress::new(0x0100_0000);
        let pa = PhysicalAddress::new(0x0050_0000);
        user.map(&phys, &frames, &unit, pa, va, 0x1000, &MappingConfig::user_data())
            .unwrap();

        let window = WindowWalk::new(&phys, &unit);
        unsafe {
            kernel.load(&unit);
            assert_eq!(active_translate(&window, va), None);
            user.load(&unit);
            assert_eq!(active_translate(&window, va), Some(pa));
        }
    }

    #[test]
    fn window_bounds() {
        assert!(contains(VirtualAddress::new(0xFFC0_0000)));
        assert!(!contains(VirtualAddress::new(0xFFBF_FFFF)));
    }
}
