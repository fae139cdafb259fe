//! # Memory Layout

/// Base page granularity.
pub const PAGE_SIZE: u32 = 4096;

/// Size of a directory-level (PSE) page.
pub const LARGE_PAGE_SIZE: u32 = 4 * 1024 * 1024;

/// Number of entries in a page directory or a page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Lowest address handed out to userspace; the first 4 MiB stay unmapped
/// so null dereferences fault.
pub const USERSPACE_START: u32 = 0x0040_0000;

/// First kernel-space address. Everything below belongs to the address
/// space of the running process.
pub const KERNEL_BOUNDARY: u32 = 0xC000_0000;

/// Where the kernel executes (VMA), matches the linker script.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const KERNEL_BASE: u32 = KERNEL_BOUNDARY;

/// Where the loader places the kernel image in *physical* memory (LMA).
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const PHYS_LOAD: u32 = 0x0010_0000; // 1 MiB

/// Physical memory is visible at [`DIRECT_MAP_BASE`] + `pa` for
/// `pa < DIRECT_MAP_SIZE`.
pub const DIRECT_MAP_BASE: u32 = KERNEL_BASE;

/// Amount of physical memory covered by the direct map. Frames above this
/// limit are not handed out by the physical memory manager.
pub const DIRECT_MAP_SIZE: u32 = 512 * 1024 * 1024;

/// Start of the window in which the virtual memory manager places kernel
/// regions. Page tables for this window are shared by every address space.
pub const KERNEL_REGIONS_START: u32 = DIRECT_MAP_BASE + DIRECT_MAP_SIZE;

/// Virtual base of the recursive page table window (directory slot 1023).
pub const RECURSIVE_TABLES_BASE: u32 = 0xFFC0_0000;

/// The page directory itself, as seen through the recursive slot.
pub const RECURSIVE_DIRECTORY: u32 = 0xFFFF_F000;

/// Page directory slot that points back at the directory.
pub const RECURSIVE_SLOT: usize = 1023;

/// First page directory slot of kernel space.
pub const KERNEL_DIRECTORY_START: usize = (KERNEL_BOUNDARY >> 22) as usize;

/// First page directory slot of the kernel regions window.
pub const KERNEL_REGIONS_DIRECTORY_START: usize = (KERNEL_REGIONS_START >> 22) as usize;

/// Size of every thread's kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Size of the stack mapped for userspace threads.
pub const USER_STACK_SIZE: u32 = 64 * 1024;

/// Physical (and identity-mapped virtual) address of the AP start-up
/// trampoline. Must be below 1 MiB and 4 KiB aligned (SIPI vector `0x08`).
pub const SMP_TRAMPOLINE: u32 = 0x8000;

/// Converts a direct-mapped kernel virtual address to its physical address.
#[inline]
#[must_use]
pub const fn direct_map_to_physical(va: u32) -> Option<u32> {
    if va >= DIRECT_MAP_BASE && va < KERNEL_REGIONS_START {
        Some(va - DIRECT_MAP_BASE)
    } else {
        None
    }
}

/// Converts a physical address below [`DIRECT_MAP_SIZE`] to its direct-map
/// virtual address.
#[inline]
#[must_use]
pub const fn physical_to_direct_map(pa: u32) -> Option<u32> {
    if pa < DIRECT_MAP_SIZE {
        Some(pa + DIRECT_MAP_BASE)
    } else {
        None
    }
}

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE as usize));
    assert!(USER_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_BASE.is_multiple_of(LARGE_PAGE_SIZE));
    assert!(DIRECT_MAP_SIZE.is_multiple_of(LARGE_PAGE_SIZE));
    assert!(KERNEL_REGIONS_START < RECURSIVE_TABLES_BASE);
    assert!(RECURSIVE_TABLES_BASE == (RECURSIVE_SLOT as u32) << 22);
    assert!(RECURSIVE_DIRECTORY == RECURSIVE_TABLES_BASE + ((RECURSIVE_SLOT as u32) << 12));
    assert!(SMP_TRAMPOLINE < PHYS_LOAD && SMP_TRAMPOLINE.is_multiple_of(PAGE_SIZE));
    assert!(USERSPACE_START < KERNEL_BOUNDARY);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_map_round_trip() {
        assert_eq!(physical_to_direct_map(PHYS_LOAD), Some(0xC010_0000));
        assert_eq!(direct_map_to_physical(0xC010_0000), Some(PHYS_LOAD));
        assert_eq!(physical_to_direct_map(DIRECT_MAP_SIZE), None);
        assert_eq!(direct_map_to_physical(KERNEL_REGIONS_START), None);
        assert_eq!(direct_map_to_physical(0x1000), None);
    }

    #[test]
    fn directory_slots() {
        assert_eq!(KERNEL_DIRECTORY_START, 768);
        assert_eq!(KERNEL_REGIONS_DIRECTORY_START, 896);
    }
}
