//! # Multiboot Entry
//!
//! The loader jumps to `_start` in 32-bit protected mode with paging off,
//! `EAX` holding the bootloader magic and `EBX` the physical address of the
//! [`MultibootInfo`](kernel_info::boot::MultibootInfo). `_start` lives in the `.boot` section, which is linked
//! at its load address, so it can run before paging exists.
//!
//! ```text
//! _start (physical) ──► enable PSE + paging with BOOT_PAGE_DIRECTORY
//!                   ──► higher_half_entry (0xC01x_xxxx) ──► kernel_entry
//! ```
//!
//! [`BOOT_PAGE_DIRECTORY`] maps the first [`BOOT_MAPPED`] bytes of physical
//! memory twice with 4 MiB pages: identity, for the instructions that enable
//! paging, and at `KERNEL_BASE`, where the rest of the kernel is linked.
//! Application processors reuse it on their way out of the trampoline.

use kernel_info::boot::{MULTIBOOT_HEADER_FLAGS, MULTIBOOT_HEADER_MAGIC};
use kernel_info::memory::{ENTRIES_PER_TABLE, KERNEL_DIRECTORY_START, LARGE_PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4M};
use kernel_vmem::PageDirectoryEntry;

#[repr(C, align(4))]
struct MultibootHeader {
    magic: u32,
    flags: u32,
    checksum: u32,
}

#[used]
#[unsafe(link_section = ".multiboot")]
static MULTIBOOT_HEADER: MultibootHeader = MultibootHeader {
    magic: MULTIBOOT_HEADER_MAGIC,
    flags: MULTIBOOT_HEADER_FLAGS,
    checksum: 0u32
        .wrapping_sub(MULTIBOOT_HEADER_MAGIC)
        .wrapping_sub(MULTIBOOT_HEADER_FLAGS),
};

/// 4 MiB pages mapped by the boot directory, identity and higher half.
const BOOT_LARGE_PAGES: usize = 8;

/// Bytes of low physical memory reachable right after boot. Covers the
/// kernel image including its heap.
pub const BOOT_MAPPED: u32 = BOOT_LARGE_PAGES as u32 * LARGE_PAGE_SIZE;

#[repr(C, align(4096))]
pub struct BootDirectory([PageDirectoryEntry; ENTRIES_PER_TABLE]);

#[allow(clippy::cast_possible_truncation)]
const fn boot_directory() -> BootDirectory {
    let mut entries = [PageDirectoryEntry::new(); ENTRIES_PER_TABLE];
    let mut i = 0;
    while i < BOOT_LARGE_PAGES {
        let page = PhysicalPage::<Size4M>::from_addr(PhysicalAddress::new(i as u32 * LARGE_PAGE_SIZE));
        let entry = PageDirectoryEntry::large(page, true, false);
        entries[i] = entry;
        entries[KERNEL_DIRECTORY_START + i] = entry;
        i += 1;
    }
    BootDirectory(entries)
}

/// Linked at its physical address; referenced before paging is enabled.
#[unsafe(link_section = ".boot.data")]
static BOOT_PAGE_DIRECTORY: BootDirectory = boot_directory();

/// Physical address of the boot page directory.
#[must_use]
pub fn boot_directory_phys() -> PhysicalAddress {
    PhysicalAddress::new(core::ptr::from_ref(&BOOT_PAGE_DIRECTORY) as u32)
}

#[cfg(target_arch = "x86")]
pub use entry::kernel_image;

#[cfg(target_arch = "x86")]
mod entry {
    use super::BOOT_PAGE_DIRECTORY;
    use core::arch::naked_asm;
    use kernel_info::boot::{KernelEntryFn, KernelImage, MultibootInfo};
    use kernel_info::memory::KERNEL_STACK_SIZE;
    use kernel_memory_addresses::PhysicalAddress;

    /// 16-byte aligned stack
    #[repr(align(16))]
    struct Aligned<const N: usize>([u8; N]);

    static mut BOOT_STACK: Aligned<KERNEL_STACK_SIZE> = Aligned([0; KERNEL_STACK_SIZE]);

    unsafe extern "C" {
        static __kernel_phys_start: u8;
        static __kernel_phys_end: u8;
    }

    /// Physical bounds of the loaded image, `.bss` and heap included.
    #[must_use]
    pub fn kernel_image() -> KernelImage {
        // Only the addresses of the linker symbols carry meaning.
        let (start, end) = unsafe {
            (
                (&raw const __kernel_phys_start) as u32,
                (&raw const __kernel_phys_end) as u32,
            )
        };
        KernelImage {
            start: PhysicalAddress::new(start),
            end: PhysicalAddress::new(end),
        }
    }

    /// The multiboot entry point.
    ///
    /// # Naked function & Stack
    /// Nothing is set up yet: no stack, no paging. The magic and info pointer are
    /// parked in `EDI`/`ESI` while paging is enabled, then handed to
    /// [`higher_half_entry`].
    #[unsafe(no_mangle)]
    #[unsafe(naked)]
    #[unsafe(link_section = ".boot.text")]
    pub unsafe extern "C" fn _start() -> ! {
        naked_asm!(
            "cli",
            "mov edi, eax",
            "mov esi, ebx",

            "mov ecx, offset {directory}",
            "mov cr3, ecx",
            "mov ecx, cr4",
            "or ecx, {pse}",
            "mov cr4, ecx",
            "mov ecx, cr0",
            "or ecx, {pg}",
            "mov cr0, ecx",

            // Absolute jump: from here on the higher half is live.
            "mov ecx, offset {higher_half}",
            "jmp ecx",
            directory = sym BOOT_PAGE_DIRECTORY,
            pse = const 1u32 << 4,
            pg = const 1u32 << 31,
            higher_half = sym higher_half_entry,
        );
    }

    /// Switches to the boot stack and calls [`kernel_entry`] as a C function.
    #[unsafe(naked)]
    unsafe extern "C" fn higher_half_entry() -> ! {
        naked_asm!(
            "lea esp, [{stack} + {stack_size}]",
            "xor ebp, ebp",
            "push esi",
            "push edi",
            "call {entry}",
            "ud2",
            stack = sym BOOT_STACK,
            stack_size = const KERNEL_STACK_SIZE,
            entry = sym kernel_entry,
        );
    }

    const _: KernelEntryFn = kernel_entry;

    extern "C" fn kernel_entry(magic: u32, info: *const MultibootInfo) -> ! {
        crate::kernel_main(magic, info)
    }
}
