//! # Kernel Boot Information
//!
//! The loader hands over a multiboot (v1) information structure. The kernel
//! only consumes it once, to seed the physical memory manager, so this module
//! decodes the raw bytes into plain values instead of keeping pointers into
//! loader memory around.

use kernel_memory_addresses::PhysicalAddress;

/// Value the loader leaves in `EAX` when it entered the kernel.
pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// Magic value of the kernel's multiboot header.
pub const MULTIBOOT_HEADER_MAGIC: u32 = 0x1BAD_B002;

/// Header flags: page-align modules and request memory information.
pub const MULTIBOOT_HEADER_FLAGS: u32 = 0b11;

/// Kernel function pointer of the portable entry, called after the assembly
/// prologue enabled paging.
pub type KernelEntryFn = extern "C" fn(magic: u32, info: *const MultibootInfo) -> !;

/// The fixed prefix of the multiboot information structure.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MultibootInfo {
    pub flags: u32,
    /// KiB of memory below 1 MiB (valid if bit 0 is set).
    pub mem_lower: u32,
    /// KiB of memory above 1 MiB (valid if bit 0 is set).
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    /// Length of the memory map buffer in **bytes** (valid if bit 6 is set).
    pub mmap_length: u32,
    /// Physical address of the memory map buffer (valid if bit 6 is set).
    pub mmap_addr: u32,
}

impl MultibootInfo {
    const FLAG_MEMORY: u32 = 1 << 0;
    const FLAG_MMAP: u32 = 1 << 6;

    #[must_use]
    pub const fn has_memory_map(&self) -> bool {
        self.flags & Self::FLAG_MMAP != 0
    }

    /// Upper memory bound derived from `mem_upper`, used when no memory map
    /// was provided.
    #[must_use]
    pub const fn upper_memory(&self) -> Option<MemoryMapEntry> {
        if self.flags & Self::FLAG_MEMORY == 0 {
            return None;
        }
        Some(MemoryMapEntry {
            base: 0x10_0000,
            length: self.mem_upper as u64 * 1024,
            kind: MemoryKind::Available,
        })
    }
}

/// Type tag of a firmware memory map entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    Available,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    Defective,
}

impl From<u32> for MemoryKind {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Available,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Defective,
            _ => Self::Reserved,
        }
    }
}

/// A single decoded memory map entry. Bases and lengths are 64-bit since
/// firmware reports memory above 4 GiB even on 32-bit machines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind, MemoryKind::Available)
    }

    /// Clips the entry to `[0, limit)`, returning `None` if nothing remains.
    #[must_use]
    pub const fn clamp(&self, limit: u64) -> Option<Self> {
        if self.base >= limit || self.length == 0 {
            return None;
        }
        let end = if self.end() > limit { limit } else { self.end() };
        Some(Self {
            base: self.base,
            length: end - self.base,
            kind: self.kind,
        })
    }
}

/// Iterator over the raw multiboot memory map buffer.
///
/// Every record starts with a `u32` size that does *not* include itself,
/// followed by `base: u64`, `length: u64` and `type: u32`.
#[derive(Clone)]
pub struct MemoryMapIter<'a> {
    bytes: &'a [u8],
}

impl<'a> MemoryMapIter<'a> {
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let lo = read_u32(bytes, at)?;
    let hi = read_u32(bytes, at + 4)?;
    Some(u64::from(lo) | (u64::from(hi) << 32))
}

impl Iterator for MemoryMapIter<'_> {
    type Item = MemoryMapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let size = read_u32(self.bytes, 0)? as usize;
        // size counts base, length and type; anything shorter is corrupt.
        if size < 20 {
            self.bytes = &[];
            return None;
        }
        let entry = MemoryMapEntry {
            base: read_u64(self.bytes, 4)?,
            length: read_u64(self.bytes, 12)?,
            kind: MemoryKind::from(read_u32(self.bytes, 20)?),
        };
        self.bytes = self.bytes.get(size + 4..).unwrap_or(&[]);
        Some(entry)
    }
}

/// Physical bounds of the loaded kernel image, from linker symbols.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KernelImage {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

impl KernelImage {
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.end.as_u32() - self.start.as_u32()
    }
}
