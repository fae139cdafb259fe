//! # i386 paging entries (non-PAE)
//!
//! Both levels use 32-bit entries. The low twelve bits carry flags, the upper
//! twenty bits a 4 KiB frame number. A directory entry with `PS=1` maps a
//! 4 MiB page directly; its base then lives in bits 31..22.
//!
//! | Bits   | Name  | Meaning |
//! |--------|-------|---------|
//! | 0      | `P`   | Present |
//! | 1      | `RW`  | Writable |
//! | 2      | `US`  | User accessible |
//! | 3      | `PWT` | Write-through |
//! | 4      | `PCD` | Cache disable |
//! | 5      | `A`   | Accessed |
//! | 6      | `D`   | Dirty (leaf only) |
//! | 7      | `PS` / `PAT` | 4 MiB page in a PDE, PAT in a PTE |
//! | 8      | `G`   | Global (leaf only, needs `CR4.PGE`) |
//! | 9–11   | avail | Free for the OS |
//! | 12–31  | frame | Physical frame number |

use crate::config::{CachingMode, MappingConfig};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, Size4M};

/// Page directory entry.
///
/// A raw value of `0` means "no page table yet"; [`PageDirectoryEntry::is_unused`]
/// is the check the mapping code relies on.
#[doc(alias = "PDE")]
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageDirectoryEntry {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1). For a table pointer this gates the whole 4 MiB.
    pub writable: bool,
    /// User (bit 2).
    pub user: bool,
    /// Write-Through (bit 3).
    pub write_through: bool,
    /// Cache Disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5).
    pub accessed: bool,
    /// Dirty (bit 6), only meaningful with `PS=1`.
    pub dirty: bool,
    /// Page Size (bit 7): the entry maps a 4 MiB page.
    pub page_size: bool,
    /// Global (bit 8), only meaningful with `PS=1`.
    pub global: bool,
    /// Bits 9–11, available to the OS.
    #[bits(3)]
    pub available: u8,
    /// Bits 12–31: page table frame number (`PS=0`).
    #[bits(20)]
    frame: u32,
}

/// Decoded view of a present directory entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DirectoryEntryKind {
    /// Points at a page table.
    Table(PhysicalPage<Size4K>),
    /// Maps a 4 MiB page.
    Large(PhysicalPage<Size4M>),
}

impl PageDirectoryEntry {
    /// Whether no table was ever installed here.
    #[inline]
    #[must_use]
    pub const fn is_unused(self) -> bool {
        self.into_bits() == 0
    }

    /// Non-leaf entry pointing at `table`.
    ///
    /// Table pointers are always writable; the leaf entries decide. The user
    /// bit is set for the user half so ring 3 can reach its own leaves.
    #[must_use]
    pub const fn table(table: PhysicalPage<Size4K>, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame(table.number())
    }

    /// Leaf entry mapping a 4 MiB page.
    #[must_use]
    pub const fn large(page: PhysicalPage<Size4M>, writable: bool, global: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(writable)
            .with_page_size(true)
            .with_global(global)
            .with_frame(page.base().as_u32() >> 12)
    }

    #[must_use]
    pub const fn kind(self) -> Option<DirectoryEntryKind> {
        if !self.present() {
            return None;
        }
        let base = PhysicalAddress::new(self.frame() << 12);
        if self.page_size() {
            Some(DirectoryEntryKind::Large(base.page::<Size4M>()))
        } else {
            Some(DirectoryEntryKind::Table(base.page::<Size4K>()))
        }
    }

    /// The page table frame of a present, non-large entry.
    #[must_use]
    pub const fn table_frame(self) -> Option<PhysicalPage<Size4K>> {
        match self.kind() {
            Some(DirectoryEntryKind::Table(frame)) => Some(frame),
            _ => None,
        }
    }
}

/// Page table entry; always a 4 KiB leaf.
#[doc(alias = "PTE")]
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User (bit 2).
    pub user: bool,
    /// Write-Through (bit 3).
    pub write_through: bool,
    /// Cache Disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5).
    pub accessed: bool,
    /// Dirty (bit 6).
    pub dirty: bool,
    /// PAT (bit 7).
    pub pat: bool,
    /// Global (bit 8).
    pub global: bool,
    /// Bits 9–11, available to the OS.
    #[bits(3)]
    pub available: u8,
    /// Bits 12–31: frame number.
    #[bits(20)]
    frame: u32,
}

impl PageTableEntry {
    /// Leaf entry for `frame` honoring the permissions and cache policy of
    /// `config`. Kernel mappings are global so they survive `CR3` reloads.
    #[must_use]
    pub const fn leaf(frame: PhysicalPage<Size4K>, config: &MappingConfig) -> Self {
        let (write_through, cache_disable) = match (config.cacheable, config.caching_mode) {
            (false, _) | (true, CachingMode::Uncacheable) => (false, true),
            (true, CachingMode::WriteThrough) => (true, false),
            (true, CachingMode::WriteBack) => (false, false),
        };
        Self::new()
            .with_present(true)
            .with_writable(config.writeable)
            .with_user(config.userspace)
            .with_write_through(write_through)
            .with_cache_disable(cache_disable)
            .with_global(!config.userspace)
            .with_frame(frame.number())
    }

    #[must_use]
    pub const fn frame_page(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() {
            Some(PhysicalAddress::new(self.frame() << 12).page::<Size4K>())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page4k(addr: u32) -> PhysicalPage<Size4K> {
        PhysicalAddress::new(addr).page()
    }

    #[test]
    fn zero_is_unused_sentinel() {
        assert!(PageDirectoryEntry::new().is_unused());
        assert!(!PageDirectoryEntry::table(page4k(0x1000), false).is_unused());
        assert_eq!(PageDirectoryEntry::new().kind(), None);
    }

    #[test]
    fn table_entry_encoding() {
        let e = PageDirectoryEntry::table(page4k(0x0012_3000), true);
        assert_eq!(e.into_bits(), 0x0012_3007);
        assert_eq!(e.table_frame(), Some(page4k(0x0012_3000)));
    }

    #[test]
    fn large_entry_encoding() {
        let page = PhysicalAddress::new(0x0080_0000).page::<Size4M>();
        let e = PageDirectoryEntry::large(page, true, true);
        assert_eq!(e.into_bits(), 0x0080_0183);
        assert_eq!(e.kind(), Some(DirectoryEntryKind::Large(page)));
        assert_eq!(e.table_frame(), None);
    }

    #[test]
    fn leaf_honors_config() {
        let user = MappingConfig::user_data();
        let e = PageTableEntry::leaf(page4k(0x5000), &user);
        assert!(e.present() && e.writable() && e.user());
        assert!(!e.global());
        assert_eq!(e.frame_page(), Some(page4k(0x5000)));

        let mmio = MappingConfig::mmio();
        let e = PageTableEntry::leaf(page4k(0xFEE0_0000), &mmio);
        assert!(e.cache_disable());
        assert!(e.global());
        assert!(!e.user());

        let ro = MappingConfig::kernel_data().with_writeable(false);
        assert!(!PageTableEntry::leaf(page4k(0x1000), &ro).writable());
    }
}
