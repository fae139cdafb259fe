//! 4 KiB-aligned page directory and page table frames.

use crate::entry::{PageDirectoryEntry, PageTableEntry};
use kernel_info::memory::ENTRIES_PER_TABLE;

/// The page directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PageDirectoryEntry; ENTRIES_PER_TABLE],
}

/// A page table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = {
    assert!(size_of::<PageDirectory>() == 4096);
    assert!(size_of::<PageTable>() == 4096);
};

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageDirectoryEntry::new(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageDirectoryEntry {
        self.entries[i]
    }

    /// Caller handles TLB maintenance for active spaces.
    #[inline]
    pub const fn set(&mut self, i: usize, e: PageDirectoryEntry) {
        self.entries[i] = e;
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, PageDirectoryEntry)> + '_ {
        self.entries.iter().copied().enumerate()
    }
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::new(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageTableEntry {
        self.entries[i]
    }

    #[inline]
    pub const fn set(&mut self, i: usize, e: PageTableEntry) {
        self.entries[i] = e;
    }

    /// No entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries.iter().copied().enumerate()
    }
}
