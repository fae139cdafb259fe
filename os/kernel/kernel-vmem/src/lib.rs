//! # Virtual Memory Support
//!
//! i386 two-level paging (no PAE) for the kernel and its address spaces.
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22     | 21‒12 | 11‒0   |
//! | directory | table | offset |
//! ```
//!
//! `CR3` holds the physical base of a 1024-entry page directory. A directory
//! entry either points at a 1024-entry page table or, with `PS=1`, maps a
//! 4 MiB page on its own. Page table entries always map 4 KiB.
//!
//! ## What you get
//! - [`PageDirectoryEntry`]/[`PageTableEntry`] bitfields and the
//!   4 KiB-aligned [`PageDirectory`]/[`PageTable`] frames.
//! - [`PagingSpace`], one page directory plus the operations that create,
//!   map, unmap, translate, load and destroy an address space.
//! - The [`recursive`] window: directory slot 1023 points back at the
//!   directory, exposing the active space's tables at a fixed address.
//! - Small capability traits the rest of the kernel implements:
//!   [`FrameAlloc`] (where table frames come from), [`PhysMapper`] (how a
//!   physical frame is reached) and [`PagingUnit`] (`CR3` and `invlpg`).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

pub mod config;
pub mod entry;
#[cfg(target_arch = "x86")]
mod hardware;
mod paging_space;
pub mod recursive;
mod table;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::config::{CachingMode, MappingConfig, PhysicalConstraints};
pub use crate::entry::{DirectoryEntryKind, PageDirectoryEntry, PageTableEntry};
#[cfg(target_arch = "x86")]
pub use crate::hardware::HardwarePagingUnit;
pub use crate::paging_space::PagingSpace;
pub use crate::recursive::RecursiveWindow;
pub use crate::table::{PageDirectory, PageTable};

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Hands out **physical** 4 KiB frames for page tables.
///
/// Takes `&self`: implementations are shared between cores and lock
/// internally.
pub trait FrameAlloc {
    /// Allocate one frame, or `None` on out-of-memory. Contents are undefined.
    fn alloc_frame(&self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_frame`](Self::alloc_frame).
    fn free_frame(&self, frame: PhysicalPage<Size4K>);
}

/// Converts physical addresses to usable references in the current address
/// space. The kernel goes through its direct map.
///
/// # Safety
/// - `pa` must be mapped writable for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` and must not be aliased.
pub trait PhysMapper {
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Borrow a directory frame.
    #[inline]
    fn directory_mut(&self, frame: PhysicalPage<Size4K>) -> &mut PageDirectory {
        unsafe { self.phys_to_mut::<PageDirectory>(frame.base()) }
    }

    /// Borrow a page table frame.
    #[inline]
    fn table_mut(&self, frame: PhysicalPage<Size4K>) -> &mut PageTable {
        unsafe { self.phys_to_mut::<PageTable>(frame.base()) }
    }

    /// Raw bytes of a frame.
    ///
    /// # Safety
    /// The frame must not be borrowed elsewhere for `'a`.
    #[inline]
    unsafe fn frame_bytes<'a>(&self, frame: PhysicalPage<Size4K>) -> &'a mut [u8; 4096] {
        unsafe { self.phys_to_mut::<[u8; 4096]>(frame.base()) }
    }

    #[inline]
    fn zero_frame(&self, frame: PhysicalPage<Size4K>) {
        unsafe { self.frame_bytes(frame) }.fill(0);
    }

    fn copy_frame(&self, from: PhysicalPage<Size4K>, to: PhysicalPage<Size4K>) {
        assert_ne!(from, to, "copy onto itself");
        let src = unsafe { self.frame_bytes(from) };
        let dst = unsafe { self.frame_bytes(to) };
        dst.copy_from_slice(src);
    }
}

/// The MMU of the running core.
pub trait PagingUnit {
    /// Directory currently loaded in `CR3`.
    fn active_directory(&self) -> PhysicalAddress;

    /// Switch to another directory.
    ///
    /// # Safety
    /// The directory must map the running code, the stack and all kernel data.
    unsafe fn load_directory(&self, directory: PhysicalAddress);

    /// Drop the TLB entry for `va` (`invlpg`).
    fn invalidate(&self, va: VirtualAddress);
}

/// Paging failures. The virtual memory manager treats every one of them as an
/// invariant violation; the variants exist so callers can report precisely.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PagingError {
    #[error("virtual address {0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("virtual address {0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("mapping of {size:#x} bytes at {virt} -> {phys} is not page aligned")]
    Unaligned {
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: u64,
    },
    #[error("no physical frame left for a page table")]
    OutOfMemory,
    #[error("virtual address {0} lies in a reserved paging window")]
    ReservedWindow(VirtualAddress),
}
