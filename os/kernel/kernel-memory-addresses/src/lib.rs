//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for 32-bit memory addresses and page bases used by
//! the i386 paging and memory management code.
//!
//! ## Overview
//!
//! The types prevent mixing virtual and physical addresses at compile time
//! while remaining zero-cost wrappers around `u32` values.
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory or MMIO regions. |
//!
//! ## Page Sizes
//!
//! Two-level i386 paging without PAE knows two page sizes:
//!
//! - [`Size4K`] — 4 KiB pages mapped by a page table entry
//! - [`Size4M`] — 4 MiB pages mapped directly by a page directory entry (PSE)
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC010_1234);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32() & (Size4K::SIZE - 1), 0);
//! assert_eq!(page.join(off).as_u32(), va.as_u32());
//!
//! assert_eq!(va.directory_index(), 0x300);
//! assert_eq!(va.table_index(), 0x101);
//! ```
//!
//! ## Design Notes
//!
//! * Offsets are always computed by masking with `S::SIZE - 1`.
//! * Arithmetic on addresses wraps like the hardware does; checked variants
//!   exist where callers need to detect the end of the address space.
//! * Pointer conversions are only available when pointers are 32 bits wide.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_address::MemoryAddress;
pub use memory_address_offset::MemoryAddressOffset;
pub use memory_page::MemoryPage;
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Rounds `value` up to the next multiple of `align` (a power of two).
///
/// Saturates instead of wrapping so callers never see a size shrink.
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => v & !(align - 1),
        None => u64::MAX & !(align - 1),
    }
}

/// Rounds `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let a = MemoryAddress::new(0x1234_5678);
        let (p, o) = a.split::<Size4K>();
        assert_eq!(p.base().as_u32() & 0xFFF, 0);
        assert_eq!(o.as_u32(), 0x678);
        assert_eq!(p.join(o).as_u32(), a.as_u32());
    }

    #[test]
    fn split_and_join_4m() {
        let a = MemoryAddress::new(0xC0A1_2345);
        let (p, o) = a.split::<Size4M>();
        assert_eq!(p.base().as_u32(), 0xC080_0000);
        assert_eq!(o.as_u32(), 0x0021_2345);
        assert_eq!(p.join(o).as_u32(), a.as_u32());
    }

    #[test]
    fn virtual_vs_physical_wrappers() {
        let va = VirtualAddress::new(0xC000_1234);
        let (vp, vo) = va.split::<Size4K>();
        assert_eq!(vp.base().as_u32(), 0xC000_1000);
        assert_eq!(vo.as_u32(), 0x234);

        let pa = PhysicalAddress::new(0x0020_0042);
        let (pp, po) = pa.split::<Size4K>();
        assert_eq!(pp.base().as_u32(), 0x0020_0000);
        assert_eq!(pp.join(po), pa);
    }

    #[test]
    fn directory_and_table_indices() {
        let va = VirtualAddress::new(0xFFFF_F000);
        assert_eq!(va.directory_index(), 1023);
        assert_eq!(va.table_index(), 1023);

        let va = VirtualAddress::new(0x0040_3000);
        assert_eq!(va.directory_index(), 1);
        assert_eq!(va.table_index(), 3);
        assert_eq!(
            VirtualAddress::from_indices(1, 3, 0),
            VirtualAddress::new(0x0040_3000)
        );
    }

    #[test]
    fn checked_add_detects_end_of_space() {
        let va = VirtualAddress::new(0xFFFF_F000);
        assert_eq!(va.checked_add(0xFFF), Some(VirtualAddress::new(0xFFFF_FFFF)));
        assert_eq!(va.checked_add(0x1000), None);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0x500, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0, 0x1000), 0);
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(align_up(u64::MAX, 0x1000), u64::MAX & !0xFFF);
    }

    #[test]
    fn page_try_from_requires_alignment() {
        assert!(VirtualPage::<Size4K>::try_from(VirtualAddress::new(0x1000)).is_ok());
        assert!(VirtualPage::<Size4K>::try_from(VirtualAddress::new(0x1001)).is_err());
        assert!(PhysicalPage::<Size4M>::try_from(PhysicalAddress::new(0x40_0000)).is_ok());
        assert!(PhysicalPage::<Size4M>::try_from(PhysicalAddress::new(0x20_0000)).is_err());
    }

    #[test]
    fn page_iteration_steps_by_size() {
        let p = VirtualPage::<Size4K>::containing_address(VirtualAddress::new(0x1234));
        assert_eq!(p.next().map(VirtualPage::base), Some(VirtualAddress::new(0x2000)));
        let last = VirtualPage::<Size4K>::containing_address(VirtualAddress::new(0xFFFF_F000));
        assert!(last.next().is_none());
    }
}
