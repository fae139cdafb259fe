use crate::{MemoryAddress, MemoryAddressOffset, PageSize, VirtualPage};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Virtual memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **virtual** addresses.
/// It only carries the *kind* of address at the type level so you don't
/// accidentally mix virtual and physical values.
///
/// ### Two-level decomposition
/// On i386 without PAE a virtual address splits into a 10-bit page directory
/// index, a 10-bit page table index and a 12-bit page offset:
///
/// ```text
///  31        22 21        12 11          0
/// +------------+------------+-------------+
/// |  directory |   table    |   offset    |
/// +------------+------------+-------------+
/// ```
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xC040_1234);
/// let (vp, off) = va.split::<Size4K>();
/// assert_eq!(vp.base().as_u32(), 0xC040_1000);
/// assert_eq!(vp.join(off), va);
/// assert_eq!(va.directory_index(), 0x301);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(pub(crate) MemoryAddress);

impl VirtualAddress {
    #[inline]
    #[must_use]
    #[cfg(target_pointer_width = "32")]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(MemoryAddress::from_ptr(ptr))
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(MemoryAddress::new(v))
    }

    /// Builds an address from its directory index, table index and offset.
    #[inline]
    #[must_use]
    pub const fn from_indices(directory: usize, table: usize, offset: u32) -> Self {
        debug_assert!(directory < 1024 && table < 1024 && offset < 4096);
        Self::new(((directory as u32) << 22) | ((table as u32) << 12) | offset)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0.as_u32()
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0.as_usize()
    }

    /// Raw pointer view; only meaningful for addresses of the running space.
    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0.as_usize() as *mut T
    }

    /// Index into the page directory (bits 31..22).
    #[inline]
    #[must_use]
    pub const fn directory_index(self) -> usize {
        (self.as_u32() >> 22) as usize
    }

    /// Index into the page table (bits 21..12).
    #[inline]
    #[must_use]
    pub const fn table_index(self) -> usize {
        ((self.as_u32() >> 12) & 0x3FF) as usize
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::<S>(self.0.page::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
        self.0.offset::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (VirtualPage<S>, MemoryAddressOffset<S>) {
        (self.page::<S>(), self.offset::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0.is_aligned::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u32) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:08X})", self.as_u32())
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.as_u32())
    }
}

impl From<u32> for VirtualAddress {
    #[inline]
    fn from(v: u32) -> Self {
        Self::new(v)
    }
}

impl<S> From<VirtualPage<S>> for VirtualAddress
where
    S: PageSize,
{
    fn from(value: VirtualPage<S>) -> Self {
        value.base()
    }
}

impl Add<u32> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u32> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: Self) -> u32 {
        self.0 - rhs.0
    }
}
