use crate::{MemoryAddressOffset, MemoryPage, PageSize};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Principal raw memory address ([virtual](super::VirtualAddress) or [physical](super::PhysicalAddress)).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddress(u32);

impl MemoryAddress {
    #[inline]
    #[must_use]
    #[cfg(target_pointer_width = "32")]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::new(ptr as usize as u32)
    }

    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Widened value, for size arithmetic that may reach `2^32`.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// The page for size `S` that contains this address (lower bits zeroed).
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> MemoryPage<S> {
        MemoryPage::<S>::from_addr(self)
    }

    /// The offset within the page of size `S` that contains this address.
    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
        MemoryAddressOffset::new(self.0 & (S::SIZE - 1))
    }

    /// Split into (`MemoryPage<S>`, `MemoryAddressOffset<S>`).
    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (MemoryPage<S>, MemoryAddressOffset<S>) {
        (self.page::<S>(), self.offset::<S>())
    }

    /// Align down to page boundary `S`.
    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
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

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryAddress(0x{:08X})", self.0)
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::LowerHex for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<u32> for MemoryAddress {
    #[inline]
    fn from(v: u32) -> Self {
        Self::new(v)
    }
}

impl From<MemoryAddress> for u32 {
    #[inline]
    fn from(a: MemoryAddress) -> Self {
        a.as_u32()
    }
}

impl<S> From<MemoryPage<S>> for MemoryAddress
where
    S: PageSize,
{
    fn from(value: MemoryPage<S>) -> Self {
        Self(value.into_inner())
    }
}

impl Add<u32> for MemoryAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for MemoryAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub for MemoryAddress {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: Self) -> u32 {
        self.0.wrapping_sub(rhs.0)
    }
}
