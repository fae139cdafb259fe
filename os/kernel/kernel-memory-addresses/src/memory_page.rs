use crate::{MemoryAddress, MemoryAddressOffset, PageSize};
use core::fmt;
use core::marker::PhantomData;

/// A page base address (lower `S::SHIFT` bits are zero).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryPage<S: PageSize> {
    value: u32,
    _phantom: PhantomData<S>,
}

impl<S> fmt::Display for MemoryPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/{}", self.value, S::as_str())
    }
}

impl<S: PageSize> MemoryPage<S> {
    /// Create from a raw value, aligning down to the page boundary.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: MemoryAddress) -> Self {
        Self {
            value: addr.as_u32() & !(S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    /// Page that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: u32) -> Self {
        Self::from_addr(MemoryAddress::new(addr))
    }

    /// Create from a raw value that must already be aligned.
    /// Panics in debug if unaligned.
    #[inline]
    #[must_use]
    pub fn new_aligned(addr: MemoryAddress) -> Self {
        debug_assert_eq!(addr.as_u32() & (S::SIZE - 1), 0, "unaligned page address");
        Self {
            value: addr.as_u32(),
            _phantom: PhantomData,
        }
    }

    /// Page frame number: the base divided by the page size.
    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.value >> S::SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> MemoryAddress {
        MemoryAddress::new(self.value)
    }

    /// Combine with an offset to form a full address.
    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> MemoryAddress {
        MemoryAddress::new(self.value | off.as_u32())
    }

    /// The following page, or `None` at the end of the address space.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.value.checked_add(S::SIZE) {
            Some(value) => Some(Self {
                value,
                _phantom: PhantomData,
            }),
            None => None,
        }
    }

    #[inline(always)]
    #[must_use]
    pub(crate) const fn into_inner(self) -> u32 {
        self.value
    }
}

impl<S: PageSize> fmt::Debug for MemoryPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryPage<{}>(0x{:08X})", S::as_str(), self.value)
    }
}
