use crate::{MemoryAddressOffset, MemoryPage, PageSize, PhysicalAddress};
use core::fmt;

/// Physical memory page (frame) base for size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> PhysicalPage<S> {
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: PhysicalAddress) -> Self {
        Self(MemoryPage::<S>::from_addr(addr.0))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> PhysicalAddress {
        PhysicalAddress(self.0.join(off))
    }

    /// Frame number (base divided by the page size).
    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.0.number()
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>({:#010X})", S::as_str(), self.0.base().as_u32())
    }
}

impl<S: PageSize> TryFrom<PhysicalAddress> for PhysicalPage<S> {
    type Error = ();

    #[inline]
    fn try_from(pa: PhysicalAddress) -> Result<Self, ()> {
        if pa.is_aligned::<S>() {
            Ok(pa.page())
        } else {
            Err(())
        }
    }
}

impl<S: PageSize> From<MemoryPage<S>> for PhysicalPage<S> {
    #[inline]
    fn from(p: MemoryPage<S>) -> Self {
        Self(p)
    }
}
