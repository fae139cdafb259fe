use crate::{MemoryAddressOffset, MemoryPage, PageSize, VirtualAddress};
use core::fmt;

/// Virtual memory page base for size `S`.
///
/// A thin wrapper over [`MemoryPage<S>`] with virtual-address intent. The low
/// `S::SHIFT` bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> VirtualPage<S> {
    #[inline]
    #[must_use]
    pub const fn from_page(p: MemoryPage<S>) -> Self {
        Self(p)
    }

    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        Self(MemoryPage::<S>::containing(addr.as_u32()))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> VirtualAddress {
        VirtualAddress(self.0.join(off))
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.0.next() {
            Some(p) => Some(Self(p)),
            None => None,
        }
    }
}

impl<S> fmt::Display for VirtualPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>({:#010X})", S::as_str(), self.0.base().as_u32())
    }
}

impl<S: PageSize> TryFrom<VirtualAddress> for VirtualPage<S> {
    type Error = ();

    #[inline]
    fn try_from(va: VirtualAddress) -> Result<Self, ()> {
        if va.is_aligned::<S>() {
            Ok(va.page())
        } else {
            Err(())
        }
    }
}

impl<S> From<MemoryPage<S>> for VirtualPage<S>
where
    S: PageSize,
{
    #[inline]
    fn from(p: MemoryPage<S>) -> Self {
        Self(p)
    }
}
