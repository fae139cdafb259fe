//! # Model-Specific Registers (MSR) utilities
//!
//! The only MSR the kernel needs on i386 is `IA32_APIC_BASE`, which locates
//! the local APIC's MMIO page and tells the bootstrap processor apart from
//! application processors.

use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Identifies a **Model-Specific Register (MSR)** by its architectural index.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msr(pub u32);

impl Msr {
    pub const IA32_APIC_BASE: Self = Self(0x1B);

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Write a 64-bit value to the MSR.
    ///
    /// # Safety
    /// Executes `WRMSR`, which requires CPL 0 and a valid, writable index.
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn store_raw(self, val: u64) {
        let lo = val as u32;
        let hi = (val >> 32) as u32;
        unsafe {
            core::arch::asm!(
                "wrmsr",
                in("ecx") self.0,
                in("eax") lo,
                in("edx") hi,
                options(nostack, preserves_flags)
            );
        }
    }

    /// Read the MSR's 64-bit value.
    ///
    /// # Safety
    /// Executes `RDMSR`, which requires CPL 0 and a valid index.
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    #[inline]
    #[must_use]
    pub unsafe fn load_raw(self) -> u64 {
        let lo: u32;
        let hi: u32;
        unsafe {
            core::arch::asm!(
                "rdmsr",
                in("ecx") self.0,
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }
}

/// `IA32_APIC_BASE` (MSR `0x1B`).
#[bitfield(u64)]
pub struct Ia32ApicBase {
    #[bits(8)]
    _reserved0: u8,

    /// Bit 8 — set on the bootstrap processor.
    pub bsp: bool,

    #[bits(2)]
    _reserved9: u8,

    /// Bit 11 — global enable of the local APIC.
    pub enabled: bool,

    /// Bits 12–35 — APIC base frame number.
    #[bits(24)]
    base_4k: u32,

    #[bits(28)]
    _reserved36: u32,
}

impl Ia32ApicBase {
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base_4k() << 12)
    }

    /// # Safety
    /// See [`Msr::load_raw`].
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    #[must_use]
    pub unsafe fn load() -> Self {
        Self::from_bits(unsafe { Msr::IA32_APIC_BASE.load_raw() })
    }

    /// # Safety
    /// See [`Msr::store_raw`].
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    pub unsafe fn store(self) {
        unsafe { Msr::IA32_APIC_BASE.store_raw(self.into_bits()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_default_apic_base() {
        let msr = Ia32ApicBase::from_bits(0xFEE0_0900);
        assert!(msr.bsp());
        assert!(msr.enabled());
        assert_eq!(msr.base(), PhysicalAddress::new(0xFEE0_0000));
    }
}
