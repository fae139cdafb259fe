use kernel_memory_addresses::VirtualAddress;

/// CR2 — Page Fault Linear Address.
///
/// Holds the linear address that caused the most recent page fault. Must be
/// read before anything else can fault again.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Cr2(u32);

impl Cr2 {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn faulting_address(self) -> VirtualAddress {
        VirtualAddress::new(self.0)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegisterUnsafe for Cr2 {
    unsafe fn load_unsafe() -> Self {
        let cr2: u32;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        Self(cr2)
    }
}
