//! CPUID leaf 1: the few identification bits bring-up relies on.

use bitfield_struct::bitfield;

pub const LEAF_01H: u32 = 0x01;

#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Execute CPUID with the given leaf and subleaf.
///
/// # Safety
/// The CPU must support the `cpuid` instruction.
#[cfg(target_arch = "x86")]
#[inline]
pub unsafe fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    let (mut eax, ebx, mut ecx, edx): (u32, u32, u32, u32);
    eax = leaf;
    ecx = subleaf;
    unsafe {
        // EBX belongs to LLVM; move it out through EDI.
        core::arch::asm!(
            "push ebx",
            "cpuid",
            "mov edi, ebx",
            "pop ebx",
            inout("eax") eax,
            inout("ecx") ecx,
            out("edi") ebx,
            out("edx") edx,
            options(nomem, preserves_flags),
        );
    }
    CpuidResult { eax, ebx, ecx, edx }
}

/// CPUID.01H:EBX.
#[bitfield(u32)]
pub struct Leaf1Ebx {
    pub brand_index: u8,
    pub clflush_line_size: u8,
    /// Addressable logical processor IDs in the package.
    pub max_logical_processors: u8,
    /// APIC ID the core got at reset.
    pub initial_apic_id: u8,
}

/// CPUID.01H:EDX, reduced to the flags the kernel checks.
#[bitfield(u32)]
pub struct Leaf1Edx {
    pub fpu: bool,
    #[bits(2)]
    __r1: u8,
    pub pse: bool,
    pub tsc: bool,
    pub msr: bool,
    #[bits(3)]
    __r6: u8,
    pub apic: bool,
    #[bits(18)]
    __r10: u32,
    pub htt: bool,
    #[bits(3)]
    __r29: u8,
}

#[derive(Copy, Clone, Debug)]
pub struct Leaf01h {
    pub ebx: Leaf1Ebx,
    pub edx: Leaf1Edx,
}

impl Leaf01h {
    /// # Safety
    /// See [`cpuid`].
    #[cfg(target_arch = "x86")]
    #[must_use]
    pub unsafe fn new() -> Self {
        Self::from(unsafe { cpuid(LEAF_01H, 0) })
    }

    #[must_use]
    pub const fn from(r: CpuidResult) -> Self {
        Self {
            ebx: Leaf1Ebx::from_bits(r.ebx),
            edx: Leaf1Edx::from_bits(r.edx),
        }
    }

    #[must_use]
    pub const fn has_apic(&self) -> bool {
        self.edx.apic()
    }

    /// Upper bound of the logical processors in the package. Without the
    /// HTT flag the count field is not valid and the package has one.
    #[must_use]
    pub const fn logical_processors(&self) -> usize {
        if self.edx.htt() && self.ebx.max_logical_processors() > 0 {
            self.ebx.max_logical_processors() as usize
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qemu_four_cores() {
        // EBX/EDX of QEMU's default CPU with -smp 4.
        let leaf = Leaf01h::from(CpuidResult {
            eax: 0x663,
            ebx: 0x0004_0800,
            ecx: 0,
            edx: 0x178B_FBFF,
        });
        assert!(leaf.has_apic());
        assert!(leaf.edx.pse());
        assert_eq!(leaf.logical_processors(), 4);
        assert_eq!(leaf.ebx.initial_apic_id(), 0);
    }

    #[test]
    fn no_htt_means_one_core() {
        let leaf = Leaf01h::from(CpuidResult {
            eax: 0,
            ebx: 0x0304_0800,
            ecx: 0,
            edx: 1 << 9,
        });
        assert_eq!(leaf.logical_processors(), 1);
        assert_eq!(leaf.ebx.initial_apic_id(), 3);
    }
}
