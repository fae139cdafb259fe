//! # i386 Interrupt Descriptor Table (IDT)
//!
//! 256 eight-byte gates with a fluent builder:
//!
//! ```ignore
//! idt[0x80]
//!     .set_handler(stub)
//!     .selector(KERNEL_CODE_SELECTOR)
//!     .dpl(3)
//!     .present(true)
//!     .gate_interrupt();
//! ```
//!
//! Every vector points at its entry stub (see [`crate::interrupts`]), and all
//! cores share one table: it is built once by the bootstrap processor and
//! loaded by every core with `lidt`. Interrupt gates clear `IF` on entry, so
//! handlers always start with interrupts masked.

#[cfg(target_arch = "x86")]
use crate::gdt::DescriptorTablePointer;
use bitfield_struct::bitfield;
use core::mem::MaybeUninit;
use core::ops::{Index, IndexMut};

const _: () = assert!(size_of::<IdtEntry>() == 8);

/// The two middle bytes of a gate: a reserved zero byte followed by
/// `| P | DPL(2) | S(0) | Type(4) |`.
#[bitfield(u16)]
pub struct IdtGateAttr {
    #[bits(8)]
    __zero0: u8,
    /// 0xE = 32-bit interrupt gate, 0xF = 32-bit trap gate.
    #[bits(4)]
    pub typ: u8,
    /// Must be zero for interrupt and trap gates.
    pub s: bool,
    /// Highest privilege level allowed to raise the vector with `int n`.
    #[bits(2)]
    pub dpl: u8,
    pub present: bool,
}

impl IdtGateAttr {
    #[must_use]
    pub const fn interrupt_gate() -> Self {
        Self::new().with_typ(0xE).with_s(false)
    }

    #[must_use]
    pub const fn trap_gate() -> Self {
        Self::new().with_typ(0xF).with_s(false)
    }
}

/// One gate descriptor.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    attr: IdtGateAttr,
    offset_hi: u16,
}

impl IdtEntry {
    pub const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        attr: IdtGateAttr::new(),
        offset_hi: 0,
    };

    #[allow(clippy::cast_possible_truncation)]
    pub const fn set_handler(&mut self, address: u32) -> &mut Self {
        self.offset_lo = address as u16;
        self.offset_hi = (address >> 16) as u16;
        self
    }

    pub const fn selector(&mut self, selector: u16) -> &mut Self {
        self.selector = selector;
        self
    }

    pub const fn dpl(&mut self, dpl: u8) -> &mut Self {
        self.attr = self.attr.with_dpl(dpl & 0b11);
        self
    }

    pub const fn present(&mut self, present: bool) -> &mut Self {
        self.attr = self.attr.with_present(present);
        self
    }

    pub const fn gate_interrupt(&mut self) -> &mut Self {
        self.attr = self.attr.with_typ(IdtGateAttr::interrupt_gate().typ());
        self
    }

    pub const fn gate_trap(&mut self) -> &mut Self {
        self.attr = self.attr.with_typ(IdtGateAttr::trap_gate().typ());
        self
    }

    #[must_use]
    pub const fn handler(&self) -> u32 {
        self.offset_lo as u32 | ((self.offset_hi as u32) << 16)
    }

    #[must_use]
    pub const fn attributes(&self) -> IdtGateAttr {
        self.attr
    }
}

/// A 256-entry Interrupt Descriptor Table.
#[repr(C, align(8))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

impl Idt {
    /// All gates not present.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; 256],
        }
    }

    /// Load this IDT into the IDTR of the calling core.
    ///
    /// # Safety
    /// CPL 0; every present gate must point at valid handler code.
    #[cfg(target_arch = "x86")]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn load(&'static self) {
        let idtr = DescriptorTablePointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: core::ptr::from_ref(self) as u32,
        };
        unsafe {
            core::arch::asm!("lidt [{}]", in(reg) &raw const idtr, options(nostack, preserves_flags, readonly));
        }
    }
}

impl Index<usize> for Idt {
    type Output = IdtEntry;

    fn index(&self, i: usize) -> &Self::Output {
        &self.entries[i]
    }
}

impl IndexMut<usize> for Idt {
    fn index_mut(&mut self, i: usize) -> &mut Self::Output {
        &mut self.entries[i]
    }
}

/// The global interrupt descriptor table.
static mut IDT: MaybeUninit<Idt> = MaybeUninit::uninit();

/// Install `idt` as the shared table and load it on the calling core.
///
/// # Safety
/// Once, on the bootstrap processor, before interrupts are enabled.
#[cfg(target_arch = "x86")]
pub unsafe fn init_idt_once(idt: Idt) {
    #[allow(static_mut_refs)]
    unsafe {
        IDT.write(idt);
        IDT.assume_init_ref().load();
    }
}

/// Load the shared table on an application processor.
///
/// # Safety
/// [`init_idt_once`] must have run.
#[cfg(target_arch = "x86")]
pub unsafe fn load_idt() {
    #[allow(static_mut_refs)]
    unsafe {
        IDT.assume_init_ref().load();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_encodes_gate() {
        let mut idt = Idt::new();
        idt[0x80]
            .set_handler(0xC012_3456)
            .selector(0x08)
            .dpl(3)
            .present(true)
            .gate_interrupt();

        let entry = idt[0x80];
        assert_eq!(entry.handler(), 0xC012_3456);
        assert_eq!(entry.attributes().into_bits() >> 8, 0xEE);
        assert!(!idt[0x81].attributes().present());
    }

    #[test]
    fn trap_gate_type() {
        let mut entry = IdtEntry::MISSING;
        entry.present(true).gate_trap();
        assert_eq!(entry.attributes().into_bits() >> 8, 0x8F);
    }
}
