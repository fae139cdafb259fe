use bitfield_struct::bitfield;

/// Architectural EFLAGS model for 32-bit protected mode.
#[bitfield(u32, order = Lsb)]
pub struct Eflags {
    /// Carry Flag
    pub cf_carry: bool, // 0

    /// Always 1.
    #[bits(default = true)]
    _always1: bool, // 1

    /// Parity Flag
    pub pf_parity: bool, // 2

    #[bits(default = false)]
    _rsvd3: bool, // 3

    /// Adjust Flag
    pub af_adjust: bool, // 4

    #[bits(default = false)]
    _rsvd5: bool, // 5

    /// Zero Flag
    pub zf_zero: bool, // 6

    /// Sign Flag
    pub sf_sign: bool, // 7

    /// Trap Flag
    pub tf_trap: bool, // 8

    /// Interrupt Enable Flag
    pub if_interrupt_enable: bool, // 9

    /// Direction Flag
    pub df_direction: bool, // 10

    /// Overflow Flag
    pub of_overflow: bool, // 11

    /// I/O Privilege Level
    #[bits(2)]
    pub iopl: u8, // 12–13

    /// Nested Task
    pub nt_nested: bool, // 14

    #[bits(default = false)]
    _rsvd15: bool, // 15

    /// Resume Flag
    pub rf_resume: bool, // 16

    /// Virtual-8086 Mode
    pub vm_virtual_8086: bool, // 17

    /// Alignment Check
    pub ac_alignment_check: bool, // 18

    /// Virtual Interrupt Flag
    pub vif: bool, // 19

    /// Virtual Interrupt Pending
    pub vip: bool, // 20

    /// CPUID available
    pub id: bool, // 21

    #[bits(10, default = 0)]
    _rsvd22_31: u16,
}

impl Eflags {
    /// Flags a freshly created thread starts with: interrupts enabled,
    /// everything else cleared.
    #[must_use]
    pub const fn thread_default() -> Self {
        Self::new().with_if_interrupt_enable(true)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegister for Eflags {
    fn load() -> Self {
        let r: u32;
        unsafe { core::arch::asm!("pushfd; pop {}", out(reg) r, options(preserves_flags)) }
        Self::from_bits(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_default_has_if_and_reserved_one() {
        assert_eq!(Eflags::thread_default().into_bits(), 0x202);
    }
}
