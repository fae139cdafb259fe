//! # x86 I/O Port Access
//!
//! Thin wrappers around `in`/`out` for the legacy devices the kernel still
//! touches during bring-up:
//!
//! ```text
//! 0x0020-0x0021   PIC #1
//! 0x0040-0x0043   PIT
//! 0x0061          PC speaker / PIT channel 2 gate
//! 0x00A0-0x00A1   PIC #2
//! ```
//!
//! # Safety
//! Every access is `unsafe`: the caller must run at CPL 0, target the right
//! device register, and serialize multi-step protocols against other cores
//! and interrupt handlers.

/// Write one byte to an I/O port.
///
/// # Safety
/// See the module documentation.
#[inline]
pub unsafe fn outb(port: u16, val: u8) {
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") val, options(nomem, nostack, preserves_flags));
    }
}

/// Read one byte from an I/O port.
///
/// # Safety
/// See the module documentation.
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    let mut v: u8;
    unsafe {
        core::arch::asm!("in al, dx", in("dx") port, out("al") v, options(nomem, nostack, preserves_flags));
    }
    v
}

/// A write to an unused port; roughly one microsecond on the ISA bus.
///
/// # Safety
/// See the module documentation.
#[inline]
pub unsafe fn io_wait() {
    unsafe { outb(0x80, 0) };
}
