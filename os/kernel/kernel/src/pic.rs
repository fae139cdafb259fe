//! The legacy 8259 PIC pair.
//!
//! Interrupts arrive through the local APIC only; the PICs are remapped off
//! the exception vectors and fully masked. A masked PIC can still raise its
//! spurious IRQ 7/15, which lands on [`PIC_BASE_VECTOR`] + 7 / + 15.

use crate::ports::{inb, io_wait, outb};

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;

pub const PIC_BASE_VECTOR: u8 = 0x20;

/// Remap both PICs to `0x20..0x30` and mask every line.
///
/// # Safety
/// Bootstrap processor only, with interrupts disabled.
pub unsafe fn remap_and_mask() {
    unsafe {
        outb(PIC1_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();
        outb(PIC2_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();
        outb(PIC1_DATA, PIC_BASE_VECTOR);
        io_wait();
        outb(PIC2_DATA, PIC_BASE_VECTOR + 8);
        io_wait();
        // Slave on IRQ 2.
        outb(PIC1_DATA, 1 << 2);
        io_wait();
        outb(PIC2_DATA, 2);
        io_wait();
        outb(PIC1_DATA, ICW4_8086);
        io_wait();
        outb(PIC2_DATA, ICW4_8086);
        io_wait();

        outb(PIC1_DATA, 0xFF);
        outb(PIC2_DATA, 0xFF);
        let _ = inb(PIC1_DATA);
    }
    log::debug!("pic: remapped to {PIC_BASE_VECTOR:#04x} and masked");
}
