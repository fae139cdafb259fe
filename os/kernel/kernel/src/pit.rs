//! Busy-waiting on PIT channel 2.
//!
//! Only used while nothing else keeps time: calibrating the local APIC timer
//! and the delays of the INIT/STARTUP sequence.

use crate::ports::{inb, outb};

const PIT_FREQUENCY_HZ: u32 = 1_193_182;
const CHANNEL2_DATA: u16 = 0x42;
const COMMAND: u16 = 0x43;
const SPEAKER_CONTROL: u16 = 0x61;

/// Longest delay the 16-bit counter can express in one go.
const MAX_CHUNK_US: u32 = 50_000;

/// Spin for at least `us` microseconds.
///
/// # Safety
/// Owns PIT channel 2 while it runs; callers must not overlap.
pub unsafe fn sleep_us(mut us: u32) {
    while us > 0 {
        let chunk = us.min(MAX_CHUNK_US);
        unsafe { one_shot(chunk) };
        us -= chunk;
    }
}

/// # Safety
/// See [`sleep_us`].
pub unsafe fn sleep_ms(ms: u32) {
    unsafe { sleep_us(ms.saturating_mul(1000)) };
}

#[allow(clippy::cast_possible_truncation)]
unsafe fn one_shot(us: u32) {
    let ticks = (u64::from(PIT_FREQUENCY_HZ) * u64::from(us) / 1_000_000).clamp(1, 0xFFFF) as u16;
    unsafe {
        // Gate on, speaker off.
        let control = inb(SPEAKER_CONTROL);
        outb(SPEAKER_CONTROL, (control & !0x02) | 0x01);

        // Channel 2, lobyte/hibyte, mode 0 (interrupt on terminal count).
        outb(COMMAND, 0b1011_0000);
        outb(CHANNEL2_DATA, ticks as u8);
        outb(CHANNEL2_DATA, (ticks >> 8) as u8);

        // Restart the count by toggling the gate.
        let control = inb(SPEAKER_CONTROL);
        outb(SPEAKER_CONTROL, control & !0x01);
        outb(SPEAKER_CONTROL, control | 0x01);

        // OUT2 goes high at terminal count.
        while inb(SPEAKER_CONTROL) & 0x20 == 0 {
            core::hint::spin_loop();
        }
    }
}
