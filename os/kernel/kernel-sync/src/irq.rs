//! Interrupt flag control for the running core.
//!
//! # Safety & Privilege
//!
//! Everything here executes `cli`, `sti` or `pushfd`, which must only run in
//! ring 0.

use crate::InterruptFlag;

const EFLAGS_IF: u32 = 1 << 9;

/// Disables hardware interrupts (`cli`).
#[inline]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
#[inline]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns the current `EFLAGS` value (via `pushfd/pop`).
#[inline]
#[must_use]
pub fn eflags() -> u32 {
    let r: u32;
    unsafe { core::arch::asm!("pushfd; pop {}", out(reg) r, options(preserves_flags)) }
    r
}

/// The real interrupt flag of the executing core.
#[derive(Clone, Copy, Debug, Default)]
pub struct HardwareInterruptFlag;

impl InterruptFlag for HardwareInterruptFlag {
    #[inline]
    fn enabled(&self) -> bool {
        eflags() & EFLAGS_IF != 0
    }

    #[inline]
    fn disable(&self) {
        cli_stop_interrupts();
    }

    #[inline]
    fn enable(&self) {
        sti_enable_interrupts();
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Used where no per-core critical counter exists yet (early boot, panic).
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = HardwareInterruptFlag.enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts (`sti`) only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
