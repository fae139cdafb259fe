//! What portable code needs from the running core.

use crate::registers::{InterruptFrame, ThreadRegisters};
use kernel_sync::InterruptFlag;

/// Entering and leaving thread contexts.
///
/// On hardware `restore_context` and `enter_initial_context` end in `iret`
/// and never return to the caller. Simulated platforms record the request and
/// return.
pub trait ContextSwitch {
    /// Store the interrupted state described by `frame` into `registers`.
    fn save_context(&self, frame: &InterruptFrame, registers: &mut ThreadRegisters) {
        registers.capture(frame);
    }

    /// Resume a thread that was interrupted before. Loads `kernel_stack_top`
    /// into the TSS and switches `CR3` if it differs.
    fn restore_context(&self, registers: &ThreadRegisters, kernel_stack_top: u32);

    /// Enter a thread for the first time.
    fn enter_initial_context(&self, registers: &ThreadRegisters, kernel_stack_top: u32);
}

/// The core services of one machine.
pub trait Platform: ContextSwitch + Sync {
    /// Index of the calling core, `0` for the bootstrap processor.
    fn core_index(&self) -> usize;

    fn interrupts_enabled(&self) -> bool;
    fn disable_interrupts(&self);
    fn enable_interrupts(&self);

    /// Sleep until the next interrupt has been handled (`sti; hlt`).
    fn wait_for_interrupt(&self);

    /// Stop the calling core for good.
    fn halt(&self) -> !;

    fn send_ipi(&self, apic_id: u32, vector: u8);

    /// Send `vector` to every core but the calling one.
    fn broadcast_ipi(&self, vector: u8);

    /// Start the periodic core timer.
    fn arm_timer(&self, interval_ms: u32);
}

/// Adapts a [`Platform`] to the critical-section counter.
pub(crate) struct PlatformFlag<'a>(pub &'a dyn Platform);

impl InterruptFlag for PlatformFlag<'_> {
    fn enabled(&self) -> bool {
        self.0.interrupts_enabled()
    }

    fn disable(&self) {
        self.0.disable_interrupts();
    }

    fn enable(&self) {
        self.0.enable_interrupts();
    }
}
