//! A simulated machine for host tests.
//!
//! Every OS thread of the test process plays one core, selected with
//! [`SimPlatform::set_current_core`]. Context switches, IPIs and timer
//! programming are recorded instead of performed. Pending IPIs are delivered
//! when the target core waits for an interrupt, through a sink the test
//! installs.

use crate::platform::{ContextSwitch, Platform};
use crate::registers::ThreadRegisters;
use kernel_sync::{SpinLock, SyncOnceCell};
use std::boxed::Box;
use std::cell::Cell;
use std::vec::Vec;

std::thread_local! {
    static CORE: Cell<usize> = const { Cell::new(0) };
    static INTERRUPTS: Cell<bool> = const { Cell::new(true) };
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimEvent {
    Enter { core: usize, eip: u32, initial: bool },
    Ipi { from: usize, apic_id: u32, vector: u8 },
    Broadcast { from: usize, vector: u8 },
    Timer { core: usize, interval_ms: u32 },
}

type Sink = Box<dyn Fn(usize, u8) + Send + Sync>;

pub struct SimPlatform {
    pending: Vec<SpinLock<Vec<u8>>>,
    events: SpinLock<Vec<SimEvent>>,
    sink: SyncOnceCell<Sink>,
}

impl SimPlatform {
    #[must_use]
    pub fn new(cores: usize) -> Self {
        Self {
            pending: (0..cores).map(|_| SpinLock::new(Vec::new())).collect(),
            events: SpinLock::new(Vec::new()),
            sink: SyncOnceCell::new(),
        }
    }

    /// A platform that lives for the rest of the test process.
    #[must_use]
    pub fn leak(cores: usize) -> &'static Self {
        Box::leak(Box::new(Self::new(cores)))
    }

    pub fn set_current_core(core: usize) {
        CORE.with(|c| c.set(core));
    }

    /// Called with `(core, vector)` for every IPI delivered to a waiting core.
    pub fn set_interrupt_sink(&self, sink: impl Fn(usize, u8) + Send + Sync + 'static) {
        if self.sink.set(Box::new(sink)).is_err() {
            panic!("interrupt sink installed twice");
        }
    }

    #[must_use]
    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    #[must_use]
    pub fn pending(&self, core: usize) -> Vec<u8> {
        self.pending[core].lock().clone()
    }

    fn record(&self, event: SimEvent) {
        self.events.lock().push(event);
    }

    fn raise(&self, core: usize, vector: u8) {
        if let Some(queue) = self.pending.get(core) {
            queue.lock().push(vector);
        }
    }

    /// Hands the calling core's pending IPIs to the sink. Returns how many
    /// were delivered.
    pub fn deliver_pending(&self) -> usize {
        let core = self.core_index();
        let vectors = core::mem::take(&mut *self.pending[core].lock());
        if let Some(sink) = self.sink.get() {
            for &vector in &vectors {
                sink(core, vector);
            }
        }
        vectors.len()
    }
}

impl ContextSwitch for SimPlatform {
    fn restore_context(&self, registers: &ThreadRegisters, _kernel_stack_top: u32) {
        self.record(SimEvent::Enter {
            core: self.core_index(),
            eip: registers.eip,
            initial: false,
        });
    }

    fn enter_initial_context(&self, registers: &ThreadRegisters, _kernel_stack_top: u32) {
        self.record(SimEvent::Enter {
            core: self.core_index(),
            eip: registers.eip,
            initial: true,
        });
    }
}

impl Platform for SimPlatform {
    fn core_index(&self) -> usize {
        CORE.with(Cell::get)
    }

    fn interrupts_enabled(&self) -> bool {
        INTERRUPTS.with(Cell::get)
    }

    fn disable_interrupts(&self) {
        INTERRUPTS.with(|i| i.set(false));
    }

    fn enable_interrupts(&self) {
        INTERRUPTS.with(|i| i.set(true));
    }

    fn wait_for_interrupt(&self) {
        if self.deliver_pending() == 0 {
            std::thread::yield_now();
        }
    }

    fn halt(&self) -> ! {
        panic!("core {} halted", self.core_index());
    }

    /// APIC IDs equal core indices on the simulated machine.
    fn send_ipi(&self, apic_id: u32, vector: u8) {
        self.record(SimEvent::Ipi {
            from: self.core_index(),
            apic_id,
            vector,
        });
        self.raise(apic_id as usize, vector);
    }

    fn broadcast_ipi(&self, vector: u8) {
        let from = self.core_index();
        self.record(SimEvent::Broadcast { from, vector });
        for core in (0..self.pending.len()).filter(|&c| c != from) {
            self.raise(core, vector);
        }
    }

    fn arm_timer(&self, interval_ms: u32) {
        self.record(SimEvent::Timer {
            core: self.core_index(),
            interval_ms,
        });
    }
}
