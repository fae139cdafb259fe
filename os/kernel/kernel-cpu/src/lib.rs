//! # Cores, threads and interrupts
//!
//! Each core is a [`Processor`]: it dispatches interrupts through a table of
//! handler slots, keeps a millisecond clock with timed [`Event`]s, and runs a
//! preemptive round-robin [`CoreScheduler`] over the threads pinned to it.
//! [`Smp`] holds all processors; cores never share threads and talk only by
//! queueing messages and poking each other with an IPI.
//!
//! ## Context switches
//!
//! A switch is never performed inside a handler. The scheduler tick records
//! an [`ExitAction`] for the current interrupt level, and the outermost level
//! carries it out through the [`Platform`] once every lock is released.
//!
//! ```text
//! stub → handle_interrupt → handler → EOI → pop level → deferred calls → exit action
//! ```
//!
//! Nothing in here touches hardware: the kernel binary implements
//! [`Platform`] with the real instructions, and host tests use a simulated
//! machine.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod blocker;
pub mod boot;
pub mod event;
pub mod interrupt;
pub mod message;
mod platform;
mod processor;
pub mod registers;
mod scheduler;
mod smp;
#[cfg(test)]
mod testing;
mod thread;

pub use blocker::SchedulerBlocker;
pub use boot::{BootSync, SmpError, TrampolineError, TrampolineImage};
pub use event::Event;
pub use interrupt::{HandlerKind, InterruptController, InterruptHandler};
pub use message::ProcessorMessage;
pub use platform::{ContextSwitch, Platform};
pub use processor::{ExitAction, Processor};
pub use registers::{InterruptFrame, ThreadRegisters};
pub use scheduler::{CoreScheduler, Switch};
pub use smp::Smp;
pub use thread::{KernelStack, Thread, ThreadEntry, ThreadId, ThreadState};

/// Scheduler tick and clock resolution.
pub const SMALLEST_INTERVAL_MS: u32 = 10;

/// Local APIC timer.
pub const TIMER_VECTOR: u8 = 0xF0;
/// Cross-core message delivery.
pub const IPI_VECTOR: u8 = 0xF1;
/// Sent by a panicking core to stop the others.
pub const HALT_VECTOR: u8 = 0xF2;
