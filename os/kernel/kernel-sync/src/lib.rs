//! # Kernel synchronization primitives
//!
//! * [`SpinLock`] busy-waits and keeps the owning core inside a critical
//!   section (interrupts off) while held. Usable from interrupt handlers.
//! * [`Mutex`] spins until a scheduler installs a [`Blocker`]; from then on
//!   contended callers are queued FIFO and put to sleep, and `unlock` hands
//!   ownership straight to the oldest waiter.
//! * [`SyncOnceCell`] is a spin-initialized once cell for kernel singletons.
//!
//! The critical section is reached through [`critical::install`]ed hooks so
//! the primitives run unchanged in host tests, where no hooks exist.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod critical;
#[cfg(target_arch = "x86")]
pub mod irq;
mod mutex;
mod spin_lock;
mod sync_once_cell;

pub use critical::{CriticalCounter, CriticalGuard, CriticalSection, InterruptFlag};
pub use mutex::{Blocker, Mutex, MutexGuard, WaiterToken, install_blocker};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
