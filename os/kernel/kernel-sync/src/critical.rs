//! Per-core critical sections.
//!
//! A critical section keeps the current core from taking interrupts, and thus
//! from being preempted. Sections nest: interrupts are disabled on the first
//! [`CriticalCounter::enter`] and restored by the matching outermost
//! [`CriticalCounter::leave`], and only if they were enabled to begin with.
//!
//! The kernel binds the process-wide hooks to the running core's counter via
//! [`install`]. Until then [`enter_critical`] and [`leave_critical`] do
//! nothing, which is what early boot and host tests want.

use crate::SyncOnceCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Access to the interrupt-enable flag of the running core.
pub trait InterruptFlag {
    fn enabled(&self) -> bool;
    fn disable(&self);
    fn enable(&self);
}

/// Process-wide critical section hooks.
pub trait CriticalSection: Sync {
    fn enter(&self);
    fn leave(&self);
}

static HOOKS: SyncOnceCell<&'static dyn CriticalSection> = SyncOnceCell::new();

/// Installs the hooks used by every [`SpinLock`](crate::SpinLock).
///
/// Returns `false` if hooks were already installed.
pub fn install(hooks: &'static dyn CriticalSection) -> bool {
    HOOKS.set(hooks).is_ok()
}

#[inline]
pub fn enter_critical() {
    if let Some(hooks) = HOOKS.get() {
        hooks.enter();
    }
}

#[inline]
pub fn leave_critical() {
    if let Some(hooks) = HOOKS.get() {
        hooks.leave();
    }
}

/// RAII form of [`enter_critical`]/[`leave_critical`].
#[must_use = "the critical section ends when the guard is dropped"]
pub struct CriticalGuard {
    _private: (),
}

impl CriticalGuard {
    #[inline]
    pub fn new() -> Self {
        enter_critical();
        Self { _private: () }
    }
}

impl Default for CriticalGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CriticalGuard {
    #[inline]
    fn drop(&mut self) {
        leave_critical();
    }
}

/// Nesting counter of one core's critical section.
///
/// Only ever touched by its own core; the atomics make it `Sync` so it can
/// live in a shared per-core table.
pub struct CriticalCounter {
    depth: AtomicU32,
    /// Interrupt flag to restore when the outermost section ends.
    restore: AtomicBool,
}

impl Default for CriticalCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CriticalCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
            restore: AtomicBool::new(false),
        }
    }

    pub fn enter(&self, flag: &impl InterruptFlag) {
        let were_enabled = flag.enabled();
        flag.disable();
        if self.depth.fetch_add(1, Ordering::Relaxed) == 0 {
            self.restore.store(were_enabled, Ordering::Relaxed);
        }
    }

    pub fn leave(&self, flag: &impl InterruptFlag) {
        let prev = self.depth.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "critical section left more often than entered");
        if prev == 1 && self.restore.load(Ordering::Relaxed) {
            flag.enable();
        }
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Whether interrupts will be re-enabled when the outermost section ends.
    #[must_use]
    pub fn restores_interrupts(&self) -> bool {
        self.restore.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[derive(Default)]
    struct FakeFlag {
        enabled: Cell<bool>,
        toggles: Cell<u32>,
    }

    impl InterruptFlag for FakeFlag {
        fn enabled(&self) -> bool {
            self.enabled.get()
        }
        fn disable(&self) {
            self.enabled.set(false);
        }
        fn enable(&self) {
            self.toggles.set(self.toggles.get() + 1);
            self.enabled.set(true);
        }
    }

    #[test]
    fn nested_sections_restore_once() {
        let flag = FakeFlag::default();
        flag.enabled.set(true);
        let counter = CriticalCounter::new();

        counter.enter(&flag);
        counter.enter(&flag);
        assert_eq!(counter.depth(), 2);
        assert!(!flag.enabled());

        counter.leave(&flag);
        assert!(!flag.enabled(), "inner leave must not re-enable");
        counter.leave(&flag);
        assert!(flag.enabled());
        assert_eq!(flag.toggles.get(), 1);
    }

    #[test]
    fn disabled_interrupts_stay_disabled() {
        let flag = FakeFlag::default();
        let counter = CriticalCounter::new();
        counter.enter(&flag);
        counter.leave(&flag);
        assert!(!flag.enabled());
        assert_eq!(flag.toggles.get(), 0);
    }

    #[test]
    #[should_panic(expected = "left more often")]
    fn unbalanced_leave_panics() {
        let flag = FakeFlag::default();
        CriticalCounter::new().leave(&flag);
    }
}
