//! A cell written once, then shared read-only between cores.
//!
//! Holds the kernel's long-lived singletons (memory managers, the machine,
//! per-core descriptor tables). A writer claims the cell with a
//! compare-exchange, so concurrent initializers never both write; readers that
//! lose the race spin until the value is published.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const PUBLISHED: u8 = 2;

pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        (self.state.load(Ordering::Acquire) == PUBLISHED).then(|| unsafe { self.published() })
    }

    /// Stores `value` unless another writer got there first, in which case
    /// the value is handed back.
    pub fn set(&self, value: T) -> Result<(), T> {
        if !self.claim() {
            return Err(value);
        }
        self.publish(value);
        Ok(())
    }

    /// The stored value, running `init` if the cell is still empty. Callers
    /// racing an initializer wait for it.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(value) = self.get() {
            return value;
        }
        if self.claim() {
            return self.publish(init());
        }
        while self.state.load(Ordering::Acquire) != PUBLISHED {
            spin_loop();
        }
        unsafe { self.published() }
    }

    fn claim(&self) -> bool {
        self.state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn publish(&self, value: T) -> &T {
        // SAFETY: only the claiming writer gets here.
        unsafe { (*self.value.get()).write(value) };
        self.state.store(PUBLISHED, Ordering::Release);
        unsafe { self.published() }
    }

    /// # Safety
    /// The state must be `PUBLISHED`.
    unsafe fn published(&self) -> &T {
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == PUBLISHED {
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

// SAFETY: written once by the claiming writer, read-only afterwards.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_once_then_reject() {
        let cell = SyncOnceCell::new();
        assert!(cell.get().is_none());
        assert_eq!(cell.set(1), Ok(()));
        assert_eq!(cell.set(2), Err(2));
        assert_eq!(cell.get(), Some(&1));
    }

    #[test]
    fn racing_initializers_agree() {
        use std::sync::{Arc, Barrier};

        let cell = Arc::new(SyncOnceCell::new());
        let start = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4u32)
            .map(|i| {
                let cell = Arc::clone(&cell);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    *cell.get_or_init(|| i)
                })
            })
            .collect();
        let seen: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(seen.iter().all(|&v| v == seen[0]));
        assert_eq!(cell.get(), Some(&seen[0]));
    }

    #[test]
    fn get_or_init_runs_once() {
        let cell = SyncOnceCell::new();
        let mut calls = 0;
        assert_eq!(
            *cell.get_or_init(|| {
                calls += 1;
                7
            }),
            7
        );
        assert_eq!(*cell.get_or_init(|| 8), 7);
        assert_eq!(calls, 1);
    }
}
