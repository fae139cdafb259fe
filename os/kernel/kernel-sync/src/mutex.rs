use crate::{SpinLock, SyncOnceCell};
use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};

/// Opaque identity of a thread that can be put to sleep by a [`Blocker`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct WaiterToken(pub u64);

/// Scheduler services a contended [`Mutex`] needs to sleep and to wake.
///
/// `wake` may run before the matching `block`; implementations must then let
/// `block` return immediately.
pub trait Blocker: Sync {
    /// The calling thread, or `None` while no scheduler runs on this core.
    fn current_waiter(&self) -> Option<WaiterToken>;

    /// Marks `waiter` as blocked on the mutex identified by `lock`. Runs with
    /// the mutex's internal lock held, so it must not block itself.
    fn prepare_to_block(&self, waiter: WaiterToken, lock: usize);

    /// Sleeps until `waiter` has been woken.
    fn block(&self, waiter: WaiterToken);

    /// Makes `waiter` runnable again.
    fn wake(&self, waiter: WaiterToken);
}

static BLOCKER: SyncOnceCell<&'static dyn Blocker> = SyncOnceCell::new();

/// Switches every [`Mutex`] from spinning to sleeping.
///
/// Returns `false` if a blocker was already installed.
pub fn install_blocker(blocker: &'static dyn Blocker) -> bool {
    let installed = BLOCKER.set(blocker).is_ok();
    if installed {
        log::debug!("mutexes now block through the scheduler");
    }
    installed
}

struct MutexState {
    locked: bool,
    waiters: VecDeque<WaiterToken>,
}

/// Sleeping mutual exclusion lock with FIFO handoff.
///
/// The fast path takes an internal [`SpinLock`]. A contended `lock` either
/// spins (no scheduler yet) or enqueues the caller and sleeps. `unlock`
/// passes ownership to the oldest waiter without ever clearing the lock, so
/// late arrivals cannot overtake queued threads.
pub struct Mutex<T> {
    state: SpinLock<MutexState>,
    cell: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: SpinLock::new(MutexState {
                locked: false,
                waiters: VecDeque::new(),
            }),
            cell: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    fn id(&self) -> usize {
        core::ptr::from_ref(self).addr()
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                return MutexGuard { m: self };
            }

            let sleeper = BLOCKER
                .get()
                .and_then(|b| b.current_waiter().map(|w| (*b, w)));

            let Some((blocker, waiter)) = sleeper else {
                drop(state);
                while self.state.lock().locked {
                    spin_loop();
                }
                continue;
            };

            state.waiters.push_back(waiter);
            blocker.prepare_to_block(waiter, self.id());
            drop(state);

            blocker.block(waiter);

            // unlock() handed the lock over without clearing it.
            debug_assert!(self.state.lock().locked);
            return MutexGuard { m: self };
        }
    }

    /// Takes the lock only if it is free and nobody is queued for it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.locked {
            None
        } else {
            state.locked = true;
            Some(MutexGuard { m: self })
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        match state.waiters.pop_front() {
            Some(next) => {
                drop(state);
                // A waiter only exists if a blocker queued it.
                if let Some(blocker) = BLOCKER.get() {
                    blocker.wake(next);
                }
            }
            None => state.locked = false,
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct MutexGuard<'a, T> {
    m: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.m.cell.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.m.unlock();
    }
}
