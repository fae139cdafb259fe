//! With a blocker installed, contended lockers sleep and are handed the lock
//! in arrival order.

use kernel_sync::{Blocker, Mutex, WaiterToken, install_blocker};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Once};
use std::thread::{self, Thread};
use std::time::Duration;

struct Sleeper {
    thread: Thread,
    woken: Arc<AtomicBool>,
}

#[derive(Default)]
struct ParkingBlocker {
    next_id: AtomicU64,
    sleepers: std::sync::Mutex<HashMap<u64, Sleeper>>,
}

thread_local! {
    static ID: Cell<Option<u64>> = const { Cell::new(None) };
}

impl ParkingBlocker {
    fn woken(&self, waiter: WaiterToken) -> Arc<AtomicBool> {
        let sleepers = self.sleepers.lock().unwrap();
        Arc::clone(&sleepers[&waiter.0].woken)
    }
}

impl Blocker for ParkingBlocker {
    fn current_waiter(&self) -> Option<WaiterToken> {
        let id = ID.with(|id| {
            if let Some(v) = id.get() {
                return v;
            }
            let v = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.sleepers.lock().unwrap().insert(
                v,
                Sleeper {
                    thread: thread::current(),
                    woken: Arc::new(AtomicBool::new(false)),
                },
            );
            id.set(Some(v));
            v
        });
        Some(WaiterToken(id))
    }

    fn prepare_to_block(&self, waiter: WaiterToken, _lock: usize) {
        self.woken(waiter).store(false, Ordering::SeqCst);
    }

    fn block(&self, waiter: WaiterToken) {
        let woken = self.woken(waiter);
        while !woken.load(Ordering::SeqCst) {
            thread::park();
        }
    }

    fn wake(&self, waiter: WaiterToken) {
        let sleepers = self.sleepers.lock().unwrap();
        let sleeper = &sleepers[&waiter.0];
        sleeper.woken.store(true, Ordering::SeqCst);
        sleeper.thread.unpark();
    }
}

static BLOCKER: LazyLock<ParkingBlocker> = LazyLock::new(ParkingBlocker::default);
static INSTALL: Once = Once::new();

fn install() {
    INSTALL.call_once(|| assert!(install_blocker(&*BLOCKER)));
}

fn wait_for_waiters(m: &Mutex<impl Sized>, n: usize) {
    while m.waiter_count() < n {
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn contender_waits_for_unlock() {
    install();
    let m = Arc::new(Mutex::new(0u32));
    let guard = m.lock();

    let b = {
        let m = Arc::clone(&m);
        thread::spawn(move || {
            let g = m.lock();
            *g
        })
    };

    wait_for_waiters(&m, 1);
    let mut guard = guard;
    *guard = 41;
    *guard += 1;
    drop(guard);

    assert_eq!(b.join().unwrap(), 42);
    assert!(!m.is_locked());
}

#[test]
fn handoff_is_fifo() {
    install();
    let m = Arc::new(Mutex::new(Vec::new()));
    let guard = m.lock();

    let mut handles = Vec::new();
    for i in 0..5 {
        let m2 = Arc::clone(&m);
        handles.push(thread::spawn(move || m2.lock().push(i)));
        wait_for_waiters(&m, i + 1);
    }

    drop(guard);
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*m.lock(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn try_lock_does_not_steal_from_waiters() {
    install();
    let m = Arc::new(Mutex::new(()));
    let guard = m.lock();
    let h = {
        let m = Arc::clone(&m);
        thread::spawn(move || {
            let _g = m.lock();
            thread::sleep(Duration::from_millis(200));
        })
    };
    wait_for_waiters(&m, 1);
    drop(guard);

    // Ownership went straight to the waiter; the lock never looked free.
    assert!(m.is_locked());
    assert!(m.try_lock().is_none());
    h.join().unwrap();
    assert!(m.try_lock().is_some());
}

#[test]
fn all_waiters_make_progress() {
    install();
    let threads = 8;
    let iters = 200;
    let m = Arc::new(Mutex::new(0usize));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                for _ in 0..iters {
                    *m.lock() += 1;
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(*m.lock(), threads * iters);
    assert_eq!(m.waiter_count(), 0);
}
