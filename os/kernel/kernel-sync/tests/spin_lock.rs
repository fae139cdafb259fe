use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_writes_are_visible_to_the_next_holder() {
    let frames = SpinLock::new([0u8; 4]);
    frames.lock()[2] = 0xFF;
    assert_eq!(*frames.lock(), [0, 0, 0xFF, 0]);
}

#[test]
fn try_lock_fails_from_another_thread_while_held() {
    let lock = Arc::new(SpinLock::new(7u32));
    let guard = lock.lock();

    let other = Arc::clone(&lock);
    let observed = thread::spawn(move || other.try_lock().map(|g| *g)).join().unwrap();
    assert_eq!(observed, None);

    drop(guard);
    let other = Arc::clone(&lock);
    let observed = thread::spawn(move || other.try_lock().map(|g| *g)).join().unwrap();
    assert_eq!(observed, Some(7));
}

#[test]
fn with_lock_returns_the_closure_result() {
    let free_list = SpinLock::new(vec![0x1000u32, 0x2000, 0x3000]);
    let taken = free_list.with_lock(Vec::pop);
    assert_eq!(taken, Some(0x3000));
    assert_eq!(free_list.with_lock(|list| list.len()), 2);
    assert!(!free_list.is_locked());
}

#[test]
fn exclusive_access_without_locking() {
    let mut counters = SpinLock::new((0u64, 0u64));
    counters.get_mut().0 = 4096;
    let (used, free) = counters.into_inner();
    assert_eq!((used, free), (4096, 0));
}

/// Many cores allocating and freeing against one bitmap: every bit handed
/// out is unique and the bitmap ends empty.
#[test]
fn concurrent_bitmap_allocation_is_exclusive() {
    const CORES: usize = 6;
    const ROUNDS: usize = 2_000;

    let bitmap = Arc::new(SpinLock::new(0u64));
    let inside = Arc::new(AtomicBool::new(false));
    let handed_out = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(CORES));

    let handles: Vec<_> = (0..CORES)
        .map(|_| {
            let bitmap = Arc::clone(&bitmap);
            let inside = Arc::clone(&inside);
            let handed_out = Arc::clone(&handed_out);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..ROUNDS {
                    let bit = bitmap.with_lock(|map| {
                        assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                        let bit = (!*map).trailing_zeros();
                        assert!(bit < 64, "bitmap full");
                        *map |= 1 << bit;
                        inside.store(false, Ordering::SeqCst);
                        bit
                    });
                    handed_out.fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                    bitmap.with_lock(|map| {
                        assert!(*map & (1 << bit) != 0, "bit {bit} freed twice");
                        *map &= !(1 << bit);
                    });
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*bitmap.lock(), 0);
    assert_eq!(handed_out.load(Ordering::Relaxed), CORES * ROUNDS);
}

#[test]
fn panicking_holder_releases_the_lock() {
    let lock = SpinLock::new(0u32);
    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let mut guard = lock.lock();
        *guard = 99;
        panic!("holder died");
    }));
    assert!(result.is_err());
    assert!(!lock.is_locked());
    assert_eq!(lock.with_lock(|v| *v), 99);
}

#[test]
fn locks_can_be_stored_in_statics() {
    static TICKS: SpinLock<u64> = SpinLock::new(0);
    TICKS.with_lock(|t| *t += 10);
    assert!(TICKS.with_lock(|t| *t) >= 10);
}
