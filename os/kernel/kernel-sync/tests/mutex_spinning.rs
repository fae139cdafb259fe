//! Without a blocker every contended lock spins.

use kernel_sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn lock_and_try_lock() {
    let m = Mutex::new(5);
    {
        let mut g = m.lock();
        *g += 1;
        assert!(m.try_lock().is_none());
        assert!(m.is_locked());
    }
    assert!(!m.is_locked());
    assert_eq!(*m.try_lock().unwrap(), 6);
}

#[test]
fn spinning_mutex_is_exclusive() {
    let threads = 6;
    let iters = 2_000;
    let m = Arc::new(Mutex::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let m = Arc::clone(&m);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    let mut g = m.lock();
                    assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0);
                    *g += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
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

#[test]
fn get_mut_bypasses_locking() {
    let mut m = Mutex::new(String::from("a"));
    m.get_mut().push('b');
    assert_eq!(m.lock().as_str(), "ab");
}
