use kernel_sync::critical::{self, CriticalSection};
use kernel_sync::{CriticalGuard, SpinLock};
use std::cell::Cell;
use std::sync::Once;

thread_local! {
    static DEPTH: Cell<i32> = const { Cell::new(0) };
    static ENTERED: Cell<u32> = const { Cell::new(0) };
}

struct ThreadLocalHooks;

impl CriticalSection for ThreadLocalHooks {
    fn enter(&self) {
        DEPTH.with(|d| d.set(d.get() + 1));
        ENTERED.with(|e| e.set(e.get() + 1));
    }

    fn leave(&self) {
        DEPTH.with(|d| {
            assert!(d.get() > 0, "unbalanced leave");
            d.set(d.get() - 1);
        });
    }
}

static HOOKS: ThreadLocalHooks = ThreadLocalHooks;
static INSTALL: Once = Once::new();

fn install() {
    INSTALL.call_once(|| assert!(critical::install(&HOOKS)));
}

fn depth() -> i32 {
    DEPTH.with(Cell::get)
}

#[test]
fn second_install_is_rejected() {
    install();
    assert!(!critical::install(&HOOKS));
}

#[test]
fn guard_holds_critical_section() {
    install();
    let l = SpinLock::new(0u32);
    {
        let _g = l.lock();
        assert_eq!(depth(), 1);
        let _inner = CriticalGuard::new();
        assert_eq!(depth(), 2);
    }
    assert_eq!(depth(), 0);
}

#[test]
fn failed_try_lock_leaves_section() {
    install();
    let l = SpinLock::new(());
    let g = l.lock();
    assert!(l.try_lock().is_none());
    assert_eq!(depth(), 1);
    drop(g);
    assert_eq!(depth(), 0);
}

#[test]
fn contended_lock_does_not_leak_sections() {
    use std::sync::Arc;
    use std::thread;

    install();
    let l = Arc::new(SpinLock::new(0u32));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let l = Arc::clone(&l);
            thread::spawn(move || {
                for _ in 0..1_000 {
                    *l.lock() += 1;
                }
                assert_eq!(depth(), 0);
                assert!(ENTERED.with(Cell::get) >= 1_000);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*l.lock(), 4_000);
}
