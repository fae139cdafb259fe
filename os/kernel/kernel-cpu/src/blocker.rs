//! Puts contended [`kernel_sync::Mutex`] callers to sleep in the scheduler.

use crate::smp::Smp;
use crate::thread::{ThreadId, ThreadState};
use kernel_sync::{Blocker, WaiterToken};

/// A waiter is identified by its core and thread id: `core << 32 | id`.
pub struct SchedulerBlocker {
    smp: &'static Smp,
}

impl SchedulerBlocker {
    #[must_use]
    pub const fn new(smp: &'static Smp) -> Self {
        Self { smp }
    }

    #[must_use]
    pub fn token(core: usize, thread: ThreadId) -> WaiterToken {
        WaiterToken(((core as u64) << 32) | u64::from(thread.0))
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn split(token: WaiterToken) -> (usize, ThreadId) {
        ((token.0 >> 32) as usize, ThreadId(token.0 as u32))
    }
}

impl Blocker for SchedulerBlocker {
    /// `None` for the idle thread and inside interrupt handlers; those spin.
    fn current_waiter(&self) -> Option<WaiterToken> {
        let processor = self.smp.current();
        if processor.in_interrupt() {
            return None;
        }
        let current = processor.scheduler().current();
        current.map(|id| Self::token(processor.index(), id))
    }

    fn prepare_to_block(&self, waiter: WaiterToken, lock: usize) {
        let (core, id) = Self::split(waiter);
        let processor = self.smp.current();
        assert_eq!(core, processor.index(), "thread {id} blocks on a foreign core");
        let blocked = processor.scheduler().block_current(lock);
        assert_eq!(blocked, Some(id), "blocking thread {id} is not current");
        log::trace!("cpu{core}: thread {id} blocks on {lock:#x}");
    }

    fn block(&self, waiter: WaiterToken) {
        let (core, id) = Self::split(waiter);
        let Some(processor) = self.smp.processor(core) else {
            panic!("waiter on unknown core {core}");
        };
        while processor.scheduler().state(id) == Some(ThreadState::Blocked) {
            processor.platform().wait_for_interrupt();
        }
    }

    fn wake(&self, waiter: WaiterToken) {
        let (core, id) = Self::split(waiter);
        self.smp.wake_thread(core, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Processor;
    use crate::registers::InterruptFrame;
    use crate::testing::SimPlatform;
    use alloc::sync::Arc;
    use crate::interrupt::InterruptController;
    use kernel_sync::Mutex;
    use std::sync::Barrier;
    use std::time::Duration;

    extern "C" fn idle() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    struct NoEoi;

    impl InterruptController for NoEoi {
        fn end_of_interrupt(&self, _vector: u8) {}
    }

    #[test]
    fn tokens_round_trip() {
        let token = SchedulerBlocker::token(3, ThreadId(77));
        assert_eq!(token, WaiterToken((3 << 32) | 77));
        assert_eq!(SchedulerBlocker::split(token), (3, ThreadId(77)));
    }

    /// Two cores, one thread each, contending for one mutex. The waiter
    /// sleeps in the scheduler until the owner's unlock wakes it by IPI.
    #[test]
    fn contended_mutex_sleeps_until_unlock() {
        let platform = SimPlatform::leak(2);
        let smp: &'static Smp = Box::leak(Box::new(Smp::new(
            platform,
            2,
            kernel_memory_addresses::PhysicalAddress::new(0x1000),
            idle,
        )));
        let lapic: Arc<dyn InterruptController> = Arc::new(NoEoi);
        for p in smp.processors() {
            p.install_core_handlers(&lapic);
            p.start_thread(p.create_kernel_thread("worker", idle));
            let frame = InterruptFrame::default();
            assert!(p.scheduler().tick(platform, &frame, 10).is_some());
        }
        platform.set_interrupt_sink(move |core, vector| {
            let mut frame = InterruptFrame {
                vector: u32::from(vector),
                ..InterruptFrame::default()
            };
            smp.processor(core).unwrap().handle_interrupt(&mut frame);
        });
        assert!(kernel_sync::install_blocker(Box::leak(Box::new(
            SchedulerBlocker::new(smp)
        ))));

        let mutex = Arc::new(Mutex::new(Vec::new()));
        let held = Arc::new(Barrier::new(2));

        let owner = {
            let (mutex, held) = (mutex.clone(), held.clone());
            std::thread::spawn(move || {
                SimPlatform::set_current_core(0);
                let mut guard = mutex.lock();
                held.wait();
                std::thread::sleep(Duration::from_millis(50));
                guard.push("owner");
            })
        };
        let waiter = {
            let mutex = mutex.clone();
            std::thread::spawn(move || {
                SimPlatform::set_current_core(1);
                held.wait();
                let mut guard = mutex.lock();
                guard.push("waiter");
                let p: &Processor = smp.processor(1).unwrap();
                let current = p.scheduler().current().unwrap();
                assert_eq!(p.scheduler().state(current), Some(ThreadState::Running));
            })
        };
        owner.join().unwrap();
        waiter.join().unwrap();

        assert_eq!(*mutex.lock(), ["owner", "waiter"]);
        assert_eq!(mutex.waiter_count(), 0);
    }
}
