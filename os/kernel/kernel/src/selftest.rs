//! Boot self-tests.
//!
//! Run as kernel threads once every core is online. Each check reports
//! through the log; a failed check panics, which halts the machine.

use kernel_alloc::PmmStats;

/// Buffers allocated by the scattered allocation check.
pub const SCATTER_COUNT: usize = 100;

/// Largest buffer of the scattered allocation check.
pub const SCATTER_MAX: u64 = 64 * 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SelfTestFailure {
    #[error("physical counters moved from {before:?} to {after:?}")]
    CountersChanged { before: PmmStats, after: PmmStats },
    #[error("{regions} kernel regions left behind")]
    RegionsLeaked { regions: usize },
    #[error("buffer at {address:#010x} did not keep its contents")]
    Corrupted { address: u32 },
    #[error("placement at {address:#010x} succeeded on a covered address")]
    PlacedOverRegion { address: u32 },
    #[error("mapping of {address:#010x} changed under a failed placement")]
    MappingMoved { address: u32 },
    #[error("waiter saw {seen} instead of the holder's {expected}")]
    OutOfOrder { expected: u32, seen: u32 },
    #[error("idle thread of cpu{core} woke {wakeups} times next to a runnable thread")]
    IdleRan { core: usize, wakeups: u64 },
    #[error("{0} did not finish in time")]
    TimedOut(&'static str),
}

/// Linear congruential generator, good enough to shuffle sizes.
#[derive(Debug, Clone)]
pub struct Lcg(u32);

impl Lcg {
    #[must_use]
    pub const fn new(seed: u32) -> Self {
        Self(seed)
    }

    pub const fn next_u32(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.0
    }
}

impl Iterator for Lcg {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        Some(self.next_u32())
    }
}

/// Buffer sizes in `1..=SCATTER_MAX`, mixing sub-page and multi-page
/// requests.
pub fn scatter_sizes(seed: u32) -> impl Iterator<Item = u64> {
    Lcg::new(seed)
        .take(SCATTER_COUNT)
        .map(|r| u64::from(r >> 8) % SCATTER_MAX + 1)
}

/// Freeing everything must restore the counters exactly.
///
/// # Errors
/// [`SelfTestFailure::CountersChanged`] if they differ.
pub fn unchanged(before: PmmStats, after: PmmStats) -> Result<(), SelfTestFailure> {
    if before == after {
        Ok(())
    } else {
        Err(SelfTestFailure::CountersChanged { before, after })
    }
}

#[cfg(target_arch = "x86")]
pub use hw::spawn;

#[cfg(target_arch = "x86")]
mod hw {
    use super::{SelfTestFailure, scatter_sizes, unchanged};
    use crate::memory::{pmm, vmm};
    use crate::smp::{idle_wakeups, machine};
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
    use kernel_alloc::{AllocationTarget, MemoryRegion};
    use kernel_cpu::{Processor, Smp};
    use kernel_info::memory::PAGE_SIZE;
    use kernel_memory_addresses::VirtualAddress;
    use kernel_sync::Mutex;
    use kernel_vmem::MappingConfig;

    const PAGE: u64 = PAGE_SIZE as u64;

    /// Upper bound for threads the supervisor waits on.
    const WAIT_LIMIT_MS: u64 = 2_000;

    /// How long the holder keeps the mutex.
    const HOLD_MS: u64 = 50;

    /// How long the busy thread keeps its core.
    const BUSY_MS: u64 = 100;

    static HANDOVER: Mutex<u32> = Mutex::new(0);
    static HOLDER_LOCKED: AtomicBool = AtomicBool::new(false);
    static WAITER_SAW: AtomicU32 = AtomicU32::new(u32::MAX);

    static BUSY_CORE: AtomicUsize = AtomicUsize::new(usize::MAX);
    static BUSY_IDLE_WAKEUPS: AtomicU64 = AtomicU64::new(u64::MAX);

    fn processor() -> &'static Processor {
        match machine() {
            Some(smp) => smp.current(),
            None => panic!("selftest: no machine"),
        }
    }

    fn smp() -> &'static Smp {
        match machine() {
            Some(smp) => smp,
            None => panic!("selftest: no machine"),
        }
    }

    /// Starts the supervisor thread on the calling core.
    pub fn spawn(processor: &Processor) {
        let thread = processor.create_kernel_thread("selftest", supervisor);
        processor.start_thread(thread);
    }

    extern "C" fn supervisor() -> ! {
        let checks: [(&str, fn() -> Result<(), SelfTestFailure>); 5] = [
            ("kernel buffer", kernel_buffer),
            ("scattered buffers", scattered_buffers),
            ("mutex hand-over", mutex_handover),
            ("idle stays off", idle_stays_off),
            ("covered placement", covered_placement),
        ];
        for (name, check) in checks {
            match check() {
                Ok(()) => log::info!("selftest: {name} ok"),
                Err(err) => {
                    log::error!("selftest: {name} failed: {err}");
                    panic!("selftest {name} failed: {err}");
                }
            }
        }
        log::info!("selftest: all {} checks passed", checks.len());
        processor().exit_current()
    }

    /// Sleeps until `done` holds or the wait limit passes.
    fn wait_until(what: &'static str, done: impl Fn() -> bool) -> Result<(), SelfTestFailure> {
        let processor = processor();
        let deadline = processor.now() + WAIT_LIMIT_MS;
        while !done() {
            if processor.now() >= deadline {
                return Err(SelfTestFailure::TimedOut(what));
            }
            processor.sleep(u64::from(kernel_cpu::SMALLEST_INTERVAL_MS));
        }
        Ok(())
    }

    fn kernel_buffer() -> Result<(), SelfTestFailure> {
        let before = pmm().stats();
        let region = vmm().allocate_region(AllocationTarget::Kernel, 0x500, MappingConfig::kernel_data());
        let bytes: *mut u8 = region.as_mut_ptr();
        let intact = unsafe {
            bytes.write_volatile(0xA5);
            bytes.add(0x4FF).write_volatile(0x5A);
            bytes.read_volatile() == 0xA5 && bytes.add(0x4FF).read_volatile() == 0x5A
        };
        vmm().free(AllocationTarget::Kernel, &region);

        if !intact {
            return Err(SelfTestFailure::Corrupted {
                address: region.address().as_u32(),
            });
        }
        unchanged(before, pmm().stats())
    }

    fn scattered_buffers() -> Result<(), SelfTestFailure> {
        let before = pmm().stats();
        let regions_before = vmm().stats(None).kernel_regions;

        let regions: Vec<MemoryRegion> = scatter_sizes(0x5EED_1234)
            .map(|size| {
                let region = vmm().allocate_region(AllocationTarget::Kernel, size, MappingConfig::kernel_data());
                unsafe { region.as_mut_ptr::<u32>().write_volatile(region.address().as_u32()) };
                region
            })
            .collect();

        for region in &regions {
            let stored = unsafe { region.as_mut_ptr::<u32>().read_volatile() };
            if stored != region.address().as_u32() {
                return Err(SelfTestFailure::Corrupted { address: stored });
            }
        }

        // Odd ones first so neighbours merge out of order.
        for region in regions.iter().skip(1).step_by(2) {
            vmm().free(AllocationTarget::Kernel, region);
        }
        for region in regions.iter().step_by(2) {
            vmm().free(AllocationTarget::Kernel, region);
        }

        let regions_after = vmm().stats(None).kernel_regions;
        if regions_after != regions_before {
            return Err(SelfTestFailure::RegionsLeaked {
                regions: regions_after - regions_before,
            });
        }
        unchanged(before, pmm().stats())
    }

    extern "C" fn holder() -> ! {
        let processor = processor();
        {
            let mut value = HANDOVER.lock();
            HOLDER_LOCKED.store(true, Ordering::Release);
            processor.sleep(HOLD_MS);
            *value = 1;
        }
        processor.exit_current()
    }

    extern "C" fn waiter() -> ! {
        let processor = processor();
        while !HOLDER_LOCKED.load(Ordering::Acquire) {
            processor.sleep(1);
        }
        let seen = *HANDOVER.lock();
        WAITER_SAW.store(seen, Ordering::Release);
        processor.exit_current()
    }

    fn mutex_handover() -> Result<(), SelfTestFailure> {
        let smp = smp();
        let processor = processor();
        smp.start_thread(processor.create_kernel_thread("holder", holder));
        smp.start_thread(processor.create_kernel_thread("waiter", waiter));

        wait_until("mutex waiter", || WAITER_SAW.load(Ordering::Acquire) != u32::MAX)?;
        match WAITER_SAW.load(Ordering::Acquire) {
            1 => Ok(()),
            seen => Err(SelfTestFailure::OutOfOrder { expected: 1, seen }),
        }
    }

    extern "C" fn busy() -> ! {
        let processor = processor();
        let core = processor.index();
        let start = idle_wakeups(core);
        let deadline = processor.now() + BUSY_MS;
        while processor.now() < deadline {
            core::hint::spin_loop();
        }
        BUSY_IDLE_WAKEUPS.store(idle_wakeups(core) - start, Ordering::Release);
        BUSY_CORE.store(core, Ordering::Release);
        processor.exit_current()
    }

    fn idle_stays_off() -> Result<(), SelfTestFailure> {
        let smp = smp();
        smp.start_thread(processor().create_kernel_thread("busy", busy));

        wait_until("busy thread", || BUSY_CORE.load(Ordering::Acquire) != usize::MAX)?;
        match BUSY_IDLE_WAKEUPS.load(Ordering::Acquire) {
            0 => Ok(()),
            wakeups => Err(SelfTestFailure::IdleRan {
                core: BUSY_CORE.load(Ordering::Acquire),
                wakeups,
            }),
        }
    }

    fn covered_placement() -> Result<(), SelfTestFailure> {
        let vmm = vmm();
        let region = vmm.allocate_region(AllocationTarget::Kernel, 2 * PAGE, MappingConfig::kernel_data());
        let inside = region.address().as_u32() + PAGE_SIZE;
        let va = VirtualAddress::new(inside);

        let mapped = vmm.as_physical(AllocationTarget::Kernel, va);
        let clash = vmm.allocate_region_at(AllocationTarget::Kernel, inside, PAGE, MappingConfig::kernel_data());
        let still_mapped = vmm.as_physical(AllocationTarget::Kernel, va);
        vmm.free(AllocationTarget::Kernel, &region);

        if clash.present {
            return Err(SelfTestFailure::PlacedOverRegion { address: inside });
        }
        if mapped != still_mapped {
            return Err(SelfTestFailure::MappingMoved { address: inside });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_bounded_and_mixed() {
        let sizes: Vec<u64> = scatter_sizes(0x5EED_1234).collect();
        assert_eq!(sizes.len(), SCATTER_COUNT);
        assert!(sizes.iter().all(|&s| (1..=SCATTER_MAX).contains(&s)));
        assert!(sizes.iter().any(|&s| s < 4096));
        assert!(sizes.iter().any(|&s| s > 4096));
    }

    #[test]
    fn sizes_repeat_for_a_seed() {
        assert!(scatter_sizes(7).eq(scatter_sizes(7)));
        assert!(!scatter_sizes(7).eq(scatter_sizes(8)));
    }

    #[test]
    fn counter_mismatch_is_reported() {
        let before = PmmStats {
            used: 0,
            free: 8192,
            explicitly_used: 0,
            total: 8192,
        };
        let after = PmmStats { used: 4096, free: 4096, ..before };
        assert_eq!(unchanged(before, before), Ok(()));
        assert_eq!(
            unchanged(before, after),
            Err(SelfTestFailure::CountersChanged { before, after })
        );
    }
}
