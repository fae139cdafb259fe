//! # Multiprocessor bring-up
//!
//! The bootstrap processor (BSP) starts every other core through a real-mode
//! trampoline copied to [`SMP_TRAMPOLINE`]:
//!
//! ```text
//! BSP                                   AP
//! reserve frame, copy trampoline
//! patch cr3s + stack tops
//! INIT, SIPI, SIPI  ───────────────►   16-bit: lgdt, PE
//!                                       32-bit: PSE, boot cr3, PG
//!                                       take a stack ticket
//!                                       ap_entry: kernel cr3
//! wait for check-ins  ◄───────────────  BootSync::check_in
//! build Smp, install hooks
//! release  ───────────────────────────► GDT/TSS, IDT, APIC, handlers
//!                                       start scheduling, idle
//! ```
//!
//! The trampoline runs on the boot page directory: it maps the low frames
//! twice, so execution continues at the physical trampoline address after
//! paging is on. The jump to `ap_entry` then switches to the kernel
//! directory, which keeps the kernel half but not the identity map.

use crate::gdt::CoreTables;
use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use kernel_alloc::PhysicalMemoryManager;
use kernel_cpu::{BootSync, SchedulerBlocker, Smp};
use kernel_info::memory::{PAGE_SIZE, SMP_TRAMPOLINE};
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::SyncOnceCell;
use kernel_sync::critical::CriticalSection;
use kernel_vmem::PhysicalConstraints;

/// Cores the kernel is willing to run on.
pub const MAX_CORES: usize = 16;

static SMP: SyncOnceCell<Smp> = SyncOnceCell::new();
static BLOCKER: SyncOnceCell<SchedulerBlocker> = SyncOnceCell::new();
static CORE_TABLES: [SyncOnceCell<&'static CoreTables>; MAX_CORES] =
    [const { SyncOnceCell::new() }; MAX_CORES];

static BOOT_SYNC: BootSync = BootSync::new();

/// Physical frame holding the trampoline, `0` if none could be reserved.
static TRAMPOLINE_FRAME: AtomicU32 = AtomicU32::new(0);

/// Cores that finished bring-up and run their scheduler.
static CORES_ONLINE: AtomicUsize = AtomicUsize::new(0);

/// How often each core's idle thread woke up.
static IDLE_WAKEUPS: [AtomicU64; MAX_CORES] = [const { AtomicU64::new(0) }; MAX_CORES];

/// The machine, once [`start`] has built it.
#[must_use]
pub fn machine() -> Option<&'static Smp> {
    SMP.get()
}

/// GDT and TSS of core `index`.
///
/// # Panics
/// If the core has not installed its tables.
#[must_use]
pub fn core_tables(index: usize) -> &'static CoreTables {
    match CORE_TABLES.get(index).and_then(SyncOnceCell::get) {
        Some(tables) => tables,
        None => panic!("core {index} has no descriptor tables"),
    }
}

/// Number of cores with a running scheduler.
#[must_use]
pub fn cores_online() -> usize {
    CORES_ONLINE.load(Ordering::Acquire)
}

/// Wake-ups of the idle thread of core `index` so far.
#[must_use]
pub fn idle_wakeups(index: usize) -> u64 {
    IDLE_WAKEUPS.get(index).map_or(0, |count| count.load(Ordering::Relaxed))
}

fn count_idle_wakeup(index: usize) {
    if let Some(count) = IDLE_WAKEUPS.get(index) {
        count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Application processors worth waking when CPUID reports `reported`
/// logical processors.
#[must_use]
pub const fn expected_application_processors(reported: usize) -> usize {
    let cores = if reported == 0 { 1 } else { reported };
    let cores = if cores > MAX_CORES { MAX_CORES } else { cores };
    cores - 1
}

/// The range the trampoline frame must come from: exactly the frame at
/// [`SMP_TRAMPOLINE`], since the SIPI vector names it.
#[must_use]
pub const fn trampoline_constraints() -> PhysicalConstraints {
    PhysicalConstraints {
        min_address: SMP_TRAMPOLINE,
        max_address: SMP_TRAMPOLINE + PAGE_SIZE - 1,
        boundary: 0,
    }
}

/// Claims the trampoline frame before anything else can take it. Without it
/// the kernel runs on the bootstrap processor only.
pub fn reserve_trampoline(pmm: &PhysicalMemoryManager) {
    match pmm.try_alloc(u64::from(PAGE_SIZE), &trampoline_constraints()) {
        Ok(frame) => {
            TRAMPOLINE_FRAME.store(frame.as_u32(), Ordering::Release);
            log::debug!("smp: trampoline frame {frame} reserved");
        }
        Err(err) => {
            log::warn!("smp: no trampoline frame ({err}); application processors stay parked");
        }
    }
}

/// Returns the trampoline frame once every AP has left it.
fn release_trampoline(pmm: &PhysicalMemoryManager) {
    let frame = TRAMPOLINE_FRAME.swap(0, Ordering::AcqRel);
    if frame != 0 {
        pmm.free(PhysicalAddress::new(frame), u64::from(PAGE_SIZE));
        log::debug!("smp: trampoline frame released");
    }
}

/// Binds the spinlock critical sections to the running core.
struct CoreCriticalSection;

impl CriticalSection for CoreCriticalSection {
    fn enter(&self) {
        if let Some(smp) = machine() {
            smp.current().enter_critical();
        }
    }

    fn leave(&self) {
        if let Some(smp) = machine() {
            smp.current().leave_critical();
        }
    }
}

static CRITICAL: CoreCriticalSection = CoreCriticalSection;

/// Publishes `smp` and installs the process-wide synchronization hooks.
fn publish(smp: Smp) -> &'static Smp {
    if SMP.set(smp).is_err() {
        panic!("smp: machine built twice");
    }
    let Some(smp) = machine() else {
        unreachable!("machine was just published");
    };
    if !kernel_sync::critical::install(&CRITICAL) {
        log::warn!("smp: critical section hooks were already installed");
    }
    if BLOCKER.set(SchedulerBlocker::new(smp)).is_ok()
        && let Some(blocker) = BLOCKER.get()
    {
        kernel_sync::install_blocker(blocker);
    }
    smp
}

/// Allocates the GDT and TSS of core `index` and keeps them forever.
fn leak_core_tables(index: usize) -> &'static CoreTables {
    let tables: &'static CoreTables = Box::leak(CoreTables::new());
    match CORE_TABLES.get(index).map(|slot| slot.set(tables)) {
        Some(Ok(())) => tables,
        Some(Err(_)) => panic!("core {index} installed its tables twice"),
        None => panic!("core {index} exceeds {MAX_CORES} cores"),
    }
}

#[cfg(target_arch = "x86")]
pub use hw::{bring_online, install_core_tables, start};

#[cfg(target_arch = "x86")]
mod hw {
    use super::{
        BOOT_SYNC, CORES_ONLINE, MAX_CORES, TRAMPOLINE_FRAME, count_idle_wakeup,
        expected_application_processors, leak_core_tables, machine, publish, release_trampoline,
    };
    use crate::apic::{self, Lapic};
    use crate::boot::boot_directory_phys;
    use crate::cpuid::Leaf01h;
    use crate::gdt::CoreTables;
    use crate::memory::KernelVmm;
    use crate::platform::PLATFORM;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use core::sync::atomic::Ordering;
    use kernel_alloc::PhysicalMemoryManager;
    use kernel_cpu::{
        InterruptController, KernelStack, Platform, Processor, Smp, SmpError, TrampolineImage,
    };
    use kernel_info::memory::{KERNEL_STACK_SIZE, PAGE_SIZE, SMP_TRAMPOLINE, physical_to_direct_map};

    /// Slots in the trampoline's stack array.
    const AP_STACKS: usize = MAX_CORES - 1;

    /// How long the BSP waits for the APs to check in.
    const CHECK_IN_WAIT_MS: u32 = 200;

    /// Spin rounds between two millisecond sleeps while waiting.
    const CHECK_IN_SPINS: u64 = 1_000;

    core::arch::global_asm!(
        ".pushsection .text.smp_trampoline, \"ax\"",
        ".balign 16",
        ".global smp_trampoline_start",
        "smp_trampoline_start:",
        ".code16",
        "    cli",
        "    cld",
        "    xorw %ax, %ax",
        "    movw %ax, %ds",
        "    lgdtl smp_trampoline_gdtr_addr",
        "    movl %cr0, %eax",
        "    orl $1, %eax",
        "    movl %eax, %cr0",
        "    ljmpl ${code}, $smp_trampoline_protected_addr",
        ".code32",
        "smp_trampoline_protected:",
        "    movw ${data}, %ax",
        "    movw %ax, %ds",
        "    movw %ax, %es",
        "    movw %ax, %fs",
        "    movw %ax, %gs",
        "    movw %ax, %ss",
        // 4 MiB pages, as used by the boot directory
        "    movl %cr4, %eax",
        "    orl $0x10, %eax",
        "    movl %eax, %cr4",
        "    movl smp_trampoline_boot_cr3_addr, %eax",
        "    movl %eax, %cr3",
        "    movl %cr0, %eax",
        "    orl $0x80000000, %eax",
        "    movl %eax, %cr0",
        // One stack per ticket; surplus cores park.
        "    movl $1, %eax",
        "    lock xaddl %eax, smp_trampoline_ticket_addr",
        "    cmpl smp_trampoline_stack_count_addr, %eax",
        "    jae 2f",
        "    shll $2, %eax",
        "    addl $smp_trampoline_stacks_addr, %eax",
        "    movl (%eax), %esp",
        "    movl smp_trampoline_kernel_cr3_addr, %ebx",
        "    movl ${entry}, %ecx",
        "    jmp *%ecx",
        "2:",
        "    cli",
        "    hlt",
        "    jmp 2b",
        "",
        ".balign 8",
        "smp_trampoline_gdt:",
        "    .quad 0",
        "    .quad 0x00CF9A000000FFFF",
        "    .quad 0x00CF92000000FFFF",
        "smp_trampoline_gdtr:",
        "    .word 23",
        "    .long smp_trampoline_gdt_addr",
        ".balign 4",
        ".global smp_trampoline_boot_cr3",
        "smp_trampoline_boot_cr3:",
        "    .long 0",
        ".global smp_trampoline_kernel_cr3",
        "smp_trampoline_kernel_cr3:",
        "    .long 0",
        ".global smp_trampoline_ticket",
        "smp_trampoline_ticket:",
        "    .long 0",
        ".global smp_trampoline_stack_count",
        "smp_trampoline_stack_count:",
        "    .long 0",
        ".global smp_trampoline_stacks",
        "smp_trampoline_stacks:",
        "    .fill {stacks}, 4, 0",
        ".global smp_trampoline_end",
        "smp_trampoline_end:",
        "",
        // Addresses of the copy at SMP_TRAMPOLINE.
        ".set smp_trampoline_gdt_addr, {base} + smp_trampoline_gdt - smp_trampoline_start",
        ".set smp_trampoline_gdtr_addr, {base} + smp_trampoline_gdtr - smp_trampoline_start",
        ".set smp_trampoline_protected_addr, {base} + smp_trampoline_protected - smp_trampoline_start",
        ".set smp_trampoline_boot_cr3_addr, {base} + smp_trampoline_boot_cr3 - smp_trampoline_start",
        ".set smp_trampoline_kernel_cr3_addr, {base} + smp_trampoline_kernel_cr3 - smp_trampoline_start",
        ".set smp_trampoline_ticket_addr, {base} + smp_trampoline_ticket - smp_trampoline_start",
        ".set smp_trampoline_stack_count_addr, {base} + smp_trampoline_stack_count - smp_trampoline_start",
        ".set smp_trampoline_stacks_addr, {base} + smp_trampoline_stacks - smp_trampoline_start",
        ".popsection",
        base = const SMP_TRAMPOLINE,
        code = const kernel_cpu::registers::KERNEL_CODE_SELECTOR,
        data = const kernel_cpu::registers::KERNEL_DATA_SELECTOR,
        stacks = const AP_STACKS,
        entry = sym ap_entry,
        options(att_syntax)
    );

    unsafe extern "C" {
        static smp_trampoline_start: u8;
        static smp_trampoline_end: u8;
        static smp_trampoline_boot_cr3: u8;
        static smp_trampoline_kernel_cr3: u8;
        static smp_trampoline_stack_count: u8;
        static smp_trampoline_stacks: u8;
    }

    /// The trampoline as linked, and offsets of its patchable variables.
    struct TrampolineLayout {
        code: &'static [u8],
        boot_cr3: usize,
        kernel_cr3: usize,
        stack_count: usize,
        stacks: usize,
    }

    impl TrampolineLayout {
        fn linked() -> Self {
            let start = (&raw const smp_trampoline_start).addr();
            let end = (&raw const smp_trampoline_end).addr();
            let offset = |symbol: *const u8| symbol.addr() - start;
            Self {
                code: unsafe { core::slice::from_raw_parts(&raw const smp_trampoline_start, end - start) },
                boot_cr3: offset(&raw const smp_trampoline_boot_cr3),
                kernel_cr3: offset(&raw const smp_trampoline_kernel_cr3),
                stack_count: offset(&raw const smp_trampoline_stack_count),
                stacks: offset(&raw const smp_trampoline_stacks),
            }
        }
    }

    /// Copies the trampoline into its frame and patches page directories and
    /// one fresh kernel stack per expected AP.
    fn install_trampoline(frame: u32, kernel_directory: u32, expected: usize) -> Result<(), SmpError> {
        let layout = TrampolineLayout::linked();
        let Some(target) = physical_to_direct_map(frame) else {
            unreachable!("trampoline frame {frame:#x} lies outside the direct map");
        };
        let target = unsafe { core::slice::from_raw_parts_mut(target as *mut u8, PAGE_SIZE as usize) };

        let mut image = TrampolineImage::install(target, layout.code)?;
        image.patch_u32(layout.boot_cr3, boot_directory_phys().as_u32())?;
        image.patch_u32(layout.kernel_cr3, kernel_directory)?;
        let count = expected.min(AP_STACKS);
        for slot in 0..count {
            let stack: &'static KernelStack = Box::leak(Box::new(KernelStack::new(KERNEL_STACK_SIZE)));
            image.patch_u32(layout.stacks + slot * 4, stack.top() as u32)?;
        }
        image.patch_u32(layout.stack_count, count as u32)?;
        Ok(())
    }

    /// Wakes the APs and returns how many checked in.
    fn wake_application_processors(frame: u32, kernel_directory: u32, expected: usize) -> Result<u32, SmpError> {
        install_trampoline(frame, kernel_directory, expected)?;
        unsafe { apic::start_others((SMP_TRAMPOLINE >> 12) as u8) };

        let expected = expected as u32;
        for _ in 0..CHECK_IN_WAIT_MS {
            if BOOT_SYNC.wait_for(expected, CHECK_IN_SPINS).is_ok() {
                return Ok(expected);
            }
            unsafe { crate::pit::sleep_ms(1) };
        }
        BOOT_SYNC.wait_for(expected, 0).map(|()| expected)
    }

    /// Brings up every core CPUID reports and builds the machine.
    ///
    /// Runs on the bootstrap processor after the memory managers and its
    /// local APIC are up. Returns once all arrived APs were released; they
    /// finish their own setup concurrently.
    pub fn start(pmm: &PhysicalMemoryManager, vmm: &KernelVmm) -> &'static Smp {
        let reported = unsafe { Leaf01h::new() }.logical_processors();
        let expected = expected_application_processors(reported);
        let frame = TRAMPOLINE_FRAME.load(Ordering::Acquire);
        let directory = vmm.kernel_directory();

        let arrived = if expected == 0 || frame == 0 {
            0
        } else {
            match wake_application_processors(frame, directory.as_u32(), expected) {
                Ok(arrived) => arrived,
                Err(SmpError::Timeout { arrived, .. }) => {
                    log::warn!("smp: only {arrived} of {expected} application processors checked in");
                    arrived
                }
                Err(err) => {
                    log::error!("smp: {err}; running on the bootstrap processor only");
                    0
                }
            }
        };

        let smp = publish(Smp::new(&PLATFORM, 1 + arrived as usize, directory, idle_thread));
        if let Some(bsp) = smp.processor(0) {
            bsp.set_apic_id(apic::id());
        }
        BOOT_SYNC.release();

        // A late AP would still execute from the frame.
        if arrived as usize == expected {
            release_trampoline(pmm);
        } else {
            log::warn!("smp: keeping the trampoline frame for stragglers");
        }
        smp
    }

    /// Allocates, records and loads the descriptor tables of core `index`.
    ///
    /// # Safety
    /// Runs once per core, at CPL 0 with interrupts disabled.
    pub unsafe fn install_core_tables(index: usize) -> &'static CoreTables {
        let tables = leak_core_tables(index);
        unsafe { tables.load() };
        tables
    }

    /// Everything a core needs before its first tick. The BSP runs this
    /// after [`start`], the APs from [`ap_main`].
    pub fn bring_online(processor: &Processor) {
        let lapic: Arc<dyn InterruptController> = Arc::new(Lapic);
        processor.set_apic_id(apic::id());
        crate::interrupts::install_core_handlers(processor, &lapic);
        processor.start_scheduling();
        CORES_ONLINE.fetch_add(1, Ordering::AcqRel);
    }

    /// Stops the calling core for good.
    fn park() -> ! {
        PLATFORM.halt()
    }

    /// The idle thread of every core.
    extern "C" fn idle_thread() -> ! {
        loop {
            PLATFORM.wait_for_interrupt();
            count_idle_wakeup(apic::core_index());
        }
    }

    /// First kernel code on an AP: the stack is set, `EBX` holds the kernel
    /// directory.
    #[unsafe(naked)]
    unsafe extern "C" fn ap_entry() -> ! {
        core::arch::naked_asm!(
            "mov cr3, ebx",
            "xor ebp, ebp",
            "call {main}",
            "ud2",
            main = sym ap_main,
        );
    }

    extern "C" fn ap_main() -> ! {
        let index = BOOT_SYNC.check_in();
        BOOT_SYNC.wait_for_release();

        // Cores that arrived after the timeout were not counted.
        let Some(processor) = machine().and_then(|smp| smp.processor(index)) else {
            park();
        };
        apic::register_core(apic::id(), index);

        unsafe {
            install_core_tables(index);
            crate::idt::load_idt();
        }
        apic::enable();
        bring_online(processor);

        loop {
            PLATFORM.wait_for_interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_processors_are_capped() {
        assert_eq!(expected_application_processors(0), 0);
        assert_eq!(expected_application_processors(1), 0);
        assert_eq!(expected_application_processors(4), 3);
        assert_eq!(expected_application_processors(64), MAX_CORES - 1);
    }

    #[test]
    fn trampoline_frame_is_pinned() {
        let constraints = trampoline_constraints();
        assert_eq!(constraints.min_address, 0x8000);
        assert_eq!(constraints.max_address, 0x8FFF);
    }

    #[test]
    fn hooks_are_inert_without_a_machine() {
        CRITICAL.enter();
        CRITICAL.leave();
        assert!(machine().is_none());
    }

    #[test]
    fn missing_tables_panic() {
        let result = std::panic::catch_unwind(|| core_tables(MAX_CORES - 1));
        assert!(result.is_err());
    }
}
