//! # Local APIC (xAPIC)
//!
//! Every core talks to its own local APIC through the same MMIO page; the
//! hardware routes each access to the APIC of the core performing it. The
//! page is mapped once into the kernel regions window as uncached memory and
//! its virtual address is published in [`LAPIC_BASE`].
//!
//! The local APIC provides everything the scheduler and SMP layer need:
//! - the periodic timer, calibrated against the PIT,
//! - IPIs to single cores or to all others,
//! - the INIT/STARTUP sequence for application processors,
//! - end of interrupt for all of the above.
//!
//! Core indices are assigned in check-in order, so the APIC ID → index
//! mapping is kept in a table that [`core_index`] consults.

use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use kernel_cpu::InterruptController;

/// Register offsets into the MMIO page.
mod reg {
    pub const ID: u32 = 0x020;
    pub const TPR: u32 = 0x080;
    pub const EOI: u32 = 0x0B0;
    pub const SVR: u32 = 0x0F0;
    pub const ICR_LOW: u32 = 0x300;
    pub const ICR_HIGH: u32 = 0x310;
    pub const LVT_TIMER: u32 = 0x320;
    pub const TIMER_INITIAL: u32 = 0x380;
    pub const TIMER_CURRENT: u32 = 0x390;
    pub const TIMER_DIVIDE: u32 = 0x3E0;
}

/// Vector of the APIC's own spurious interrupt; no EOI.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

const SVR_ENABLE: u32 = 1 << 8;
const LVT_MASKED: u32 = 1 << 16;
const LVT_PERIODIC: u32 = 1 << 17;
/// Divide the bus clock by 16.
const TIMER_DIVIDE_16: u32 = 0b0011;

/// PIT window used to count timer ticks.
const CALIBRATION_MS: u32 = 10;

/// Virtual address of the MMIO page, `0` until mapped.
static LAPIC_BASE: AtomicU32 = AtomicU32::new(0);

/// Timer ticks per millisecond at [`TIMER_DIVIDE_16`].
static TICKS_PER_MS: AtomicU32 = AtomicU32::new(0);

const UNKNOWN_CORE: u8 = u8::MAX;

static APIC_TO_CORE: [AtomicU8; 256] = [const { AtomicU8::new(UNKNOWN_CORE) }; 256];

/// Records that the core with `apic_id` runs as core `index`.
pub fn register_core(apic_id: u32, index: usize) {
    let (Ok(slot), Ok(index)) = (usize::try_from(apic_id), u8::try_from(index)) else {
        panic!("apic {apic_id} / core {index} out of range");
    };
    assert!(index != UNKNOWN_CORE, "core index {index} is reserved");
    APIC_TO_CORE[slot & 0xFF].store(index, Ordering::Release);
}

/// Index of the calling core. `0` until the local APIC is mapped, which is
/// the bootstrap processor by construction.
#[must_use]
pub fn core_index() -> usize {
    if LAPIC_BASE.load(Ordering::Acquire) == 0 {
        return 0;
    }
    #[cfg(target_arch = "x86")]
    return core_of(id());
    // Only the x86 build maps the local APIC.
    #[cfg(not(target_arch = "x86"))]
    unreachable!("local APIC mapped on a non-x86 build")
}

fn core_of(apic_id: u32) -> usize {
    match APIC_TO_CORE[(apic_id & 0xFF) as usize].load(Ordering::Acquire) {
        UNKNOWN_CORE => panic!("apic {apic_id} has no core index"),
        index => usize::from(index),
    }
}

/// ICR delivery modes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum DeliveryMode {
    Fixed = 0b000,
    Init = 0b101,
    Startup = 0b110,
}

impl DeliveryMode {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(bits: u8) -> Self {
        match bits {
            0b101 => Self::Init,
            0b110 => Self::Startup,
            _ => Self::Fixed,
        }
    }
}

/// ICR destination shorthands.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Shorthand {
    None = 0b00,
    AllExcludingSelf = 0b11,
}

impl Shorthand {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(bits: u8) -> Self {
        match bits {
            0b11 => Self::AllExcludingSelf,
            _ => Self::None,
        }
    }
}

/// Low half of the interrupt command register.
#[bitfield(u32)]
pub struct InterruptCommand {
    pub vector: u8,
    #[bits(3)]
    pub delivery_mode: DeliveryMode,
    /// 0 = physical destination.
    pub logical: bool,
    /// Set while the previous IPI is still being sent.
    pub pending: bool,
    #[bits(1)]
    __r13: u8,
    pub assert: bool,
    pub level_triggered: bool,
    #[bits(2)]
    __r16: u8,
    #[bits(2)]
    pub shorthand: Shorthand,
    #[bits(12)]
    __r20: u16,
}

impl InterruptCommand {
    /// A fixed interrupt on `vector`.
    #[must_use]
    pub const fn fixed(vector: u8) -> Self {
        Self::new()
            .with_vector(vector)
            .with_delivery_mode(DeliveryMode::Fixed)
            .with_assert(true)
    }

    /// INIT to every other core.
    #[must_use]
    pub const fn init_others() -> Self {
        Self::new()
            .with_delivery_mode(DeliveryMode::Init)
            .with_assert(true)
            .with_shorthand(Shorthand::AllExcludingSelf)
    }

    /// STARTUP to every other core; they begin in real mode at
    /// `page << 12`.
    #[must_use]
    pub const fn startup_others(page: u8) -> Self {
        Self::new()
            .with_vector(page)
            .with_delivery_mode(DeliveryMode::Startup)
            .with_assert(true)
            .with_shorthand(Shorthand::AllExcludingSelf)
    }
}

/// Initial count of the periodic timer for `interval_ms`, saturating.
#[must_use]
pub const fn timer_initial_count(ticks_per_ms: u32, interval_ms: u32) -> u32 {
    let count = ticks_per_ms as u64 * interval_ms as u64;
    if count > u32::MAX as u64 {
        u32::MAX
    } else if count == 0 {
        1
    } else {
        count as u32
    }
}

/// The local APIC as the delivering controller of the core vectors.
pub struct Lapic;

impl InterruptController for Lapic {
    fn end_of_interrupt(&self, _vector: u8) {
        #[cfg(target_arch = "x86")]
        eoi();
    }
}

#[cfg(target_arch = "x86")]
pub use hw::*;

#[cfg(target_arch = "x86")]
mod hw {
    use super::{
        CALIBRATION_MS, InterruptCommand, LAPIC_BASE, LVT_MASKED, LVT_PERIODIC, SPURIOUS_VECTOR,
        SVR_ENABLE, TICKS_PER_MS, TIMER_DIVIDE_16, reg, timer_initial_count,
    };
    use core::sync::atomic::Ordering;
    use kernel_alloc::VirtualMemoryManager;
    use kernel_cpu::TIMER_VECTOR;
    use kernel_info::memory::PAGE_SIZE;
    use kernel_registers::msr::Ia32ApicBase;
    use kernel_vmem::{MappingConfig, PagingUnit, PhysMapper};

    fn read(offset: u32) -> u32 {
        let base = LAPIC_BASE.load(Ordering::Acquire);
        debug_assert!(base != 0, "local APIC not mapped");
        unsafe { ((base + offset) as *const u32).read_volatile() }
    }

    fn write(offset: u32, value: u32) {
        let base = LAPIC_BASE.load(Ordering::Acquire);
        debug_assert!(base != 0, "local APIC not mapped");
        unsafe { ((base + offset) as *mut u32).write_volatile(value) }
    }

    /// Globally enable the APIC of the bootstrap processor and map its
    /// registers.
    pub fn map<M: PhysMapper, U: PagingUnit>(vmm: &VirtualMemoryManager<'_, M, U>) {
        let msr = unsafe { Ia32ApicBase::load() };
        if !msr.enabled() {
            unsafe { msr.with_enabled(true).store() };
        }
        let region = vmm.map_physical(msr.base(), u64::from(PAGE_SIZE), MappingConfig::mmio());
        let base = region.address().as_u32();
        // The bootstrap processor is core 0; register it before anything can
        // ask for the core index through the mapped registers.
        let id = unsafe { ((base + reg::ID) as *const u32).read_volatile() } >> 24;
        super::register_core(id, 0);
        LAPIC_BASE.store(base, Ordering::Release);
        log::info!("apic: registers at {} mapped to {:#010x}", msr.base(), region.address().as_u32());
    }

    /// Software-enable the calling core's APIC and accept every priority.
    pub fn enable() {
        write(reg::TPR, 0);
        write(reg::SVR, SVR_ENABLE | u32::from(SPURIOUS_VECTOR));
    }

    /// APIC ID of the calling core.
    #[must_use]
    pub fn id() -> u32 {
        read(reg::ID) >> 24
    }

    pub fn eoi() {
        write(reg::EOI, 0);
    }

    fn wait_for_delivery() {
        while InterruptCommand::from_bits(read(reg::ICR_LOW)).pending() {
            core::hint::spin_loop();
        }
    }

    fn send(destination: u32, command: InterruptCommand) {
        let _guard = kernel_sync::CriticalGuard::new();
        wait_for_delivery();
        write(reg::ICR_HIGH, destination << 24);
        write(reg::ICR_LOW, command.into_bits());
        wait_for_delivery();
    }

    pub fn send_ipi(apic_id: u32, vector: u8) {
        send(apic_id, InterruptCommand::fixed(vector));
    }

    pub fn broadcast_ipi(vector: u8) {
        send(0, InterruptCommand::fixed(vector).with_shorthand(super::Shorthand::AllExcludingSelf));
    }

    /// INIT, then STARTUP twice, to every other core.
    ///
    /// # Safety
    /// The trampoline must be installed at `page << 12`.
    pub unsafe fn start_others(page: u8) {
        send(0, InterruptCommand::init_others());
        unsafe { crate::pit::sleep_ms(10) };
        for _ in 0..2 {
            send(0, InterruptCommand::startup_others(page));
            unsafe { crate::pit::sleep_us(200) };
        }
    }

    /// Count timer ticks across a PIT window. Bootstrap processor only; the
    /// result is shared by every core.
    ///
    /// # Safety
    /// Interrupts disabled; owns PIT channel 2.
    pub unsafe fn calibrate_timer() {
        write(reg::TIMER_DIVIDE, TIMER_DIVIDE_16);
        write(reg::LVT_TIMER, LVT_MASKED | u32::from(TIMER_VECTOR));
        write(reg::TIMER_INITIAL, u32::MAX);
        unsafe { crate::pit::sleep_ms(CALIBRATION_MS) };
        let elapsed = u32::MAX - read(reg::TIMER_CURRENT);
        write(reg::TIMER_INITIAL, 0);

        let per_ms = (elapsed / CALIBRATION_MS).max(1);
        TICKS_PER_MS.store(per_ms, Ordering::Release);
        log::info!("apic: timer runs at {per_ms} ticks/ms (divide 16)");
    }

    /// Fire [`TIMER_VECTOR`] every `interval_ms` on the calling core.
    pub fn arm_periodic(interval_ms: u32) {
        let ticks = TICKS_PER_MS.load(Ordering::Acquire);
        assert!(ticks != 0, "timer armed before calibration");
        write(reg::TIMER_DIVIDE, TIMER_DIVIDE_16);
        write(reg::LVT_TIMER, LVT_PERIODIC | u32::from(TIMER_VECTOR));
        write(reg::TIMER_INITIAL, timer_initial_count(ticks, interval_ms));
    }
}
