//! # Kernel Entry Point
//!
//! Boot order on the bootstrap processor:
//!
//! 1. logger, GDT/TSS of core 0, shared IDT, legacy PIC masked
//! 2. physical and virtual memory managers from the multiboot memory map
//! 3. local APIC mapped, enabled and its timer calibrated
//! 4. application processors started, the machine published
//! 5. core handlers, scheduler, self-tests, idle
//!
//! On the host only the portable modules are built, for their unit tests.

#![cfg_attr(target_arch = "x86", no_std, no_main)]
#![cfg_attr(not(target_arch = "x86"), allow(dead_code))]
#![allow(unsafe_code)]

extern crate alloc;

mod allocator;
mod apic;
mod boot;
mod cpuid;
mod gdt;
mod idt;
mod interrupts;
mod memory;
#[cfg(target_arch = "x86")]
mod pic;
#[cfg(target_arch = "x86")]
mod pit;
#[cfg(target_arch = "x86")]
mod platform;
#[cfg(target_arch = "x86")]
mod ports;
mod selftest;
mod smp;

#[cfg(target_arch = "x86")]
pub use bring_up::kernel_main;

#[cfg(not(target_arch = "x86"))]
fn main() {}

#[cfg(target_arch = "x86")]
mod bring_up {
    use crate::platform::PLATFORM;
    use crate::{apic, idt, interrupts, memory, pic, selftest, smp};
    use core::hint::spin_loop;
    use kernel_cpu::Platform;
    use kernel_info::boot::MultibootInfo;
    use kernel_qemu::QemuLogger;
    use kernel_sync::irq::IrqGuard;
    use log::LevelFilter;

    /// Called once from the multiboot entry with the loader's registers.
    pub fn kernel_main(magic: u32, info: *const MultibootInfo) -> ! {
        match QemuLogger::new(LevelFilter::Info).init() {
            Ok(logger) => logger.set_core_id_hook(apic::core_index),
            // Nothing to report to.
            Err(_) => PLATFORM.halt(),
        }
        log::info!("kernel: booting, magic {magic:#010x}, info at {info:p}");

        unsafe {
            smp::install_core_tables(0);
            idt::init_idt_once(interrupts::build_idt());
            pic::remap_and_mask();
        }

        if let Err(err) = unsafe { memory::init(magic, info) } {
            panic!("memory: {err}");
        }
        let (pmm, vmm) = (memory::pmm(), memory::vmm());

        apic::map(vmm);
        apic::enable();
        unsafe { apic::calibrate_timer() };

        let smp = smp::start(pmm, vmm);
        let Some(bsp) = smp.processor(0) else {
            unreachable!("a machine has a bootstrap processor");
        };
        smp::bring_online(bsp);

        while smp::cores_online() < smp.len() {
            spin_loop();
        }
        log::info!("kernel: {} core(s) online", smp.len());

        selftest::spawn(bsp);
        loop {
            PLATFORM.wait_for_interrupt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        let _irq = IrqGuard::new();
        log::error!("kernel panic on cpu{}: {info}", apic::core_index());
        if let Some(smp) = smp::machine() {
            smp.halt_others();
        }
        PLATFORM.halt()
    }
}
