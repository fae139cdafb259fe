//! The running machine as seen by [`kernel_cpu`].
//!
//! [`HardwarePlatform`] answers the scheduler's questions with real
//! instructions: `cli`/`sti`/`hlt`, the local APIC for IPIs and the timer,
//! and an `iret` for entering threads.
//!
//! ## Entering a thread
//!
//! Both fresh and preempted threads are entered the same way: the TSS gets
//! the thread's kernel stack, `CR3` is switched if the thread lives in
//! another address space, and [`enter_thread_context`] builds an `iret`
//! frame from the saved [`ThreadRegisters`].
//!
//! ```text
//! ring 0: esp := regs.esp; push eflags, cs, eip            ─► iretd
//! ring 3: push ss, esp, eflags, cs, eip on the current stack ─► iretd
//! ```
//!
//! The interrupt frame the switch was decided in is abandoned; the thread
//! that owned it has its state saved already.

use crate::apic;
use core::arch::naked_asm;
use core::mem::offset_of;
use kernel_cpu::{ContextSwitch, Platform, ThreadRegisters};
use kernel_sync::InterruptFlag;
use kernel_sync::irq::HardwareInterruptFlag;

const _: () = assert!(size_of::<ThreadRegisters>() == 17 * 4);

/// The hardware implementation of [`Platform`].
pub struct HardwarePlatform;

pub static PLATFORM: HardwarePlatform = HardwarePlatform;

impl HardwarePlatform {
    fn switch_to(registers: &ThreadRegisters, kernel_stack_top: u32) -> ! {
        crate::smp::core_tables(apic::core_index()).set_kernel_stack(kernel_stack_top);
        unsafe { enter_thread_context(registers) }
    }
}

impl ContextSwitch for HardwarePlatform {
    fn restore_context(&self, registers: &ThreadRegisters, kernel_stack_top: u32) {
        Self::switch_to(registers, kernel_stack_top);
    }

    fn enter_initial_context(&self, registers: &ThreadRegisters, kernel_stack_top: u32) {
        Self::switch_to(registers, kernel_stack_top);
    }
}

impl Platform for HardwarePlatform {
    fn core_index(&self) -> usize {
        apic::core_index()
    }

    fn interrupts_enabled(&self) -> bool {
        HardwareInterruptFlag.enabled()
    }

    fn disable_interrupts(&self) {
        HardwareInterruptFlag.disable();
    }

    fn enable_interrupts(&self) {
        HardwareInterruptFlag.enable();
    }

    fn wait_for_interrupt(&self) {
        // `sti` holds interrupts off for one more instruction, so none slips
        // in before the `hlt`.
        unsafe { core::arch::asm!("sti", "hlt", options(nomem, nostack)) };
    }

    fn halt(&self) -> ! {
        loop {
            unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
        }
    }

    fn send_ipi(&self, apic_id: u32, vector: u8) {
        apic::send_ipi(apic_id, vector);
    }

    fn broadcast_ipi(&self, vector: u8) {
        apic::broadcast_ipi(vector);
    }

    fn arm_timer(&self, interval_ms: u32) {
        apic::arm_periodic(interval_ms);
    }
}

/// Load `regs` and `iret` into the thread.
///
/// # Safety
/// Interrupts disabled; `regs` must describe a valid context whose
/// address space maps the kernel half, and the TSS must carry the
/// thread's kernel stack.
#[unsafe(naked)]
unsafe extern "C" fn enter_thread_context(regs: *const ThreadRegisters) -> ! {
    naked_asm!(
        "mov eax, [esp + 4]",

        "mov ecx, [eax + {off_cr3}]",
        "mov edx, cr3",
        "cmp ecx, edx",
        "je 2f",
        "mov cr3, ecx",
        "2:",

        "test dword ptr [eax + {off_cs}], 3",
        "jnz 3f",
        "mov esp, [eax + {off_esp}]",
        "push dword ptr [eax + {off_eflags}]",
        "push dword ptr [eax + {off_cs}]",
        "push dword ptr [eax + {off_eip}]",
        "jmp 4f",
        "3:",
        "push dword ptr [eax + {off_ss}]",
        "push dword ptr [eax + {off_esp}]",
        "push dword ptr [eax + {off_eflags}]",
        "push dword ptr [eax + {off_cs}]",
        "push dword ptr [eax + {off_eip}]",
        "4:",

        "mov ecx, [eax + {off_ds}]",
        "mov ds, cx",
        "mov ecx, [eax + {off_es}]",
        "mov es, cx",
        "mov ecx, [eax + {off_fs}]",
        "mov fs, cx",
        "mov ecx, [eax + {off_gs}]",
        "mov gs, cx",

        "mov ebx, [eax + {off_ebx}]",
        "mov ecx, [eax + {off_ecx}]",
        "mov edx, [eax + {off_edx}]",
        "mov esi, [eax + {off_esi}]",
        "mov edi, [eax + {off_edi}]",
        "mov ebp, [eax + {off_ebp}]",
        "mov eax, [eax + {off_eax}]",
        "iretd",
        off_cr3 = const offset_of!(ThreadRegisters, cr3),
        off_cs = const offset_of!(ThreadRegisters, cs),
        off_ss = const offset_of!(ThreadRegisters, ss),
        off_esp = const offset_of!(ThreadRegisters, esp),
        off_eip = const offset_of!(ThreadRegisters, eip),
        off_eflags = const offset_of!(ThreadRegisters, eflags),
        off_ds = const offset_of!(ThreadRegisters, ds),
        off_es = const offset_of!(ThreadRegisters, es),
        off_fs = const offset_of!(ThreadRegisters, fs),
        off_gs = const offset_of!(ThreadRegisters, gs),
        off_eax = const offset_of!(ThreadRegisters, eax),
        off_ebx = const offset_of!(ThreadRegisters, ebx),
        off_ecx = const offset_of!(ThreadRegisters, ecx),
        off_edx = const offset_of!(ThreadRegisters, edx),
        off_esi = const offset_of!(ThreadRegisters, esi),
        off_edi = const offset_of!(ThreadRegisters, edi),
        off_ebp = const offset_of!(ThreadRegisters, ebp),
    );
}
