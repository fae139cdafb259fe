//! # Interrupt entry
//!
//! Every vector enters through a 16-byte stub. The stub makes the stack
//! uniform (a zero error code where the CPU pushes none, then the vector
//! number) and jumps to a common path that saves the remaining registers in
//! the [`InterruptFrame`] layout and calls into the running core's
//! [`Processor`](kernel_cpu::Processor).
//!
//! ```text
//! CPU: [ss esp] eflags cs eip [error]
//! stub: (0) vector ─► common: pushad, ds es fs gs ─► interrupt_dispatch(&mut frame)
//! ```
//!
//! If the dispatch returns, the common path pops the frame and `iret`s to the
//! interrupted code. A context switch never returns here; see
//! [`crate::platform`].

pub mod exceptions;
pub mod page_fault;

#[cfg(target_arch = "x86")]
pub use entry::{build_idt, install_core_handlers};

/// Distance between two vector stubs.
pub const STUB_SIZE: u32 = 16;

#[cfg(target_arch = "x86")]
mod entry {
    use super::STUB_SIZE;
    use crate::idt::Idt;
    use alloc::sync::Arc;
    use kernel_cpu::registers::{InterruptFrame, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};
    use kernel_cpu::{InterruptController, Processor};

    // Vectors 8, 10-14, 17, 21, 29 and 30 come with an error code.
    core::arch::global_asm!(
        ".section .text.interrupts, \"ax\"",
        ".balign 16",
        ".global interrupt_stubs",
        "interrupt_stubs:",
        ".set isr_vector, 0",
        ".rept 256",
        "    .balign 16",
        "    .if !((isr_vector == 8) || ((isr_vector >= 10) && (isr_vector <= 14)) || (isr_vector == 17) || (isr_vector == 21) || (isr_vector == 29) || (isr_vector == 30))",
        "    pushl $0",
        "    .endif",
        "    pushl $isr_vector",
        "    jmp interrupt_common",
        "    .set isr_vector, isr_vector + 1",
        ".endr",
        "",
        "interrupt_common:",
        "    pushal",
        "    pushl %ds",
        "    pushl %es",
        "    pushl %fs",
        "    pushl %gs",
        "    movw ${data}, %ax",
        "    movw %ax, %ds",
        "    movw %ax, %es",
        "    movw %ax, %fs",
        "    movw %ax, %gs",
        "    cld",
        "    pushl %esp",
        "    call {dispatch}",
        "    addl $4, %esp",
        "    popl %gs",
        "    popl %fs",
        "    popl %es",
        "    popl %ds",
        "    popal",
        // vector and error code
        "    addl $8, %esp",
        "    iretl",
        data = const KERNEL_DATA_SELECTOR,
        dispatch = sym interrupt_dispatch,
        options(att_syntax)
    );

    unsafe extern "C" {
        static interrupt_stubs: u8;
    }

    /// A table with every vector routed to its stub through an interrupt
    /// gate.
    #[must_use]
    pub fn build_idt() -> Idt {
        let base = unsafe { (&raw const interrupt_stubs) as u32 };
        let mut idt = Idt::new();
        for vector in 0..256u32 {
            idt[vector as usize]
                .set_handler(base + vector * STUB_SIZE)
                .selector(KERNEL_CODE_SELECTOR)
                .dpl(0)
                .present(true)
                .gate_interrupt();
        }
        idt
    }

    /// Every handler a core needs before it enables interrupts.
    pub fn install_core_handlers(processor: &Processor, lapic: &Arc<dyn InterruptController>) {
        processor.install_core_handlers(lapic);
        super::exceptions::install(processor);
        super::page_fault::install(processor);
    }

    extern "C" fn interrupt_dispatch(frame: &mut InterruptFrame) {
        match crate::smp::machine() {
            Some(smp) => smp.current().handle_interrupt(frame),
            None => super::exceptions::early_interrupt(frame),
        }
    }
}
