//! CPU exceptions other than page faults, and spurious vectors.
//!
//! Exceptions are fatal: the handler logs the frame and panics, which halts
//! every core.

use kernel_cpu::registers::InterruptFrame;

pub const EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating-point exception",
    "alignment check",
    "machine check",
    "SIMD floating-point exception",
    "virtualization exception",
    "control protection exception",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection exception",
    "VMM communication exception",
    "security exception",
    "reserved",
];

/// Spurious vectors of the two legacy PICs and the local APIC. They never
/// get an EOI.
pub const SPURIOUS_VECTORS: [u8; 3] = [0x27, 0x2F, 0xFF];

#[must_use]
pub fn exception_name(vector: u8) -> Option<&'static str> {
    EXCEPTION_NAMES.get(usize::from(vector)).copied()
}

/// Panic with a description of the exception in `frame`.
pub fn fatal(frame: &InterruptFrame) -> ! {
    let vector = frame.vector();
    let name = exception_name(vector).unwrap_or("interrupt");
    log::error!(
        "{name} (vector {vector}) at {cs:#06x}:{eip:#010x}, error code {err:#x}, eflags {eflags:#010x}",
        cs = frame.cs,
        eip = frame.eip,
        err = frame.error_code,
        eflags = frame.eflags,
    );
    log::error!(
        "eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x} esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
        frame.eax,
        frame.ebx,
        frame.ecx,
        frame.edx,
        frame.esi,
        frame.edi,
        frame.ebp,
        frame.interrupted_esp(),
    );
    panic!("{name} at {:#010x}", frame.eip);
}

/// Interrupts taken before the processors exist.
pub fn early_interrupt(frame: &InterruptFrame) {
    let vector = frame.vector();
    if usize::from(vector) < EXCEPTION_NAMES.len() {
        fatal(frame);
    }
    log::warn!("interrupt {vector:#04x} before the processors are up, ignored");
}

#[cfg(target_arch = "x86")]
pub use install::install;

#[cfg(target_arch = "x86")]
mod install {
    use super::{EXCEPTION_NAMES, SPURIOUS_VECTORS, fatal};
    use crate::interrupts::page_fault::PAGE_FAULT_VECTOR;
    use alloc::sync::Arc;
    use kernel_cpu::registers::InterruptFrame;
    use kernel_cpu::{HandlerKind, InterruptHandler, Processor};

    struct FatalException;

    impl InterruptHandler for FatalException {
        fn handle(&self, _processor: &Processor, frame: &mut InterruptFrame) {
            fatal(frame);
        }
    }

    struct Spurious;

    impl InterruptHandler for Spurious {
        fn handle(&self, processor: &Processor, frame: &mut InterruptFrame) {
            log::trace!("spurious interrupt {:#04x} on cpu{}", frame.vector(), processor.index());
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn install(processor: &Processor) {
        let fatal: Arc<dyn InterruptHandler> = Arc::new(FatalException);
        for vector in 0..EXCEPTION_NAMES.len() as u8 {
            if vector != PAGE_FAULT_VECTOR {
                processor.register_interrupt_handler(vector, Arc::clone(&fatal), HandlerKind::Generic);
            }
        }
        let spurious: Arc<dyn InterruptHandler> = Arc::new(Spurious);
        for vector in SPURIOUS_VECTORS {
            processor.register_interrupt_handler(vector, Arc::clone(&spurious), HandlerKind::Generic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_cover_the_architectural_vectors() {
        assert_eq!(exception_name(0), Some("divide error"));
        assert_eq!(exception_name(13), Some("general protection fault"));
        assert_eq!(exception_name(14), Some("page fault"));
        assert_eq!(exception_name(32), None);
    }

    #[test]
    #[should_panic(expected = "invalid opcode at 0xc0101234")]
    fn early_exception_is_fatal() {
        let frame = InterruptFrame {
            vector: 6,
            eip: 0xC010_1234,
            cs: 0x08,
            ..InterruptFrame::default()
        };
        early_interrupt(&frame);
    }

    #[test]
    fn early_device_interrupt_is_ignored() {
        let frame = InterruptFrame {
            vector: 0x27,
            ..InterruptFrame::default()
        };
        early_interrupt(&frame);
    }
}
