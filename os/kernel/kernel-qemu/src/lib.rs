//! # QEMU debug console output
//!
//! QEMU's `-debugcon` device prints every byte written to I/O port `0x402`
//! on the host, which makes it usable from the first instruction on and from
//! every core without any setup.
//!
//! * [`QemuLogger`] is the kernel's `log::Log` backend. Records are written
//!   whole as `[LEVEL cpuN] target: message`; a spin lock keeps lines from
//!   different cores apart.
//! * [`qemu_trace!`] writes raw formatted text, bypassing `log`. Used by the
//!   panic path, which must not depend on the logger's lock.
//!
//! With the `enabled` feature off both compile to no-ops.
//!
//! ```bash
//! qemu-system-i386 -kernel kernel.elf -debugcon stdio
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, format_record};

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    const QEMU_DEBUG_PORT: u16 = 0x402;

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
        #[cfg(not(target_arch = "x86"))]
        let _ = (QEMU_DEBUG_PORT, c);
    }

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                dbg_putc(b);
            }
            Ok(())
        }
    }

    #[doc(hidden)]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    pub struct QemuSink;

    impl fmt::Write for QemuSink {
        fn write_str(&mut self, _: &str) -> fmt::Result {
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub const fn qemu_write(_: fmt::Arguments) {}
}

/// Formatted write to the debug console, no allocation and no locking.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
