//! Register layouts shared with the assembly entry and exit paths.

use kernel_memory_addresses::PhysicalAddress;
use kernel_registers::eflags::Eflags;

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// Ring-3 code selector (`0x18 | 3`).
pub const USER_CODE_SELECTOR: u16 = 0x1B;
/// Ring-3 data selector (`0x20 | 3`).
pub const USER_DATA_SELECTOR: u16 = 0x23;
pub const TSS_SELECTOR: u16 = 0x28;

/// What the interrupt stubs leave on the stack, lowest address first.
///
/// The stubs push `vector` and (where the CPU does not) a zero
/// `error_code`, then `pushad` and the four data segments. `user_esp` and
/// `user_ss` are only valid for interrupts taken in ring 3.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct InterruptFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// `esp` as saved by `pushad`: the address of `vector`.
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

const _: () = assert!(size_of::<InterruptFrame>() == 19 * 4);

impl InterruptFrame {
    /// Bytes between the `pushad` stack pointer and the interrupted stack
    /// pointer of a ring-0 interrupt: `vector`, `error_code`, `eip`, `cs`
    /// and `eflags`.
    pub const KERNEL_TRAILER: u32 = 5 * 4;

    #[must_use]
    pub const fn from_userspace(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Stack pointer of the interrupted code.
    #[must_use]
    pub const fn interrupted_esp(&self) -> u32 {
        if self.from_userspace() {
            self.user_esp
        } else {
            self.esp + Self::KERNEL_TRAILER
        }
    }

    #[must_use]
    pub const fn vector(&self) -> u8 {
        self.vector as u8
    }
}

/// The full register state of a thread that is not running.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ThreadRegisters {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub ss: u32,
    pub cr3: u32,
}

impl ThreadRegisters {
    /// Ring-0 start state: zeroed general purpose registers, interrupts on.
    #[must_use]
    pub fn kernel(entry: u32, stack_top: u32, directory: PhysicalAddress) -> Self {
        let data = u32::from(KERNEL_DATA_SELECTOR);
        Self {
            esp: stack_top,
            eip: entry,
            eflags: Eflags::thread_default().into_bits(),
            cs: u32::from(KERNEL_CODE_SELECTOR),
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ss: data,
            cr3: directory.as_u32(),
            ..Self::default()
        }
    }

    /// Ring-3 start state.
    #[must_use]
    pub fn user(entry: u32, stack_top: u32, directory: PhysicalAddress) -> Self {
        let data = u32::from(USER_DATA_SELECTOR);
        Self {
            cs: u32::from(USER_CODE_SELECTOR),
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ss: data,
            ..Self::kernel(entry, stack_top, directory)
        }
    }

    #[must_use]
    pub const fn is_userspace(&self) -> bool {
        self.cs & 3 == 3
    }

    #[must_use]
    pub const fn directory(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.cr3)
    }

    /// Take over the interrupted state from `frame`. `cr3` is kept.
    pub const fn capture(&mut self, frame: &InterruptFrame) {
        self.eax = frame.eax;
        self.ebx = frame.ebx;
        self.ecx = frame.ecx;
        self.edx = frame.edx;
        self.esi = frame.esi;
        self.edi = frame.edi;
        self.ebp = frame.ebp;
        self.esp = frame.interrupted_esp();
        self.eip = frame.eip;
        self.eflags = frame.eflags;
        self.cs = frame.cs;
        self.ds = frame.ds;
        self.es = frame.es;
        self.fs = frame.fs;
        self.gs = frame.gs;
        self.ss = if frame.from_userspace() {
            frame.user_ss
        } else {
            KERNEL_DATA_SELECTOR as u32
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_start_state() {
        let r = ThreadRegisters::kernel(0xC010_0000, 0xE000_4000, PhysicalAddress::new(0x5000));
        assert_eq!(r.eflags, 0x202);
        assert_eq!(r.cs, 0x08);
        assert_eq!(r.ss, 0x10);
        assert_eq!(r.eax | r.ebx | r.ecx | r.edx | r.esi | r.edi | r.ebp, 0);
        assert!(!r.is_userspace());
        assert_eq!(r.directory(), PhysicalAddress::new(0x5000));
    }

    #[test]
    fn user_start_state() {
        let r = ThreadRegisters::user(0x40_0000, 0xBFFF_F000, PhysicalAddress::new(0x9000));
        assert_eq!(r.cs, 0x1B);
        assert_eq!(r.ds, 0x23);
        assert_eq!(r.ss, 0x23);
        assert!(r.is_userspace());
    }

    #[test]
    fn capture_from_kernel_frame() {
        let frame = InterruptFrame {
            eax: 1,
            ebx: 2,
            esp: 0xE000_1F00,
            eip: 0xC010_2000,
            cs: 0x08,
            eflags: 0x246,
            ds: 0x10,
            ..InterruptFrame::default()
        };
        let mut r = ThreadRegisters::kernel(0, 0, PhysicalAddress::new(0x7000));
        r.capture(&frame);
        assert_eq!((r.eax, r.ebx), (1, 2));
        assert_eq!(r.esp, 0xE000_1F14);
        assert_eq!(r.ss, 0x10);
        assert_eq!(r.cr3, 0x7000);
    }

    #[test]
    fn capture_from_user_frame() {
        let frame = InterruptFrame {
            cs: 0x1B,
            user_esp: 0xBFFF_EF00,
            user_ss: 0x23,
            ..InterruptFrame::default()
        };
        let mut r = ThreadRegisters::default();
        r.capture(&frame);
        assert_eq!(r.esp, 0xBFFF_EF00);
        assert_eq!(r.ss, 0x23);
    }
}
