//! # Global Descriptor Table (GDT) & Task State Segment (TSS)
//!
//! Segmentation is flat: every code and data segment spans the full 4 GiB
//! and paging provides the protection. Selectors still matter for privilege:
//! the `iret` frame of a user thread names the ring-3 selectors, and a
//! ring-3 → ring-0 transition loads `esp0`/`ss0` from the TSS.
//!
//! ## Layout
//! Index | Selector | Meaning
//! ------|----------|--------
//! 0     | 0x00     | Null
//! 1     | 0x08     | Kernel code (DPL=0)
//! 2     | 0x10     | Kernel data (DPL=0)
//! 3     | 0x18     | User code (DPL=3) → with RPL=3: **0x1b**
//! 4     | 0x20     | User data (DPL=3) → with RPL=3: **0x23**
//! 5     | 0x28     | TSS
//!
//! ## Per-core tables
//! `esp0` is the kernel stack of the thread running on a core, so every core
//! owns a [`CoreTables`] with its own GDT and TSS. The scheduler updates
//! `esp0` before entering a thread.

use alloc::boxed::Box;
use bitfield_struct::bitfield;
use core::cell::UnsafeCell;
use kernel_cpu::registers::{KERNEL_DATA_SELECTOR, TSS_SELECTOR};

/// Bit layout of a legacy 8-byte segment descriptor.
#[bitfield(u64)]
pub struct SegmentDescriptor {
    pub limit_lo: u16, // [15:0]
    #[bits(24)]
    pub base_lo: u32, // [39:16]
    #[bits(4)]
    pub typ: u8, // [43:40]
    pub s: bool, // [44]     1 = code/data, 0 = system
    #[bits(2)]
    pub dpl: u8, // [46:45]
    pub p: bool, // [47]
    #[bits(4)]
    pub limit_hi: u8, // [51:48]
    pub avl: bool,    // [52]
    pub l: bool,      // [53]     must be 0 outside long mode
    pub db: bool,     // [54]     1 = 32-bit segment
    pub g: bool,      // [55]     limit in 4 KiB units
    pub base_hi: u8,  // [63:56]
}

impl SegmentDescriptor {
    const TYPE_CODE_EXEC_READ: u8 = 0b1010;
    const TYPE_DATA_READ_WRITE: u8 = 0b0010;
    const TYPE_TSS_AVAILABLE: u8 = 0b1001;

    const fn flat(typ: u8, dpl: u8) -> Self {
        Self::new()
            .with_limit_lo(0xFFFF)
            .with_limit_hi(0xF)
            .with_typ(typ)
            .with_s(true)
            .with_dpl(dpl & 0b11)
            .with_p(true)
            .with_db(true)
            .with_g(true)
    }

    /// 4 GiB execute/read segment.
    #[must_use]
    pub const fn flat_code(dpl: u8) -> Self {
        Self::flat(Self::TYPE_CODE_EXEC_READ, dpl)
    }

    /// 4 GiB read/write segment.
    #[must_use]
    pub const fn flat_data(dpl: u8) -> Self {
        Self::flat(Self::TYPE_DATA_READ_WRITE, dpl)
    }

    /// Available 32-bit TSS at `base`, byte granular.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn tss(base: u32, limit: u32) -> Self {
        Self::new()
            .with_limit_lo(limit as u16)
            .with_limit_hi((limit >> 16) as u8 & 0xF)
            .with_base_lo(base & 0x00FF_FFFF)
            .with_base_hi((base >> 24) as u8)
            .with_typ(Self::TYPE_TSS_AVAILABLE)
            .with_p(true)
    }

    #[must_use]
    pub const fn base(&self) -> u32 {
        self.base_lo() | ((self.base_hi() as u32) << 24)
    }

    /// Limit in the unit given by `g`.
    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit_lo() as u32 | ((self.limit_hi() as u32) << 16)
    }
}

/// 32-bit Task State Segment.
///
/// Hardware task switching is not used. The CPU only reads `ss0:esp0` when
/// an interrupt arrives in ring 3; `iomap_base` past the limit disables the
/// I/O permission bitmap.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Tss {
    pub link: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub general: [u32; 8],
    pub segments: [u32; 6],
    pub ldt: u32,
    pub trap: u16,
    pub iomap_base: u16,
}

const _: () = assert!(size_of::<Tss>() == 104);

impl Tss {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn kernel() -> Self {
        Self {
            ss0: u32::from(KERNEL_DATA_SELECTOR),
            iomap_base: size_of::<Self>() as u16,
            ..Self::default()
        }
    }
}

pub const GDT_ENTRIES: usize = 6;

/// GDT and TSS of one core.
#[repr(C, align(8))]
pub struct CoreTables {
    gdt: [SegmentDescriptor; GDT_ENTRIES],
    tss: UnsafeCell<Tss>,
}

// SAFETY: only the owning core writes `esp0`, and the CPU reads it.
unsafe impl Sync for CoreTables {}

impl CoreTables {
    /// Heap-allocated so the TSS address is final before the descriptor
    /// pointing at it is built.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new() -> Box<Self> {
        let mut tables = Box::new(Self {
            gdt: [
                SegmentDescriptor::new(),
                SegmentDescriptor::flat_code(0),
                SegmentDescriptor::flat_data(0),
                SegmentDescriptor::flat_code(3),
                SegmentDescriptor::flat_data(3),
                SegmentDescriptor::new(),
            ],
            tss: UnsafeCell::new(Tss::kernel()),
        });
        let base = tables.tss.get() as usize as u32;
        tables.gdt[usize::from(TSS_SELECTOR >> 3)] = SegmentDescriptor::tss(base, size_of::<Tss>() as u32 - 1);
        tables
    }

    #[must_use]
    pub const fn descriptors(&self) -> &[SegmentDescriptor; GDT_ENTRIES] {
        &self.gdt
    }

    /// Stack the CPU switches to when an interrupt arrives in ring 3.
    pub fn set_kernel_stack(&self, top: u32) {
        unsafe { core::ptr::addr_of_mut!((*self.tss.get()).esp0).write_volatile(top) }
    }

    #[must_use]
    pub fn kernel_stack(&self) -> u32 {
        unsafe { core::ptr::addr_of!((*self.tss.get()).esp0).read_volatile() }
    }

    /// Load the GDT, reload every segment register and load the task
    /// register.
    ///
    /// # Safety
    /// Must run at CPL 0 with interrupts disabled; `self` must stay alive for
    /// as long as the core runs.
    #[cfg(target_arch = "x86")]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn load(&'static self) {
        use kernel_cpu::registers::KERNEL_CODE_SELECTOR;

        let gdtr = DescriptorTablePointer {
            limit: (size_of::<[SegmentDescriptor; GDT_ENTRIES]>() - 1) as u16,
            base: self.gdt.as_ptr() as u32,
        };
        unsafe {
            core::arch::asm!(
                "lgdt ({gdtr})",
                // Far return to reload CS.
                "pushl ${code}",
                "pushl $2f",
                "lretl",
                "2:",
                "movw ${data}, %ax",
                "movw %ax, %ds",
                "movw %ax, %es",
                "movw %ax, %fs",
                "movw %ax, %gs",
                "movw %ax, %ss",
                "ltr {tss:x}",
                gdtr = in(reg) &raw const gdtr,
                code = const KERNEL_CODE_SELECTOR,
                data = const KERNEL_DATA_SELECTOR,
                tss = in(reg) TSS_SELECTOR,
                out("eax") _,
                options(att_syntax)
            );
        }
    }
}

/// Operand of `lgdt`/`lidt`.
#[repr(C, packed)]
pub struct DescriptorTablePointer {
    pub limit: u16,
    pub base: u32,
}
