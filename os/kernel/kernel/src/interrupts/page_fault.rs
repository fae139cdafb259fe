//! Page faults. There is no demand paging, so every fault is fatal; the
//! handler explains what happened before it panics.

use bitfield_struct::bitfield;

pub const PAGE_FAULT_VECTOR: u8 = 0x0E;

/// Page-fault error code.
///
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u32)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 0 = read, 1 = write.
    pub write: bool,
    /// 1 = the access came from ring 3.
    pub user: bool,
    /// 1 = a reserved bit was set in a paging structure.
    pub reserved_bit: bool,
    /// 1 = instruction fetch.
    pub instruction_fetch: bool,
    /// 1 = protection-key violation.
    pub protection_key: bool,
    /// 1 = shadow stack access.
    pub shadow_stack: bool,
    #[bits(25)]
    __: u32,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            if self.user() {
                "User-mode access to a non-present page"
            } else {
                "Kernel access to a non-present page"
            }
        } else if self.instruction_fetch() {
            "Instruction fetch from a protected page"
        } else if self.user() {
            if self.write() {
                "User-mode write to a supervisor or read-only page"
            } else {
                "User-mode read of a supervisor page"
            }
        } else if self.write() {
            "Kernel write to a read-only page"
        } else {
            "Read access to protected page"
        }
    }
}

#[cfg(target_arch = "x86")]
pub use handler::install;

#[cfg(target_arch = "x86")]
mod handler {
    use super::{PAGE_FAULT_VECTOR, PageFaultError};
    use crate::boot::boot_directory_phys;
    use alloc::sync::Arc;
    use kernel_alloc::AllocationTarget;
    use kernel_cpu::registers::InterruptFrame;
    use kernel_cpu::{HandlerKind, InterruptHandler, Processor};
    use kernel_info::memory::KERNEL_BOUNDARY;
    use kernel_registers::LoadRegisterUnsafe;
    use kernel_registers::cr2::Cr2;
    use kernel_vmem::recursive::{active_directory_entry, active_table_entry};
    use kernel_vmem::{HardwarePagingUnit, PagingUnit};

    struct PageFaultHandler;

    impl InterruptHandler for PageFaultHandler {
        fn handle(&self, processor: &Processor, frame: &mut InterruptFrame) {
            let address = unsafe { Cr2::load_unsafe() }.faulting_address();
            let error = PageFaultError::from_bits(frame.error_code);

            log::error!(
                "PAGE FAULT on cpu{}: cr2={address} err={:#x} eip={:#010x}",
                processor.index(),
                error.into_bits(),
                frame.eip,
            );
            log::error!("{}", error.explain());

            // Whatever space the core had loaded, as the MMU saw it. The boot
            // directory has no recursive slot.
            let window = HardwarePagingUnit;
            if window.active_directory() != boot_directory_phys() {
                match unsafe { active_table_entry(&window, address) } {
                    Some(pte) => log::error!("active pte {:#010x}", pte.into_bits()),
                    None => log::error!(
                        "active pde {:#010x}, no page table",
                        unsafe { active_directory_entry(&window, address) }.into_bits()
                    ),
                }
            }

            let current = processor.scheduler().current();
            match current {
                Some(id) => log::error!("while running thread {id}"),
                None => log::error!("before the first thread ran"),
            }

            if let Some(vmm) = crate::memory::try_vmm()
                && address.as_u32() >= KERNEL_BOUNDARY
            {
                match vmm.find_region(AllocationTarget::Kernel, address.as_u32()) {
                    Some(region) => log::error!("inside kernel region {:?} ({:?})", region.region, region.config),
                    None => log::error!("no kernel region covers the address"),
                }
            }

            panic!("page fault at {address}: {}", error.explain());
        }
    }

    pub fn install(processor: &Processor) {
        processor.register_interrupt_handler(PAGE_FAULT_VECTOR, Arc::new(PageFaultHandler), HandlerKind::Generic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_error_bits() {
        let err = PageFaultError::from_bits(0b0111);
        assert!(err.present());
        assert!(err.write());
        assert!(err.user());
        assert!(!err.instruction_fetch());
        assert_eq!(err.explain(), "User-mode write to a supervisor or read-only page");
    }

    #[test]
    fn explains_missing_kernel_page() {
        let err = PageFaultError::from_bits(0b0010);
        assert_eq!(err.explain(), "Kernel access to a non-present page");
    }

    #[test]
    fn reserved_bit_wins() {
        let err = PageFaultError::new().with_present(true).with_reserved_bit(true);
        assert_eq!(err.explain(), "Reserved bit set in a paging structure");
    }
}
