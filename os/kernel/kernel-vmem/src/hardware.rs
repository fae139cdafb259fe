//! The paging unit of the running core.

use crate::PagingUnit;
use crate::recursive::RecursiveWindow;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr3::Cr3;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// `CR3` and `invlpg` of the core executing the call.
#[derive(Debug, Default, Copy, Clone)]
pub struct HardwarePagingUnit;

impl PagingUnit for HardwarePagingUnit {
    fn active_directory(&self) -> PhysicalAddress {
        unsafe { Cr3::load_unsafe() }.directory_phys()
    }

    unsafe fn load_directory(&self, directory: PhysicalAddress) {
        unsafe { Cr3::from_directory_phys(directory).store_unsafe() }
    }

    fn invalidate(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
        }
    }
}

impl RecursiveWindow for HardwarePagingUnit {
    unsafe fn read_entry(&self, va: VirtualAddress) -> u32 {
        unsafe { va.as_mut_ptr::<u32>().read_volatile() }
    }
}
