//! Boot-time construction of the physical and virtual memory managers.
//!
//! The loader's memory map is decoded once, the physical memory manager is
//! built from it and the virtual memory manager creates the kernel space.
//! Both live in [`SyncOnceCell`]s for the rest of the kernel's lifetime.
//!
//! Until [`VirtualMemoryManager::load_kernel_space`] runs, the boot page
//! directory is active, which only maps the first [`BOOT_MAPPED`] bytes of
//! physical memory. The multiboot structures, the kernel image and the first
//! page-table frames all have to lie below that line.

use crate::boot::BOOT_MAPPED;
use alloc::vec::Vec;
use kernel_alloc::{PhysicalMemoryManager, PmmError, VmmError};
use kernel_info::boot::{KernelImage, MemoryMapEntry, MemoryMapIter, MultibootInfo};
use kernel_sync::SyncOnceCell;

static PMM: SyncOnceCell<PhysicalMemoryManager> = SyncOnceCell::new();

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootMemoryError {
    #[error("bootloader magic {0:#010x} is not multiboot")]
    BadMagic(u32),
    #[error("the bootloader reported neither a memory map nor memory sizes")]
    NoMemoryInfo,
    #[error("{what} at {start:#x}..{end:#x} is not covered by the boot mapping")]
    NotBootMapped {
        what: &'static str,
        start: u64,
        end: u64,
    },
    #[error("memory managers are already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Physical(#[from] PmmError),
    #[error(transparent)]
    Virtual(#[from] VmmError),
}

/// The physical memory manager.
///
/// # Panics
/// Before [`init`].
pub fn pmm() -> &'static PhysicalMemoryManager {
    PMM.get().unwrap_or_else(|| panic!("physical memory manager not initialized"))
}

fn ensure_boot_mapped(what: &'static str, start: u64, len: u64) -> Result<(), BootMemoryError> {
    let end = start.saturating_add(len);
    if end > u64::from(BOOT_MAPPED) {
        return Err(BootMemoryError::NotBootMapped { what, start, end });
    }
    Ok(())
}

/// Decode the memory map handed over by the loader. `map` holds the raw
/// map buffer if the loader provided one.
///
/// # Errors
/// [`BootMemoryError::NoMemoryInfo`] if neither a map nor the basic memory
/// sizes are available.
pub fn collect_memory_map(
    info: &MultibootInfo,
    map: Option<&[u8]>,
) -> Result<Vec<MemoryMapEntry>, BootMemoryError> {
    if let Some(bytes) = map.filter(|_| info.has_memory_map()) {
        let entries: Vec<MemoryMapEntry> = MemoryMapIter::new(bytes).collect();
        if !entries.is_empty() {
            return Ok(entries);
        }
    }
    info.upper_memory()
        .map(|entry| alloc::vec![entry])
        .ok_or(BootMemoryError::NoMemoryInfo)
}

/// Check that the loaded image fits under the boot mapping.
///
/// # Errors
/// [`BootMemoryError::NotBootMapped`] otherwise.
pub fn check_image(image: &KernelImage) -> Result<(), BootMemoryError> {
    ensure_boot_mapped(
        "kernel image",
        u64::from(image.start.as_u32()),
        u64::from(image.size()),
    )
}

#[cfg(target_arch = "x86")]
pub use hw::{KernelVmm, init, try_vmm, vmm};

#[cfg(target_arch = "x86")]
mod hw {
    use super::{BootMemoryError, PMM, check_image, collect_memory_map, ensure_boot_mapped};
    use crate::boot::kernel_image;
    use kernel_alloc::phys_mapper::DirectMapper;
    use kernel_alloc::{PhysicalMemoryManager, VirtualMemoryManager};
    use kernel_info::boot::{MULTIBOOT_BOOTLOADER_MAGIC, MultibootInfo};
    use kernel_info::memory::{DIRECT_MAP_SIZE, physical_to_direct_map};
    use kernel_sync::SyncOnceCell;
    use kernel_vmem::HardwarePagingUnit;

    pub type KernelVmm = VirtualMemoryManager<'static, DirectMapper, HardwarePagingUnit>;

    static VMM: SyncOnceCell<KernelVmm> = SyncOnceCell::new();

    /// The virtual memory manager.
    ///
    /// # Panics
    /// Before [`init`].
    pub fn vmm() -> &'static KernelVmm {
        VMM.get().unwrap_or_else(|| panic!("virtual memory manager not initialized"))
    }

    /// The virtual memory manager, if it already exists.
    pub fn try_vmm() -> Option<&'static KernelVmm> {
        VMM.get()
    }

    /// Build both memory managers from the multiboot information and switch
    /// to the kernel space.
    ///
    /// # Errors
    /// See [`BootMemoryError`].
    ///
    /// # Safety
    /// `info` must be the physical address the loader passed in `EBX`; the
    /// boot page directory must be active.
    pub unsafe fn init(magic: u32, info: *const MultibootInfo) -> Result<(), BootMemoryError> {
        if magic != MULTIBOOT_BOOTLOADER_MAGIC {
            return Err(BootMemoryError::BadMagic(magic));
        }

        let info_pa = info as u32;
        ensure_boot_mapped("multiboot info", u64::from(info_pa), size_of::<MultibootInfo>() as u64)?;
        let Some(info_va) = physical_to_direct_map(info_pa) else {
            return Err(BootMemoryError::NoMemoryInfo);
        };
        let info = unsafe { (info_va as *const MultibootInfo).read_unaligned() };

        let map = if info.has_memory_map() {
            ensure_boot_mapped("memory map", u64::from(info.mmap_addr), u64::from(info.mmap_length))?;
            physical_to_direct_map(info.mmap_addr).map(|va| unsafe {
                core::slice::from_raw_parts(va as *const u8, info.mmap_length as usize)
            })
        } else {
            None
        };
        let entries = collect_memory_map(&info, map)?;
        for entry in &entries {
            log::debug!(
                "memory map: {:#012x}..{:#012x} {:?}",
                entry.base,
                entry.end(),
                entry.kind
            );
        }

        let image = kernel_image();
        check_image(&image)?;

        let pmm = PhysicalMemoryManager::new(entries, image, u64::from(DIRECT_MAP_SIZE))?;
        PMM.set(pmm).map_err(|_| BootMemoryError::AlreadyInitialized)?;
        let pmm = super::pmm();

        // The trampoline frame has to be claimed before page tables take it.
        crate::smp::reserve_trampoline(pmm);

        let vmm = VirtualMemoryManager::new(pmm, DirectMapper, HardwarePagingUnit)?;
        VMM.set(vmm).map_err(|_| BootMemoryError::AlreadyInitialized)?;
        let vmm = self::vmm();
        vmm.load_kernel_space();

        let stats = pmm.stats();
        log::info!(
            "memory: {} KiB total, {} KiB free, {} KiB reserved, kernel directory {}",
            stats.total / 1024,
            stats.free / 1024,
            stats.explicitly_used / 1024,
            vmm.kernel_directory()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryKind;
    use kernel_memory_addresses::PhysicalAddress;

    fn record(base: u64, length: u64, kind: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&20u32.to_le_bytes());
        v.extend_from_slice(&base.to_le_bytes());
        v.extend_from_slice(&length.to_le_bytes());
        v.extend_from_slice(&kind.to_le_bytes());
        v
    }

    #[test]
    fn prefers_the_memory_map() {
        let mut raw = record(0, 0x9_FC00, 1);
        raw.extend(record(0x10_0000, 0x3F0_0000, 1));
        let info = MultibootInfo {
            flags: (1 << 6) | 1,
            mem_upper: 1024,
            mmap_length: raw.len() as u32,
            ..MultibootInfo::default()
        };

        let entries = collect_memory_map(&info, Some(&raw)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].end(), 0x400_0000);
    }

    #[test]
    fn falls_back_to_memory_sizes() {
        let info = MultibootInfo {
            flags: 1,
            mem_upper: 64 * 1024,
            ..MultibootInfo::default()
        };
        let entries = collect_memory_map(&info, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, MemoryKind::Available);
        assert_eq!(entries[0].end(), 0x10_0000 + 64 * 1024 * 1024);
    }

    #[test]
    fn no_memory_information_is_an_error() {
        let info = MultibootInfo::default();
        assert_eq!(
            collect_memory_map(&info, None),
            Err(BootMemoryError::NoMemoryInfo)
        );
    }

    #[test]
    fn image_must_fit_the_boot_mapping() {
        let fits = KernelImage {
            start: PhysicalAddress::new(0x10_0000),
            end: PhysicalAddress::new(0x0A0_0000),
        };
        assert!(check_image(&fits).is_ok());

        let too_big = KernelImage {
            start: PhysicalAddress::new(0x10_0000),
            end: PhysicalAddress::new(BOOT_MAPPED + 0x1000),
        };
        assert!(matches!(
            check_image(&too_big),
            Err(BootMemoryError::NotBootMapped { what: "kernel image", .. })
        ));
    }
}
