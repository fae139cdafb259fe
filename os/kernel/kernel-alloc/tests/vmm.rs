use kernel_alloc::region_tree::Span;
use kernel_alloc::{AllocationTarget, MemoryRegion, PhysicalMemoryManager, VirtualMemoryManager, VmmStats};
use kernel_info::boot::{KernelImage, MemoryKind, MemoryMapEntry};
use kernel_info::memory::{KERNEL_BOUNDARY, KERNEL_REGIONS_START, USERSPACE_START};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::testing::{RecordingUnit, TestPhys};
use kernel_vmem::{MappingConfig, PagingUnit, PhysMapper};

const MEMORY: u64 = 8 * 1024 * 1024;

type Vmm<'p> = VirtualMemoryManager<'p, TestPhys, RecordingUnit>;

fn pmm() -> PhysicalMemoryManager {
    let map = [MemoryMapEntry {
        base: 0,
        length: MEMORY,
        kind: MemoryKind::Available,
    }];
    let image = KernelImage {
        start: PhysicalAddress::new(0x10_0000),
        end: PhysicalAddress::new(0x10_0000),
    };
    PhysicalMemoryManager::new(map, image, MEMORY).unwrap()
}

fn vmm(pmm: &PhysicalMemoryManager) -> Vmm<'_> {
    let frames = usize::try_from(MEMORY / 4096).unwrap();
    VirtualMemoryManager::new(pmm, TestPhys::with_frames(frames), RecordingUnit::default()).unwrap()
}

fn bytes<'a>(vmm: &Vmm<'_>, pa: PhysicalAddress) -> &'a mut [u8; 4096] {
    unsafe { vmm.mapper().phys_to_mut(pa) }
}

fn assert_tiles(spans: &[Span], bound: u64) {
    let mut cursor = 0;
    let mut last_free = None;
    for span in spans {
        let region = span.region();
        assert_eq!(u64::from(region.address), cursor, "gap or overlap at {region:?}");
        let free = matches!(span, Span::Free(_));
        if free {
            assert_ne!(last_free, Some(true), "two adjacent free spans");
        }
        last_free = Some(free);
        cursor = region.end();
    }
    assert_eq!(cursor, bound);
}

#[test]
fn small_kernel_buffer_round_trip() {
    let pmm = pmm();
    let vmm = vmm(&pmm);
    let before = pmm.stats();

    let region = vmm.allocate_region(AllocationTarget::Kernel, 0x500, MappingConfig::kernel_data());
    assert!(region.present && region.mapped && region.allocated);
    assert_eq!(region.size(), 0x1000);
    assert!(region.address().as_u32() >= KERNEL_REGIONS_START);

    let page = bytes(&vmm, region.physical);
    assert!(page.iter().all(|&b| b == 0));
    page[0] = 0xAA;
    page[0x4FF] = 0x55;
    assert_eq!(
        vmm.as_physical(AllocationTarget::Kernel, region.address() + 0x4FF),
        region.physical + 0x4FF
    );

    vmm.free(AllocationTarget::Kernel, &region);
    assert_eq!(pmm.stats(), before);
    assert!(vmm.find_region(AllocationTarget::Kernel, region.address().as_u32()).is_none());
}

#[test]
fn many_allocations_restore_statistics() {
    let pmm = pmm();
    let vmm = vmm(&pmm);
    let before = pmm.stats();
    let kernel_before = vmm.stats(None);

    let mut seed = 0x2545_F491u32;
    let mut regions: Vec<MemoryRegion> = (0..100)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let size = u64::from(seed % 0x6000) + 1;
            vmm.allocate_region(AllocationTarget::Kernel, size, MappingConfig::kernel_data())
        })
        .collect();
    assert_eq!(vmm.stats(None).kernel_regions, kernel_before.kernel_regions + 100);

    // Free in an interleaved order.
    let odd: Vec<_> = regions.iter().skip(1).step_by(2).copied().collect();
    for region in &odd {
        vmm.free(AllocationTarget::Kernel, region);
    }
    regions.retain(|r| !odd.contains(r));
    for region in regions.iter().rev() {
        vmm.free(AllocationTarget::Kernel, region);
    }

    assert_eq!(pmm.stats(), before);
    assert_eq!(vmm.stats(None), kernel_before);
}

#[test]
fn placement_at_covered_address_is_not_present() {
    let pmm = pmm();
    let vmm = vmm(&pmm);
    let address = KERNEL_REGIONS_START + 0x10_0000;

    let first = vmm.allocate_region_at(AllocationTarget::Kernel, address, 0x3000, MappingConfig::kernel_data());
    assert!(first.present);
    bytes(&vmm, first.physical)[7] = 42;
    let used = pmm.stats();

    let second = vmm.allocate_region_at(
        AllocationTarget::Kernel,
        address + 0x2000,
        0x1000,
        MappingConfig::kernel_data(),
    );
    assert!(!second.present);
    assert_eq!(pmm.stats(), used);
    assert_eq!(vmm.as_physical(AllocationTarget::Kernel, VirtualAddress::new(address)), first.physical);
    assert_eq!(bytes(&vmm, first.physical)[7], 42);

    // The direct map is part of the kernel layout as well.
    let direct = vmm.map_region_at(
        AllocationTarget::Kernel,
        PhysicalAddress::new(0x20_0000),
        0xC000_0000,
        0x1000,
        MappingConfig::kernel_data(),
    );
    assert!(!direct.present);
}

#[test]
fn kernel_and_user_walks_tile_their_space() {
    let pmm = pmm();
    let vmm = vmm(&pmm);
    let mut space = vmm.create_memory_space();

    for size in [0x1000, 0x5000, 0x2000] {
        vmm.allocate_region(AllocationTarget::Kernel, size, MappingConfig::kernel_data());
        vmm.allocate_region(AllocationTarget::User(&mut space), size, MappingConfig::user_data());
    }
    let freed = vmm.allocate_region(AllocationTarget::User(&mut space), 0x1000, MappingConfig::user_data());
    vmm.allocate_region(AllocationTarget::User(&mut space), 0x1000, MappingConfig::user_data());
    vmm.free(AllocationTarget::User(&mut space), &freed);

    assert_tiles(&vmm.traverse_all(AllocationTarget::Kernel), 1 << 32);
    let user = vmm.traverse_all(AllocationTarget::User(&mut space));
    assert_tiles(&user, u64::from(KERNEL_BOUNDARY));
    assert_eq!(user[0], Span::Free(kernel_alloc::Region::new(0, u64::from(USERSPACE_START))));

    vmm.destroy_memory_space(space);
}

#[test]
fn statistics_cover_the_user_space_passed_in() {
    let pmm = pmm();
    let vmm = vmm(&pmm);
    let mut space = vmm.create_memory_space();
    let kernel = vmm.stats(None);
    assert_eq!((kernel.user_regions, kernel.user_mapped, kernel.user_allocated), (0, 0, 0));

    let data = vmm.allocate_region(AllocationTarget::User(&mut space), 0x3000, MappingConfig::user_data());
    vmm.map_region(
        AllocationTarget::User(&mut space),
        PhysicalAddress::new(0xFEC0_0000),
        0x1000,
        MappingConfig::mmio().with_userspace(true),
    );
    vmm.allocate_region(
        AllocationTarget::User(&mut space),
        0x2000,
        MappingConfig { readable: false, ..MappingConfig::user_data() },
    );

    let stats = vmm.stats(Some(&space));
    assert_eq!(stats.user_regions, 3);
    assert_eq!(stats.user_mapped, 0x4000);
    assert_eq!(stats.user_allocated, 0x3000);
    // User activity leaves the kernel side alone.
    assert_eq!(
        VmmStats { user_regions: 0, user_mapped: 0, user_allocated: 0, ..stats },
        kernel
    );

    vmm.free(AllocationTarget::User(&mut space), &data);
    assert_eq!(vmm.stats(Some(&space)).user_allocated, 0);
    vmm.destroy_memory_space(space);
}

#[test]
fn user_regions_are_user_accessible_and_reuse_holes() {
    let pmm = pmm();
    let vmm = vmm(&pmm);
    let mut space = vmm.create_memory_space();

    let a = vmm.allocate_region(AllocationTarget::User(&mut space), 0x2000, MappingConfig::user_data());
    let b = vmm.allocate_region(AllocationTarget::User(&mut space), 0x1000, MappingConfig::user_data());
    assert_eq!(a.address().as_u32(), USERSPACE_START);
    assert_eq!(b.address().as_u32(), USERSPACE_START + 0x2000);

    vmm.free(AllocationTarget::User(&mut space), &a);
    let c = vmm.allocate_region(AllocationTarget::User(&mut space), 0x1000, MappingConfig::user_data());
    assert_eq!(c.address(), a.address());
    assert_eq!(
        vmm.find_free_region(AllocationTarget::User(&mut space), 0x2000),
        USERSPACE_START + 0x3000
    );
    vmm.destroy_memory_space(space);
}

#[test]
fn copy_is_eager_and_independent() {
    let pmm = pmm();
    let vmm = vmm(&pmm);
    let before = pmm.stats();
    let mut parent = vmm.create_memory_space();

    let data = vmm.allocate_region(AllocationTarget::User(&mut parent), 0x2000, MappingConfig::user_data());
    bytes(&vmm, data.physical + 0x1000)[3] = 9;
    let device = vmm.map_region(
        AllocationTarget::User(&mut parent),
        PhysicalAddress::new(0xFEC0_0000),
        0x1000,
        MappingConfig::mmio().with_userspace(true),
    );
    let guard = vmm.allocate_region(
        AllocationTarget::User(&mut parent),
        0x1000,
        MappingConfig { readable: false, ..MappingConfig::user_data() },
    );
    assert!(!guard.mapped);

    let mut child = vmm.copy_memory_space(&parent);
    let copied = child.find_region(data.address().as_u32()).unwrap();
    assert!(copied.allocated);
    assert_ne!(copied.physical, data.physical);
    assert_eq!(bytes(&vmm, copied.physical + 0x1000)[3], 9);

    bytes(&vmm, copied.physical)[0] = 1;
    assert_eq!(bytes(&vmm, data.physical)[0], 0);

    assert_eq!(
        vmm.as_physical(AllocationTarget::User(&mut child), device.address()),
        PhysicalAddress::new(0xFEC0_0000)
    );
    assert!(!child.find_region(guard.address().as_u32()).unwrap().mapped);
    assert_eq!(child.regions().len(), parent.regions().len());

    vmm.destroy_memory_space(child);
    vmm.destroy_memory_space(parent);
    assert_eq!(pmm.stats(), before);
}

#[test]
fn unaligned_device_memory_keeps_its_offset() {
    let pmm = pmm();
    let vmm = vmm(&pmm);
    let region = vmm.map_physical(PhysicalAddress::new(0xFEE0_0F00), 0x200, MappingConfig::mmio());
    assert_eq!(region.address().as_u32() % 0x1000, 0xF00);
    assert_eq!(region.size(), 0x200);
    assert_eq!(
        vmm.as_physical(AllocationTarget::Kernel, region.address()),
        PhysicalAddress::new(0xFEE0_0F00)
    );
    // Two pages were needed to cover the range.
    let backing = vmm.find_region(AllocationTarget::Kernel, region.address().as_u32()).unwrap();
    assert_eq!(backing.size(), 0x2000);
    assert!(!backing.allocated);

    vmm.free(AllocationTarget::Kernel, &region);
    assert!(vmm.find_region(AllocationTarget::Kernel, region.address().as_u32()).is_none());
}

#[test]
fn loading_a_space_switches_the_directory() {
    let pmm = pmm();
    let vmm = vmm(&pmm);
    let space = vmm.create_memory_space();
    vmm.load_memory_space(&space);
    assert_eq!(vmm.unit().active_directory(), space.directory());
    vmm.load_kernel_space();
    assert_eq!(vmm.unit().active_directory(), vmm.kernel_directory());
    vmm.destroy_memory_space(space);
}

#[test]
#[should_panic(expected = "never placed")]
fn freeing_a_failed_placement_panics() {
    let pmm = pmm();
    let vmm = vmm(&pmm);
    let region = vmm.allocate_region_at(AllocationTarget::Kernel, 0x1000, 0x1000, MappingConfig::kernel_data());
    assert!(!region.present);
    vmm.free(AllocationTarget::Kernel, &region);
}

#[test]
#[should_panic(expected = "no free virtual range")]
fn virtual_exhaustion_panics() {
    let pmm = pmm();
    let vmm = vmm(&pmm);
    let _ = vmm.find_free_region(AllocationTarget::Kernel, 0x4000_0000);
}

#[test]
#[should_panic(expected = "no free physical range")]
fn physical_exhaustion_panics() {
    let pmm = pmm();
    let vmm = vmm(&pmm);
    let _ = vmm.allocate_region(AllocationTarget::Kernel, 2 * MEMORY, MappingConfig::kernel_data());
}
