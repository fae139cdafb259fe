//! Host-side stand-ins for physical memory, the frame allocator and the MMU.
//!
//! Physical address `n * 4096` is frame `n` of a heap buffer, so paging
//! structures can be built and inspected without hardware.

use crate::recursive::RecursiveWindow;
use crate::{FrameAlloc, PagingUnit, PhysMapper};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinLock;

#[repr(C, align(4096))]
struct Aligned4K([u8; 4096]);

/// A fake physical memory of `n` frames.
pub struct TestPhys {
    frames: Box<[UnsafeCell<Aligned4K>]>,
}

// Tests hand out disjoint frames to each user.
unsafe impl Sync for TestPhys {}

impl TestPhys {
    #[must_use]
    pub fn with_frames(n: usize) -> Self {
        let frames = (0..n).map(|_| UnsafeCell::new(Aligned4K([0; 4096]))).collect();
        Self { frames }
    }

    /// Bytes of physical memory covered.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.frames.len() as u64 * 4096
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let index = pa.as_u32() as usize / 4096;
        let offset = pa.as_u32() as usize % 4096;
        assert!(index < self.frames.len(), "{pa} outside of test memory");
        assert!(offset + size_of::<T>() <= 4096, "access crosses a frame");
        let base = self.frames[index].get().cast::<u8>();
        unsafe { &mut *base.add(offset).cast::<T>() }
    }
}

#[derive(Default)]
struct FrameState {
    free: Vec<PhysicalPage<Size4K>>,
    allocated: usize,
    frees: usize,
}

/// Hands out frames `first..end` of a [`TestPhys`].
pub struct TestFrames {
    state: SpinLock<FrameState>,
}

impl TestFrames {
    #[must_use]
    pub fn new(first: usize, end: usize) -> Self {
        let free = (first..end)
            .rev()
            .map(|n| PhysicalAddress::new((n * 4096) as u32).page())
            .collect();
        Self {
            state: SpinLock::new(FrameState {
                free,
                ..FrameState::default()
            }),
        }
    }

    /// Frames currently handed out.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }

    /// Total number of frees seen.
    #[must_use]
    pub fn frees(&self) -> usize {
        self.state.lock().frees
    }
}

impl FrameAlloc for TestFrames {
    fn alloc_frame(&self) -> Option<PhysicalPage<Size4K>> {
        let mut state = self.state.lock();
        let frame = state.free.pop()?;
        state.allocated += 1;
        Some(frame)
    }

    fn free_frame(&self, frame: PhysicalPage<Size4K>) {
        let mut state = self.state.lock();
        assert!(!state.free.contains(&frame), "double free of {frame:?}");
        state.free.push(frame);
        state.allocated -= 1;
        state.frees += 1;
    }
}

/// Records `CR3` loads and invalidations instead of touching hardware.
#[derive(Default)]
pub struct RecordingUnit {
    active: SpinLock<PhysicalAddress>,
    invalidated: SpinLock<Vec<VirtualAddress>>,
}

impl RecordingUnit {
    #[must_use]
    pub fn invalidated(&self) -> Vec<VirtualAddress> {
        self.invalidated.lock().clone()
    }

    pub fn clear(&self) {
        self.invalidated.lock().clear();
    }
}

impl PagingUnit for RecordingUnit {
    fn active_directory(&self) -> PhysicalAddress {
        *self.active.lock()
    }

    unsafe fn load_directory(&self, directory: PhysicalAddress) {
        *self.active.lock() = directory;
    }

    fn invalidate(&self, va: VirtualAddress) {
        self.invalidated.lock().push(va);
    }
}

/// Resolves window addresses the way the MMU would, starting from the
/// directory loaded in a [`RecordingUnit`].
pub struct WindowWalk<'a> {
    phys: &'a TestPhys,
    unit: &'a RecordingUnit,
}

impl<'a> WindowWalk<'a> {
    #[must_use]
    pub const fn new(phys: &'a TestPhys, unit: &'a RecordingUnit) -> Self {
        Self { phys, unit }
    }
}

impl RecursiveWindow for WindowWalk<'_> {
    unsafe fn read_entry(&self, va: VirtualAddress) -> u32 {
        let directory = self.unit.active_directory().page::<Size4K>();
        let pde = self.phys.directory_mut(directory).get(va.directory_index());
        let Some(table) = pde.table_frame() else {
            panic!("window access to {va} faults in the directory");
        };
        let Some(frame) = self.phys.table_mut(table).get(va.table_index()).frame_page() else {
            panic!("window access to {va} faults in the table");
        };
        unsafe { *self.phys.phys_to_mut::<u32>(frame.join(va.offset::<Size4K>())) }
    }
}
