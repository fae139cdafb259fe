//! # Physical Memory Manager
//!
//! Buddy-style bitmaps over 4 KiB frames. Class `k` tracks blocks of `2^k`
//! frames, for `k` in `0..BUDDY_CLASSES`; a set bit means "used".
//!
//! ```text
//! class 2  [    0    |    1    ]        bit = OR of its two children
//! class 1  [ 0  | 1  | 2  | 3  ]
//! class 0  [0|1|2|3|4|5|6|7]            ground truth
//! ```
//!
//! Class 0 is authoritative. Every change to it is propagated upward, so a
//! block that is free at class `k` is free all the way down. Blocks that hang
//! over the end of managed memory count as used.
//!
//! Requests pick the smallest class whose block covers the size (capped at
//! the largest class, which then takes runs of blocks). Allocations are thus
//! naturally aligned to their class block size.

use alloc::vec::Vec;
use kernel_info::boot::{KernelImage, MemoryMapEntry};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysicalConstraints};

/// Number of buddy classes: 1, 2, 4, … 128 frames.
pub const BUDDY_CLASSES: usize = 8;

const FRAME: u64 = PAGE_SIZE as u64;

/// Allocation and bookkeeping failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PmmError {
    #[error("the memory map reports no usable memory below {limit:#x}")]
    NoUsableMemory { limit: u64 },
    #[error("cannot allocate {bytes} bytes of bitmap bookkeeping")]
    Bookkeeping { bytes: usize },
    #[error("no free physical range of {size:#x} bytes satisfies {constraints:?}")]
    OutOfMemory {
        size: u64,
        constraints: PhysicalConstraints,
    },
    #[error("zero-sized physical allocation")]
    ZeroSize,
}

/// Byte counters of the manager.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PmmStats {
    /// Handed out by `alloc` and not yet freed.
    pub used: u64,
    /// Available and not used in any way.
    pub free: u64,
    /// Reserved up front: kernel image and `mark_used` ranges.
    pub explicitly_used: u64,
    /// All memory the firmware reported as available.
    pub total: u64,
}

struct Bitmap {
    words: Vec<u64>,
    bits: usize,
}

impl Bitmap {
    fn new(bits: usize) -> Result<Self, PmmError> {
        let len = bits.div_ceil(64);
        let mut words = Vec::new();
        words
            .try_reserve_exact(len)
            .map_err(|_| PmmError::Bookkeeping { bytes: len * 8 })?;
        words.resize(len, u64::MAX);
        Ok(Self { words, bits })
    }

    #[inline]
    fn get(&self, bit: usize) -> bool {
        bit >= self.bits || self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    #[inline]
    fn set(&mut self, bit: usize, used: bool) {
        let mask = 1 << (bit % 64);
        if used {
            self.words[bit / 64] |= mask;
        } else {
            self.words[bit / 64] &= !mask;
        }
    }

    /// Whether the word holding `bit` has no free bit at all.
    #[inline]
    fn word_full(&self, bit: usize) -> bool {
        self.words[bit / 64] == u64::MAX
    }
}

struct PmmState {
    classes: [Bitmap; BUDDY_CLASSES],
    last_alloc: [usize; BUDDY_CLASSES],
    frames: usize,
    stats: PmmStats,
}

/// Allocates physically contiguous frame ranges.
///
/// All operations take one spinlock, which also keeps the calling core in a
/// critical section.
pub struct PhysicalMemoryManager {
    state: SpinLock<PmmState>,
}

impl PhysicalMemoryManager {
    /// Build the bitmaps from the firmware memory map.
    ///
    /// Memory at or above `limit` is ignored. Frame 0 stays reserved, and the
    /// kernel image is marked as explicitly used.
    ///
    /// # Errors
    /// - [`PmmError::NoUsableMemory`] if nothing available lies below `limit`.
    /// - [`PmmError::Bookkeeping`] if the bitmaps cannot be allocated.
    pub fn new<I>(memory_map: I, image: KernelImage, limit: u64) -> Result<Self, PmmError>
    where
        I: IntoIterator<Item = MemoryMapEntry>,
    {
        let available: Vec<MemoryMapEntry> = memory_map
            .into_iter()
            .filter(MemoryMapEntry::is_available)
            .filter_map(|entry| entry.clamp(limit))
            .collect();

        let top = available.iter().map(MemoryMapEntry::end).max().unwrap_or(0);
        let frames = usize::try_from(top / FRAME).unwrap_or(usize::MAX);
        if frames <= 1 {
            return Err(PmmError::NoUsableMemory { limit });
        }

        let mut state = PmmState {
            classes: [
                Bitmap::new(frames)?,
                Bitmap::new(frames.div_ceil(2))?,
                Bitmap::new(frames.div_ceil(4))?,
                Bitmap::new(frames.div_ceil(8))?,
                Bitmap::new(frames.div_ceil(16))?,
                Bitmap::new(frames.div_ceil(32))?,
                Bitmap::new(frames.div_ceil(64))?,
                Bitmap::new(frames.div_ceil(128))?,
            ],
            last_alloc: [0; BUDDY_CLASSES],
            frames,
            stats: PmmStats::default(),
        };

        for entry in &available {
            // Only whole frames inside the entry are usable.
            let first = entry.base.div_ceil(FRAME) as usize;
            let end = (entry.end() / FRAME) as usize;
            for frame in first.max(1)..end {
                if state.classes[0].get(frame) {
                    state.classes[0].set(frame, false);
                    state.stats.total += FRAME;
                }
            }
        }
        state.propagate(0, frames);
        state.stats.free = state.stats.total;

        let reserved = state.reserve(u64::from(image.start.as_u32()), u64::from(image.size()));
        log::info!(
            "pmm: {} KiB available in {} frames, kernel image {}..{} reserves {} KiB",
            state.stats.total / 1024,
            frames,
            image.start,
            image.end,
            reserved / 1024
        );

        Ok(Self {
            state: SpinLock::new(state),
        })
    }

    /// Allocate `size` bytes of physically contiguous memory.
    ///
    /// # Panics
    /// On exhaustion; physical memory shortage is fatal.
    #[must_use]
    pub fn alloc(&self, size: u64, constraints: &PhysicalConstraints) -> PhysicalAddress {
        match self.try_alloc(size, constraints) {
            Ok(pa) => pa,
            Err(err) => {
                log::error!("pmm: {err}");
                panic!("physical memory exhausted: {err}");
            }
        }
    }

    /// Allocate `size` bytes of physically contiguous memory.
    ///
    /// # Errors
    /// [`PmmError::OutOfMemory`] if no free range satisfies `constraints`,
    /// [`PmmError::ZeroSize`] for empty requests.
    pub fn try_alloc(
        &self,
        size: u64,
        constraints: &PhysicalConstraints,
    ) -> Result<PhysicalAddress, PmmError> {
        if size == 0 {
            return Err(PmmError::ZeroSize);
        }
        let (class, blocks) = class_for(size);
        let mut state = self.state.lock();
        let Some(block) = state.find_run(class, blocks, constraints) else {
            return Err(PmmError::OutOfMemory {
                size,
                constraints: *constraints,
            });
        };

        let first = block << class;
        let count = blocks << class;
        state.mark(first, count, true);
        for (k, cursor) in state.last_alloc.iter_mut().enumerate() {
            *cursor = (first + count) >> k;
        }
        let bytes = count as u64 * FRAME;
        state.stats.used += bytes;
        state.stats.free -= bytes;

        let pa = PhysicalAddress::new((first as u64 * FRAME) as u32);
        log::trace!("pmm: alloc {size:#x} -> {pa} (class {class})");
        Ok(pa)
    }

    /// Return memory obtained from [`alloc`](Self::alloc) with the same `size`.
    ///
    /// # Panics
    /// If any frame of the range is not currently allocated (double free).
    pub fn free(&self, pa: PhysicalAddress, size: u64) {
        let (class, blocks) = class_for(size.max(1));
        let first = pa.as_u32() as usize / PAGE_SIZE as usize;
        let count = blocks << class;

        let mut state = self.state.lock();
        assert!(
            first + count <= state.frames,
            "free of {pa} + {size:#x} beyond managed memory"
        );
        if let Some(frame) = (first..first + count).find(|&f| !state.classes[0].get(f)) {
            panic!("double free of physical frame {:#x}", frame as u64 * FRAME);
        }
        state.mark(first, count, false);
        let bytes = count as u64 * FRAME;
        state.stats.used -= bytes;
        state.stats.free += bytes;
        log::trace!("pmm: free {pa} ({size:#x})");
    }

    /// Reserve `[pa, pa + size)` for good, e.g. the AP trampoline page.
    ///
    /// Frames already in use are left as they are. Returns the number of bytes
    /// newly reserved.
    pub fn mark_used(&self, pa: PhysicalAddress, size: u64) -> u64 {
        self.state.lock().reserve(pa.as_u64(), size)
    }

    #[must_use]
    pub fn stats(&self) -> PmmStats {
        self.state.lock().stats
    }

    /// Whether the frame at `pa` is currently used.
    #[must_use]
    pub fn is_used(&self, pa: PhysicalAddress) -> bool {
        self.state.lock().classes[0].get(pa.as_u32() as usize / PAGE_SIZE as usize)
    }
}

impl FrameAlloc for PhysicalMemoryManager {
    fn alloc_frame(&self) -> Option<PhysicalPage<Size4K>> {
        self.try_alloc(FRAME, &PhysicalConstraints::ANY)
            .ok()
            .map(PhysicalAddress::page)
    }

    fn free_frame(&self, frame: PhysicalPage<Size4K>) {
        self.free(frame.base(), FRAME);
    }
}

/// Buddy class and number of class blocks for a request of `size` bytes.
fn class_for(size: u64) -> (usize, usize) {
    let frames = size.div_ceil(FRAME);
    let class = (frames.next_power_of_two().trailing_zeros() as usize).min(BUDDY_CLASSES - 1);
    let blocks = frames.div_ceil(1 << class) as usize;
    (class, blocks)
}

impl PmmState {
    /// Set class-0 bits `first..first + count` and refresh the classes above.
    fn mark(&mut self, first: usize, count: usize, used: bool) {
        for frame in first..first + count {
            self.classes[0].set(frame, used);
        }
        self.propagate(first, count);
    }

    fn propagate(&mut self, first: usize, count: usize) {
        let (mut lo, mut hi) = (first, first + count);
        for k in 1..BUDDY_CLASSES {
            lo /= 2;
            hi = hi.div_ceil(2);
            let (below, above) = self.classes.split_at_mut(k);
            let (child, parent) = (&below[k - 1], &mut above[0]);
            for bit in lo..hi.min(parent.bits) {
                parent.set(bit, child.get(2 * bit) || child.get(2 * bit + 1));
            }
        }
    }

    fn reserve(&mut self, base: u64, size: u64) -> u64 {
        let first = (base / FRAME) as usize;
        let end = (base + size).div_ceil(FRAME).min(self.frames as u64) as usize;
        let mut newly = 0;
        for frame in first..end {
            if !self.classes[0].get(frame) {
                self.classes[0].set(frame, true);
                newly += FRAME;
            }
        }
        if first < end {
            self.propagate(first, end - first);
        }
        self.stats.explicitly_used += newly;
        self.stats.free -= newly;
        newly
    }

    /// Search `blocks` consecutive free blocks of `class`, starting at the
    /// class cursor and wrapping around once.
    fn find_run(
        &self,
        class: usize,
        blocks: usize,
        constraints: &PhysicalConstraints,
    ) -> Option<usize> {
        let map = &self.classes[class];
        let block_bytes = FRAME << class;
        let span = blocks as u64 * block_bytes;
        let limit = map.bits.checked_sub(blocks)? + 1;
        let cursor = self.last_alloc[class].min(limit);

        let scan = |range: core::ops::Range<usize>| {
            let mut candidate = range.start;
            while candidate < range.end {
                if candidate % 64 == 0 && map.word_full(candidate) {
                    candidate += 64;
                    continue;
                }
                match (candidate..candidate + blocks).find(|&b| map.get(b)) {
                    Some(used) => candidate = used + 1,
                    None => {
                        if constraints.accepts(candidate as u64 * block_bytes, span) {
                            return Some(candidate);
                        }
                        candidate += 1;
                    }
                }
            }
            None
        };

        scan(cursor..limit).or_else(|| scan(0..cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryKind;

    const MIB: u64 = 1024 * 1024;

    fn entry(base: u64, length: u64, kind: MemoryKind) -> MemoryMapEntry {
        MemoryMapEntry { base, length, kind }
    }

    fn image() -> KernelImage {
        KernelImage {
            start: PhysicalAddress::new(0x10_0000),
            end: PhysicalAddress::new(0x14_0000),
        }
    }

    /// 640 KiB low memory, a hole, then 15 MiB from 1 MiB.
    fn pmm() -> PhysicalMemoryManager {
        let map = [
            entry(0, 0x9_F000, MemoryKind::Available),
            entry(0x9_F000, 0x6_1000, MemoryKind::Reserved),
            entry(MIB, 15 * MIB, MemoryKind::Available),
        ];
        PhysicalMemoryManager::new(map, image(), 512 * MIB).unwrap()
    }

    #[test]
    fn init_accounts_memory() {
        let pmm = pmm();
        let stats = pmm.stats();
        // Frame 0 is never handed out.
        assert_eq!(stats.total, 0x9_F000 - FRAME + 15 * MIB);
        assert_eq!(stats.explicitly_used, 0x4_0000);
        assert_eq!(stats.used, 0);
        assert_eq!(stats.free, stats.total - stats.explicitly_used);
        assert!(pmm.is_used(PhysicalAddress::zero()));
        assert!(pmm.is_used(PhysicalAddress::new(0xA_0000)));
        assert!(pmm.is_used(PhysicalAddress::new(0x10_0000)));
        assert!(!pmm.is_used(PhysicalAddress::new(0x14_0000)));
    }

    #[test]
    fn empty_map_is_rejected() {
        let map = [entry(0, 0x1000, MemoryKind::Available)];
        assert!(matches!(
            PhysicalMemoryManager::new(map, image(), 512 * MIB),
            Err(PmmError::NoUsableMemory { .. })
        ));
    }

    #[test]
    fn limit_clamps_memory() {
        let map = [entry(MIB, 64 * MIB, MemoryKind::Available)];
        let pmm = PhysicalMemoryManager::new(map, image(), 8 * MIB).unwrap();
        assert_eq!(pmm.stats().total, 7 * MIB);
    }

    #[test]
    fn class_selection() {
        assert_eq!(class_for(1), (0, 1));
        assert_eq!(class_for(0x1000), (0, 1));
        assert_eq!(class_for(0x1001), (1, 1));
        assert_eq!(class_for(0x3000), (2, 1));
        assert_eq!(class_for(128 * FRAME), (7, 1));
        assert_eq!(class_for(129 * FRAME), (7, 2));
    }

    #[test]
    fn alloc_free_round_trip() {
        let pmm = pmm();
        let before = pmm.stats();
        let pa = pmm.alloc(0x500, &PhysicalConstraints::ANY);
        assert!(pa.is_aligned::<Size4K>());
        assert!(pmm.is_used(pa));
        assert_eq!(pmm.stats().used, FRAME);
        pmm.free(pa, 0x500);
        assert_eq!(pmm.stats(), before);
    }

    #[test]
    fn allocations_are_class_aligned_and_disjoint() {
        let pmm = pmm();
        let a = pmm.alloc(4 * FRAME, &PhysicalConstraints::ANY);
        let b = pmm.alloc(4 * FRAME, &PhysicalConstraints::ANY);
        assert_eq!(a.as_u64() % (4 * FRAME), 0);
        assert_eq!(b.as_u64() % (4 * FRAME), 0);
        assert!(a.as_u64() + 4 * FRAME <= b.as_u64() || b.as_u64() + 4 * FRAME <= a.as_u64());
    }

    #[test]
    fn large_requests_take_runs_of_top_class_blocks() {
        let pmm = pmm();
        let size = 300 * FRAME;
        let pa = pmm.alloc(size, &PhysicalConstraints::ANY);
        assert_eq!(pa.as_u64() % (128 * FRAME), 0);
        // 300 frames round up to three 128-frame blocks.
        assert_eq!(pmm.stats().used, 384 * FRAME);
        pmm.free(pa, size);
        assert_eq!(pmm.stats().used, 0);
    }

    #[test]
    fn constraints_are_honored() {
        let pmm = pmm();
        let low = PhysicalConstraints {
            min_address: 0,
            max_address: 0xF_FFFF,
            boundary: 0,
        };
        let pa = pmm.alloc(2 * FRAME, &low);
        assert!(pa.as_u64() + 2 * FRAME <= MIB);

        let high = PhysicalConstraints {
            min_address: 8 * MIB as u32,
            ..PhysicalConstraints::ANY
        };
        assert!(pmm.alloc(FRAME, &high).as_u64() >= 8 * MIB);

        let impossible = PhysicalConstraints {
            min_address: 0x20_0000,
            max_address: 0x20_0FFF,
            boundary: 0,
        };
        assert!(matches!(
            pmm.try_alloc(2 * FRAME, &impossible),
            Err(PmmError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn higher_classes_reflect_class_zero() {
        let pmm = pmm();
        let pa = pmm.alloc(FRAME, &PhysicalConstraints::ANY);
        let state = pmm.state.lock();
        let frame = pa.as_u32() as usize / 4096;
        for k in 0..BUDDY_CLASSES {
            assert!(state.classes[k].get(frame >> k), "class {k}");
        }
    }

    #[test]
    fn mark_used_reserves_explicitly() {
        let pmm = pmm();
        let before = pmm.stats();
        assert_eq!(pmm.mark_used(PhysicalAddress::new(0x8000), FRAME), FRAME);
        assert_eq!(pmm.mark_used(PhysicalAddress::new(0x8000), FRAME), 0);
        let after = pmm.stats();
        assert_eq!(after.explicitly_used, before.explicitly_used + FRAME);
        assert_eq!(after.free, before.free - FRAME);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let pmm = pmm();
        let pa = pmm.alloc(FRAME, &PhysicalConstraints::ANY);
        pmm.free(pa, FRAME);
        pmm.free(pa, FRAME);
    }

    #[test]
    fn exhaustion_is_reported() {
        let map = [entry(MIB, 8 * FRAME, MemoryKind::Available)];
        let pmm = PhysicalMemoryManager::new(map, image(), 512 * MIB).unwrap();
        // The kernel image covers the whole range.
        assert_eq!(pmm.stats().free, 0);
        assert!(pmm.try_alloc(FRAME, &PhysicalConstraints::ANY).is_err());
        assert!(pmm.alloc_frame().is_none());
    }
}
