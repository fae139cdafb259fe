//! # Kernel Heap
//!
//! The global allocator behind `Box`, `Vec` and friends: kernel stacks,
//! thread records, message queues and the memory managers' own bookkeeping
//! all live here.
//!
//! ## Design outline
//! - **Storage**: a `.bss`-backed array ([`HEAP_SIZE`] bytes). It lies inside
//!   the kernel image, so the physical memory manager never hands its frames
//!   out and the boot page directory already maps it.
//! - **Free list**: every free block starts with a [`FreeBlock`] header that
//!   records the block size. Blocks are kept in address order and merged with
//!   their neighbours on release.
//! - **Allocation**: first fit with alignment. A block is split into up to
//!   three parts; the head and tail remainders go back to the list.
//! - **Release**: `dealloc` gets the original `Layout`, which determines the
//!   block size again; no header is kept for live allocations.
//! - **Synchronization**: a [`SpinLock`], which also keeps the core in a
//!   critical section while the list is edited.

use core::alloc::Layout;
use core::ptr::{self, null_mut};
use kernel_sync::SpinLock;

/// Header of a free block. `size` covers the header itself.
#[repr(C)]
struct FreeBlock {
    size: usize,
    next: *mut FreeBlock,
}

/// Every block boundary is a multiple of this.
const BLOCK_ALIGN: usize = align_of::<FreeBlock>();

/// A free block must be able to hold its header.
const MIN_BLOCK: usize = size_of::<FreeBlock>();

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Bytes a block for `layout` occupies.
const fn block_size(layout: &Layout) -> usize {
    let size = if layout.size() < MIN_BLOCK {
        MIN_BLOCK
    } else {
        layout.size()
    };
    align_up(size, BLOCK_ALIGN)
}

/// Address-ordered first-fit free list.
///
/// # Invariants
/// - Blocks never overlap and are sorted by address.
/// - No two blocks are adjacent; they would have been merged.
/// - Every block is at least [`MIN_BLOCK`] bytes and [`BLOCK_ALIGN`] aligned.
pub struct FreeList {
    head: *mut FreeBlock,
    free: usize,
}

// SAFETY: the list only points into memory it was given exclusively and is
// only touched behind a lock.
unsafe impl Send for FreeList {}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: null_mut(),
            free: 0,
        }
    }

    /// Bytes currently on the list.
    #[must_use]
    pub const fn free_bytes(&self) -> usize {
        self.free
    }

    /// Number of blocks on the list.
    #[must_use]
    pub fn fragments(&self) -> usize {
        let mut count = 0;
        let mut current = self.head;
        while !current.is_null() {
            count += 1;
            current = unsafe { (*current).next };
        }
        count
    }

    /// Hand `[start, start + size)` to the list. The range is trimmed to
    /// block alignment.
    ///
    /// # Safety
    /// The range must be valid, writable and owned by the list from now on.
    pub unsafe fn add_region(&mut self, start: usize, size: usize) {
        let aligned = align_up(start, BLOCK_ALIGN);
        let end = (start + size) & !(BLOCK_ALIGN - 1);
        if end > aligned && end - aligned >= MIN_BLOCK {
            unsafe { self.insert(aligned, end - aligned) };
        }
    }

    /// First fit for `layout`, or null if no block is large enough.
    pub fn allocate(&mut self, layout: Layout) -> *mut u8 {
        let need = block_size(&layout);
        let align = layout.align().max(BLOCK_ALIGN);

        let mut prev: *mut FreeBlock = null_mut();
        let mut current = self.head;
        while !current.is_null() {
            let block = current as usize;
            let (size, next) = unsafe { ((*current).size, (*current).next) };
            let block_end = block + size;

            let mut start = align_up(block, align);
            if start != block && start - block < MIN_BLOCK {
                // The head remainder could not hold a header.
                start = align_up(block + MIN_BLOCK, align);
            }
            let end = start + need;
            let fits = end <= block_end && {
                let tail = block_end - end;
                tail == 0 || tail >= MIN_BLOCK
            };

            if fits {
                self.unlink(prev, next);
                self.free -= size;
                if start > block {
                    unsafe { self.insert(block, start - block) };
                }
                if block_end > end {
                    unsafe { self.insert(end, block_end - end) };
                }
                return start as *mut u8;
            }

            prev = current;
            current = next;
        }
        null_mut()
    }

    /// Return an allocation to the list.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this list with
    /// the same `layout`, and must not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        unsafe { self.insert(ptr as usize, block_size(&layout)) };
    }

    fn unlink(&mut self, prev: *mut FreeBlock, next: *mut FreeBlock) {
        if prev.is_null() {
            self.head = next;
        } else {
            unsafe { (*prev).next = next };
        }
    }

    /// Insert `[addr, addr + size)` in address order and merge it with its
    /// neighbours.
    ///
    /// # Safety
    /// The range must be free, aligned and at least [`MIN_BLOCK`] bytes.
    unsafe fn insert(&mut self, addr: usize, size: usize) {
        debug_assert!(addr.is_multiple_of(BLOCK_ALIGN) && size >= MIN_BLOCK);

        let mut prev: *mut FreeBlock = null_mut();
        let mut next = self.head;
        while !next.is_null() && (next as usize) < addr {
            prev = next;
            next = unsafe { (*next).next };
        }

        if !next.is_null() {
            assert!(addr + size <= next as usize, "heap block {addr:#x} freed twice");
        }
        if !prev.is_null() {
            let prev_end = prev as usize + unsafe { (*prev).size };
            assert!(prev_end <= addr, "heap block {addr:#x} freed twice");
        }

        let block = addr as *mut FreeBlock;
        unsafe { ptr::write(block, FreeBlock { size, next }) };
        self.free += size;

        if !next.is_null() && addr + size == next as usize {
            unsafe {
                (*block).size += (*next).size;
                (*block).next = (*next).next;
            }
        }

        if prev.is_null() {
            self.head = block;
        } else if prev as usize + unsafe { (*prev).size } == addr {
            unsafe {
                (*prev).size += (*block).size;
                (*prev).next = (*block).next;
            }
        } else {
            unsafe { (*prev).next = block };
        }
    }
}

/// Total size of the statically reserved heap.
pub const HEAP_SIZE: usize = 8 * 1024 * 1024;

/// Global allocator state. The heap is handed over on first use.
struct KernelHeap {
    list: SpinLock<(bool, FreeList)>,
}

impl KernelHeap {
    const fn new() -> Self {
        Self {
            list: SpinLock::new((false, FreeList::new())),
        }
    }

    fn with_list<R>(&self, f: impl FnOnce(&mut FreeList) -> R) -> R {
        let mut guard = self.list.lock();
        let (initialized, list) = &mut *guard;
        if !*initialized {
            #[cfg(target_arch = "x86")]
            unsafe {
                list.add_region((&raw mut heap::HEAP).cast::<u8>() as usize, HEAP_SIZE);
            }
            *initialized = true;
        }
        f(list)
    }

    /// Free bytes on the heap.
    fn free_bytes(&self) -> usize {
        self.with_list(|list| list.free_bytes())
    }
}

static KERNEL_HEAP: KernelHeap = KernelHeap::new();

/// Free bytes on the kernel heap.
#[must_use]
pub fn heap_free_bytes() -> usize {
    KERNEL_HEAP.free_bytes()
}

#[cfg(target_arch = "x86")]
mod heap {
    use super::{HEAP_SIZE, KERNEL_HEAP};
    use core::alloc::{GlobalAlloc, Layout};

    #[repr(align(16))]
    pub(super) struct HeapMem(pub(super) [u8; HEAP_SIZE]);

    #[unsafe(link_section = ".bss.heap")]
    pub(super) static mut HEAP: HeapMem = HeapMem([0; HEAP_SIZE]);

    struct KernelAllocator;

    #[global_allocator]
    static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            KERNEL_HEAP.with_list(|list| list.allocate(layout))
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            KERNEL_HEAP.with_list(|list| unsafe { list.deallocate(ptr, layout) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A list over a leaked host buffer.
    fn list_with(bytes: usize) -> (FreeList, usize) {
        let buffer: &'static mut [u64] = Vec::leak(vec![0u64; bytes / 8]);
        let start = buffer.as_mut_ptr() as usize;
        let mut list = FreeList::new();
        unsafe { list.add_region(start, bytes) };
        (list, start)
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let (mut list, start) = list_with(4096);
        let a = list.allocate(Layout::from_size_align(24, 8).unwrap()) as usize;
        let b = list.allocate(Layout::from_size_align(100, 64).unwrap()) as usize;
        let c = list.allocate(Layout::from_size_align(1, 1).unwrap()) as usize;

        assert!(a >= start && b >= start && c >= start);
        assert_eq!(b % 64, 0);
        assert!(a + 24 <= b || b + 100 <= a);
        assert!(c + 1 <= a || a + 24 <= c);
        assert!(c + 1 <= b || b + 100 <= c);
    }

    #[test]
    fn freeing_everything_restores_one_block() {
        let (mut list, _) = list_with(8192);
        let before = list.free_bytes();

        let layouts: Vec<Layout> = [8usize, 40, 300, 17, 1024, 64, 5]
            .iter()
            .enumerate()
            .map(|(i, &size)| Layout::from_size_align(size, 1 << (i % 5)).unwrap())
            .collect();
        let blocks: Vec<*mut u8> = layouts.iter().map(|l| list.allocate(*l)).collect();
        assert!(blocks.iter().all(|p| !p.is_null()));
        assert!(list.free_bytes() < before);

        // Release in a scrambled order to exercise both merge directions.
        for i in [3usize, 0, 6, 2, 5, 1, 4] {
            unsafe { list.deallocate(blocks[i], layouts[i]) };
        }
        assert_eq!(list.free_bytes(), before);
        assert_eq!(list.fragments(), 1);
    }

    #[test]
    fn exhaustion_returns_null() {
        let (mut list, _) = list_with(1024);
        assert!(list.allocate(Layout::from_size_align(2048, 8).unwrap()).is_null());
        let all = list.allocate(Layout::from_size_align(1024, 8).unwrap());
        assert!(!all.is_null());
        assert!(list.allocate(Layout::from_size_align(8, 8).unwrap()).is_null());
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_is_caught() {
        let (mut list, _) = list_with(1024);
        let layout = Layout::from_size_align(64, 8).unwrap();
        let p = list.allocate(layout);
        unsafe {
            list.deallocate(p, layout);
            list.deallocate(p, layout);
        }
    }
}
