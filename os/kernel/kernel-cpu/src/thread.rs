//! Threads and their stacks.

use crate::registers::ThreadRegisters;
use alloc::boxed::Box;
use alloc::vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_alloc::MemoryRegion;
use kernel_info::memory::KERNEL_STACK_SIZE;
use kernel_memory_addresses::PhysicalAddress;

/// Thread entry point. Threads never return; they terminate themselves.
pub type ThreadEntry = extern "C" fn() -> !;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

impl ThreadId {
    fn allocate() -> Self {
        Self(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Started, never scheduled.
    Ready,
    /// On the CPU of its core.
    Running,
    /// Preempted; runs again on its turn.
    Waiting,
    /// Sleeping on a mutex until woken.
    Blocked,
    Suspended,
    /// Waiting for a deadline on the core's millisecond clock.
    Sleeping,
    /// Finished. The stack is freed by the owning core's scheduler.
    Terminated,
}

#[repr(C, align(16))]
#[derive(Copy, Clone)]
struct StackChunk([u8; 16]);

/// A kernel stack on the kernel heap. Interrupts taken while the thread runs
/// land here.
pub struct KernelStack {
    chunks: Box<[StackChunk]>,
}

impl KernelStack {
    #[must_use]
    pub fn new(size: usize) -> Self {
        let chunks = vec![StackChunk([0; 16]); size.div_ceil(16)];
        Self {
            chunks: chunks.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.chunks.len() * 16
    }

    /// Lowest address of the stack.
    #[must_use]
    pub fn bottom(&self) -> usize {
        self.chunks.as_ptr().addr()
    }

    /// One past the highest address; the initial stack pointer.
    #[must_use]
    pub fn top(&self) -> usize {
        self.bottom() + self.size()
    }
}

impl fmt::Debug for KernelStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelStack({:#x}..{:#x})", self.bottom(), self.top())
    }
}

pub struct Thread {
    id: ThreadId,
    name: &'static str,
    pub(crate) registers: ThreadRegisters,
    /// Registers hold a live snapshot rather than the start state.
    pub(crate) started: bool,
    pub(crate) state: ThreadState,
    /// The mutex this thread is blocked on.
    pub(crate) blocked_on: Option<usize>,
    pub(crate) wake_at: Option<u64>,
    kernel_stack: KernelStack,
    user_stack: Option<MemoryRegion>,
}

impl Thread {
    /// A ring-0 thread running `entry` on a fresh kernel stack.
    #[must_use]
    pub fn kernel(name: &'static str, entry: ThreadEntry, directory: PhysicalAddress) -> Self {
        let kernel_stack = KernelStack::new(KERNEL_STACK_SIZE);
        let registers = ThreadRegisters::kernel(
            address_of(entry),
            truncate(kernel_stack.top()),
            directory,
        );
        Self::with(name, registers, kernel_stack, None)
    }

    /// A ring-3 thread. `user_stack` must be mapped in the space of
    /// `directory`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn user(
        name: &'static str,
        entry: u32,
        directory: PhysicalAddress,
        user_stack: MemoryRegion,
    ) -> Self {
        // User stacks end below the kernel boundary.
        let top = user_stack.region.end() as u32;
        let registers = ThreadRegisters::user(entry, top, directory);
        Self::with(
            name,
            registers,
            KernelStack::new(KERNEL_STACK_SIZE),
            Some(user_stack),
        )
    }

    fn with(
        name: &'static str,
        registers: ThreadRegisters,
        kernel_stack: KernelStack,
        user_stack: Option<MemoryRegion>,
    ) -> Self {
        let id = ThreadId::allocate();
        log::debug!("thread {id} '{name}' created, entry {:#010x}", registers.eip);
        Self {
            id,
            name,
            registers,
            started: false,
            state: ThreadState::Ready,
            blocked_on: None,
            wake_at: None,
            kernel_stack,
            user_stack,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn state(&self) -> ThreadState {
        self.state
    }

    #[must_use]
    pub const fn registers(&self) -> &ThreadRegisters {
        &self.registers
    }

    #[must_use]
    pub const fn has_started(&self) -> bool {
        self.started
    }

    #[must_use]
    pub const fn blocked_on(&self) -> Option<usize> {
        self.blocked_on
    }

    #[must_use]
    pub const fn kernel_stack(&self) -> &KernelStack {
        &self.kernel_stack
    }

    #[must_use]
    pub const fn user_stack(&self) -> Option<&MemoryRegion> {
        self.user_stack.as_ref()
    }

    /// Stack pointer to load into the TSS while this thread runs.
    #[must_use]
    pub fn kernel_stack_top(&self) -> u32 {
        truncate(self.kernel_stack.top())
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("eip", &format_args!("{:#010x}", self.registers.eip))
            .finish_non_exhaustive()
    }
}

/// Addresses are 32-bit on the target. Host builds keep the low half so the
/// bookkeeping can be exercised.
#[allow(clippy::cast_possible_truncation)]
const fn truncate(address: usize) -> u32 {
    address as u32
}

fn address_of(entry: ThreadEntry) -> u32 {
    truncate(entry as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::memory::KERNEL_STACK_SIZE;

    extern "C" fn spin() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    #[test]
    fn kernel_stack_is_aligned() {
        let stack = KernelStack::new(KERNEL_STACK_SIZE);
        assert_eq!(stack.size(), KERNEL_STACK_SIZE);
        assert_eq!(stack.top() % 16, 0);
        assert_eq!(stack.top() - stack.bottom(), KERNEL_STACK_SIZE);
    }

    #[test]
    fn ids_are_unique() {
        let a = Thread::kernel("a", spin, PhysicalAddress::new(0x1000));
        let b = Thread::kernel("b", spin, PhysicalAddress::new(0x1000));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), ThreadState::Ready);
        assert!(!a.has_started());
    }

    #[test]
    fn kernel_thread_starts_on_its_stack() {
        let t = Thread::kernel("worker", spin, PhysicalAddress::new(0x3000));
        assert_eq!(t.registers().esp, t.kernel_stack_top());
        assert_eq!(t.registers().eip, address_of(spin));
        assert_eq!(t.registers().cr3, 0x3000);
        assert!(t.user_stack().is_none());
    }
}
