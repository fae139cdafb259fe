//! One core: interrupt dispatch, its clock and events, its scheduler and its
//! message queue.

use crate::event::{Event, EventQueue};
use crate::interrupt::{HandlerKind, HandlerTable, InterruptController, InterruptHandler};
use crate::message::Envelope;
use crate::platform::{Platform, PlatformFlag};
use crate::registers::InterruptFrame;
use crate::scheduler::{CoreScheduler, Switch};
use crate::thread::{Thread, ThreadEntry, ThreadId, ThreadState};
use crate::{HALT_VECTOR, IPI_VECTOR, SMALLEST_INTERVAL_MS, TIMER_VECTOR};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use kernel_alloc::{AllocationTarget, MemorySpace, VirtualMemoryManager};
use kernel_info::memory::USER_STACK_SIZE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{CriticalCounter, SpinLock, SpinLockGuard};
use kernel_vmem::{MappingConfig, PagingUnit, PhysMapper};

/// What to do once an interrupt level has unwound.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ExitAction {
    #[default]
    Nothing,
    EnterThread(Switch),
}

type Deferred = Box<dyn FnOnce(&Processor) + Send>;

#[derive(Default)]
struct InterruptState {
    /// One exit action per nesting level.
    levels: Vec<ExitAction>,
    deferred: Vec<Deferred>,
}

pub struct Processor {
    index: usize,
    apic_id: AtomicU32,
    platform: &'static dyn Platform,
    kernel_directory: PhysicalAddress,
    critical: CriticalCounter,
    handlers: SpinLock<HandlerTable>,
    interrupts: SpinLock<InterruptState>,
    events: SpinLock<EventQueue>,
    clock_ms: AtomicU64,
    scheduler: SpinLock<CoreScheduler>,
    messages: SpinLock<VecDeque<Envelope>>,
}

impl Processor {
    #[must_use]
    pub fn new(
        index: usize,
        platform: &'static dyn Platform,
        kernel_directory: PhysicalAddress,
        idle_entry: ThreadEntry,
    ) -> Self {
        Self {
            index,
            apic_id: AtomicU32::new(0),
            platform,
            kernel_directory,
            critical: CriticalCounter::new(),
            handlers: SpinLock::new(HandlerTable::new()),
            interrupts: SpinLock::new(InterruptState::default()),
            events: SpinLock::new(EventQueue::new()),
            clock_ms: AtomicU64::new(0),
            scheduler: SpinLock::new(CoreScheduler::new(idle_entry, kernel_directory)),
            messages: SpinLock::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn apic_id(&self) -> u32 {
        self.apic_id.load(Ordering::Relaxed)
    }

    pub fn set_apic_id(&self, apic_id: u32) {
        self.apic_id.store(apic_id, Ordering::Relaxed);
    }

    #[must_use]
    pub const fn platform(&self) -> &'static dyn Platform {
        self.platform
    }

    /// Milliseconds counted by this core's timer.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock_ms.load(Ordering::Relaxed)
    }

    pub fn scheduler(&self) -> SpinLockGuard<'_, CoreScheduler> {
        self.scheduler.lock()
    }

    pub fn enter_critical(&self) {
        self.critical.enter(&PlatformFlag(self.platform));
    }

    pub fn leave_critical(&self) {
        self.critical.leave(&PlatformFlag(self.platform));
    }

    #[must_use]
    pub fn critical_depth(&self) -> u32 {
        self.critical.depth()
    }

    /// Whether the core is inside an interrupt handler.
    #[must_use]
    pub fn in_interrupt(&self) -> bool {
        !self.interrupts.lock().levels.is_empty()
    }

    /// Registers the timer, message and halt vectors, all delivered by the
    /// local APIC `lapic`.
    pub fn install_core_handlers(&self, lapic: &Arc<dyn InterruptController>) {
        let timer: Arc<dyn InterruptHandler> =
            Arc::new(|p: &Self, frame: &mut InterruptFrame| p.on_timer(frame));
        let ipi: Arc<dyn InterruptHandler> =
            Arc::new(|p: &Self, _: &mut InterruptFrame| p.process_messages());
        let halt: Arc<dyn InterruptHandler> = Arc::new(HaltHandler);

        let mut handlers = self.handlers.lock();
        handlers.register(TIMER_VECTOR, timer, HandlerKind::Irq(lapic.clone()));
        handlers.register(IPI_VECTOR, ipi, HandlerKind::Irq(lapic.clone()));
        handlers.register(HALT_VECTOR, halt, HandlerKind::Generic);
    }

    /// # Panics
    /// If a non-IRQ vector is already taken; see [`HandlerTable::register`].
    pub fn register_interrupt_handler(
        &self,
        vector: u8,
        handler: Arc<dyn InterruptHandler>,
        kind: HandlerKind,
    ) {
        self.handlers.lock().register(vector, handler, kind);
    }

    pub fn unregister_interrupt_handler(
        &self,
        vector: u8,
        handler: &Arc<dyn InterruptHandler>,
    ) -> bool {
        self.handlers.lock().unregister(vector, handler)
    }

    /// Entry point of every interrupt stub.
    ///
    /// Handlers may be nested. Only the outermost level runs deferred calls
    /// and performs a requested thread switch, after every lock is released.
    pub fn handle_interrupt(&self, frame: &mut InterruptFrame) {
        self.interrupts.lock().levels.push(ExitAction::Nothing);

        let slot = self.handlers.lock().slot(frame.vector()).clone();
        slot.dispatch(self, frame);

        let (exit, deferred) = {
            let mut state = self.interrupts.lock();
            let Some(exit) = state.levels.pop() else {
                panic!("interrupt level stack underflow");
            };
            if let Some(outer) = state.levels.last_mut() {
                // A switch requested by a nested handler waits for the
                // outermost level.
                if exit != ExitAction::Nothing {
                    *outer = exit;
                }
                return;
            }
            (exit, core::mem::take(&mut state.deferred))
        };

        for call in deferred {
            call(self);
        }
        if let ExitAction::EnterThread(switch) = exit {
            self.enter(&switch);
        }
    }

    fn enter(&self, switch: &Switch) {
        if switch.initial {
            self.platform
                .enter_initial_context(&switch.registers, switch.kernel_stack_top);
        } else {
            self.platform
                .restore_context(&switch.registers, switch.kernel_stack_top);
        }
    }

    /// Replaces the exit action of the current interrupt level.
    ///
    /// # Panics
    /// Outside of an interrupt handler.
    pub fn set_exit_action(&self, action: ExitAction) {
        match self.interrupts.lock().levels.last_mut() {
            Some(level) => *level = action,
            None => panic!("exit action requested outside of an interrupt"),
        }
    }

    /// Runs `call` once the outermost interrupt has been handled.
    ///
    /// # Panics
    /// Outside of an interrupt handler.
    pub fn defer(&self, call: impl FnOnce(&Self) + Send + 'static) {
        let mut state = self.interrupts.lock();
        assert!(!state.levels.is_empty(), "defer outside of an interrupt");
        state.deferred.push(Box::new(call));
    }

    /// Runs `event` `delay_ms` from now.
    pub fn schedule_event(&self, delay_ms: u64, event: Event) {
        let deadline = self.now() + delay_ms;
        self.events.lock().schedule(deadline, event);
    }

    /// Schedules the first tick and starts the periodic timer.
    pub fn start_scheduling(&self) {
        self.schedule_event(u64::from(SMALLEST_INTERVAL_MS), Event::SchedulerTick);
        self.platform.arm_timer(SMALLEST_INTERVAL_MS);
        log::info!("cpu{}: scheduler started", self.index);
    }

    /// The timer handler: advance the clock, run every due event.
    pub fn on_timer(&self, frame: &InterruptFrame) {
        let now = self.advance_clock(u64::from(SMALLEST_INTERVAL_MS));
        loop {
            let due = self.events.lock().pop_due(now);
            match due {
                None => break,
                Some(Event::SchedulerTick) => self.scheduler_tick(frame, now),
                Some(Event::Callback(call)) => call(self),
            }
        }
    }

    /// Returns the new time.
    pub fn advance_clock(&self, ms: u64) -> u64 {
        self.clock_ms.fetch_add(ms, Ordering::Relaxed) + ms
    }

    fn scheduler_tick(&self, frame: &InterruptFrame, now: u64) {
        self.events
            .lock()
            .schedule(now + u64::from(SMALLEST_INTERVAL_MS), Event::SchedulerTick);
        let switch = self.scheduler.lock().tick(self.platform, frame, now);
        if let Some(switch) = switch {
            self.set_exit_action(ExitAction::EnterThread(switch));
        }
    }

    /// A ring-0 thread in the kernel address space. Not started.
    #[must_use]
    pub fn create_kernel_thread(&self, name: &'static str, entry: ThreadEntry) -> Thread {
        Thread::kernel(name, entry, self.kernel_directory)
    }

    /// A ring-3 thread in `space`, with a fresh user stack mapped there.
    ///
    /// # Panics
    /// If the user stack cannot be allocated.
    pub fn create_userspace_thread<M, U>(
        &self,
        vmm: &VirtualMemoryManager<'_, M, U>,
        space: &mut MemorySpace,
        name: &'static str,
        entry: u32,
    ) -> Thread
    where
        M: PhysMapper,
        U: PagingUnit,
    {
        let directory = space.directory();
        let stack = vmm.allocate_region(
            AllocationTarget::User(space),
            u64::from(USER_STACK_SIZE),
            MappingConfig::user_data(),
        );
        Thread::user(name, entry, directory, stack)
    }

    /// Starts `thread` on this core.
    pub fn start_thread(&self, thread: Thread) -> ThreadId {
        self.scheduler.lock().start(thread)
    }

    /// Ends the calling thread. Its stack is reclaimed once another thread
    /// runs.
    pub fn exit_current(&self) -> ! {
        let current = self.scheduler.lock().current();
        match current {
            Some(id) => {
                self.scheduler.lock().terminate(id);
            }
            None => panic!("cpu{}: idle thread tried to exit", self.index),
        }
        loop {
            self.platform.wait_for_interrupt();
        }
    }

    /// Sleeps the calling thread for at least `ms` milliseconds.
    pub fn sleep(&self, ms: u64) {
        let deadline = self.now() + ms;
        let Some(id) = self.scheduler.lock().sleep_current(deadline) else {
            while self.now() < deadline {
                self.platform.wait_for_interrupt();
            }
            return;
        };
        while self.scheduler.lock().state(id) == Some(ThreadState::Sleeping) {
            self.platform.wait_for_interrupt();
        }
    }

    pub(crate) fn enqueue(&self, envelope: Envelope) {
        self.messages.lock().push_back(envelope);
    }

    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.messages.lock().len()
    }

    /// Drains the message queue in FIFO order, including messages that
    /// arrive while draining.
    pub fn process_messages(&self) {
        loop {
            let batch = core::mem::take(&mut *self.messages.lock());
            if batch.is_empty() {
                break;
            }
            log::trace!("cpu{}: {} message(s)", self.index, batch.len());
            for envelope in batch {
                envelope.deliver(self);
            }
        }
    }
}

struct HaltHandler;

impl InterruptHandler for HaltHandler {
    fn handle(&self, processor: &Processor, _frame: &mut InterruptFrame) {
        log::error!("cpu{}: halted by another core", processor.index());
        processor.platform.halt()
    }
}

impl core::fmt::Debug for Processor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Processor")
            .field("index", &self.index)
            .field("apic_id", &self.apic_id())
            .finish_non_exhaustive()
    }
}
