//! All cores of the machine and the messages between them.

use crate::message::{Envelope, ProcessorMessage, StartThread, WakeThread};
use crate::platform::Platform;
use crate::processor::Processor;
use crate::thread::{Thread, ThreadEntry, ThreadId};
use crate::{HALT_VECTOR, IPI_VECTOR};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_memory_addresses::PhysicalAddress;

/// The per-core [`Processor`]s. Cores talk to each other only by queueing
/// messages and poking the target with an IPI; delivery is FIFO per sender.
pub struct Smp {
    processors: Vec<Processor>,
    platform: &'static dyn Platform,
}

impl Smp {
    /// One processor per core. APIC IDs default to the core index until
    /// bring-up reports the real ones.
    ///
    /// # Panics
    /// If `cores` is zero.
    #[must_use]
    pub fn new(
        platform: &'static dyn Platform,
        cores: usize,
        kernel_directory: PhysicalAddress,
        idle_entry: ThreadEntry,
    ) -> Self {
        assert!(cores > 0, "a machine has at least one core");
        let processors = (0..cores)
            .map(|index| {
                let processor = Processor::new(index, platform, kernel_directory, idle_entry);
                processor.set_apic_id(u32::try_from(index).unwrap_or(u32::MAX));
                processor
            })
            .collect();
        log::info!("smp: {cores} core(s)");
        Self {
            processors,
            platform,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    #[must_use]
    pub fn processors(&self) -> &[Processor] {
        &self.processors
    }

    #[must_use]
    pub fn processor(&self, index: usize) -> Option<&Processor> {
        self.processors.get(index)
    }

    /// The processor of the calling core.
    ///
    /// # Panics
    /// If the platform reports a core this machine does not have.
    #[must_use]
    pub fn current(&self) -> &Processor {
        let index = self.platform.core_index();
        match self.processors.get(index) {
            Some(processor) => processor,
            None => panic!("running on unknown core {index}"),
        }
    }

    fn target(&self, index: usize) -> &Processor {
        match self.processors.get(index) {
            Some(processor) => processor,
            None => panic!("no core {index}"),
        }
    }

    /// Queues `message` for core `target`. It runs on the target's next
    /// [`process_messages`](Self::process_messages).
    pub fn enqueue_message(&self, target: usize, message: Box<dyn ProcessorMessage>) {
        self.target(target).enqueue(Envelope::Owned(message));
    }

    /// Sends the message IPI to `target`.
    pub fn poke(&self, target: usize) {
        let apic_id = self.target(target).apic_id();
        log::trace!("poke cpu{target} (apic {apic_id})");
        self.platform.send_ipi(apic_id, IPI_VECTOR);
    }

    /// Sends the message IPI to every other core.
    pub fn poke_all(&self) {
        self.platform.broadcast_ipi(IPI_VECTOR);
    }

    /// Queues `message` on every other core and pokes them.
    pub fn broadcast(&self, message: &Arc<dyn ProcessorMessage>) {
        let me = self.platform.core_index();
        for processor in self.processors.iter().filter(|p| p.index() != me) {
            processor.enqueue(Envelope::Shared(message.clone()));
        }
        self.poke_all();
    }

    /// Runs the calling core's queued messages.
    pub fn process_messages(&self) {
        self.current().process_messages();
    }

    /// The core with the fewest threads; ties go to the lowest index.
    #[must_use]
    pub fn least_loaded_core(&self) -> usize {
        self.processors
            .iter()
            .map(|p| (p.scheduler().load(), p.index()))
            .min()
            .map_or(0, |(_, index)| index)
    }

    /// Starts `thread` on the least loaded core and returns that core.
    pub fn start_thread(&self, thread: Thread) -> usize {
        let target = self.least_loaded_core();
        self.start_thread_on(target, thread);
        target
    }

    pub fn start_thread_on(&self, target: usize, thread: Thread) {
        if target == self.platform.core_index() {
            self.target(target).start_thread(thread);
        } else {
            self.enqueue_message(target, Box::new(StartThread::new(thread)));
            self.poke(target);
        }
    }

    /// Makes a thread blocked on `target` runnable.
    pub fn wake_thread(&self, target: usize, id: ThreadId) {
        if target == self.platform.core_index() {
            self.target(target).scheduler().wake(id);
        } else {
            self.enqueue_message(target, Box::new(WakeThread(id)));
            self.poke(target);
        }
    }

    /// Stops every other core; used on panic.
    pub fn halt_others(&self) {
        self.platform.broadcast_ipi(HALT_VECTOR);
    }
}
