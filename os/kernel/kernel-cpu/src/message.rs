//! Cross-core messages.

use crate::processor::Processor;
use crate::thread::{Thread, ThreadId};
use alloc::boxed::Box;
use alloc::sync::Arc;
use kernel_sync::SpinLock;

/// Work executed on a target core when it drains its queue.
///
/// Shared messages run once on every core they were sent to, hence `&self`.
pub trait ProcessorMessage: Send + Sync {
    fn handle(&self, processor: &Processor);
}

pub enum Envelope {
    Owned(Box<dyn ProcessorMessage>),
    Shared(Arc<dyn ProcessorMessage>),
}

impl Envelope {
    pub(crate) fn deliver(self, processor: &Processor) {
        match self {
            Self::Owned(message) => message.handle(processor),
            Self::Shared(message) => message.handle(processor),
        }
    }
}

/// Makes a thread blocked on the target core runnable.
pub struct WakeThread(pub ThreadId);

impl ProcessorMessage for WakeThread {
    fn handle(&self, processor: &Processor) {
        if !processor.scheduler().wake(self.0) {
            log::trace!("cpu{}: thread {} was not blocked", processor.index(), self.0);
        }
    }
}

/// Starts a created thread on the target core.
pub struct StartThread(SpinLock<Option<Thread>>);

impl StartThread {
    #[must_use]
    pub const fn new(thread: Thread) -> Self {
        Self(SpinLock::new(Some(thread)))
    }
}

impl ProcessorMessage for StartThread {
    fn handle(&self, processor: &Processor) {
        let thread = self.0.lock().take();
        if let Some(thread) = thread {
            processor.scheduler().start(thread);
        }
    }
}

/// Runs a closure on every core it reaches.
pub struct RunClosure<F>(pub F);

impl<F> ProcessorMessage for RunClosure<F>
where
    F: Fn(&Processor) + Send + Sync,
{
    fn handle(&self, processor: &Processor) {
        (self.0)(processor);
    }
}
