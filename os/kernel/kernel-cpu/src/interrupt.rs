//! Interrupt handler registration.
//!
//! Every vector owns one [`Slot`]. Exception and software vectors take
//! exactly one [`Generic`](HandlerKind::Generic) handler. Device vectors
//! registered as [`Irq`](HandlerKind::Irq) may be shared: the slot then fans
//! out to every handler in registration order and signals end of interrupt
//! once, to the controller of the first registration.

use crate::processor::Processor;
use crate::registers::InterruptFrame;
use alloc::sync::Arc;
use alloc::vec::Vec;

pub const VECTOR_COUNT: usize = 256;

pub trait InterruptHandler: Send + Sync {
    fn handle(&self, processor: &Processor, frame: &mut InterruptFrame);
}

impl<F> InterruptHandler for F
where
    F: Fn(&Processor, &mut InterruptFrame) + Send + Sync,
{
    fn handle(&self, processor: &Processor, frame: &mut InterruptFrame) {
        self(processor, frame);
    }
}

/// The chip that delivered an interrupt (PIC, I/O APIC or local APIC).
pub trait InterruptController: Send + Sync {
    fn end_of_interrupt(&self, vector: u8);
}

#[derive(Clone)]
pub enum HandlerKind {
    Generic,
    Irq(Arc<dyn InterruptController>),
}

#[derive(Clone, Default)]
pub enum Slot {
    #[default]
    Unhandled,
    Generic(Arc<dyn InterruptHandler>),
    Irq {
        handler: Arc<dyn InterruptHandler>,
        controller: Arc<dyn InterruptController>,
    },
    Shared {
        handlers: Vec<Arc<dyn InterruptHandler>>,
        controller: Arc<dyn InterruptController>,
    },
}

impl Slot {
    #[must_use]
    pub const fn is_handled(&self) -> bool {
        !matches!(self, Self::Unhandled)
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        match self {
            Self::Unhandled => 0,
            Self::Generic(_) | Self::Irq { .. } => 1,
            Self::Shared { handlers, .. } => handlers.len(),
        }
    }

    /// Run the handlers, then signal end of interrupt. Panics on an empty
    /// slot.
    pub(crate) fn dispatch(&self, processor: &Processor, frame: &mut InterruptFrame) {
        let vector = frame.vector();
        match self {
            Self::Unhandled => {
                log::error!(
                    "unhandled interrupt {vector:#04x} at {:#010x} (error code {:#x})",
                    frame.eip,
                    frame.error_code
                );
                panic!("unhandled interrupt {vector:#04x}");
            }
            Self::Generic(handler) => handler.handle(processor, frame),
            Self::Irq {
                handler,
                controller,
            } => {
                handler.handle(processor, frame);
                controller.end_of_interrupt(vector);
            }
            Self::Shared {
                handlers,
                controller,
            } => {
                for handler in handlers {
                    handler.handle(processor, frame);
                }
                controller.end_of_interrupt(vector);
            }
        }
    }
}

pub struct HandlerTable {
    slots: Vec<Slot>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(VECTOR_COUNT);
        slots.resize_with(VECTOR_COUNT, Slot::default);
        Self { slots }
    }

    #[must_use]
    pub fn slot(&self, vector: u8) -> &Slot {
        &self.slots[usize::from(vector)]
    }

    /// # Panics
    /// If a generic handler meets an occupied slot, or an IRQ handler meets a
    /// generic one.
    pub fn register(&mut self, vector: u8, handler: Arc<dyn InterruptHandler>, kind: HandlerKind) {
        let slot = &mut self.slots[usize::from(vector)];
        *slot = match (core::mem::take(slot), kind) {
            (Slot::Unhandled, HandlerKind::Generic) => Slot::Generic(handler),
            (Slot::Unhandled, HandlerKind::Irq(controller)) => Slot::Irq {
                handler,
                controller,
            },
            (
                Slot::Irq {
                    handler: first,
                    controller,
                },
                HandlerKind::Irq(_),
            ) => Slot::Shared {
                handlers: alloc::vec![first, handler],
                controller,
            },
            (
                Slot::Shared {
                    mut handlers,
                    controller,
                },
                HandlerKind::Irq(_),
            ) => {
                handlers.push(handler);
                Slot::Shared {
                    handlers,
                    controller,
                }
            }
            _ => panic!("vector {vector:#04x} already has a handler"),
        };
        log::debug!(
            "vector {vector:#04x}: {} handler(s)",
            self.slots[usize::from(vector)].handler_count()
        );
    }

    /// Removes one registration of `handler`. Returns `false` if it was not
    /// registered at `vector`.
    pub fn unregister(&mut self, vector: u8, handler: &Arc<dyn InterruptHandler>) -> bool {
        let slot = &mut self.slots[usize::from(vector)];
        let (next, removed) = match core::mem::take(slot) {
            Slot::Generic(h) if Arc::ptr_eq(&h, handler) => (Slot::Unhandled, true),
            Slot::Irq { handler: h, .. } if Arc::ptr_eq(&h, handler) => (Slot::Unhandled, true),
            Slot::Shared {
                mut handlers,
                controller,
            } => match handlers.iter().position(|h| Arc::ptr_eq(h, handler)) {
                Some(index) => {
                    handlers.remove(index);
                    let next = if handlers.len() == 1 {
                        Slot::Irq {
                            handler: handlers.remove(0),
                            controller,
                        }
                    } else {
                        Slot::Shared {
                            handlers,
                            controller,
                        }
                    };
                    (next, true)
                }
                None => (
                    Slot::Shared {
                        handlers,
                        controller,
                    },
                    false,
                ),
            },
            other => (other, false),
        };
        *slot = next;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    struct Eoi(AtomicU32);

    impl InterruptController for Eoi {
        fn end_of_interrupt(&self, _vector: u8) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn noop() -> Arc<dyn InterruptHandler> {
        Arc::new(|_: &Processor, _: &mut InterruptFrame| {})
    }

    #[test]
    fn irq_handlers_share_and_collapse() {
        let pic: Arc<dyn InterruptController> = Arc::new(Eoi(AtomicU32::new(0)));
        let (a, b, c) = (noop(), noop(), noop());
        let mut table = HandlerTable::new();

        table.register(0x21, a.clone(), HandlerKind::Irq(pic.clone()));
        assert!(matches!(table.slot(0x21), Slot::Irq { .. }));
        table.register(0x21, b.clone(), HandlerKind::Irq(pic.clone()));
        table.register(0x21, c.clone(), HandlerKind::Irq(pic));
        assert_eq!(table.slot(0x21).handler_count(), 3);

        assert!(table.unregister(0x21, &b));
        assert!(!table.unregister(0x21, &b));
        assert!(matches!(table.slot(0x21), Slot::Shared { .. }));
        assert!(table.unregister(0x21, &a));
        assert!(matches!(table.slot(0x21), Slot::Irq { .. }));
        assert!(table.unregister(0x21, &c));
        assert!(!table.slot(0x21).is_handled());
    }

    #[test]
    #[should_panic(expected = "already has a handler")]
    fn generic_vectors_are_exclusive() {
        let mut table = HandlerTable::new();
        table.register(0x0E, noop(), HandlerKind::Generic);
        table.register(0x0E, noop(), HandlerKind::Generic);
    }

    #[test]
    #[should_panic(expected = "already has a handler")]
    fn irq_does_not_join_generic() {
        let pic: Arc<dyn InterruptController> = Arc::new(Eoi(AtomicU32::new(0)));
        let mut table = HandlerTable::new();
        table.register(0x80, noop(), HandlerKind::Generic);
        table.register(0x80, noop(), HandlerKind::Irq(pic));
    }

    #[test]
    fn unregister_other_handler_is_ignored() {
        let mut table = HandlerTable::new();
        let kept = noop();
        table.register(3, kept, HandlerKind::Generic);
        assert!(!table.unregister(3, &noop()));
        assert!(table.slot(3).is_handled());
    }
}
