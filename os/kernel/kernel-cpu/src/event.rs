//! Per-core timed events.

use crate::processor::Processor;
use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use core::cmp::Ordering;
use core::fmt;

pub type Callback = Box<dyn FnOnce(&Processor) + Send>;

pub enum Event {
    /// Run the scheduler.
    SchedulerTick,
    Callback(Callback),
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchedulerTick => f.write_str("SchedulerTick"),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

struct Scheduled {
    deadline: u64,
    sequence: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: the heap pops the earliest deadline, then the oldest entry.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.sequence.cmp(&self.sequence))
    }
}

/// Events ordered by deadline; equal deadlines run in scheduling order.
#[derive(Default)]
pub struct EventQueue {
    heap: BinaryHeap<Scheduled>,
    sequence: u64,
}

impl EventQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            sequence: 0,
        }
    }

    pub fn schedule(&mut self, deadline: u64, event: Event) {
        self.sequence += 1;
        self.heap.push(Scheduled {
            deadline,
            sequence: self.sequence,
            event,
        });
    }

    /// Removes the earliest event due at `now`.
    pub fn pop_due(&mut self, now: u64) -> Option<Event> {
        if self.heap.peek()?.deadline > now {
            return None;
        }
        self.heap.pop().map(|s| s.event)
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|s| s.deadline)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
