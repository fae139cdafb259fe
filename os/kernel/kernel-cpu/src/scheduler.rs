//! Round-robin scheduling of the threads pinned to one core.

use crate::platform::ContextSwitch;
use crate::registers::{InterruptFrame, ThreadRegisters};
use crate::thread::{Thread, ThreadEntry, ThreadId, ThreadState};
use alloc::vec::Vec;
use kernel_memory_addresses::PhysicalAddress;

/// A context switch the interrupt exit path has to perform.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Switch {
    pub thread: Option<ThreadId>,
    pub registers: ThreadRegisters,
    pub kernel_stack_top: u32,
    /// The thread has never run; enter it through its start state.
    pub initial: bool,
}

/// The threads of one core plus its idle thread.
///
/// `current == None` means the idle thread runs. A terminated thread that is
/// still current cannot give up its stack while executing on it; it is
/// parked as a zombie and dropped on the next pass.
pub struct CoreScheduler {
    threads: Vec<Thread>,
    idle: Thread,
    current: Option<ThreadId>,
    zombie: Option<Thread>,
}

impl CoreScheduler {
    #[must_use]
    pub fn new(idle_entry: ThreadEntry, directory: PhysicalAddress) -> Self {
        let mut idle = Thread::kernel("idle", idle_entry, directory);
        idle.state = ThreadState::Running;
        Self {
            threads: Vec::new(),
            idle,
            current: None,
            zombie: None,
        }
    }

    /// Hands a created thread to this core.
    pub fn start(&mut self, mut thread: Thread) -> ThreadId {
        let id = thread.id();
        thread.state = ThreadState::Ready;
        log::debug!("thread {id} '{}' started", thread.name());
        self.threads.push(thread);
        id
    }

    #[must_use]
    pub const fn current(&self) -> Option<ThreadId> {
        self.current
    }

    #[must_use]
    pub const fn idle(&self) -> &Thread {
        &self.idle
    }

    #[must_use]
    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id() == id)
    }

    fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.id() == id)
    }

    #[must_use]
    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        self.thread(id).map(Thread::state)
    }

    /// Number of non-idle threads, terminated ones awaiting reclamation
    /// included.
    #[must_use]
    pub fn load(&self) -> usize {
        self.threads.len()
    }

    fn running_mut(&mut self) -> &mut Thread {
        match self.current {
            Some(id) => match self.threads.iter_mut().position(|t| t.id() == id) {
                Some(index) => &mut self.threads[index],
                None => panic!("current thread {id} is not on this core"),
            },
            None => &mut self.idle,
        }
    }

    /// One timer tick: save the interrupted thread, pick the next one and
    /// tell the caller whether to switch.
    pub fn tick(
        &mut self,
        switcher: &dyn ContextSwitch,
        frame: &InterruptFrame,
        now: u64,
    ) -> Option<Switch> {
        // Execution is on the stack of whoever was current, never the zombie's.
        if let Some(zombie) = self.zombie.take() {
            log::trace!("thread {} reclaimed", zombie.id());
        }

        let previous = self.current;
        let running = self.running_mut();
        if running.started && running.state != ThreadState::Terminated {
            switcher.save_context(frame, &mut running.registers);
        }

        let next = self.pick_next(now);
        match previous.and_then(|id| self.thread_mut(id)) {
            Some(prev) if prev.state == ThreadState::Running => prev.state = ThreadState::Waiting,
            _ => {}
        }
        if previous.is_none() {
            self.idle.state = ThreadState::Waiting;
        }

        let next_id = next.map(|index| self.threads[index].id());
        let chosen = match next {
            Some(index) => &mut self.threads[index],
            None => &mut self.idle,
        };
        chosen.state = ThreadState::Running;
        chosen.wake_at = None;
        let initial = !chosen.started;
        chosen.started = true;
        let switch = Switch {
            thread: next_id,
            registers: chosen.registers,
            kernel_stack_top: chosen.kernel_stack_top(),
            initial,
        };

        self.current = next_id;
        if next_id == previous && !initial {
            return None;
        }
        log::trace!("switch {previous:?} -> {next_id:?} at {now} ms");
        Some(switch)
    }

    /// Index of the next thread to run, `None` for idle.
    ///
    /// Reaps terminated threads, then scans at most one full cycle starting
    /// after the current thread.
    fn pick_next(&mut self, now: u64) -> Option<usize> {
        let current = self.current;
        let start = current
            .and_then(|id| self.threads.iter().position(|t| t.id() == id))
            .map_or(0, |index| {
                self.threads[..=index]
                    .iter()
                    .filter(|t| t.state != ThreadState::Terminated)
                    .count()
            });

        for thread in self
            .threads
            .extract_if(.., |t| t.state == ThreadState::Terminated)
        {
            if Some(thread.id()) == current {
                self.zombie = Some(thread);
            } else {
                log::debug!("thread {} '{}' reclaimed", thread.id(), thread.name());
            }
        }

        let count = self.threads.len();
        (0..count)
            .map(|step| (start + step) % count)
            .find(|&index| {
                let thread = &self.threads[index];
                match thread.state {
                    ThreadState::Ready | ThreadState::Waiting => true,
                    ThreadState::Running => Some(thread.id()) == current,
                    ThreadState::Sleeping => thread.wake_at.is_some_and(|at| at <= now),
                    ThreadState::Blocked | ThreadState::Suspended | ThreadState::Terminated => {
                        false
                    }
                }
            })
    }

    /// Keeps `id` from being scheduled until [`resume`](Self::resume)d.
    pub fn suspend(&mut self, id: ThreadId) -> bool {
        match self.thread_mut(id) {
            Some(t) if t.state != ThreadState::Terminated => {
                t.state = ThreadState::Suspended;
                true
            }
            _ => false,
        }
    }

    pub fn resume(&mut self, id: ThreadId) -> bool {
        match self.thread_mut(id) {
            Some(t) if t.state == ThreadState::Suspended => {
                t.state = ThreadState::Waiting;
                true
            }
            _ => false,
        }
    }

    /// Marks `id` terminated; its stack goes with the next pass.
    pub fn terminate(&mut self, id: ThreadId) -> bool {
        match self.thread_mut(id) {
            Some(t) => {
                t.state = ThreadState::Terminated;
                log::debug!("thread {id} terminated");
                true
            }
            None => false,
        }
    }

    /// The current thread, marked to sleep until `deadline`.
    pub fn sleep_current(&mut self, deadline: u64) -> Option<ThreadId> {
        let id = self.current?;
        let thread = self.thread_mut(id)?;
        thread.state = ThreadState::Sleeping;
        thread.wake_at = Some(deadline);
        Some(id)
    }

    /// The current thread, marked blocked on the mutex `lock`.
    pub fn block_current(&mut self, lock: usize) -> Option<ThreadId> {
        let id = self.current?;
        let thread = self.thread_mut(id)?;
        thread.state = ThreadState::Blocked;
        thread.blocked_on = Some(lock);
        Some(id)
    }

    /// Makes a blocked thread runnable. A thread that is still current keeps
    /// the CPU and returns from its blocking wait.
    pub fn wake(&mut self, id: ThreadId) -> bool {
        let current = self.current;
        match self.thread_mut(id) {
            Some(t) if t.state == ThreadState::Blocked => {
                t.blocked_on = None;
                t.state = if current == Some(id) {
                    ThreadState::Running
                } else {
                    ThreadState::Waiting
                };
                true
            }
            _ => false,
        }
    }
}
