//! A single-threaded task scheduler that runs delayed and periodic tasks on a named background
//! thread.
//!
//! Each component that needs timers owns its own `Scheduler`, so a slow task (e.g., a blocking
//! fetch) only delays that component's own timers.
use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc, Condvar, Mutex,
    },
    thread::{JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use crate::{Error, Result};

/// Handle to a scheduled task. Cancelling it prevents any further runs of the task.
///
/// Handles are compared by identity: two handles are the [same](TaskHandle::same) only if they
/// refer to the same scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    fn new() -> TaskHandle {
        TaskHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the task. Does not interrupt a run that is already in progress. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }

    /// Returns `true` if both handles refer to the same scheduled task.
    pub fn same(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

enum Task {
    Once(Box<dyn FnOnce(&TaskHandle) + Send>),
    FixedDelay {
        run: Arc<dyn Fn(&TaskHandle) + Send + Sync>,
        delay: Duration,
    },
}

struct Scheduled {
    at: Instant,
    seq: u64,
    handle: TaskHandle,
    task: Task,
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
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<Reverse<Scheduled>>,
    seq: u64,
    shutdown: bool,
    thread: Option<(ThreadId, JoinHandle<()>)>,
}

struct Shared {
    name: String,
    state: Mutex<State>,
    wakeup: Condvar,
}

/// Runs scheduled tasks on a lazily started background thread.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Create a scheduler. The background thread (named `name`) is started on first use.
    pub fn new(name: impl Into<String>) -> Scheduler {
        Scheduler {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(State::default()),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Run `task` once after `delay`. The task receives its own handle.
    ///
    /// # Errors
    ///
    /// - [`Error::Shutdown`] if the scheduler has been shut down.
    /// - [`Error::Io`] if the scheduler thread failed to start.
    pub fn schedule(
        &self,
        delay: Duration,
        task: impl FnOnce(&TaskHandle) + Send + 'static,
    ) -> Result<TaskHandle> {
        self.push(delay, Task::Once(Box::new(task)))
    }

    /// Run `task` after `initial_delay`, then repeatedly with `delay` between the end of one run
    /// and the start of the next. The task receives its own handle, so it can cancel itself.
    pub fn schedule_with_fixed_delay(
        &self,
        initial_delay: Duration,
        delay: Duration,
        task: impl Fn(&TaskHandle) + Send + Sync + 'static,
    ) -> Result<TaskHandle> {
        self.push(
            initial_delay,
            Task::FixedDelay {
                run: Arc::new(task),
                delay,
            },
        )
    }

    /// Stop the scheduler thread and drop all pending tasks. Scheduling after shutdown fails.
    ///
    /// Blocks until the currently running task (if any) completes, unless called from a task
    /// running on this scheduler.
    pub fn shutdown(&self) {
        let thread = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.queue.clear();
            state.thread.take()
        };
        self.shared.wakeup.notify_all();

        if let Some((id, join_handle)) = thread {
            if id != std::thread::current().id() && join_handle.join().is_err() {
                log::warn!(target: "flagsync", scheduler = self.shared.name.as_str(); "scheduler thread panicked");
            }
        }
    }

    fn push(&self, delay: Duration, task: Task) -> Result<TaskHandle> {
        let handle = TaskHandle::new();
        {
            let mut state = self.shared.lock();
            if state.shutdown {
                return Err(Error::Shutdown);
            }
            if state.thread.is_none() {
                let shared = Arc::clone(&self.shared);
                let join_handle = std::thread::Builder::new()
                    .name(self.shared.name.clone())
                    .spawn(move || shared.run())?;
                state.thread = Some((join_handle.thread().id(), join_handle));
            }
            let seq = state.seq;
            state.seq += 1;
            state.queue.push(Reverse(Scheduled {
                at: Instant::now() + delay,
                seq,
                handle: handle.clone(),
                task,
            }));
        }
        self.shared.wakeup.notify_all();
        Ok(handle)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Signal the thread to exit without waiting for it.
        self.shared.lock().shutdown = true;
        self.shared.wakeup.notify_all();
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("scheduler lock should not be poisoned")
    }

    fn run(&self) {
        loop {
            let Some(scheduled) = self.next_due() else {
                log::debug!(target: "flagsync", scheduler = self.name.as_str(); "scheduler thread exiting");
                return;
            };
            if scheduled.handle.is_cancelled() {
                continue;
            }

            match scheduled.task {
                Task::Once(task) => self.run_guarded(|| task(&scheduled.handle)),
                Task::FixedDelay { run, delay } => {
                    self.run_guarded(|| run(&scheduled.handle));
                    if scheduled.handle.is_cancelled() {
                        continue;
                    }
                    let mut state = self.lock();
                    if state.shutdown {
                        return;
                    }
                    let seq = state.seq;
                    state.seq += 1;
                    state.queue.push(Reverse(Scheduled {
                        at: Instant::now() + delay,
                        seq,
                        handle: scheduled.handle,
                        task: Task::FixedDelay { run, delay },
                    }));
                }
            }
        }
    }

    /// Block until the next task is due. Returns `None` on shutdown.
    fn next_due(&self) -> Option<Scheduled> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return None;
            }
            let now = Instant::now();
            let wait = match state.queue.peek() {
                None => None,
                Some(Reverse(next)) if next.at <= now => {
                    return state.queue.pop().map(|Reverse(scheduled)| scheduled);
                }
                Some(Reverse(next)) => Some(next.at - now),
            };
            state = match wait {
                None => self
                    .wakeup
                    .wait(state)
                    .expect("scheduler lock should not be poisoned"),
                Some(timeout) => {
                    self.wakeup
                        .wait_timeout(state, timeout)
                        .expect("scheduler lock should not be poisoned")
                        .0
                }
            };
        }
    }

    fn run_guarded(&self, task: impl FnOnce()) {
        // A panicking task must not take down the scheduler and every other timer with it.
        if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            log::error!(target: "flagsync", scheduler = self.name.as_str(); "scheduled task panicked");
        }
    }
}
