//! A thread running tasks scheduled at regular time intervals.
//!
//! Used to drive profiling and maintenance hooks: register a task with a
//! period and it fires every period on a dedicated background thread until
//! removed or the scheduler shuts down. Tasks run with the scheduler mutex
//! held and therefore must be short and non-blocking; in particular a task
//! must never call back into its own scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::binary_heap::BinaryHeap;

/// A periodic callback driven by a [`ScheduleThread`].
pub trait ScheduleTask: Send + Sync {
    /// Invoked at each firing with the scheduler's notion of now (a steady
    /// clock).
    fn run_task(&self, now: Instant);
}

/// Task ownership: the scheduler either owns the task outright and drops it
/// at shutdown, or shares it with the caller, who may cancel it later.
enum TaskRef {
    Owned(Box<dyn ScheduleTask>),
    Shared(Arc<dyn ScheduleTask>),
}

impl TaskRef {
    fn run(&self, now: Instant) {
        match self {
            TaskRef::Owned(task) => task.run_task(now),
            TaskRef::Shared(task) => task.run_task(now),
        }
    }

    fn is_shared(&self, target: &Arc<dyn ScheduleTask>) -> bool {
        match self {
            TaskRef::Shared(task) => Arc::ptr_eq(task, target),
            TaskRef::Owned(_) => false,
        }
    }
}

/// One scheduled firing.
struct Timer {
    /// Timepoint of the next run.
    next_timeout: Instant,
    /// Interval for rescheduling.
    period: Duration,
    task: TaskRef,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.next_timeout == other.next_timeout
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.next_timeout.cmp(&other.next_timeout)
    }
}

struct Shared {
    timers: Mutex<BinaryHeap<Timer>>,
    cv: Condvar,
    terminate: AtomicBool,
}

/// Single background thread servicing a priority queue of periodic timers.
pub struct ScheduleThread {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ScheduleThread {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            timers: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            terminate: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("schedule".to_string())
            .spawn(move || worker_loop(worker_shared))
            .expect("failed to spawn schedule thread");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Register a shared task firing every `period`, first at now + period.
    /// The caller keeps ownership and may cancel it with [`remove`].
    ///
    /// [`remove`]: ScheduleThread::remove
    pub fn add(&self, period: Duration, task: Arc<dyn ScheduleTask>) {
        self.insert(period, TaskRef::Shared(task));
    }

    /// Register a task the scheduler owns; it is dropped at scheduler
    /// shutdown and cannot be removed individually.
    pub fn add_owned(&self, period: Duration, task: Box<dyn ScheduleTask>) {
        self.insert(period, TaskRef::Owned(task));
    }

    /// Cancel the first timer driving `task`. Returns whether one was found.
    /// An in-flight firing runs to completion; only future firings are
    /// cancelled.
    pub fn remove(&self, task: &Arc<dyn ScheduleTask>) -> bool {
        let mut timers = self.shared.timers.lock();
        timers.erase_first(|timer| timer.task.is_shared(task))
    }

    fn insert(&self, period: Duration, task: TaskRef) {
        let mut timers = self.shared.timers.lock();
        timers.push(Timer {
            next_timeout: Instant::now() + period,
            period,
            task,
        });
        self.shared.cv.notify_one();
    }
}

impl Default for ScheduleThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScheduleThread {
    fn drop(&mut self) {
        self.shared.terminate.store(true, Ordering::SeqCst);
        {
            let timers = self.shared.timers.lock();
            debug!(remaining = timers.container().len(), "schedule thread stopping");
            self.shared.cv.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        // owned tasks are dropped with the timer heap
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut timers = shared.timers.lock();
    let mut now = Instant::now();

    while !shared.terminate.load(Ordering::SeqCst) {
        if timers.is_empty() {
            shared.cv.wait(&mut timers);
            now = Instant::now();
            continue;
        }

        loop {
            let due = matches!(timers.peek(), Some(timer) if timer.next_timeout <= now);
            if !due {
                break;
            }
            let timer = timers.pop().expect("due timer present");
            // fired with the lock held; tasks are short by contract
            timer.task.run(now);
            timers.push(Timer {
                next_timeout: timer.next_timeout + timer.period,
                period: timer.period,
                task: timer.task,
            });
        }

        let deadline = match timers.peek() {
            Some(timer) => timer.next_timeout,
            None => continue,
        };
        let _ = shared.cv.wait_until(&mut timers, deadline);
        now = Instant::now();
    }
}
