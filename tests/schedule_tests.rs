//! Integration tests for the periodic-task scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use block_pool::schedule::{ScheduleTask, ScheduleThread};

struct CountingTask {
    count: AtomicUsize,
}

impl CountingTask {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
        })
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl ScheduleTask for CountingTask {
    fn run_task(&self, _now: Instant) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

struct StampingTask {
    stamps: Mutex<Vec<Instant>>,
}

impl ScheduleTask for StampingTask {
    fn run_task(&self, _now: Instant) {
        self.stamps.lock().unwrap().push(Instant::now());
    }
}

#[test]
fn test_firing_count_over_fixed_duration() {
    let scheduler = ScheduleThread::new();
    let task = CountingTask::new();

    scheduler.add(Duration::from_millis(20), task.clone());
    thread::sleep(Duration::from_millis(210));
    assert!(scheduler.remove(&(task.clone() as Arc<dyn ScheduleTask>)));

    let fired = task.count();
    assert!(
        (9..=11).contains(&fired),
        "expected 9..=11 firings over 210ms at 20ms period, got {fired}"
    );
}

#[test]
fn test_consecutive_firings_are_spaced() {
    let scheduler = ScheduleThread::new();
    let task = Arc::new(StampingTask {
        stamps: Mutex::new(Vec::new()),
    });

    scheduler.add(Duration::from_millis(60), task.clone());
    thread::sleep(Duration::from_millis(390));
    assert!(scheduler.remove(&(task.clone() as Arc<dyn ScheduleTask>)));

    let stamps = task.stamps.lock().unwrap();
    assert!(stamps.len() >= 4, "only {} firings", stamps.len());
    for pair in stamps.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(30),
            "firings only {gap:?} apart"
        );
    }
}

#[test]
fn test_independent_periods() {
    let scheduler = ScheduleThread::new();
    let fast = CountingTask::new();
    let slow = CountingTask::new();

    scheduler.add(Duration::from_millis(10), fast.clone());
    scheduler.add(Duration::from_millis(40), slow.clone());
    thread::sleep(Duration::from_millis(205));
    scheduler.remove(&(fast.clone() as Arc<dyn ScheduleTask>));
    scheduler.remove(&(slow.clone() as Arc<dyn ScheduleTask>));

    let fast_fired = fast.count();
    let slow_fired = slow.count();
    assert!(
        (15..=25).contains(&fast_fired),
        "fast task fired {fast_fired} times"
    );
    assert!(
        (3..=7).contains(&slow_fired),
        "slow task fired {slow_fired} times"
    );
}

#[test]
fn test_remove_then_readd() {
    let scheduler = ScheduleThread::new();
    let task = CountingTask::new();

    scheduler.add(Duration::from_millis(10), task.clone());
    thread::sleep(Duration::from_millis(55));
    assert!(scheduler.remove(&(task.clone() as Arc<dyn ScheduleTask>)));
    assert!(!scheduler.remove(&(task.clone() as Arc<dyn ScheduleTask>)));

    let after_remove = task.count();
    scheduler.add(Duration::from_millis(10), task.clone());
    thread::sleep(Duration::from_millis(55));
    scheduler.remove(&(task.clone() as Arc<dyn ScheduleTask>));
    assert!(task.count() > after_remove, "task did not resume after re-add");
}

#[test]
fn test_scheduler_drop_with_active_tasks() {
    let task = CountingTask::new();
    {
        let scheduler = ScheduleThread::new();
        scheduler.add(Duration::from_millis(5), task.clone());
        scheduler.add_owned(
            Duration::from_millis(5),
            Box::new(CountingTask {
                count: AtomicUsize::new(0),
            }),
        );
        thread::sleep(Duration::from_millis(30));
    }
    // the scheduler is gone; the shared task must stop firing
    let frozen = task.count();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(task.count(), frozen);
}
