//! Scheduler abstraction for periodic and one-off work.
//!
//! The key manager runs its rotation check at a fixed rate and reacts to
//! contact and transport events with zero-delay jobs. Both kinds go through
//! one [`Scheduler`], which production code backs with a single worker
//! thread.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// Job run once.
pub type OnceTask = Box<dyn FnOnce() + Send + 'static>;

/// Job run repeatedly.
pub type RepeatingTask = Box<dyn FnMut() + Send + 'static>;

/// Cancellation handle of a scheduled job.
///
/// Cancelling is idempotent. A job that is already running finishes, but
/// it is not started again.
#[derive(Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// New handle, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the job from running again.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("cancelled", &self.is_cancelled()).finish()
    }
}

/// Runs jobs in the background.
///
/// Implementations must run jobs one at a time, so a job never overlaps
/// with another job from the same scheduler.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `task` once after `delay`. A zero delay means "as soon as
    /// possible".
    fn schedule_once(&self, delay: Duration, task: OnceTask) -> TaskHandle;

    /// Run `task` every `interval`, first after one interval.
    fn schedule_at_fixed_rate(&self, interval: Duration, task: RepeatingTask) -> TaskHandle;
}

/// Scheduler that only runs jobs when a test tells it to.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualInner>>,
}

#[derive(Default)]
struct ManualInner {
    once: Vec<(TaskHandle, OnceTask)>,
    repeating: Vec<(TaskHandle, Duration, Arc<Mutex<RepeatingTask>>)>,
}

impl ManualScheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every queued one-off job, in submission order.
    ///
    /// Jobs scheduled while draining are left for the next call.
    pub fn run_once_tasks(&self) -> usize {
        let once = std::mem::take(
            &mut self.inner.lock().unwrap_or_else(PoisonError::into_inner).once,
        );
        let mut ran = 0;
        for (handle, task) in once {
            if !handle.is_cancelled() {
                task();
                ran += 1;
            }
        }
        ran
    }

    /// Run every live repeating job once, as if one interval elapsed.
    pub fn tick(&self) -> usize {
        let repeating: Vec<_> = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.repeating.retain(|(handle, _, _)| !handle.is_cancelled());
            inner.repeating.iter().map(|(_, _, task)| Arc::clone(task)).collect()
        };
        for task in &repeating {
            let mut guard = task.lock().unwrap_or_else(PoisonError::into_inner);
            let run: &mut RepeatingTask = &mut guard;
            run();
        }
        repeating.len()
    }

    /// Intervals of live repeating jobs.
    pub fn intervals(&self) -> Vec<Duration> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .repeating
            .iter()
            .filter(|(handle, _, _)| !handle.is_cancelled())
            .map(|(_, interval, _)| *interval)
            .collect()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, _delay: Duration, task: OnceTask) -> TaskHandle {
        let handle = TaskHandle::new();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .once
            .push((handle.clone(), task));
        handle
    }

    fn schedule_at_fixed_rate(&self, interval: Duration, task: RepeatingTask) -> TaskHandle {
        let handle = TaskHandle::new();
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).repeating.push((
            handle.clone(),
            interval,
            Arc::new(Mutex::new(task)),
        ));
        handle
    }
}
