//! Scheduler backed by a dedicated Tokio thread.
//!
//! One thread runs a single-threaded Tokio runtime. Every scheduled job
//! becomes a timer task on that runtime, and jobs execute on that thread,
//! so no two jobs ever run at the same time.

use std::{
    io,
    sync::{Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use tagwire_core::{
    Scheduler, TaskHandle,
    scheduler::{OnceTask, RepeatingTask},
};
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};

enum Job {
    Once { delay: Duration, handle: TaskHandle, task: OnceTask },
    Repeating { interval: Duration, handle: TaskHandle, task: RepeatingTask },
}

async fn run_job(job: Job) {
    match job {
        Job::Once { delay, handle, task } => {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !handle.is_cancelled() {
                task();
            }
        },
        Job::Repeating { interval, handle, mut task } => {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if handle.is_cancelled() {
                    break;
                }
                task();
            }
        },
    }
}

/// Production [`Scheduler`].
///
/// Dropping the scheduler (or calling [`shutdown`](Self::shutdown)) stops
/// the thread; pending jobs are discarded.
pub struct TokioScheduler {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TokioScheduler {
    /// Start the scheduler thread.
    ///
    /// # Errors
    ///
    /// Fails if the runtime or the thread cannot be created.
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let thread = thread::Builder::new().name("tagwire-scheduler".to_string()).spawn(move || {
            runtime.block_on(async move {
                while let Some(job) = receiver.recv().await {
                    tokio::spawn(run_job(job));
                }
            });
            tracing::debug!("scheduler thread stopped");
        })?;

        Ok(Self { sender: Mutex::new(Some(sender)), thread: Mutex::new(Some(thread)) })
    }

    fn submit(&self, job: impl FnOnce(TaskHandle) -> Job) -> TaskHandle {
        let handle = TaskHandle::new();
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = sender.as_ref().is_some_and(|sender| sender.send(job(handle.clone())).is_ok());
        if !sent {
            tracing::warn!("scheduler stopped, job dropped");
            handle.cancel();
        }
        handle
    }

    /// Stop accepting jobs and wait for the scheduler thread to exit.
    ///
    /// Called from a job running on the scheduler thread, this only stops
    /// accepting jobs.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();

        let Some(thread) = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::error!("scheduler thread panicked");
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, task: OnceTask) -> TaskHandle {
        self.submit(|handle| Job::Once { delay, handle, task })
    }

    fn schedule_at_fixed_rate(&self, interval: Duration, task: RepeatingTask) -> TaskHandle {
        self.submit(|handle| Job::Repeating { interval, handle, task })
    }
}
