//! Delayed task scheduling for the autosave synchronizer.
//!
//! Production code runs on [`TokioScheduler`]. [`ManualScheduler`] keeps a
//! virtual clock that only moves when [`ManualScheduler::advance`] is called,
//! which lets tests and embedders drive timers deterministically.

use futures_util::future::{AbortHandle, AbortRegistration, Abortable, BoxFuture};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;

/// Work handed to a [`Scheduler`], run once its delay has elapsed.
pub type Task = BoxFuture<'static, ()>;

/// Handle to a scheduled task.
///
/// Cancelling stops the task whether it is still waiting out its delay or
/// already running; a running task is dropped at its next suspension point.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    abort: AbortHandle,
}

impl TaskHandle {
    pub(crate) fn pair() -> (Self, AbortRegistration) {
        let (abort, registration) = AbortHandle::new_pair();
        (Self { abort }, registration)
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.is_aborted()
    }
}

pub trait Scheduler: Send + Sync {
    /// Run `task` after `delay`, returning a handle that can cancel it.
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle;
}

/// Spawns each task onto a tokio runtime behind a `tokio::time::sleep`.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime of the calling context.
    ///
    /// Panics when called outside a tokio runtime, like `tokio::spawn`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let (handle, registration) = TaskHandle::pair();
        let delayed = async move {
            tokio::time::sleep(delay).await;
            task.await;
        };
        // Detached; cancellation goes through the abort handle.
        let _ = self.handle.spawn(Abortable::new(delayed, registration));
        handle
    }
}

struct Scheduled {
    due: Duration,
    seq: u64,
    handle: TaskHandle,
    task: Abortable<Task>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    seq: u64,
    queue: Vec<Scheduled>,
}

/// Virtual-clock scheduler. Time starts at zero and only moves forward
/// through [`advance`](Self::advance), which runs due tasks inline in the
/// order their deadlines expire.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Virtual time elapsed since creation.
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of queued tasks that have not been cancelled.
    pub fn pending(&self) -> usize {
        self.lock()
            .queue
            .iter()
            .filter(|s| !s.handle.is_cancelled())
            .count()
    }

    /// Move the clock forward by `by`, running every task that falls due on
    /// the way. Tasks scheduled while advancing run too if they fall due
    /// before the new time.
    pub async fn advance(&self, by: Duration) {
        let target = self.now() + by;
        loop {
            let next = {
                let mut state = self.lock();
                let position = state
                    .queue
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.due <= target)
                    .min_by_key(|(_, s)| (s.due, s.seq))
                    .map(|(i, _)| i);
                position.map(|i| {
                    let scheduled = state.queue.swap_remove(i);
                    state.now = scheduled.due;
                    scheduled.task
                })
            };

            match next {
                // An aborted task resolves immediately with `Err(Aborted)`.
                Some(task) => {
                    let _ = task.await;
                }
                None => break,
            }
        }
        self.lock().now = target;
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let (handle, registration) = TaskHandle::pair();
        let mut state = self.lock();
        state.queue.retain(|s| !s.handle.is_cancelled());
        let due = state.now + delay;
        let seq = state.seq;
        state.seq += 1;
        state.queue.push(Scheduled {
            due,
            seq,
            handle: handle.clone(),
            task: Abortable::new(task, registration),
        });
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> Task {
        let log = Arc::clone(log);
        Box::pin(async move {
            log.lock().unwrap().push(label);
        })
    }

    #[tokio::test]
    async fn manual_runs_tasks_in_deadline_order() {
        let scheduler = ManualScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        scheduler.schedule(Duration::from_millis(300), recording(&log, "late"));
        scheduler.schedule(Duration::from_millis(100), recording(&log, "early"));
        scheduler.schedule(Duration::from_millis(100), recording(&log, "early-second"));

        scheduler.advance(Duration::from_millis(200)).await;
        assert_eq!(*log.lock().unwrap(), vec!["early", "early-second"]);
        assert_eq!(scheduler.now(), Duration::from_millis(200));

        scheduler.advance(Duration::from_millis(100)).await;
        assert_eq!(*log.lock().unwrap(), vec!["early", "early-second", "late"]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn cancelled_task_never_runs() {
        let scheduler = ManualScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let handle = scheduler.schedule(Duration::from_millis(50), recording(&log, "cancelled"));
        scheduler.schedule(Duration::from_millis(50), recording(&log, "kept"));
        handle.cancel();

        assert!(handle.is_cancelled());
        assert_eq!(scheduler.pending(), 1);

        scheduler.advance(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec!["kept"]);
    }

    #[tokio::test]
    async fn rescheduling_drops_cancelled_tasks_from_queue() {
        let scheduler = ManualScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handle = scheduler.schedule(Duration::from_millis(500), recording(&log, "first"));
        for _ in 0..100 {
            handle.cancel();
            handle = scheduler.schedule(Duration::from_millis(500), recording(&log, "retyped"));
        }

        assert_eq!(scheduler.lock().queue.len(), 1);
        scheduler.advance(Duration::from_millis(500)).await;
        assert_eq!(*log.lock().unwrap(), vec!["retyped"]);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_waits_for_delay() {
        let scheduler = TokioScheduler::current();
        let log = Arc::new(Mutex::new(Vec::new()));

        scheduler.schedule(Duration::from_millis(500), recording(&log, "fired"));

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(log.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(*log.lock().unwrap(), vec!["fired"]);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_cancel_before_deadline() {
        let scheduler = TokioScheduler::current();
        let log = Arc::new(Mutex::new(Vec::new()));

        let handle = scheduler.schedule(Duration::from_millis(100), recording(&log, "fired"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(log.lock().unwrap().is_empty());
    }
}
