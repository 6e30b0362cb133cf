//! Periodic and delayed task execution supplied by the host.
//!
//! The cancellation core never spawns threads on its own. It asks a [`Scheduler`] to
//! run the non-standard indicator poll and the deadlock-avoidance retry, and keeps the
//! returned [`CancelHandle`] to stop them again.
//!
//! Two implementations ship with the crate:
//!
//! * [`ThreadScheduler`]: one named OS thread per scheduled task, woken early on cancel.
//! * [`ManualScheduler`]: nothing runs until the owner calls [`ManualScheduler::tick`] or
//!   [`ManualScheduler::run_pending`]; delays are ignored. Useful for hosts with their own
//!   event loop and for deterministic tests.

use std::{
    fmt, io, mem,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::trace;
use web_time::Instant;

use crate::error::SchedulerError;

/// A repeating task body.
pub type RepeatingTask = Box<dyn FnMut() + Send + 'static>;

/// A one-shot task body.
pub type OnceTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks in the background on behalf of the cancellation core.
pub trait Scheduler: Send + Sync {
    /// Runs `task` now and then every `period` until the returned handle is cancelled.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler cannot accept the task.
    fn schedule_repeating(
        &self,
        period: Duration,
        task: RepeatingTask,
    ) -> Result<CancelHandle, SchedulerError>;

    /// Runs `task` once after `delay`, unless the returned handle is cancelled first.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler cannot accept the task.
    fn schedule_once(&self, delay: Duration, task: OnceTask)
    -> Result<CancelHandle, SchedulerError>;
}

/// Stops a scheduled task. Cloning shares the same cancellation state.
#[derive(Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    canceled: Mutex<bool>,
    wakeup: Condvar,
}

impl CancelHandle {
    /// Creates a live handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevents any further runs of the task. A run already in progress completes.
    pub fn cancel(&self) {
        *self.state.canceled.lock() = true;
        self.state.wakeup.notify_all();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        *self.state.canceled.lock()
    }

    /// Sleeps up to `timeout`, waking early on cancellation. Returns `true` if cancelled.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut canceled = self.state.canceled.lock();
        while !*canceled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.state.wakeup.wait_for(&mut canceled, deadline - now);
        }
        *canceled
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Runs every task on a dedicated, named OS thread.
#[derive(Default)]
pub struct ThreadScheduler {
    shut_down: AtomicBool,
    live: Mutex<Vec<CancelHandle>>,
}

impl ThreadScheduler {
    /// Creates a scheduler accepting tasks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels every outstanding task and rejects new ones.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        for handle in mem::take(&mut *self.live.lock()) {
            handle.cancel();
        }
    }

    /// Number of tasks that have neither finished nor been cancelled.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
            .lock()
            .iter()
            .filter(|handle| !handle.is_canceled())
            .count()
    }

    /// Tracks a new handle and hands it to `spawn`. A failed spawn cancels the handle so
    /// it is pruned like a finished task.
    fn launch(
        &self,
        spawn: impl FnOnce(CancelHandle) -> io::Result<()>,
    ) -> Result<CancelHandle, SchedulerError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        let handle = CancelHandle::new();
        {
            let mut live = self.live.lock();
            live.retain(|h| !h.is_canceled());
            live.push(handle.clone());
        }
        if let Err(err) = spawn(handle.clone()) {
            handle.cancel();
            return Err(SchedulerError::Spawn(err));
        }
        Ok(handle)
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_repeating(
        &self,
        period: Duration,
        mut task: RepeatingTask,
    ) -> Result<CancelHandle, SchedulerError> {
        self.launch(move |stop| {
            thread::Builder::new()
                .name("progress-poller".into())
                .spawn(move || {
                    while !stop.is_canceled() {
                        task();
                        if stop.wait(period) {
                            break;
                        }
                    }
                    trace!("repeating task stopped");
                })
                .map(drop)
        })
    }

    fn schedule_once(
        &self,
        delay: Duration,
        task: OnceTask,
    ) -> Result<CancelHandle, SchedulerError> {
        self.launch(move |stop| {
            thread::Builder::new()
                .name("progress-delayed".into())
                .spawn(move || {
                    if !stop.wait(delay) {
                        task();
                    }
                    // Finished tasks count as cancelled so `launch` can prune them.
                    stop.cancel();
                })
                .map(drop)
        })
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A scheduler driven explicitly by its owner.
#[derive(Default)]
pub struct ManualScheduler {
    shut_down: AtomicBool,
    queue: Mutex<ManualQueue>,
}

#[derive(Default)]
struct ManualQueue {
    repeating: Vec<(CancelHandle, RepeatingTask)>,
    once: Vec<(CancelHandle, OnceTask)>,
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every live repeating task once. Returns how many ran.
    ///
    /// Tasks run without the queue lock held, so they may schedule further work.
    pub fn tick(&self) -> usize {
        let mut tasks = mem::take(&mut self.queue.lock().repeating);
        let mut ran = 0;
        for (handle, task) in &mut tasks {
            if !handle.is_canceled() {
                task();
                ran += 1;
            }
        }
        tasks.retain(|(handle, _)| !handle.is_canceled());

        let mut queue = self.queue.lock();
        tasks.append(&mut queue.repeating);
        queue.repeating = tasks;
        ran
    }

    /// Runs the one-shot tasks queued before this call, ignoring their delays.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let tasks = mem::take(&mut self.queue.lock().once);
        let mut ran = 0;
        for (handle, task) in tasks {
            if !handle.is_canceled() {
                task();
                handle.cancel();
                ran += 1;
            }
        }
        ran
    }

    /// Number of repeating tasks that have not been cancelled.
    #[must_use]
    pub fn repeating_count(&self) -> usize {
        self.queue
            .lock()
            .repeating
            .iter()
            .filter(|(handle, _)| !handle.is_canceled())
            .count()
    }

    /// Number of one-shot tasks waiting for [`run_pending`](Self::run_pending).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue
            .lock()
            .once
            .iter()
            .filter(|(handle, _)| !handle.is_canceled())
            .count()
    }

    /// Rejects new tasks and drops queued ones.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let mut queue = self.queue.lock();
        for (handle, _) in queue.repeating.drain(..) {
            handle.cancel();
        }
        for (handle, _) in queue.once.drain(..) {
            handle.cancel();
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_repeating(
        &self,
        _period: Duration,
        task: RepeatingTask,
    ) -> Result<CancelHandle, SchedulerError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        let handle = CancelHandle::new();
        self.queue.lock().repeating.push((handle.clone(), task));
        Ok(handle)
    }

    fn schedule_once(
        &self,
        _delay: Duration,
        task: OnceTask,
    ) -> Result<CancelHandle, SchedulerError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        let handle = CancelHandle::new();
        self.queue.lock().once.push((handle.clone(), task));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };

    use super::{ManualScheduler, Scheduler, ThreadScheduler};
    use crate::error::SchedulerError;

    /// Repeating Thread Task
    /// The task keeps running until cancelled, then stops for good.
    #[test]
    fn test_thread_repeating_stops_on_cancel() {
        let scheduler = ThreadScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let handle = scheduler
            .schedule_repeating(
                Duration::from_millis(1),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        while runs.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        handle.cancel();
        // Let a run that was already in flight finish.
        thread::sleep(Duration::from_millis(20));
        let settled = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), settled);
    }

    /// Delayed Thread Task
    /// A cancelled one-shot task never runs; an uncancelled one does.
    #[test]
    fn test_thread_once() {
        let scheduler = ThreadScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let doomed = scheduler
            .schedule_once(
                Duration::from_millis(200),
                Box::new(move || {
                    counter.fetch_add(100, Ordering::SeqCst);
                }),
            )
            .unwrap();
        doomed.cancel();

        let counter = runs.clone();
        let fired = scheduler
            .schedule_once(
                Duration::from_millis(1),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        while !fired.is_canceled() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    /// Shutdown
    /// A shut-down scheduler rejects new work.
    #[test]
    fn test_shutdown_rejects() {
        let scheduler = ThreadScheduler::new();
        scheduler.shutdown();
        let result = scheduler.schedule_once(Duration::ZERO, Box::new(|| {}));
        assert!(matches!(result, Err(SchedulerError::ShutDown)));

        let manual = ManualScheduler::new();
        manual.shutdown();
        assert!(manual.schedule_repeating(Duration::ZERO, Box::new(|| {})).is_err());
    }

    /// Failed Spawn
    /// A task whose thread cannot be started is reported and not left behind as live.
    #[test]
    fn test_failed_spawn_is_not_tracked() {
        let scheduler = ThreadScheduler::new();
        let result = scheduler.launch(|_| Err(io::Error::other("thread limit reached")));
        assert!(matches!(result, Err(SchedulerError::Spawn(_))));
        assert_eq!(scheduler.live_count(), 0);

        let handle = scheduler
            .schedule_repeating(Duration::from_millis(1), Box::new(|| {}))
            .unwrap();
        assert_eq!(scheduler.live_count(), 1);
        handle.cancel();
        assert_eq!(scheduler.live_count(), 0);
    }

    /// Manual Driving
    /// Ticks run live repeating tasks; one-shots run once and may reschedule.
    #[test]
    fn test_manual_scheduler() {
        let scheduler = Arc::new(ManualScheduler::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let handle = scheduler
            .schedule_repeating(
                Duration::from_millis(10),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert_eq!(scheduler.tick(), 1);
        assert_eq!(scheduler.tick(), 1);
        handle.cancel();
        assert_eq!(scheduler.tick(), 0);
        assert_eq!(scheduler.repeating_count(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let again = scheduler.clone();
        scheduler
            .schedule_once(
                Duration::from_millis(5),
                Box::new(move || {
                    again
                        .schedule_once(Duration::from_millis(5), Box::new(|| {}))
                        .unwrap();
                }),
            )
            .unwrap();
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(scheduler.pending_count(), 1);
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }
}
