//! Soft thread prioritization with deadlock avoidance.
//!
//! A thread running inside [`PriorityCoordinator::run_prioritized`] asks every other
//! thread to back off. Cooperative code polls [`PriorityCoordinator::should_yield`] (or
//! [`PriorityCoordinator::yield_to_prioritized`]) and parks briefly when it says so. This
//! is advisory only; nothing is descheduled by force.
//!
//! # Priority inversion
//!
//! A yielding thread might hold a lock a prioritized thread waits for. Whenever a
//! prioritized thread looks blocked, prioritization is suppressed (nobody yields) and a
//! retry is scheduled shortly after; the retry keeps rescheduling itself while the block
//! persists and lifts the suppression once it clears.
//!
//! Rust cannot read another thread's OS run state, so "blocked" is whatever the
//! configured [`ThreadStateProbe`] reports. The default [`BlockingMonitor`] relies on
//! threads announcing their waits through [`PriorityCoordinator::blocked_section`].

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
    time::Duration,
};

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tracing::{debug, error, warn};
use web_time::Instant;

use crate::{config::ManagerConfig, scheduler::Scheduler};

/// Coarse run state of a thread, as far as prioritization cares.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ThreadRunState {
    /// Running or ready to run.
    #[default]
    Runnable,
    /// Waiting to acquire a lock.
    Blocked,
    /// Waiting indefinitely for another thread.
    Waiting,
    /// Waiting for another thread with a timeout.
    TimedWaiting,
}

impl ThreadRunState {
    /// Whether the thread is not making progress on its own.
    #[must_use]
    pub const fn is_blocked(self) -> bool {
        !matches!(self, Self::Runnable)
    }
}

/// Reports the run state of arbitrary threads.
pub trait ThreadStateProbe: Send + Sync {
    /// The current state of `thread`; unknown threads are [`ThreadRunState::Runnable`].
    fn state(&self, thread: ThreadId) -> ThreadRunState;
}

/// A [`ThreadStateProbe`] fed by threads announcing their own waits.
#[derive(Debug, Default)]
pub struct BlockingMonitor {
    states: DashMap<ThreadId, ThreadRunState>,
}

impl BlockingMonitor {
    /// Creates a monitor that considers every thread runnable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the calling thread as being in `state` until the guard is dropped.
    pub fn enter(&self, state: ThreadRunState) -> BlockedSection<'_> {
        let thread = thread::current().id();
        let previous = self.states.insert(thread, state);
        BlockedSection {
            monitor: self,
            thread,
            previous,
        }
    }
}

impl ThreadStateProbe for BlockingMonitor {
    fn state(&self, thread: ThreadId) -> ThreadRunState {
        self.states
            .get(&thread)
            .map_or(ThreadRunState::Runnable, |state| *state)
    }
}

/// Guard returned by [`BlockingMonitor::enter`]; restores the previous state on drop.
#[must_use = "the thread counts as blocked only while the section is alive"]
pub struct BlockedSection<'a> {
    monitor: &'a BlockingMonitor,
    thread: ThreadId,
    previous: Option<ThreadRunState>,
}

impl Drop for BlockedSection<'_> {
    fn drop(&mut self) {
        match self.previous {
            Some(previous) => {
                self.monitor.states.insert(self.thread, previous);
            }
            None => {
                self.monitor.states.remove(&self.thread);
            }
        }
    }
}

/// Tracks prioritized threads and decides when others should yield to them.
pub struct PriorityCoordinator {
    prioritized: DashSet<ThreadId>,
    deprioritizations: AtomicI64,
    /// Nanoseconds after `epoch` at which the prioritized set last became non-empty.
    started_at: AtomicU64,
    epoch: Instant,
    ui_thread: RwLock<Option<ThreadId>>,
    monitor: Arc<BlockingMonitor>,
    probe: Arc<dyn ThreadStateProbe>,
    scheduler: Arc<dyn Scheduler>,
    config: ManagerConfig,
    this: Weak<Self>,
}

impl PriorityCoordinator {
    /// Creates a coordinator. Without an explicit `probe`, blocking is detected through
    /// [`blocked_section`](Self::blocked_section) announcements.
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        scheduler: Arc<dyn Scheduler>,
        probe: Option<Arc<dyn ThreadStateProbe>>,
    ) -> Arc<Self> {
        let monitor = Arc::new(BlockingMonitor::new());
        let probe: Arc<dyn ThreadStateProbe> = match probe {
            Some(probe) => probe,
            None => monitor.clone(),
        };
        Arc::new_cyclic(|this| Self {
            prioritized: DashSet::new(),
            deprioritizations: AtomicI64::new(0),
            started_at: AtomicU64::new(0),
            epoch: Instant::now(),
            ui_thread: RwLock::new(None),
            monitor,
            probe,
            scheduler,
            config,
            this: this.clone(),
        })
    }

    // ========================================================================
    // Prioritization
    // ========================================================================

    /// Runs `work` with the calling thread prioritized. Nested calls do not nest.
    pub fn run_prioritized<T>(&self, work: impl FnOnce() -> T) -> T {
        if self.is_current_thread_prioritized() {
            return work();
        }
        let thread = thread::current().id();
        if self.prioritized.is_empty() {
            self.started_at.store(self.now_nanos(), Ordering::Release);
        }
        self.change_prioritizing(|| self.prioritized.insert(thread));

        let _prioritized = Prioritized {
            coordinator: self,
            thread,
        };
        work()
    }

    /// Whether the calling thread is prioritized.
    #[must_use]
    pub fn is_current_thread_prioritized(&self) -> bool {
        self.prioritized.contains(&thread::current().id())
    }

    /// Number of prioritized threads.
    #[must_use]
    pub fn prioritized_count(&self) -> usize {
        self.prioritized.len()
    }

    /// Drops every thread from the prioritized set.
    pub fn stop_all_prioritization(&self) {
        self.change_prioritizing(|| self.prioritized.clear());
    }

    /// Designates the UI thread, which never yields.
    pub fn set_ui_thread(&self, thread: Option<ThreadId>) {
        *self.ui_thread.write() = thread;
    }

    /// The designated UI thread.
    #[must_use]
    pub fn ui_thread(&self) -> Option<ThreadId> {
        *self.ui_thread.read()
    }

    // ========================================================================
    // Suppression
    // ========================================================================

    /// Suspends prioritization until a matching
    /// [`restore_prioritizing`](Self::restore_prioritizing).
    ///
    /// Prefer [`suppressing`](Self::suppressing), which restores automatically.
    pub fn suppress_prioritizing(&self) {
        let nesting =
            self.change_prioritizing(|| self.deprioritizations.fetch_add(1, Ordering::AcqRel) + 1);
        if nesting == self.config.suspicious_suppress_nesting {
            error!(
                nesting,
                "suspiciously deep suppress_prioritizing nesting; is a restore missing?"
            );
        }
    }

    /// Undoes one [`suppress_prioritizing`](Self::suppress_prioritizing).
    ///
    /// An unmatched call is logged and the counter is reset to zero.
    pub fn restore_prioritizing(&self) {
        let nesting =
            self.change_prioritizing(|| self.deprioritizations.fetch_sub(1, Ordering::AcqRel) - 1);
        if nesting < 0 {
            self.change_prioritizing(|| self.deprioritizations.store(0, Ordering::Release));
            error!("unmatched suppress_prioritizing/restore_prioritizing");
        }
    }

    /// Suppresses prioritization until the returned guard is dropped.
    pub fn suppressing(&self) -> Suppression<'_> {
        self.suppress_prioritizing();
        Suppression { coordinator: self }
    }

    /// Disables deprioritization entirely while `work` runs (e.g. for long test runs).
    pub fn suppress_all_deprioritizations_during<T>(&self, work: impl FnOnce() -> T) -> T {
        let amount = self.config.deprioritization_disable_threshold;
        self.change_prioritizing(|| self.deprioritizations.fetch_add(amount, Ordering::AcqRel));
        let _restore = DisabledDeprioritization {
            coordinator: self,
            amount,
        };
        work()
    }

    /// Current suppression nesting.
    #[must_use]
    pub fn suppress_count(&self) -> i64 {
        self.deprioritizations.load(Ordering::Acquire)
    }

    /// Whether deprioritization has not been disabled wholesale.
    #[must_use]
    pub fn is_deprioritization_enabled(&self) -> bool {
        self.suppress_count() < self.config.deprioritization_disable_threshold
    }

    // ========================================================================
    // Yielding
    // ========================================================================

    /// Whether the calling thread should back off in favor of prioritized threads.
    ///
    /// May suppress prioritization as a side effect when a prioritized thread is blocked.
    #[must_use]
    pub fn should_yield(&self) -> bool {
        self.is_deprioritization_enabled()
            && self.suppress_count() <= 0
            && !self.prioritized.is_empty()
            && !self.is_current_thread_prioritized()
            && self.is_low_priority_really_applicable()
    }

    /// Parks the calling thread briefly if [`should_yield`](Self::should_yield) says so.
    /// Returns whether it parked.
    pub fn yield_to_prioritized(&self) -> bool {
        if !self.should_yield() {
            return false;
        }
        thread::park_timeout(self.config.yield_park);
        self.avoid_blocking_prioritized_thread();
        true
    }

    /// Announces that the calling thread is in `state` until the guard is dropped.
    pub fn blocked_section(&self, state: ThreadRunState) -> BlockedSection<'_> {
        self.monitor.enter(state)
    }

    /// Whether any prioritized thread currently looks blocked.
    #[must_use]
    pub fn is_any_prioritized_thread_blocked(&self) -> bool {
        self.prioritized
            .iter()
            .any(|thread| self.probe.state(*thread).is_blocked())
    }

    fn is_low_priority_really_applicable(&self) -> bool {
        let elapsed = self.prioritizing_elapsed();
        if elapsed < self.config.min_prioritization {
            // Very short activities are not worth slowing others down for.
            return false;
        }
        if self.avoid_blocking_prioritized_thread() {
            return false;
        }
        let current = thread::current().id();
        if self.ui_thread() == Some(current) {
            return false;
        }
        if elapsed > self.config.max_prioritization {
            warn!(
                ?elapsed,
                threads = self.prioritized.len(),
                "prioritization lasted too long; assuming it was never stopped"
            );
            self.stop_all_prioritization();
            return false;
        }
        true
    }

    fn avoid_blocking_prioritized_thread(&self) -> bool {
        if self.suppress_count() > 0 || !self.is_any_prioritized_thread_blocked() {
            return false;
        }
        // The calling thread may hold a lock the prioritized thread is waiting for.
        self.suppress_prioritizing();
        self.check_later_threads_are_unblocked();
        true
    }

    fn check_later_threads_are_unblocked(&self) {
        let this = self.this.clone();
        let retry = Box::new(move || {
            let Some(coordinator) = this.upgrade() else {
                return;
            };
            if coordinator.is_any_prioritized_thread_blocked() {
                coordinator.check_later_threads_are_unblocked();
            } else {
                coordinator.restore_prioritizing();
            }
        });
        if let Err(err) = self
            .scheduler
            .schedule_once(self.config.unblock_retry_delay, retry)
        {
            debug!(error = %err, "cannot schedule unblock check; lifting suppression now");
            self.restore_prioritizing();
        }
    }

    fn change_prioritizing<T>(&self, change: impl FnOnce() -> T) -> T {
        let was_idle = self.is_idle();
        let result = change();
        let idle = self.is_idle();
        if was_idle && !idle {
            debug!(threads = self.prioritized.len(), "prioritizing started");
        } else if !was_idle && idle {
            debug!("prioritizing finished");
        }
        result
    }

    fn is_idle(&self) -> bool {
        self.suppress_count() > 0 || self.prioritized.is_empty()
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn prioritizing_elapsed(&self) -> Duration {
        let started = self.started_at.load(Ordering::Acquire);
        Duration::from_nanos(self.now_nanos().saturating_sub(started))
    }
}

impl fmt::Debug for PriorityCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityCoordinator")
            .field("prioritized", &self.prioritized.len())
            .field("suppress_count", &self.suppress_count())
            .field("ui_thread", &self.ui_thread())
            .finish_non_exhaustive()
    }
}

struct Prioritized<'a> {
    coordinator: &'a PriorityCoordinator,
    thread: ThreadId,
}

impl Drop for Prioritized<'_> {
    fn drop(&mut self) {
        let coordinator = self.coordinator;
        coordinator.change_prioritizing(|| coordinator.prioritized.remove(&self.thread));
    }
}

/// Guard returned by [`PriorityCoordinator::suppressing`].
#[must_use = "prioritization is restored as soon as the guard is dropped"]
pub struct Suppression<'a> {
    coordinator: &'a PriorityCoordinator,
}

impl Drop for Suppression<'_> {
    fn drop(&mut self) {
        self.coordinator.restore_prioritizing();
    }
}

struct DisabledDeprioritization<'a> {
    coordinator: &'a PriorityCoordinator,
    amount: i64,
}

impl Drop for DisabledDeprioritization<'_> {
    fn drop(&mut self) {
        let coordinator = self.coordinator;
        coordinator.change_prioritizing(|| {
            coordinator
                .deprioritizations
                .fetch_sub(self.amount, Ordering::AcqRel)
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, mpsc},
        thread,
        time::Duration,
    };

    use super::{PriorityCoordinator, ThreadRunState};
    use crate::{ManagerConfig, ManualScheduler};

    fn coordinator(
        min: Duration,
        max: Duration,
    ) -> (Arc<PriorityCoordinator>, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let config = ManagerConfig::default().with_prioritization_window(min, max);
        (PriorityCoordinator::new(config, scheduler.clone(), None), scheduler)
    }

    /// Runs a prioritized peer thread that optionally announces a wait, then parks until
    /// told to finish. Returns the channels to drive it.
    fn prioritized_peer(
        coordinator: &Arc<PriorityCoordinator>,
        blocked: bool,
    ) -> (mpsc::Sender<()>, mpsc::Receiver<()>, thread::JoinHandle<()>) {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (step_tx, step_rx) = mpsc::channel::<()>();
        let peer = coordinator.clone();
        let handle = thread::spawn(move || {
            peer.run_prioritized(|| {
                if blocked {
                    let _waiting = peer.blocked_section(ThreadRunState::Waiting);
                    ready_tx.send(()).unwrap();
                    step_rx.recv().unwrap();
                }
                ready_tx.send(()).unwrap();
                step_rx.recv().unwrap();
            });
        });
        ready_rx.recv().unwrap();
        (step_tx, ready_rx, handle)
    }

    /// Yielding To A Peer
    /// Non-prioritized threads yield while a runnable peer is prioritized, not after.
    #[test]
    fn test_yield_to_runnable_peer() {
        let (coordinator, _) = coordinator(Duration::ZERO, Duration::from_secs(60));
        assert!(!coordinator.should_yield());

        let (step, _ready, handle) = prioritized_peer(&coordinator, false);
        assert_eq!(coordinator.prioritized_count(), 1);
        assert!(coordinator.should_yield());
        assert!(coordinator.yield_to_prioritized());

        step.send(()).unwrap();
        handle.join().unwrap();
        assert_eq!(coordinator.prioritized_count(), 0);
        assert!(!coordinator.should_yield());
    }

    /// Prioritized Threads Never Yield
    /// Nested prioritization is flat and the prioritized thread itself never yields.
    #[test]
    fn test_prioritized_thread_does_not_yield() {
        let (coordinator, _) = coordinator(Duration::ZERO, Duration::from_secs(60));
        coordinator.run_prioritized(|| {
            coordinator.run_prioritized(|| assert!(coordinator.is_current_thread_prioritized()));
            assert!(coordinator.is_current_thread_prioritized());
            assert!(!coordinator.should_yield());
        });
        assert!(!coordinator.is_current_thread_prioritized());
    }

    /// Deadlock Avoidance
    /// A blocked prioritized peer suppresses yielding until a retry sees it unblocked.
    #[test]
    fn test_blocked_peer_suppresses_until_unblocked() {
        let (coordinator, scheduler) = coordinator(Duration::ZERO, Duration::from_secs(60));
        let (step, ready, handle) = prioritized_peer(&coordinator, true);

        assert!(coordinator.is_any_prioritized_thread_blocked());
        assert!(!coordinator.should_yield());
        assert_eq!(coordinator.suppress_count(), 1);
        assert_eq!(scheduler.pending_count(), 1);

        // Still blocked: the retry reschedules itself and keeps the suppression.
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(scheduler.pending_count(), 1);
        assert_eq!(coordinator.suppress_count(), 1);
        assert!(!coordinator.should_yield());

        // Unblock the peer; it stays prioritized but runnable.
        step.send(()).unwrap();
        ready.recv().unwrap();
        assert!(!coordinator.is_any_prioritized_thread_blocked());

        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(coordinator.suppress_count(), 0);
        assert!(coordinator.should_yield());

        step.send(()).unwrap();
        handle.join().unwrap();
    }

    /// UI Thread
    /// The designated UI thread never yields.
    #[test]
    fn test_ui_thread_never_yields() {
        let (coordinator, _) = coordinator(Duration::ZERO, Duration::from_secs(60));
        let (step, _ready, handle) = prioritized_peer(&coordinator, false);

        assert!(coordinator.should_yield());
        coordinator.set_ui_thread(Some(thread::current().id()));
        assert!(!coordinator.should_yield());
        coordinator.set_ui_thread(None);

        step.send(()).unwrap();
        handle.join().unwrap();
    }

    /// Time Window
    /// Too-young prioritization is ignored; too-old prioritization is cleared.
    #[test]
    fn test_prioritization_window() {
        let (young, _) = coordinator(Duration::from_secs(60), Duration::from_secs(120));
        let (step, _ready, handle) = prioritized_peer(&young, false);
        assert!(!young.should_yield());
        step.send(()).unwrap();
        handle.join().unwrap();

        let (stale, _) = coordinator(Duration::ZERO, Duration::from_nanos(1));
        let (step, _ready, handle) = prioritized_peer(&stale, false);
        thread::sleep(Duration::from_millis(2));
        assert!(!stale.should_yield());
        assert_eq!(stale.prioritized_count(), 0);
        step.send(()).unwrap();
        handle.join().unwrap();
    }

    /// Suppression Bookkeeping
    /// Guards balance, unmatched restores reset to zero, and the sentinel disables all.
    #[test]
    fn test_suppression_bookkeeping() {
        let (coordinator, _) = coordinator(Duration::ZERO, Duration::from_secs(60));
        {
            let _outer = coordinator.suppressing();
            let _inner = coordinator.suppressing();
            assert_eq!(coordinator.suppress_count(), 2);
        }
        assert_eq!(coordinator.suppress_count(), 0);

        coordinator.restore_prioritizing();
        assert_eq!(coordinator.suppress_count(), 0);

        coordinator.suppress_all_deprioritizations_during(|| {
            assert!(!coordinator.is_deprioritization_enabled());
        });
        assert!(coordinator.is_deprioritization_enabled());
        assert_eq!(coordinator.suppress_count(), 0);
    }
}
