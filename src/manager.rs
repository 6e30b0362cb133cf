//! The execution wrapper and process-level entry points.
//!
//! [`ProgressManager`] owns a [`ThreadIndicatorRegistry`] and a [`PriorityCoordinator`]
//! and exposes the operations application code actually calls:
//!
//! * [`run_under`](ProgressManager::run_under) runs work with an indicator as the calling
//!   thread's current one, registering and unregistering the thread around it;
//! * [`check_canceled`](ProgressManager::check_canceled) is the cheap check sprinkled
//!   through long computations;
//! * [`cancel`](ProgressManager::cancel) and
//!   [`mark_cancelled`](ProgressManager::mark_cancelled) propagate cancellation to the
//!   threads running under an indicator.
//!
//! # Example
//!
//! ```ignore
//! use progress_manager::{Cancellable, Indicator, ProgressManager};
//!
//! let manager = ProgressManager::new();
//! let indicator = Indicator::new("indexing");
//!
//! let result: Cancellable<u64> = manager.run_under(Some(&indicator), || {
//!     let mut sum = 0;
//!     for i in 0..1_000 {
//!         manager.check_canceled()?;
//!         sum += i;
//!     }
//!     Ok(sum)
//! });
//! ```

use std::{
    cell::Cell,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use tracing::{error, trace, warn};

use crate::{
    check::{CancellationHooks, CheckMode, NoHooks},
    config::ManagerConfig,
    error::{Cancellable, Cancelled},
    indicator::{Indicator, IndicatorSnapshot},
    priority::{PriorityCoordinator, ThreadStateProbe},
    registry::{Detached, Registration, RegistryStats, ThreadIndicatorRegistry},
    scheduler::{Scheduler, ThreadScheduler},
};

thread_local! {
    static NON_CANCELABLE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Whether the calling thread is inside
/// [`compute_in_non_cancelable_section`](ProgressManager::compute_in_non_cancelable_section).
#[must_use]
pub fn is_in_non_cancelable_section() -> bool {
    NON_CANCELABLE_DEPTH.with(|depth| depth.get() > 0)
}

/// Coordinates cancellation and prioritization for the threads of a process.
pub struct ProgressManager {
    registry: Arc<ThreadIndicatorRegistry>,
    priority: Arc<PriorityCoordinator>,
    unsafe_progress: AtomicUsize,
    config: ManagerConfig,
}

impl ProgressManager {
    /// Creates a manager with default settings, a [`ThreadScheduler`] and no hooks.
    #[must_use]
    pub fn new() -> Self {
        ProgressManagerBuilder::new().build()
    }

    /// Starts configuring a manager.
    #[must_use]
    pub fn builder() -> ProgressManagerBuilder {
        ProgressManagerBuilder::new()
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Runs `work` under `indicator` on the calling thread.
    ///
    /// With `None`, the work runs without any indicator and only counts towards
    /// [`has_unsafe_progress_indicator`](Self::has_unsafe_progress_indicator). When
    /// `indicator` already is the thread's current indicator, `work` runs directly.
    /// Otherwise the thread is registered under the indicator's whole wrap chain for the
    /// duration of `work`, and unregistered on every exit path including unwinding.
    pub fn run_under<T>(&self, indicator: Option<&Indicator>, work: impl FnOnce() -> T) -> T {
        let Some(indicator) = indicator else {
            self.unsafe_progress.fetch_add(1, Ordering::AcqRel);
            let _unsafe = UnsafeProgress(&self.unsafe_progress);
            return work();
        };

        let thread = thread::current().id();
        if self.registry.current(thread).as_ref() == Some(indicator) {
            return work();
        }

        let _registered = Registered {
            registry: &self.registry,
            registration: Some(self.registry.register(indicator, thread)),
        };
        work()
    }

    /// Runs `work` as the process driving `indicator`: starts it if needed, runs under it
    /// and stops it afterwards.
    ///
    /// Logs a warning when some thread already runs under the indicator, since starting
    /// and stopping it here then races with that thread.
    pub fn run_process<T>(&self, indicator: Option<&Indicator>, work: impl FnOnce() -> T) -> T {
        let Some(indicator) = indicator else {
            return self.run_under(None, work);
        };
        self.assert_no_other_thread_under(indicator);

        if !indicator.is_running() {
            indicator.start();
        }
        let _stop = StopOnExit(indicator);
        self.run_under(Some(indicator), work)
    }

    fn assert_no_other_thread_under(&self, indicator: &Indicator) {
        let current = thread::current().id();
        let Some(other) = self.registry.threads_under(indicator).into_iter().next() else {
            return;
        };
        if other == current {
            warn!(
                indicator = %indicator.id(),
                "this thread already runs under the indicator; starting or stopping it may race"
            );
        } else {
            warn!(
                indicator = %indicator.id(),
                other = ?other,
                "another thread already runs under the indicator; starting or stopping it may race"
            );
        }
    }

    /// Runs `work` with the calling thread detached from its indicators.
    ///
    /// Inside, [`current_indicator`](Self::current_indicator) is `None` and cancellation of
    /// the detached indicators is not observed. Both are restored afterwards.
    pub fn silence_global_indicator<T>(&self, work: impl FnOnce() -> T) -> T {
        let thread = thread::current().id();
        let _silenced = Silenced {
            registry: &self.registry,
            thread,
            detached: Some(self.registry.detach(thread)),
        };
        work()
    }

    /// Runs `work` with cancellation checks on this thread always succeeding.
    pub fn compute_in_non_cancelable_section<T>(&self, work: impl FnOnce() -> T) -> T {
        NON_CANCELABLE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        let _section = NonCancelable;
        work()
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Fails if the calling thread should stop its current work.
    ///
    /// While nothing is cancelled and no hooks are installed this is a single atomic load.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] when the thread runs under a cancelled indicator (directly
    /// or through a wrapper) or a hook demands cancellation.
    #[inline]
    pub fn check_canceled(&self) -> Cancellable<()> {
        match self.registry.mode() {
            CheckMode::None => Ok(()),
            mode => self.check_canceled_slow(mode),
        }
    }

    #[cold]
    fn check_canceled_slow(&self, mode: CheckMode) -> Cancellable<()> {
        if is_in_non_cancelable_section() {
            return Ok(());
        }
        let thread = thread::current().id();
        if mode == CheckMode::IndicatorPlusHooks && self.registry.is_thread_under_canceled(thread)
        {
            let cancelled = self
                .registry
                .canceled_indicator(thread)
                .map_or_else(Cancelled::new, Cancelled::by);
            trace!(?thread, indicator = ?cancelled.indicator(), "check_canceled failed");
            return Err(cancelled);
        }
        let current = self.registry.current(thread);
        self.registry.hooks().run_hooks(current.as_ref())
    }

    /// Propagates an already-set cancellation of `indicator` to the threads under it.
    /// Returns how many threads were newly marked.
    pub fn mark_cancelled(&self, indicator: &Indicator) -> usize {
        self.registry.mark_cancelled(indicator)
    }

    /// Cancels `indicator` and propagates it. Returns `true` if this call cancelled it.
    pub fn cancel(&self, indicator: &Indicator) -> bool {
        let flipped = indicator.set_canceled_flag();
        self.registry.mark_cancelled(indicator);
        flipped
    }

    /// Whether the calling thread runs under a cancelled indicator.
    #[must_use]
    pub fn is_thread_under_canceled_indicator(&self) -> bool {
        self.registry
            .is_thread_under_canceled(thread::current().id())
    }

    /// Recomputes the check mode; needed only for hook sets that cannot
    /// [`subscribe`](CancellationHooks::subscribe) to their own changes.
    pub fn refresh_check_mode(&self) {
        self.registry.refresh_check_mode();
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// The calling thread's innermost indicator.
    #[must_use]
    pub fn current_indicator(&self) -> Option<Indicator> {
        self.registry.current(thread::current().id())
    }

    /// Whether the calling thread runs under any indicator.
    #[must_use]
    pub fn has_progress_indicator(&self) -> bool {
        self.current_indicator().is_some()
    }

    /// Whether some thread runs work without any indicator.
    #[must_use]
    pub fn has_unsafe_progress_indicator(&self) -> bool {
        self.unsafe_progress_count() > 0
    }

    /// Number of [`run_under`](Self::run_under) calls currently running without an
    /// indicator.
    #[must_use]
    pub fn unsafe_progress_count(&self) -> usize {
        self.unsafe_progress.load(Ordering::Acquire)
    }

    /// Whether any active indicator is modal.
    #[must_use]
    pub fn has_modal_progress_indicator(&self) -> bool {
        self.registry.has_modal_indicator()
    }

    /// Every indicator some thread currently runs under.
    #[must_use]
    pub fn current_indicators(&self) -> Vec<Indicator> {
        self.registry.active_indicators()
    }

    /// Modality of the calling thread's top-level indicator.
    #[must_use]
    pub fn current_progress_modal(&self) -> Option<bool> {
        self.registry
            .top_level(thread::current().id())
            .map(|indicator| indicator.is_modal())
    }

    /// Logs an error unless the calling thread runs under `indicator`. Returns whether it
    /// does.
    pub fn assert_under_progress(&self, indicator: &Indicator) -> bool {
        let thread = thread::current().id();
        if self.registry.is_under(indicator, thread) {
            return true;
        }
        error!(
            indicator = %indicator.id(),
            current = ?self.registry.top_level(thread).map(|top| top.id()),
            "must be executed under this indicator; wrap the work in run_process or run_under"
        );
        false
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ThreadIndicatorRegistry> {
        &self.registry
    }

    /// The priority coordinator.
    #[must_use]
    pub fn priority(&self) -> &Arc<PriorityCoordinator> {
        &self.priority
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Captures a plain-data view of the manager.
    #[must_use]
    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            mode: self.registry.mode(),
            unsafe_progress: self.unsafe_progress_count(),
            active: self
                .registry
                .active_indicators()
                .iter()
                .map(Indicator::snapshot)
                .collect(),
            canceled_threads: self.registry.canceled_thread_count(),
            prioritized_threads: self.priority.prioritized_count(),
            suppress_count: self.priority.suppress_count(),
            poller_running: self.registry.is_poller_running(),
            stats: self.registry.stats(),
        }
    }

    // ========================================================================
    // Prioritization
    // ========================================================================

    /// See [`PriorityCoordinator::run_prioritized`].
    pub fn run_prioritized<T>(&self, work: impl FnOnce() -> T) -> T {
        self.priority.run_prioritized(work)
    }

    /// See [`PriorityCoordinator::should_yield`].
    #[must_use]
    pub fn should_yield(&self) -> bool {
        self.priority.should_yield()
    }

    /// See [`PriorityCoordinator::suppress_prioritizing`].
    pub fn suppress_prioritizing(&self) {
        self.priority.suppress_prioritizing();
    }

    /// See [`PriorityCoordinator::restore_prioritizing`].
    pub fn restore_prioritizing(&self) {
        self.priority.restore_prioritizing();
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProgressManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressManager")
            .field("registry", &self.registry)
            .field("priority", &self.priority)
            .field("unsafe_progress", &self.unsafe_progress_count())
            .finish()
    }
}

/// A builder for [`ProgressManager`] instances.
#[derive(Default)]
pub struct ProgressManagerBuilder {
    config: ManagerConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    hooks: Option<Arc<dyn CancellationHooks>>,
    probe: Option<Arc<dyn ThreadStateProbe>>,
}

impl ProgressManagerBuilder {
    /// Starts a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs background work (polling, unblock checks) on `scheduler`.
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Consults `hooks` on cancellation checks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn CancellationHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Detects blocked prioritized threads through `probe`.
    #[must_use]
    pub fn thread_state_probe(mut self, probe: Arc<dyn ThreadStateProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Creates the manager.
    #[must_use]
    pub fn build(self) -> ProgressManager {
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(ThreadScheduler::new()),
        };
        let hooks: Arc<dyn CancellationHooks> = match self.hooks {
            Some(hooks) => hooks,
            None => Arc::new(NoHooks),
        };
        ProgressManager {
            registry: ThreadIndicatorRegistry::new(self.config, scheduler.clone(), hooks),
            priority: PriorityCoordinator::new(self.config, scheduler, self.probe),
            unsafe_progress: AtomicUsize::new(0),
            config: self.config,
        }
    }
}

impl fmt::Debug for ProgressManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressManagerBuilder")
            .field("config", &self.config)
            .field("custom_scheduler", &self.scheduler.is_some())
            .field("custom_hooks", &self.hooks.is_some())
            .field("custom_probe", &self.probe.is_some())
            .finish()
    }
}

/// A plain-data view of a [`ProgressManager`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerSnapshot {
    /// The check mode at snapshot time.
    pub mode: CheckMode,
    /// Work running without an indicator.
    pub unsafe_progress: usize,
    /// Indicators some thread runs under.
    pub active: Vec<IndicatorSnapshot>,
    /// Threads running under a cancelled indicator.
    pub canceled_threads: usize,
    /// Prioritized threads.
    pub prioritized_threads: usize,
    /// Prioritization suppression nesting.
    pub suppress_count: i64,
    /// Whether non-standard indicators are being polled.
    pub poller_running: bool,
    /// Registry counters.
    pub stats: RegistryStats,
}

// ============================================================================
// Scope guards
// ============================================================================

struct UnsafeProgress<'a>(&'a AtomicUsize);

impl Drop for UnsafeProgress<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Registered<'a> {
    registry: &'a ThreadIndicatorRegistry,
    registration: Option<Registration>,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            self.registry.unregister(registration);
        }
    }
}

struct StopOnExit<'a>(&'a Indicator);

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        if self.0.is_running() {
            self.0.stop();
        }
    }
}

struct Silenced<'a> {
    registry: &'a ThreadIndicatorRegistry,
    thread: thread::ThreadId,
    detached: Option<Detached>,
}

impl Drop for Silenced<'_> {
    fn drop(&mut self) {
        if let Some(detached) = self.detached.take() {
            self.registry.reattach(self.thread, detached);
        }
    }
}

struct NonCancelable;

impl Drop for NonCancelable {
    fn drop(&mut self) {
        NON_CANCELABLE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}
