//! Process-wide accounting of which threads run under which indicators.
//!
//! The [`ThreadIndicatorRegistry`] is the shared heart of the cancellation core. It keeps
//!
//! * for every active indicator, the set of threads running under it or under a wrapper
//!   of it;
//! * for every thread, its current (innermost) and top-level indicator;
//! * the set of threads whose current chain contains a cancelled indicator;
//! * reference counts of the non-standard indicators in use, which drive the poller.
//!
//! # Synchronization Strategy
//!
//! A single [`Mutex`] serializes [`register`](ThreadIndicatorRegistry::register),
//! [`unregister`](ThreadIndicatorRegistry::unregister),
//! [`mark_cancelled`](ThreadIndicatorRegistry::mark_cancelled) and poller start/stop.
//! It is only ever held for map updates: never across user work, hooks, or the poller's
//! per-indicator checks.
//!
//! The per-thread maps and the cancelled-thread set live outside the mutex in concurrent
//! containers. They are *written* only with the mutex held but can be *read* from any
//! thread without it, which is what keeps the cancellation check lock-free.
//!
//! # Invariant
//!
//! A thread is in the cancelled-thread set iff some indicator in its current chain (the
//! current indicator and every original it wraps) is cancelled. Every mutation restores
//! this before releasing the mutex.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread::ThreadId,
};

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::{
    check::{CancellationHooks, CheckMode, CheckModeFlag},
    config::ManagerConfig,
    indicator::{Indicator, IndicatorId},
    poller::CancellationPoller,
    scheduler::Scheduler,
};

/// Shared registry of threads running under indicators.
pub struct ThreadIndicatorRegistry {
    state: Mutex<RegistryState>,

    // Written only while `state` is locked.
    canceled_threads: DashSet<ThreadId>,
    current: DashMap<ThreadId, Indicator>,
    top_level: DashMap<ThreadId, Indicator>,
    mode: CheckModeFlag,

    hooks: Arc<dyn CancellationHooks>,
    scheduler: Arc<dyn Scheduler>,
    config: ManagerConfig,
    stats: StatCounters,
    this: Weak<Self>,
}

#[derive(Default)]
struct RegistryState {
    threads_under_indicator: HashMap<Indicator, HashSet<ThreadId>>,
    /// Poor man's multiset: how many live registrations use each non-standard indicator.
    non_standard: HashMap<Indicator, usize>,
    poller: CancellationPoller,
}

#[derive(Default)]
struct StatCounters {
    registrations: AtomicU64,
    unregistrations: AtomicU64,
    lock_acquisitions: AtomicU64,
    mark_cancelled_calls: AtomicU64,
    poller_starts: AtomicU64,
    poller_stops: AtomicU64,
}

/// Instrumentation counters of a [`ThreadIndicatorRegistry`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegistryStats {
    /// Completed [`register`](ThreadIndicatorRegistry::register) calls.
    pub registrations: u64,
    /// Completed [`unregister`](ThreadIndicatorRegistry::unregister) calls.
    pub unregistrations: u64,
    /// Times the registry mutex was taken.
    pub lock_acquisitions: u64,
    /// Calls to [`mark_cancelled`](ThreadIndicatorRegistry::mark_cancelled).
    pub mark_cancelled_calls: u64,
    /// Times the non-standard poller was started.
    pub poller_starts: u64,
    /// Times the non-standard poller was stopped.
    pub poller_stops: u64,
}

/// Proof that a thread was registered under an indicator chain.
///
/// Consumed by [`ThreadIndicatorRegistry::unregister`], so it cannot be released twice.
#[must_use = "a registration that is never unregistered leaks thread accounting"]
pub struct Registration {
    thread: ThreadId,
    indicator: Indicator,
    previous: Option<Indicator>,
    /// Every chain link, with whether this registration added the thread to its set.
    links: Vec<(Indicator, bool)>,
}

impl Registration {
    /// The registered thread.
    #[must_use]
    pub const fn thread(&self) -> ThreadId {
        self.thread
    }

    /// The indicator the thread was registered under.
    #[must_use]
    pub const fn indicator(&self) -> &Indicator {
        &self.indicator
    }

    /// The thread's current indicator before this registration.
    #[must_use]
    pub const fn previous(&self) -> Option<&Indicator> {
        self.previous.as_ref()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("thread", &self.thread)
            .field("indicator", &self.indicator.id())
            .field("links", &self.links.len())
            .finish_non_exhaustive()
    }
}

impl ThreadIndicatorRegistry {
    /// Creates a registry. Background polling goes through `scheduler`.
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        scheduler: Arc<dyn Scheduler>,
        hooks: Arc<dyn CancellationHooks>,
    ) -> Arc<Self> {
        let registry = Arc::new_cyclic(|this| Self {
            state: Mutex::new(RegistryState::default()),
            canceled_threads: DashSet::new(),
            current: DashMap::new(),
            top_level: DashMap::new(),
            mode: CheckModeFlag::default(),
            hooks,
            scheduler,
            config,
            stats: StatCounters::default(),
            this: this.clone(),
        });
        let this = Arc::downgrade(&registry);
        registry.hooks.subscribe(Arc::new(move || {
            if let Some(registry) = this.upgrade() {
                registry.refresh_check_mode();
            }
        }));
        registry.refresh_check_mode();
        registry
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.stats.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
        self.state.lock()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Makes `indicator` the current indicator of `thread` and registers the thread under
    /// it and every original it wraps.
    ///
    /// Registering a thread under an indicator it already runs under is logged as a
    /// likely data race upstream but still succeeds.
    pub fn register(&self, indicator: &Indicator, thread: ThreadId) -> Registration {
        let mut guard = self.lock();
        let state = &mut *guard;

        let previous = self.current.get(&thread).map(|entry| entry.value().clone());
        self.set_current(thread, Some(indicator));

        let mut links = Vec::new();
        let mut any_canceled = false;
        for (depth, link) in indicator
            .chain_with_limit(self.config.max_wrap_depth)
            .enumerate()
        {
            let added = state
                .threads_under_indicator
                .entry(link.clone())
                .or_default()
                .insert(thread);
            if !added && depth == 0 {
                warn!(
                    ?thread,
                    indicator = %link.id(),
                    "thread is already running under this indicator; this may be a data race"
                );
            }

            if !link.is_standard() {
                *state.non_standard.entry(link.clone()).or_insert(0) += 1;
                if state
                    .poller
                    .start(&*self.scheduler, self.config.check_canceled_delay, self.this.clone())
                {
                    self.stats.poller_starts.fetch_add(1, Ordering::Relaxed);
                }
            }

            any_canceled |= link.is_canceled();
            links.push((link.clone(), added));
        }

        self.update_thread_under_canceled(thread, any_canceled);
        self.stats.registrations.fetch_add(1, Ordering::Relaxed);
        trace!(?thread, indicator = %indicator.id(), depth = links.len(), "registered");

        Registration {
            thread,
            indicator: indicator.clone(),
            previous,
            links,
        }
    }

    /// Reverses a [`register`](Self::register): restores the previous current indicator
    /// and recomputes the thread's cancelled state from that indicator's chain.
    pub fn unregister(&self, registration: Registration) {
        let Registration {
            thread,
            indicator,
            previous,
            links,
        } = registration;

        let mut guard = self.lock();
        let state = &mut *guard;

        // Order doesn't matter: these are set and counter updates.
        for (link, added) in &links {
            if *added {
                if let Some(threads) = state.threads_under_indicator.get_mut(link) {
                    threads.remove(&thread);
                    if threads.is_empty() {
                        state.threads_under_indicator.remove(link);
                    }
                }
            }
            if !link.is_standard() {
                if let Some(count) = state.non_standard.get_mut(link) {
                    *count -= 1;
                    if *count == 0 {
                        state.non_standard.remove(link);
                    }
                }
            }
        }
        if state.non_standard.is_empty() && state.poller.stop() {
            self.stats.poller_stops.fetch_add(1, Ordering::Relaxed);
        }

        self.set_current(thread, previous.as_ref());
        // The previous indicator may have been cancelled while we were nested.
        let still_canceled = previous.as_ref().is_some_and(|previous| {
            previous
                .chain_with_limit(self.config.max_wrap_depth)
                .any(Indicator::is_canceled)
        });
        self.update_thread_under_canceled(thread, still_canceled);
        self.stats.unregistrations.fetch_add(1, Ordering::Relaxed);
        trace!(?thread, indicator = %indicator.id(), "unregistered");
    }

    /// Marks every thread whose current chain still contains `indicator` as running under
    /// a cancelled indicator. Returns how many threads were newly marked.
    ///
    /// Call this after the indicator's cancelled flag has been set.
    pub fn mark_cancelled(&self, indicator: &Indicator) -> usize {
        self.stats.mark_cancelled_calls.fetch_add(1, Ordering::Relaxed);
        let guard = self.lock();
        let Some(threads) = guard.threads_under_indicator.get(indicator) else {
            return 0;
        };

        let mut marked = 0;
        for thread in threads {
            // The thread may have left the indicator already and only be registered
            // under it through an outer, unrelated chain.
            let still_under = self.current.get(thread).is_some_and(|current| {
                current
                    .chain_with_limit(self.config.max_wrap_depth)
                    .any(|link| link == indicator)
            });
            if still_under && self.canceled_threads.insert(*thread) {
                marked += 1;
            }
        }
        if marked > 0 {
            self.recompute_mode();
            debug!(indicator = %indicator.id(), threads = marked, "marked threads as canceled");
        }
        marked
    }

    /// Recomputes the check mode.
    ///
    /// Hook sets that support [`CancellationHooks::subscribe`] trigger this on their own;
    /// others need an explicit call after they change.
    pub fn refresh_check_mode(&self) {
        let _guard = self.lock();
        self.recompute_mode();
    }

    /// Detaches `thread` from its current and top-level indicator without unregistering it.
    ///
    /// The thread stops counting as running under a cancelled indicator until
    /// [`reattach`](Self::reattach) is called with the returned value.
    pub(crate) fn detach(&self, thread: ThreadId) -> Detached {
        let _guard = self.lock();
        let detached = Detached {
            current: self.current.remove(&thread).map(|(_, indicator)| indicator),
            top_level: self.top_level.remove(&thread).map(|(_, indicator)| indicator),
        };
        self.update_thread_under_canceled(thread, false);
        detached
    }

    pub(crate) fn reattach(&self, thread: ThreadId, detached: Detached) {
        let _guard = self.lock();
        let canceled = detached.current.as_ref().is_some_and(|current| {
            current
                .chain_with_limit(self.config.max_wrap_depth)
                .any(Indicator::is_canceled)
        });
        if let Some(current) = detached.current {
            self.current.insert(thread, current);
        }
        if let Some(top_level) = detached.top_level {
            self.top_level.insert(thread, top_level);
        }
        self.update_thread_under_canceled(thread, canceled);
    }

    // Must be called with `state` locked.
    fn set_current(&self, thread: ThreadId, indicator: Option<&Indicator>) {
        match indicator {
            Some(indicator) => {
                self.current.insert(thread, indicator.clone());
                self.top_level
                    .entry(thread)
                    .or_insert_with(|| indicator.clone());
            }
            None => {
                self.current.remove(&thread);
                self.top_level.remove(&thread);
            }
        }
    }

    // Must be called with `state` locked.
    fn update_thread_under_canceled(&self, thread: ThreadId, canceled: bool) {
        let changed = if canceled {
            self.canceled_threads.insert(thread)
        } else {
            self.canceled_threads.remove(&thread).is_some()
        };
        if changed {
            self.recompute_mode();
        }
    }

    // Must be called with `state` locked.
    fn recompute_mode(&self) {
        let mode = CheckMode::derive(self.hooks.has_hooks(), !self.canceled_threads.is_empty());
        self.mode.store(mode);
    }

    // ========================================================================
    // Lock-free queries
    // ========================================================================

    /// The current check mode. Never blocks.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> CheckMode {
        self.mode.load()
    }

    /// Whether `thread` runs under a cancelled indicator. Does not take the registry lock.
    #[must_use]
    pub fn is_thread_under_canceled(&self, thread: ThreadId) -> bool {
        self.canceled_threads.contains(&thread)
    }

    /// The innermost indicator `thread` runs under.
    #[must_use]
    pub fn current(&self, thread: ThreadId) -> Option<Indicator> {
        self.current.get(&thread).map(|entry| entry.value().clone())
    }

    /// The outermost indicator `thread` runs under.
    #[must_use]
    pub fn top_level(&self, thread: ThreadId) -> Option<Indicator> {
        self.top_level.get(&thread).map(|entry| entry.value().clone())
    }

    /// The first cancelled indicator in `thread`'s current chain.
    #[must_use]
    pub fn canceled_indicator(&self, thread: ThreadId) -> Option<IndicatorId> {
        let current = self.current.get(&thread)?;
        current
            .chain_with_limit(self.config.max_wrap_depth)
            .find(|link| link.is_canceled())
            .map(Indicator::id)
    }

    /// Number of threads running under a cancelled indicator.
    #[must_use]
    pub fn canceled_thread_count(&self) -> usize {
        self.canceled_threads.len()
    }

    /// The hooks consulted by cancellation checks.
    #[must_use]
    pub fn hooks(&self) -> &dyn CancellationHooks {
        &*self.hooks
    }

    /// A copy of the instrumentation counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registrations: self.stats.registrations.load(Ordering::Relaxed),
            unregistrations: self.stats.unregistrations.load(Ordering::Relaxed),
            lock_acquisitions: self.stats.lock_acquisitions.load(Ordering::Relaxed),
            mark_cancelled_calls: self.stats.mark_cancelled_calls.load(Ordering::Relaxed),
            poller_starts: self.stats.poller_starts.load(Ordering::Relaxed),
            poller_stops: self.stats.poller_stops.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Locked queries
    // ========================================================================

    /// Every indicator some thread currently runs under.
    #[must_use]
    pub fn active_indicators(&self) -> Vec<Indicator> {
        self.lock().threads_under_indicator.keys().cloned().collect()
    }

    /// Threads currently registered under `indicator`.
    #[must_use]
    pub fn threads_under(&self, indicator: &Indicator) -> Vec<ThreadId> {
        self.lock()
            .threads_under_indicator
            .get(indicator)
            .map(|threads| threads.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `thread` is registered under `indicator`.
    #[must_use]
    pub fn is_under(&self, indicator: &Indicator, thread: ThreadId) -> bool {
        self.lock()
            .threads_under_indicator
            .get(indicator)
            .is_some_and(|threads| threads.contains(&thread))
    }

    /// Whether any active indicator is modal.
    #[must_use]
    pub fn has_modal_indicator(&self) -> bool {
        self.lock()
            .threads_under_indicator
            .keys()
            .any(Indicator::is_modal)
    }

    /// The non-standard indicators in use.
    #[must_use]
    pub fn non_standard_indicators(&self) -> Vec<Indicator> {
        self.lock().non_standard.keys().cloned().collect()
    }

    /// Whether the non-standard poller is running.
    #[must_use]
    pub fn is_poller_running(&self) -> bool {
        self.lock().poller.is_running()
    }

    /// Checks the cancelled-thread invariant for `threads` and the structural invariants
    /// of the maps. Returns a description of the first violation.
    #[cfg(test)]
    pub(crate) fn verify(&self, threads: &[ThreadId]) -> Result<(), String> {
        let state = self.lock();
        if let Some((indicator, _)) = state
            .threads_under_indicator
            .iter()
            .find(|(_, threads)| threads.is_empty())
        {
            return Err(format!("empty thread set kept for {}", indicator.id()));
        }
        if state.poller.is_running() == state.non_standard.is_empty() {
            return Err(format!(
                "poller running: {}, non-standard indicators: {}",
                state.poller.is_running(),
                state.non_standard.len()
            ));
        }
        for &thread in threads {
            let expected = self.current.get(&thread).is_some_and(|current| {
                current
                    .chain_with_limit(self.config.max_wrap_depth)
                    .any(Indicator::is_canceled)
            });
            if self.canceled_threads.contains(&thread) != expected {
                return Err(format!("{thread:?} expected canceled = {expected}"));
            }
        }
        let expected_mode =
            CheckMode::derive(self.hooks.has_hooks(), !self.canceled_threads.is_empty());
        if self.mode() != expected_mode {
            return Err(format!("mode {:?} != {expected_mode:?}", self.mode()));
        }
        Ok(())
    }
}

impl fmt::Debug for ThreadIndicatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadIndicatorRegistry")
            .field("mode", &self.mode())
            .field("canceled_threads", &self.canceled_threads.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Drop for ThreadIndicatorRegistry {
    fn drop(&mut self) {
        self.state.get_mut().poller.stop();
    }
}

/// Indicators taken from a thread by [`ThreadIndicatorRegistry::detach`].
#[derive(Debug, Default)]
pub(crate) struct Detached {
    current: Option<Indicator>,
    top_level: Option<Indicator>,
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        thread::{self, ThreadId},
    };

    use proptest::{collection::vec, prelude::*};

    use super::{Registration, ThreadIndicatorRegistry};
    use crate::{
        CheckMode, Indicator, IndicatorBuilder, ManagerConfig, ManualScheduler, NoHooks,
    };

    fn registry() -> (Arc<ThreadIndicatorRegistry>, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let registry = ThreadIndicatorRegistry::new(
            ManagerConfig::default(),
            scheduler.clone(),
            Arc::new(NoHooks),
        );
        (registry, scheduler)
    }

    fn thread_ids(count: usize) -> Vec<ThreadId> {
        (0..count)
            .map(|_| thread::spawn(|| thread::current().id()).join().unwrap())
            .collect()
    }

    fn non_standard(name: &str) -> IndicatorBuilder {
        IndicatorBuilder::new(name)
            .with_cancel_source(|| -> Result<(), crate::Cancelled> { Ok(()) })
    }

    /// Wrap Chain Registration
    /// A thread under a wrapper is registered under every original too.
    #[test]
    fn test_register_walks_chain() {
        let (registry, _) = registry();
        let thread = thread::current().id();
        let root = Indicator::new("root");
        let wrapper = IndicatorBuilder::new("wrapper").wrapping(root.clone()).build();

        let registration = registry.register(&wrapper, thread);
        assert_eq!(registry.current(thread), Some(wrapper.clone()));
        assert_eq!(registry.top_level(thread), Some(wrapper.clone()));
        assert!(registry.is_under(&root, thread));
        assert!(registry.is_under(&wrapper, thread));
        assert_eq!(registry.active_indicators().len(), 2);

        registry.unregister(registration);
        assert!(registry.active_indicators().is_empty());
        assert_eq!(registry.current(thread), None);
        assert_eq!(registry.top_level(thread), None);
    }

    /// Cancelled Original
    /// Cancelling a wrapped original marks the thread; leaving clears it.
    #[test]
    fn test_mark_cancelled_through_wrapper() {
        let (registry, _) = registry();
        let thread = thread::current().id();
        let root = Indicator::new("root");
        let wrapper = IndicatorBuilder::new("wrapper").wrapping(root.clone()).build();

        let registration = registry.register(&wrapper, thread);
        assert_eq!(registry.mode(), CheckMode::None);

        root.set_canceled_flag();
        assert_eq!(registry.mark_cancelled(&root), 1);
        assert!(registry.is_thread_under_canceled(thread));
        assert_eq!(registry.mode(), CheckMode::IndicatorPlusHooks);
        assert_eq!(registry.canceled_indicator(thread), Some(root.id()));

        // Idempotent.
        assert_eq!(registry.mark_cancelled(&root), 0);

        registry.unregister(registration);
        assert!(!registry.is_thread_under_canceled(thread));
        assert_eq!(registry.mode(), CheckMode::None);
    }

    /// Stale Registration
    /// A thread registered under an outer indicator but currently inside an unrelated one
    /// is not marked; it is marked once it returns to the outer indicator.
    #[test]
    fn test_mark_cancelled_skips_threads_that_moved_on() {
        let (registry, _) = registry();
        let thread = thread::current().id();
        let outer = Indicator::new("outer");
        let inner = Indicator::new("inner");

        let outer_reg = registry.register(&outer, thread);
        let inner_reg = registry.register(&inner, thread);

        outer.set_canceled_flag();
        assert_eq!(registry.mark_cancelled(&outer), 0);
        assert!(!registry.is_thread_under_canceled(thread));

        registry.unregister(inner_reg);
        assert!(registry.is_thread_under_canceled(thread));
        assert_eq!(registry.top_level(thread), Some(outer.clone()));

        registry.unregister(outer_reg);
        assert!(!registry.is_thread_under_canceled(thread));
    }

    /// Already Cancelled
    /// Registering under an indicator that is already cancelled marks the thread at once.
    #[test]
    fn test_register_under_canceled() {
        let (registry, _) = registry();
        let thread = thread::current().id();
        let ind = Indicator::new("late");
        ind.set_canceled_flag();

        let registration = registry.register(&ind, thread);
        assert!(registry.is_thread_under_canceled(thread));
        registry.unregister(registration);
        assert!(!registry.is_thread_under_canceled(thread));
    }

    /// Poller Lifecycle
    /// The poller survives until the last nested non-standard registration is gone.
    #[test]
    fn test_poller_reference_counting() {
        let (registry, scheduler) = registry();
        let threads = thread_ids(2);
        let shared = non_standard("shared").build();
        let other = non_standard("other").build();

        let mut registrations = vec![
            registry.register(&shared, threads[0]),
            registry.register(&shared, threads[1]),
            registry.register(&other, threads[0]),
        ];
        assert!(registry.is_poller_running());
        assert_eq!(scheduler.repeating_count(), 1);
        assert_eq!(registry.stats().poller_starts, 1);

        while let Some(registration) = registrations.pop() {
            let last = registrations.is_empty();
            registry.unregister(registration);
            assert_eq!(registry.is_poller_running(), !last);
        }
        assert_eq!(scheduler.repeating_count(), 0);
        assert_eq!(registry.stats().poller_stops, 1);
    }

    /// Double Entry
    /// Registering twice under the same indicator is tolerated and fully reversible.
    #[test]
    fn test_double_registration_is_permissive() {
        let (registry, _) = registry();
        let thread = thread::current().id();
        let ind = non_standard("twice").build();

        let first = registry.register(&ind, thread);
        let second = registry.register(&ind, thread);
        registry.unregister(second);
        assert!(registry.is_under(&ind, thread));
        assert!(registry.is_poller_running());

        registry.unregister(first);
        assert!(!registry.is_under(&ind, thread));
        assert!(!registry.is_poller_running());
    }

    /// Detach & Reattach
    /// A detached thread has no indicator and no cancellation until reattached.
    #[test]
    fn test_detach_reattach() {
        let (registry, _) = registry();
        let thread = thread::current().id();
        let ind = Indicator::new("quiet");
        ind.set_canceled_flag();
        let registration = registry.register(&ind, thread);

        let detached = registry.detach(thread);
        assert_eq!(registry.current(thread), None);
        assert!(!registry.is_thread_under_canceled(thread));
        registry.verify(&[thread]).unwrap();

        registry.reattach(thread, detached);
        assert_eq!(registry.current(thread), Some(ind.clone()));
        assert!(registry.is_thread_under_canceled(thread));

        registry.unregister(registration);
        registry.verify(&[thread]).unwrap();
    }

    #[derive(Clone, Debug)]
    enum Op {
        Enter { thread: usize, indicator: usize },
        Exit { thread: usize },
        Cancel { indicator: usize },
    }

    const THREADS: usize = 3;
    const INDICATORS: usize = 5;

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0..THREADS, 0..INDICATORS)
                .prop_map(|(thread, indicator)| Op::Enter { thread, indicator }),
            2 => (0..THREADS).prop_map(|thread| Op::Exit { thread }),
            1 => (0..INDICATORS).prop_map(|indicator| Op::Cancel { indicator }),
        ]
    }

    fn fixture() -> Vec<Indicator> {
        let base = Indicator::new("base");
        let wraps_base = IndicatorBuilder::new("wraps-base").wrapping(base.clone()).build();
        let polled = non_standard("polled").build();
        let polled_wrapper = non_standard("polled-wrapper")
            .wrapping(wraps_base.clone())
            .build();
        let loose = Indicator::new("loose");
        vec![base, wraps_base, polled, polled_wrapper, loose]
    }

    proptest! {
        /// Cancelled-Thread Invariant
        /// Random interleavings of enter/exit/cancel across threads keep every invariant,
        /// and unwinding everything leaves the registry empty.
        #[test]
        fn prop_invariant_holds(ops in vec(op(), 0..64)) {
            let (registry, _) = registry();
            let threads = thread_ids(THREADS);
            let indicators = fixture();
            let mut stacks: Vec<Vec<Registration>> = (0..THREADS).map(|_| Vec::new()).collect();

            for op in ops {
                match op {
                    Op::Enter { thread, indicator } => {
                        let registration =
                            registry.register(&indicators[indicator], threads[thread]);
                        stacks[thread].push(registration);
                    }
                    Op::Exit { thread } => {
                        if let Some(registration) = stacks[thread].pop() {
                            registry.unregister(registration);
                        }
                    }
                    Op::Cancel { indicator } => {
                        indicators[indicator].set_canceled_flag();
                        registry.mark_cancelled(&indicators[indicator]);
                    }
                }
                prop_assert_eq!(registry.verify(&threads), Ok(()));
            }

            for stack in &mut stacks {
                while let Some(registration) = stack.pop() {
                    registry.unregister(registration);
                    prop_assert_eq!(registry.verify(&threads), Ok(()));
                }
            }
            let stats = registry.stats();
            prop_assert_eq!(stats.registrations, stats.unregistrations);
            prop_assert!(registry.active_indicators().is_empty());
            prop_assert!(registry.non_standard_indicators().is_empty());
            prop_assert_eq!(registry.canceled_thread_count(), 0);
        }
    }
}
