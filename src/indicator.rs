//! Cancellable progress indicators.
//!
//! An [`Indicator`] is a cheap-to-clone, reference-comparable handle. Two indicators
//! built with identical settings are still distinct: equality and hashing follow the
//! identity assigned at construction, never the contents.
//!
//! Like a progress bar, the handle splits its state:
//!
//! * **Hot Data:** the cancelled and running flags plus position/total live in atomics,
//!   so polling them never blocks.
//! * **Cold Data:** name, text and timing are guarded by an [`RwLock`](parking_lot::RwLock)
//!   and only touched when the indicator is reconfigured or rendered.
//!
//! # Standard and non-standard indicators
//!
//! A *standard* indicator is cancelled only through
//! [`ProgressManager::cancel`](crate::ProgressManager::cancel), which reaches the threads
//! running under it immediately. A *non-standard*
//! indicator carries a [`CancelSource`] consulted by its own
//! [`check_canceled`](Indicator::check_canceled); the manager has to poll it in the
//! background because nothing announces when that external state flips.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use compact_str::CompactString;
use parking_lot::RwLock;
use tracing::error;
use web_time::Instant;

use crate::error::Cancelled;

/// Wrap chains deeper than this are treated as a bug.
pub const DEFAULT_MAX_WRAP_DEPTH: usize = 64;

static NEXT_INDICATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an [`Indicator`], unique for the lifetime of the process.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndicatorId(u64);

impl IndicatorId {
    pub(crate) fn next() -> Self {
        Self(NEXT_INDICATOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Builds an id from its raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IndicatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// External cancellation state consulted by a non-standard indicator.
///
/// Implementations may be slow (they are polled from a background thread) but must not
/// call back into the [`ProgressManager`](crate::ProgressManager) that polls them.
pub trait CancelSource: Send + Sync {
    /// Returns `Err` once the external state says the work must stop.
    fn check_canceled(&self) -> Result<(), Cancelled>;
}

impl<F> CancelSource for F
where
    F: Fn() -> Result<(), Cancelled> + Send + Sync,
{
    fn check_canceled(&self) -> Result<(), Cancelled> {
        self()
    }
}

/// A thread-safe, cloneable handle to a cancellable progress indicator.
#[derive(Clone)]
pub struct Indicator {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) id: IndicatorId,
    pub(crate) modal: bool,
    /// The indicator this one delegates to; fixed at construction, so chains are acyclic.
    pub(crate) original: Option<Indicator>,
    pub(crate) source: Option<Arc<dyn CancelSource>>,

    pub(crate) canceled: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) position: AtomicU64,
    pub(crate) total: AtomicU64,

    pub(crate) cold: RwLock<Cold>,
}

pub(crate) struct Cold {
    pub(crate) name: CompactString,
    pub(crate) text: CompactString,
    pub(crate) started: Option<Instant>,
    pub(crate) stopped: Option<Instant>,
}

impl Indicator {
    /// Creates a standard, non-modal indicator that wraps nothing.
    ///
    /// Use [`IndicatorBuilder`](crate::IndicatorBuilder) for anything more specific.
    #[must_use]
    pub fn new(name: impl Into<CompactString>) -> Self {
        crate::IndicatorBuilder::new(name).build()
    }

    /// Returns the identity of this indicator.
    #[must_use]
    pub fn id(&self) -> IndicatorId {
        self.inner.id
    }

    // ========================================================================
    // Classification
    // ========================================================================

    /// Whether cancellation is only ever signalled by setting the cancelled flag.
    #[must_use]
    pub fn is_standard(&self) -> bool {
        self.inner.source.is_none()
    }

    /// Whether this indicator represents a modal activity.
    #[must_use]
    pub fn is_modal(&self) -> bool {
        self.inner.modal
    }

    /// The indicator this one wraps, if any.
    #[must_use]
    pub fn original(&self) -> Option<&Self> {
        self.inner.original.as_ref()
    }

    /// Iterates this indicator followed by every original it (transitively) wraps.
    #[must_use]
    pub fn chain(&self) -> WrapChain<'_> {
        self.chain_with_limit(DEFAULT_MAX_WRAP_DEPTH)
    }

    pub(crate) fn chain_with_limit(&self, limit: usize) -> WrapChain<'_> {
        WrapChain {
            head: self.id(),
            next: Some(self),
            remaining: limit,
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Whether this indicator itself has been cancelled.
    ///
    /// Originals are not consulted; the manager tracks chains on its own.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Sets the cancelled flag and nothing else. Returns `true` if this call flipped it.
    ///
    /// Threads running under the indicator do not notice until
    /// [`ProgressManager::mark_cancelled`](crate::ProgressManager::mark_cancelled) is
    /// called. To cancel work, use [`ProgressManager::cancel`](crate::ProgressManager::cancel),
    /// which does both.
    pub fn set_canceled_flag(&self) -> bool {
        !self.inner.canceled.swap(true, Ordering::AcqRel)
    }

    /// Checks the indicator's own cancellation state.
    ///
    /// For non-standard indicators the [`CancelSource`] is consulted as well; once it
    /// reports cancellation the indicator stays cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] attributed to this indicator when it has been cancelled.
    pub fn check_canceled(&self) -> Result<(), Cancelled> {
        if self.is_canceled() {
            return Err(Cancelled::by(self.id()));
        }
        if let Some(source) = &self.inner.source {
            if let Err(cancelled) = source.check_canceled() {
                self.set_canceled_flag();
                return Err(cancelled.or_indicator(self.id()));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Whether [`start`](Self::start) has been called without a matching [`stop`](Self::stop).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Marks the indicator as running and records the start time.
    pub fn start(&self) {
        let mut cold = self.inner.cold.write();
        cold.started = Some(Instant::now());
        cold.stopped = None;
        drop(cold);
        self.inner.running.store(true, Ordering::Release);
    }

    /// Marks the indicator as stopped and records the stop time.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        let mut cold = self.inner.cold.write();
        if cold.started.is_some() {
            cold.stopped = Some(Instant::now());
        }
    }

    /// Time spent running; `None` if never started.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let cold = self.inner.cold.read();
        let start = cold.started?;
        Some(
            cold.stopped
                .map_or_else(|| start.elapsed(), |stopped| stopped.duration_since(start)),
        )
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    /// Gets the name of the activity.
    #[must_use]
    pub fn name(&self) -> CompactString {
        self.inner.cold.read().name.clone()
    }

    /// Updates the name of the activity.
    pub fn set_name(&self, name: impl Into<CompactString>) {
        self.inner.cold.write().name = name.into();
    }

    /// Gets the status text.
    #[must_use]
    pub fn text(&self) -> CompactString {
        self.inner.cold.read().text.clone()
    }

    /// Updates the status text.
    pub fn set_text(&self, text: impl Into<CompactString>) {
        self.inner.cold.write().text = text.into();
    }

    /// Advances the position.
    pub fn inc(&self, amount: u64) {
        self.inner.position.fetch_add(amount, Ordering::Relaxed);
    }

    /// Gets the current position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.inner.position.load(Ordering::Relaxed)
    }

    /// Sets the absolute position.
    pub fn set_position(&self, position: u64) {
        self.inner.position.store(position, Ordering::Relaxed);
    }

    /// Gets the expected total; zero means indeterminate.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Updates the expected total.
    pub fn set_total(&self, total: u64) {
        self.inner.total.store(total, Ordering::Relaxed);
    }

    /// Creates an owned, lock-free copy of the indicator state.
    #[must_use]
    pub fn snapshot(&self) -> IndicatorSnapshot {
        self.into()
    }
}

impl PartialEq for Indicator {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Indicator {}

impl Hash for Indicator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Indicator")
            .field("id", &self.inner.id)
            .field("standard", &self.is_standard())
            .field("canceled", &self.is_canceled())
            .field("original", &self.original().map(Self::id))
            .finish_non_exhaustive()
    }
}

/// Iterator over an indicator and the originals it wraps, innermost first.
///
/// Stops (and logs) when the configured depth is exceeded.
pub struct WrapChain<'a> {
    head: IndicatorId,
    next: Option<&'a Indicator>,
    remaining: usize,
}

impl<'a> Iterator for WrapChain<'a> {
    type Item = &'a Indicator;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        if self.remaining == 0 {
            error!(
                indicator = %self.head,
                "wrap chain is deeper than allowed; ignoring the remaining originals"
            );
            return None;
        }
        self.remaining -= 1;
        self.next = current.original();
        Some(current)
    }
}

/// A plain-data snapshot of an [`Indicator`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndicatorSnapshot {
    id: IndicatorId,
    name: CompactString,
    text: CompactString,
    position: u64,
    total: u64,
    canceled: bool,
    running: bool,
    modal: bool,
    standard: bool,
    elapsed: Option<Duration>,
}

impl From<&Indicator> for IndicatorSnapshot {
    fn from(indicator: &Indicator) -> Self {
        let cold = indicator.inner.cold.read();
        let name = cold.name.clone();
        let text = cold.text.clone();
        drop(cold);

        Self {
            id: indicator.id(),
            name,
            text,
            position: indicator.position(),
            total: indicator.total(),
            canceled: indicator.is_canceled(),
            running: indicator.is_running(),
            modal: indicator.is_modal(),
            standard: indicator.is_standard(),
            elapsed: indicator.elapsed(),
        }
    }
}

impl IndicatorSnapshot {
    /// Identity of the indicator.
    #[must_use]
    pub const fn id(&self) -> IndicatorId {
        self.id
    }

    /// Name of the activity.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Status text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Position at the time of the snapshot.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Expected total at the time of the snapshot.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Whether the indicator was cancelled.
    #[must_use]
    pub const fn canceled(&self) -> bool {
        self.canceled
    }

    /// Whether the indicator was running.
    #[must_use]
    pub const fn running(&self) -> bool {
        self.running
    }

    /// Whether the indicator is modal.
    #[must_use]
    pub const fn modal(&self) -> bool {
        self.modal
    }

    /// Whether the indicator is standard.
    #[must_use]
    pub const fn standard(&self) -> bool {
        self.standard
    }

    /// Running time, if the indicator was ever started.
    #[must_use]
    pub const fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    /// Completed fraction in `0.0..=1.0`; `None` when the total is indeterminate.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.position as f64 / self.total as f64).min(1.0))
    }
}
