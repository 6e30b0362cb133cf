//! Tunables for the [`ProgressManager`](crate::ProgressManager).
//!
//! Every value has a default matching long-standing behavior; override individual
//! settings with the `with_*` methods.

use std::{thread, time::Duration};

use crate::indicator::DEFAULT_MAX_WRAP_DEPTH;

/// Timing and threshold settings shared by the registry, poller and priority coordinator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ManagerConfig {
    /// Period of the background poll of non-standard indicators.
    pub check_canceled_delay: Duration,
    /// Delay before re-checking whether blocked prioritized threads have resumed.
    pub unblock_retry_delay: Duration,
    /// Prioritized activity shorter than this never makes other threads yield.
    pub min_prioritization: Duration,
    /// Prioritization older than this is assumed leaked and is cleared.
    pub max_prioritization: Duration,
    /// How long a thread parks when it yields to prioritized threads.
    pub yield_park: Duration,
    /// Suppression counts at or above this disable deprioritization entirely.
    pub deprioritization_disable_threshold: i64,
    /// Suppression nesting reaching this depth is reported as a likely leak.
    pub suspicious_suppress_nesting: i64,
    /// Wrap chains deeper than this are truncated and reported.
    pub max_wrap_depth: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let parallelism = thread::available_parallelism().map_or(1, usize::from);
        Self {
            check_canceled_delay: Duration::from_millis(10),
            unblock_retry_delay: Duration::from_millis(5),
            min_prioritization: Duration::from_millis(5),
            max_prioritization: Duration::from_secs(12),
            yield_park: Duration::from_millis(1),
            deprioritization_disable_threshold: 1_000_000,
            suspicious_suppress_nesting: 100 + 2 * i64::try_from(parallelism).unwrap_or(1),
            max_wrap_depth: DEFAULT_MAX_WRAP_DEPTH,
        }
    }
}

impl ManagerConfig {
    /// Sets the poll period for non-standard indicators.
    #[must_use]
    pub const fn with_check_canceled_delay(mut self, delay: Duration) -> Self {
        self.check_canceled_delay = delay;
        self
    }

    /// Sets the retry delay of the deadlock-avoidance check.
    #[must_use]
    pub const fn with_unblock_retry_delay(mut self, delay: Duration) -> Self {
        self.unblock_retry_delay = delay;
        self
    }

    /// Sets the minimum and maximum prioritization windows.
    #[must_use]
    pub const fn with_prioritization_window(mut self, min: Duration, max: Duration) -> Self {
        self.min_prioritization = min;
        self.max_prioritization = max;
        self
    }

    /// Sets how long a yielding thread parks.
    #[must_use]
    pub const fn with_yield_park(mut self, park: Duration) -> Self {
        self.yield_park = park;
        self
    }

    /// Sets the maximum wrap chain depth.
    #[must_use]
    pub const fn with_max_wrap_depth(mut self, depth: usize) -> Self {
        self.max_wrap_depth = depth;
        self
    }
}
