//! Error types produced by the cancellation core.
//!
//! [`Cancelled`] is the only error the core itself raises. It carries the identity
//! of the offending indicator when that can be determined, and is meant to be
//! propagated with `?` until some caller decides what a cancelled run means.

use thiserror::Error;

use crate::indicator::IndicatorId;

/// Shorthand for results of cancellable computations.
pub type Cancellable<T> = Result<T, Cancelled>;

/// Signals that work running under the current indicator (or one it wraps) must unwind.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Error)]
#[error("process canceled")]
pub struct Cancelled {
    indicator: Option<IndicatorId>,
}

impl Cancelled {
    /// A cancellation whose source indicator is unknown (e.g. raised by a hook).
    #[must_use]
    pub const fn new() -> Self {
        Self { indicator: None }
    }

    /// A cancellation attributed to `indicator`.
    #[must_use]
    pub const fn by(indicator: IndicatorId) -> Self {
        Self {
            indicator: Some(indicator),
        }
    }

    /// The indicator that was cancelled, if known.
    #[must_use]
    pub const fn indicator(&self) -> Option<IndicatorId> {
        self.indicator
    }

    /// Attributes this cancellation to `indicator` unless it already names one.
    #[must_use]
    pub const fn or_indicator(self, indicator: IndicatorId) -> Self {
        match self.indicator {
            Some(_) => self,
            None => Self::by(indicator),
        }
    }
}

/// Failures reported by a [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler no longer accepts tasks.
    #[error("scheduler has been shut down")]
    ShutDown,
    /// The worker thread for a task could not be started.
    #[error("failed to spawn scheduler thread")]
    Spawn(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::Cancelled;
    use crate::indicator::IndicatorId;

    /// Attribution
    /// An existing attribution wins over a later one.
    #[test]
    fn test_or_indicator_keeps_first() {
        let first = IndicatorId::from_raw(7);
        let second = IndicatorId::from_raw(9);

        assert_eq!(Cancelled::new().or_indicator(first).indicator(), Some(first));
        assert_eq!(
            Cancelled::by(first).or_indicator(second).indicator(),
            Some(first)
        );
        assert_eq!(Cancelled::new().to_string(), "process canceled");
    }
}
