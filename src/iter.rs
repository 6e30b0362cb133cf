//! Iterator adapters that check for cancellation between items.
//!
//! The [`CheckCanceledExt`] trait adds helpers to any [`Iterator`] so a long loop can be
//! made cancellable with a single method call. Each item comes out as a
//! [`Cancellable`]; the first failed check yields `Err` and ends the iteration.
//!
//! # Example
//!
//! ```ignore
//! use progress_manager::{CheckCanceledExt, Indicator, ProgressManager};
//!
//! let manager = ProgressManager::new();
//! let indicator = Indicator::new("hashing");
//! manager.run_under(Some(&indicator), || {
//!     for file in files.iter().check_canceled_tracking(&manager, indicator.clone()) {
//!         hash(file?);
//!     }
//! });
//! ```

use std::iter::FusedIterator;

use crate::{error::Cancellable, indicator::Indicator, manager::ProgressManager};

/// An iterator adapter that calls [`ProgressManager::check_canceled`] before every item.
///
/// Optionally advances an indicator's position for every item produced.
pub struct CancellableIter<'m, I> {
    iter: I,
    manager: &'m ProgressManager,
    indicator: Option<Indicator>,
    done: bool,
}

impl<'m, I> CancellableIter<'m, I> {
    /// Creates a new `CancellableIter`.
    ///
    /// Note: This is usually constructed via [`CheckCanceledExt`] methods.
    pub const fn new(iter: I, manager: &'m ProgressManager, indicator: Option<Indicator>) -> Self {
        Self {
            iter,
            manager,
            indicator,
            done: false,
        }
    }

    /// The indicator advanced by this iterator, if any.
    #[must_use]
    pub const fn indicator(&self) -> Option<&Indicator> {
        self.indicator.as_ref()
    }
}

impl<I: Iterator> Iterator for CancellableIter<'_, I> {
    type Item = Cancellable<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(cancelled) = self.manager.check_canceled() {
            self.done = true;
            return Some(Err(cancelled));
        }

        let item = self.iter.next();
        match item {
            Some(item) => {
                if let Some(indicator) = &self.indicator {
                    indicator.inc(1);
                }
                Some(Ok(item))
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        // Any item may turn into the final `Err`.
        let (_, upper) = self.iter.size_hint();
        (0, upper.and_then(|upper| upper.checked_add(1)))
    }
}

impl<I: Iterator> FusedIterator for CancellableIter<'_, I> {}

/// Extension trait to make any Iterator cancellable.
pub trait CheckCanceledExt: Iterator + Sized {
    /// Checks for cancellation through `manager` before every item.
    fn check_canceled_with(self, manager: &ProgressManager) -> CancellableIter<'_, Self>;

    /// Like [`check_canceled_with`](Self::check_canceled_with), and advances `indicator`
    /// by one per item.
    ///
    /// When the iterator knows its exact length and the indicator has no total yet, that
    /// length becomes the total.
    fn check_canceled_tracking(
        self,
        manager: &ProgressManager,
        indicator: Indicator,
    ) -> CancellableIter<'_, Self>;
}

impl<I: Iterator> CheckCanceledExt for I {
    fn check_canceled_with(self, manager: &ProgressManager) -> CancellableIter<'_, Self> {
        CancellableIter::new(self, manager, None)
    }

    fn check_canceled_tracking(
        self,
        manager: &ProgressManager,
        indicator: Indicator,
    ) -> CancellableIter<'_, Self> {
        if indicator.total() == 0 {
            if let (lower, Some(upper)) = self.size_hint() {
                if lower == upper {
                    indicator.set_total(upper as u64);
                }
            }
        }
        CancellableIter::new(self, manager, Some(indicator))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::CheckCanceledExt as _;
    use crate::{Cancelled, Indicator, ManualScheduler, ProgressManager};

    fn manager() -> ProgressManager {
        ProgressManager::builder()
            .scheduler(Arc::new(ManualScheduler::new()))
            .build()
    }

    /// Iterator Integration
    /// Items pass through and the indicator tracks position and inferred total.
    #[test]
    fn test_tracking_adapter() {
        let manager = manager();
        let ind = Indicator::new("iter_test");
        let data = [1, 2, 3, 4, 5];

        let collected: Result<Vec<_>, Cancelled> = manager.run_under(Some(&ind), || {
            data.iter()
                .check_canceled_tracking(&manager, ind.clone())
                .collect()
        });

        assert_eq!(collected.unwrap().len(), 5);
        assert_eq!(ind.position(), 5);
        assert_eq!(ind.total(), 5, "Total should be inferred from array len");
    }

    /// Cancellation Mid-Iteration
    /// Cancelling stops the iteration with a single `Err`, then the adapter is fused.
    #[test]
    fn test_cancel_stops_iteration() {
        let manager = manager();
        let ind = Indicator::new("loop");

        manager.run_under(Some(&ind), || {
            let mut iter = (0..10).check_canceled_with(&manager);
            assert_eq!(iter.next(), Some(Ok(0)));
            assert_eq!(iter.next(), Some(Ok(1)));

            manager.cancel(&ind);
            assert_eq!(iter.next(), Some(Err(Cancelled::by(ind.id()))));
            assert_eq!(iter.next(), None);
            assert_eq!(iter.size_hint(), (0, Some(0)));
        });
    }
}
