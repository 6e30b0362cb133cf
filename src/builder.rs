//! Fluent interface for constructing [`Indicator`] instances.
//!
//! [`Indicator::new`] covers the common case of a standard, standalone indicator.
//! The [`IndicatorBuilder`] handles the rest:
//!
//! * **Wrapping:** an indicator may delegate to an *original* one. Threads running under
//!   the wrapper are registered under the original too, so cancelling the original
//!   reaches them.
//! * **External cancellation:** attaching a [`CancelSource`] makes the indicator
//!   non-standard; the manager then polls it in the background.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64},
};

use compact_str::CompactString;
use parking_lot::RwLock;

use crate::indicator::{CancelSource, Cold, Indicator, IndicatorId, Inner};

/// A builder for [`Indicator`] instances.
#[derive(Default)]
pub struct IndicatorBuilder {
    name: CompactString,
    total: u64,
    modal: bool,
    original: Option<Indicator>,
    source: Option<Arc<dyn CancelSource>>,
}

impl IndicatorBuilder {
    /// Starts building an indicator for the named activity.
    #[must_use]
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the expected total (zero means indeterminate).
    #[must_use]
    pub const fn total(mut self, total: u64) -> Self {
        self.total = total;
        self
    }

    /// Marks the activity as modal.
    #[must_use]
    pub const fn modal(mut self, modal: bool) -> Self {
        self.modal = modal;
        self
    }

    /// Makes the new indicator wrap `original`.
    #[must_use]
    pub fn wrapping(mut self, original: Indicator) -> Self {
        self.original = Some(original);
        self
    }

    /// Attaches external cancellation state, making the indicator non-standard.
    #[must_use]
    pub fn with_cancel_source(mut self, source: impl CancelSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Shares an already type-erased cancel source between several indicators.
    #[must_use]
    pub fn with_shared_cancel_source(mut self, source: Arc<dyn CancelSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Consumes the builder and returns the indicator.
    #[must_use]
    pub fn build(self) -> Indicator {
        Indicator {
            inner: Arc::new(Inner {
                id: IndicatorId::next(),
                modal: self.modal,
                original: self.original,
                source: self.source,
                canceled: AtomicBool::new(false),
                running: AtomicBool::new(false),
                position: AtomicU64::new(0),
                total: AtomicU64::new(self.total),
                cold: RwLock::new(Cold {
                    name: self.name,
                    text: CompactString::default(),
                    started: None,
                    stopped: None,
                }),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::IndicatorBuilder;
    use crate::{CancelSource, Cancelled};

    /// Shared Cancel Source
    /// Two indicators backed by one source flip together once the source trips.
    #[test]
    fn test_shared_source() {
        let tripped = Arc::new(AtomicBool::new(false));
        let flag = tripped.clone();
        let source: Arc<dyn CancelSource> = Arc::new(move || {
            if flag.load(Ordering::Acquire) {
                Err(Cancelled::new())
            } else {
                Ok(())
            }
        });

        let a = IndicatorBuilder::new("a")
            .with_shared_cancel_source(source.clone())
            .build();
        let b = IndicatorBuilder::new("b")
            .with_shared_cancel_source(source)
            .modal(true)
            .build();

        assert!(a.check_canceled().is_ok());
        tripped.store(true, Ordering::Release);
        assert!(a.check_canceled().is_err());
        assert!(b.check_canceled().is_err());
        assert!(b.is_modal());
        assert!(!a.is_modal());
    }
}
