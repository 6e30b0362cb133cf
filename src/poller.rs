//! Background polling of non-standard indicators.
//!
//! A non-standard indicator learns about cancellation from external state, so nobody
//! calls [`ProgressManager::mark_cancelled`](crate::ProgressManager::mark_cancelled) for
//! it. While at least one such indicator is in use, a repeating task asks each of them
//! whether it is cancelled and propagates the answer to the threads running under it.
//!
//! The poller is owned by the registry and only started or stopped with the registry
//! lock held, so two pollers can never run at once.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Weak,
    time::Duration,
};

use tracing::{debug, error, warn};

use crate::{
    registry::ThreadIndicatorRegistry,
    scheduler::{CancelHandle, Scheduler},
};

#[derive(Debug, Default)]
pub(crate) struct CancellationPoller {
    handle: Option<CancelHandle>,
}

impl CancellationPoller {
    pub(crate) fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Returns `true` if this call started the poller.
    pub(crate) fn start(
        &mut self,
        scheduler: &dyn Scheduler,
        period: Duration,
        registry: Weak<ThreadIndicatorRegistry>,
    ) -> bool {
        if self.handle.is_some() {
            return false;
        }
        let task = Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                poll_once(&registry);
            }
        });
        match scheduler.schedule_repeating(period, task) {
            Ok(handle) => {
                debug!(?period, "started polling non-standard indicators");
                self.handle = Some(handle);
                true
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "cannot poll non-standard indicators; their cancellation will go unnoticed"
                );
                false
            }
        }
    }

    /// Returns `true` if this call stopped a running poller.
    pub(crate) fn stop(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.cancel();
                debug!("stopped polling non-standard indicators");
                true
            }
            None => false,
        }
    }
}

/// One poller tick. Returns how many indicators reported cancellation.
///
/// Runs without the registry lock: the indicator list is copied first, and each
/// indicator's check is isolated so a panicking one cannot starve the others.
pub(crate) fn poll_once(registry: &ThreadIndicatorRegistry) -> usize {
    let mut canceled = 0;
    for indicator in registry.non_standard_indicators() {
        match panic::catch_unwind(AssertUnwindSafe(|| indicator.check_canceled())) {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                registry.mark_cancelled(&indicator);
                canceled += 1;
            }
            Err(payload) => {
                error!(
                    indicator = %indicator.id(),
                    panic = panic_message(payload.as_ref()),
                    "cancellation check of a non-standard indicator panicked"
                );
            }
        }
    }
    canceled
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
