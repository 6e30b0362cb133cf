//! # `progress_manager`
//!
//! Cooperative cancellation and soft prioritization for multi-threaded work.
//!
//! Long-running computations run *under* a progress [`Indicator`] and periodically ask
//! whether they should stop. `progress_manager` keeps track of which thread runs under
//! which indicator so that cancelling an indicator reaches every thread working for it,
//! including threads running under indicators that wrap it. It is designed to be:
//!
//! * **Cheap to poll**: [`ProgressManager::check_canceled`] is a single atomic load while
//!   nothing is cancelled and no hooks are installed.
//! * **Concurrent**: indicators are cheap to clone ([`Arc`](std::sync::Arc)-based) and
//!   safe to share; the registry is consistent under concurrent entry, exit and
//!   cancellation.
//! * **Pluggable**: external cancellation sources, check hooks, the background scheduler
//!   and thread-state detection are all traits.
//!
//! ## Modules
//!
//! * [`indicator`] / [`builder`]: the [`Indicator`] handle and its fluent construction.
//! * [`registry`]: thread-to-indicator accounting and the cancelled-thread invariant.
//! * [`check`]: the global check mode and cancellation hooks.
//! * [`manager`]: [`ProgressManager`], the execution wrapper and queries.
//! * [`priority`]: [`PriorityCoordinator`], soft prioritization with deadlock avoidance.
//! * [`scheduler`]: background task execution for polling and retries.
//! * [`iter`]: cancellable iterator adapters.
//! * [`config`] / [`error`]: tunables and error types.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod builder;
pub mod check;
pub mod config;
pub mod error;
pub mod indicator;
pub mod iter;
pub mod manager;
mod poller;
pub mod priority;
pub mod registry;
pub mod scheduler;

pub use builder::IndicatorBuilder;
pub use check::{
    CancellationHooks, CheckCanceledHook, CheckMode, HookId, HookRegistry, HooksChanged, NoHooks,
};
pub use config::ManagerConfig;
pub use error::{Cancellable, Cancelled, SchedulerError};
pub use indicator::{CancelSource, Indicator, IndicatorId, IndicatorSnapshot, WrapChain};
pub use iter::{CancellableIter, CheckCanceledExt};
pub use manager::{
    ManagerSnapshot, ProgressManager, ProgressManagerBuilder, is_in_non_cancelable_section,
};
pub use priority::{
    BlockedSection, BlockingMonitor, PriorityCoordinator, Suppression, ThreadRunState,
    ThreadStateProbe,
};
pub use registry::{Registration, RegistryStats, ThreadIndicatorRegistry};
pub use scheduler::{
    CancelHandle, ManualScheduler, OnceTask, RepeatingTask, Scheduler, ThreadScheduler,
};
