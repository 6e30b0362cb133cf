//! The global check-mode flag and pluggable cancellation hooks.
//!
//! Every call to [`ProgressManager::check_canceled`](crate::ProgressManager::check_canceled)
//! starts with a single atomic load of the [`CheckMode`]. While nothing is cancelled and
//! no hooks are installed the answer is [`CheckMode::None`] and the call returns at once.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;

use crate::{error::Cancelled, indicator::Indicator};

/// What a cancellation check has to do beyond reading the flag.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CheckMode {
    /// Nothing is cancelled and no hooks exist.
    #[default]
    None = 0,
    /// At least one hook exists and must run.
    OnlyHooks = 1,
    /// Some thread runs under a cancelled indicator; hooks run as well.
    IndicatorPlusHooks = 2,
}

impl CheckMode {
    /// Derives the mode from hook presence and cancelled-thread presence.
    #[must_use]
    pub const fn derive(has_hooks: bool, has_canceled_threads: bool) -> Self {
        if has_canceled_threads {
            Self::IndicatorPlusHooks
        } else if has_hooks {
            Self::OnlyHooks
        } else {
            Self::None
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::OnlyHooks,
            2 => Self::IndicatorPlusHooks,
            _ => Self::None,
        }
    }
}

/// Lock-free storage for the current [`CheckMode`].
#[derive(Debug, Default)]
pub(crate) struct CheckModeFlag(AtomicU8);

impl CheckModeFlag {
    #[inline]
    pub(crate) fn load(&self) -> CheckMode {
        CheckMode::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, mode: CheckMode) {
        self.0.store(mode as u8, Ordering::Release);
    }
}

/// Callback run after the installed hook set changed.
pub type HooksChanged = Arc<dyn Fn() + Send + Sync>;

/// Cancellation checks owned by the surrounding system.
///
/// Hooks run on every cancellation check once any exist, so they must be cheap, and
/// [`has_hooks`](Self::has_hooks) is called with the registry lock held: it must not
/// call back into the manager.
pub trait CancellationHooks: Send + Sync {
    /// Whether any hook is installed.
    fn has_hooks(&self) -> bool;

    /// Runs every hook for a check made under `current` (or no indicator).
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] when a hook decides the current work must stop.
    fn run_hooks(&self, current: Option<&Indicator>) -> Result<(), Cancelled>;

    /// Registers `on_change` to be called whenever [`has_hooks`](Self::has_hooks) may
    /// have changed. Must not be called with any lock held that `has_hooks` takes.
    ///
    /// Sets that never change can keep the default, which ignores the callback.
    fn subscribe(&self, on_change: HooksChanged) {
        let _ = on_change;
    }
}

/// A hook set that is always empty.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl CancellationHooks for NoHooks {
    fn has_hooks(&self) -> bool {
        false
    }

    fn run_hooks(&self, _current: Option<&Indicator>) -> Result<(), Cancelled> {
        Ok(())
    }
}

/// A single hook.
pub type CheckCanceledHook = Arc<dyn Fn(Option<&Indicator>) -> Result<(), Cancelled> + Send + Sync>;

/// Identifies an installed hook for removal.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HookId(u64);

/// A mutable list of hooks.
///
/// Managers built with a `HookRegistry` subscribe to it, so adding or removing a hook
/// takes effect on the next cancellation check.
#[derive(Default)]
pub struct HookRegistry {
    next_id: AtomicU64,
    hooks: RwLock<Vec<(HookId, CheckCanceledHook)>>,
    listeners: RwLock<Vec<HooksChanged>>,
}

impl HookRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a hook.
    pub fn add(
        &self,
        hook: impl Fn(Option<&Indicator>) -> Result<(), Cancelled> + Send + Sync + 'static,
    ) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.hooks.write().push((id, Arc::new(hook)));
        self.notify();
        id
    }

    /// Removes a hook. Returns `false` if it was not installed.
    pub fn remove(&self, id: HookId) -> bool {
        let removed = {
            let mut hooks = self.hooks.write();
            let before = hooks.len();
            hooks.retain(|(hook_id, _)| *hook_id != id);
            hooks.len() != before
        };
        if removed {
            self.notify();
        }
        removed
    }

    // Runs without the hook lock: listeners read `has_hooks`.
    fn notify(&self) {
        let listeners: Vec<HooksChanged> = self.listeners.read().clone();
        for listener in &listeners {
            listener();
        }
    }

    /// Number of installed hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    /// Whether no hook is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }
}

impl CancellationHooks for HookRegistry {
    fn has_hooks(&self) -> bool {
        !self.is_empty()
    }

    fn run_hooks(&self, current: Option<&Indicator>) -> Result<(), Cancelled> {
        // Hooks may install other hooks; run them on a copy of the list.
        let hooks: Vec<CheckCanceledHook> =
            self.hooks.read().iter().map(|(_, hook)| hook.clone()).collect();
        hooks.iter().try_for_each(|hook| hook(current))
    }

    fn subscribe(&self, on_change: HooksChanged) {
        self.listeners.write().push(on_change);
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("count", &self.len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
