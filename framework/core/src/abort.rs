use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Signal raised when an abort-policy threshold is breached.
///
/// Raising it stops new workers from being started. Workers that are already running are not
/// interrupted and finish their current iteration. Only the first call to [AbortSignal::abort]
/// has any effect, so a threshold that stays breached across many evaluations produces exactly
/// one abort.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortState>,
}

#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    reason: OnceLock<String>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the abort. Returns `true` only for the call that actually raised it.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        if self
            .inner
            .aborted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let reason = reason.into();
        log::info!("Run aborted: {reason}");
        let _ = self.inner.reason.set(reason);

        true
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// The reason given by whichever call raised the abort.
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.get().cloned()
    }
}
