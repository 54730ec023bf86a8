use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// A broadcast flag that can be raised once and observed any number of times.
///
/// Raising it again is a no-op, so concurrent or repeated shutdown paths can
/// all call [`OnceSignal::fire`] without coordinating.
#[derive(Clone, Debug, Default)]
pub struct OnceSignal {
    fired: Arc<AtomicBool>,
    token: CancellationToken,
}

impl OnceSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal. Returns true only for the call that raised it.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolves once the signal has been raised.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

/// Fired when a consumer group session becomes active. A new one is created
/// for every join attempt.
pub type ReadinessSignal = OnceSignal;
