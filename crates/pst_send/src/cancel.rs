//! Cooperative cancellation shared by the supervisor and both workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Token for cooperative cancellation.
///
/// Uses an AtomicBool internally. Clone is cheap and shares state. Loops
/// check the token between units of work (one file, one pair, one poll).
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Sleep for `duration`, returning early (true) if cancelled.
    pub async fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(100);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_cancelled() {
                return true;
            }
            let step = remaining.min(SLICE);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
        self.is_cancelled()
    }
}
