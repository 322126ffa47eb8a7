//! Startup abort token.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Shared flag that aborts the startup sequence or a build.
///
/// The first reason recorded wins. Polling code checks
/// [`is_cancelled`](Self::is_cancelled) between steps; code that sleeps
/// selects on [`cancelled`](Self::cancelled) so an abort interrupts the sleep.
#[derive(Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns false if it was already requested.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.reason.lock();
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        *slot = Some(reason.into());
        drop(slot);
        self.notify.notify_waiters();
        true
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The first reason given, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// The reason, or `"cancelled"` when none was recorded yet.
    #[must_use]
    pub fn reason_or_default(&self) -> String {
        self.reason().unwrap_or_else(|| "cancelled".to_string())
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before reading the flag.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
