//! Cooperative cancellation (spec §5, design note "Cancel tokens").
//!
//! A shared flag plus a broadcast signal: code that only checks can poll
//! `is_cancelled()`, code that wants to suspend until cancellation can
//! `.await cancelled()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. Safe to call after
    /// cancellation already happened as long as the caller also checks
    /// `is_cancelled()` first — `Notify::notified()` only wakes tasks that
    /// were already waiting when `notify_waiters` fired.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
