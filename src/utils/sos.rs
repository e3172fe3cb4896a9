//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! A cloneable, async-aware cancellation token. Cancelling any clone
//! wakes every task awaiting [`SignalOfStop::wait`], which lets accept
//! loops and long-running sessions unwind cleanly on Ctrl-C.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    /// Create a new, uncancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation. Returns immediately if already cancelled.
    pub async fn wait(&self) {
        while !self.cancelled() {
            self.internal.notify.notified().await;
        }
    }
}
