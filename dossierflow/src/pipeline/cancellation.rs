//! Cooperative cancellation for pipeline runs.
//!
//! A run owns one [`CancellationToken`]. The scheduler checks it between
//! batches; the token budget gate and retry backoff race their sleeps against
//! it. In-flight external calls are never interrupted.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Token for coordinating cancellation across tasks.
pub struct CancellationToken {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .field("reason", &*self.reason.lock())
            .finish()
    }
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Requests cancellation with a reason.
    ///
    /// This is idempotent - only the first reason is stored.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut stored = self.reason.lock();
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        *stored = Some(reason.into());
        self.cancelled.store(true, Ordering::SeqCst);
        drop(stored);
        self.notify.notify_waiters();
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns the cancellation reason when the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> Result<(), String> {
        if self.is_cancelled() {
            return Err(self.reason().unwrap_or_default());
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            () = self.cancelled() => Err(self.reason().unwrap_or_default()),
        }
    }

    /// Cancels this token once `timeout` has elapsed.
    ///
    /// The returned guard aborts the timer when dropped, so a run that
    /// finishes early does not leave a pending task behind.
    #[must_use]
    pub fn cancel_after(self: &Arc<Self>, timeout: Duration, reason: impl Into<String>) -> DeadlineGuard {
        let token = Arc::clone(self);
        let reason = reason.into();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Pipeline deadline reached");
            token.cancel(reason);
        });
        DeadlineGuard {
            handle: Some(handle),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

/// Guard that aborts a deadline timer when dropped.
#[derive(Debug)]
pub struct DeadlineGuard {
    handle: Option<JoinHandle<()>>,
}

impl DeadlineGuard {
    /// A guard with no timer attached.
    #[must_use]
    pub fn disarmed() -> Self {
        Self { handle: None }
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
