//! In-flight bookkeeping for outbound API calls and attributed workers.
//!
//! Counters are shared across threads. Every increment hands out an RAII
//! guard whose `Drop` decrements the counter and wakes waiters, so the count
//! stays accurate even when the guarded work panics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct CounterInner {
    count: AtomicU64,
    zero: Notify,
}

/// Shared counter with a bounded "wait until zero" operation.
#[derive(Debug, Clone, Default)]
pub struct InFlightCounter {
    inner: Arc<CounterInner>,
}

impl InFlightCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter and returns a guard that decrements it on drop.
    #[must_use]
    pub fn guard(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Current number of outstanding guards.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Waits until the counter reaches zero or `timeout` elapses.
    ///
    /// Returns `true` if everything drained, `false` if the bound was reached
    /// with work still outstanding.
    pub async fn wait_for_zero(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking the count so a release that
            // lands between the check and the await is not missed.
            let mut notified = std::pin::pin!(self.inner.zero.notified());
            notified.as_mut().enable();

            if self.count() == 0 {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() == 0;
            }
        }
    }
}

/// RAII guard for one unit of in-flight work.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<CounterInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.zero.notify_waiters();
        }
    }
}

/// Outstanding work attributable to one environment.
///
/// Tracks outbound API calls and worker tasks separately: workers are
/// interrupted when the owning request completes, API calls are left to
/// finish on their own.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    api_calls: InFlightCounter,
    workers: InFlightCounter,
    interrupt: CancellationToken,
}

impl ActivityTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one outbound API call as in flight until the guard drops.
    #[must_use]
    pub fn api_call(&self) -> InFlightGuard {
        self.api_calls.guard()
    }

    /// Registers a worker. The worker counts as running until the guard drops.
    #[must_use]
    pub fn register_worker(&self) -> WorkerGuard {
        WorkerGuard {
            _slot: self.workers.guard(),
            interrupt: self.interrupt.clone(),
        }
    }

    #[must_use]
    pub fn api_calls_in_flight(&self) -> u64 {
        self.api_calls.count()
    }

    #[must_use]
    pub fn workers_running(&self) -> u64 {
        self.workers.count()
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Signals every registered worker to stop, then waits up to `wait` for
    /// them to release their guards.
    ///
    /// Returns `false` if workers were still running when the bound elapsed.
    /// Those workers are abandoned, not killed.
    pub async fn interrupt_workers(&self, wait: Duration) -> bool {
        self.interrupt.cancel();
        self.workers.wait_for_zero(wait).await
    }

    /// Waits up to `wait` for in-flight API calls to finish.
    pub async fn wait_for_api_calls(&self, wait: Duration) -> bool {
        self.api_calls.wait_for_zero(wait).await
    }
}

/// Registration of one worker with an [`ActivityTracker`].
#[derive(Debug)]
pub struct WorkerGuard {
    _slot: InFlightGuard,
    interrupt: CancellationToken,
}

impl WorkerGuard {
    /// Token cancelled when the owning environment interrupts its workers.
    #[must_use]
    pub fn interrupt_token(&self) -> &CancellationToken {
        &self.interrupt
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }
}
