//! Cross-zone mutable cells. `closed`, `disabled`, and
//! `last_known_past_time` are the only fields producers, the dispatcher,
//! and workers all touch; they are encapsulated here as atomics rather
//! than spread across arbitrary struct fields, behind a shared, cloneable
//! handle.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
pub struct SharedPipelineState {
    /// Set when the dispatcher's main loop has exited (normal shutdown or
    /// a fatal error). Producers stop enqueuing once this is set.
    closed: AtomicBool,
    /// Set by a server kill-switch response; events are accepted but
    /// silently dropped, flushes are no-ops.
    disabled: AtomicBool,
    /// Server-observed clock, used as a lower bound on "definitely in the
    /// past" for debug-event expiration.
    last_known_past_time: AtomicI64,
    /// Number of workers currently holding a `FlushPayload`.
    busy_workers: AtomicUsize,
    /// Set once producers have been warned that the inbox is full, so the
    /// warning is logged only the first time.
    input_capacity_warned: AtomicBool,
    busy_workers_notify: Notify,
}

impl SharedPipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn set_disabled(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn last_known_past_time(&self) -> i64 {
        self.last_known_past_time.load(Ordering::Acquire)
    }

    pub fn set_last_known_past_time(&self, ts: i64) {
        self.last_known_past_time.store(ts, Ordering::Release);
    }

    pub fn busy_workers(&self) -> usize {
        self.busy_workers.load(Ordering::Acquire)
    }

    pub fn increment_busy_workers(&self) {
        self.busy_workers.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the busy-worker count and wakes any `SYNC`/`SHUTDOWN`
    /// waiters, who re-check whether it has reached zero.
    pub fn decrement_busy_workers(&self) {
        self.busy_workers.fetch_sub(1, Ordering::AcqRel);
        self.busy_workers_notify.notify_waiters();
    }

    /// Waits until no worker holds a payload. Used by `SYNC` and
    /// `SHUTDOWN` handling in the dispatcher.
    ///
    /// `notify_waiters()` only wakes waiters already registered at the
    /// time it is called; it leaves no permit behind for a `notified()`
    /// future created afterwards. So the future is pinned and `enable()`d
    /// (registering it as a waiter) *before* the second `busy_workers()`
    /// check, not after — otherwise a `decrement_busy_workers()` landing
    /// between that check and the `.await` would wake nobody and this
    /// would hang forever.
    pub async fn wait_for_idle_workers(&self) {
        loop {
            if self.busy_workers() == 0 {
                return;
            }
            let notified = self.busy_workers_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.busy_workers() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Returns `true` the first time this is called (and marks the flag),
    /// `false` on every subsequent call — used to log the inbox-overflow
    /// warning exactly once.
    pub fn mark_input_capacity_warned(&self) -> bool {
        !self.input_capacity_warned.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_for_idle_workers_completes_once_count_reaches_zero() {
        let state = Arc::new(SharedPipelineState::new());
        state.increment_busy_workers();
        state.increment_busy_workers();

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_for_idle_workers().await })
        };

        // Give the waiter a chance to register before either decrement,
        // which is exactly the window the lost-wakeup bug lived in.
        tokio::time::sleep(Duration::from_millis(5)).await;
        state.decrement_busy_workers();
        state.decrement_busy_workers();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_for_idle_workers hung")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_idle_workers_returns_immediately_when_already_idle() {
        let state = SharedPipelineState::new();
        tokio::time::timeout(Duration::from_millis(50), state.wait_for_idle_workers())
            .await
            .expect("should not block when busy_workers is already 0");
    }
}
