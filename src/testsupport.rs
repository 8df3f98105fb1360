//! In-process test doubles: an `EventSender` that records what it was
//! given instead of making network calls, and a manual `Scheduler` so
//! flush/diagnostic ticks can be driven deterministically from a test
//! rather than waiting on real timers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::event::Timestamp;
use crate::scheduler::{CancelHandle, Scheduler};
use crate::sender::{EventSender, SendResult, SenderError};

#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub body: Vec<u8>,
    pub event_count: usize,
    pub uri: String,
}

#[derive(Default)]
pub struct RecordingEventSender {
    analytics_sends: Mutex<Vec<RecordedSend>>,
    diagnostic_sends: Mutex<Vec<RecordedSend>>,
    server_time: Option<Timestamp>,
    must_shut_down: bool,
}

impl RecordingEventSender {
    pub fn with_server_time(ts: Timestamp) -> Self {
        Self { server_time: Some(ts), ..Default::default() }
    }

    pub fn with_must_shut_down() -> Self {
        Self { must_shut_down: true, ..Default::default() }
    }

    pub fn analytics_sends(&self) -> Vec<RecordedSend> {
        self.analytics_sends.lock().clone()
    }

    pub fn diagnostic_sends(&self) -> Vec<RecordedSend> {
        self.diagnostic_sends.lock().clone()
    }
}

#[async_trait]
impl EventSender for RecordingEventSender {
    async fn send_analytics_events(&self, body: Vec<u8>, event_count: usize, uri: &str) -> SendResult {
        self.analytics_sends.lock().push(RecordedSend { body, event_count, uri: uri.to_string() });
        SendResult { success: true, must_shut_down: self.must_shut_down, time_from_server: self.server_time }
    }

    async fn send_diagnostic_event(&self, body: Vec<u8>, uri: &str) -> SendResult {
        self.diagnostic_sends.lock().push(RecordedSend { body, event_count: 1, uri: uri.to_string() });
        SendResult { success: true, must_shut_down: false, time_from_server: None }
    }

    async fn close(&self) -> Result<(), SenderError> {
        Ok(())
    }
}

/// Blocks every `send_analytics_events` call behind a gate until the test
/// calls `release_all`, so a worker delivering to it stays "busy"
/// indefinitely on demand. Used to exercise S6 (handoff refused while all
/// workers are occupied). Once released, every call — blocked or not yet
/// made — proceeds immediately and is recorded, same as
/// `RecordingEventSender`.
#[derive(Default)]
pub struct BlockingEventSender {
    released: AtomicBool,
    gate: tokio::sync::Notify,
    analytics_sends: Mutex<Vec<RecordedSend>>,
}

impl BlockingEventSender {
    /// Opens the gate: any call currently blocked, and every call made
    /// from now on, proceeds without waiting.
    pub fn release_all(&self) {
        self.released.store(true, Ordering::Release);
        self.gate.notify_waiters();
    }

    pub fn analytics_sends(&self) -> Vec<RecordedSend> {
        self.analytics_sends.lock().clone()
    }

    /// Same check-register-recheck shape as `SharedPipelineState`'s idle
    /// wait: registering interest before the recheck avoids missing a
    /// `release_all` that lands between the first check and the await.
    async fn wait_until_released(&self) {
        loop {
            if self.released.load(Ordering::Acquire) {
                return;
            }
            let notified = self.gate.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.released.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl EventSender for BlockingEventSender {
    async fn send_analytics_events(&self, body: Vec<u8>, event_count: usize, uri: &str) -> SendResult {
        self.wait_until_released().await;
        self.analytics_sends.lock().push(RecordedSend { body, event_count, uri: uri.to_string() });
        SendResult { success: true, must_shut_down: false, time_from_server: None }
    }

    async fn send_diagnostic_event(&self, _body: Vec<u8>, _uri: &str) -> SendResult {
        SendResult::default()
    }

    async fn close(&self) -> Result<(), SenderError> {
        Ok(())
    }
}

/// A scheduler whose timers only fire when the test calls `fire`.
#[derive(Default)]
pub struct ManualScheduler {
    callbacks: Mutex<Vec<Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invokes every registered callback once, in registration order.
    pub async fn fire_all(&self) {
        let callbacks: Vec<_> = self.callbacks.lock().clone();
        for callback in callbacks {
            callback().await;
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_periodic(
        &self,
        _period: Duration,
        callback: Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>,
    ) -> CancelHandle {
        let callback: Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync> = Arc::from(callback);
        self.callbacks.lock().push(callback);
        CancelHandle::new(|| {})
    }
}
