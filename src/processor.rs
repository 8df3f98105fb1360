//! Public facade. Wires the inbox, the dispatcher task, the delivery
//! workers, and the scheduled timers together, and exposes the three
//! operations application code actually calls: `send_event`, `flush`,
//! `close`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::config::EventsConfig;
use crate::dedup::ContextDeduplicator;
use crate::diagnostics::DiagnosticStore;
use crate::dispatcher::{Dispatcher, DispatcherMessage};
use crate::error::{PipelineError, PipelineResult};
use crate::event::Event;
use crate::scheduler::{CancelHandle, Scheduler};
use crate::sender::EventSender;
use crate::state::SharedPipelineState;
use crate::worker::{self, SharedPayloadReceiver};

/// The assembled pipeline: one dispatcher task, `config.worker_count`
/// delivery workers, and (depending on configuration) up to three
/// scheduled timers — flush, context-dedup flush, diagnostics.
pub struct Processor {
    config: Arc<EventsConfig>,
    inbox: mpsc::Sender<DispatcherMessage>,
    state: Arc<SharedPipelineState>,
    diagnostics: Arc<DiagnosticStore>,
    cancel_handles: std::sync::Mutex<Vec<CancelHandle>>,
    closing: AsyncMutex<bool>,
    closed: AtomicBool,
}

impl Processor {
    pub fn new(
        config: EventsConfig,
        sender: Arc<dyn EventSender>,
        dedup: Box<dyn ContextDeduplicator>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let config = Arc::new(config);
        let diagnostics = Arc::new(DiagnosticStore::new());
        let state = Arc::new(SharedPipelineState::new());

        let (inbox_tx, inbox_rx) = mpsc::channel(config.capacity);
        let (payload_tx, payload_rx) = mpsc::channel(1);

        let dedup_flush_interval = dedup.flush_interval();

        let dispatcher = Dispatcher::new(
            inbox_rx,
            dedup,
            diagnostics.clone(),
            state.clone(),
            payload_tx,
            sender.clone(),
            config.clone(),
        );
        tokio::spawn(dispatcher.run());

        let payload_rx: SharedPayloadReceiver = Arc::new(AsyncMutex::new(payload_rx));
        for _ in 0..config.worker_count {
            tokio::spawn(worker::run_worker(payload_rx.clone(), sender.clone(), state.clone(), config.clone()));
        }

        let mut cancel_handles = Vec::with_capacity(3);

        {
            let inbox_tx = inbox_tx.clone();
            cancel_handles.push(scheduler.schedule_periodic(
                config.flush_interval,
                Box::new(move || {
                    let inbox_tx = inbox_tx.clone();
                    Box::pin(async move {
                        let _ = inbox_tx.send(DispatcherMessage::Flush).await;
                    })
                }),
            ));
        }

        if let Some(interval) = dedup_flush_interval {
            let inbox_tx = inbox_tx.clone();
            cancel_handles.push(scheduler.schedule_periodic(
                interval,
                Box::new(move || {
                    let inbox_tx = inbox_tx.clone();
                    Box::pin(async move {
                        let _ = inbox_tx.send(DispatcherMessage::FlushUsers).await;
                    })
                }),
            ));
        }

        if let Some(interval) = config.diagnostic_recording_interval {
            let inbox_tx = inbox_tx.clone();
            cancel_handles.push(scheduler.schedule_periodic(
                interval,
                Box::new(move || {
                    let inbox_tx = inbox_tx.clone();
                    Box::pin(async move {
                        let _ = inbox_tx.send(DispatcherMessage::Diagnostic).await;
                    })
                }),
            ));

            // Sent once at startup, ahead of the first periodic tick, so a
            // collector sees the pipeline's configuration before its first
            // stats payload.
            let init_event = diagnostics.build_init_event(crate::time::now_millis(), config.worker_count);
            let sender = sender.clone();
            let uri = config.diagnostic_uri.clone();
            tokio::spawn(async move {
                if let Ok(bytes) = serde_json::to_vec(&init_event) {
                    let _ = sender.send_diagnostic_event(bytes, &uri).await;
                }
            });
        }

        Self {
            config,
            inbox: inbox_tx,
            state,
            diagnostics,
            cancel_handles: std::sync::Mutex::new(cancel_handles),
            closing: AsyncMutex::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues an event for processing. Never blocks: on inbox overflow
    /// (or after the pipeline has closed) the event is dropped, counted in
    /// diagnostics, and a one-time warning is logged.
    pub fn send_event(&self, event: Event) {
        if self.state.is_closed() {
            return;
        }
        if self.inbox.try_send(DispatcherMessage::Event(event)).is_err() {
            self.diagnostics.record_dropped(1);
            if self.state.mark_input_capacity_warned() {
                log::warn!(
                    "events are being produced faster than they can be processed; dropping events (capacity = {})",
                    self.config.capacity
                );
            }
        }
    }

    /// Requests a flush. Non-blocking; a full inbox silently drops the
    /// request exactly as it would drop any other message.
    pub fn flush(&self) {
        let _ = self.inbox.try_send(DispatcherMessage::Flush);
    }

    /// Blocks until all in-flight payloads have been handed to the
    /// `EventSender`. Mainly useful in tests; production callers generally
    /// only need `close`.
    pub async fn flush_sync(&self) {
        self.flush();
        let (tx, rx) = oneshot::channel();
        if self.inbox.send(DispatcherMessage::Sync(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Idempotent shutdown: cancels the scheduled timers, drains a final
    /// flush, and waits for the dispatcher to confirm all workers are
    /// idle and the sender has released its resources.
    ///
    /// A second call (concurrent or subsequent) observes the guard already
    /// set and returns immediately without repeating any of this.
    pub async fn close(&self) -> PipelineResult<()> {
        let mut closing = self.closing.lock().await;
        if *closing {
            return Ok(());
        }
        *closing = true;

        for handle in self.cancel_handles.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            handle.cancel();
        }

        let _ = self.inbox.send(DispatcherMessage::Flush).await;

        let (tx, rx) = oneshot::channel();
        let shutdown_sent = self.inbox.send(DispatcherMessage::Shutdown(tx)).await.is_ok();
        self.closed.store(true, Ordering::Release);

        if !shutdown_sent {
            // The dispatcher is already gone (fatal error or prior
            // shutdown); nothing left to wait for.
            return Ok(());
        }

        match rx.await {
            // Dropping the sender half (the dispatcher died mid-flight) is
            // treated the same as a clean completion: the pipeline is
            // closed either way, and there is no further action a caller
            // could usefully take.
            Err(_) => Ok(()),
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(PipelineError::SenderClose(err)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::LruContextDeduplicator;
    use crate::event::Context;
    use crate::scheduler::TokioScheduler;
    use crate::testsupport::{ManualScheduler, RecordingEventSender};
    use serde_json::json;
    use std::time::Duration;

    fn make_processor(
        sender: Arc<RecordingEventSender>,
        scheduler: Arc<ManualScheduler>,
    ) -> Processor {
        let config = EventsConfig::builder().capacity(100).build().unwrap();
        let dedup = Box::new(LruContextDeduplicator::new(Duration::from_secs(60)));
        Processor::new(config, sender, dedup, scheduler)
    }

    #[tokio::test]
    async fn send_event_then_flush_reaches_the_sender() {
        let sender = Arc::new(RecordingEventSender::default());
        let scheduler = Arc::new(ManualScheduler::new());
        let processor = make_processor(sender.clone(), scheduler);

        processor.send_event(Event::Identify { timestamp: 1, context: Context::new("u1", "user") });
        processor.flush_sync().await;

        let sends = sender.analytics_sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].event_count, 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let sender = Arc::new(RecordingEventSender::default());
        let scheduler = Arc::new(ManualScheduler::new());
        let processor = make_processor(sender, scheduler);

        processor.close().await.unwrap();
        processor.close().await.unwrap();
        assert!(processor.is_closed());
    }

    #[tokio::test]
    async fn events_after_close_are_dropped() {
        let sender = Arc::new(RecordingEventSender::default());
        let scheduler = Arc::new(ManualScheduler::new());
        let processor = make_processor(sender.clone(), scheduler);

        processor.close().await.unwrap();
        processor.send_event(Event::Identify { timestamp: 1, context: Context::new("u1", "user") });
        processor.flush();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sender.analytics_sends().is_empty());
    }

    #[tokio::test]
    async fn scheduled_flush_fires_through_the_injected_scheduler() {
        let sender = Arc::new(RecordingEventSender::default());
        let scheduler = Arc::new(ManualScheduler::new());
        let processor = make_processor(sender.clone(), scheduler.clone());

        processor.send_event(Event::Custom {
            timestamp: 1,
            event_key: "purchase".into(),
            context: Context::new("u1", "user"),
            data: Some(json!({"amount": 9})),
            metric_value: None,
        });

        // First registered periodic is the flush timer.
        scheduler.fire_all().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sender.analytics_sends().len(), 1);
    }

    /// S6 (handoff refusal): with the lone worker wedged mid-delivery and
    /// the one-slot handoff buffer also occupied, a third flush has
    /// nowhere to go and must restore its events to the outbox rather than
    /// lose them. Once the worker is released and drains, the restored
    /// events are delivered on the next flush.
    #[tokio::test]
    async fn s6_handoff_refusal_retains_and_redelivers() {
        use crate::testsupport::BlockingEventSender;

        let sender = Arc::new(BlockingEventSender::default());
        let scheduler = Arc::new(ManualScheduler::new());
        let config = EventsConfig::builder().capacity(100).worker_count(1).build().unwrap();
        let dedup = Box::new(LruContextDeduplicator::new(Duration::from_secs(60)));
        let processor = Processor::new(config, sender.clone(), dedup, scheduler);

        processor.send_event(Event::Identify { timestamp: 1, context: Context::new("u1", "user") });
        processor.flush();
        // Let the sole worker take payload 1 and wedge on the gate.
        tokio::time::sleep(Duration::from_millis(20)).await;

        processor.send_event(Event::Identify { timestamp: 2, context: Context::new("u2", "user") });
        processor.flush();
        // The worker is busy, but the one-slot handoff buffer is free, so
        // this succeeds and sits unconsumed.
        tokio::time::sleep(Duration::from_millis(20)).await;

        processor.send_event(Event::Identify { timestamp: 3, context: Context::new("u3", "user") });
        processor.flush();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Both the worker and the buffer are occupied: this flush must
        // have been refused, so nothing beyond the first two sends has
        // reached the sender yet.
        assert_eq!(sender.analytics_sends().len(), 0);

        sender.release_all();
        // Worker drains payload 1 then payload 2 without any further
        // flush calls.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sender.analytics_sends().len(), 2);

        // The restored events from the refused third flush are still in
        // the outbox; an explicit flush now delivers them.
        processor.flush_sync().await;
        let sends = sender.analytics_sends();
        assert_eq!(sends.len(), 3);
        assert_eq!(sends[2].event_count, 2); // index + identify for u3
    }

    #[tokio::test]
    async fn real_scheduler_wires_up_without_panicking() {
        let sender = Arc::new(RecordingEventSender::default());
        let scheduler = Arc::new(TokioScheduler);
        let config = EventsConfig::builder().capacity(10).build().unwrap();
        let dedup = Box::new(LruContextDeduplicator::new(Duration::from_secs(60)));
        let processor = Processor::new(config, sender, dedup, scheduler);
        processor.close().await.unwrap();
    }
}
