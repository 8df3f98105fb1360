//! Single-consumer loop: drains the inbox, classifies events, drives the
//! summarizer, builds flush payloads, hands off to workers, drives
//! diagnostics.
//!
//! Runs as one `tokio::task`, owning `outbox`, `summarizer`, and the
//! context deduplicator outright — no internal locking, per the
//! concurrency model's Zone D.
//!
//! **Fatal-error handling.** If this task panics mid-message, unwinding
//! drops `self`, which (a) runs `Dispatcher`'s `Drop` impl, marking the
//! shared state `closed` so producers stop enqueuing, and (b) drops the
//! inbox `Receiver` and any buffered `Sync`/`Shutdown` messages still in
//! it — which drops their `oneshot::Sender` halves, which immediately
//! wakes any caller awaiting the matching `oneshot::Receiver` with an
//! error. `Processor` treats that error as "completed" (see `processor.rs`),
//! so no caller is left hanging.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::config::EventsConfig;
use crate::dedup::ContextDeduplicator;
use crate::diagnostics::DiagnosticStore;
use crate::event::{Context, Event, Timestamp};
use crate::sender::{EventSender, SenderError};
use crate::state::SharedPipelineState;
use crate::summarizer::{Summarizer, SummarySnapshot};
use crate::time::now_millis;

pub enum DispatcherMessage {
    Event(Event),
    Flush,
    FlushUsers,
    Diagnostic,
    Sync(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<Result<(), SenderError>>),
}

/// A flushed batch, exclusively owned by whichever worker receives it.
pub struct FlushPayload {
    pub events: Vec<Event>,
    pub summary: SummarySnapshot,
}

pub struct Dispatcher {
    inbox: mpsc::Receiver<DispatcherMessage>,
    outbox: Vec<Event>,
    outbox_capacity_warned: bool,
    summarizer: Summarizer,
    dedup: Box<dyn ContextDeduplicator>,
    diagnostics: Arc<DiagnosticStore>,
    state: Arc<SharedPipelineState>,
    payload_tx: mpsc::Sender<FlushPayload>,
    sender: Arc<dyn EventSender>,
    config: Arc<EventsConfig>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inbox: mpsc::Receiver<DispatcherMessage>,
        dedup: Box<dyn ContextDeduplicator>,
        diagnostics: Arc<DiagnosticStore>,
        state: Arc<SharedPipelineState>,
        payload_tx: mpsc::Sender<FlushPayload>,
        sender: Arc<dyn EventSender>,
        config: Arc<EventsConfig>,
    ) -> Self {
        Self {
            inbox,
            outbox: Vec::new(),
            outbox_capacity_warned: false,
            summarizer: Summarizer::new(),
            dedup,
            diagnostics,
            state,
            payload_tx,
            sender,
            config,
        }
    }

    pub async fn run(mut self) {
        loop {
            let first = match self.inbox.recv().await {
                Some(msg) => msg,
                None => break,
            };

            let mut batch = Vec::with_capacity(1 + self.config.batch_drain);
            batch.push(first);
            while batch.len() < 1 + self.config.batch_drain {
                match self.inbox.try_recv() {
                    Ok(msg) => batch.push(msg),
                    Err(_) => break,
                }
            }

            let mut shutting_down = false;
            for msg in batch {
                if self.handle_message(msg).await {
                    shutting_down = true;
                }
            }
            if shutting_down {
                break;
            }
        }
    }

    /// Returns `true` if this message initiated shutdown and the main
    /// loop should exit after this batch.
    async fn handle_message(&mut self, msg: DispatcherMessage) -> bool {
        match msg {
            DispatcherMessage::Event(e) => {
                self.handle_event(e);
                false
            }
            DispatcherMessage::Flush => {
                self.handle_flush().await;
                false
            }
            DispatcherMessage::FlushUsers => {
                self.dedup.flush();
                false
            }
            DispatcherMessage::Diagnostic => {
                self.handle_diagnostic();
                false
            }
            DispatcherMessage::Sync(completion) => {
                self.state.wait_for_idle_workers().await;
                let _ = completion.send(());
                false
            }
            DispatcherMessage::Shutdown(completion) => {
                self.state.wait_for_idle_workers().await;
                self.state.set_disabled();
                let close_result = self.sender.close().await;
                if let Err(err) = &close_result {
                    log::warn!("event sender failed to close: {err}");
                }
                let _ = completion.send(close_result);
                true
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        if self.state.is_disabled() {
            return;
        }

        let mut add_full_event = true;
        let mut debug_event = None;

        if let Event::FeatureRequest(fr) = &event {
            self.summarizer.summarize_event(
                fr.timestamp,
                &fr.flag_key,
                fr.flag_version,
                fr.variation,
                &fr.value,
                &fr.default_value,
                &fr.context,
            );
            add_full_event = fr.track_events;
            if self.should_debug(fr) {
                debug_event = Some(fr.to_debug());
            }
        }

        let index_event = match &event {
            Event::FeatureRequest(fr) => self.process_context(&fr.context, fr.timestamp, true),
            Event::Custom { context, timestamp, .. } => self.process_context(context, *timestamp, true),
            Event::Identify { context, .. } => {
                self.process_context(context, 0, false);
                None
            }
            _ => None,
        };

        if let Some(index_event) = index_event {
            self.append_to_outbox(index_event);
        }
        if add_full_event {
            self.append_to_outbox(event);
        }
        if let Some(debug_event) = debug_event {
            self.append_to_outbox(debug_event);
        }
    }

    /// Calls `dedup.process_context`. When `track` is set (FeatureRequest
    /// / Custom), a new sighting yields a synthesized `Index` event and a
    /// repeat sighting bumps the deduplicated-contexts diagnostic counter.
    /// `Identify` events call this with `track = false`: the membership
    /// test still runs, but nothing is synthesized or counted.
    fn process_context(&mut self, context: &Context, timestamp: Timestamp, track: bool) -> Option<Event> {
        let is_new = self.dedup.process_context(context);
        if !track {
            return None;
        }
        if !is_new {
            self.diagnostics.record_deduplicated();
            return None;
        }
        Some(Event::Index { timestamp, context: context.clone() })
    }

    /// `debugEventsUntil` must be strictly after both the last known
    /// server time and the local wall clock — the server time is a lower
    /// bound on "definitely in the past", tolerating client clock skew.
    fn should_debug(&self, fr: &crate::event::FeatureRequestEvent) -> bool {
        match fr.debug_events_until {
            Some(until) => until > self.state.last_known_past_time() && until > now_millis(),
            None => false,
        }
    }

    fn append_to_outbox(&mut self, event: Event) {
        if self.outbox.len() >= self.config.capacity {
            self.diagnostics.record_dropped(1);
            if !self.outbox_capacity_warned {
                log::warn!("event buffer full, dropping events");
                self.outbox_capacity_warned = true;
            }
            return;
        }
        self.outbox.push(event);
    }

    async fn handle_flush(&mut self) {
        if self.state.is_disabled() || self.outbox.is_empty() {
            return;
        }

        let events = std::mem::take(&mut self.outbox);
        let summary = self.summarizer.get_summary_and_reset();
        self.state.increment_busy_workers();

        match self.payload_tx.try_send(FlushPayload { events, summary }) {
            Ok(()) => {
                self.outbox_capacity_warned = false;
            }
            Err(mpsc::error::TrySendError::Full(payload)) | Err(mpsc::error::TrySendError::Closed(payload)) => {
                log::debug!("flush handoff refused: all workers busy, retrying next flush");
                self.state.decrement_busy_workers();
                self.summarizer.restore_to(payload.summary);
                let mut restored = payload.events;
                restored.append(&mut self.outbox);
                self.outbox = restored;
            }
        }
    }

    fn handle_diagnostic(&mut self) {
        if self.state.is_disabled() {
            return;
        }
        let event = self.diagnostics.build_event(now_millis());
        let sender = self.sender.clone();
        let uri = self.config.diagnostic_uri.clone();
        tokio::spawn(async move {
            if let Ok(bytes) = serde_json::to_vec(&event) {
                let _ = sender.send_diagnostic_event(bytes, &uri).await;
            }
        });
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.state.set_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::LruContextDeduplicator;
    use crate::testsupport::RecordingEventSender;
    use serde_json::json;
    use std::time::Duration;

    fn make_dispatcher() -> (
        mpsc::Sender<DispatcherMessage>,
        mpsc::Receiver<FlushPayload>,
        Arc<SharedPipelineState>,
        Arc<DiagnosticStore>,
        Arc<RecordingEventSender>,
    ) {
        let (inbox_tx, inbox_rx) = mpsc::channel(1024);
        let (payload_tx, payload_rx) = mpsc::channel(1);
        let state = Arc::new(SharedPipelineState::new());
        let diagnostics = Arc::new(DiagnosticStore::new());
        let sender = Arc::new(RecordingEventSender::default());
        let config = Arc::new(EventsConfig::builder().capacity(10).build().unwrap());
        let dedup = Box::new(LruContextDeduplicator::new(Duration::from_secs(60)));

        let dispatcher = Dispatcher::new(
            inbox_rx,
            dedup,
            diagnostics.clone(),
            state.clone(),
            payload_tx,
            sender.clone(),
            config,
        );
        tokio::spawn(dispatcher.run());
        (inbox_tx, payload_rx, state, diagnostics, sender)
    }

    fn feature_request(track_events: bool) -> Event {
        Event::FeatureRequest(crate::event::FeatureRequestEvent {
            timestamp: 1,
            flag_key: "f".into(),
            context: Context::new("user-key", "user"),
            flag_version: Some(1),
            variation: Some(0),
            value: json!(true),
            default_value: json!(false),
            prereq_of_key: None,
            track_events,
            debug_events_until: None,
            reason: None,
        })
    }

    #[tokio::test]
    async fn s1_summary_only_flush() {
        let (inbox_tx, mut payload_rx, _state, _diag, _sender) = make_dispatcher();
        for _ in 0..1000 {
            inbox_tx.send(DispatcherMessage::Event(feature_request(false))).await.unwrap();
        }
        inbox_tx.send(DispatcherMessage::Flush).await.unwrap();

        let payload = payload_rx.recv().await.unwrap();
        // One Index event (first sighting) plus nothing else (no feature, no debug).
        assert_eq!(payload.events.len(), 1);
        assert!(matches!(payload.events[0], Event::Index { .. }));

        let entry = payload.summary.flags.get("f").unwrap();
        let key = crate::summarizer::SummaryKey { flag_version: Some(1), variation: Some(0) };
        assert_eq!(entry.counters[&key].count, 1000);
    }

    #[tokio::test]
    async fn s2_track_and_debug_in_past_is_suppressed() {
        let (inbox_tx, mut payload_rx, state, _diag, _sender) = make_dispatcher();
        state.set_last_known_past_time(10_000);

        let mut fr = match feature_request(true) {
            Event::FeatureRequest(fr) => fr,
            _ => unreachable!(),
        };
        fr.debug_events_until = Some(5_000);
        inbox_tx.send(DispatcherMessage::Event(Event::FeatureRequest(fr))).await.unwrap();
        inbox_tx.send(DispatcherMessage::Flush).await.unwrap();

        let payload = payload_rx.recv().await.unwrap();
        assert_eq!(payload.events.len(), 2); // index + feature, no debug
        assert!(matches!(payload.events[0], Event::Index { .. }));
        assert!(matches!(payload.events[1], Event::FeatureRequest(_)));
    }

    #[tokio::test]
    async fn s3_track_and_debug_in_future_is_included() {
        let (inbox_tx, mut payload_rx, state, _diag, _sender) = make_dispatcher();
        // `should_debug` compares against the real wall clock, so this
        // scenario's "past"/"future" have to be relative to `now_millis()`
        // rather than the spec's illustrative toy values.
        state.set_last_known_past_time(10);

        let mut fr = match feature_request(true) {
            Event::FeatureRequest(fr) => fr,
            _ => unreachable!(),
        };
        fr.debug_events_until = Some(crate::time::now_millis() + 60_000);
        inbox_tx.send(DispatcherMessage::Event(Event::FeatureRequest(fr))).await.unwrap();
        inbox_tx.send(DispatcherMessage::Flush).await.unwrap();

        let payload = payload_rx.recv().await.unwrap();
        assert_eq!(payload.events.len(), 3); // index + feature + debug
        assert!(matches!(payload.events[0], Event::Index { .. }));
        assert!(matches!(payload.events[1], Event::FeatureRequest(_)));
        assert!(matches!(payload.events[2], Event::Debug(_)));
    }

    #[tokio::test]
    async fn s4_outbox_overflow_is_capped_and_counted() {
        let (inbox_tx, _payload_rx, _state, diag, _sender) = make_dispatcher();
        for i in 0..100 {
            let context = Context::new(format!("user-{i}"), "user");
            inbox_tx
                .send(DispatcherMessage::Event(Event::Identify { timestamp: 1, context }))
                .await
                .unwrap();
        }
        // give the dispatcher a moment to drain the batch
        tokio::time::sleep(Duration::from_millis(50)).await;
        let event = diag.build_event(0);
        assert_eq!(event["droppedEvents"], 90);
    }

    #[tokio::test]
    async fn s5_disabled_pipeline_drops_subsequent_events() {
        let (inbox_tx, mut payload_rx, state, _diag, _sender) = make_dispatcher();
        state.set_disabled();
        inbox_tx.send(DispatcherMessage::Event(feature_request(true))).await.unwrap();
        inbox_tx.send(DispatcherMessage::Flush).await.unwrap();

        // disabled: handle_event drops silently and flush is a no-op, so
        // nothing should ever arrive on the payload channel.
        let result = tokio::time::timeout(Duration::from_millis(50), payload_rx.recv()).await;
        assert!(result.is_err(), "no payload should have been produced while disabled");
    }
}
