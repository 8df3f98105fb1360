//! Delivery workers: N dedicated tasks that each own one `FlushPayload` at
//! a time, serialize it, and hand it to the `EventSender`.
//!
//! Tokio's `mpsc::Receiver` has exactly one owner, so the single-slot
//! handoff's "any of N workers may receive it" is implemented by sharing
//! the receiver behind a `tokio::sync::Mutex`: at most one worker holds
//! the lock (and therefore the receive) at a time, and the channel's
//! capacity of 1 is what actually provides the backpressure named in the
//! pipeline design — the mutex only arbitrates which worker task wakes up
//! to take the next payload.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::config::EventsConfig;
use crate::dispatcher::FlushPayload;
use crate::formatter;
use crate::sender::EventSender;
use crate::state::SharedPipelineState;

pub type SharedPayloadReceiver = Arc<AsyncMutex<mpsc::Receiver<FlushPayload>>>;

pub async fn run_worker(
    payload_rx: SharedPayloadReceiver,
    sender: Arc<dyn EventSender>,
    state: Arc<SharedPipelineState>,
    config: Arc<EventsConfig>,
) {
    loop {
        let payload = {
            let mut rx = payload_rx.lock().await;
            rx.recv().await
        };
        let Some(payload) = payload else {
            break;
        };

        let (bytes, event_count) = formatter::write_output_events(&payload.events, &payload.summary, &config);
        let result = sender.send_analytics_events(bytes, event_count, &config.events_uri).await;

        if let Some(server_time) = result.time_from_server {
            state.set_last_known_past_time(server_time);
        }
        if result.must_shut_down {
            state.set_disabled();
        }

        state.decrement_busy_workers();
    }
}
