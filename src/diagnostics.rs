//! Optional diagnostic collaborator: counts events dropped by either
//! overflow point (producers drop on inbox overflow, the dispatcher drops
//! on outbox overflow) and the number of contexts deduplicated away, then
//! packages them into a periodic diagnostic payload. Also builds the
//! one-time `diagnostic-init` event sent by `Processor::new` when
//! diagnostics are enabled, ahead of the first periodic tick.
//!
//! `dropped_events` is written from any producer thread as well as the
//! dispatcher thread, so it is a plain atomic rather than something behind
//! a lock.
//!
//! Each store gets a random id, stable for the process lifetime, carried
//! on every diagnostic event so a collector can tell repeat payloads from
//! the same pipeline apart from a restart.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

pub struct DiagnosticStore {
    id: Uuid,
    dropped_events: AtomicU64,
    deduplicated_users: AtomicU64,
}

impl Default for DiagnosticStore {
    fn default() -> Self {
        Self { id: Uuid::new_v4(), dropped_events: AtomicU64::new(0), deduplicated_users: AtomicU64::new(0) }
    }
}

impl DiagnosticStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dropped(&self, n: u64) {
        self.dropped_events.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_deduplicated(&self) {
        self.deduplicated_users.fetch_add(1, Ordering::Relaxed);
    }

    /// Builds the one-time `diagnostic-init` event, sent once at startup
    /// before any periodic `diagnostic` events. Carries the store's id so
    /// a collector can associate the init event with the stats events that
    /// follow it.
    pub fn build_init_event(&self, now: i64, worker_count: usize) -> Value {
        json!({
            "kind": "diagnostic-init",
            "id": self.id.to_string(),
            "creationDate": now,
            "configuration": {
                "workerCount": worker_count,
            },
        })
    }

    /// Builds the diagnostic-event JSON body for this tick, atomically
    /// fetching and clearing both counters.
    pub fn build_event(&self, now: i64) -> Value {
        let dropped_events = self.dropped_events.swap(0, Ordering::Relaxed);
        let deduplicated_users = self.deduplicated_users.swap(0, Ordering::Relaxed);
        json!({
            "kind": "diagnostic",
            "id": self.id.to_string(),
            "creationDate": now,
            "droppedEvents": dropped_events,
            "deduplicatedUsers": deduplicated_users,
        })
    }
}
