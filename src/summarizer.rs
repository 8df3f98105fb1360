//! Aggregates feature-request events into a counter table keyed by
//! flag/version/variation. Called only from the dispatcher thread; no
//! internal synchronization needed.

use crate::event::Timestamp;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SummaryKey {
    pub flag_version: Option<i64>,
    pub variation: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SummaryCounter {
    pub count: u64,
    pub value: Value,
    pub default_value: Value,
}

#[derive(Debug, Clone)]
pub struct SummaryEntry {
    pub default_value: Value,
    pub counters: HashMap<SummaryKey, SummaryCounter>,
    pub context_kinds: HashSet<String>,
}

/// A flushed, immutable view of one window's summarized counters.
#[derive(Debug, Clone, Default)]
pub struct SummarySnapshot {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub flags: HashMap<String, SummaryEntry>,
}

impl SummarySnapshot {
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Summarizer {
    start_time: Timestamp,
    end_time: Timestamp,
    flags: HashMap<String, SummaryEntry>,
}

impl Summarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn summarize_event(
        &mut self,
        ts: Timestamp,
        flag_key: &str,
        flag_version: Option<i64>,
        variation: Option<i64>,
        value: &Value,
        default_value: &Value,
        context: &crate::event::Context,
    ) {
        if self.start_time == 0 || ts < self.start_time {
            self.start_time = ts;
        }
        if ts > self.end_time {
            self.end_time = ts;
        }

        let entry = self.flags.entry(flag_key.to_string()).or_insert_with(|| SummaryEntry {
            default_value: default_value.clone(),
            counters: HashMap::new(),
            context_kinds: HashSet::new(),
        });

        let key = SummaryKey { flag_version, variation };
        entry
            .counters
            .entry(key)
            .and_modify(|c| c.count += 1)
            .or_insert_with(|| SummaryCounter {
                count: 1,
                value: value.clone(),
                default_value: default_value.clone(),
            });

        entry.context_kinds.insert(context.kind.clone());
    }

    /// Returns a snapshot of the current window and clears internal state.
    pub fn get_summary_and_reset(&mut self) -> SummarySnapshot {
        let snapshot = SummarySnapshot {
            start_time: self.start_time,
            end_time: self.end_time,
            flags: std::mem::take(&mut self.flags),
        };
        self.start_time = 0;
        self.end_time = 0;
        snapshot
    }

    /// Reinstates a snapshot after a failed flush handoff. Any counters
    /// accumulated since the flush was taken are merged in rather than
    /// overwritten, so no contribution is lost.
    pub fn restore_to(&mut self, snapshot: SummarySnapshot) {
        if snapshot.is_empty() {
            return;
        }
        if self.start_time == 0 || snapshot.start_time < self.start_time {
            self.start_time = snapshot.start_time;
        }
        if snapshot.end_time > self.end_time {
            self.end_time = snapshot.end_time;
        }
        for (flag_key, restored) in snapshot.flags {
            match self.flags.get_mut(&flag_key) {
                Some(existing) => {
                    for (k, c) in restored.counters {
                        existing
                            .counters
                            .entry(k)
                            .and_modify(|e| e.count += c.count)
                            .or_insert(c);
                    }
                    existing.context_kinds.extend(restored.context_kinds);
                }
                None => {
                    self.flags.insert(flag_key, restored);
                }
            }
        }
    }
}
