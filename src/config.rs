//! Typed, validated pipeline configuration.

use crate::error::{ConfigError, ConfigResult};
use std::time::Duration;

const DEFAULT_WORKER_COUNT: usize = 5;
const DEFAULT_BATCH_DRAIN: usize = 50;

#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Max events per flush batch; inbox and outbox share this bound.
    pub capacity: usize,
    pub flush_interval: Duration,
    pub diagnostic_recording_interval: Option<Duration>,
    pub all_attributes_private: bool,
    pub private_attributes: Vec<String>,
    pub inline_contexts: bool,
    pub events_uri: String,
    pub diagnostic_uri: String,
    /// Number of delivery workers; the source fixes this at 5, this crate
    /// leaves it configurable while keeping 5 as the default.
    pub worker_count: usize,
    /// Messages opportunistically drained per main-loop iteration without
    /// blocking, after the first blocking receive.
    pub batch_drain: usize,
}

impl EventsConfig {
    pub fn builder() -> EventsConfigBuilder {
        EventsConfigBuilder::default()
    }
}

#[derive(Debug, Clone)]
pub struct EventsConfigBuilder {
    capacity: usize,
    flush_interval: Duration,
    diagnostic_recording_interval: Option<Duration>,
    all_attributes_private: bool,
    private_attributes: Vec<String>,
    inline_contexts: bool,
    events_uri: String,
    diagnostic_uri: String,
    worker_count: usize,
    batch_drain: usize,
}

impl Default for EventsConfigBuilder {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            flush_interval: Duration::from_secs(5),
            diagnostic_recording_interval: Some(Duration::from_secs(900)),
            all_attributes_private: false,
            private_attributes: Vec::new(),
            inline_contexts: false,
            events_uri: "https://events.example.com/bulk".to_string(),
            diagnostic_uri: "https://events.example.com/diagnostic".to_string(),
            worker_count: DEFAULT_WORKER_COUNT,
            batch_drain: DEFAULT_BATCH_DRAIN,
        }
    }
}

impl EventsConfigBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn diagnostics_disabled(mut self) -> Self {
        self.diagnostic_recording_interval = None;
        self
    }

    pub fn diagnostic_recording_interval(mut self, interval: Duration) -> Self {
        self.diagnostic_recording_interval = Some(interval);
        self
    }

    pub fn all_attributes_private(mut self, value: bool) -> Self {
        self.all_attributes_private = value;
        self
    }

    pub fn private_attributes(mut self, attrs: Vec<String>) -> Self {
        self.private_attributes = attrs;
        self
    }

    pub fn inline_contexts(mut self, value: bool) -> Self {
        self.inline_contexts = value;
        self
    }

    pub fn events_uri(mut self, uri: impl Into<String>) -> Self {
        self.events_uri = uri.into();
        self
    }

    pub fn diagnostic_uri(mut self, uri: impl Into<String>) -> Self {
        self.diagnostic_uri = uri.into();
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn batch_drain(mut self, count: usize) -> Self {
        self.batch_drain = count;
        self
    }

    pub fn build(self) -> ConfigResult<EventsConfig> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        if self.events_uri.is_empty() {
            return Err(ConfigError::EmptyEventsUri);
        }
        Ok(EventsConfig {
            capacity: self.capacity,
            flush_interval: self.flush_interval,
            diagnostic_recording_interval: self.diagnostic_recording_interval,
            all_attributes_private: self.all_attributes_private,
            private_attributes: self.private_attributes,
            inline_contexts: self.inline_contexts,
            events_uri: self.events_uri,
            diagnostic_uri: self.diagnostic_uri,
            worker_count: self.worker_count,
            batch_drain: self.batch_drain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        let err = EventsConfig::builder().capacity(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroCapacity));
    }

    #[test]
    fn defaults_to_five_workers() {
        let cfg = EventsConfig::builder().build().unwrap();
        assert_eq!(cfg.worker_count, 5);
    }
}
