//! The analytics event sum type and the evaluation context it carries.
//!
//! `Event` is an `enum` rather than a trait-object hierarchy: the dispatcher
//! matches on it exhaustively instead of downcasting, per the pipeline's
//! "sum-type events" design guidance.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Millisecond epoch timestamp, matching the wire format's 64-bit
/// timestamps.
pub type Timestamp = i64;

/// Evaluation subject. The pipeline never inspects attributes beyond
/// `fully_qualified_key` (identity for deduplication/summarization) and
/// `kind` (used only to populate a summary entry's `contextKinds`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub fully_qualified_key: String,
    pub kind: String,
    /// Flat attribute bag, used only by the formatter for redaction.
    /// Nested/multi-kind attribute trees are out of scope.
    pub attributes: HashMap<String, Value>,
}

impl Context {
    pub fn new(fully_qualified_key: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            fully_qualified_key: fully_qualified_key.into(),
            kind: kind.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// One input (or synthesized) analytics event.
#[derive(Debug, Clone)]
pub enum Event {
    FeatureRequest(FeatureRequestEvent),
    Identify {
        timestamp: Timestamp,
        context: Context,
    },
    Custom {
        timestamp: Timestamp,
        event_key: String,
        context: Context,
        data: Option<Value>,
        metric_value: Option<f64>,
    },
    /// Synthesized by the dispatcher on first sighting of a context in a
    /// flush window. Never produced by application code.
    Index {
        timestamp: Timestamp,
        context: Context,
    },
    /// Synthesized time-limited full copy of a `FeatureRequest`, emitted
    /// when `shouldDebug` admits it.
    Debug(FeatureRequestEvent),
}

#[derive(Debug, Clone)]
pub struct FeatureRequestEvent {
    pub timestamp: Timestamp,
    pub flag_key: String,
    pub context: Context,
    pub flag_version: Option<i64>,
    pub variation: Option<i64>,
    pub value: Value,
    pub default_value: Value,
    pub prereq_of_key: Option<String>,
    pub track_events: bool,
    pub debug_events_until: Option<Timestamp>,
    /// Opaque evaluation-reason payload; carried untouched.
    pub reason: Option<Value>,
}

impl FeatureRequestEvent {
    /// Clones the request's fields into a `Debug` event. The `reason`
    /// field is preserved across the clone (an open question in the
    /// originating spec, resolved in favor of preservation).
    pub fn to_debug(&self) -> Event {
        Event::Debug(self.clone())
    }
}

impl Event {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Event::FeatureRequest(fr) | Event::Debug(fr) => fr.timestamp,
            Event::Identify { timestamp, .. } => *timestamp,
            Event::Custom { timestamp, .. } => *timestamp,
            Event::Index { timestamp, .. } => *timestamp,
        }
    }

    pub fn context(&self) -> &Context {
        match self {
            Event::FeatureRequest(fr) | Event::Debug(fr) => &fr.context,
            Event::Identify { context, .. } => context,
            Event::Custom { context, .. } => context,
            Event::Index { context, .. } => context,
        }
    }
}
