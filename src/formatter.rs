//! Pure serialization of a batch of events plus a summary into the wire
//! JSON array. No I/O, no blocking, no shared state — a pure function of
//! `(events, summary, config)`, which makes golden-file testing trivial.

use crate::config::EventsConfig;
use crate::event::{Context, Event};
use crate::summarizer::SummarySnapshot;
use serde_json::{json, Map, Value};

/// `writeOutputEvents`: serializes `events` then, if `summary` is
/// non-empty, one trailing `summary` pseudo-event. Returns the number of
/// JSON array items written (the summary counts as one).
pub fn write_output_events(events: &[Event], summary: &SummarySnapshot, config: &EventsConfig) -> (Vec<u8>, usize) {
    let mut items: Vec<Value> = Vec::with_capacity(events.len() + 1);

    for event in events {
        if let Some(value) = serialize_event(event, config) {
            items.push(value);
        }
    }

    if !summary.is_empty() {
        items.push(serialize_summary(summary));
    }

    let count = items.len();
    let mut buf = Vec::with_capacity(2_000);
    if serde_json::to_writer(&mut buf, &Value::Array(items)).is_err() {
        buf.clear();
        buf.extend_from_slice(b"[]");
    }
    (buf, count)
}

fn serialize_event(event: &Event, config: &EventsConfig) -> Option<Value> {
    match event {
        Event::FeatureRequest(fr) => {
            // A plain FeatureRequest only appears in the output if it
            // carried trackEvents; untracked requests only feed the
            // summary.
            if !fr.track_events {
                return None;
            }
            Some(feature_json("feature", fr, config))
        }
        Event::Debug(fr) => Some(feature_json("debug", fr, config)),
        Event::Identify { timestamp, context } => Some(json!({
            "kind": "identify",
            "creationDate": timestamp,
            "context": context_json(context, config),
        })),
        Event::Custom { timestamp, event_key, context, data, metric_value } => {
            let mut obj = Map::new();
            obj.insert("kind".into(), json!("custom"));
            obj.insert("creationDate".into(), json!(timestamp));
            obj.insert("key".into(), json!(event_key));
            obj.insert("context".into(), context_json(context, config));
            if let Some(d) = data {
                obj.insert("data".into(), d.clone());
            }
            if let Some(mv) = metric_value {
                obj.insert("metricValue".into(), json!(mv));
            }
            Some(Value::Object(obj))
        }
        Event::Index { timestamp, context } => Some(json!({
            "kind": "index",
            "creationDate": timestamp,
            "context": context_json(context, config),
        })),
    }
}

fn feature_json(kind: &str, fr: &crate::event::FeatureRequestEvent, config: &EventsConfig) -> Value {
    let mut obj = Map::new();
    obj.insert("kind".into(), json!(kind));
    obj.insert("creationDate".into(), json!(fr.timestamp));
    obj.insert("key".into(), json!(fr.flag_key));
    if let Some(v) = fr.flag_version {
        obj.insert("version".into(), json!(v));
    }
    if let Some(v) = fr.variation {
        obj.insert("variation".into(), json!(v));
    }
    obj.insert("value".into(), fr.value.clone());
    obj.insert("default".into(), fr.default_value.clone());
    if let Some(p) = &fr.prereq_of_key {
        obj.insert("prereqOf".into(), json!(p));
    }
    if let Some(reason) = &fr.reason {
        obj.insert("reason".into(), reason.clone());
    }
    if config.inline_contexts {
        obj.insert("context".into(), context_json(&fr.context, config));
    } else {
        obj.insert("contextKeys".into(), context_keys_json(&fr.context));
    }
    Value::Object(obj)
}

fn serialize_summary(summary: &SummarySnapshot) -> Value {
    let mut features = Map::new();
    for (flag_key, entry) in &summary.flags {
        let counters: Vec<Value> = entry
            .counters
            .iter()
            .map(|(key, counter)| {
                let mut c = Map::new();
                if let Some(v) = key.variation {
                    c.insert("variation".into(), json!(v));
                } else {
                    c.insert("unknown".into(), json!(true));
                }
                if let Some(v) = key.flag_version {
                    c.insert("version".into(), json!(v));
                }
                c.insert("value".into(), counter.value.clone());
                c.insert("count".into(), json!(counter.count));
                Value::Object(c)
            })
            .collect();

        features.insert(
            flag_key.clone(),
            json!({
                "default": entry.default_value,
                "contextKinds": entry.context_kinds.iter().collect::<Vec<_>>(),
                "counters": counters,
            }),
        );
    }

    json!({
        "kind": "summary",
        "startDate": summary.start_time,
        "endDate": summary.end_time,
        "features": features,
    })
}

fn context_keys_json(context: &Context) -> Value {
    json!({ context.kind.clone(): context.fully_qualified_key })
}

fn context_json(context: &Context, config: &EventsConfig) -> Value {
    let mut obj = Map::new();
    obj.insert("kind".into(), json!(context.kind));
    obj.insert("key".into(), json!(context.fully_qualified_key));
    for (attr_key, attr_value) in &context.attributes {
        if config.all_attributes_private || config.private_attributes.iter().any(|p| p == attr_key) {
            continue;
        }
        obj.insert(attr_key.clone(), attr_value.clone());
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FeatureRequestEvent;
    use serde_json::json;

    fn config() -> EventsConfig {
        EventsConfig::builder().build().unwrap()
    }

    fn ctx() -> Context {
        Context::new("user-key", "user")
    }

    #[test]
    fn untracked_feature_request_is_summary_only() {
        let fr = FeatureRequestEvent {
            timestamp: 1,
            flag_key: "f".into(),
            context: ctx(),
            flag_version: Some(1),
            variation: Some(0),
            value: json!(true),
            default_value: json!(false),
            prereq_of_key: None,
            track_events: false,
            debug_events_until: None,
            reason: None,
        };
        let mut summary = SummarySnapshot::default();
        summary.start_time = 1;
        summary.end_time = 1;
        summary.flags.insert(
            "f".into(),
            crate::summarizer::SummaryEntry {
                default_value: json!(false),
                counters: Default::default(),
                context_kinds: Default::default(),
            },
        );

        let events = vec![Event::FeatureRequest(fr)];
        let (bytes, count) = write_output_events(&events, &summary, &config());
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(count, 1);
        assert!(parsed.as_array().unwrap().iter().all(|v| v["kind"] != "feature"));
        assert_eq!(parsed[0]["kind"], "summary");
    }

    #[test]
    fn redacts_private_attributes() {
        let cfg = EventsConfig::builder().private_attributes(vec!["email".into()]).build().unwrap();
        let context = ctx().with_attribute("email", "a@b.com").with_attribute("plan", "gold");
        let value = context_json(&context, &cfg);
        assert!(value.get("email").is_none());
        assert_eq!(value["plan"], "gold");
    }

    #[test]
    fn roundtrips_through_json() {
        let events = vec![Event::Index { timestamp: 5, context: ctx() }];
        let (bytes, count) = write_output_events(&events, &SummarySnapshot::default(), &config());
        assert_eq!(count, 1);
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed[0]["kind"], "index");
    }
}
