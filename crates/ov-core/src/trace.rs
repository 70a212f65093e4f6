//! Per-request trace collection.
//!
//! A [`RequestTrace`] rides along a request's control flow collecting
//! timed events, cumulative counters, and final gauges, then renders a
//! stable `schema_version = "v1"` JSON document. Cloning is cheap; all
//! clones feed the same underlying collector.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Counter keys always present in the summary (as `null` when unused).
const WELL_KNOWN_COUNTERS: [&str; 9] = [
    "vector.search_calls",
    "vector.candidates_scored",
    "vector.candidates_after_threshold",
    "vector.returned",
    "vector.vectors_scanned",
    "token_usage.input_tokens",
    "token_usage.output_tokens",
    "token_usage.total_tokens",
    "memory.memories_extracted",
];

/// Gauge keys always present in the summary (as `null` when unused).
const WELL_KNOWN_GAUGES: [&str; 4] = [
    "semantic_nodes.total",
    "semantic_nodes.done",
    "semantic_nodes.pending",
    "semantic_nodes.in_progress",
];

/// One timed event.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub stage: String,
    pub name: String,
    /// Milliseconds since the request started.
    pub ts_ms: u64,
    pub status: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub attrs: Value,
}

#[derive(Debug)]
struct TraceInner {
    started: Instant,
    events: Vec<TraceEvent>,
    counters: BTreeMap<String, i64>,
    gauges: BTreeMap<String, i64>,
    max_events: usize,
    dropped: usize,
}

/// Cheaply cloneable per-request trace collector.
#[derive(Debug, Clone)]
pub struct RequestTrace {
    inner: Arc<Mutex<TraceInner>>,
}

impl RequestTrace {
    pub fn new(max_events: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TraceInner {
                started: Instant::now(),
                events: Vec::new(),
                counters: BTreeMap::new(),
                gauges: BTreeMap::new(),
                max_events,
                dropped: 0,
            })),
        }
    }

    /// Record a timed event. Events past the cap are counted, not kept.
    pub fn event(&self, stage: &str, name: &str, status: &str, attrs: Value) {
        let mut inner = self.inner.lock().unwrap();
        if inner.events.len() >= inner.max_events {
            inner.dropped += 1;
            return;
        }
        let ts_ms = inner.started.elapsed().as_millis() as u64;
        inner.events.push(TraceEvent {
            stage: stage.to_string(),
            name: name.to_string(),
            ts_ms,
            status: status.to_string(),
            attrs,
        });
    }

    /// Add to a cumulative counter.
    pub fn incr(&self, key: &str, delta: i64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.counters.entry(key.to_string()).or_insert(0) += delta;
    }

    /// Set a final-snapshot gauge.
    pub fn gauge(&self, key: &str, value: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.gauges.insert(key.to_string(), value);
    }

    /// Current value of a counter (0 when never incremented).
    pub fn counter(&self, key: &str) -> i64 {
        self.inner.lock().unwrap().counters.get(key).copied().unwrap_or(0)
    }

    /// Number of events recorded for a given stage.
    pub fn events_in_stage(&self, stage: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.stage == stage)
            .count()
    }

    /// Render the stable v1 document.
    pub fn finish(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let mut summary = serde_json::Map::new();
        for key in WELL_KNOWN_COUNTERS {
            summary.insert(key.to_string(), opt_i64(inner.counters.get(key)));
        }
        for key in WELL_KNOWN_GAUGES {
            summary.insert(key.to_string(), opt_i64(inner.gauges.get(key)));
        }
        // Ad-hoc keys ride along after the well-known set.
        for (key, v) in inner.counters.iter() {
            summary.entry(key.clone()).or_insert_with(|| json!(v));
        }
        for (key, v) in inner.gauges.iter() {
            summary.entry(key.clone()).or_insert_with(|| json!(v));
        }
        summary.insert("events_truncated".into(), json!(inner.dropped > 0));
        summary.insert("dropped_events".into(), json!(inner.dropped));
        json!({
            "schema_version": "v1",
            "summary": Value::Object(summary),
            "events": inner.events,
        })
    }
}

fn opt_i64(v: Option<&i64>) -> Value {
    match v {
        Some(n) => json!(n),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_shape() {
        let trace = RequestTrace::new(100);
        trace.event("search", "embed_query", "ok", Value::Null);
        trace.incr("vector.search_calls", 1);
        trace.gauge("semantic_nodes.total", 5);
        let doc = trace.finish();
        assert_eq!(doc["schema_version"], "v1");
        assert_eq!(doc["summary"]["vector.search_calls"], 1);
        assert_eq!(doc["summary"]["semantic_nodes.total"], 5);
        assert_eq!(doc["events"].as_array().unwrap().len(), 1);
        assert_eq!(doc["events"][0]["stage"], "search");
    }

    #[test]
    fn test_unused_fields_are_null() {
        let doc = RequestTrace::new(10).finish();
        assert!(doc["summary"]["token_usage.total_tokens"].is_null());
        assert!(doc["summary"]["memory.memories_extracted"].is_null());
        assert!(doc["summary"]["semantic_nodes.done"].is_null());
        assert_eq!(doc["summary"]["events_truncated"], false);
        assert_eq!(doc["summary"]["dropped_events"], 0);
    }

    #[test]
    fn test_event_cap() {
        let trace = RequestTrace::new(2);
        for i in 0..5 {
            trace.event("s", &format!("e{i}"), "ok", Value::Null);
        }
        let doc = trace.finish();
        assert_eq!(doc["events"].as_array().unwrap().len(), 2);
        assert_eq!(doc["summary"]["events_truncated"], true);
        assert_eq!(doc["summary"]["dropped_events"], 3);
    }

    #[test]
    fn test_counters_accumulate() {
        let trace = RequestTrace::new(10);
        trace.incr("vector.candidates_scored", 7);
        trace.incr("vector.candidates_scored", 3);
        assert_eq!(trace.counter("vector.candidates_scored"), 10);
    }

    #[test]
    fn test_clones_share_state() {
        let trace = RequestTrace::new(10);
        let clone = trace.clone();
        clone.incr("token_usage.total_tokens", 42);
        assert_eq!(trace.counter("token_usage.total_tokens"), 42);
    }

    #[test]
    fn test_events_in_stage() {
        let trace = RequestTrace::new(10);
        trace.event("summarise", "file_a", "ok", Value::Null);
        trace.event("summarise", "file_b", "ok", Value::Null);
        trace.event("embed", "batch", "ok", Value::Null);
        assert_eq!(trace.events_in_stage("summarise"), 2);
        assert_eq!(trace.events_in_stage("embed"), 1);
        assert_eq!(trace.events_in_stage("none"), 0);
    }

    #[test]
    fn test_adhoc_keys_survive() {
        let trace = RequestTrace::new(10);
        trace.incr("parser.files_emitted", 3);
        let doc = trace.finish();
        assert_eq!(doc["summary"]["parser.files_emitted"], 3);
    }

    #[test]
    fn test_event_attrs_serialised() {
        let trace = RequestTrace::new(10);
        trace.event("route", "recurse", "ok", json!({"root": "viking://resources/doc"}));
        let doc = trace.finish();
        assert_eq!(doc["events"][0]["attrs"]["root"], "viking://resources/doc");
    }
}
