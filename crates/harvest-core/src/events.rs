// SPDX-License-Identifier: MIT OR Apache-2.0
//! The five-key event envelope.
//!
//! Every event the system emits is one NDJSON line of the form
//! `{run_id, ts, stage, event, payload}`. `payload` is always an object —
//! consumers unwrap it and never inspect top-level keys beyond the five.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One emitted event. All five keys are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventEnvelope {
    /// Run this event belongs to. Never empty.
    pub run_id: String,
    /// Emission time (RFC3339, UTC).
    pub ts: DateTime<Utc>,
    /// Pipeline stage that emitted the event.
    pub stage: String,
    /// Event name from the closed set.
    pub event: String,
    /// Event-specific payload. Always a JSON object, possibly empty.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build an envelope, coercing a non-object payload to an empty object.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        stage: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let payload = if payload.is_object() {
            payload
        } else {
            serde_json::json!({})
        };
        Self {
            run_id: run_id.into(),
            ts: Utc::now(),
            stage: stage.into(),
            event: event.into(),
            payload,
        }
    }

    /// Validate the envelope contract: non-empty `run_id`, object payload.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.run_id.is_empty() && self.payload.is_object()
    }
}

/// Outcome of indexing a document into the evidence store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DedupeOutcome {
    /// First sighting of this `(content_hash, parser_version)`.
    New,
    /// Identical content already indexed; writes skipped.
    Reused,
    /// Same URL, different content; new doc inserted alongside the old.
    Updated,
}

impl DedupeOutcome {
    /// The fixed event name emitted for this outcome.
    #[must_use]
    pub fn event_name(self) -> &'static str {
        match self {
            DedupeOutcome::New => "indexed_new",
            DedupeOutcome::Reused => "dedupe_hit",
            DedupeOutcome::Updated => "dedupe_updated",
        }
    }
}

/// Well-known stage names used across the pipeline.
pub mod stage {
    /// Query discovery.
    pub const DISCOVERY: &str = "discovery";
    /// Page fetching.
    pub const FETCH: &str = "fetch";
    /// Parsing and chunking.
    pub const PARSE: &str = "parse";
    /// Evidence indexing.
    pub const INDEX: &str = "index";
    /// Consensus and reduction.
    pub const CONSENSUS: &str = "consensus";
    /// Round driving.
    pub const CONVERGENCE: &str = "convergence";
    /// Run bookkeeping.
    pub const RUN: &str = "run";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_always_has_object_payload() {
        let ev = EventEnvelope::new("r1", "fetch", "fetch_completed", serde_json::json!(42));
        assert!(ev.payload.is_object());
        assert!(ev.is_well_formed());
    }

    #[test]
    fn envelope_serializes_all_five_keys() {
        let ev = EventEnvelope::new("r1", "index", "indexed_new", serde_json::json!({"doc_id": "doc_x"}));
        let json = serde_json::to_value(&ev).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["run_id", "ts", "stage", "event", "payload"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert_eq!(obj.len(), 5);
    }

    #[test]
    fn dedupe_event_names_are_fixed() {
        assert_eq!(DedupeOutcome::New.event_name(), "indexed_new");
        assert_eq!(DedupeOutcome::Reused.event_name(), "dedupe_hit");
        assert_eq!(DedupeOutcome::Updated.event_name(), "dedupe_updated");
    }

    #[test]
    fn empty_run_id_is_malformed() {
        let ev = EventEnvelope::new("", "run", "run_started", serde_json::json!({}));
        assert!(!ev.is_well_formed());
    }
}
