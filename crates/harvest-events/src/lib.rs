// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-events
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use harvest_core::events::EventEnvelope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::warn;

/// Default broadcast channel capacity.
const DEFAULT_BUS_CAPACITY: usize = 256;

/// Errors from event recording.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Filesystem failure while appending or flushing.
    #[error("event log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// An envelope could not be serialized.
    #[error("failed to serialize event: {0}")]
    Json(#[from] serde_json::Error),

    /// An envelope violated the five-key contract.
    #[error("malformed envelope: {reason}")]
    Malformed {
        /// What was wrong.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Rollup
// ---------------------------------------------------------------------------

/// Start/end timestamps for one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StageTiming {
    /// When the stage first started this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage last completed this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// The `run.json` rollup: counters, stage timings, identity metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRollup {
    /// Run identifier.
    pub run_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Monotonic counters (`pages_checked`, `fetched_ok`, ...).
    pub counters: BTreeMap<String, u64>,
    /// Stage name → timing.
    pub stages: BTreeMap<String, StageTiming>,
    /// Identity metadata recorded by the runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<serde_json::Value>,
    /// Startup cost measurements in milliseconds, by label.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub startup_ms: BTreeMap<String, u64>,
}

impl RunRollup {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            started_at: Utc::now(),
            counters: BTreeMap::new(),
            stages: BTreeMap::new(),
            identity: None,
            startup_ms: BTreeMap::new(),
        }
    }
}

/// Events whose emission auto-bumps a rollup counter.
fn counter_for_event(event: &str) -> Option<&'static str> {
    match event {
        "url_checked" => Some("pages_checked"),
        "fetch_completed" => Some("fetched_ok"),
        "fetch_failed" => Some("fetch_failed"),
        "parse_completed" => Some("parse_completed"),
        "field_filled" => Some("fields_filled"),
        "indexed_new" => Some("docs_indexed"),
        "dedupe_hit" => Some("dedupe_hits"),
        "dedupe_updated" => Some("dedupe_updated"),
        "query_issued" => Some("queries_issued"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// RunLog
// ---------------------------------------------------------------------------

struct LogInner {
    file: File,
    rollup: RunRollup,
}

/// Append-only event log for one run.
///
/// Emission is serialized through a mutex so NDJSON lines land in emission
/// order; the broadcast side never blocks the writer.
pub struct RunLog {
    run_id: String,
    dir: PathBuf,
    inner: Mutex<LogInner>,
    bus: broadcast::Sender<EventEnvelope>,
    dropped: Arc<AtomicU64>,
}

impl RunLog {
    /// File name of the NDJSON stream inside the run directory.
    pub const EVENTS_FILE: &'static str = "run_events.ndjson";
    /// File name of the rollup inside the run directory.
    pub const ROLLUP_FILE: &'static str = "run.json";

    /// Create (or append to) the log for `run_id` inside `dir`.
    ///
    /// # Errors
    ///
    /// [`EventError::Io`] when the directory cannot be created or the
    /// stream cannot be opened.
    pub fn create(dir: impl AsRef<Path>, run_id: impl Into<String>) -> Result<Self, EventError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let run_id = run_id.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(Self::EVENTS_FILE))?;
        let (bus, _) = broadcast::channel(DEFAULT_BUS_CAPACITY);
        Ok(Self {
            inner: Mutex::new(LogInner {
                file,
                rollup: RunRollup::new(&run_id),
            }),
            run_id,
            dir,
            bus,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// The run this log belongs to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Emit an event: append the NDJSON line, update the rollup, and
    /// broadcast to subscribers.
    ///
    /// # Errors
    ///
    /// [`EventError::Malformed`] when `run_id` is empty;
    /// [`EventError::Io`]/[`EventError::Json`] on write failures.
    pub fn emit(
        &self,
        stage: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<EventEnvelope, EventError> {
        let envelope = EventEnvelope::new(self.run_id.clone(), stage, event, payload);
        self.emit_envelope(envelope)
    }

    /// Emit a pre-built envelope.
    ///
    /// # Errors
    ///
    /// [`EventError::Malformed`] when the envelope violates the contract.
    pub fn emit_envelope(&self, envelope: EventEnvelope) -> Result<EventEnvelope, EventError> {
        if !envelope.is_well_formed() {
            return Err(EventError::Malformed {
                reason: "run_id empty or payload not an object".into(),
            });
        }
        let line = serde_json::to_string(&envelope)?;
        {
            let mut inner = self.inner.lock().expect("event log poisoned");
            inner.file.write_all(line.as_bytes())?;
            inner.file.write_all(b"\n")?;

            if let Some(counter) = counter_for_event(&envelope.event) {
                *inner.rollup.counters.entry(counter.to_string()).or_insert(0) += 1;
            }
            let stage = inner
                .rollup
                .stages
                .entry(envelope.stage.clone())
                .or_default();
            if stage.started_at.is_none() {
                stage.started_at = Some(envelope.ts);
            }
            stage.ended_at = Some(envelope.ts);
        }
        if self.bus.receiver_count() > 0 && self.bus.send(envelope.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(envelope)
    }

    /// Subscribe to the live event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.bus.subscribe()
    }

    /// Bump a rollup counter directly (for counters with no 1:1 event).
    pub fn bump_counter(&self, name: &str, by: u64) {
        let mut inner = self.inner.lock().expect("event log poisoned");
        *inner.rollup.counters.entry(name.to_string()).or_insert(0) += by;
    }

    /// Record a startup measurement.
    pub fn record_startup_ms(&self, label: &str, ms: u64) {
        let mut inner = self.inner.lock().expect("event log poisoned");
        inner.rollup.startup_ms.insert(label.to_string(), ms);
    }

    /// Attach identity metadata to the rollup.
    pub fn set_identity(&self, identity: serde_json::Value) {
        let mut inner = self.inner.lock().expect("event log poisoned");
        inner.rollup.identity = Some(identity);
    }

    /// A copy of the current rollup.
    #[must_use]
    pub fn rollup(&self) -> RunRollup {
        self.inner.lock().expect("event log poisoned").rollup.clone()
    }

    /// Events lost to lagging subscribers.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flush `run.json` atomically (write-to-temp + rename).
    ///
    /// # Errors
    ///
    /// [`EventError::Io`]/[`EventError::Json`] on failure.
    pub fn flush_rollup(&self) -> Result<(), EventError> {
        let rollup = self.rollup();
        let body = serde_json::to_string_pretty(&rollup)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(body.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.persist(self.dir.join(Self::ROLLUP_FILE))
            .map_err(|e| EventError::Io(e.error))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read every envelope from an NDJSON stream.
///
/// Unknown event names are kept (consumers treat the name set as open for
/// reading); unparseable lines are skipped with a warning rather than
/// failing the whole read.
///
/// # Errors
///
/// [`EventError::Io`] when the file cannot be opened.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<EventEnvelope>, EventError> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventEnvelope>(&line) {
            Ok(env) => out.push(env),
            Err(err) => {
                warn!(line = idx + 1, %err, "skipping unparseable event line");
            }
        }
    }
    Ok(out)
}
