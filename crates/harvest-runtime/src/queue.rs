// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-category product queue.
//!
//! One JSON file per category holds every product's processing state.
//! Writes are atomic (write-to-temp + rename); reads recover from
//! truncated JSON by starting empty rather than failing the batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::RuntimeError;

/// Product processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for a runner.
    Pending,
    /// A run is in progress.
    Running,
    /// Finished and publishable.
    Complete,
    /// Finished but aged out; due for refresh.
    Stale,
    /// Gave up after max attempts.
    Failed,
    /// Operator-paused.
    Paused,
}

/// One product's queue row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Product key.
    pub product_id: String,
    /// Seed object key (opaque to the queue).
    pub s3key: String,
    /// Processing status.
    pub status: QueueStatus,
    /// Scheduling priority; higher runs earlier.
    pub priority: i32,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
    /// Attempts so far.
    pub retry_count: u32,
    /// Attempt cap.
    pub max_attempts: u32,
    /// Earliest next attempt, when backing off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Flags needing operator attention (`identity_conflict`, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dirty_flags: Vec<String>,
}

/// The queue file body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    /// Category slug.
    pub category: String,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Product key → row.
    pub products: BTreeMap<String, QueueEntry>,
}

/// File-backed queue store.
#[derive(Debug)]
pub struct QueueStore {
    path: PathBuf,
    state: QueueState,
    recovered_from_corrupt_state: bool,
}

impl QueueStore {
    /// Open (or initialize) the queue for `category` at `path`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Io`] for I/O failures other than file-not-found.
    pub fn open(path: impl AsRef<Path>, category: &str) -> Result<Self, RuntimeError> {
        let path = path.as_ref().to_path_buf();
        let empty = QueueState {
            category: category.to_string(),
            updated_at: Utc::now(),
            products: BTreeMap::new(),
        };
        let (state, recovered) = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<QueueState>(&raw) {
                Ok(state) => (state, false),
                Err(err) => {
                    warn!(path = %path.display(), %err, "corrupt queue state; starting empty");
                    (empty, true)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (empty, false),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, state, recovered_from_corrupt_state: recovered })
    }

    /// Whether the last open had to discard corrupt state.
    #[must_use]
    pub fn recovered_from_corrupt_state(&self) -> bool {
        self.recovered_from_corrupt_state
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> &QueueState {
        &self.state
    }

    /// Insert or replace a product row and flush.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Io`] on persistence failure.
    pub fn upsert(&mut self, entry: QueueEntry) -> Result<(), RuntimeError> {
        self.state.products.insert(entry.product_id.clone(), entry);
        self.persist()
    }

    /// Transition a product's status and flush. Unknown products are
    /// created as minimal rows.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Io`] on persistence failure.
    pub fn set_status(&mut self, product_id: &str, status: QueueStatus) -> Result<(), RuntimeError> {
        let now = Utc::now();
        let entry = self
            .state
            .products
            .entry(product_id.to_string())
            .or_insert_with(|| QueueEntry {
                product_id: product_id.to_string(),
                s3key: String::new(),
                status: QueueStatus::Pending,
                priority: 0,
                updated_at: now,
                retry_count: 0,
                max_attempts: 3,
                next_retry_at: None,
                last_error: None,
                dirty_flags: vec![],
            });
        entry.status = status;
        entry.updated_at = now;
        if status == QueueStatus::Running {
            entry.retry_count += 1;
        }
        self.persist()
    }

    /// Record a failure: backs off or fails permanently past the cap.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Io`] on persistence failure.
    pub fn record_failure(&mut self, product_id: &str, error: &str) -> Result<(), RuntimeError> {
        let now = Utc::now();
        if let Some(entry) = self.state.products.get_mut(product_id) {
            entry.last_error = Some(error.to_string());
            entry.updated_at = now;
            if entry.retry_count >= entry.max_attempts {
                entry.status = QueueStatus::Failed;
                entry.next_retry_at = None;
            } else {
                entry.status = QueueStatus::Pending;
                let backoff_mins = 5_i64 << entry.retry_count.min(6);
                entry.next_retry_at = Some(now + chrono::Duration::minutes(backoff_mins));
            }
        }
        self.persist()
    }

    /// Add a dirty flag (deduplicated) and flush.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Io`] on persistence failure.
    pub fn add_dirty_flag(&mut self, product_id: &str, flag: &str) -> Result<(), RuntimeError> {
        if let Some(entry) = self.state.products.get_mut(product_id)
            && !entry.dirty_flags.iter().any(|f| f == flag)
        {
            entry.dirty_flags.push(flag.to_string());
            entry.updated_at = Utc::now();
        }
        self.persist()
    }

    /// The next product eligible to run: pending, past any backoff,
    /// highest priority first, then oldest update.
    #[must_use]
    pub fn next_pending(&self, now: DateTime<Utc>) -> Option<&QueueEntry> {
        self.state
            .products
            .values()
            .filter(|e| e.status == QueueStatus::Pending)
            .filter(|e| e.next_retry_at.is_none_or(|t| t <= now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.updated_at.cmp(&b.updated_at))
            })
    }

    fn persist(&mut self) -> Result<(), RuntimeError> {
        self.state.updated_at = Utc::now();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&self.state)?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(body.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path).map_err(|e| RuntimeError::Io(e.error))?;
        Ok(())
    }
}
