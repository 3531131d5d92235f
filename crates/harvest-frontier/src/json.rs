// SPDX-License-Identifier: MIT OR Apache-2.0
//! JSON-file frontier backend.
//!
//! The whole [`FrontierCore`] serializes to a single canonical JSON blob.
//! Writes are atomic at the file level (write-to-temp + rename), so
//! concurrent readers see either the previous or the next snapshot, never
//! a partial one. Unreadable state recovers to empty rather than failing
//! the run.

use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::store::{
    FrontierCore, FrontierError, FrontierSnapshot, FrontierTuning, RecordedFetch, SkipDecision,
    UrlRow,
};

/// Frontier store persisted as one JSON file.
#[derive(Debug)]
pub struct JsonFrontier {
    core: FrontierCore,
    path: PathBuf,
    tuning: FrontierTuning,
    recovered_from_corrupt_state: bool,
}

impl JsonFrontier {
    /// Open (or initialize) the frontier at `path`.
    ///
    /// A missing file starts empty; a corrupt file starts empty and sets
    /// [`JsonFrontier::recovered_from_corrupt_state`].
    ///
    /// # Errors
    ///
    /// [`FrontierError::Io`] only for I/O failures other than
    /// file-not-found.
    pub fn open(path: impl AsRef<Path>, tuning: FrontierTuning) -> Result<Self, FrontierError> {
        let path = path.as_ref().to_path_buf();
        let (core, recovered) = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<FrontierCore>(&raw) {
                Ok(core) => (core, false),
                Err(err) => {
                    warn!(path = %path.display(), %err, "corrupt frontier state; starting empty");
                    (FrontierCore::default(), true)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                (FrontierCore::default(), false)
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            core,
            path,
            tuning,
            recovered_from_corrupt_state: recovered,
        })
    }

    /// Whether the last open had to discard corrupt state.
    #[must_use]
    pub fn recovered_from_corrupt_state(&self) -> bool {
        self.recovered_from_corrupt_state
    }

    /// Flush the current state atomically.
    ///
    /// # Errors
    ///
    /// [`FrontierError::Io`] / [`FrontierError::Json`] on failure.
    pub fn persist(&self) -> Result<(), FrontierError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&self.core)?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(body.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path).map_err(|e| FrontierError::Io(e.error))?;
        Ok(())
    }

    /// See [`FrontierCore::should_skip_query_at`].
    #[must_use]
    pub fn should_skip_query(&self, product_id: &str, query: &str, force: bool) -> bool {
        self.core
            .should_skip_query_at(product_id, query, force, Utc::now(), &self.tuning)
    }

    /// Record a query and flush.
    ///
    /// # Errors
    ///
    /// Persistence failures propagate; the in-memory update still stands.
    pub fn record_query(
        &mut self,
        product_id: &str,
        query: &str,
        provider: &str,
        fields: &[String],
        result_url_count: u32,
    ) -> Result<(), FrontierError> {
        self.core
            .record_query_at(product_id, query, provider, fields, result_url_count, Utc::now());
        self.persist()
    }

    /// See [`FrontierCore::should_skip_url_at`].
    #[must_use]
    pub fn should_skip_url(&self, url: &str) -> SkipDecision {
        self.core.should_skip_url_at(url, Utc::now(), &self.tuning)
    }

    /// Record a fetch and flush.
    ///
    /// # Errors
    ///
    /// [`FrontierError::InvalidUrl`] or persistence failures.
    pub fn record_fetch(
        &mut self,
        product_id: &str,
        url: &str,
        fetch: &RecordedFetch,
    ) -> Result<UrlRow, FrontierError> {
        let row = self
            .core
            .record_fetch_at(product_id, url, fetch, Utc::now(), &self.tuning)?;
        self.persist()?;
        Ok(row)
    }

    /// See [`FrontierCore::rank_penalty_for_url_at`].
    #[must_use]
    pub fn rank_penalty_for_url(&self, url: &str) -> f64 {
        self.core.rank_penalty_for_url_at(url, Utc::now())
    }

    /// See [`FrontierCore::snapshot_for_product`].
    #[must_use]
    pub fn snapshot_for_product(&self, product_id: &str) -> FrontierSnapshot {
        self.core.snapshot_for_product(product_id)
    }

    /// Read access to the underlying state (tests, parity checks).
    #[must_use]
    pub fn core(&self) -> &FrontierCore {
        &self.core
    }

    /// Mutable access for time-injected testing.
    #[must_use]
    pub fn core_mut(&mut self) -> &mut FrontierCore {
        &mut self.core
    }

    /// The tuning this store was opened with.
    #[must_use]
    pub fn tuning(&self) -> &FrontierTuning {
        &self.tuning
    }
}
