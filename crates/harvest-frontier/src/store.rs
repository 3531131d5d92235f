// SPDX-License-Identifier: MIT OR Apache-2.0
//! Frontier row types and the shared in-memory state machine.
//!
//! Both persistence backends wrap [`FrontierCore`]: the JSON backend
//! snapshots it to a single file, the SQLite backend mirrors its rows
//! write-through. All cooldown/dedupe semantics live here so the backends
//! cannot drift apart.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cooldown::{
    CooldownDecision, CooldownReason, CooldownTuning, FetchHistory, decide, path_is_dead,
};
use harvest_url::canonicalize;

/// Errors from frontier operations.
#[derive(Debug, thiserror::Error)]
pub enum FrontierError {
    /// The URL could not be canonicalized.
    #[error("not a canonicalizable URL: {0}")]
    InvalidUrl(String),

    /// Filesystem failure in a persistence backend.
    #[error("frontier I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure in the JSON backend.
    #[error("frontier serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite failure in the SQLite backend.
    #[error("frontier database failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Tuning knobs for frontier behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierTuning {
    /// Cooldown decision-table durations.
    pub cooldown: CooldownTuning,
    /// Query dedupe window in seconds.
    pub query_cooldown_seconds: u64,
}

impl Default for FrontierTuning {
    fn default() -> Self {
        Self {
            cooldown: CooldownTuning::default(),
            query_cooldown_seconds: 3600,
        }
    }
}

/// An installed cooldown on a URL row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cooldown {
    /// Reason from the closed set.
    pub reason: CooldownReason,
    /// Configured duration in seconds.
    pub seconds: u64,
    /// Expiry timestamp.
    pub until_ts: DateTime<Utc>,
}

impl Cooldown {
    /// Whether the cooldown is still in force at `now`.
    #[must_use]
    pub fn active(&self, now: DateTime<Utc>) -> bool {
        self.until_ts > now
    }
}

/// Persisted state for one `(product, canonical URL)` pair.
///
/// Rows are created on first record and mutated by every fetch; they are
/// never deleted — cooldowns expire instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlRow {
    /// Owning product.
    pub product_id: String,
    /// Canonical URL (the dedupe key).
    pub canonical_url: String,
    /// Normalized host.
    pub domain: String,
    /// Path signature for dead-pattern tracking.
    pub path_signature: String,
    /// First time this URL was recorded.
    pub first_seen_ts: DateTime<Utc>,
    /// Most recent record.
    pub last_seen_ts: DateTime<Utc>,
    /// Status of the most recent fetch.
    pub last_status: u16,
    /// Total 404s recorded.
    pub notfound_count: u32,
    /// Total 403/429s recorded.
    pub blocked_count: u32,
    /// Total successful parses recorded.
    pub parsed_ok_count: u32,
    /// Consecutive 403s ending at the latest fetch.
    pub consecutive_403: u32,
    /// Consecutive 429s ending at the latest fetch.
    pub consecutive_429: u32,
    /// Fields this URL has yielded, deduplicated, sorted.
    pub fields_found: Vec<String>,
    /// Standing cooldown, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<Cooldown>,
    /// Content hash of the most recent successful fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Persisted state for one `(product, normalized query)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRow {
    /// Owning product.
    pub product_id: String,
    /// Trimmed, whitespace-collapsed, lowercased query.
    pub normalized_query: String,
    /// Search provider that ran it.
    pub provider: String,
    /// Fields the query targeted.
    pub fields: Vec<String>,
    /// When the query last ran.
    pub last_run_ts: DateTime<Utc>,
    /// How many result URLs it returned.
    pub result_url_count: u32,
}

/// Aggregate 404/success counts per `(domain, path signature)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PathStats {
    /// 404s under this signature.
    pub notfound: u64,
    /// Successful parses under this signature.
    pub parsed_ok: u64,
}

/// Outcome of a skip check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipDecision {
    /// Whether the URL should be skipped.
    pub skip: bool,
    /// Reason string when skipping.
    pub reason: Option<String>,
}

impl SkipDecision {
    fn go() -> Self {
        Self { skip: false, reason: None }
    }
    fn stop(reason: &str) -> Self {
        Self { skip: true, reason: Some(reason.to_string()) }
    }
}

/// What the caller observed about one fetch.
#[derive(Debug, Clone, Default)]
pub struct RecordedFetch {
    /// HTTP status (0 for transport failure).
    pub status: u16,
    /// Response content type.
    pub content_type: Option<String>,
    /// Fields extracted from the page.
    pub fields_found: Vec<String>,
    /// Extractor confidence, if any.
    pub confidence: Option<f64>,
    /// Content hash of the fetched body.
    pub content_hash: Option<String>,
}

/// Per-product frontier summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FrontierSnapshot {
    /// Queries recorded for the product.
    pub query_count: usize,
    /// URLs recorded for the product.
    pub url_count: usize,
    /// Field key → number of URLs that yielded it.
    pub field_yield: BTreeMap<String, u64>,
}

/// Normalize a query for dedupe: trim, collapse whitespace, lowercase.
#[must_use]
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn url_key(product_id: &str, canonical_url: &str) -> String {
    format!("{product_id}|{canonical_url}")
}

fn query_key(product_id: &str, normalized: &str) -> String {
    format!("{product_id}|{normalized}")
}

fn path_key(domain: &str, signature: &str) -> String {
    format!("{domain}{signature}")
}

// ---------------------------------------------------------------------------
// FrontierCore
// ---------------------------------------------------------------------------

/// The in-memory frontier state shared by both backends.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FrontierCore {
    /// `product|canonical_url` → row.
    pub urls: BTreeMap<String, UrlRow>,
    /// `product|normalized_query` → row.
    pub queries: BTreeMap<String, QueryRow>,
    /// `domain + path_signature` → aggregate counts.
    pub path_stats: BTreeMap<String, PathStats>,
}

impl FrontierCore {
    /// Whether `query` for `product_id` was recorded within the dedupe
    /// window ending at `now`. `force` bypasses the window.
    #[must_use]
    pub fn should_skip_query_at(
        &self,
        product_id: &str,
        query: &str,
        force: bool,
        now: DateTime<Utc>,
        tuning: &FrontierTuning,
    ) -> bool {
        if force {
            return false;
        }
        let normalized = normalize_query(query);
        self.queries
            .get(&query_key(product_id, &normalized))
            .is_some_and(|row| {
                now.signed_duration_since(row.last_run_ts)
                    < Duration::seconds(tuning.query_cooldown_seconds as i64)
            })
    }

    /// Upsert a query row with `now` as the run timestamp.
    pub fn record_query_at(
        &mut self,
        product_id: &str,
        query: &str,
        provider: &str,
        fields: &[String],
        result_url_count: u32,
        now: DateTime<Utc>,
    ) {
        let normalized = normalize_query(query);
        let key = query_key(product_id, &normalized);
        self.queries.insert(
            key,
            QueryRow {
                product_id: product_id.to_string(),
                normalized_query: normalized,
                provider: provider.to_string(),
                fields: fields.to_vec(),
                last_run_ts: now,
                result_url_count,
            },
        );
    }

    /// Consult cooldowns and the dead-pattern heuristic for `url` at `now`.
    #[must_use]
    pub fn should_skip_url_at(
        &self,
        url: &str,
        now: DateTime<Utc>,
        tuning: &FrontierTuning,
    ) -> SkipDecision {
        let canon = canonicalize(url);
        if !canon.is_valid() {
            return SkipDecision::stop("invalid_url");
        }
        // Any product's active cooldown on this canonical URL applies.
        for row in self.urls.values() {
            if row.canonical_url == canon.canonical_url
                && let Some(cd) = &row.cooldown
                && cd.active(now)
            {
                return SkipDecision::stop(cd.reason.as_str());
            }
        }
        let stats = self
            .path_stats
            .get(&path_key(&canon.domain, &canon.path_signature))
            .copied()
            .unwrap_or_default();
        if path_is_dead(stats.notfound, stats.parsed_ok, &tuning.cooldown) {
            return SkipDecision::stop(CooldownReason::PathDeadPattern.as_str());
        }
        SkipDecision::go()
    }

    /// Fold one observed fetch into the frontier at `now`.
    ///
    /// # Errors
    ///
    /// [`FrontierError::InvalidUrl`] when the URL cannot be canonicalized.
    pub fn record_fetch_at(
        &mut self,
        product_id: &str,
        url: &str,
        fetch: &RecordedFetch,
        now: DateTime<Utc>,
        tuning: &FrontierTuning,
    ) -> Result<UrlRow, FrontierError> {
        let canon = canonicalize(url);
        if !canon.is_valid() {
            return Err(FrontierError::InvalidUrl(url.to_string()));
        }
        let key = url_key(product_id, &canon.canonical_url);
        let row = self.urls.entry(key).or_insert_with(|| UrlRow {
            product_id: product_id.to_string(),
            canonical_url: canon.canonical_url.clone(),
            domain: canon.domain.clone(),
            path_signature: canon.path_signature.clone(),
            first_seen_ts: now,
            last_seen_ts: now,
            last_status: 0,
            notfound_count: 0,
            blocked_count: 0,
            parsed_ok_count: 0,
            consecutive_403: 0,
            consecutive_429: 0,
            fields_found: vec![],
            cooldown: None,
            content_hash: None,
        });

        row.last_seen_ts = now;
        row.last_status = fetch.status;
        if let Some(hash) = &fetch.content_hash {
            row.content_hash = Some(hash.clone());
        }
        for field in &fetch.fields_found {
            if !row.fields_found.contains(field) {
                row.fields_found.push(field.clone());
            }
        }
        row.fields_found.sort();

        // Consecutive-run counters feed the backoff exponent with their
        // pre-increment values.
        let prior_403 = row.consecutive_403;
        let prior_429 = row.consecutive_429;
        match fetch.status {
            403 => {
                row.consecutive_403 += 1;
                row.consecutive_429 = 0;
                row.blocked_count += 1;
            }
            429 => {
                row.consecutive_429 += 1;
                row.consecutive_403 = 0;
                row.blocked_count += 1;
            }
            _ => {
                row.consecutive_403 = 0;
                row.consecutive_429 = 0;
            }
        }
        if fetch.status == 404 {
            row.notfound_count += 1;
        }

        let pkey = path_key(&row.domain, &row.path_signature);
        let stats = self.path_stats.entry(pkey).or_default();
        match fetch.status {
            200..=399 => stats.parsed_ok += 1,
            404 => stats.notfound += 1,
            _ => {}
        }
        let path_parsed_ok = stats.parsed_ok;

        let history = FetchHistory {
            notfound_count: row.notfound_count,
            consecutive_403: prior_403,
            consecutive_429: prior_429,
            path_parsed_ok,
        };
        match decide(fetch.status, history, &tuning.cooldown) {
            CooldownDecision::Clear => {
                row.cooldown = None;
                row.parsed_ok_count += 1;
            }
            CooldownDecision::Install { reason, seconds } => {
                row.cooldown = Some(Cooldown {
                    reason,
                    seconds,
                    until_ts: now + Duration::seconds(seconds as i64),
                });
            }
            CooldownDecision::Untouched => {}
        }
        Ok(row.clone())
    }

    /// Ranking penalty in `[-2, 0]` for URLs with recent failures.
    #[must_use]
    pub fn rank_penalty_for_url_at(&self, url: &str, now: DateTime<Utc>) -> f64 {
        let canon = canonicalize(url);
        if !canon.is_valid() {
            return 0.0;
        }
        let mut penalty = 0.0_f64;
        for row in self.urls.values() {
            if row.canonical_url != canon.canonical_url {
                continue;
            }
            penalty += 0.5 * f64::from(row.notfound_count.min(2));
            penalty += 0.25 * f64::from(row.blocked_count.min(4));
            if row.cooldown.is_some_and(|cd| cd.active(now)) {
                penalty += 1.0;
            }
        }
        -penalty.min(2.0)
    }

    /// Per-product summary.
    #[must_use]
    pub fn snapshot_for_product(&self, product_id: &str) -> FrontierSnapshot {
        let mut snap = FrontierSnapshot::default();
        snap.query_count = self
            .queries
            .values()
            .filter(|q| q.product_id == product_id)
            .count();
        for row in self.urls.values().filter(|r| r.product_id == product_id) {
            snap.url_count += 1;
            for field in &row.fields_found {
                *snap.field_yield.entry(field.clone()).or_insert(0) += 1;
            }
        }
        snap
    }

    /// Look up a URL row.
    #[must_use]
    pub fn url_row(&self, product_id: &str, url: &str) -> Option<&UrlRow> {
        let canon = canonicalize(url);
        self.urls.get(&url_key(product_id, &canon.canonical_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> FrontierTuning {
        FrontierTuning {
            cooldown: CooldownTuning {
                base404: 100,
                repeat404: 1000,
                base403: 60,
                base429: 30,
                long410: 9999,
                path_notfound_threshold: 3,
            },
            query_cooldown_seconds: 3600,
        }
    }

    fn fetch(status: u16) -> RecordedFetch {
        RecordedFetch { status, ..RecordedFetch::default() }
    }

    #[test]
    fn query_dedupe_within_window() {
        let mut core = FrontierCore::default();
        let t = tuning();
        let now = Utc::now();
        assert!(!core.should_skip_query_at("p1", "razer viper weight", false, now, &t));
        core.record_query_at("p1", "Razer  Viper   WEIGHT", "default", &[], 5, now);
        // Same query modulo whitespace/case is a duplicate.
        assert!(core.should_skip_query_at("p1", "razer viper weight", false, now, &t));
        assert!(core.should_skip_query_at("p1", "  RAZER viper weight ", false, now, &t));
        // Force bypasses; other products unaffected.
        assert!(!core.should_skip_query_at("p1", "razer viper weight", true, now, &t));
        assert!(!core.should_skip_query_at("p2", "razer viper weight", false, now, &t));
        // Window expiry.
        let later = now + Duration::seconds(3601);
        assert!(!core.should_skip_query_at("p1", "razer viper weight", false, later, &t));
    }

    #[test]
    fn three_404s_escalate_to_repeated() {
        let mut core = FrontierCore::default();
        let t = tuning();
        let now = Utc::now();
        let url = "https://dead.com/p";
        core.record_fetch_at("p1", url, &fetch(404), now, &t).unwrap();
        core.record_fetch_at("p1", url, &fetch(404), now, &t).unwrap();
        let row = core.record_fetch_at("p1", url, &fetch(404), now, &t).unwrap();
        let cd = row.cooldown.unwrap();
        assert_eq!(cd.reason, CooldownReason::Status404Repeated);
        assert_eq!(cd.seconds, 1000);
        assert_eq!(row.notfound_count, 3);
    }

    #[test]
    fn backoff_cap_holds_over_ten_403s() {
        let mut core = FrontierCore::default();
        let t = tuning();
        let now = Utc::now();
        let mut max_seconds = 0;
        for _ in 0..10 {
            let row = core
                .record_fetch_at("p1", "https://blocked.com/x", &fetch(403), now, &t)
                .unwrap();
            max_seconds = max_seconds.max(row.cooldown.unwrap().seconds);
        }
        assert_eq!(max_seconds, 60 * 16);
    }

    #[test]
    fn success_clears_cooldown_and_resets_runs() {
        let mut core = FrontierCore::default();
        let t = tuning();
        let now = Utc::now();
        let url = "https://ok.com/a";
        core.record_fetch_at("p1", url, &fetch(403), now, &t).unwrap();
        let row = core.record_fetch_at("p1", url, &fetch(200), now, &t).unwrap();
        assert!(row.cooldown.is_none());
        assert_eq!(row.parsed_ok_count, 1);
        assert_eq!(row.consecutive_403, 0);
    }

    #[test]
    fn dead_path_pattern_skips_siblings() {
        let mut core = FrontierCore::default();
        let t = tuning();
        let now = Utc::now();
        // Three distinct URLs sharing /old/:id all 404.
        for i in 0..3 {
            core.record_fetch_at("p1", &format!("https://shop.com/old/{i}00"), &fetch(404), now, &t)
                .unwrap();
        }
        let decision = core.should_skip_url_at("https://shop.com/old/999", now, &t);
        assert!(decision.skip);
        assert_eq!(decision.reason.as_deref(), Some("path_dead_pattern"));

        // One sibling success clears the pattern.
        core.record_fetch_at("p1", "https://shop.com/old/555", &fetch(200), now, &t)
            .unwrap();
        let decision = core.should_skip_url_at("https://shop.com/old/999", now, &t);
        assert!(!decision.skip);
    }

    #[test]
    fn active_cooldown_skips_url() {
        let mut core = FrontierCore::default();
        let t = tuning();
        let now = Utc::now();
        core.record_fetch_at("p1", "https://gone.com/x", &fetch(410), now, &t).unwrap();
        let d = core.should_skip_url_at("https://gone.com/x", now, &t);
        assert!(d.skip);
        assert_eq!(d.reason.as_deref(), Some("status_410"));
        // After expiry the URL is eligible again.
        let later = now + Duration::seconds(10_000);
        assert!(!core.should_skip_url_at("https://gone.com/x", later, &t).skip);
    }

    #[test]
    fn rank_penalty_is_clamped() {
        let mut core = FrontierCore::default();
        let t = tuning();
        let now = Utc::now();
        let url = "https://flaky.com/page";
        for _ in 0..6 {
            core.record_fetch_at("p1", url, &fetch(404), now, &t).unwrap();
        }
        let p = core.rank_penalty_for_url_at(url, now);
        assert!(p >= -2.0 && p < 0.0, "penalty {p} out of range");
        assert_eq!(core.rank_penalty_for_url_at("https://fresh.com/x", now), 0.0);
    }

    #[test]
    fn snapshot_aggregates_field_yield() {
        let mut core = FrontierCore::default();
        let t = tuning();
        let now = Utc::now();
        let mut f = fetch(200);
        f.fields_found = vec!["weight".into(), "sensor".into()];
        core.record_fetch_at("p1", "https://a.com/1", &f, now, &t).unwrap();
        let mut f2 = fetch(200);
        f2.fields_found = vec!["weight".into()];
        core.record_fetch_at("p1", "https://b.com/2", &f2, now, &t).unwrap();
        core.record_query_at("p1", "q", "default", &[], 3, now);

        let snap = core.snapshot_for_product("p1");
        assert_eq!(snap.url_count, 2);
        assert_eq!(snap.query_count, 1);
        assert_eq!(snap.field_yield["weight"], 2);
        assert_eq!(snap.field_yield["sensor"], 1);
        assert_eq!(core.snapshot_for_product("p2").url_count, 0);
    }

    #[test]
    fn rows_are_never_deleted() {
        let mut core = FrontierCore::default();
        let t = tuning();
        let now = Utc::now();
        core.record_fetch_at("p1", "https://gone.com/x", &fetch(410), now, &t).unwrap();
        core.record_fetch_at("p1", "https://gone.com/x", &fetch(200), now, &t).unwrap();
        assert_eq!(core.urls.len(), 1);
        assert!(core.url_row("p1", "https://gone.com/x").is_some());
    }
}
