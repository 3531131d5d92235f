// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-host budgets: outcome histograms, exponential backoff, health state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use harvest_url::normalize_host;

/// The closed set of fetch outcome keys.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Successful fetch and parse.
    Ok,
    /// 404.
    NotFound,
    /// 403 or equivalent.
    Blocked,
    /// 429.
    RateLimited,
    /// Page demanded a login.
    LoginWall,
    /// Bot interstitial.
    BotChallenge,
    /// Fetched, but body was unusable.
    BadContent,
    /// 5xx.
    ServerError,
    /// Timed out.
    NetworkTimeout,
    /// Transport-level failure.
    FetchError,
}

impl Outcome {
    /// Outcomes that schedule a retry backoff.
    #[must_use]
    pub fn schedules_backoff(self) -> bool {
        matches!(
            self,
            Outcome::RateLimited
                | Outcome::Blocked
                | Outcome::BotChallenge
                | Outcome::NetworkTimeout
                | Outcome::ServerError
        )
    }

    /// Base backoff seconds for outcomes that schedule one.
    fn backoff_base_seconds(self) -> u64 {
        match self {
            Outcome::RateLimited => 120,
            Outcome::Blocked => 600,
            Outcome::BotChallenge => 900,
            Outcome::NetworkTimeout => 60,
            Outcome::ServerError => 120,
            _ => 0,
        }
    }

    /// Health-score penalty per occurrence.
    fn score_weight(self) -> u32 {
        match self {
            Outcome::Ok => 0,
            Outcome::NotFound => 2,
            Outcome::Blocked | Outcome::BotChallenge => 15,
            Outcome::RateLimited | Outcome::LoginWall => 10,
            Outcome::BadContent | Outcome::ServerError | Outcome::NetworkTimeout
            | Outcome::FetchError => 5,
        }
    }
}

/// Derived host health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    /// No reason not to fetch.
    Open,
    /// Work in flight.
    Active,
    /// Parsing or content problems observed.
    Degraded,
    /// A retry timestamp is pending.
    Backoff,
    /// Repeated denials; treat as off-limits until retry.
    Blocked,
}

/// Per-host counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HostRow {
    /// Fetches started.
    pub started_count: u64,
    /// Fetches completed (any outcome).
    pub completed_count: u64,
    /// Canonical-URL dedupe hits against this host.
    pub dedupe_hits: u64,
    /// Snippets from this host that made it into provenance.
    pub evidence_used: u64,
    /// Parser produced no chunks.
    pub parse_fail_count: u64,
    /// Outcome histogram.
    pub outcome_counts: BTreeMap<Outcome, u64>,
    /// Earliest time the host should be fetched again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_ts: Option<DateTime<Utc>>,
    /// Consecutive backoff-scheduling outcomes, drives the exponent.
    #[serde(default)]
    pub backoff_strikes: u32,
}

impl HostRow {
    fn outcome(&self, outcome: Outcome) -> u64 {
        self.outcome_counts.get(&outcome).copied().unwrap_or(0)
    }
}

/// Result of resolving a host's state at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedState {
    /// Derived state.
    pub state: HostState,
    /// Health score in `[0, 100]`.
    pub score: u32,
    /// Seconds until `next_retry_ts`, when one is pending.
    pub cooldown_seconds: u64,
}

/// Tracker for every host the run has touched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostBudgetTracker {
    /// Normalized host → row.
    pub hosts: BTreeMap<String, HostRow>,
}

impl HostBudgetTracker {
    /// New, empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn row_mut(&mut self, host: &str) -> &mut HostRow {
        self.hosts.entry(normalize_host(host)).or_default()
    }

    /// Row lookup by host (normalized on the way in).
    #[must_use]
    pub fn row(&self, host: &str) -> Option<&HostRow> {
        self.hosts.get(&normalize_host(host))
    }

    /// Record a started fetch.
    pub fn bump_started(&mut self, host: &str) {
        self.row_mut(host).started_count += 1;
    }

    /// Record a completed fetch.
    pub fn bump_completed(&mut self, host: &str) {
        self.row_mut(host).completed_count += 1;
    }

    /// Record a dedupe hit.
    pub fn bump_dedupe_hit(&mut self, host: &str) {
        self.row_mut(host).dedupe_hits += 1;
    }

    /// Record evidence from this host being used in provenance.
    pub fn bump_evidence_used(&mut self, host: &str) {
        self.row_mut(host).evidence_used += 1;
    }

    /// Record a parse failure.
    pub fn bump_parse_fail(&mut self, host: &str) {
        self.row_mut(host).parse_fail_count += 1;
    }

    /// Monotonic outcome counter bump.
    pub fn bump_outcome(&mut self, host: &str, outcome: Outcome) {
        let row = self.row_mut(host);
        *row.outcome_counts.entry(outcome).or_insert(0) += 1;
        if outcome == Outcome::Ok {
            row.backoff_strikes = 0;
        }
    }

    /// Schedule `next_retry_ts` for backoff-scheduling outcomes.
    ///
    /// Write-once-per-step with a monotonic-max rule: an earlier timestamp
    /// never overwrites a later one.
    pub fn apply_backoff(&mut self, host: &str, outcome: Outcome, now: DateTime<Utc>) {
        if !outcome.schedules_backoff() {
            return;
        }
        let row = self.row_mut(host);
        let exponent = row.backoff_strikes.min(5);
        row.backoff_strikes += 1;
        let seconds = outcome.backoff_base_seconds().saturating_mul(1 << exponent);
        let candidate = now + Duration::seconds(seconds as i64);
        row.next_retry_ts = Some(match row.next_retry_ts {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });
    }

    /// Resolve the host's derived state and health score at `now`.
    #[must_use]
    pub fn resolve_state(&self, host: &str, now: DateTime<Utc>) -> ResolvedState {
        let Some(row) = self.row(host) else {
            return ResolvedState { state: HostState::Open, score: 100, cooldown_seconds: 0 };
        };

        let retry_pending = row.next_retry_ts.is_some_and(|ts| ts > now);
        let cooldown_seconds = row
            .next_retry_ts
            .filter(|ts| *ts > now)
            .map(|ts| ts.signed_duration_since(now).num_seconds().max(0) as u64)
            .unwrap_or(0);

        let denials = row.outcome(Outcome::Blocked)
            + row.outcome(Outcome::RateLimited)
            + row.outcome(Outcome::BotChallenge);

        let state = if retry_pending && denials >= 3 {
            HostState::Blocked
        } else if retry_pending {
            HostState::Backoff
        } else if row.started_count > row.completed_count {
            HostState::Active
        } else if row.outcome(Outcome::BadContent) > 0 || row.parse_fail_count > 0 {
            HostState::Degraded
        } else {
            HostState::Open
        };

        let mut penalty: u64 = 0;
        for (outcome, count) in &row.outcome_counts {
            penalty += u64::from(outcome.score_weight()) * count;
        }
        penalty += 3 * row.parse_fail_count;
        let bonus = row.outcome(Outcome::Ok).min(20);
        let score = (100_i64 - penalty as i64 + bonus as i64).clamp(0, 100) as u32;

        ResolvedState { state, score, cooldown_seconds }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_counters_are_monotonic() {
        let mut t = HostBudgetTracker::new();
        t.bump_outcome("www.Example.com", Outcome::Ok);
        t.bump_outcome("example.com", Outcome::Ok);
        t.bump_outcome("example.com", Outcome::NotFound);
        let row = t.row("example.com").unwrap();
        assert_eq!(row.outcome_counts[&Outcome::Ok], 2);
        assert_eq!(row.outcome_counts[&Outcome::NotFound], 1);
    }

    #[test]
    fn backoff_only_for_eligible_outcomes() {
        let mut t = HostBudgetTracker::new();
        let now = Utc::now();
        t.apply_backoff("a.com", Outcome::NotFound, now);
        assert!(t.row("a.com").is_none_or(|r| r.next_retry_ts.is_none()));
        t.apply_backoff("a.com", Outcome::RateLimited, now);
        assert!(t.row("a.com").unwrap().next_retry_ts.is_some());
    }

    #[test]
    fn next_retry_is_monotonic_max() {
        let mut t = HostBudgetTracker::new();
        let now = Utc::now();
        // Bot challenge schedules a long retry.
        t.apply_backoff("b.com", Outcome::BotChallenge, now);
        let far = t.row("b.com").unwrap().next_retry_ts.unwrap();
        // A shorter-backoff outcome afterwards must not pull it earlier.
        t.apply_backoff("b.com", Outcome::NetworkTimeout, now);
        let still = t.row("b.com").unwrap().next_retry_ts.unwrap();
        assert!(still >= far);
    }

    #[test]
    fn blocked_needs_retry_pending_and_three_denials() {
        let mut t = HostBudgetTracker::new();
        let now = Utc::now();
        t.bump_outcome("c.com", Outcome::RateLimited);
        t.apply_backoff("c.com", Outcome::RateLimited, now);
        // One denial: backoff, not blocked.
        assert_eq!(t.resolve_state("c.com", now).state, HostState::Backoff);

        t.bump_outcome("c.com", Outcome::Blocked);
        t.bump_outcome("c.com", Outcome::BotChallenge);
        t.apply_backoff("c.com", Outcome::Blocked, now);
        assert_eq!(t.resolve_state("c.com", now).state, HostState::Blocked);
    }

    #[test]
    fn active_and_degraded_states() {
        let mut t = HostBudgetTracker::new();
        let now = Utc::now();
        t.bump_started("d.com");
        assert_eq!(t.resolve_state("d.com", now).state, HostState::Active);
        t.bump_completed("d.com");
        assert_eq!(t.resolve_state("d.com", now).state, HostState::Open);
        t.bump_parse_fail("d.com");
        assert_eq!(t.resolve_state("d.com", now).state, HostState::Degraded);
    }

    #[test]
    fn score_rewards_ok_and_caps_at_bounds() {
        let mut t = HostBudgetTracker::new();
        let now = Utc::now();
        for _ in 0..30 {
            t.bump_outcome("good.com", Outcome::Ok);
        }
        let resolved = t.resolve_state("good.com", now);
        assert_eq!(resolved.score, 100); // 100 + min(20, 30), clamped

        for _ in 0..30 {
            t.bump_outcome("bad.com", Outcome::Blocked);
        }
        assert_eq!(t.resolve_state("bad.com", now).score, 0);
    }

    #[test]
    fn unknown_host_is_open_and_healthy() {
        let t = HostBudgetTracker::new();
        let r = t.resolve_state("nowhere.example", Utc::now());
        assert_eq!(r.state, HostState::Open);
        assert_eq!(r.score, 100);
        assert_eq!(r.cooldown_seconds, 0);
    }

    #[test]
    fn cooldown_seconds_reports_remaining() {
        let mut t = HostBudgetTracker::new();
        let now = Utc::now();
        t.apply_backoff("e.com", Outcome::ServerError, now);
        let r = t.resolve_state("e.com", now);
        assert!(r.cooldown_seconds > 0 && r.cooldown_seconds <= 120);
    }
}
