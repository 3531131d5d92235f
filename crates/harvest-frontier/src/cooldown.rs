// SPDX-License-Identifier: MIT OR Apache-2.0
//! The cooldown decision table.
//!
//! Both frontier backends call into this module so that identical fetch
//! sequences produce identical reason strings and durations. The table is
//! a contract: changing a duration here changes the persisted behavior of
//! every backend at once.

use serde::{Deserialize, Serialize};

/// Closed set of cooldown reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    /// First strikes of a 404.
    Status404,
    /// Repeated 404s on a path signature with no successes.
    Status404Repeated,
    /// 403 exponential backoff.
    Status403Backoff,
    /// 429 exponential backoff.
    Status429Backoff,
    /// 410 long quarantine.
    Status410,
    /// The URL's path signature is a known dead pattern.
    PathDeadPattern,
}

impl CooldownReason {
    /// The wire string for this reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CooldownReason::Status404 => "status_404",
            CooldownReason::Status404Repeated => "status_404_repeated",
            CooldownReason::Status403Backoff => "status_403_backoff",
            CooldownReason::Status429Backoff => "status_429_backoff",
            CooldownReason::Status410 => "status_410",
            CooldownReason::PathDeadPattern => "path_dead_pattern",
        }
    }
}

/// Configured base durations, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownTuning {
    /// First-strike 404 cooldown.
    pub base404: u64,
    /// Repeated-404 cooldown.
    pub repeat404: u64,
    /// 403 backoff base.
    pub base403: u64,
    /// 429 backoff base.
    pub base429: u64,
    /// 410 quarantine.
    pub long410: u64,
    /// 404 count per path signature before the signature is dead.
    pub path_notfound_threshold: u32,
}

impl Default for CooldownTuning {
    fn default() -> Self {
        Self {
            base404: 6 * 3600,
            repeat404: 7 * 24 * 3600,
            base403: 1800,
            base429: 900,
            long410: 30 * 24 * 3600,
            path_notfound_threshold: 3,
        }
    }
}

/// Exponent cap for 403/429 backoff. Exactly 4, inclusive.
const BACKOFF_EXPONENT_CAP: u32 = 4;

/// History the table needs to judge one recorded fetch.
///
/// Counts are taken *after* the current fetch has been folded in: a third
/// consecutive 404 arrives with `notfound_count = 3`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchHistory {
    /// 404s recorded for this URL, including the current one.
    pub notfound_count: u32,
    /// Consecutive 403s *before* the current one.
    pub consecutive_403: u32,
    /// Consecutive 429s *before* the current one.
    pub consecutive_429: u32,
    /// Successful parses recorded anywhere under this URL's path signature.
    pub path_parsed_ok: u64,
}

/// What a recorded fetch does to the URL's cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    /// Success: clear any standing cooldown.
    Clear,
    /// Install a cooldown.
    Install {
        /// Reason from the closed set.
        reason: CooldownReason,
        /// Duration in seconds.
        seconds: u64,
    },
    /// Status has no cooldown consequence (e.g. 500 handled via host budget).
    Untouched,
}

/// The decision table of §cooldown arithmetic.
#[must_use]
pub fn decide(status: u16, history: FetchHistory, tuning: &CooldownTuning) -> CooldownDecision {
    match status {
        200..=399 => CooldownDecision::Clear,
        404 => {
            if history.notfound_count >= 3 && history.path_parsed_ok == 0 {
                CooldownDecision::Install {
                    reason: CooldownReason::Status404Repeated,
                    seconds: tuning.repeat404,
                }
            } else {
                CooldownDecision::Install {
                    reason: CooldownReason::Status404,
                    seconds: tuning.base404,
                }
            }
        }
        403 => CooldownDecision::Install {
            reason: CooldownReason::Status403Backoff,
            seconds: backoff_seconds(tuning.base403, history.consecutive_403),
        },
        429 => CooldownDecision::Install {
            reason: CooldownReason::Status429Backoff,
            seconds: backoff_seconds(tuning.base429, history.consecutive_429),
        },
        410 => CooldownDecision::Install {
            reason: CooldownReason::Status410,
            seconds: tuning.long410,
        },
        _ => CooldownDecision::Untouched,
    }
}

/// `base × 2^min(consecutive, 4)`.
#[must_use]
pub fn backoff_seconds(base: u64, consecutive: u32) -> u64 {
    base.saturating_mul(1u64 << consecutive.min(BACKOFF_EXPONENT_CAP))
}

/// Whether a path signature counts as dead: enough 404s, zero successes.
#[must_use]
pub fn path_is_dead(notfound: u64, parsed_ok: u64, tuning: &CooldownTuning) -> bool {
    parsed_ok == 0 && notfound >= u64::from(tuning.path_notfound_threshold)
}
