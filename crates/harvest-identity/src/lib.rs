// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-identity
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use tracing::debug;

use harvest_core::IdentityLock;
use harvest_core::needset::{IdentityLockState, IdentityLockStatus};
use harvest_core::tier;

// Scoring weights. Brand and model carry most of the signal; hard IDs are
// decisive and handled before weighting.
const WEIGHT_BRAND: f64 = 0.25;
const WEIGHT_MODEL: f64 = 0.4;
const WEIGHT_VARIANT: f64 = 0.25;
const WEIGHT_HARD_ID: f64 = 0.1;

/// Match threshold when the lock has no variant.
const THRESHOLD_NO_VARIANT: f64 = 0.7;
/// Match threshold when a variant is part of the lock.
const THRESHOLD_WITH_VARIANT: f64 = 0.8;

/// Identity tokens a page exposes (from title, breadcrumbs, structured
/// data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IdentityCandidates {
    /// Brand the page claims.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    /// Model the page claims.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Variant the page claims.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// SKU printed on the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    /// MPN printed on the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpn: Option<String>,
    /// GTIN printed on the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtin: Option<String>,
}

impl IdentityCandidates {
    /// Whether the page exposed any identity tokens at all.
    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.brand.is_some()
            || self.model.is_some()
            || self.variant.is_some()
            || self.sku.is_some()
            || self.mpn.is_some()
            || self.gtin.is_some()
    }
}

/// What the scorer saw on one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageObservation {
    /// Page URL.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Identity tokens extracted from the page.
    pub identity_candidates: IdentityCandidates,
}

/// Per-page decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageDecision {
    /// Identity confirmed (hard ID or strong token match).
    Confirmed,
    /// Token match above threshold.
    Likely,
    /// No match.
    Rejected,
}

/// The scored identity of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageIdentity {
    /// Page URL.
    pub url: String,
    /// Decision.
    pub decision: PageDecision,
    /// Weighted token score in `[0, 1]`.
    pub score: f64,
    /// Confidence in the decision.
    pub confidence: f64,
    /// Whether the page matched (decision is Confirmed or Likely).
    pub matched: bool,
    /// Conflicts observed; `critical:` entries are hard-ID mismatches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    /// Whether the page's identity candidates were populated at all.
    pub candidates_populated: bool,
}

fn norm(s: &str) -> String {
    s.trim().to_lowercase()
}

fn tokens(s: &str) -> Vec<String> {
    norm(s)
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fraction of `expected` tokens that appear in `haystack` tokens.
fn token_overlap(expected: &str, haystack: &[String]) -> f64 {
    let want = tokens(expected);
    if want.is_empty() {
        return 0.0;
    }
    let hit = want.iter().filter(|t| haystack.contains(t)).count();
    hit as f64 / want.len() as f64
}

/// Compare two hard identifiers, ignoring case and separators.
fn hard_id_eq(a: &str, b: &str) -> bool {
    let strip = |s: &str| {
        s.chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_lowercase()
    };
    !a.trim().is_empty() && strip(a) == strip(b)
}

/// Score one page against the identity lock.
///
/// A hard-ID match forces `Confirmed` with confidence 1.0; a hard-ID
/// mismatch forces `Rejected` with a `critical:` conflict entry.
#[must_use]
pub fn score_page(page: &PageObservation, lock: &IdentityLock) -> PageIdentity {
    let cands = &page.identity_candidates;

    // Hard identifiers decide outright.
    for (name, locked, seen) in [
        ("sku", &lock.sku, &cands.sku),
        ("mpn", &lock.mpn, &cands.mpn),
        ("gtin", &lock.gtin, &cands.gtin),
    ] {
        if let (Some(locked), Some(seen)) = (locked, seen) {
            if hard_id_eq(locked, seen) {
                return PageIdentity {
                    url: page.url.clone(),
                    decision: PageDecision::Confirmed,
                    score: 1.0,
                    confidence: 1.0,
                    matched: true,
                    conflicts: vec![],
                    candidates_populated: true,
                };
            }
            return PageIdentity {
                url: page.url.clone(),
                decision: PageDecision::Rejected,
                score: 0.0,
                confidence: 1.0,
                matched: false,
                conflicts: vec![format!("critical:{name}_mismatch:{locked}!={seen}")],
                candidates_populated: true,
            };
        }
    }

    // Weighted token scoring over title + claimed identity.
    let mut haystack = tokens(&page.title);
    for extra in [&cands.brand, &cands.model, &cands.variant] {
        if let Some(extra) = extra {
            haystack.extend(tokens(extra));
        }
    }

    let mut score = WEIGHT_BRAND * token_overlap(&lock.brand, &haystack)
        + WEIGHT_MODEL * token_overlap(&lock.model, &haystack);
    let threshold = match &lock.variant {
        Some(variant) => {
            score += WEIGHT_VARIANT * token_overlap(variant, &haystack);
            THRESHOLD_WITH_VARIANT
        }
        None => {
            // Without a variant in the lock the variant weight is
            // redistributed as neutral headroom.
            score += WEIGHT_VARIANT;
            THRESHOLD_NO_VARIANT
        }
    };
    // Hard-ID weight is headroom whenever the page shows no hard ID.
    score += WEIGHT_HARD_ID;
    let score = score.min(1.0);

    let mut conflicts = vec![];
    if let Some(brand) = &cands.brand
        && token_overlap(&lock.brand, &tokens(brand)) == 0.0
    {
        conflicts.push(format!("brand_mismatch:{brand}"));
    }

    let matched = score >= threshold && conflicts.is_empty();
    let decision = if matched {
        PageDecision::Likely
    } else {
        PageDecision::Rejected
    };
    debug!(url = %page.url, score, matched, "scored page identity");
    PageIdentity {
        url: page.url.clone(),
        decision,
        score,
        confidence: score,
        matched,
        conflicts,
        candidates_populated: cands.is_populated(),
    }
}

// ---------------------------------------------------------------------------
// Page-set gate
// ---------------------------------------------------------------------------

/// A scored page plus the source metadata the gate needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatePage {
    /// The per-page identity decision.
    pub identity: PageIdentity,
    /// Source tier.
    pub tier: u8,
    /// Whether the host is on the category allow-list.
    pub approved_domain: bool,
    /// Whether the page is a trusted helper file (curated import).
    #[serde(default)]
    pub trusted_helper: bool,
}

/// Outcome of the page-set gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    /// Whether extraction is permitted.
    pub open: bool,
    /// Identity-lock state to report in the need-set.
    pub state: IdentityLockState,
    /// Whether a hard conflict closed the gate.
    pub hard_conflict: bool,
    /// Human-readable reasons for the decision.
    pub reasons: Vec<String>,
}

/// Decide whether extraction is permitted for this set of pages.
///
/// The gate passes when either
/// 1. at least one manufacturer-tier match exists and at least two more
///    credible matches (tier ≤ 2, approved domain), or
/// 2. a manufacturer match plus a trusted helper-file match.
///
/// Weak contradictions — rejected pages that did expose identity tokens
/// but scored low — are ignored. A hard conflict closes the gate
/// unconditionally.
#[must_use]
pub fn evaluate_page_set(pages: &[GatePage]) -> GateResult {
    let hard_conflict = pages.iter().any(|p| {
        p.identity
            .conflicts
            .iter()
            .any(|c| c.starts_with("critical:"))
            && p.identity.confidence >= 0.9
    });

    let manufacturer_matches = pages
        .iter()
        .filter(|p| p.identity.matched && p.tier == tier::MANUFACTURER)
        .count();
    let credible_matches = pages
        .iter()
        .filter(|p| {
            p.identity.matched
                && p.tier > tier::MANUFACTURER
                && p.tier <= tier::CREDIBLE
                && p.approved_domain
        })
        .count();
    let helper_matches = pages
        .iter()
        .filter(|p| p.identity.matched && p.trusted_helper)
        .count();

    let matched_pages = pages.iter().filter(|p| p.identity.matched).count();
    let confidence = if pages.is_empty() {
        0.0
    } else {
        pages.iter().map(|p| p.identity.confidence).sum::<f64>() / pages.len() as f64
    };

    let mut reasons = vec![];
    let open = if hard_conflict {
        reasons.push("hard identity conflict".to_string());
        false
    } else if manufacturer_matches >= 1 && credible_matches >= 2 {
        reasons.push(format!(
            "manufacturer match with {credible_matches} credible confirmations"
        ));
        true
    } else if manufacturer_matches >= 1 && helper_matches >= 1 {
        reasons.push("manufacturer match with trusted helper file".to_string());
        true
    } else {
        reasons.push(format!(
            "insufficient corroboration ({manufacturer_matches} manufacturer, {credible_matches} credible)"
        ));
        false
    };

    let status = if hard_conflict {
        IdentityLockStatus::Conflict
    } else if open {
        IdentityLockStatus::Locked
    } else if matched_pages > 0 {
        IdentityLockStatus::Provisional
    } else {
        IdentityLockStatus::Unlocked
    };

    GateResult {
        open,
        state: IdentityLockState {
            status,
            confidence,
            page_count: pages.len() as u32,
        },
        hard_conflict,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> IdentityLock {
        IdentityLock {
            brand: "Razer".into(),
            model: "Viper V3 Pro".into(),
            sku: Some("RZ01-05120100".into()),
            ..IdentityLock::default()
        }
    }

    fn page(title: &str) -> PageObservation {
        PageObservation {
            url: "https://example.com/p".into(),
            title: title.into(),
            identity_candidates: IdentityCandidates::default(),
        }
    }

    fn likely(tier_val: u8, approved: bool) -> GatePage {
        GatePage {
            identity: PageIdentity {
                url: "https://x.com".into(),
                decision: PageDecision::Likely,
                score: 0.9,
                confidence: 0.9,
                matched: true,
                conflicts: vec![],
                candidates_populated: true,
            },
            tier: tier_val,
            approved_domain: approved,
            trusted_helper: false,
        }
    }

    #[test]
    fn title_match_passes_threshold() {
        let result = score_page(&page("Razer Viper V3 Pro Review — the best yet"), &lock());
        assert!(result.matched);
        assert_eq!(result.decision, PageDecision::Likely);
        assert!(result.score >= 0.7);
    }

    #[test]
    fn unrelated_title_is_rejected() {
        let result = score_page(&page("Logitech G Pro X Superlight 2 hands-on"), &lock());
        assert!(!result.matched);
        assert_eq!(result.decision, PageDecision::Rejected);
    }

    #[test]
    fn hard_id_match_confirms_at_full_confidence() {
        let mut p = page("Some listing page");
        p.identity_candidates.sku = Some("rz01 05120100".into());
        let result = score_page(&p, &lock());
        assert_eq!(result.decision, PageDecision::Confirmed);
        assert!((result.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn hard_id_mismatch_rejects_with_critical_conflict() {
        let mut p = page("Razer Viper V3 Pro");
        p.identity_candidates.sku = Some("RZ01-99999999".into());
        let result = score_page(&p, &lock());
        assert_eq!(result.decision, PageDecision::Rejected);
        assert!(result.conflicts[0].starts_with("critical:sku_mismatch"));
    }

    #[test]
    fn variant_raises_threshold() {
        let mut with_variant = lock();
        with_variant.variant = Some("Faker Edition".into());
        // Title matching brand+model but not the variant should fall short
        // of the raised threshold.
        let result = score_page(&page("Razer Viper V3 Pro review"), &with_variant);
        assert!(!result.matched);
        let result = score_page(&page("Razer Viper V3 Pro Faker Edition review"), &with_variant);
        assert!(result.matched);
    }

    #[test]
    fn gate_passes_with_manufacturer_and_two_credible() {
        let pages = vec![likely(1, true), likely(2, true), likely(2, true)];
        let result = evaluate_page_set(&pages);
        assert!(result.open);
        assert_eq!(result.state.status, IdentityLockStatus::Locked);
        assert_eq!(result.state.page_count, 3);
    }

    #[test]
    fn gate_fails_with_only_one_credible() {
        let pages = vec![likely(1, true), likely(2, true)];
        let result = evaluate_page_set(&pages);
        assert!(!result.open);
        assert_eq!(result.state.status, IdentityLockStatus::Provisional);
    }

    #[test]
    fn gate_passes_with_manufacturer_plus_helper() {
        let mut helper = likely(3, false);
        helper.trusted_helper = true;
        let pages = vec![likely(1, true), helper];
        let result = evaluate_page_set(&pages);
        assert!(result.open);
    }

    #[test]
    fn unapproved_credible_pages_do_not_count() {
        let pages = vec![likely(1, true), likely(2, false), likely(2, false)];
        let result = evaluate_page_set(&pages);
        assert!(!result.open);
    }

    #[test]
    fn hard_conflict_closes_gate_despite_agreement() {
        let mut conflicted = likely(2, true);
        conflicted.identity.conflicts = vec!["critical:sku_mismatch:a!=b".into()];
        conflicted.identity.confidence = 1.0;
        conflicted.identity.matched = false;
        let pages = vec![likely(1, true), likely(2, true), likely(2, true), conflicted];
        let result = evaluate_page_set(&pages);
        assert!(!result.open);
        assert!(result.hard_conflict);
        assert_eq!(result.state.status, IdentityLockStatus::Conflict);
    }

    #[test]
    fn weak_contradictions_are_ignored() {
        // A generic category page: candidates populated, low score, no
        // critical conflict. It must not block the gate.
        let mut weak = likely(2, true);
        weak.identity.matched = false;
        weak.identity.score = 0.2;
        weak.identity.confidence = 0.2;
        let pages = vec![likely(1, true), likely(2, true), likely(2, true), weak];
        let result = evaluate_page_set(&pages);
        assert!(result.open);
    }

    #[test]
    fn empty_page_set_is_unlocked() {
        let result = evaluate_page_set(&[]);
        assert!(!result.open);
        assert_eq!(result.state.status, IdentityLockStatus::Unlocked);
        assert_eq!(result.state.page_count, 0);
    }
}
