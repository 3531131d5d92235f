// SPDX-License-Identifier: MIT OR Apache-2.0
//! Need-set scoring: which fields still deserve work, and how urgently.

use std::collections::BTreeMap;

use harvest_core::candidate::ProvenanceEntry;
use harvest_core::needset::{IdentityLockState, NeedEntry, NeedReason, NeedSet};
use harvest_core::rules::{FieldRuleSet, RequiredLevel};

/// Confidence below which a resolved field still reads as needy.
const LOW_CONFIDENCE_FLOOR: f64 = 0.6;
/// Score added when the preferred tier is absent from the evidence.
const TIER_PREF_GAP: f64 = 15.0;
/// Score added per missing evidence reference.
const MIN_REFS_GAP_PER_REF: f64 = 10.0;
/// Cap on the min-refs contribution.
const MIN_REFS_GAP_CAP: f64 = 30.0;
/// Score added when sources conflicted to a tie.
const AMBIGUITY_PENALTY: f64 = 20.0;
/// Decay per round a field has stayed satisfied.
const STALENESS_DECAY_PER_ROUND: f64 = 5.0;
/// Cap on staleness decay.
const STALENESS_DECAY_CAP: f64 = 25.0;

/// Per-field signals the scorer cannot derive from provenance alone.
#[derive(Debug, Clone, Default)]
pub struct NeedSignals {
    /// Fields whose consensus round ended in a tie between clusters.
    pub ambiguous_fields: Vec<String>,
    /// Field → rounds it has stayed satisfied (drives staleness decay).
    pub satisfied_rounds: BTreeMap<String, u32>,
}

/// Build the need-set for one round.
///
/// Identity-level fields never appear: the lock owns them. Fields score
/// by required-level weight against their pass-target state, plus gaps
/// for tier preference, evidence references, and ambiguity, minus decay
/// for fields that have stayed satisfied across rounds.
#[must_use]
pub fn build_needset(
    rules: &FieldRuleSet,
    provenance: &BTreeMap<String, ProvenanceEntry>,
    identity: IdentityLockState,
    signals: &NeedSignals,
) -> NeedSet {
    let mut needs = Vec::new();

    for (field_key, rule) in &rules.fields {
        if rule.required_level == RequiredLevel::Identity {
            continue;
        }
        let entry = provenance.get(field_key);
        let resolved = entry.is_some_and(ProvenanceEntry::is_resolved);
        let meets = entry.is_some_and(|e| e.meets_pass_target);

        let mut reasons = Vec::new();
        let mut score = rule.required_level.need_weight() * if meets { 0.0 } else { 1.0 };

        if !resolved {
            reasons.push(NeedReason::Missing);
            if signals.ambiguous_fields.contains(field_key) {
                reasons.push(NeedReason::Conflict);
                score += AMBIGUITY_PENALTY;
            }
        } else {
            let entry = entry.expect("resolved implies entry");
            if entry.confidence < LOW_CONFIDENCE_FLOOR {
                reasons.push(NeedReason::LowConfidence);
            }
            if let Some(preferred) = rule.evidence.tier_preference.first()
                && !entry.evidence.iter().any(|e| e.tier <= *preferred)
            {
                reasons.push(NeedReason::TierPrefUnmet);
                score += TIER_PREF_GAP;
            }
            let refs = entry.evidence.len() as u32;
            if refs < rule.evidence.min_evidence_refs {
                reasons.push(NeedReason::MinRefsFail);
                let deficit = f64::from(rule.evidence.min_evidence_refs - refs);
                score += (MIN_REFS_GAP_PER_REF * deficit).min(MIN_REFS_GAP_CAP);
            }
            if rule.required_level == RequiredLevel::Critical && !meets {
                reasons.push(NeedReason::CriticalFieldBelowPassTarget);
            }
        }

        let stale_rounds = signals.satisfied_rounds.get(field_key).copied().unwrap_or(0);
        score -= (STALENESS_DECAY_PER_ROUND * f64::from(stale_rounds)).min(STALENESS_DECAY_CAP);

        if !reasons.is_empty() && score > 0.0 {
            reasons.sort();
            reasons.dedup();
            needs.push(NeedEntry {
                field_key: field_key.clone(),
                required_level: rule.required_level,
                need_score: score,
                reasons,
                min_refs: rule.evidence.min_evidence_refs,
                tier_preference: rule.evidence.tier_preference.clone(),
            });
        }
    }

    needs.sort_by(|a, b| {
        b.need_score
            .partial_cmp(&a.need_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.field_key.cmp(&b.field_key))
    });

    NeedSet {
        needs,
        total_fields: rules.fields.len(),
        identity,
    }
}

/// Fields still missing at `required` level or above.
#[must_use]
pub fn missing_required_fields(needs: &NeedSet) -> Vec<String> {
    needs
        .needs
        .iter()
        .filter(|n| {
            n.required_level <= RequiredLevel::Required && n.reasons.contains(&NeedReason::Missing)
        })
        .map(|n| n.field_key.clone())
        .collect()
}

/// Critical fields sitting below their pass target.
#[must_use]
pub fn critical_fields_below_pass_target(needs: &NeedSet) -> Vec<String> {
    needs
        .needs
        .iter()
        .filter(|n| n.reasons.contains(&NeedReason::CriticalFieldBelowPassTarget))
        .map(|n| n.field_key.clone())
        .collect()
}
