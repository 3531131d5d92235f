// SPDX-License-Identifier: MIT OR Apache-2.0
//! Post-consensus reducers.
//!
//! Two independent passes over the `(fields, candidates)` a consensus
//! round produced. Both are side-effect free apart from the fields map
//! they return, both are idempotent, and neither runs without a rules
//! engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use harvest_core::candidate::{Candidate, UNKNOWN};
use harvest_core::rules::{ItemUnion, SelectionPolicy};
use harvest_rules::RulesEngine;
use harvest_rules::normalize::LIST_SEPARATOR;

/// Record of one list-union application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedUnion {
    /// Field the union ran on.
    pub field: String,
    /// The union policy that ran.
    pub policy: String,
    /// Items added beyond the winning value.
    pub added_count: usize,
}

/// Result of the list-union pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListUnionOutcome {
    /// The refined fields map.
    pub fields: BTreeMap<String, String>,
    /// Per-field application records.
    pub applied: Vec<AppliedUnion>,
}

fn split_items(value: &str) -> Vec<String> {
    value
        .split(LIST_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Merge list items from approved-domain candidates into each winning
/// list value.
///
/// `set_union` deduplicates case-insensitively; `ordered_union`
/// additionally preserves each contributing candidate's internal item
/// order; `evidence_union` is reserved and acts as a no-op. Non-approved
/// candidates never contribute. Fields whose winner is `unk` are left
/// alone.
#[must_use]
pub fn list_union(
    fields: &BTreeMap<String, String>,
    candidates: &BTreeMap<String, Vec<Candidate>>,
    rules: Option<&RulesEngine>,
) -> ListUnionOutcome {
    let Some(engine) = rules else {
        return ListUnionOutcome { fields: fields.clone(), applied: vec![] };
    };

    let mut out = fields.clone();
    let mut applied = Vec::new();

    for (field_key, value) in fields {
        if value == UNKNOWN {
            continue;
        }
        let Some(rule) = engine.rules.rule(field_key) else { continue };
        let Some(list_rules) = rule.contract.list_rules() else { continue };
        let Some(union) = list_rules.item_union else { continue };
        let policy_name = match union {
            ItemUnion::SetUnion => "set_union",
            ItemUnion::OrderedUnion => "ordered_union",
            ItemUnion::EvidenceUnion => {
                applied.push(AppliedUnion {
                    field: field_key.clone(),
                    policy: "evidence_union".into(),
                    added_count: 0,
                });
                continue;
            }
        };

        let mut items = split_items(value);
        let mut seen: Vec<String> = items.iter().map(|i| i.to_lowercase()).collect();

        // Contributors: approved candidates, best sources first.
        let mut contributors: Vec<&Candidate> = candidates
            .get(field_key)
            .map(|cs| cs.iter().filter(|c| c.approved_domain).collect())
            .unwrap_or_default();
        contributors.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then(b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut added = 0;
        for contributor in contributors {
            for item in split_items(&contributor.value) {
                let key = item.to_lowercase();
                if !seen.contains(&key) {
                    seen.push(key);
                    items.push(item);
                    added += 1;
                }
            }
        }
        if let Some(max) = list_rules.max_items {
            items.truncate(max);
        }
        out.insert(field_key.clone(), items.join(&LIST_SEPARATOR.to_string()));
        applied.push(AppliedUnion {
            field: field_key.clone(),
            policy: policy_name.into(),
            added_count: added,
        });
    }

    ListUnionOutcome { fields: out, applied }
}

/// Reason a reduction produced (or refused) a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceReason {
    /// Only one sample; used directly.
    SingleValue,
    /// All samples within tolerance; median used.
    MedianWithinTolerance,
    /// Spread beyond tolerance; result is `unk`.
    ExceedsTolerance,
}

/// Record of one selection-policy reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedReduce {
    /// The scalar field written.
    pub field: String,
    /// The list field reduced from.
    pub source_field: String,
    /// Outcome classification.
    pub reason: ReduceReason,
}

/// Result of the selection-policy reduction pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceOutcome {
    /// The refined fields map.
    pub fields: BTreeMap<String, String>,
    /// Per-field application records.
    pub applied: Vec<AppliedReduce>,
}

/// Reduce list fields to scalars for rules whose `selection_policy` is the
/// object form.
///
/// A single sample inside tolerance is used directly; multiple samples
/// within the tolerance window reduce to their median; a wider spread
/// yields `unk`.
#[must_use]
pub fn reduce_selection_policies(
    fields: &BTreeMap<String, String>,
    rules: Option<&RulesEngine>,
) -> ReduceOutcome {
    let Some(engine) = rules else {
        return ReduceOutcome { fields: fields.clone(), applied: vec![] };
    };

    let mut out = fields.clone();
    let mut applied = Vec::new();

    for (field_key, rule) in &engine.rules.fields {
        let Some(SelectionPolicy::Reduce(policy)) = &rule.selection_policy else {
            continue;
        };
        let Some(source_value) = fields.get(&policy.source_field) else { continue };
        if source_value == UNKNOWN {
            continue;
        }
        let mut samples: Vec<f64> = split_items(source_value)
            .iter()
            .filter_map(|s| {
                s.split_whitespace()
                    .next()
                    .and_then(|n| n.parse::<f64>().ok())
            })
            .collect();
        if samples.is_empty() {
            continue;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let (value, reason) = if samples.len() == 1 {
            (samples[0], ReduceReason::SingleValue)
        } else if samples[samples.len() - 1] - samples[0] <= policy.tolerance_ms {
            (median(&samples), ReduceReason::MedianWithinTolerance)
        } else {
            out.insert(field_key.clone(), UNKNOWN.to_string());
            applied.push(AppliedReduce {
                field: field_key.clone(),
                source_field: policy.source_field.clone(),
                reason: ReduceReason::ExceedsTolerance,
            });
            continue;
        };
        let rendered = if (value - value.round()).abs() < 1e-9 {
            format!("{}", value.round() as i64)
        } else {
            format!("{value}")
        };
        out.insert(field_key.clone(), rendered);
        applied.push(AppliedReduce {
            field: field_key.clone(),
            source_field: policy.source_field.clone(),
            reason,
        });
    }

    ReduceOutcome { fields: out, applied }
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::rules::{
        FieldContract, FieldRule, FieldRuleSet, KnownValues, ListRules, ReducePolicy, ReduceRule,
        RequiredLevel, ScalarKind,
    };

    fn list_rule(key: &str, union: ItemUnion) -> FieldRule {
        let mut rule = FieldRule::text(key, RequiredLevel::Expected);
        rule.contract = FieldContract::List {
            item: ScalarKind::Text,
            list_rules: ListRules { item_union: Some(union), max_items: None },
            unit: None,
            value_form: None,
        };
        rule
    }

    fn engine(rules: Vec<FieldRule>) -> RulesEngine {
        let mut set = FieldRuleSet::default();
        for rule in rules {
            set.fields.insert(rule.key.clone(), rule);
        }
        RulesEngine::new(set, KnownValues::default(), vec![], BTreeMap::new(), BTreeMap::new())
    }

    fn approved(field: &str, value: &str, tier: u8) -> Candidate {
        let mut c = Candidate::new(field, value);
        c.approved_domain = true;
        c.tier = tier;
        c
    }

    fn fields_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn set_union_merges_and_dedupes() {
        let e = engine(vec![list_rule("colors", ItemUnion::SetUnion)]);
        let fields = fields_of(&[("colors", "black|white")]);
        let mut candidates = BTreeMap::new();
        candidates.insert(
            "colors".to_string(),
            vec![
                approved("colors", "White|Pink", 2),
                approved("colors", "black|green", 3),
            ],
        );
        let out = list_union(&fields, &candidates, Some(&e));
        assert_eq!(out.fields["colors"], "black|white|Pink|green");
        assert_eq!(out.applied[0].policy, "set_union");
        assert_eq!(out.applied[0].added_count, 2);
    }

    #[test]
    fn non_approved_candidates_never_contribute() {
        let e = engine(vec![list_rule("colors", ItemUnion::SetUnion)]);
        let fields = fields_of(&[("colors", "black")]);
        let mut candidates = BTreeMap::new();
        candidates.insert("colors".to_string(), vec![Candidate::new("colors", "red|blue")]);
        let out = list_union(&fields, &candidates, Some(&e));
        assert_eq!(out.fields["colors"], "black");
        assert_eq!(out.applied[0].added_count, 0);
    }

    #[test]
    fn ordered_union_preserves_contributor_order() {
        let e = engine(vec![list_rule("polling_rates", ItemUnion::OrderedUnion)]);
        let fields = fields_of(&[("polling_rates", "125|1000")]);
        let mut candidates = BTreeMap::new();
        candidates.insert(
            "polling_rates".to_string(),
            vec![approved("polling_rates", "125|250|500|1000", 1)],
        );
        let out = list_union(&fields, &candidates, Some(&e));
        assert_eq!(out.fields["polling_rates"], "125|1000|250|500");
    }

    #[test]
    fn evidence_union_is_a_noop() {
        let e = engine(vec![list_rule("colors", ItemUnion::EvidenceUnion)]);
        let fields = fields_of(&[("colors", "black")]);
        let mut candidates = BTreeMap::new();
        candidates.insert("colors".to_string(), vec![approved("colors", "red", 1)]);
        let out = list_union(&fields, &candidates, Some(&e));
        assert_eq!(out.fields["colors"], "black");
        assert_eq!(out.applied[0].policy, "evidence_union");
    }

    #[test]
    fn list_union_is_idempotent() {
        let e = engine(vec![list_rule("colors", ItemUnion::SetUnion)]);
        let fields = fields_of(&[("colors", "black|white")]);
        let mut candidates = BTreeMap::new();
        candidates.insert("colors".to_string(), vec![approved("colors", "pink", 2)]);
        let once = list_union(&fields, &candidates, Some(&e));
        let twice = list_union(&once.fields, &candidates, Some(&e));
        assert_eq!(once.fields, twice.fields);
    }

    #[test]
    fn no_rules_engine_means_noop() {
        let fields = fields_of(&[("colors", "black")]);
        let out = list_union(&fields, &BTreeMap::new(), None);
        assert_eq!(out.fields, fields);
        assert!(out.applied.is_empty());
        let out = reduce_selection_policies(&fields, None);
        assert_eq!(out.fields, fields);
    }

    fn latency_rules() -> RulesEngine {
        let mut scalar = FieldRule::text("click_latency_ms", RequiredLevel::Expected);
        scalar.selection_policy = Some(SelectionPolicy::Reduce(ReducePolicy {
            source_field: "click_latency_samples".into(),
            tolerance_ms: 2.0,
            rule: ReduceRule::Reduce,
        }));
        engine(vec![scalar, list_rule("click_latency_samples", ItemUnion::SetUnion)])
    }

    #[test]
    fn single_sample_is_used_directly() {
        let e = latency_rules();
        let fields = fields_of(&[("click_latency_samples", "3.4")]);
        let out = reduce_selection_policies(&fields, Some(&e));
        assert_eq!(out.fields["click_latency_ms"], "3.4");
        assert_eq!(out.applied[0].reason, ReduceReason::SingleValue);
    }

    #[test]
    fn samples_within_tolerance_take_median() {
        let e = latency_rules();
        let fields = fields_of(&[("click_latency_samples", "3|4|5")]);
        let out = reduce_selection_policies(&fields, Some(&e));
        assert_eq!(out.fields["click_latency_ms"], "4");
        assert_eq!(out.applied[0].reason, ReduceReason::MedianWithinTolerance);
    }

    #[test]
    fn spread_beyond_tolerance_is_unk() {
        let e = latency_rules();
        let fields = fields_of(&[("click_latency_samples", "3|9")]);
        let out = reduce_selection_policies(&fields, Some(&e));
        assert_eq!(out.fields["click_latency_ms"], "unk");
        assert_eq!(out.applied[0].reason, ReduceReason::ExceedsTolerance);
    }

    #[test]
    fn unk_source_list_is_skipped() {
        let e = latency_rules();
        let fields = fields_of(&[("click_latency_samples", "unk")]);
        let out = reduce_selection_policies(&fields, Some(&e));
        assert!(!out.fields.contains_key("click_latency_ms"));
        assert!(out.applied.is_empty());
    }
}
