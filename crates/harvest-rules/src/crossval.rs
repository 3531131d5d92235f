// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cross-field constraint validation.
//!
//! Rules are a closed sum type: requires-condition, component-DB lookup
//! with tolerance, group completeness, and mutual exclusion (which can set
//! a field to `unk` rather than merely flagging it).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use harvest_core::candidate::UNKNOWN;
use harvest_core::rules::VariancePolicy;

use crate::RulesEngine;

/// One cross-validation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrossRule {
    /// `when_field ∈ when_in` requires `requires` to be present.
    RequiresField {
        /// The triggering field.
        when_field: String,
        /// Values that arm the rule.
        when_in: Vec<String>,
        /// The field that must then be present (and not `unk`).
        requires: String,
    },
    /// Compare a field against a component property within tolerance.
    ComponentDbLookup {
        /// The numeric field under check.
        field: String,
        /// The field naming the component (e.g. `sensor`).
        component_field: String,
        /// Component database type (e.g. `"sensors"`).
        db: String,
        /// Property on the component item to compare against.
        property: String,
        /// Relative tolerance (0.05 = 5 %).
        #[serde(default)]
        tolerance: f64,
    },
    /// Require at least `min_present` of `group` to be present.
    GroupCompleteness {
        /// Rule label used in violation reports.
        name: String,
        /// The field group.
        group: Vec<String>,
        /// Minimum number that must be present.
        min_present: usize,
    },
    /// `when_field = when_value` forces `field` to `unk`.
    MutualExclusion {
        /// The field to clear.
        field: String,
        /// The triggering field.
        when_field: String,
        /// The triggering value.
        when_value: String,
        /// Reason recorded when the exclusion fires.
        reason: String,
    },
}

impl CrossRule {
    /// Whether a change to `field_key` can affect this rule.
    #[must_use]
    pub fn triggered_by(&self, field_key: &str) -> bool {
        match self {
            CrossRule::RequiresField { when_field, requires, .. } => {
                when_field == field_key || requires == field_key
            }
            CrossRule::ComponentDbLookup { field, component_field, .. } => {
                field == field_key || component_field == field_key
            }
            CrossRule::GroupCompleteness { group, .. } => group.iter().any(|f| f == field_key),
            CrossRule::MutualExclusion { field, when_field, .. } => {
                field == field_key || when_field == field_key
            }
        }
    }
}

/// A constraint violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Rule label or type.
    pub rule: String,
    /// The field found in violation.
    pub field: String,
    /// Human-readable detail.
    pub detail: String,
    /// Field to force to `unk`, with the reason, when the rule demands it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_unknown: Option<(String, String)>,
}

/// Result of cross-validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossOutcome {
    /// Whether no violations were found.
    pub ok: bool,
    /// The violations, in rule order.
    pub violations: Vec<Violation>,
}

fn present(record: &BTreeMap<String, String>, field: &str) -> bool {
    record
        .get(field)
        .is_some_and(|v| !v.is_empty() && v != UNKNOWN)
}

fn numeric(record: &BTreeMap<String, String>, field: &str) -> Option<f64> {
    record.get(field).and_then(|v| v.trim().parse::<f64>().ok())
}

impl RulesEngine {
    /// Validate `record` against every rule triggered by `trigger_field`.
    ///
    /// Pass the would-be value via the record itself; the engine never
    /// mutates the input. `set_unknown` actions come back in the
    /// violations for the caller to apply (`set_unknown_with_reason`).
    #[must_use]
    pub fn cross_validate(
        &self,
        trigger_field: &str,
        record: &BTreeMap<String, String>,
    ) -> CrossOutcome {
        let mut violations = Vec::new();
        for rule in self.cross_rules.iter().filter(|r| r.triggered_by(trigger_field)) {
            match rule {
                CrossRule::RequiresField { when_field, when_in, requires } => {
                    let armed = record
                        .get(when_field)
                        .is_some_and(|v| when_in.iter().any(|w| w.eq_ignore_ascii_case(v)));
                    if armed && !present(record, requires) {
                        violations.push(Violation {
                            rule: "requires_field".into(),
                            field: requires.clone(),
                            detail: format!(
                                "{when_field} in {when_in:?} requires {requires}"
                            ),
                            set_unknown: None,
                        });
                    }
                }
                CrossRule::ComponentDbLookup { field, component_field, db, property, tolerance } => {
                    let Some(value) = numeric(record, field) else { continue };
                    let Some(component_name) = record.get(component_field) else { continue };
                    let Some(db) = self.component_dbs.get(db) else { continue };
                    let Some(item) = db.resolve(component_name) else { continue };
                    let Some(prop) = item.properties.get(property).and_then(|v| v.as_f64()) else {
                        continue;
                    };
                    let policy = item
                        .variance_policies
                        .get(property)
                        .copied()
                        .unwrap_or_default();
                    let slack = prop.abs() * tolerance;
                    let violated = match policy {
                        VariancePolicy::Authoritative => (value - prop).abs() > slack,
                        VariancePolicy::UpperBound => value > prop + slack,
                        VariancePolicy::LowerBound => value < prop - slack,
                        VariancePolicy::Range => {
                            // Range properties carry "<min>-<max>" semantics
                            // via two properties; a single number degrades to
                            // authoritative.
                            (value - prop).abs() > slack
                        }
                    };
                    if violated {
                        debug!(field, value, component = %item.name, prop, "component contradiction");
                        violations.push(Violation {
                            rule: "component_db_lookup".into(),
                            field: field.clone(),
                            detail: format!(
                                "{field}={value} contradicts {}[{property}]={prop} ({policy:?})",
                                item.name
                            ),
                            set_unknown: None,
                        });
                    }
                }
                CrossRule::GroupCompleteness { name, group, min_present } => {
                    let have = group.iter().filter(|f| present(record, f)).count();
                    if have > 0 && have < *min_present {
                        violations.push(Violation {
                            rule: name.clone(),
                            field: group
                                .iter()
                                .find(|f| !present(record, f))
                                .cloned()
                                .unwrap_or_default(),
                            detail: format!(
                                "group {name} has {have} of {min_present} required fields"
                            ),
                            set_unknown: None,
                        });
                    }
                }
                CrossRule::MutualExclusion { field, when_field, when_value, reason } => {
                    let armed = record
                        .get(when_field)
                        .is_some_and(|v| v.eq_ignore_ascii_case(when_value));
                    if armed && present(record, field) {
                        violations.push(Violation {
                            rule: "mutual_exclusion".into(),
                            field: field.clone(),
                            detail: format!("{when_field}={when_value} excludes {field}"),
                            set_unknown: Some((field.clone(), reason.clone())),
                        });
                    }
                }
            }
        }
        CrossOutcome { ok: violations.is_empty(), violations }
    }
}

/// Apply `set_unknown` actions from a cross-validation outcome.
pub fn set_unknown_with_reason(
    record: &mut BTreeMap<String, String>,
    outcome: &CrossOutcome,
) -> Vec<(String, String)> {
    let mut applied = Vec::new();
    for violation in &outcome.violations {
        if let Some((field, reason)) = &violation.set_unknown {
            record.insert(field.clone(), UNKNOWN.to_string());
            applied.push((field.clone(), reason.clone()));
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::rules::{ComponentDb, ComponentItem, FieldRuleSet, KnownValues};

    fn engine(rules: Vec<CrossRule>) -> RulesEngine {
        let mut e = RulesEngine::new(
            FieldRuleSet::default(),
            KnownValues::default(),
            rules,
            BTreeMap::new(),
            BTreeMap::new(),
        );
        e.component_dbs.insert(
            "sensors".into(),
            ComponentDb {
                component_type: "sensors".into(),
                property_keys: vec!["dpi_max".into()],
                items: vec![ComponentItem {
                    name: "Focus Pro 35K".into(),
                    maker: "PixArt".into(),
                    aliases: vec![],
                    properties: BTreeMap::from([
                        ("dpi_max".into(), serde_json::json!(35000.0)),
                    ]),
                    variance_policies: BTreeMap::from([
                        ("dpi_max".into(), VariancePolicy::UpperBound),
                    ]),
                }],
            },
        );
        e
    }

    fn record(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn wireless_requires_battery() {
        let e = engine(vec![CrossRule::RequiresField {
            when_field: "connection".into(),
            when_in: vec!["wireless".into()],
            requires: "battery_hours".into(),
        }]);
        let out = e.cross_validate("connection", &record(&[("connection", "wireless")]));
        assert!(!out.ok);
        assert_eq!(out.violations[0].field, "battery_hours");

        let out = e.cross_validate(
            "connection",
            &record(&[("connection", "wireless"), ("battery_hours", "90")]),
        );
        assert!(out.ok);

        let out = e.cross_validate("connection", &record(&[("connection", "wired")]));
        assert!(out.ok);
    }

    #[test]
    fn component_upper_bound_check() {
        let e = engine(vec![CrossRule::ComponentDbLookup {
            field: "dpi_max".into(),
            component_field: "sensor".into(),
            db: "sensors".into(),
            property: "dpi_max".into(),
            tolerance: 0.01,
        }]);
        // Claiming more DPI than the sensor can do is a contradiction.
        let out = e.cross_validate(
            "dpi_max",
            &record(&[("dpi_max", "40000"), ("sensor", "Focus Pro 35K")]),
        );
        assert!(!out.ok);
        assert_eq!(out.violations[0].rule, "component_db_lookup");

        // At or under the component value is fine.
        let out = e.cross_validate(
            "dpi_max",
            &record(&[("dpi_max", "35000"), ("sensor", "Focus Pro 35K")]),
        );
        assert!(out.ok);
    }

    #[test]
    fn group_completeness_counts_present() {
        let e = engine(vec![CrossRule::GroupCompleteness {
            name: "dimensions".into(),
            group: vec!["length_mm".into(), "width_mm".into(), "height_mm".into()],
            min_present: 3,
        }]);
        let out = e.cross_validate("length_mm", &record(&[("length_mm", "120"), ("width_mm", "60")]));
        assert!(!out.ok);
        assert_eq!(out.violations[0].field, "height_mm");

        let out = e.cross_validate(
            "length_mm",
            &record(&[("length_mm", "120"), ("width_mm", "60"), ("height_mm", "38")]),
        );
        assert!(out.ok);

        // An entirely absent group is not a violation.
        let out = e.cross_validate("length_mm", &record(&[]));
        assert!(out.ok);
    }

    #[test]
    fn mutual_exclusion_sets_unknown() {
        let e = engine(vec![CrossRule::MutualExclusion {
            field: "battery_hours".into(),
            when_field: "connection".into(),
            when_value: "wired".into(),
            reason: "wired_mouse_has_no_battery".into(),
        }]);
        let mut rec = record(&[("connection", "wired"), ("battery_hours", "90")]);
        let out = e.cross_validate("connection", &rec);
        assert!(!out.ok);

        let applied = set_unknown_with_reason(&mut rec, &out);
        assert_eq!(rec["battery_hours"], "unk");
        assert_eq!(applied[0].1, "wired_mouse_has_no_battery");
    }

    #[test]
    fn untriggered_rules_are_skipped() {
        let e = engine(vec![CrossRule::RequiresField {
            when_field: "connection".into(),
            when_in: vec!["wireless".into()],
            requires: "battery_hours".into(),
        }]);
        // A weight change cannot trigger the connection rule.
        let out = e.cross_validate("weight", &record(&[("connection", "wireless")]));
        assert!(out.ok);
    }
}
