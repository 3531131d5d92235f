// SPDX-License-Identifier: MIT OR Apache-2.0
//! Candidate value normalization.
//!
//! Raw extracted strings become contract-shaped values here: units parsed
//! and converted to the canonical unit, ranges enforced, URLs shape-checked,
//! component aliases resolved, polling lists split and cleaned. List values
//! use `|` as the item separator on the wire.

use regex::Regex;
use std::sync::OnceLock;
use tracing::trace;

use harvest_core::rules::{EnumPolicy, FieldContract, ScalarKind};

use crate::{CurationSignal, RulesEngine, reason};

/// The wire separator for list-shaped values.
pub const LIST_SEPARATOR: char = '|';

/// Extra context for normalization (reserved for per-run knobs).
#[derive(Debug, Clone, Default)]
pub struct NormalizeContext {
    /// Treat missing units as an error even when the rule does not.
    pub strict_units: bool,
}

/// Outcome of normalizing one candidate value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NormalizeOutcome {
    /// Whether the value is acceptable.
    pub ok: bool,
    /// The normalized value (empty on failure).
    pub normalized: String,
    /// Reason code on failure.
    pub reason_code: Option<String>,
    /// Names of the rules that fired, in order.
    pub applied_rules: Vec<String>,
    /// Curation suggestion for open enums / unresolved components.
    pub curation_signal: Option<CurationSignal>,
}

impl NormalizeOutcome {
    fn ok(normalized: String, applied: Vec<String>) -> Self {
        Self {
            ok: true,
            normalized,
            reason_code: None,
            applied_rules: applied,
            curation_signal: None,
        }
    }

    fn fail(code: &str, applied: Vec<String>) -> Self {
        Self {
            ok: false,
            normalized: String::new(),
            reason_code: Some(code.to_string()),
            applied_rules: applied,
            curation_signal: None,
        }
    }
}

fn number_with_unit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([+-]?\d+(?:[.,]\d+)?)\s*([a-zA-Z/%µ]+)?\s*$").expect("static regex")
    })
}

/// Multipliers into canonical units the category workbooks use.
fn unit_conversion(from: &str, to: &str) -> Option<f64> {
    match (from, to) {
        ("kg", "g") => Some(1000.0),
        ("oz", "g") => Some(28.3495),
        ("s", "ms") => Some(1000.0),
        ("khz", "hz") => Some(1000.0),
        ("cm", "mm") => Some(10.0),
        ("in", "mm") => Some(25.4),
        ("m", "mm") => Some(1000.0),
        _ => None,
    }
}

fn format_number(value: f64, value_form: Option<&str>) -> String {
    match value_form {
        Some("integer") => format!("{}", value.round() as i64),
        Some("one_decimal") => format!("{:.1}", value),
        _ => {
            if (value - value.round()).abs() < 1e-9 {
                format!("{}", value.round() as i64)
            } else {
                format!("{value}")
            }
        }
    }
}

struct ParsedNumber {
    value: f64,
    unit: Option<String>,
}

fn parse_number(raw: &str) -> Option<ParsedNumber> {
    let caps = number_with_unit_re().captures(raw)?;
    let num: f64 = caps.get(1)?.as_str().replace(',', ".").parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str().to_lowercase());
    Some(ParsedNumber { value: num, unit })
}

impl RulesEngine {
    /// Normalize one raw value against the field's rule.
    ///
    /// Unknown fields pass through trimmed: the rules engine constrains
    /// only what the category defines.
    #[must_use]
    pub fn normalize_candidate(
        &self,
        field_key: &str,
        raw: &str,
        ctx: &NormalizeContext,
    ) -> NormalizeOutcome {
        let raw = raw.trim();
        let Some(rule) = self.rules.rule(field_key) else {
            return NormalizeOutcome::ok(raw.to_string(), vec![]);
        };
        let mut applied: Vec<String> = vec![];

        // Component references resolve through their database first.
        if let Some(db_ref) = &rule.component_db_ref {
            if let Some(db) = self.component_dbs.get(db_ref) {
                if let Some(item) = db.resolve(raw) {
                    if !item.name.eq_ignore_ascii_case(raw) {
                        applied.push("component_alias".into());
                    }
                    return NormalizeOutcome::ok(item.name.clone(), applied);
                }
                if rule.enum_policy == EnumPolicy::Closed {
                    return NormalizeOutcome::fail(reason::COMPONENT_ALIAS_NOT_RESOLVED, applied);
                }
                let mut out = NormalizeOutcome::ok(raw.to_string(), applied);
                out.curation_signal = Some(CurationSignal {
                    field_key: field_key.to_string(),
                    value: raw.to_string(),
                    kind: "component".into(),
                });
                return out;
            }
            return NormalizeOutcome::fail(reason::COMPONENT_ALIAS_NOT_RESOLVED, applied);
        }

        match &rule.contract {
            FieldContract::Scalar { kind, unit, range, value_form } => self.normalize_scalar(
                rule,
                field_key,
                raw,
                *kind,
                unit.as_deref(),
                *range,
                value_form.as_deref(),
                ctx,
                applied,
            ),
            FieldContract::List { item, unit, value_form, .. } => {
                // Named templates split list inputs; `parse_polling_list`
                // handles "125/500/1000 Hz" and friends.
                if rule.parse.as_ref().is_some_and(|p| p.template == "polling_list") {
                    applied.push("parse_polling_list".into());
                }
                let items = split_list(raw);
                if items.is_empty() {
                    return NormalizeOutcome::fail(reason::NOT_NUMERIC, applied);
                }
                let mut normalized_items = Vec::with_capacity(items.len());
                for item_raw in items {
                    let out = self.normalize_scalar(
                        rule,
                        field_key,
                        &item_raw,
                        *item,
                        unit.as_deref(),
                        None,
                        value_form.as_deref(),
                        ctx,
                        vec![],
                    );
                    if !out.ok {
                        return NormalizeOutcome {
                            applied_rules: applied,
                            ..out
                        };
                    }
                    normalized_items.push(out.normalized);
                }
                let joined = normalized_items.join(&LIST_SEPARATOR.to_string());
                NormalizeOutcome::ok(joined, applied)
            }
            FieldContract::ObjectList { .. } => {
                // Object lists arrive pre-shaped as JSON; pass through after
                // a shape sanity check.
                match serde_json::from_str::<serde_json::Value>(raw) {
                    Ok(v) if v.is_array() => NormalizeOutcome::ok(raw.to_string(), applied),
                    _ => NormalizeOutcome::fail(reason::NOT_NUMERIC, applied),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn normalize_scalar(
        &self,
        rule: &harvest_core::rules::FieldRule,
        field_key: &str,
        raw: &str,
        kind: ScalarKind,
        canonical_unit: Option<&str>,
        range: Option<harvest_core::rules::NumericRange>,
        value_form: Option<&str>,
        ctx: &NormalizeContext,
        mut applied: Vec<String>,
    ) -> NormalizeOutcome {
        match kind {
            ScalarKind::Numeric => {
                let Some(parsed) = parse_number(raw) else {
                    return NormalizeOutcome::fail(reason::NOT_NUMERIC, applied);
                };
                let strict = ctx.strict_units
                    || rule.parse.as_ref().is_some_and(|p| p.strict_unit_required);
                let mut value = parsed.value;
                match (&parsed.unit, canonical_unit) {
                    (Some(u), Some(canon)) => {
                        let canon_l = canon.to_lowercase();
                        let accepted = rule
                            .parse
                            .as_ref()
                            .map(|p| p.unit_accepts.iter().any(|a| a.to_lowercase() == *u))
                            .unwrap_or(false);
                        if *u == canon_l || accepted {
                            // Accepted spelling of the canonical unit.
                        } else if let Some(factor) = unit_conversion(u, &canon_l) {
                            value *= factor;
                            applied.push("unit_converted".into());
                        } else {
                            return NormalizeOutcome::fail(reason::UNIT_REQUIRED, applied);
                        }
                    }
                    (None, Some(_)) if strict => {
                        return NormalizeOutcome::fail(reason::UNIT_REQUIRED, applied);
                    }
                    _ => {}
                }
                if let Some(range) = range {
                    applied.push("range_check".into());
                    if !range.contains(value) {
                        return NormalizeOutcome::fail(reason::OUT_OF_RANGE, applied);
                    }
                }
                trace!(field_key, value, "normalized numeric");
                NormalizeOutcome::ok(format_number(value, value_form), applied)
            }
            ScalarKind::Enum => {
                let outcome = self.enforce_enum_policy(field_key, raw);
                if !outcome.ok {
                    return NormalizeOutcome::fail(
                        outcome.reason_code.as_deref().unwrap_or(reason::ENUM_VALUE_NOT_ALLOWED),
                        applied,
                    );
                }
                if outcome.was_aliased {
                    applied.push("enum_alias".into());
                }
                let canonical = outcome.canonical_value.unwrap_or_else(|| raw.to_string());
                let mut out = NormalizeOutcome::ok(canonical.clone(), applied);
                if rule.enum_policy == EnumPolicy::Open
                    && self.known_values.resolve(field_key, &canonical).is_none()
                {
                    out.curation_signal = Some(CurationSignal {
                        field_key: field_key.to_string(),
                        value: canonical,
                        kind: "enum".into(),
                    });
                }
                out
            }
            ScalarKind::Url => match url::Url::parse(raw) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                    NormalizeOutcome::ok(raw.to_string(), applied)
                }
                _ => NormalizeOutcome::fail(reason::URL_REQUIRED, applied),
            },
            ScalarKind::Bool => match raw.to_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => NormalizeOutcome::ok("true".into(), applied),
                "false" | "no" | "n" | "0" => NormalizeOutcome::ok("false".into(), applied),
                _ => NormalizeOutcome::fail(reason::NOT_NUMERIC, applied),
            },
            ScalarKind::Text => NormalizeOutcome::ok(raw.to_string(), applied),
        }
    }
}

/// Split a raw list value on common separators, trimming blanks and a
/// shared trailing unit ("125/500/1000 Hz").
fn split_list(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    let items: Vec<&str> = raw
        .split([LIST_SEPARATOR, ',', '/', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        return vec![];
    }
    // A unit on the last item only ("1000 Hz") applies to every item.
    let last = items[items.len() - 1];
    if let Some(parsed) = parse_number(last)
        && let Some(unit) = parsed.unit
        && items.len() > 1
        && items[..items.len() - 1].iter().all(|i| {
            parse_number(i).is_some_and(|p| p.unit.is_none())
        })
    {
        return items
            .iter()
            .map(|i| match parse_number(i) {
                Some(p) if p.unit.is_none() => format!("{} {unit}", format_number(p.value, None)),
                _ => (*i).to_string(),
            })
            .collect();
    }
    items.iter().map(|s| (*s).to_string()).collect()
}
