// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-rules
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Evidence auditing: quotes, spans, hashes.
pub mod audit;
/// Cross-field constraint validation.
pub mod crossval;
/// Candidate value normalization.
pub mod normalize;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use harvest_core::candidate::UNKNOWN;
use harvest_core::rules::{ComponentDb, EnumPolicy, FieldRuleSet, KnownValues};

pub use audit::{AuditOptions, AuditOutcome, EvidenceClaim};
pub use crossval::{CrossOutcome, CrossRule, Violation, set_unknown_with_reason};
pub use normalize::{NormalizeContext, NormalizeOutcome};

/// Reason codes emitted by the engine. Closed sets per check.
pub mod reason {
    /// Numeric value outside the rule's range.
    pub const OUT_OF_RANGE: &str = "out_of_range";
    /// Closed enum rejected an unknown value.
    pub const ENUM_VALUE_NOT_ALLOWED: &str = "enum_value_not_allowed";
    /// Field requires an absolute http(s) URL.
    pub const URL_REQUIRED: &str = "url_required";
    /// Component reference did not resolve through the database.
    pub const COMPONENT_ALIAS_NOT_RESOLVED: &str = "component_alias_not_resolved";
    /// A unit was required but absent.
    pub const UNIT_REQUIRED: &str = "unit_required";
    /// Raw value was not numeric where the contract demands one.
    pub const NOT_NUMERIC: &str = "not_numeric";
    /// Evidence references missing or incomplete.
    pub const MISSING_EVIDENCE_REFS: &str = "missing_evidence_refs";
    /// Claimed snippet hash does not match the pack.
    pub const SNIPPET_HASH_MISMATCH: &str = "snippet_hash_mismatch";
    /// Numeric value not present in the cited snippet.
    pub const NUMERIC_VALUE_NOT_IN_SNIPPET: &str = "numeric_value_not_in_snippet";
    /// Quote not present in the cited snippet.
    pub const QUOTE_NOT_IN_SNIPPET: &str = "quote_not_in_snippet";
    /// Quote span does not reproduce the quote.
    pub const QUOTE_SPAN_MISMATCH: &str = "quote_span_mismatch";
    /// Quote span out of bounds or inverted.
    pub const QUOTE_SPAN_INVALID: &str = "quote_span_invalid";
}

/// Errors from loading compiled artifacts.
#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    /// An artifact file could not be read.
    #[error("failed to read artifact {path}: {source}")]
    Io {
        /// The artifact path.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An artifact file could not be parsed.
    #[error("failed to parse artifact {path}: {source}")]
    Parse {
        /// The artifact path.
        path: String,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// A suggestion recorded when an open enum sees an unknown value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurationSignal {
    /// Field the value was seen on.
    pub field_key: String,
    /// The unknown value, as normalized.
    pub value: String,
    /// Kind of suggestion (`"enum"` or `"component"`).
    pub kind: String,
}

/// Outcome of enum policy enforcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumOutcome {
    /// Whether the value is acceptable.
    pub ok: bool,
    /// The canonical spelling when resolution succeeded.
    pub canonical_value: Option<String>,
    /// Whether resolution went through an alias.
    pub was_aliased: bool,
    /// Reason code on rejection.
    pub reason_code: Option<String>,
}

/// Result of normalizing a whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullRecordOutcome {
    /// Field → normalized value (`"unk"` where normalization failed).
    pub normalized: BTreeMap<String, String>,
    /// Fields that failed, with their reason codes.
    pub unknowns: Vec<(String, String)>,
}

/// The loaded rules engine for one category.
#[derive(Debug, Clone, Default)]
pub struct RulesEngine {
    /// Compiled field rules.
    pub rules: FieldRuleSet,
    /// Known-value tables.
    pub known_values: KnownValues,
    /// Cross-validation rules.
    pub cross_rules: Vec<CrossRule>,
    /// Deprecated field name → current name.
    pub key_migrations: BTreeMap<String, String>,
    /// Component type → database.
    pub component_dbs: BTreeMap<String, ComponentDb>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, RulesError> {
    let raw = std::fs::read_to_string(path).map_err(|source| RulesError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| RulesError::Parse {
        path: path.display().to_string(),
        source,
    })
}

impl RulesEngine {
    /// Build an engine from already-loaded artifacts.
    #[must_use]
    pub fn new(
        rules: FieldRuleSet,
        known_values: KnownValues,
        cross_rules: Vec<CrossRule>,
        key_migrations: BTreeMap<String, String>,
        component_dbs: BTreeMap<String, ComponentDb>,
    ) -> Self {
        Self {
            rules,
            known_values,
            cross_rules,
            key_migrations,
            component_dbs,
        }
    }

    /// Load the engine from a `_generated` artifact directory.
    ///
    /// Optional artifacts (cross rules, migrations, component DBs) load as
    /// empty when their files are absent.
    ///
    /// # Errors
    ///
    /// [`RulesError`] when a present artifact cannot be read or parsed.
    pub fn load(generated_dir: impl AsRef<Path>) -> Result<Self, RulesError> {
        let dir = generated_dir.as_ref();
        let rules: FieldRuleSet = read_json(&dir.join("field_rules.runtime.json"))?;
        let known_values: KnownValues = read_json(&dir.join("known_values.json"))?;

        let cross_path = dir.join("cross_validation_rules.json");
        let cross_rules: Vec<CrossRule> = if cross_path.exists() {
            read_json(&cross_path)?
        } else {
            vec![]
        };

        let migrations_path = dir.join("key_migrations.json");
        let key_migrations: BTreeMap<String, String> = if migrations_path.exists() {
            read_json(&migrations_path)?
        } else {
            BTreeMap::new()
        };

        let mut component_dbs = BTreeMap::new();
        let db_dir = dir.join("component_db");
        if db_dir.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(&db_dir)
                .map_err(|source| RulesError::Io {
                    path: db_dir.display().to_string(),
                    source,
                })?
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            entries.sort();
            for path in entries {
                let db: ComponentDb = read_json(&path)?;
                component_dbs.insert(db.component_type.clone(), db);
            }
        }

        Ok(Self::new(rules, known_values, cross_rules, key_migrations, component_dbs))
    }

    /// Enforce the field's enum policy on an already-normalized value.
    #[must_use]
    pub fn enforce_enum_policy(&self, field_key: &str, value: &str) -> EnumOutcome {
        let policy = self
            .rules
            .rule(field_key)
            .map_or(EnumPolicy::None, |r| r.enum_policy);
        if policy == EnumPolicy::None {
            return EnumOutcome {
                ok: true,
                canonical_value: Some(value.to_string()),
                was_aliased: false,
                reason_code: None,
            };
        }
        match self.known_values.resolve(field_key, value) {
            Some(hit) => EnumOutcome {
                ok: true,
                canonical_value: Some(hit.canonical),
                was_aliased: hit.was_aliased,
                reason_code: None,
            },
            None => match policy {
                EnumPolicy::Closed => EnumOutcome {
                    ok: false,
                    canonical_value: None,
                    was_aliased: false,
                    reason_code: Some(reason::ENUM_VALUE_NOT_ALLOWED.to_string()),
                },
                // Open enums accept the value as-is; the curation signal is
                // attached by normalize_candidate.
                EnumPolicy::Open | EnumPolicy::None => EnumOutcome {
                    ok: true,
                    canonical_value: Some(value.to_string()),
                    was_aliased: false,
                    reason_code: None,
                },
            },
        }
    }

    /// Rewrite deprecated field names to their current names.
    ///
    /// Current-name entries always win over migrated ones.
    #[must_use]
    pub fn apply_key_migrations(
        &self,
        record: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (key, value) in record {
            let target = self.key_migrations.get(key).unwrap_or(key);
            if target != key && record.contains_key(target) {
                continue;
            }
            out.insert(target.clone(), value.clone());
        }
        out
    }

    /// The composed pipeline: migrations, then per-field normalization.
    ///
    /// Deterministic: identical input yields identical output every call.
    #[must_use]
    pub fn normalize_full_record(
        &self,
        record: &BTreeMap<String, String>,
        ctx: &NormalizeContext,
    ) -> FullRecordOutcome {
        let migrated = self.apply_key_migrations(record);
        let mut normalized = BTreeMap::new();
        let mut unknowns = Vec::new();
        for (field_key, raw) in &migrated {
            let outcome = self.normalize_candidate(field_key, raw, ctx);
            if outcome.ok {
                normalized.insert(field_key.clone(), outcome.normalized);
            } else {
                normalized.insert(field_key.clone(), UNKNOWN.to_string());
                unknowns.push((
                    field_key.clone(),
                    outcome.reason_code.unwrap_or_else(|| "unknown".to_string()),
                ));
            }
        }
        FullRecordOutcome { normalized, unknowns }
    }
}
