// SPDX-License-Identifier: MIT OR Apache-2.0
//! Compiled field rules: the per-field contract the runtime works against.
//!
//! Rules are heterogeneous — scalar numerics, closed enums, lists with union
//! policies, component references, URLs — so the contract is a tagged
//! variant rather than a bag of optional fields. Unknown contract types are
//! a deserialization error, which is what makes bad workbook input a
//! compile-time failure instead of a silent runtime surprise.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Required level / difficulty / availability
// ---------------------------------------------------------------------------

/// How important a field is to a finished record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RequiredLevel {
    /// Part of the identity lock; never resolved by consensus.
    Identity,
    /// Must be present and must meet its pass target for a publishable record.
    Critical,
    /// Must be present for a publishable record.
    Required,
    /// Expected on a complete record but absence does not block publishing.
    Expected,
    /// Nice to have.
    Optional,
}

impl RequiredLevel {
    /// Weight used by the need-set scorer. Higher means more urgent.
    #[must_use]
    pub fn need_weight(self) -> f64 {
        match self {
            RequiredLevel::Identity => 100.0,
            RequiredLevel::Critical => 80.0,
            RequiredLevel::Required => 60.0,
            RequiredLevel::Expected => 30.0,
            RequiredLevel::Optional => 10.0,
        }
    }
}

/// How hard a field usually is to source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    /// Printed on every product page.
    Easy,
    /// Findable with ordinary digging.
    #[default]
    Moderate,
    /// Requires teardown articles, lab measurements, or vendor PDFs.
    Hard,
}

/// How widely a field is published across sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Most sources carry it.
    #[default]
    Common,
    /// Some sources carry it.
    Uncommon,
    /// Only specialist sources carry it.
    Rare,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Scalar value kinds. This is the closed `type` set; anything else fails
/// the compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    /// Numeric value, optionally unit-bearing.
    Numeric,
    /// Value drawn from a known-values table.
    Enum,
    /// An absolute http(s) URL.
    Url,
    /// Free text.
    Text,
    /// Boolean flag.
    Bool,
}

/// Inclusive numeric range constraint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NumericRange {
    /// Lowest accepted value.
    pub min: f64,
    /// Highest accepted value.
    pub max: f64,
}

impl NumericRange {
    /// Whether `v` falls inside the range (inclusive both ends).
    #[must_use]
    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }
}

/// Union policy for list-shaped fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ItemUnion {
    /// Merge items from approved candidates, deduplicating case-insensitively.
    SetUnion,
    /// Set union that additionally preserves each contributor's item order.
    OrderedUnion,
    /// Reserved; currently a no-op.
    EvidenceUnion,
}

/// Rules applying to list-shaped contracts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct ListRules {
    /// How values from multiple sources combine after consensus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_union: Option<ItemUnion>,
    /// Hard cap on merged list length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
}

/// The shape-tagged field contract.
///
/// Serialized with `shape` as the tag so compiled artifacts read as
/// `{"shape": "scalar", "type": "numeric", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum FieldContract {
    /// Single value.
    Scalar {
        /// Value kind.
        #[serde(rename = "type")]
        kind: ScalarKind,
        /// Canonical unit for numeric values (e.g. `"g"`, `"ms"`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        /// Accepted numeric range.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<NumericRange>,
        /// Presentation form hint (e.g. `"integer"`, `"one_decimal"`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value_form: Option<String>,
    },
    /// List of scalar items.
    List {
        /// Item kind.
        #[serde(rename = "type")]
        item: ScalarKind,
        /// Union policy and caps.
        #[serde(default)]
        list_rules: ListRules,
        /// Canonical unit for numeric items.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        /// Presentation form hint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value_form: Option<String>,
    },
    /// List of structured objects.
    ObjectList {
        /// Property name → scalar kind.
        object_schema: BTreeMap<String, ScalarKind>,
        /// Union policy and caps.
        #[serde(default)]
        list_rules: ListRules,
    },
}

impl FieldContract {
    /// Whether the contract is list-shaped (`List` or `ObjectList`).
    #[must_use]
    pub fn is_list(&self) -> bool {
        matches!(self, FieldContract::List { .. } | FieldContract::ObjectList { .. })
    }

    /// The list rules, when list-shaped.
    #[must_use]
    pub fn list_rules(&self) -> Option<&ListRules> {
        match self {
            FieldContract::List { list_rules, .. } | FieldContract::ObjectList { list_rules, .. } => {
                Some(list_rules)
            }
            FieldContract::Scalar { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Enum acceptance policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnumPolicy {
    /// Unknown values are accepted and recorded as curation suggestions.
    Open,
    /// Unknown values are rejected.
    Closed,
    /// Field is not enum-constrained.
    #[default]
    None,
}

/// What to do when sources disagree past the clustering rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Prefer the lowest-tier (most authoritative) cluster.
    #[default]
    PreferHigherTier,
    /// Let weighted majority stand.
    Majority,
    /// Any unresolved conflict yields `unk`.
    Strict,
}

/// Evidence requirements attached to a field rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EvidencePolicy {
    /// Whether candidates must carry evidence references at all.
    pub required: bool,
    /// Minimum number of evidence references on an accepted value.
    pub min_evidence_refs: u32,
    /// Minimum number of distinct root domains backing an accepted value.
    pub distinct_sources_required: u32,
    /// Preferred tiers, most preferred first.
    pub tier_preference: Vec<u8>,
    /// Conflict handling past clustering.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Confirmations must come from instrumented-tagged domains.
    #[serde(default)]
    pub requires_instrumented_domains: bool,
}

impl Default for EvidencePolicy {
    fn default() -> Self {
        Self {
            required: true,
            min_evidence_refs: 1,
            distinct_sources_required: 1,
            tier_preference: vec![1, 2],
            conflict_policy: ConflictPolicy::default(),
            requires_instrumented_domains: false,
        }
    }
}

/// Named selection policies used to nudge tied consensus clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicyName {
    /// No-op; keep the confidence ordering as-is.
    BestConfidence,
    /// Bonus per cluster candidate carrying an evidence citation.
    BestEvidence,
    /// Bonus for non-LLM extraction methods.
    PreferDeterministic,
    /// Bonus for LLM extraction methods.
    PreferLlm,
    /// Bonus weighted by candidate recency.
    PreferLatest,
}

/// The reduce rule marker for object-form selection policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReduceRule {
    /// Derive a scalar from a list field.
    Reduce,
}

/// Object-form selection policy: derive a scalar from a list field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReducePolicy {
    /// The list field the scalar is derived from.
    pub source_field: String,
    /// Tolerance window for treating values as agreeing.
    pub tolerance_ms: f64,
    /// Always `"reduce"`.
    pub rule: ReduceRule,
}

/// A field's selection policy: either a named nudge or a reducer object.
///
/// The two wire forms are distinguished structurally (string vs object),
/// mirroring the artifact format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum SelectionPolicy {
    /// String form.
    Named(SelectionPolicyName),
    /// Object form.
    Reduce(ReducePolicy),
}

// ---------------------------------------------------------------------------
// Parse spec / UI
// ---------------------------------------------------------------------------

/// How raw strings for this field are parsed before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct ParseSpec {
    /// Named parse template (e.g. `"number_with_unit"`, `"polling_list"`).
    pub template: String,
    /// Unit spellings accepted on input, mapped to the canonical unit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unit_accepts: Vec<String>,
    /// Reject unit-less raw values.
    #[serde(default)]
    pub strict_unit_required: bool,
}

/// Presentation metadata carried through to UI catalogs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct UiSpec {
    /// Human-facing label.
    pub label: String,
    /// Grouping key for presentation.
    #[serde(default)]
    pub group: String,
    /// Sort order inside the group.
    #[serde(default)]
    pub order: u32,
}

// ---------------------------------------------------------------------------
// FieldRule
// ---------------------------------------------------------------------------

/// The full per-field compiled contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FieldRule {
    /// Field key (snake_case).
    pub key: String,
    /// Importance level.
    pub required_level: RequiredLevel,
    /// Sourcing difficulty.
    #[serde(default)]
    pub difficulty: Difficulty,
    /// Publication availability.
    #[serde(default)]
    pub availability: Availability,
    /// Shape/type contract.
    pub contract: FieldContract,
    /// Enum acceptance policy.
    #[serde(default)]
    pub enum_policy: EnumPolicy,
    /// Parse template configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse: Option<ParseSpec>,
    /// Evidence requirements.
    #[serde(default)]
    pub evidence: EvidencePolicy,
    /// Tie-break / reduction policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_policy: Option<SelectionPolicy>,
    /// Component database this field resolves against (e.g. `"sensors"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_db_ref: Option<String>,
    /// Query fragments that help discovery find this field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_hints: Vec<String>,
    /// Free-form constraint knobs consumed by cross-validation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub constraints: BTreeMap<String, serde_json::Value>,
    /// Presentation metadata.
    #[serde(default)]
    pub ui: UiSpec,
    /// Value requires measurement by an instrumented domain.
    #[serde(default)]
    pub requires_instrumented: bool,
}

impl FieldRule {
    /// Whether the below-pass-target acceptance path is ever allowed for
    /// this field. Instrumented fields are excluded unconditionally.
    #[must_use]
    pub fn instrumented(&self) -> bool {
        self.requires_instrumented || self.evidence.requires_instrumented_domains
    }

    /// Minimal rule used by tests and defaults: a plain text scalar.
    #[must_use]
    pub fn text(key: impl Into<String>, level: RequiredLevel) -> Self {
        Self {
            key: key.into(),
            required_level: level,
            difficulty: Difficulty::default(),
            availability: Availability::default(),
            contract: FieldContract::Scalar {
                kind: ScalarKind::Text,
                unit: None,
                range: None,
                value_form: None,
            },
            enum_policy: EnumPolicy::None,
            parse: None,
            evidence: EvidencePolicy::default(),
            selection_policy: None,
            component_db_ref: None,
            search_hints: vec![],
            constraints: BTreeMap::new(),
            ui: UiSpec::default(),
            requires_instrumented: false,
        }
    }
}

/// The compiled rule set for a category, keyed by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct FieldRuleSet {
    /// Artifact format version.
    pub version: String,
    /// Category slug.
    pub category: String,
    /// Field key → rule, deterministic order.
    pub fields: BTreeMap<String, FieldRule>,
    /// When `selected_keys` restricted the compile, the kept keys.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_fields: Vec<String>,
}

impl FieldRuleSet {
    /// Rule lookup by field key.
    #[must_use]
    pub fn rule(&self, field_key: &str) -> Option<&FieldRule> {
        self.fields.get(field_key)
    }

    /// Field keys in deterministic order.
    pub fn field_keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Known values
// ---------------------------------------------------------------------------

/// One canonical enum value and its accepted alias spellings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KnownValue {
    /// Canonical spelling.
    pub canonical: String,
    /// Alias spellings mapped to the canonical form (case-insensitive).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

/// Per-category, per-field canonical enum sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct KnownValues {
    /// Field key → value set, deterministic order.
    pub fields: BTreeMap<String, Vec<KnownValue>>,
}

/// Result of resolving a raw string against a known-values table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownValueHit {
    /// The canonical spelling.
    pub canonical: String,
    /// Whether resolution went through an alias rather than an exact match.
    pub was_aliased: bool,
}

impl KnownValues {
    /// Resolve `raw` for `field_key`, case-insensitively, through canonicals
    /// and aliases.
    #[must_use]
    pub fn resolve(&self, field_key: &str, raw: &str) -> Option<KnownValueHit> {
        let values = self.fields.get(field_key)?;
        let needle = raw.trim().to_lowercase();
        for v in values {
            if v.canonical.to_lowercase() == needle {
                return Some(KnownValueHit {
                    canonical: v.canonical.clone(),
                    was_aliased: false,
                });
            }
            if v.aliases.iter().any(|a| a.to_lowercase() == needle) {
                return Some(KnownValueHit {
                    canonical: v.canonical.clone(),
                    was_aliased: true,
                });
            }
        }
        None
    }

    /// Whether the table has any entries for `field_key`.
    #[must_use]
    pub fn covers(&self, field_key: &str) -> bool {
        self.fields.get(field_key).is_some_and(|v| !v.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Component DB
// ---------------------------------------------------------------------------

/// How a component property may vary relative to a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariancePolicy {
    /// The component value is the truth; field values must match it.
    #[default]
    Authoritative,
    /// Field values may not exceed the component value.
    UpperBound,
    /// Field values may not fall below the component value.
    LowerBound,
    /// Field values must fall inside the component's stated range.
    Range,
}

/// One item in a component database (a sensor, switch, encoder, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ComponentItem {
    /// Canonical component name.
    pub name: String,
    /// Manufacturer.
    #[serde(default)]
    pub maker: String,
    /// Accepted alias spellings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    /// Property name → value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Property name → variance policy.
    #[serde(
        rename = "__variance_policies",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub variance_policies: BTreeMap<String, VariancePolicy>,
}

/// A typed component database (all sensors, all switches, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct ComponentDb {
    /// Component type slug (e.g. `"sensors"`).
    pub component_type: String,
    /// Field keys whose values identify an item of this type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub property_keys: Vec<String>,
    /// The items, sorted by name.
    pub items: Vec<ComponentItem>,
}

impl ComponentDb {
    /// Resolve a raw component name through canonicals and aliases,
    /// case-insensitively.
    #[must_use]
    pub fn resolve(&self, raw: &str) -> Option<&ComponentItem> {
        let needle = raw.trim().to_lowercase();
        self.items.iter().find(|item| {
            item.name.to_lowercase() == needle
                || item.aliases.iter().any(|a| a.to_lowercase() == needle)
        })
    }
}
