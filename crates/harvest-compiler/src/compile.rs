// SPDX-License-Identifier: MIT OR Apache-2.0
//! Compilation: workbook rows → typed artifacts.

use std::collections::BTreeMap;
use tracing::info;

use harvest_core::ARTIFACT_VERSION;
use harvest_core::rules::{
    Availability, ComponentDb, ComponentItem, ConflictPolicy, Difficulty, EnumPolicy,
    EvidencePolicy, FieldContract, FieldRule, FieldRuleSet, ItemUnion, KnownValue, KnownValues,
    ListRules, NumericRange, ParseSpec, RequiredLevel, ScalarKind, SelectionPolicy,
    SelectionPolicyName, UiSpec, VariancePolicy,
};
use harvest_rules::CrossRule;

use crate::model::{CompileError, WorkbookMap, WorkbookSource};

/// One UI catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UiEntry {
    /// Field key.
    pub key: String,
    /// Human label.
    pub label: String,
    /// Presentation group.
    pub group: String,
    /// Sort order.
    pub order: u32,
}

/// Everything one compile produces, before it hits disk.
#[derive(Debug, Clone)]
pub struct CompiledArtifacts {
    /// The full field rules (control plane).
    pub field_rules: FieldRuleSet,
    /// The runtime-facing rules (identical when no control-plane split
    /// applies).
    pub field_rules_runtime: FieldRuleSet,
    /// Known-value tables.
    pub known_values: KnownValues,
    /// Ordered UI catalog.
    pub ui_catalog: Vec<UiEntry>,
    /// Field → parse template.
    pub parse_templates: BTreeMap<String, ParseSpec>,
    /// Cross-validation rules.
    pub cross_rules: Vec<CrossRule>,
    /// Key migrations.
    pub key_migrations: BTreeMap<String, String>,
    /// Component databases by type.
    pub component_dbs: BTreeMap<String, ComponentDb>,
    /// Validation warnings collected along the way.
    pub warnings: Vec<String>,
}

/// Header-indexed access to one sheet row.
struct Row<'a> {
    header: &'a BTreeMap<String, usize>,
    cells: &'a [String],
}

impl Row<'_> {
    fn get(&self, column: &str) -> Option<&str> {
        self.header
            .get(column)
            .and_then(|idx| self.cells.get(*idx))
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    fn flag(&self, column: &str) -> bool {
        self.get(column)
            .is_some_and(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "yes" | "1"))
    }
}

fn header_index(rows: &[Vec<String>]) -> BTreeMap<String, usize> {
    rows.first()
        .map(|header| {
            header
                .iter()
                .enumerate()
                .map(|(i, name)| (name.trim().to_lowercase(), i))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_scalar_kind(raw: &str) -> Result<ScalarKind, String> {
    match raw.trim().to_lowercase().as_str() {
        "numeric" | "number" => Ok(ScalarKind::Numeric),
        "enum" => Ok(ScalarKind::Enum),
        "url" => Ok(ScalarKind::Url),
        "text" | "string" => Ok(ScalarKind::Text),
        "bool" | "boolean" => Ok(ScalarKind::Bool),
        other => Err(format!("unknown contract type '{other}'")),
    }
}

fn parse_required_level(raw: Option<&str>) -> RequiredLevel {
    match raw.map(|s| s.trim().to_lowercase()).as_deref() {
        Some("identity") => RequiredLevel::Identity,
        Some("critical") => RequiredLevel::Critical,
        Some("required") => RequiredLevel::Required,
        Some("optional") => RequiredLevel::Optional,
        _ => RequiredLevel::Expected,
    }
}

fn parse_selection_policy(raw: &str) -> Option<SelectionPolicy> {
    let name = match raw.trim().to_lowercase().as_str() {
        "best_confidence" => SelectionPolicyName::BestConfidence,
        "best_evidence" => SelectionPolicyName::BestEvidence,
        "prefer_deterministic" => SelectionPolicyName::PreferDeterministic,
        "prefer_llm" => SelectionPolicyName::PreferLlm,
        "prefer_latest" => SelectionPolicyName::PreferLatest,
        _ => return None,
    };
    Some(SelectionPolicy::Named(name))
}

fn parse_variance_policy(raw: &str) -> Option<VariancePolicy> {
    match raw.trim().to_lowercase().as_str() {
        "authoritative" => Some(VariancePolicy::Authoritative),
        "upper_bound" => Some(VariancePolicy::UpperBound),
        "lower_bound" => Some(VariancePolicy::LowerBound),
        "range" => Some(VariancePolicy::Range),
        _ => None,
    }
}

fn field_rule_from_row(row: &Row<'_>, errors: &mut Vec<String>) -> Option<FieldRule> {
    let key = row.get("key")?.trim().to_string();

    let kind = match parse_scalar_kind(row.get("type").unwrap_or("")) {
        Ok(kind) => kind,
        Err(err) => {
            errors.push(format!("field '{key}': {err}"));
            return None;
        }
    };

    let unit = row.get("unit").map(|s| s.trim().to_lowercase());
    let range = match (row.get("range_min"), row.get("range_max")) {
        (Some(min), Some(max)) => match (min.trim().parse(), max.trim().parse()) {
            (Ok(min), Ok(max)) => Some(NumericRange { min, max }),
            _ => {
                errors.push(format!("field '{key}': non-numeric range bounds"));
                None
            }
        },
        _ => None,
    };
    let value_form = row.get("value_form").map(|s| s.trim().to_string());

    let shape = row.get("shape").map(|s| s.trim().to_lowercase());
    let contract = match shape.as_deref() {
        None | Some("scalar") => FieldContract::Scalar { kind, unit, range, value_form },
        Some("list") => {
            let item_union = row.get("item_union").and_then(|raw| {
                match raw.trim().to_lowercase().as_str() {
                    "set_union" => Some(ItemUnion::SetUnion),
                    "ordered_union" => Some(ItemUnion::OrderedUnion),
                    "evidence_union" => Some(ItemUnion::EvidenceUnion),
                    _ => None,
                }
            });
            let max_items = row.get("max_items").and_then(|s| s.trim().parse().ok());
            FieldContract::List {
                item: kind,
                list_rules: ListRules { item_union, max_items },
                unit,
                value_form,
            }
        }
        Some(other) => {
            errors.push(format!("field '{key}': unknown shape '{other}'"));
            return None;
        }
    };

    let enum_policy = match row.get("enum_policy").map(|s| s.trim().to_lowercase()).as_deref() {
        Some("open") => EnumPolicy::Open,
        Some("closed") => EnumPolicy::Closed,
        _ => EnumPolicy::None,
    };

    let parse = row.get("parse_template").map(|template| ParseSpec {
        template: template.trim().to_string(),
        unit_accepts: row
            .get("unit_accepts")
            .map(|s| s.split(';').map(|u| u.trim().to_lowercase()).filter(|u| !u.is_empty()).collect())
            .unwrap_or_default(),
        strict_unit_required: row.flag("strict_unit"),
    });

    let tier_preference: Vec<u8> = row
        .get("tier_preference")
        .map(|s| s.split(',').filter_map(|t| t.trim().parse().ok()).collect())
        .unwrap_or_else(|| vec![1, 2]);

    let evidence = EvidencePolicy {
        required: true,
        min_evidence_refs: row.get("min_refs").and_then(|s| s.trim().parse().ok()).unwrap_or(1),
        distinct_sources_required: row
            .get("distinct_sources")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(1),
        tier_preference,
        conflict_policy: ConflictPolicy::default(),
        requires_instrumented_domains: row.flag("requires_instrumented"),
    };

    Some(FieldRule {
        key: key.clone(),
        required_level: parse_required_level(row.get("required_level")),
        difficulty: match row.get("difficulty").map(|s| s.trim().to_lowercase()).as_deref() {
            Some("easy") => Difficulty::Easy,
            Some("hard") => Difficulty::Hard,
            _ => Difficulty::Moderate,
        },
        availability: match row.get("availability").map(|s| s.trim().to_lowercase()).as_deref() {
            Some("uncommon") => Availability::Uncommon,
            Some("rare") => Availability::Rare,
            _ => Availability::Common,
        },
        contract,
        enum_policy,
        parse,
        evidence,
        selection_policy: row.get("selection_policy").and_then(parse_selection_policy),
        component_db_ref: row.get("component_db").map(|s| s.trim().to_string()),
        search_hints: row
            .get("search_hints")
            .map(|s| s.split(';').map(|h| h.trim().to_string()).filter(|h| !h.is_empty()).collect())
            .unwrap_or_default(),
        constraints: BTreeMap::new(),
        ui: UiSpec {
            label: row.get("label").unwrap_or(&key).trim().to_string(),
            group: row.get("group").unwrap_or("general").trim().to_string(),
            order: row.get("order").and_then(|s| s.trim().parse().ok()).unwrap_or(0),
        },
        requires_instrumented: row.flag("requires_instrumented"),
    })
}

fn apply_override(rule: &mut FieldRule, patch: &crate::model::FieldOverride) {
    // Slot-wise overwrite: latest wins, whole slot at a time.
    if let Some(level) = patch.required_level {
        rule.required_level = level;
    }
    if let Some(parse) = &patch.parse {
        rule.parse = Some(parse.clone());
    }
    if let Some(evidence) = &patch.evidence {
        rule.evidence = evidence.clone();
    }
    if let Some(policy) = &patch.selection_policy {
        rule.selection_policy = Some(policy.clone());
    }
    if let Some(instrumented) = patch.requires_instrumented {
        rule.requires_instrumented = instrumented;
    }
}

/// Compile the workbook into typed artifacts.
///
/// # Errors
///
/// [`CompileError::Validation`] on map or field-row problems (unknown
/// contract types fail the compile); [`CompileError::Workbook`] on
/// unreadable sheets.
pub fn compile(
    map: &WorkbookMap,
    workbook: &dyn WorkbookSource,
) -> Result<CompiledArtifacts, CompileError> {
    map.validate(workbook)?;
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    // --- field rules -------------------------------------------------------
    let key_rows = workbook.rows(&map.key_sheet)?;
    let header = header_index(&key_rows);
    let mut fields: BTreeMap<String, FieldRule> = BTreeMap::new();
    for cells in key_rows.iter().skip(1) {
        let row = Row { header: &header, cells };
        if let Some(rule) = field_rule_from_row(&row, &mut errors) {
            fields.insert(rule.key.clone(), rule);
        }
    }
    if !errors.is_empty() {
        return Err(CompileError::Validation { errors });
    }

    // selected_keys restricts the output and is recorded on the schema.
    let include_fields: Vec<String> = if map.selected_keys.is_empty() {
        vec![]
    } else {
        let mut keep: Vec<String> = map
            .selected_keys
            .iter()
            .filter(|k| fields.contains_key(*k))
            .cloned()
            .collect();
        keep.sort();
        for missing in map.selected_keys.iter().filter(|k| !fields.contains_key(*k)) {
            warnings.push(format!("selected key '{missing}' not defined in key sheet"));
        }
        fields.retain(|key, _| keep.contains(key));
        keep
    };

    // Overrides win, slot-wise.
    for (key, patch) in &map.field_overrides {
        match fields.get_mut(key) {
            Some(rule) => apply_override(rule, patch),
            None => warnings.push(format!("override for unknown field '{key}'")),
        }
    }

    // --- known values ------------------------------------------------------
    let mut known = KnownValues::default();
    for source in &map.enum_sources {
        let rows = workbook.rows(&source.sheet)?;
        let mut values = Vec::new();
        for cells in rows.iter().skip(1) {
            let Some(canonical) = cells.first().map(|s| s.trim()).filter(|s| !s.is_empty()) else {
                continue;
            };
            let aliases = cells
                .get(1)
                .map(|s| {
                    s.split(';')
                        .map(str::trim)
                        .filter(|a| !a.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            values.push(KnownValue { canonical: canonical.to_string(), aliases });
        }
        values.sort_by(|a, b| a.canonical.cmp(&b.canonical));
        known.fields.insert(source.field_key.clone(), values);
    }
    // manual_enum_values merge on every compile.
    for (field_key, extra) in &map.manual_enum_values {
        let values = known.fields.entry(field_key.clone()).or_default();
        for value in extra {
            if !values.iter().any(|v| v.canonical.eq_ignore_ascii_case(value)) {
                values.push(KnownValue { canonical: value.clone(), aliases: vec![] });
            }
        }
        values.sort_by(|a, b| a.canonical.cmp(&b.canonical));
    }

    // --- component databases ----------------------------------------------
    let mut component_dbs: BTreeMap<String, ComponentDb> = BTreeMap::new();
    for source in &map.component_sources {
        let rows = workbook.rows(&source.sheet)?;
        let header = header_index(&rows);
        let mut items = Vec::new();
        for cells in rows.iter().skip(1) {
            let row = Row { header: &header, cells };
            let Some(name) = row.get(&source.roles.name.to_lowercase()) else { continue };
            let mut properties = BTreeMap::new();
            let mut variance_policies = BTreeMap::new();
            for prop in &source.roles.properties {
                let Some(raw) = row.get(&prop.column.to_lowercase()) else { continue };
                let declared = prop.variance_policy.as_deref().and_then(parse_variance_policy);
                match raw.trim().parse::<f64>() {
                    Ok(number) => {
                        properties.insert(prop.property.clone(), serde_json::json!(number));
                        if let Some(policy) = declared {
                            variance_policies.insert(prop.property.clone(), policy);
                        }
                    }
                    Err(_) => {
                        properties
                            .insert(prop.property.clone(), serde_json::json!(raw.trim()));
                        // String properties cannot be bounded numerically.
                        if declared.is_some_and(|p| p != VariancePolicy::Authoritative) {
                            warnings.push(format!(
                                "component '{}' property '{}': variance policy on string property coerced to authoritative",
                                name, prop.property
                            ));
                        }
                        variance_policies
                            .insert(prop.property.clone(), VariancePolicy::Authoritative);
                    }
                }
            }
            items.push(ComponentItem {
                name: name.trim().to_string(),
                maker: source
                    .roles
                    .maker
                    .as_deref()
                    .and_then(|col| row.get(&col.to_lowercase()))
                    .unwrap_or("")
                    .trim()
                    .to_string(),
                aliases: source
                    .roles
                    .aliases
                    .as_deref()
                    .and_then(|col| row.get(&col.to_lowercase()))
                    .map(|s| {
                        s.split(';')
                            .map(str::trim)
                            .filter(|a| !a.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                properties,
                variance_policies,
            });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));

        // `field_key` bindings aggregate into the db's property_keys.
        let mut property_keys: Vec<String> = source
            .roles
            .properties
            .iter()
            .filter_map(|p| p.field_key.clone())
            .collect();
        property_keys.sort();
        property_keys.dedup();

        component_dbs.insert(
            source.component_type.clone(),
            ComponentDb {
                component_type: source.component_type.clone(),
                property_keys,
                items,
            },
        );
    }

    // --- derived artifacts -------------------------------------------------
    let mut ui_catalog: Vec<UiEntry> = fields
        .values()
        .map(|rule| UiEntry {
            key: rule.key.clone(),
            label: rule.ui.label.clone(),
            group: rule.ui.group.clone(),
            order: rule.ui.order,
        })
        .collect();
    ui_catalog.sort_by(|a, b| {
        a.group
            .cmp(&b.group)
            .then(a.order.cmp(&b.order))
            .then(a.key.cmp(&b.key))
    });

    let parse_templates: BTreeMap<String, ParseSpec> = fields
        .iter()
        .filter_map(|(key, rule)| rule.parse.clone().map(|p| (key.clone(), p)))
        .collect();

    let field_rules = FieldRuleSet {
        version: ARTIFACT_VERSION.to_string(),
        category: map.category.clone(),
        fields,
        include_fields,
    };

    info!(
        category = %map.category,
        fields = field_rules.fields.len(),
        components = component_dbs.len(),
        warnings = warnings.len(),
        "compiled category"
    );

    Ok(CompiledArtifacts {
        field_rules_runtime: field_rules.clone(),
        field_rules,
        known_values: known,
        ui_catalog,
        parse_templates,
        cross_rules: map.cross_validation_rules.clone(),
        key_migrations: map.key_migrations.clone(),
        component_dbs,
        warnings,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{ComponentProperty, ComponentRoles, ComponentSource, EnumSource, MemoryWorkbook};

    fn strings(row: &[&str]) -> Vec<String> {
        row.iter().map(|s| s.to_string()).collect()
    }

    pub(crate) fn workbook() -> MemoryWorkbook {
        let mut wb = MemoryWorkbook::default();
        wb.sheets.insert(
            "keys".into(),
            vec![
                strings(&[
                    "key", "label", "group", "order", "type", "shape", "unit", "range_min",
                    "range_max", "required_level", "enum_policy", "component_db", "parse_template",
                    "unit_accepts", "item_union", "selection_policy",
                ]),
                strings(&[
                    "weight", "Weight", "physical", "1", "numeric", "scalar", "g", "10", "300",
                    "critical", "", "", "number_with_unit", "g;grams", "", "",
                ]),
                strings(&[
                    "sensor", "Sensor", "internals", "1", "enum", "scalar", "", "", "",
                    "required", "closed", "sensors", "", "", "", "best_evidence",
                ]),
                strings(&[
                    "polling_rates", "Polling rates", "internals", "2", "numeric", "list", "hz",
                    "", "", "expected", "", "", "polling_list", "hz", "ordered_union", "",
                ]),
            ],
        );
        wb.sheets.insert(
            "sensors".into(),
            vec![
                strings(&["name", "maker", "aliases", "dpi", "tech"]),
                strings(&["Focus Pro 35K", "PixArt", "focus pro 35000", "35000", "optical"]),
                strings(&["HERO 2", "Logitech", "", "44000", "optical"]),
            ],
        );
        wb.sheets.insert(
            "connection_values".into(),
            vec![
                strings(&["value", "aliases"]),
                strings(&["wireless", "2.4ghz;wifi"]),
                strings(&["wired", "usb"]),
            ],
        );
        wb
    }

    pub(crate) fn map() -> WorkbookMap {
        WorkbookMap {
            category: "gaming-mice".into(),
            key_sheet: "keys".into(),
            enum_sources: vec![EnumSource {
                sheet: "connection_values".into(),
                field_key: "connection".into(),
            }],
            component_sources: vec![ComponentSource {
                sheet: "sensors".into(),
                component_type: "sensors".into(),
                roles: ComponentRoles {
                    name: "name".into(),
                    maker: Some("maker".into()),
                    aliases: Some("aliases".into()),
                    properties: vec![
                        ComponentProperty {
                            column: "dpi".into(),
                            property: "dpi_max".into(),
                            field_key: Some("dpi_max".into()),
                            variance_policy: Some("upper_bound".into()),
                        },
                        ComponentProperty {
                            column: "tech".into(),
                            property: "tech".into(),
                            field_key: None,
                            variance_policy: Some("upper_bound".into()),
                        },
                    ],
                },
            }],
            selected_keys: vec![],
            manual_enum_values: BTreeMap::new(),
            field_overrides: BTreeMap::new(),
            cross_validation_rules: vec![],
            key_migrations: BTreeMap::new(),
        }
    }

    #[test]
    fn compiles_field_rules_from_key_sheet() {
        let artifacts = compile(&map(), &workbook()).unwrap();
        assert_eq!(artifacts.field_rules.fields.len(), 3);
        let weight = &artifacts.field_rules.fields["weight"];
        assert_eq!(weight.required_level, RequiredLevel::Critical);
        assert!(matches!(
            weight.contract,
            FieldContract::Scalar { kind: ScalarKind::Numeric, .. }
        ));
        let polling = &artifacts.field_rules.fields["polling_rates"];
        assert!(polling.contract.is_list());
    }

    #[test]
    fn unknown_type_fails_compile() {
        let mut wb = workbook();
        wb.sheets.get_mut("keys").unwrap().push(strings(&[
            "mystery", "Mystery", "general", "9", "made_up_type", "scalar", "", "", "", "", "",
            "", "", "", "", "",
        ]));
        match compile(&map(), &wb) {
            Err(CompileError::Validation { errors }) => {
                assert!(errors[0].contains("made_up_type"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn string_variance_policy_is_coerced_with_warning() {
        let artifacts = compile(&map(), &workbook()).unwrap();
        let db = &artifacts.component_dbs["sensors"];
        let item = db.resolve("Focus Pro 35K").unwrap();
        assert_eq!(item.variance_policies["tech"], VariancePolicy::Authoritative);
        assert_eq!(item.variance_policies["dpi_max"], VariancePolicy::UpperBound);
        assert!(artifacts.warnings.iter().any(|w| w.contains("coerced to authoritative")));
    }

    #[test]
    fn property_field_keys_aggregate() {
        let artifacts = compile(&map(), &workbook()).unwrap();
        assert_eq!(artifacts.component_dbs["sensors"].property_keys, vec!["dpi_max"]);
    }

    #[test]
    fn manual_enum_values_merge() {
        let mut m = map();
        m.manual_enum_values
            .insert("connection".into(), vec!["bluetooth".into()]);
        let artifacts = compile(&m, &workbook()).unwrap();
        let values: Vec<&str> = artifacts.known_values.fields["connection"]
            .iter()
            .map(|v| v.canonical.as_str())
            .collect();
        assert_eq!(values, vec!["bluetooth", "wired", "wireless"]);
    }

    #[test]
    fn selected_keys_restrict_and_record() {
        let mut m = map();
        m.selected_keys = vec!["weight".into(), "ghost".into()];
        let artifacts = compile(&m, &workbook()).unwrap();
        assert_eq!(artifacts.field_rules.fields.len(), 1);
        assert_eq!(artifacts.field_rules.include_fields, vec!["weight"]);
        assert!(artifacts.warnings.iter().any(|w| w.contains("ghost")));
    }

    #[test]
    fn overrides_win_slot_wise() {
        use harvest_core::rules::{ReducePolicy, ReduceRule};
        let mut m = map();
        m.field_overrides.insert(
            "sensor".into(),
            crate::model::FieldOverride {
                required_level: Some(RequiredLevel::Optional),
                selection_policy: Some(SelectionPolicy::Reduce(ReducePolicy {
                    source_field: "sensor_samples".into(),
                    tolerance_ms: 1.0,
                    rule: ReduceRule::Reduce,
                })),
                ..Default::default()
            },
        );
        let artifacts = compile(&m, &workbook()).unwrap();
        let sensor = &artifacts.field_rules.fields["sensor"];
        assert_eq!(sensor.required_level, RequiredLevel::Optional);
        // The workbook's string-form policy was wholly replaced by the
        // object form.
        assert!(matches!(
            sensor.selection_policy,
            Some(SelectionPolicy::Reduce(_))
        ));
    }

    #[test]
    fn enum_alias_columns_parse() {
        let artifacts = compile(&map(), &workbook()).unwrap();
        let wireless = artifacts.known_values.fields["connection"]
            .iter()
            .find(|v| v.canonical == "wireless")
            .unwrap();
        assert_eq!(wireless.aliases, vec!["2.4ghz", "wifi"]);
    }
}
