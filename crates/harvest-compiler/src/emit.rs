// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact emission: canonical JSON on disk, plus the compile report.
//!
//! Determinism is the contract here: collections are sorted before they
//! arrive, and everything funnels through one canonical writer (sorted
//! keys, two-space indent, LF, one trailing newline). Compiling the same
//! inputs twice produces byte-identical artifacts, which is what makes
//! the report's diff meaningful.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use harvest_core::canonical_json_pretty;

use crate::compile::CompiledArtifacts;
use crate::model::CompileError;

/// The generated-artifact directory name.
pub const GENERATED_DIR: &str = "_generated";
/// The control-plane directory name.
pub const CONTROL_PLANE_DIR: &str = "_control_plane";
/// The curation-suggestions directory name.
pub const SUGGESTIONS_DIR: &str = "_suggestions";

/// The compile report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileReport {
    /// Category slug.
    pub category: String,
    /// Number of compiled field rules.
    pub field_count: usize,
    /// Number of fields with known-value tables.
    pub known_value_fields: usize,
    /// Component type → item count.
    pub component_counts: BTreeMap<String, usize>,
    /// Validation warnings.
    pub warnings: Vec<String>,
    /// Artifact file names whose bytes changed since the previous compile.
    pub diff: Vec<String>,
    /// Whether this was the first compile (no previous artifacts).
    pub first_compile: bool,
}

fn write_canonical<T: Serialize>(path: &Path, value: &T) -> Result<Option<String>, CompileError> {
    let body = canonical_json_pretty(value)
        .map_err(|e| CompileError::Workbook(format!("canonicalization failed: {e}")))?;
    let previous = std::fs::read_to_string(path).ok();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body.as_bytes())?;
    tmp.persist(path).map_err(|e| CompileError::Io(e.error))?;
    Ok(match previous {
        Some(prev) if prev == body => None,
        Some(_) => Some(path.file_name().unwrap_or_default().to_string_lossy().into_owned()),
        None => Some(path.file_name().unwrap_or_default().to_string_lossy().into_owned()),
    })
}

fn seed_empty(path: &Path) -> Result<(), CompileError> {
    if path.exists() {
        return Ok(());
    }
    write_canonical(path, &serde_json::json!({ "suggestions": [] }))?;
    Ok(())
}

/// Write every artifact under `helper_files/{category}/` and return the
/// compile report (which is itself written to `_compile_report.json`).
///
/// # Errors
///
/// [`CompileError::Io`] / [`CompileError::Json`] on write failures.
pub fn emit(
    artifacts: &CompiledArtifacts,
    helper_files_root: impl AsRef<Path>,
) -> Result<CompileReport, CompileError> {
    let category_dir: PathBuf = helper_files_root
        .as_ref()
        .join(&artifacts.field_rules.category);
    let generated = category_dir.join(GENERATED_DIR);
    let first_compile = !generated.join("field_rules.json").exists();

    let mut diff = Vec::new();
    let mut record = |changed: Option<String>| {
        if let Some(name) = changed {
            diff.push(name);
        }
    };

    record(write_canonical(&generated.join("field_rules.json"), &artifacts.field_rules)?);
    record(write_canonical(
        &generated.join("field_rules.runtime.json"),
        &artifacts.field_rules_runtime,
    )?);
    record(write_canonical(&generated.join("known_values.json"), &artifacts.known_values)?);
    record(write_canonical(&generated.join("ui_field_catalog.json"), &artifacts.ui_catalog)?);
    record(write_canonical(&generated.join("parse_templates.json"), &artifacts.parse_templates)?);
    record(write_canonical(
        &generated.join("cross_validation_rules.json"),
        &artifacts.cross_rules,
    )?);
    record(write_canonical(&generated.join("key_migrations.json"), &artifacts.key_migrations)?);
    for (component_type, db) in &artifacts.component_dbs {
        record(write_canonical(
            &generated.join("component_db").join(format!("{component_type}.json")),
            db,
        )?);
    }

    // The full pre-redaction rules live on the control plane.
    record(write_canonical(
        &category_dir.join(CONTROL_PLANE_DIR).join("field_rules.full.json"),
        &artifacts.field_rules,
    )?);

    // Curation suggestion seeds are created once, never overwritten.
    let suggestions = category_dir.join(SUGGESTIONS_DIR);
    for name in ["enums", "components", "lexicon", "constraints"] {
        seed_empty(&suggestions.join(format!("{name}.json")))?;
    }

    diff.sort();
    let report = CompileReport {
        category: artifacts.field_rules.category.clone(),
        field_count: artifacts.field_rules.fields.len(),
        known_value_fields: artifacts.known_values.fields.len(),
        component_counts: artifacts
            .component_dbs
            .iter()
            .map(|(k, db)| (k.clone(), db.items.len()))
            .collect(),
        warnings: artifacts.warnings.clone(),
        diff,
        first_compile,
    };
    write_canonical(&generated.join("_compile_report.json"), &report)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use crate::model::WorkbookMap;
    use tempfile::TempDir;

    fn fixtures() -> (WorkbookMap, crate::model::MemoryWorkbook) {
        (crate::compile::tests::map(), crate::compile::tests::workbook())
    }

    #[test]
    fn recompile_is_byte_identical() {
        let (map, wb) = fixtures();
        let dir = TempDir::new().unwrap();
        let artifacts = compile(&map, &wb).unwrap();
        let first = emit(&artifacts, dir.path()).unwrap();
        assert!(first.first_compile);
        assert!(!first.diff.is_empty());

        let generated = dir.path().join("gaming-mice").join(GENERATED_DIR);
        let bytes_before = std::fs::read(generated.join("field_rules.json")).unwrap();

        let artifacts = compile(&map, &wb).unwrap();
        let second = emit(&artifacts, dir.path()).unwrap();
        assert!(!second.first_compile);
        assert!(second.diff.is_empty(), "unexpected diff: {:?}", second.diff);

        let bytes_after = std::fs::read(generated.join("field_rules.json")).unwrap();
        assert_eq!(bytes_before, bytes_after);
    }

    #[test]
    fn changed_map_shows_in_diff() {
        let (map, wb) = fixtures();
        let dir = TempDir::new().unwrap();
        emit(&compile(&map, &wb).unwrap(), dir.path()).unwrap();

        let mut changed = map;
        changed
            .manual_enum_values
            .insert("connection".into(), vec!["bluetooth".into()]);
        let report = emit(&compile(&changed, &wb).unwrap(), dir.path()).unwrap();
        assert!(report.diff.contains(&"known_values.json".to_string()));
        assert!(!report.diff.contains(&"field_rules.json".to_string()));
    }

    #[test]
    fn emits_expected_tree() {
        let (map, wb) = fixtures();
        let dir = TempDir::new().unwrap();
        emit(&compile(&map, &wb).unwrap(), dir.path()).unwrap();

        let category = dir.path().join("gaming-mice");
        for file in [
            "_generated/field_rules.json",
            "_generated/field_rules.runtime.json",
            "_generated/known_values.json",
            "_generated/ui_field_catalog.json",
            "_generated/parse_templates.json",
            "_generated/cross_validation_rules.json",
            "_generated/key_migrations.json",
            "_generated/component_db/sensors.json",
            "_generated/_compile_report.json",
            "_control_plane/field_rules.full.json",
            "_suggestions/enums.json",
            "_suggestions/components.json",
            "_suggestions/lexicon.json",
            "_suggestions/constraints.json",
        ] {
            assert!(category.join(file).exists(), "missing {file}");
        }
    }

    #[test]
    fn artifacts_load_back_through_rules_engine() {
        let (map, wb) = fixtures();
        let dir = TempDir::new().unwrap();
        emit(&compile(&map, &wb).unwrap(), dir.path()).unwrap();

        let engine = harvest_rules::RulesEngine::load(
            dir.path().join("gaming-mice").join(GENERATED_DIR),
        )
        .unwrap();
        assert_eq!(engine.rules.fields.len(), 3);
        assert!(engine.component_dbs.contains_key("sensors"));
        assert!(engine.known_values.covers("connection"));
    }

    #[test]
    fn suggestion_seeds_are_not_overwritten() {
        let (map, wb) = fixtures();
        let dir = TempDir::new().unwrap();
        emit(&compile(&map, &wb).unwrap(), dir.path()).unwrap();

        let enums = dir.path().join("gaming-mice").join(SUGGESTIONS_DIR).join("enums.json");
        std::fs::write(&enums, "{\"suggestions\": [\"curated\"]}\n").unwrap();
        emit(&compile(&map, &wb).unwrap(), dir.path()).unwrap();
        let body = std::fs::read_to_string(&enums).unwrap();
        assert!(body.contains("curated"));
    }
}
