// SPDX-License-Identifier: MIT OR Apache-2.0
//! The workbook map: what the compiler is told about the workbook.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use harvest_core::rules::SelectionPolicy;
use harvest_rules::CrossRule;

/// Errors from compilation.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The workbook map failed validation.
    #[error("workbook map rejected: {errors:?}")]
    Validation {
        /// Every problem found, not just the first.
        errors: Vec<String>,
    },

    /// A referenced sheet or range could not be read.
    #[error("workbook read failed: {0}")]
    Workbook(String),

    /// Artifact I/O failed.
    #[error("artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact serialization failed.
    #[error("artifact serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Access to the workbook's sheets and cells.
///
/// The actual spreadsheet reader is an external collaborator; the
/// compiler only needs this view of it.
pub trait WorkbookSource {
    /// Names of every sheet in the workbook.
    fn sheet_names(&self) -> Vec<String>;

    /// All rows of a sheet, as strings. The first row is the header.
    ///
    /// # Errors
    ///
    /// [`CompileError::Workbook`] when the sheet does not exist.
    fn rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, CompileError>;
}

/// An in-memory workbook, used by tests and JSON-workbook imports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryWorkbook {
    /// Sheet name → rows of cells.
    pub sheets: BTreeMap<String, Vec<Vec<String>>>,
}

impl WorkbookSource for MemoryWorkbook {
    fn sheet_names(&self) -> Vec<String> {
        self.sheets.keys().cloned().collect()
    }

    fn rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, CompileError> {
        self.sheets
            .get(sheet)
            .cloned()
            .ok_or_else(|| CompileError::Workbook(format!("no such sheet: {sheet}")))
    }
}

/// One enum-list sheet binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumSource {
    /// Sheet holding the values.
    pub sheet: String,
    /// Field the values belong to.
    pub field_key: String,
}

/// One property column of a component sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentProperty {
    /// Column header in the sheet.
    pub column: String,
    /// Property name in the compiled database.
    pub property: String,
    /// Field key this property validates, if any. Aggregated into the
    /// database's `property_keys`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_key: Option<String>,
    /// Declared variance policy (string properties are coerced to
    /// `authoritative` with a warning).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variance_policy: Option<String>,
}

/// Column roles of a component sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRoles {
    /// Column holding the canonical name.
    pub name: String,
    /// Column holding the maker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maker: Option<String>,
    /// Column holding `;`-separated aliases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<String>,
    /// Property columns.
    #[serde(default)]
    pub properties: Vec<ComponentProperty>,
}

/// One component sheet binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSource {
    /// Sheet holding the component table.
    pub sheet: String,
    /// Component type slug (`"sensors"`, `"switches"`, ...).
    pub component_type: String,
    /// Column roles.
    pub roles: ComponentRoles,
}

/// Inline per-field overrides. Slots overwrite workbook-derived values
/// wholesale (latest wins); a `selection_policy` override replaces the
/// workbook's string form even when the override is the object form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FieldOverride {
    /// Override the required level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_level: Option<harvest_core::rules::RequiredLevel>,
    /// Override the parse spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse: Option<harvest_core::rules::ParseSpec>,
    /// Override the evidence policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<harvest_core::rules::EvidencePolicy>,
    /// Override the selection policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_policy: Option<SelectionPolicy>,
    /// Override the instrumented requirement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_instrumented: Option<bool>,
}

/// The workbook map: everything the compiler is told beyond the workbook
/// itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkbookMap {
    /// Category slug.
    pub category: String,
    /// Sheet holding the field-key table.
    pub key_sheet: String,
    /// Enum-list sheets.
    #[serde(default)]
    pub enum_sources: Vec<EnumSource>,
    /// Component sheets.
    #[serde(default)]
    pub component_sources: Vec<ComponentSource>,
    /// Restrict compilation to these keys (empty = all).
    #[serde(default)]
    pub selected_keys: Vec<String>,
    /// Extra enum values merged into `known_values.json` on every compile.
    #[serde(default)]
    pub manual_enum_values: BTreeMap<String, Vec<String>>,
    /// Per-field overrides, applied after workbook-derived defaults.
    #[serde(default)]
    pub field_overrides: BTreeMap<String, FieldOverride>,
    /// Cross-validation rules carried into the artifacts.
    #[serde(default)]
    pub cross_validation_rules: Vec<CrossRule>,
    /// Deprecated field name → current name.
    #[serde(default)]
    pub key_migrations: BTreeMap<String, String>,
}

impl WorkbookMap {
    /// Structural validation against the workbook.
    ///
    /// # Errors
    ///
    /// [`CompileError::Validation`] listing every problem found.
    pub fn validate(&self, workbook: &dyn WorkbookSource) -> Result<(), CompileError> {
        let mut errors = Vec::new();
        if self.category.trim().is_empty() {
            errors.push("category must be non-empty".to_string());
        }
        let sheets = workbook.sheet_names();
        if !sheets.contains(&self.key_sheet) {
            errors.push(format!("key_sheet '{}' not in workbook", self.key_sheet));
        }
        for source in &self.enum_sources {
            if !sheets.contains(&source.sheet) {
                errors.push(format!("enum sheet '{}' not in workbook", source.sheet));
            }
            if source.field_key.trim().is_empty() {
                errors.push(format!("enum sheet '{}' has empty field_key", source.sheet));
            }
        }
        for source in &self.component_sources {
            if !sheets.contains(&source.sheet) {
                errors.push(format!("component sheet '{}' not in workbook", source.sheet));
            }
            if source.component_type.trim().is_empty() {
                errors.push(format!(
                    "component sheet '{}' has empty component_type",
                    source.sheet
                ));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CompileError::Validation { errors })
        }
    }
}
