// SPDX-License-Identifier: MIT OR Apache-2.0
//! JSON-file workbooks.
//!
//! The real spreadsheet reader is an external collaborator; for local
//! runs and tests a workbook can be supplied as a JSON file of
//! sheet → rows, loaded into the compiler's [`MemoryWorkbook`].

use std::path::Path;

use crate::AdapterError;
use harvest_compiler::MemoryWorkbook;

/// Load a `{sheet: [[cells]]}` JSON file as a workbook.
///
/// # Errors
///
/// [`AdapterError::Io`] / [`AdapterError::Json`] on failure.
pub fn load_json_workbook(path: impl AsRef<Path>) -> Result<MemoryWorkbook, AdapterError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
