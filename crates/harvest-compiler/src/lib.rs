// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-compiler
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Workbook rows → typed artifacts.
pub mod compile;
/// Canonical artifact emission and the compile report.
pub mod emit;
/// The workbook map and its validation.
pub mod model;

pub use compile::{CompiledArtifacts, UiEntry, compile};
pub use emit::{CompileReport, GENERATED_DIR, emit};
pub use model::{
    CompileError, ComponentProperty, ComponentRoles, ComponentSource, EnumSource, FieldOverride,
    MemoryWorkbook, WorkbookMap, WorkbookSource,
};
