// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-frontier
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The cooldown decision table shared by all backends.
pub mod cooldown;
/// Per-host outcome histograms and health states.
pub mod hostbudget;
/// JSON-file persistence backend.
pub mod json;
/// SQLite persistence backend.
pub mod sqlite;
/// Row types and the shared in-memory state machine.
pub mod store;

pub use cooldown::{CooldownReason, CooldownTuning};
pub use hostbudget::{HostBudgetTracker, HostState, Outcome, ResolvedState};
pub use json::JsonFrontier;
pub use sqlite::SqliteFrontier;
pub use store::{
    Cooldown, FrontierCore, FrontierError, FrontierSnapshot, FrontierTuning, QueryRow,
    RecordedFetch, SkipDecision, UrlRow, normalize_query,
};
