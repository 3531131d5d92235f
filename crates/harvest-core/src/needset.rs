// SPDX-License-Identifier: MIT OR Apache-2.0
//! Need-set entries: what the convergence loop still has to resolve.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::rules::RequiredLevel;

/// Why a field is in the need-set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum NeedReason {
    /// No value at all.
    Missing,
    /// Value present but confidence is below the pass target.
    LowConfidence,
    /// Evidence does not include a preferred-tier source.
    TierPrefUnmet,
    /// Fewer evidence references than the rule requires.
    MinRefsFail,
    /// Sources conflict.
    Conflict,
    /// A critical field was accepted below its pass target.
    CriticalFieldBelowPassTarget,
}

/// One field the loop still needs to work on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NeedEntry {
    /// Field key.
    pub field_key: String,
    /// The field's required level.
    pub required_level: RequiredLevel,
    /// Deficit score; higher sorts earlier.
    pub need_score: f64,
    /// Reason codes, deterministic order.
    pub reasons: Vec<NeedReason>,
    /// Minimum evidence references the rule demands.
    pub min_refs: u32,
    /// Preferred tiers, most preferred first.
    pub tier_preference: Vec<u8>,
}

/// Identity-lock resolution state attached to a need-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IdentityLockStatus {
    /// Identity confirmed and locked.
    Locked,
    /// Working identity, not yet confirmed by enough pages.
    Provisional,
    /// Hard identity conflict observed.
    Conflict,
    /// No identity resolution yet.
    Unlocked,
}

/// Identity state summary carried alongside the need-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IdentityLockState {
    /// Resolution status.
    pub status: IdentityLockStatus,
    /// Aggregate identity confidence in `[0, 1]`.
    pub confidence: f64,
    /// Number of pages that contributed identity decisions.
    pub page_count: u32,
}

/// The per-round need-set: entries sorted by descending need score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NeedSet {
    /// Fields still needing work, highest score first.
    pub needs: Vec<NeedEntry>,
    /// Total number of fields under rule.
    pub total_fields: usize,
    /// Identity-lock summary.
    pub identity: IdentityLockState,
}

impl NeedSet {
    /// `|needs|`.
    #[must_use]
    pub fn needset_size(&self) -> usize {
        self.needs.len()
    }

    /// Field keys at the given required level still in need.
    pub fn fields_at(&self, level: RequiredLevel) -> impl Iterator<Item = &str> {
        self.needs
            .iter()
            .filter(move |n| n.required_level == level)
            .map(|n| n.field_key.as_str())
    }
}
