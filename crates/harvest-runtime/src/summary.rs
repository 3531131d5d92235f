// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run outputs: `summary.json`, `latest/`, and per-run artifacts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use harvest_core::candidate::{Candidate, ProvenanceEntry};
use harvest_core::canonical_json_pretty;
use harvest_core::needset::{NeedReason, NeedSet};

use crate::RuntimeError;
use crate::convergence::ConvergenceResult;

/// Why a field ended the run unresolved or flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldReasoning {
    /// Primary reason (`"missing"`, `"conflict"`, ...).
    pub unknown_reason: String,
    /// Every reason code observed.
    pub reasons: Vec<String>,
}

/// The user-facing run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Whether required + critical targets were all met.
    pub validated: bool,
    /// Whether the record may be published (validated and gate open).
    pub publishable: bool,
    /// Why the run stopped.
    pub stop_reason: String,
    /// Rounds executed.
    pub rounds: u32,
    /// Required fields still missing.
    pub missing_required_fields: Vec<String>,
    /// Critical fields below their pass target.
    pub critical_fields_below_pass_target: Vec<String>,
    /// Field → reasoning for unresolved/flagged fields.
    pub field_reasoning: BTreeMap<String, FieldReasoning>,
}

fn reason_str(reason: NeedReason) -> &'static str {
    match reason {
        NeedReason::Missing => "missing",
        NeedReason::LowConfidence => "low_confidence",
        NeedReason::TierPrefUnmet => "tier_pref_unmet",
        NeedReason::MinRefsFail => "min_refs_fail",
        NeedReason::Conflict => "conflict",
        NeedReason::CriticalFieldBelowPassTarget => "critical_field_below_pass_target",
    }
}

/// Build the summary from a convergence result.
#[must_use]
pub fn summarize(result: &ConvergenceResult) -> RunSummary {
    let missing = crate::needset::missing_required_fields(&result.needset);
    let critical = crate::needset::critical_fields_below_pass_target(&result.needset);
    let validated = missing.is_empty() && critical.is_empty();

    let mut field_reasoning = BTreeMap::new();
    for need in &result.needset.needs {
        let reasons: Vec<String> = need.reasons.iter().map(|r| reason_str(*r).to_string()).collect();
        field_reasoning.insert(
            need.field_key.clone(),
            FieldReasoning {
                unknown_reason: reasons.first().cloned().unwrap_or_else(|| "missing".into()),
                reasons,
            },
        );
    }

    RunSummary {
        validated,
        publishable: validated && result.gate_open,
        stop_reason: result.stop_reason.as_str().to_string(),
        rounds: result.rounds,
        missing_required_fields: missing,
        critical_fields_below_pass_target: critical,
        field_reasoning,
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), RuntimeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = canonical_json_pretty(value)
        .map_err(|e| RuntimeError::Summary(e.to_string()))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body.as_bytes())?;
    tmp.persist(path).map_err(|e| RuntimeError::Io(e.error))?;
    Ok(())
}

/// Write the `latest/` tree: `normalized.json`, `summary.json`,
/// `provenance.json`, `candidates.json`.
///
/// # Errors
///
/// [`RuntimeError::Io`] on write failure.
pub fn write_latest(
    latest_dir: &Path,
    summary: &RunSummary,
    fields: &BTreeMap<String, String>,
    provenance: &BTreeMap<String, ProvenanceEntry>,
    candidates: &BTreeMap<String, Vec<Candidate>>,
) -> Result<(), RuntimeError> {
    write_atomic(&latest_dir.join("normalized.json"), fields)?;
    write_atomic(&latest_dir.join("summary.json"), summary)?;
    write_atomic(&latest_dir.join("provenance.json"), provenance)?;
    write_atomic(&latest_dir.join("candidates.json"), candidates)?;
    Ok(())
}

/// Write per-run artifacts: `needset.json` and the provenance tree.
///
/// # Errors
///
/// [`RuntimeError::Io`] on write failure.
pub fn write_run_artifacts(
    run_dir: &Path,
    needset: &NeedSet,
    provenance: &BTreeMap<String, ProvenanceEntry>,
) -> Result<(), RuntimeError> {
    write_atomic(&run_dir.join("needset.json"), needset)?;
    write_atomic(
        &run_dir.join("provenance").join("fields.provenance.json"),
        provenance,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::StopReason;
    use harvest_core::needset::{IdentityLockState, IdentityLockStatus, NeedEntry};
    use harvest_core::rules::RequiredLevel;
    use tempfile::TempDir;

    fn result_with_needs(needs: Vec<NeedEntry>) -> ConvergenceResult {
        ConvergenceResult {
            stop_reason: StopReason::MaxRoundsReached,
            complete: false,
            fields: BTreeMap::from([("weight".to_string(), "54".to_string())]),
            provenance: BTreeMap::new(),
            needset: NeedSet {
                needs,
                total_fields: 5,
                identity: IdentityLockState {
                    status: IdentityLockStatus::Locked,
                    confidence: 1.0,
                    page_count: 2,
                },
            },
            rounds: 3,
            history: vec![],
            gate_open: true,
        }
    }

    fn need(field: &str, level: RequiredLevel, reasons: Vec<NeedReason>) -> NeedEntry {
        NeedEntry {
            field_key: field.into(),
            required_level: level,
            need_score: 60.0,
            reasons,
            min_refs: 1,
            tier_preference: vec![1, 2],
        }
    }

    #[test]
    fn summary_reflects_outstanding_needs() {
        let result = result_with_needs(vec![
            need("sensor", RequiredLevel::Required, vec![NeedReason::Missing]),
            need(
                "weight",
                RequiredLevel::Critical,
                vec![NeedReason::CriticalFieldBelowPassTarget],
            ),
        ]);
        let summary = summarize(&result);
        assert!(!summary.validated);
        assert!(!summary.publishable);
        assert_eq!(summary.missing_required_fields, vec!["sensor"]);
        assert_eq!(summary.critical_fields_below_pass_target, vec!["weight"]);
        assert_eq!(summary.field_reasoning["sensor"].unknown_reason, "missing");
        assert_eq!(summary.stop_reason, "max_rounds_reached");
    }

    #[test]
    fn clean_result_is_publishable() {
        let mut result = result_with_needs(vec![]);
        result.stop_reason = StopReason::RequiredAndCriticalSatisfied;
        result.complete = true;
        let summary = summarize(&result);
        assert!(summary.validated);
        assert!(summary.publishable);
    }

    #[test]
    fn closed_gate_blocks_publishing() {
        let mut result = result_with_needs(vec![]);
        result.gate_open = false;
        let summary = summarize(&result);
        assert!(summary.validated);
        assert!(!summary.publishable);
    }

    #[test]
    fn latest_tree_is_written() {
        let dir = TempDir::new().unwrap();
        let result = result_with_needs(vec![]);
        let summary = summarize(&result);
        write_latest(
            dir.path(),
            &summary,
            &result.fields,
            &result.provenance,
            &BTreeMap::new(),
        )
        .unwrap();
        for file in ["normalized.json", "summary.json", "provenance.json", "candidates.json"] {
            assert!(dir.path().join(file).exists(), "missing {file}");
        }
        let summary_raw = std::fs::read_to_string(dir.path().join("summary.json")).unwrap();
        let parsed: RunSummary = serde_json::from_str(&summary_raw).unwrap();
        assert_eq!(parsed, summary);
    }

    #[test]
    fn run_artifacts_include_provenance_tree() {
        let dir = TempDir::new().unwrap();
        let result = result_with_needs(vec![]);
        write_run_artifacts(dir.path(), &result.needset, &result.provenance).unwrap();
        assert!(dir.path().join("needset.json").exists());
        assert!(dir.path().join("provenance/fields.provenance.json").exists());
    }
}
