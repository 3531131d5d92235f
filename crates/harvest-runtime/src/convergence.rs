// SPDX-License-Identifier: MIT OR Apache-2.0
//! The convergence loop: round driving, mode ladder, stop table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::info;

use harvest_core::candidate::ProvenanceEntry;
use harvest_core::events::stage;
use harvest_core::needset::NeedSet;
use harvest_events::RunLog;

use crate::RuntimeError;
use crate::needset::{critical_fields_below_pass_target, missing_required_fields};

/// Aggressiveness ladder. Each step raises the deepening tier, the query
/// budget, and the willingness to accept below-pass-target fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// First contact: seed queries, manufacturer-first.
    Bootstrap,
    /// Normal rounds.
    Balanced,
    /// Widen queries, deepen tiers.
    Aggressive,
    /// Everything allowed, below-pass fills included.
    UberAggressive,
}

impl Mode {
    /// Mode for a round, escalating with stalled progress.
    #[must_use]
    pub fn for_round(round: u32, no_progress_streak: u32) -> Self {
        let effective = round + no_progress_streak;
        match effective {
            0 => Mode::Bootstrap,
            1..=2 => Mode::Balanced,
            3..=4 => Mode::Aggressive,
            _ => Mode::UberAggressive,
        }
    }

    /// Queries allowed per round in this mode.
    #[must_use]
    pub fn query_budget(self) -> usize {
        match self {
            Mode::Bootstrap => 4,
            Mode::Balanced => 8,
            Mode::Aggressive => 12,
            Mode::UberAggressive => 16,
        }
    }

    /// Deepest tier worth fetching in this mode.
    #[must_use]
    pub fn deepening_tier(self) -> u8 {
        match self {
            Mode::Bootstrap => 1,
            Mode::Balanced => 2,
            Mode::Aggressive | Mode::UberAggressive => 3,
        }
    }

    /// Whether this mode accepts below-pass-target fills (still subject
    /// to the config flag and the instrumented-field rule).
    #[must_use]
    pub fn allows_below_pass_target(self) -> bool {
        matches!(self, Mode::Aggressive | Mode::UberAggressive)
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Bootstrap => "bootstrap",
            Mode::Balanced => "balanced",
            Mode::Aggressive => "aggressive",
            Mode::UberAggressive => "uber_aggressive",
        }
    }
}

/// The closed set of stop reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing required or critical is outstanding.
    RequiredAndCriticalSatisfied,
    /// Round cap hit.
    MaxRoundsReached,
    /// Wall-clock budget spent.
    TimeBudgetExceeded,
    /// Two stale rounds on both yield axes.
    DiminishingReturns,
}

impl StopReason {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::RequiredAndCriticalSatisfied => "required_and_critical_satisfied",
            StopReason::MaxRoundsReached => "max_rounds_reached",
            StopReason::TimeBudgetExceeded => "time_budget_exceeded",
            StopReason::DiminishingReturns => "diminishing_returns",
        }
    }
}

/// Inputs to the stop decision, gathered after a round.
#[derive(Debug, Clone, Copy)]
pub struct StopInputs {
    /// Required-level fields still missing.
    pub missing_required_count: usize,
    /// Critical fields below their pass target.
    pub critical_below_count: usize,
    /// Rounds completed.
    pub round: u32,
    /// Round cap.
    pub max_rounds: u32,
    /// Elapsed wall-clock milliseconds.
    pub elapsed_ms: u64,
    /// Wall-clock budget in milliseconds.
    pub max_ms: u64,
    /// Consecutive rounds without high-yield fetching.
    pub no_new_high_yield_rounds: u32,
    /// Consecutive rounds without newly resolved fields.
    pub no_new_fields_rounds: u32,
}

/// The stop table. `None` means continue.
#[must_use]
pub fn uber_stop_decision(inputs: &StopInputs) -> Option<StopReason> {
    if inputs.missing_required_count == 0 && inputs.critical_below_count == 0 {
        return Some(StopReason::RequiredAndCriticalSatisfied);
    }
    if inputs.round >= inputs.max_rounds {
        return Some(StopReason::MaxRoundsReached);
    }
    if inputs.elapsed_ms > inputs.max_ms {
        return Some(StopReason::TimeBudgetExceeded);
    }
    if inputs.no_new_high_yield_rounds >= 2 && inputs.no_new_fields_rounds >= 2 {
        return Some(StopReason::DiminishingReturns);
    }
    None
}

/// Per-round state snapshot, recorded in events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundState {
    /// Round number (0-based).
    pub round: u32,
    /// Mode the round ran in.
    pub mode: Mode,
    /// Need-set size after the round.
    pub needset_size: usize,
    /// Required fields still missing.
    pub missing_required_count: usize,
    /// Critical fields below pass target.
    pub critical_count: usize,
    /// Mean confidence across resolved fields.
    pub confidence: f64,
    /// Whether the record validates so far.
    pub validated: bool,
    /// Whether the round improved the record.
    pub improved: bool,
    /// What improved.
    pub improvement_reasons: Vec<String>,
    /// Consecutive unimproved rounds.
    pub no_progress_streak: u32,
    /// Rounds that fetched plenty but resolved nothing.
    pub low_quality_rounds: u32,
}

/// What one pipeline round produced.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    /// The refreshed need-set.
    pub needset: NeedSet,
    /// Current field values.
    pub fields: BTreeMap<String, String>,
    /// Current provenance.
    pub provenance: BTreeMap<String, ProvenanceEntry>,
    /// Fields newly resolved this round.
    pub new_fields: u32,
    /// Whether fetching yielded fresh evidence this round.
    pub high_yield: bool,
    /// Whether the identity gate is open.
    pub gate_open: bool,
}

/// One round of discovery → fetch → parse → index → consensus.
#[async_trait]
pub trait RoundPipeline: Send {
    /// Run one round against the current need-set.
    async fn run_round(
        &mut self,
        round: u32,
        mode: Mode,
        needs: &NeedSet,
    ) -> Result<RoundOutcome, RuntimeError>;
}

/// Loop limits.
#[derive(Debug, Clone, Copy)]
pub struct LoopLimits {
    /// Round cap.
    pub max_rounds: u32,
    /// Wall-clock budget in milliseconds.
    pub max_ms: u64,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self { max_rounds: 8, max_ms: 10 * 60 * 1000 }
    }
}

/// The final result of a converged (or stopped) run.
#[derive(Debug, Clone)]
pub struct ConvergenceResult {
    /// Why the loop stopped.
    pub stop_reason: StopReason,
    /// Whether required + critical were fully satisfied.
    pub complete: bool,
    /// Final fields.
    pub fields: BTreeMap<String, String>,
    /// Final provenance.
    pub provenance: BTreeMap<String, ProvenanceEntry>,
    /// Final need-set.
    pub needset: NeedSet,
    /// Rounds executed.
    pub rounds: u32,
    /// Per-round state history.
    pub history: Vec<RoundState>,
    /// Whether the identity gate ended open.
    pub gate_open: bool,
}

fn mean_confidence(provenance: &BTreeMap<String, ProvenanceEntry>) -> f64 {
    let resolved: Vec<f64> = provenance
        .values()
        .filter(|e| e.is_resolved())
        .map(|e| e.confidence)
        .collect();
    if resolved.is_empty() {
        0.0
    } else {
        resolved.iter().sum::<f64>() / resolved.len() as f64
    }
}

/// Drive rounds until the stop table fires.
///
/// Stop conditions are checked between rounds, never mid-round; results
/// of work in flight past a stop are discarded by the pipeline.
///
/// # Errors
///
/// Propagates pipeline failures ([`RuntimeError`]); per-source problems
/// never surface here.
pub async fn run_convergence(
    pipeline: &mut dyn RoundPipeline,
    initial_needs: NeedSet,
    limits: LoopLimits,
    log: &RunLog,
) -> Result<ConvergenceResult, RuntimeError> {
    let started = Instant::now();
    let mut needs = initial_needs;
    let mut history: Vec<RoundState> = Vec::new();
    let mut no_progress_streak = 0u32;
    let mut no_new_fields_rounds = 0u32;
    let mut no_new_high_yield_rounds = 0u32;
    let mut low_quality_rounds = 0u32;
    let mut last_outcome: Option<RoundOutcome> = None;

    let mut round = 0u32;
    let (stop_reason, complete) = loop {
        let mode = Mode::for_round(round, no_progress_streak);
        log.emit(
            stage::CONVERGENCE,
            "convergence_round_started",
            serde_json::json!({
                "round": round,
                "mode": mode.as_str(),
                "needset_size": needs.needset_size(),
            }),
        )?;

        let outcome = pipeline.run_round(round, mode, &needs).await?;

        if outcome.new_fields == 0 {
            no_new_fields_rounds += 1;
        } else {
            no_new_fields_rounds = 0;
        }
        if outcome.high_yield {
            no_new_high_yield_rounds = 0;
        } else {
            no_new_high_yield_rounds += 1;
        }
        let improved = outcome.new_fields > 0;
        if improved {
            no_progress_streak = 0;
        } else {
            no_progress_streak += 1;
        }
        if outcome.high_yield && outcome.new_fields == 0 {
            low_quality_rounds += 1;
        }

        let missing_required = missing_required_fields(&outcome.needset);
        let critical_below = critical_fields_below_pass_target(&outcome.needset);
        let state = RoundState {
            round,
            mode,
            needset_size: outcome.needset.needset_size(),
            missing_required_count: missing_required.len(),
            critical_count: critical_below.len(),
            confidence: mean_confidence(&outcome.provenance),
            validated: missing_required.is_empty() && critical_below.is_empty(),
            improved,
            improvement_reasons: if improved {
                vec![format!("{} field(s) newly resolved", outcome.new_fields)]
            } else {
                vec![]
            },
            no_progress_streak,
            low_quality_rounds,
        };
        log.emit(
            stage::CONVERGENCE,
            "convergence_round_completed",
            serde_json::json!({
                "round": round,
                "mode": mode.as_str(),
                "new_fields": outcome.new_fields,
                "needset_size": state.needset_size,
                "missing_required": missing_required,
                "critical_below_pass_target": critical_below,
            }),
        )?;
        info!(round, mode = mode.as_str(), new_fields = outcome.new_fields, "round completed");

        needs = outcome.needset.clone();
        history.push(state);
        last_outcome = Some(outcome);
        round += 1;

        let inputs = StopInputs {
            missing_required_count: missing_required.len(),
            critical_below_count: critical_below.len(),
            round,
            max_rounds: limits.max_rounds,
            elapsed_ms: started.elapsed().as_millis() as u64,
            max_ms: limits.max_ms,
            no_new_high_yield_rounds,
            no_new_fields_rounds,
        };
        if let Some(reason) = uber_stop_decision(&inputs) {
            break (reason, reason == StopReason::RequiredAndCriticalSatisfied);
        }
    };

    log.emit(
        stage::CONVERGENCE,
        "convergence_stop",
        serde_json::json!({
            "stop_reason": stop_reason.as_str(),
            "complete": complete,
            "rounds": round,
        }),
    )?;

    let outcome = last_outcome.expect("loop always runs at least one round");
    Ok(ConvergenceResult {
        stop_reason,
        complete,
        fields: outcome.fields,
        provenance: outcome.provenance,
        needset: needs,
        rounds: round,
        history,
        gate_open: outcome.gate_open,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::needset::{IdentityLockState, IdentityLockStatus, NeedEntry, NeedReason};
    use harvest_core::rules::RequiredLevel;
    use tempfile::TempDir;

    fn needset_with(missing: &[&str]) -> NeedSet {
        NeedSet {
            needs: missing
                .iter()
                .map(|f| NeedEntry {
                    field_key: f.to_string(),
                    required_level: RequiredLevel::Required,
                    need_score: 60.0,
                    reasons: vec![NeedReason::Missing],
                    min_refs: 1,
                    tier_preference: vec![1, 2],
                })
                .collect(),
            total_fields: 10,
            identity: IdentityLockState {
                status: IdentityLockStatus::Locked,
                confidence: 1.0,
                page_count: 3,
            },
        }
    }

    /// Resolves one outstanding field per round.
    struct Resolver {
        remaining: Vec<String>,
    }

    #[async_trait]
    impl RoundPipeline for Resolver {
        async fn run_round(
            &mut self,
            _round: u32,
            _mode: Mode,
            _needs: &NeedSet,
        ) -> Result<RoundOutcome, RuntimeError> {
            let new_fields = u32::from(self.remaining.pop().is_some());
            let left: Vec<&str> = self.remaining.iter().map(String::as_str).collect();
            Ok(RoundOutcome {
                needset: needset_with(&left),
                fields: BTreeMap::new(),
                provenance: BTreeMap::new(),
                new_fields,
                high_yield: new_fields > 0,
                gate_open: true,
            })
        }
    }

    /// Never makes progress.
    struct Stuck;

    #[async_trait]
    impl RoundPipeline for Stuck {
        async fn run_round(
            &mut self,
            _round: u32,
            _mode: Mode,
            _needs: &NeedSet,
        ) -> Result<RoundOutcome, RuntimeError> {
            Ok(RoundOutcome {
                needset: needset_with(&["weight"]),
                fields: BTreeMap::new(),
                provenance: BTreeMap::new(),
                new_fields: 0,
                high_yield: false,
                gate_open: true,
            })
        }
    }

    #[test]
    fn stop_table_ordering() {
        // Satisfied wins over everything.
        let satisfied = StopInputs {
            missing_required_count: 0,
            critical_below_count: 0,
            round: 99,
            max_rounds: 5,
            elapsed_ms: 0,
            max_ms: 1000,
            no_new_high_yield_rounds: 9,
            no_new_fields_rounds: 9,
        };
        assert_eq!(
            uber_stop_decision(&satisfied),
            Some(StopReason::RequiredAndCriticalSatisfied)
        );

        let capped = StopInputs { missing_required_count: 1, round: 5, ..satisfied };
        assert_eq!(uber_stop_decision(&capped), Some(StopReason::MaxRoundsReached));

        let slow = StopInputs {
            missing_required_count: 1,
            round: 1,
            elapsed_ms: 2000,
            ..satisfied
        };
        assert_eq!(uber_stop_decision(&slow), Some(StopReason::TimeBudgetExceeded));

        let stale = StopInputs {
            missing_required_count: 1,
            round: 1,
            elapsed_ms: 0,
            no_new_high_yield_rounds: 2,
            no_new_fields_rounds: 2,
            ..satisfied
        };
        assert_eq!(uber_stop_decision(&stale), Some(StopReason::DiminishingReturns));

        let keep_going = StopInputs {
            missing_required_count: 1,
            round: 1,
            elapsed_ms: 0,
            no_new_high_yield_rounds: 1,
            no_new_fields_rounds: 2,
            ..satisfied
        };
        assert_eq!(uber_stop_decision(&keep_going), None);
    }

    #[test]
    fn mode_ladder_escalates() {
        assert_eq!(Mode::for_round(0, 0), Mode::Bootstrap);
        assert_eq!(Mode::for_round(1, 0), Mode::Balanced);
        assert_eq!(Mode::for_round(3, 0), Mode::Aggressive);
        assert_eq!(Mode::for_round(5, 0), Mode::UberAggressive);
        // Stalled progress escalates early.
        assert_eq!(Mode::for_round(1, 3), Mode::Aggressive);
        assert!(Mode::UberAggressive.query_budget() > Mode::Bootstrap.query_budget());
        assert!(Mode::UberAggressive.allows_below_pass_target());
        assert!(!Mode::Balanced.allows_below_pass_target());
    }

    #[tokio::test]
    async fn loop_stops_when_satisfied() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::create(dir.path(), "run_conv").unwrap();
        let mut pipeline = Resolver { remaining: vec!["weight".into(), "sensor".into()] };
        let result = run_convergence(
            &mut pipeline,
            needset_with(&["weight", "sensor"]),
            LoopLimits::default(),
            &log,
        )
        .await
        .unwrap();
        assert_eq!(result.stop_reason, StopReason::RequiredAndCriticalSatisfied);
        assert!(result.complete);
        assert_eq!(result.rounds, 2);

        let events = harvest_events::read_events(dir.path().join(RunLog::EVENTS_FILE)).unwrap();
        let stop = events.iter().find(|e| e.event == "convergence_stop").unwrap();
        assert_eq!(stop.payload["stop_reason"], "required_and_critical_satisfied");
        assert_eq!(stop.payload["complete"], true);
    }

    #[tokio::test]
    async fn loop_detects_diminishing_returns() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::create(dir.path(), "run_stuck").unwrap();
        let mut pipeline = Stuck;
        let result = run_convergence(
            &mut pipeline,
            needset_with(&["weight"]),
            LoopLimits { max_rounds: 99, max_ms: u64::MAX },
            &log,
        )
        .await
        .unwrap();
        assert_eq!(result.stop_reason, StopReason::DiminishingReturns);
        assert!(!result.complete);
        assert_eq!(result.rounds, 2);
    }

    #[tokio::test]
    async fn loop_respects_max_rounds() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::create(dir.path(), "run_cap").unwrap();
        struct HighYieldStuck;
        #[async_trait]
        impl RoundPipeline for HighYieldStuck {
            async fn run_round(
                &mut self,
                _round: u32,
                _mode: Mode,
                _needs: &NeedSet,
            ) -> Result<RoundOutcome, RuntimeError> {
                Ok(RoundOutcome {
                    needset: needset_with(&["weight"]),
                    fields: BTreeMap::new(),
                    provenance: BTreeMap::new(),
                    new_fields: 0,
                    high_yield: true, // keeps diminishing-returns at bay
                    gate_open: true,
                })
            }
        }
        let mut pipeline = HighYieldStuck;
        let result = run_convergence(
            &mut pipeline,
            needset_with(&["weight"]),
            LoopLimits { max_rounds: 3, max_ms: u64::MAX },
            &log,
        )
        .await
        .unwrap();
        assert_eq!(result.stop_reason, StopReason::MaxRoundsReached);
        assert_eq!(result.rounds, 3);
    }
}
