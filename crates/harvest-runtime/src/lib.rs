// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-runtime
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Round driving, mode ladder, stop table.
pub mod convergence;
/// On-disk layout.
pub mod layout;
/// Need-set scoring.
pub mod needset;
/// The per-product pipeline.
pub mod pipeline;
/// The per-category product queue.
pub mod queue;
/// Run outputs.
pub mod summary;

use std::sync::Arc;
use tracing::{info, warn};

pub use convergence::{
    ConvergenceResult, LoopLimits, Mode, RoundOutcome, RoundPipeline, StopReason, run_convergence,
    uber_stop_decision,
};
pub use layout::Layout;
pub use needset::{NeedSignals, build_needset};
pub use pipeline::{CategorySources, ProductRunner, RunnerDeps, SourceHost};
pub use queue::{QueueEntry, QueueState, QueueStatus, QueueStore};
pub use summary::{FieldReasoning, RunSummary, summarize, write_latest, write_run_artifacts};

use harvest_events::RunLog;

/// Errors the runtime raises. Per-source and per-candidate problems never
/// take this path; they are reason codes in provenance and events.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Filesystem failure.
    #[error("runtime I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("runtime serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Frontier storage failure.
    #[error(transparent)]
    Frontier(#[from] harvest_frontier::FrontierError),

    /// Evidence storage failure.
    #[error(transparent)]
    Evidence(#[from] harvest_evidence::EvidenceError),

    /// Event log failure.
    #[error(transparent)]
    Events(#[from] harvest_events::EventError),

    /// Lane scheduling failure (unknown lane).
    #[error(transparent)]
    Lane(#[from] harvest_lanes::LaneError),

    /// Summary/artifact writing failure.
    #[error("summary writing failed: {0}")]
    Summary(String),
}

/// Dirty flag set on the queue row after a hard identity conflict.
pub const DIRTY_IDENTITY_CONFLICT: &str = "identity_conflict";

/// Drive one product run end to end: converge, write `latest/` and the
/// per-run artifacts, and settle the queue row.
///
/// # Errors
///
/// Storage and event-log failures propagate; they also mark the queue row
/// failed.
pub async fn run_product(
    runner: &mut ProductRunner,
    layout: &Layout,
    queue: &mut QueueStore,
    log: &Arc<RunLog>,
    limits: LoopLimits,
) -> Result<RunSummary, RuntimeError> {
    let category = runner.identity().category.clone();
    let product_id = runner.identity().product_id.clone();
    let run_id = log.run_id().to_string();
    queue.set_status(&product_id, QueueStatus::Running)?;
    log.set_identity(serde_json::to_value(runner.identity())?);
    log.emit(
        harvest_core::events::stage::RUN,
        "run_started",
        serde_json::json!({ "category": category, "product_id": product_id }),
    )?;

    let initial = runner.initial_needset();
    let result = match run_convergence(runner, initial, limits, log).await {
        Ok(result) => result,
        Err(err) => {
            warn!(%err, "run failed");
            queue.record_failure(&product_id, &err.to_string())?;
            log.flush_rollup()?;
            return Err(err);
        }
    };

    let mut summary = summarize(&result);
    if runner.gate_hard_conflict() {
        // Hard-fail: the record is neither validated nor publishable, no
        // matter what the field targets say.
        summary.validated = false;
        summary.publishable = false;
        queue.add_dirty_flag(&product_id, DIRTY_IDENTITY_CONFLICT)?;
    }

    let latest = layout.latest_dir(&category, &product_id);
    write_latest(
        &latest,
        &summary,
        &result.fields,
        &result.provenance,
        &std::collections::BTreeMap::new(),
    )?;
    let run_dir = layout.run_dir(&category, &product_id, &run_id);
    write_run_artifacts(&run_dir, &result.needset, &result.provenance)?;

    log.emit(
        harvest_core::events::stage::RUN,
        "run_completed",
        serde_json::json!({
            "stop_reason": result.stop_reason.as_str(),
            "validated": summary.validated,
            "publishable": summary.publishable,
            "rounds": result.rounds,
        }),
    )?;
    log.flush_rollup()?;

    queue.set_status(
        &product_id,
        if summary.validated { QueueStatus::Complete } else { QueueStatus::Pending },
    )?;
    info!(
        product_id,
        validated = summary.validated,
        rounds = result.rounds,
        stop = result.stop_reason.as_str(),
        "run finished"
    );
    Ok(summary)
}
