// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-cli
#![deny(unsafe_code)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use harvest_adapters::{ReqwestFetcher, SimpleHtmlParser, load_json_workbook};
use harvest_core::config::HarvestConfig;
use harvest_core::{IdentityLock, ProductIdentity};
use harvest_events::RunLog;
use harvest_frontier::{FrontierTuning, JsonFrontier};
use harvest_runtime::{
    CategorySources, Layout, LoopLimits, ProductRunner, QueueStore, RunnerDeps, run_product,
};

/// Top-level argument parser.
#[derive(Parser)]
#[command(name = "harvest", version, about = "Product spec harvesting engine")]
pub struct Cli {
    /// Runtime configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a category workbook map into runtime artifacts.
    Compile {
        /// The workbook map (JSON).
        #[arg(long)]
        map: PathBuf,
        /// The workbook itself (JSON sheets file).
        #[arg(long)]
        workbook: PathBuf,
    },
    /// Run one product seed through the convergence loop.
    Run {
        /// The product seed (JSON).
        #[arg(long)]
        seed: PathBuf,
        /// Round cap.
        #[arg(long, default_value_t = 8)]
        max_rounds: u32,
        /// Wall-clock budget in seconds.
        #[arg(long, default_value_t = 600)]
        max_seconds: u64,
    },
    /// Inspect frontier state for a product.
    Frontier {
        /// Product to summarize.
        #[arg(long)]
        product: String,
    },
    /// Full-text search the evidence index.
    Evidence {
        /// Category slug.
        #[arg(long)]
        category: String,
        /// Product key.
        #[arg(long)]
        product: String,
        /// Field key.
        #[arg(long)]
        field: String,
        /// Comma-separated search terms.
        #[arg(long)]
        terms: String,
        /// Result cap.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

/// A product job seed.
#[derive(Debug, Deserialize)]
struct ProductSeed {
    category: String,
    identity_lock: IdentityLock,
    #[serde(default)]
    anchors: BTreeMap<String, String>,
    #[serde(default)]
    seed_urls: Vec<String>,
    #[serde(default)]
    sources: CategorySources,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<HarvestConfig> {
    match path {
        Some(path) => HarvestConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(HarvestConfig::default()),
    }
}

fn cmd_compile(config: &HarvestConfig, map: &PathBuf, workbook: &PathBuf) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(map).with_context(|| format!("reading {}", map.display()))?;
    let map: harvest_compiler::WorkbookMap = serde_json::from_str(&raw).context("parsing workbook map")?;
    let workbook = load_json_workbook(workbook).context("loading workbook")?;
    let artifacts = harvest_compiler::compile(&map, &workbook)?;
    let report = harvest_compiler::emit(&artifacts, &config.helper_files_root)?;
    println!(
        "compiled {}: {} fields, {} component dbs, {} warnings, {} changed",
        report.category,
        report.field_count,
        report.component_counts.len(),
        report.warnings.len(),
        report.diff.len()
    );
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

async fn cmd_run(
    config: HarvestConfig,
    seed_path: &PathBuf,
    max_rounds: u32,
    max_seconds: u64,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(seed_path)
        .with_context(|| format!("reading {}", seed_path.display()))?;
    let seed: ProductSeed = serde_json::from_str(&raw).context("parsing product seed")?;
    let identity = ProductIdentity::new(&seed.category, seed.identity_lock)?;
    let layout = Layout::from_config(&config);

    let rules = {
        let generated = layout.generated_dir(&seed.category);
        if generated.join("field_rules.runtime.json").exists() {
            Some(harvest_rules_load(&generated)?)
        } else {
            None
        }
    };

    let run_id = format!("run_{}", uuid::Uuid::new_v4().simple());
    let run_dir = layout.run_dir(&identity.category, &identity.product_id, &run_id);
    let log = Arc::new(RunLog::create(&run_dir, &run_id)?);

    let tuning = FrontierTuning {
        cooldown: harvest_frontier::CooldownTuning {
            base404: config.frontier_cooldown404_seconds,
            repeat404: config.frontier_cooldown404_repeat_seconds,
            base403: config.frontier_cooldown403_base_seconds,
            base429: config.frontier_cooldown429_base_seconds,
            long410: config.frontier_cooldown410_seconds,
            path_notfound_threshold: config.frontier_path_penalty_notfound_threshold,
        },
        query_cooldown_seconds: config.frontier_query_cooldown_seconds,
    };
    let frontier = JsonFrontier::open(layout.frontier(), tuning)?;
    let evidence = harvest_evidence::EvidenceIndex::open(layout.evidence_db())?;
    let mut queue = QueueStore::open(layout.queue_state(&identity.category), &identity.category)?;

    let approved_hosts: Vec<String> = seed
        .sources
        .hosts
        .iter()
        .filter(|h| h.approved)
        .map(|h| h.host.clone())
        .collect();
    let host_tiers: Vec<(String, u8)> =
        seed.sources.hosts.iter().map(|h| (h.host.clone(), h.tier)).collect();
    let deps = RunnerDeps {
        fetcher: Arc::new(ReqwestFetcher::new(std::time::Duration::from_secs(15))?),
        parser: Arc::new(SimpleHtmlParser { approved_hosts, host_tiers }),
        search: Arc::new(harvest_adapters::NullSearchProvider),
    };

    let mut runner = ProductRunner::new(
        identity,
        config,
        seed.sources,
        rules,
        seed.anchors,
        seed.seed_urls,
        deps,
        frontier,
        evidence,
        Arc::clone(&log),
    );

    let limits = LoopLimits { max_rounds, max_ms: max_seconds * 1000 };
    let summary = run_product(&mut runner, &layout, &mut queue, &log, limits).await?;
    println!(
        "{}: validated={} publishable={} stop={} rounds={}",
        runner.identity().product_id,
        summary.validated,
        summary.publishable,
        summary.stop_reason,
        summary.rounds
    );
    if !summary.missing_required_fields.is_empty() {
        println!("missing required: {}", summary.missing_required_fields.join(", "));
    }
    Ok(())
}

fn harvest_rules_load(dir: &std::path::Path) -> anyhow::Result<harvest_rules::RulesEngine> {
    harvest_rules::RulesEngine::load(dir).map_err(Into::into)
}

fn cmd_frontier(config: &HarvestConfig, product: &str) -> anyhow::Result<()> {
    let layout = Layout::from_config(config);
    let frontier = JsonFrontier::open(layout.frontier(), FrontierTuning::default())?;
    if frontier.recovered_from_corrupt_state() {
        eprintln!("warning: frontier state was corrupt; showing empty state");
    }
    let snapshot = frontier.snapshot_for_product(product);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn cmd_evidence(
    config: &HarvestConfig,
    category: &str,
    product: &str,
    field: &str,
    terms: &str,
    limit: usize,
) -> anyhow::Result<()> {
    let layout = Layout::from_config(config);
    let evidence = harvest_evidence::EvidenceIndex::open(layout.evidence_db())?;
    let terms: Vec<String> = terms.split(',').map(|t| t.trim().to_string()).collect();
    let rows = evidence.search_by_field(category, product, field, &terms, limit)?;
    for row in rows {
        println!("{}\t{}\t{}", row.snippet_id, row.host, row.normalized_text);
    }
    Ok(())
}

/// Parse arguments, initialize logging, run the selected command.
///
/// Errors surface as a single line on stderr with a non-zero exit.
pub async fn run() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = async {
        let config = load_config(cli.config.as_ref())?;
        match &cli.command {
            Command::Compile { map, workbook } => cmd_compile(&config, map, workbook),
            Command::Run { seed, max_rounds, max_seconds } => {
                cmd_run(config, seed, *max_rounds, *max_seconds).await
            }
            Command::Frontier { product } => cmd_frontier(&config, product),
            Command::Evidence { category, product, field, terms, limit } => {
                cmd_evidence(&config, category, product, field, terms, *limit)
            }
        }
    }
    .await;

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
