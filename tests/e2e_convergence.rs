// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end convergence runs against scripted sources.

use std::collections::BTreeMap;
use std::sync::Arc;

use harvest_adapters::{MockFetcher, NullSearchProvider, SimpleHtmlParser};
use harvest_core::config::HarvestConfig;
use harvest_core::rules::{
    FieldContract, FieldRule, FieldRuleSet, KnownValues, NumericRange, ParseSpec, RequiredLevel,
    ScalarKind,
};
use harvest_core::{IdentityLock, ProductIdentity};
use harvest_events::RunLog;
use harvest_frontier::{FrontierTuning, JsonFrontier};
use harvest_rules::RulesEngine;
use harvest_runtime::{
    CategorySources, Layout, LoopLimits, ProductRunner, QueueStatus, QueueStore, RunnerDeps,
    SourceHost, run_product,
};
use tempfile::TempDir;

fn rules() -> RulesEngine {
    let mut weight = FieldRule::text("weight", RequiredLevel::Critical);
    weight.contract = FieldContract::Scalar {
        kind: ScalarKind::Numeric,
        unit: Some("g".into()),
        range: Some(NumericRange { min: 10.0, max: 300.0 }),
        value_form: Some("integer".into()),
    };
    weight.parse = Some(ParseSpec {
        template: "number_with_unit".into(),
        unit_accepts: vec!["g".into(), "grams".into()],
        strict_unit_required: false,
    });
    let sensor = FieldRule::text("sensor", RequiredLevel::Required);

    let mut set = FieldRuleSet::default();
    set.version = "harvest/v1".into();
    set.category = "gaming-mice".into();
    set.fields.insert("weight".into(), weight);
    set.fields.insert("sensor".into(), sensor);
    RulesEngine::new(set, KnownValues::default(), vec![], BTreeMap::new(), BTreeMap::new())
}

fn sources() -> CategorySources {
    CategorySources {
        hosts: vec![
            SourceHost {
                host: "razer.com".into(),
                tier: 1,
                approved: true,
                instrumented: false,
                trusted_helper: false,
            },
            SourceHost {
                host: "rtings.com".into(),
                tier: 2,
                approved: true,
                instrumented: true,
                trusted_helper: false,
            },
            SourceHost {
                host: "techpowerup.com".into(),
                tier: 2,
                approved: true,
                instrumented: false,
                trusted_helper: false,
            },
        ],
    }
}

fn spec_page(extra_head: &str) -> String {
    format!(
        r#"<html><head><title>Razer Viper V3 Pro Review</title>{extra_head}</head><body>
        <table>
          <tr><th>Weight</th><td>54 g</td></tr>
          <tr><th>Sensor</th><td>Focus Pro 35K</td></tr>
        </table></body></html>"#
    )
}

fn parser() -> SimpleHtmlParser {
    SimpleHtmlParser {
        approved_hosts: vec!["razer.com".into(), "rtings.com".into(), "techpowerup.com".into()],
        host_tiers: vec![
            ("razer.com".into(), 1),
            ("rtings.com".into(), 2),
            ("techpowerup.com".into(), 2),
        ],
    }
}

fn config_in(dir: &TempDir) -> HarvestConfig {
    let mut config = HarvestConfig::default();
    config.local_output_root = dir.path().join("outputs");
    config.local_input_root = dir.path().join("inputs");
    config.helper_files_root = dir.path().join("helper_files");
    config
}

struct Harness {
    layout: Layout,
    queue: QueueStore,
    runner: ProductRunner,
    log: Arc<RunLog>,
}

fn harness(dir: &TempDir, lock: IdentityLock, pages: &[(&str, String)]) -> Harness {
    let config = config_in(dir);
    let layout = Layout::from_config(&config);
    let identity = ProductIdentity::new("gaming-mice", lock).unwrap();

    let fetcher = MockFetcher::new();
    for (url, body) in pages {
        fetcher.stub(url, 200, body);
    }
    let seed_urls: Vec<String> = pages.iter().map(|(url, _)| url.to_string()).collect();

    let run_id = "run_e2e".to_string();
    let run_dir = layout.run_dir(&identity.category, &identity.product_id, &run_id);
    let log = Arc::new(RunLog::create(&run_dir, &run_id).unwrap());
    let frontier = JsonFrontier::open(layout.frontier(), FrontierTuning::default()).unwrap();
    let evidence = harvest_evidence::EvidenceIndex::open(layout.evidence_db()).unwrap();
    let queue = QueueStore::open(layout.queue_state("gaming-mice"), "gaming-mice").unwrap();

    let runner = ProductRunner::new(
        identity,
        config,
        sources(),
        Some(rules()),
        BTreeMap::new(),
        seed_urls,
        RunnerDeps {
            fetcher: Arc::new(fetcher),
            parser: Arc::new(parser()),
            search: Arc::new(NullSearchProvider),
        },
        frontier,
        evidence,
        Arc::clone(&log),
    );
    Harness { layout, queue, runner, log }
}

#[tokio::test]
async fn converges_and_stops_satisfied() {
    let dir = TempDir::new().unwrap();
    // Bodies carry a per-site marker so content hashes stay distinct.
    let pages = vec![
        ("https://razer.com/viper-v3-pro", spec_page("<!-- razer -->")),
        ("https://www.rtings.com/mouse/reviews/razer/viper-v3-pro", spec_page("<!-- rtings -->")),
        ("https://techpowerup.com/review/razer-viper-v3-pro", spec_page("<!-- tpu -->")),
    ];
    let lock = IdentityLock {
        brand: "Razer".into(),
        model: "Viper V3 Pro".into(),
        ..IdentityLock::default()
    };
    let mut h = harness(&dir, lock, &pages);

    let summary = run_product(
        &mut h.runner,
        &h.layout,
        &mut h.queue,
        &h.log,
        LoopLimits { max_rounds: 5, max_ms: 60_000 },
    )
    .await
    .unwrap();

    assert!(summary.validated, "summary: {summary:?}");
    assert!(summary.publishable);
    assert_eq!(summary.stop_reason, "required_and_critical_satisfied");
    assert!(summary.missing_required_fields.is_empty());
    assert!(summary.critical_fields_below_pass_target.is_empty());

    // The stop event carries the reason inside the payload wrapper.
    let events = harvest_events::read_events(
        h.layout
            .run_dir("gaming-mice", "razer-viper-v3-pro", "run_e2e")
            .join(RunLog::EVENTS_FILE),
    )
    .unwrap();
    let stop = events.iter().find(|e| e.event == "convergence_stop").unwrap();
    assert_eq!(stop.payload["stop_reason"], "required_and_critical_satisfied");
    assert_eq!(stop.payload["complete"], true);
    assert!(events.iter().all(|e| !e.run_id.is_empty() && e.payload.is_object()));

    // latest/ holds the normalized record with identity-locked fields.
    let normalized_raw = std::fs::read_to_string(
        h.layout.latest_dir("gaming-mice", "razer-viper-v3-pro").join("normalized.json"),
    )
    .unwrap();
    let normalized: BTreeMap<String, String> = serde_json::from_str(&normalized_raw).unwrap();
    assert_eq!(normalized["brand"], "Razer");
    assert_eq!(normalized["weight"], "54");
    assert_eq!(normalized["sensor"], "Focus Pro 35K");

    // The queue row settled complete.
    assert_eq!(
        h.queue.state().products["razer-viper-v3-pro"].status,
        QueueStatus::Complete
    );
}

#[tokio::test]
async fn hard_identity_conflict_blocks_publishing() {
    let dir = TempDir::new().unwrap();
    let conflicting_ldjson = r#"<script type="application/ld+json">
        {"@type": "Product", "name": "Viper V3 Pro", "sku": "RZ01-99999999"}
        </script>"#;
    let pages = vec![
        ("https://razer.com/viper-v3-pro", spec_page("<!-- razer -->")),
        ("https://www.rtings.com/mouse/reviews/razer/viper-v3-pro", spec_page("<!-- rtings -->")),
        ("https://techpowerup.com/review/razer-viper-v3-pro", spec_page(conflicting_ldjson)),
    ];
    let lock = IdentityLock {
        brand: "Razer".into(),
        model: "Viper V3 Pro".into(),
        sku: Some("RZ01-05120100".into()),
        ..IdentityLock::default()
    };
    let mut h = harness(&dir, lock, &pages);

    let summary = run_product(
        &mut h.runner,
        &h.layout,
        &mut h.queue,
        &h.log,
        LoopLimits { max_rounds: 3, max_ms: 60_000 },
    )
    .await
    .unwrap();

    assert!(!summary.validated);
    assert!(!summary.publishable);
    let row = &h.queue.state().products["razer-viper-v3-pro"];
    assert!(row.dirty_flags.contains(&"identity_conflict".to_string()));
}

#[tokio::test]
async fn evidence_ids_are_stable_across_reingest() {
    let evidence = harvest_evidence::EvidenceIndex::in_memory().unwrap();
    let doc = harvest_evidence::DocumentInput {
        content_hash: "cafebabe".into(),
        parser_version: "v1".into(),
        url: "https://a.com/p".into(),
        host: "a.com".into(),
        tier: 2,
        role: "review".into(),
        category: "gaming-mice".into(),
        product_id: "p1".into(),
        bytes: 10,
    };
    let chunks = vec![harvest_evidence::ChunkInput {
        chunk_type: "spec_table".into(),
        text: "Weight 54 g".into(),
        normalized_text: "weight 54 g".into(),
        extraction_method: harvest_core::candidate::ExtractionMethod::SpecTable,
        field_hints: vec!["weight".into()],
    }];
    let first = evidence.index_document(&doc, &chunks, &[]).unwrap();
    let second = evidence.index_document(&doc, &chunks, &[]).unwrap();
    assert_eq!(first.doc_id, second.doc_id);
    assert_eq!(first.snippet_ids, second.snippet_ids);
    assert_eq!(second.dedupe_outcome, harvest_core::events::DedupeOutcome::Reused);
    assert_eq!(first.doc_id, harvest_evidence::doc_id("cafebabe", "v1"));
    assert_eq!(first.snippet_ids[0], harvest_evidence::snippet_id("cafebabe", "v1", 0));
}
