// SPDX-License-Identifier: MIT OR Apache-2.0
//! The product runner: one product's discovery → fetch → parse → index →
//! gate → consensus pipeline, implementing [`RoundPipeline`].
//!
//! Evidence accumulates across rounds: a source fetched in round 0 keeps
//! contributing candidates in round 3. Per-source and per-candidate
//! failures become events and reason codes; only storage failures
//! propagate.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use harvest_adapters::{FetchResult, Fetcher, HtmlParser, SearchProvider};
use harvest_consensus::{ConsensusConfig, SourceResult, reducers, run_consensus};
use harvest_core::ProductIdentity;
use harvest_core::candidate::{EvidencePack, PackSnippet, UNKNOWN};
use harvest_core::config::HarvestConfig;
use harvest_core::events::stage;
use harvest_core::needset::NeedSet;
use harvest_evidence::{ChunkInput, DocumentInput, EvidenceIndex, FactInput};
use harvest_events::RunLog;
use harvest_frontier::{HostBudgetTracker, JsonFrontier, Outcome, RecordedFetch};
use harvest_identity::{GatePage, IdentityCandidates, PageObservation, evaluate_page_set, score_page};
use harvest_lanes::LaneManager;
use harvest_rules::{AuditOptions, EvidenceClaim, RulesEngine};
use harvest_url::root_domain;

use crate::RuntimeError;
use crate::convergence::{Mode, RoundOutcome, RoundPipeline};
use crate::needset::{NeedSignals, build_needset};

/// One host the category trusts (or measures with).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourceHost {
    /// Host name.
    pub host: String,
    /// Tier (1 = manufacturer).
    pub tier: u8,
    /// On the allow-list.
    pub approved: bool,
    /// Tagged as an instrumented lab.
    #[serde(default)]
    pub instrumented: bool,
    /// Curated helper-file source.
    #[serde(default)]
    pub trusted_helper: bool,
}

/// The category's source-host table.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CategorySources {
    /// Known hosts.
    pub hosts: Vec<SourceHost>,
}

impl CategorySources {
    fn entry(&self, host: &str) -> Option<&SourceHost> {
        let root = root_domain(host);
        self.hosts.iter().find(|h| root_domain(&h.host) == root)
    }

    /// Tier for a host; unlisted hosts get tier 4 (never approved).
    #[must_use]
    pub fn tier_for(&self, host: &str) -> u8 {
        self.entry(host).map_or(4, |h| h.tier)
    }

    /// Whether the host is approved.
    #[must_use]
    pub fn approved(&self, host: &str) -> bool {
        self.entry(host).is_some_and(|h| h.approved)
    }

    /// Whether the host is an instrumented lab.
    #[must_use]
    pub fn instrumented(&self, host: &str) -> bool {
        self.entry(host).is_some_and(|h| h.instrumented)
    }

    /// Whether the host is a trusted helper source.
    #[must_use]
    pub fn trusted_helper(&self, host: &str) -> bool {
        self.entry(host).is_some_and(|h| h.trusted_helper)
    }
}

/// Everything the runner needs injected.
pub struct RunnerDeps {
    /// Page fetcher.
    pub fetcher: Arc<dyn Fetcher>,
    /// HTML parser.
    pub parser: Arc<dyn HtmlParser>,
    /// Discovery search provider.
    pub search: Arc<dyn SearchProvider>,
}

/// The per-product pipeline.
pub struct ProductRunner {
    identity: ProductIdentity,
    config: HarvestConfig,
    sources: CategorySources,
    rules: Option<RulesEngine>,
    anchors: BTreeMap<String, String>,
    seed_urls: Vec<String>,
    deps: RunnerDeps,
    frontier: JsonFrontier,
    hosts: HostBudgetTracker,
    lanes: LaneManager,
    evidence: EvidenceIndex,
    log: Arc<RunLog>,
    parser_version: String,
    fetch_timeout: Duration,

    // Accumulated across rounds.
    page_sources: BTreeMap<String, SourceResult>,
    gate_pages: BTreeMap<String, GatePage>,
    resolved_before: usize,
    satisfied_rounds: BTreeMap<String, u32>,
    gate_hard_conflict: bool,
}

impl ProductRunner {
    /// Build a runner.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        identity: ProductIdentity,
        config: HarvestConfig,
        sources: CategorySources,
        rules: Option<RulesEngine>,
        anchors: BTreeMap<String, String>,
        seed_urls: Vec<String>,
        deps: RunnerDeps,
        frontier: JsonFrontier,
        evidence: EvidenceIndex,
        log: Arc<RunLog>,
    ) -> Self {
        let lanes = LaneManager::with_concurrency(
            config.lanes.search,
            config.lanes.fetch,
            config.lanes.parse,
            config.lanes.llm,
        );
        Self {
            identity,
            config,
            sources,
            rules,
            anchors,
            seed_urls,
            deps,
            frontier,
            hosts: HostBudgetTracker::new(),
            lanes,
            evidence,
            log,
            parser_version: "v1".into(),
            fetch_timeout: Duration::from_secs(10),
            page_sources: BTreeMap::new(),
            gate_pages: BTreeMap::new(),
            resolved_before: 0,
            satisfied_rounds: BTreeMap::new(),
            gate_hard_conflict: false,
        }
    }

    /// The product identity this runner works on.
    #[must_use]
    pub fn identity(&self) -> &ProductIdentity {
        &self.identity
    }

    /// Whether the last evaluated gate saw a hard identity conflict.
    #[must_use]
    pub fn gate_hard_conflict(&self) -> bool {
        self.gate_hard_conflict
    }

    /// The initial (everything-missing) need-set.
    #[must_use]
    pub fn initial_needset(&self) -> NeedSet {
        let rules = self.rules.as_ref().map(|e| e.rules.clone()).unwrap_or_default();
        let gate = evaluate_page_set(&[]);
        build_needset(&rules, &BTreeMap::new(), gate.state, &NeedSignals::default())
    }

    /// The lane manager (for snapshots).
    #[must_use]
    pub fn lanes(&self) -> &LaneManager {
        &self.lanes
    }

    /// The frontier (for snapshots).
    #[must_use]
    pub fn frontier(&self) -> &JsonFrontier {
        &self.frontier
    }

    fn field_order(&self) -> Vec<String> {
        if let Some(engine) = &self.rules {
            engine.rules.field_keys().map(str::to_string).collect()
        } else {
            let mut fields: Vec<String> = self
                .page_sources
                .values()
                .flat_map(|s| s.field_candidates.iter().map(|c| c.field.clone()))
                .collect();
            fields.sort();
            fields.dedup();
            fields
        }
    }

    fn build_queries(&self, needs: &NeedSet, mode: Mode) -> Vec<(String, String)> {
        let lock = &self.identity.identity_lock;
        let base = format!("{} {}", lock.brand, lock.model);
        let mut queries = Vec::new();
        for need in needs.needs.iter().take(mode.query_budget()) {
            let hint = self
                .rules
                .as_ref()
                .and_then(|e| e.rules.rule(&need.field_key))
                .and_then(|r| r.search_hints.first().cloned())
                .unwrap_or_else(|| need.field_key.replace('_', " "));
            queries.push((need.field_key.clone(), format!("{base} {hint}")));
        }
        queries
    }

    async fn discover(&mut self, needs: &NeedSet, mode: Mode) -> Result<Vec<String>, RuntimeError> {
        let mut discovered: Vec<String> = Vec::new();
        if !self.config.discovery_enabled {
            return Ok(discovered);
        }
        let per_query = self.config.discovery_results_per_query;
        let queries = self.build_queries(needs, mode);
        for (field_key, query) in queries.iter().take(self.config.discovery_max_queries) {
            if self.frontier.should_skip_query(&self.identity.product_id, query, false) {
                debug!(query, "query within cooldown; skipped");
                continue;
            }
            let search = Arc::clone(&self.deps.search);
            let query_owned = query.clone();
            let results = self
                .lanes
                .dispatch("search", async move { search.search(&query_owned, per_query).await })
                .await
                .map_err(RuntimeError::Lane)?
                .unwrap_or_default();
            self.log.emit(
                stage::DISCOVERY,
                "query_issued",
                serde_json::json!({
                    "query": query,
                    "field": field_key,
                    "results": results.len(),
                }),
            )?;
            self.frontier.record_query(
                &self.identity.product_id,
                query,
                &self.config.search_provider,
                &[field_key.clone()],
                results.len() as u32,
            )?;
            discovered.extend(results);
            if discovered.len() >= self.config.discovery_max_discovered {
                break;
            }
        }
        discovered.truncate(self.config.discovery_max_discovered);
        Ok(discovered)
    }

    fn classify(status: u16) -> Outcome {
        match status {
            200..=399 => Outcome::Ok,
            404 | 410 => Outcome::NotFound,
            401 | 403 => Outcome::Blocked,
            429 => Outcome::RateLimited,
            500..=599 => Outcome::ServerError,
            0 => Outcome::FetchError,
            _ => Outcome::BadContent,
        }
    }

    async fn fetch_one(&mut self, url: &str) -> Result<Option<FetchResult>, RuntimeError> {
        self.log.emit(stage::FETCH, "url_checked", serde_json::json!({ "url": url }))?;
        let skip = self.frontier.should_skip_url(url);
        if skip.skip {
            self.log.emit(
                stage::FETCH,
                "url_skipped",
                serde_json::json!({ "url": url, "reason": skip.reason }),
            )?;
            return Ok(None);
        }
        let host = harvest_url::canonicalize(url).domain;
        let resolved = self.hosts.resolve_state(&host, chrono::Utc::now());
        if resolved.state == harvest_frontier::HostState::Blocked {
            self.log.emit(
                stage::FETCH,
                "url_skipped",
                serde_json::json!({ "url": url, "reason": "host_blocked" }),
            )?;
            return Ok(None);
        }
        // Unlisted hosts still fetch (their evidence can be recorded) but
        // never count toward consensus: the source table gives them tier 4
        // without approval.
        self.hosts.bump_started(&host);
        let fetcher = Arc::clone(&self.deps.fetcher);
        let url_owned = url.to_string();
        let timeout = self.fetch_timeout;
        let fetched = self
            .lanes
            .dispatch("fetch", async move {
                tokio::time::timeout(timeout, fetcher.fetch(&url_owned)).await
            })
            .await
            .map_err(RuntimeError::Lane)?;
        self.hosts.bump_completed(&host);

        let now = chrono::Utc::now();
        let result = match fetched {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                self.hosts.bump_outcome(&host, Outcome::FetchError);
                self.frontier.record_fetch(
                    &self.identity.product_id,
                    url,
                    &RecordedFetch { status: 0, ..Default::default() },
                )?;
                self.log.emit(
                    stage::FETCH,
                    "fetch_failed",
                    serde_json::json!({ "url": url, "error": err.to_string() }),
                )?;
                return Ok(None);
            }
            Err(_elapsed) => {
                self.hosts.bump_outcome(&host, Outcome::NetworkTimeout);
                self.hosts.apply_backoff(&host, Outcome::NetworkTimeout, now);
                self.frontier.record_fetch(
                    &self.identity.product_id,
                    url,
                    &RecordedFetch { status: 0, ..Default::default() },
                )?;
                self.log.emit(
                    stage::FETCH,
                    "fetch_failed",
                    serde_json::json!({ "url": url, "error": "network_timeout" }),
                )?;
                return Ok(None);
            }
        };

        let outcome = Self::classify(result.status);
        self.hosts.bump_outcome(&host, outcome);
        self.hosts.apply_backoff(&host, outcome, now);
        if outcome == Outcome::Ok {
            self.log.emit(
                stage::FETCH,
                "fetch_completed",
                serde_json::json!({
                    "url": url,
                    "final_url": result.final_url,
                    "status": result.status,
                    "fetch_ms": result.fetch_ms,
                }),
            )?;
            Ok(Some(result))
        } else {
            self.frontier.record_fetch(
                &self.identity.product_id,
                url,
                &RecordedFetch {
                    status: result.status,
                    content_type: result.content_type.clone(),
                    ..Default::default()
                },
            )?;
            self.log.emit(
                stage::FETCH,
                "fetch_failed",
                serde_json::json!({ "url": url, "status": result.status }),
            )?;
            Ok(None)
        }
    }

    /// Parse, index, gate, and register one fetched page.
    async fn ingest(&mut self, url: &str, fetched: &FetchResult) -> Result<bool, RuntimeError> {
        let Some(html) = &fetched.html else {
            return Ok(false);
        };
        let parser = Arc::clone(&self.deps.parser);
        let final_url = fetched.final_url.clone();
        let html_owned = html.clone();
        let parsed = self
            .lanes
            .dispatch("parse", async move { parser.parse_html(&final_url, &html_owned) })
            .await
            .map_err(RuntimeError::Lane)?;

        let host = harvest_url::canonicalize(&fetched.final_url).domain;
        if parsed.chunks.is_empty() {
            self.hosts.bump_parse_fail(&host);
            self.frontier.record_fetch(
                &self.identity.product_id,
                url,
                &RecordedFetch {
                    status: fetched.status,
                    content_type: fetched.content_type.clone(),
                    content_hash: Some(fetched.content_hash.clone()),
                    ..Default::default()
                },
            )?;
            warn!(url, "parser produced no chunks");
            return Ok(false);
        }
        self.log.emit(
            stage::PARSE,
            "parse_completed",
            serde_json::json!({ "url": url, "chunks": parsed.chunks.len() }),
        )?;

        let tier = self.sources.tier_for(&host);
        let doc = DocumentInput {
            content_hash: fetched.content_hash.clone(),
            parser_version: self.parser_version.clone(),
            url: fetched.final_url.clone(),
            host: host.clone(),
            tier,
            role: if tier == 1 { "manufacturer".into() } else { "review".into() },
            category: self.identity.category.clone(),
            product_id: self.identity.product_id.clone(),
            bytes: fetched.bytes,
        };
        let chunks: Vec<ChunkInput> = parsed
            .chunks
            .iter()
            .map(|c| ChunkInput {
                chunk_type: c.chunk_type.clone(),
                text: c.text.clone(),
                normalized_text: c.normalized_text.clone(),
                extraction_method: c.extraction_method,
                field_hints: c.field_hints.clone(),
            })
            .collect();
        let facts: Vec<FactInput> = parsed
            .field_candidates
            .iter()
            .map(|candidate| {
                let chunk_index = parsed
                    .chunks
                    .iter()
                    .position(|c| c.field_hints.contains(&candidate.field))
                    .unwrap_or(0) as u32;
                let normalized = self
                    .rules
                    .as_ref()
                    .map(|e| {
                        let out = e.normalize_candidate(
                            &candidate.field,
                            &candidate.value,
                            &harvest_rules::NormalizeContext::default(),
                        );
                        if out.ok { out.normalized } else { String::new() }
                    })
                    .unwrap_or_default();
                FactInput {
                    chunk_index,
                    field_key: candidate.field.clone(),
                    value_raw: candidate.value.clone(),
                    value_normalized: normalized,
                    unit: None,
                    extraction_method: candidate.method,
                    confidence: candidate.score,
                }
            })
            .collect();

        let indexed = self.evidence.index_document(&doc, &chunks, &facts)?;
        self.log.emit(
            stage::INDEX,
            indexed.dedupe_outcome.event_name(),
            serde_json::json!({ "doc_id": indexed.doc_id, "url": fetched.final_url }),
        )?;
        if indexed.dedupe_outcome == harvest_core::events::DedupeOutcome::Reused {
            self.hosts.bump_dedupe_hit(&host);
        }

        // Identity: what does this page claim to be?
        let identity_candidates = identity_from_ldjson(&parsed.ld_json);
        let observation = PageObservation {
            url: fetched.final_url.clone(),
            title: parsed.title.clone().unwrap_or_default(),
            identity_candidates,
        };
        let page_identity = score_page(&observation, &self.identity.identity_lock);
        let matched = page_identity.matched;
        self.gate_pages.insert(
            indexed.doc_id.clone(),
            GatePage {
                identity: page_identity,
                tier,
                approved_domain: self.sources.approved(&host),
                trusted_helper: self.sources.trusted_helper(&host),
            },
        );

        // Register the page as a consensus source.
        let mut pack = EvidencePack::default();
        for (i, chunk) in chunks.iter().enumerate() {
            pack.insert(PackSnippet {
                snippet_id: indexed
                    .snippet_ids
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| harvest_evidence::snippet_id(&doc.content_hash, &doc.parser_version, i as u32)),
                snippet_hash: harvest_core::sha256_hex(chunk.normalized_text.as_bytes()),
                source_id: indexed.doc_id.clone(),
                url: fetched.final_url.clone(),
                normalized_text: chunk.normalized_text.clone(),
                retrieved_at: Some(chrono::Utc::now()),
            });
        }
        let field_candidates = parsed
            .field_candidates
            .iter()
            .map(|candidate| {
                let mut c = candidate.clone();
                if let Some(i) = parsed
                    .chunks
                    .iter()
                    .position(|chunk| chunk.field_hints.contains(&c.field))
                {
                    if let Some(sid) = indexed.snippet_ids.get(i) {
                        c.evidence_refs = vec![sid.clone()];
                    }
                    c.snippet_hash =
                        Some(harvest_core::sha256_hex(parsed.chunks[i].normalized_text.as_bytes()));
                }
                c
            })
            .collect();
        self.page_sources.insert(
            indexed.doc_id.clone(),
            SourceResult {
                source_id: indexed.doc_id.clone(),
                url: fetched.final_url.clone(),
                host: host.clone(),
                tier,
                approved_domain: self.sources.approved(&host),
                instrumented_domain: self.sources.instrumented(&host),
                identity_matched: matched,
                field_candidates,
                evidence_pack: pack,
            },
        );

        // The frontier learns which fields this URL yielded.
        let fields_found: Vec<String> = parsed
            .field_candidates
            .iter()
            .map(|c| c.field.clone())
            .collect();
        self.frontier.record_fetch(
            &self.identity.product_id,
            url,
            &RecordedFetch {
                status: fetched.status,
                content_type: fetched.content_type.clone(),
                fields_found,
                confidence: None,
                content_hash: Some(fetched.content_hash.clone()),
            },
        )?;
        Ok(true)
    }

    /// Drop candidates whose evidence citations do not hold up.
    fn audited_sources(&self) -> Vec<SourceResult> {
        let Some(engine) = &self.rules else {
            return self.page_sources.values().cloned().collect();
        };
        self.page_sources
            .values()
            .map(|source| {
                let mut source = source.clone();
                source.field_candidates.retain(|c| {
                    let Some(rule) = engine.rules.rule(&c.field) else { return true };
                    if !rule.evidence.required {
                        return true;
                    }
                    let Some(snippet_id) = c.evidence_refs.first() else {
                        return false;
                    };
                    let claim = EvidenceClaim {
                        url: source.url.clone(),
                        snippet_id: snippet_id.clone(),
                        quote: c.quote.clone(),
                        quote_span: c.quote_span,
                        source_id: Some(source.source_id.clone()),
                        snippet_hash: c.snippet_hash.clone(),
                        retrieved_at: c.ts,
                        extraction_method: Some(c.method),
                    };
                    let audit = engine.audit_evidence(
                        &c.field,
                        &c.value,
                        &claim,
                        &source.evidence_pack,
                        AuditOptions::default(),
                    );
                    if !audit.ok {
                        debug!(
                            field = %c.field,
                            value = %c.value,
                            reason = audit.reason_code.as_deref().unwrap_or(""),
                            "candidate dropped by evidence audit"
                        );
                    }
                    audit.ok
                });
                source
            })
            .collect()
    }
}

/// Pull identity claims out of `ld+json` payloads.
fn identity_from_ldjson(payloads: &[serde_json::Value]) -> IdentityCandidates {
    let mut out = IdentityCandidates::default();
    for value in payloads {
        let get = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
        out.brand = out.brand.or_else(|| {
            value
                .get("brand")
                .and_then(|b| b.as_str().map(str::to_string).or_else(|| {
                    b.get("name").and_then(|n| n.as_str()).map(str::to_string)
                }))
        });
        out.model = out.model.or_else(|| get("model")).or_else(|| get("name"));
        out.sku = out.sku.or_else(|| get("sku"));
        out.mpn = out.mpn.or_else(|| get("mpn"));
        out.gtin = out.gtin.or_else(|| get("gtin13")).or_else(|| get("gtin"));
    }
    out
}

#[async_trait]
impl RoundPipeline for ProductRunner {
    async fn run_round(
        &mut self,
        round: u32,
        mode: Mode,
        needs: &NeedSet,
    ) -> Result<RoundOutcome, RuntimeError> {
        // Discovery (seeds join in round 0).
        let mut urls = if round == 0 { self.seed_urls.clone() } else { vec![] };
        urls.extend(self.discover(needs, mode).await?);
        urls.dedup();

        // Fetch + ingest.
        let mut fetched_ok = 0u32;
        for url in urls {
            if let Some(result) = self.fetch_one(&url).await? {
                if self.ingest(&url, &result).await? {
                    fetched_ok += 1;
                }
            }
        }

        // Gate.
        let gate_pages: Vec<GatePage> = self.gate_pages.values().cloned().collect();
        let gate = evaluate_page_set(&gate_pages);
        self.gate_hard_conflict = gate.hard_conflict;
        if gate.hard_conflict {
            self.log.emit(
                stage::CONSENSUS,
                "identity_conflict",
                serde_json::json!({ "reasons": gate.reasons }),
            )?;
        }

        // Consensus over everything accumulated so far.
        let sources = self.audited_sources();
        let field_order = self.field_order();
        let consensus = run_consensus(
            &self.identity,
            &sources,
            &field_order,
            &self.anchors,
            ConsensusConfig {
                allow_below_pass_target: self.config.allow_below_pass_target_fill
                    && mode.allows_below_pass_target(),
                gate_open: gate.open,
            },
            self.rules.as_ref(),
        );

        // Reducers.
        let unioned = reducers::list_union(&consensus.fields, &consensus.candidates, self.rules.as_ref());
        let reduced = reducers::reduce_selection_policies(&unioned.fields, self.rules.as_ref());
        let fields = reduced.fields;

        // Need-set.
        let ambiguous: Vec<String> = consensus
            .candidates
            .iter()
            .filter(|(field, cands)| {
                fields.get(*field).is_some_and(|v| v == UNKNOWN) && {
                    let mut values: Vec<String> =
                        cands.iter().map(|c| c.value.to_lowercase()).collect();
                    values.sort();
                    values.dedup();
                    values.len() > 1
                }
            })
            .map(|(field, _)| field.clone())
            .collect();
        for (field, entry) in &consensus.provenance {
            if entry.is_resolved() && entry.meets_pass_target {
                *self.satisfied_rounds.entry(field.clone()).or_insert(0) += 1;
            } else {
                self.satisfied_rounds.remove(field);
            }
        }
        let rules = self.rules.as_ref().map(|e| e.rules.clone()).unwrap_or_default();
        let needset = build_needset(
            &rules,
            &consensus.provenance,
            gate.state.clone(),
            &NeedSignals {
                ambiguous_fields: ambiguous,
                satisfied_rounds: self.satisfied_rounds.clone(),
            },
        );

        // Progress accounting.
        let resolved_now = consensus
            .provenance
            .values()
            .filter(|e| e.is_resolved())
            .count();
        let new_fields = resolved_now.saturating_sub(self.resolved_before) as u32;
        for _ in 0..new_fields {
            self.log.emit(stage::CONSENSUS, "field_filled", serde_json::json!({}))?;
        }
        self.resolved_before = resolved_now;

        Ok(RoundOutcome {
            needset,
            fields,
            provenance: consensus.provenance,
            new_fields,
            high_yield: fetched_ok > 0,
            gate_open: gate.open,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_sources_match_by_root_domain() {
        let sources = CategorySources {
            hosts: vec![SourceHost {
                host: "razer.com".into(),
                tier: 1,
                approved: true,
                instrumented: false,
                trusted_helper: false,
            }],
        };
        assert_eq!(sources.tier_for("www.razer.com"), 1);
        assert_eq!(sources.tier_for("press.razer.com"), 1);
        assert!(sources.approved("razer.com"));
        assert_eq!(sources.tier_for("unknown.net"), 4);
        assert!(!sources.approved("unknown.net"));
    }

    #[test]
    fn ldjson_identity_extraction() {
        let payloads = vec![serde_json::json!({
            "@type": "Product",
            "name": "Viper V3 Pro",
            "brand": {"name": "Razer"},
            "sku": "RZ01-05120100"
        })];
        let out = identity_from_ldjson(&payloads);
        assert_eq!(out.brand.as_deref(), Some("Razer"));
        assert_eq!(out.model.as_deref(), Some("Viper V3 Pro"));
        assert_eq!(out.sku.as_deref(), Some("RZ01-05120100"));
    }

    #[test]
    fn ldjson_plain_string_brand() {
        let payloads = vec![serde_json::json!({"brand": "Razer", "name": "Viper"})];
        let out = identity_from_ldjson(&payloads);
        assert_eq!(out.brand.as_deref(), Some("Razer"));
    }
}
