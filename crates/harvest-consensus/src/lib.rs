// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-consensus
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// List-union and list→scalar reducers.
pub mod reducers;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use harvest_core::ProductIdentity;
use harvest_core::candidate::{
    Candidate, EvidenceEntry, EvidencePack, ProvenanceEntry, UNKNOWN,
};
use harvest_core::rules::{SelectionPolicy, SelectionPolicyName};
use harvest_core::tier;
use harvest_rules::{NormalizeContext, RulesEngine};

/// Score ratio a winner needs over the runner-up.
const WIN_SCORE_RATIO: f64 = 1.1;
/// Distinct approved root domains required for normal acceptance.
const APPROVED_DOMAINS_REQUIRED: usize = 3;
/// Flat bonus used by the tie-break selection policies.
const POLICY_BONUS: f64 = 0.25;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Everything one source contributes to a consensus round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceResult {
    /// Document ID of the source.
    pub source_id: String,
    /// Page URL.
    pub url: String,
    /// Serving host.
    pub host: String,
    /// Source tier.
    pub tier: u8,
    /// Whether the host is on the category allow-list.
    pub approved_domain: bool,
    /// Whether the host is tagged as an instrumented lab.
    #[serde(default)]
    pub instrumented_domain: bool,
    /// Whether the identity gate matched this page.
    pub identity_matched: bool,
    /// Per-field proposals.
    pub field_candidates: Vec<Candidate>,
    /// Snippets backing the proposals.
    #[serde(default)]
    pub evidence_pack: EvidencePack,
}

/// Consensus configuration for one round.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusConfig {
    /// Allow the manufacturer + tier-2 below-pass-target path.
    pub allow_below_pass_target: bool,
    /// Whether the identity gate is open (closed → identity fields only).
    pub gate_open: bool,
}

/// Output of a consensus round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusOutput {
    /// Field → accepted value (`"unk"` where unresolved).
    pub fields: BTreeMap<String, String>,
    /// Field → provenance.
    pub provenance: BTreeMap<String, ProvenanceEntry>,
    /// Source IDs quarantined before clustering (anchor conflicts).
    pub quarantined_sources: Vec<String>,
    /// The surviving normalized candidate pool, for the reducers.
    pub candidates: BTreeMap<String, Vec<Candidate>>,
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Cluster {
    /// Display value (first normalized spelling seen).
    value: String,
    candidates: Vec<Candidate>,
    score: f64,
    approved_domains: Vec<String>,
    instrumented_confirmations: u32,
    has_manufacturer: bool,
    has_approved_tier2: bool,
}

impl Cluster {
    fn approved_count(&self) -> usize {
        self.approved_domains.len()
    }
}

/// Weight of one candidate in its cluster.
fn candidate_weight(c: &Candidate) -> f64 {
    let tier_base = match c.tier {
        1 => 3.0,
        2 => 2.0,
        3 => 1.2,
        _ => 0.6,
    };
    let method_mult = match c.method.preference() {
        0 => 1.2,  // ld_json
        1 => 1.15, // spec_table
        2 => 1.1,  // pdf
        3 => 1.0,  // regex
        4 => 0.8,  // fts
        _ => 0.7,  // llm
    };
    let approval_mult = if c.approved_domain { 1.25 } else { 0.75 };
    tier_base * method_mult * approval_mult
}

/// Deterministic candidate ordering: tier asc, method preference, root
/// domain asc.
fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.tier
            .cmp(&b.tier)
            .then(a.method.preference().cmp(&b.method.preference()))
            .then(a.root_domain.cmp(&b.root_domain))
    });
}

fn build_clusters(candidates: &[Candidate], instrumented_hosts: &BTreeMap<String, bool>) -> Vec<Cluster> {
    let mut by_value: BTreeMap<String, Cluster> = BTreeMap::new();
    for c in candidates {
        let key = c.value.trim().to_lowercase();
        let cluster = by_value.entry(key).or_insert_with(|| Cluster {
            value: c.value.trim().to_string(),
            candidates: vec![],
            score: 0.0,
            approved_domains: vec![],
            instrumented_confirmations: 0,
            has_manufacturer: false,
            has_approved_tier2: false,
        });
        cluster.score += candidate_weight(c);
        if c.approved_domain && !cluster.approved_domains.contains(&c.root_domain) {
            cluster.approved_domains.push(c.root_domain.clone());
        }
        if instrumented_hosts.get(&c.root_domain).copied().unwrap_or(false) {
            cluster.instrumented_confirmations += 1;
        }
        if c.tier == tier::MANUFACTURER && c.approved_domain {
            cluster.has_manufacturer = true;
        }
        if c.tier == tier::CREDIBLE && c.approved_domain {
            cluster.has_approved_tier2 = true;
        }
        cluster.candidates.push(c.clone());
    }
    let mut clusters: Vec<Cluster> = by_value.into_values().collect();
    // Stable ordering: score desc, then value for determinism.
    clusters.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.value.cmp(&b.value))
    });
    clusters
}

/// The weighted-majority win rule: A beats B on both score ratio and
/// approved-domain count.
fn beats(a: &Cluster, b: &Cluster) -> bool {
    a.score >= WIN_SCORE_RATIO * b.score && a.approved_count() >= b.approved_count() + 1
}

fn policy_bonus(cluster: &Cluster, policy: SelectionPolicyName) -> f64 {
    match policy {
        SelectionPolicyName::BestConfidence => 0.0,
        SelectionPolicyName::BestEvidence => {
            POLICY_BONUS * cluster.candidates.iter().filter(|c| c.has_evidence()).count() as f64
        }
        SelectionPolicyName::PreferDeterministic => {
            POLICY_BONUS * cluster.candidates.iter().filter(|c| !c.method.is_llm()).count() as f64
        }
        SelectionPolicyName::PreferLlm => {
            POLICY_BONUS * cluster.candidates.iter().filter(|c| c.method.is_llm()).count() as f64
        }
        SelectionPolicyName::PreferLatest => cluster
            .candidates
            .iter()
            .filter_map(|c| c.ts)
            .max()
            .map_or(0.0, |ts| {
                // Newer timestamps earn up to one bonus unit across a
                // 30-day window.
                let age_days = (chrono::Utc::now() - ts).num_days().max(0) as f64;
                POLICY_BONUS * (1.0 - (age_days / 30.0).min(1.0))
            }),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Run consensus for one product round.
///
/// `anchors` are a-priori field assertions; any source contradicting one
/// is quarantined wholesale. When the identity gate is closed only
/// identity-locked fields resolve; everything else is `unk`.
#[must_use]
pub fn run_consensus(
    identity: &ProductIdentity,
    sources: &[SourceResult],
    field_order: &[String],
    anchors: &BTreeMap<String, String>,
    config: ConsensusConfig,
    rules: Option<&RulesEngine>,
) -> ConsensusOutput {
    let mut fields = BTreeMap::new();
    let mut provenance = BTreeMap::new();
    let mut pool: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();

    // Anchor check: one contradicted anchor quarantines the whole source.
    let mut quarantined = Vec::new();
    let mut live_sources: Vec<&SourceResult> = Vec::new();
    for source in sources {
        let conflicted = source.field_candidates.iter().any(|c| {
            anchors
                .get(&c.field)
                .is_some_and(|anchor| !anchor.eq_ignore_ascii_case(c.value.trim()))
        });
        if conflicted {
            debug!(source = %source.source_id, "anchor conflict; source quarantined");
            quarantined.push(source.source_id.clone());
        } else {
            live_sources.push(source);
        }
    }

    let instrumented_hosts: BTreeMap<String, bool> = sources
        .iter()
        .map(|s| (harvest_url::root_domain(&s.host), s.instrumented_domain))
        .collect();

    // Snippet metadata forwarded verbatim into provenance entries.
    let mut ref_meta: BTreeMap<String, RefMeta> = BTreeMap::new();
    for source in sources {
        for snippet in source.evidence_pack.snippets.values() {
            ref_meta.insert(
                snippet.snippet_id.clone(),
                RefMeta {
                    url: snippet.url.clone(),
                    host: source.host.clone(),
                    source_id: snippet.source_id.clone(),
                },
            );
        }
    }

    // Identity-locked fields come straight from the lock.
    for key in harvest_core::IdentityLock::locked_field_keys() {
        let value = match *key {
            "id" => Some(identity.product_id.clone()),
            "category" => Some(identity.category.clone()),
            other => identity.identity_lock.value_for(other),
        };
        if let Some(value) = value {
            fields.insert((*key).to_string(), value.clone());
            provenance.insert(
                (*key).to_string(),
                ProvenanceEntry {
                    value,
                    confidence: 1.0,
                    meets_pass_target: true,
                    accepted_below_pass_target: false,
                    instrumented_confirmations: 0,
                    evidence: vec![],
                },
            );
        }
    }

    for field_key in field_order {
        if fields.contains_key(field_key) {
            continue; // identity-locked
        }
        if !config.gate_open {
            fields.insert(field_key.clone(), UNKNOWN.to_string());
            provenance.insert(field_key.clone(), ProvenanceEntry::unknown());
            continue;
        }

        // Collect and normalize candidates from live, identity-matched
        // sources.
        let mut candidates: Vec<Candidate> = Vec::new();
        for source in live_sources.iter().filter(|s| s.identity_matched) {
            for c in source.field_candidates.iter().filter(|c| &c.field == field_key) {
                let mut c = c.clone();
                if let Some(engine) = rules {
                    let out = engine.normalize_candidate(field_key, &c.value, &NormalizeContext::default());
                    if !out.ok {
                        continue;
                    }
                    c.value = out.normalized;
                }
                candidates.push(c);
            }
        }
        sort_candidates(&mut candidates);

        let rule = rules.and_then(|e| e.rules.rule(field_key));
        let selection_policy = rule.and_then(|r| match &r.selection_policy {
            Some(SelectionPolicy::Named(name)) => Some(*name),
            _ => None,
        });
        let instrumented_field = rule.is_some_and(harvest_core::rules::FieldRule::instrumented);

        let clusters = build_clusters(&candidates, &instrumented_hosts);
        let (value, entry) = decide_field(
            &clusters,
            selection_policy,
            instrumented_field,
            config.allow_below_pass_target,
            &ref_meta,
        );
        fields.insert(field_key.clone(), value);
        provenance.insert(field_key.clone(), entry);
        pool.insert(field_key.clone(), candidates);
    }

    ConsensusOutput {
        fields,
        provenance,
        quarantined_sources: quarantined,
        candidates: pool,
    }
}

/// Pack-side metadata for one snippet reference.
struct RefMeta {
    url: String,
    host: String,
    source_id: String,
}

fn decide_field(
    clusters: &[Cluster],
    selection_policy: Option<SelectionPolicyName>,
    instrumented_field: bool,
    allow_below_pass_target: bool,
    ref_meta: &BTreeMap<String, RefMeta>,
) -> (String, ProvenanceEntry) {
    if clusters.is_empty() {
        return (UNKNOWN.to_string(), ProvenanceEntry::unknown());
    }

    let winner_idx = pick_winner(clusters, selection_policy);
    let Some(idx) = winner_idx else {
        // Tie that no policy resolved.
        return (UNKNOWN.to_string(), ProvenanceEntry::unknown());
    };
    let winner = &clusters[idx];

    let meets_pass_target = winner.approved_count() >= APPROVED_DOMAINS_REQUIRED;
    let below_pass_eligible = allow_below_pass_target
        && !instrumented_field
        && winner.has_manufacturer
        && winner.has_approved_tier2;

    if !meets_pass_target && !below_pass_eligible {
        return (UNKNOWN.to_string(), ProvenanceEntry::unknown());
    }

    let total_score: f64 = clusters.iter().map(|c| c.score).sum();
    let share = if total_score > 0.0 { winner.score / total_score } else { 0.0 };
    let domain_factor = (winner.approved_count() as f64 / APPROVED_DOMAINS_REQUIRED as f64).min(1.0);
    let confidence = (share * (0.5 + 0.5 * domain_factor)).min(1.0);

    let mut ordered = winner.candidates.clone();
    sort_candidates(&mut ordered);
    let evidence = ordered
        .iter()
        .map(|c| {
            let meta = c.evidence_refs.first().and_then(|r| ref_meta.get(r));
            EvidenceEntry {
                url: meta.map(|m| m.url.clone()).unwrap_or_default(),
                host: meta.map_or_else(|| c.root_domain.clone(), |m| m.host.clone()),
                tier: c.tier,
                method: c.method,
                snippet_id: c.evidence_refs.first().cloned(),
                snippet_hash: c.snippet_hash.clone(),
                source_id: meta.map(|m| m.source_id.clone()),
                extraction_method: Some(c.method),
                quote: c.quote.clone(),
            }
        })
        .collect();

    (
        winner.value.clone(),
        ProvenanceEntry {
            value: winner.value.clone(),
            confidence,
            meets_pass_target,
            accepted_below_pass_target: !meets_pass_target,
            instrumented_confirmations: winner.instrumented_confirmations,
            evidence,
        },
    )
}

/// Pick the winning cluster index, applying selection-policy bonuses only
/// when the weighted-majority rule fails on raw scores.
fn pick_winner(clusters: &[Cluster], policy: Option<SelectionPolicyName>) -> Option<usize> {
    if clusters.len() == 1 {
        return Some(0);
    }
    // Raw pass: clusters are pre-sorted by score desc.
    if beats(&clusters[0], &clusters[1]) {
        return Some(0);
    }
    // Tie-break pass with policy bonuses.
    let policy = policy?;
    let mut scored: Vec<(usize, f64, usize)> = clusters
        .iter()
        .enumerate()
        .map(|(i, c)| (i, c.score + policy_bonus(c, policy), c.approved_count()))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let (best_idx, best_score, best_domains) = scored[0];
    let (_, runner_score, runner_domains) = scored[1];
    // Under bonuses the domain requirement relaxes to "no worse": the
    // policies only nudge genuine ties.
    if best_score > runner_score && best_domains >= runner_domains {
        Some(best_idx)
    } else {
        None
    }
}
