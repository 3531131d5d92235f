// SPDX-License-Identifier: MIT OR Apache-2.0
//! Consensus acceptance scenarios.

use std::collections::BTreeMap;

use harvest_consensus::{ConsensusConfig, SourceResult, run_consensus};
use harvest_core::candidate::{Candidate, EvidencePack, ExtractionMethod};
use harvest_core::rules::{
    FieldRule, FieldRuleSet, KnownValues, RequiredLevel, SelectionPolicy, SelectionPolicyName,
};
use harvest_core::{IdentityLock, ProductIdentity};
use harvest_rules::RulesEngine;

fn identity() -> ProductIdentity {
    ProductIdentity::new(
        "gaming-mice",
        IdentityLock {
            brand: "Razer".into(),
            model: "Viper V3 Pro".into(),
            ..IdentityLock::default()
        },
    )
    .unwrap()
}

fn source(id: &str, domain: &str, tier: u8, approved: bool, value: &str) -> SourceResult {
    SourceResult {
        source_id: id.into(),
        url: format!("https://{domain}/review"),
        host: domain.into(),
        tier,
        approved_domain: approved,
        instrumented_domain: false,
        identity_matched: true,
        field_candidates: vec![Candidate {
            field: "sensor".into(),
            value: value.into(),
            method: ExtractionMethod::SpecTable,
            approved_domain: approved,
            tier,
            score: 0.9,
            root_domain: domain.into(),
            evidence_refs: vec![],
            snippet_hash: None,
            quote: None,
            quote_span: None,
            ts: None,
        }],
        evidence_pack: EvidencePack::default(),
    }
}

fn config() -> ConsensusConfig {
    ConsensusConfig { allow_below_pass_target: false, gate_open: true }
}

#[test]
fn three_approved_root_domains_accept_the_value() {
    let sources = vec![
        source("s1", "rtings.com", 2, true, "Focus Pro 35K"),
        source("s2", "techpowerup.com", 2, true, "Focus Pro 35K"),
        source("s3", "rocketjumpninja.com", 2, true, "Focus Pro 35K"),
        source("s4", "randomforum.net", 3, false, "Focus Pro 35K"),
    ];
    let out = run_consensus(
        &identity(),
        &sources,
        &["sensor".to_string()],
        &BTreeMap::new(),
        config(),
        None,
    );
    assert_eq!(out.fields["sensor"], "Focus Pro 35K");
    assert!(out.provenance["sensor"].meets_pass_target);
}

#[test]
fn two_approved_plus_unapproved_stay_unknown() {
    let sources = vec![
        source("s1", "rtings.com", 2, true, "Focus Pro 35K"),
        source("s2", "techpowerup.com", 2, true, "Focus Pro 35K"),
        source("s3", "randomforum.net", 3, false, "Focus Pro 35K"),
        source("s4", "pastebin.example", 3, false, "Focus Pro 35K"),
    ];
    let out = run_consensus(
        &identity(),
        &sources,
        &["sensor".to_string()],
        &BTreeMap::new(),
        config(),
        None,
    );
    assert_eq!(out.fields["sensor"], "unk");
}

#[test]
fn identity_lock_overrides_source_claims() {
    let sources = vec![
        source("s1", "a.com", 2, true, "whatever"),
        source("s2", "b.com", 2, true, "whatever"),
        source("s3", "c.com", 2, true, "whatever"),
    ];
    let out = run_consensus(
        &identity(),
        &sources,
        &["brand".to_string(), "model".to_string(), "sensor".to_string()],
        &BTreeMap::new(),
        config(),
        None,
    );
    assert_eq!(out.fields["brand"], "Razer");
    assert_eq!(out.fields["model"], "Viper V3 Pro");
    assert_eq!(out.fields["id"], "razer-viper-v3-pro");
}

#[test]
fn best_evidence_policy_breaks_a_tie() {
    // Two 3-3 tied clusters; cluster B's candidates each carry a citation.
    let mut sources = vec![
        source("a1", "rtings.com", 2, true, "Sensor A"),
        source("a2", "techpowerup.com", 2, true, "Sensor A"),
        source("a3", "rocketjumpninja.com", 2, true, "Sensor A"),
        source("b1", "tomshardware.com", 2, true, "Sensor B"),
        source("b2", "anandtech.com", 2, true, "Sensor B"),
        source("b3", "eloshapes.com", 2, true, "Sensor B"),
    ];
    for b in sources.iter_mut().filter(|s| s.source_id.starts_with('b')) {
        b.field_candidates[0].evidence_refs = vec!["sn_cite".into()];
    }

    let mut rule = FieldRule::text("sensor", RequiredLevel::Required);
    rule.selection_policy = Some(SelectionPolicy::Named(SelectionPolicyName::BestEvidence));
    let mut set = FieldRuleSet::default();
    set.fields.insert("sensor".into(), rule);
    let engine = RulesEngine::new(set, KnownValues::default(), vec![], BTreeMap::new(), BTreeMap::new());

    let out = run_consensus(
        &identity(),
        &sources,
        &["sensor".to_string()],
        &BTreeMap::new(),
        config(),
        Some(&engine),
    );
    assert_eq!(out.fields["sensor"], "Sensor B");

    // Without the policy the same tie stays unknown.
    let out = run_consensus(
        &identity(),
        &sources,
        &["sensor".to_string()],
        &BTreeMap::new(),
        config(),
        None,
    );
    assert_eq!(out.fields["sensor"], "unk");
}

#[test]
fn anchor_conflicted_source_contributes_nothing() {
    let sources = vec![
        source("s1", "rtings.com", 2, true, "Hero 2"),
        source("s2", "techpowerup.com", 2, true, "Focus Pro 35K"),
        source("s3", "rocketjumpninja.com", 2, true, "Focus Pro 35K"),
        source("s4", "tomshardware.com", 2, true, "Focus Pro 35K"),
    ];
    let mut anchors = BTreeMap::new();
    anchors.insert("sensor".to_string(), "Focus Pro 35K".to_string());
    let out = run_consensus(
        &identity(),
        &sources,
        &["sensor".to_string()],
        &anchors,
        config(),
        None,
    );
    assert_eq!(out.quarantined_sources, vec!["s1".to_string()]);
    assert_eq!(out.fields["sensor"], "Focus Pro 35K");
}
