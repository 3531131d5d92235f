// SPDX-License-Identifier: MIT OR Apache-2.0
//! Evidence audit scenarios: quotes must live in their snippets.

use std::collections::BTreeMap;

use harvest_core::candidate::{EvidencePack, PackSnippet};
use harvest_core::rules::{FieldRuleSet, KnownValues};
use harvest_rules::{AuditOptions, EvidenceClaim, RulesEngine};

fn engine() -> RulesEngine {
    RulesEngine::new(
        FieldRuleSet::default(),
        KnownValues::default(),
        vec![],
        BTreeMap::new(),
        BTreeMap::new(),
    )
}

fn pack(text: &str) -> EvidencePack {
    let mut pack = EvidencePack::default();
    pack.insert(PackSnippet {
        snippet_id: "ref1".into(),
        snippet_hash: harvest_core::sha256_hex(text.as_bytes()),
        source_id: "doc_src".into(),
        url: "https://reviews.example.com/viper".into(),
        normalized_text: text.into(),
        retrieved_at: Some(chrono::Utc::now()),
    });
    pack
}

fn claim() -> EvidenceClaim {
    EvidenceClaim {
        url: "https://reviews.example.com/viper".into(),
        snippet_id: "ref1".into(),
        ..EvidenceClaim::default()
    }
}

#[test]
fn numeric_value_in_snippet_is_accepted_with_repaired_quote() {
    let engine = engine();
    let pack = pack("our scale puts it at 54 grams with the dongle");
    let out = engine.audit_evidence("weight", "54", &claim(), &pack, AuditOptions::default());
    assert!(out.ok);
    assert_eq!(out.quote.as_deref(), Some("54"));
    let (start, end) = out.quote_span.unwrap();
    let text = &pack.snippet("ref1").unwrap().normalized_text;
    assert_eq!(&text[start..end], "54");
}

#[test]
fn numeric_value_absent_is_rejected() {
    let engine = engine();
    let pack = pack("our scale puts it at 54 grams with the dongle");
    let out = engine.audit_evidence("weight", "99", &claim(), &pack, AuditOptions::default());
    assert!(!out.ok);
    assert_eq!(out.reason_code.as_deref(), Some("numeric_value_not_in_snippet"));
}

#[test]
fn strict_mode_enforces_span_and_hash() {
    let engine = engine();
    let text = "measured weight 54 grams";
    let pack = pack(text);
    let start = text.find("54").unwrap();

    let mut c = claim();
    c.quote = Some("54".into());
    c.quote_span = Some((start, start + 2));
    c.source_id = Some("doc_src".into());
    c.retrieved_at = Some(chrono::Utc::now());
    c.extraction_method = Some(harvest_core::candidate::ExtractionMethod::SpecTable);
    c.snippet_hash = Some(harvest_core::sha256_hex(text.as_bytes()));

    let out = engine.audit_evidence("weight", "54", &c, &pack, AuditOptions { strict: true });
    assert!(out.ok, "strict audit failed: {:?}", out.reason_code);

    // Drifted snippet hash means the cached snippet no longer matches.
    c.snippet_hash = Some("deadbeef".into());
    let out = engine.audit_evidence("weight", "54", &c, &pack, AuditOptions { strict: true });
    assert_eq!(out.reason_code.as_deref(), Some("snippet_hash_mismatch"));

    // A span that does not reproduce the quote is a mismatch.
    c.snippet_hash = Some(harvest_core::sha256_hex(text.as_bytes()));
    c.quote_span = Some((0, 8));
    let out = engine.audit_evidence("weight", "54", &c, &pack, AuditOptions { strict: true });
    assert_eq!(out.reason_code.as_deref(), Some("quote_span_mismatch"));

    // Inverted bounds are invalid outright.
    c.quote_span = Some((9, 4));
    let out = engine.audit_evidence("weight", "54", &c, &pack, AuditOptions { strict: true });
    assert_eq!(out.reason_code.as_deref(), Some("quote_span_invalid"));
}

#[test]
fn missing_snippet_reference_is_rejected() {
    let engine = engine();
    let out = engine.audit_evidence(
        "weight",
        "54",
        &claim(),
        &EvidencePack::default(),
        AuditOptions::default(),
    );
    assert!(!out.ok);
    assert_eq!(out.reason_code.as_deref(), Some("missing_evidence_refs"));
}
