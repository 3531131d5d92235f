// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-source candidates, evidence packs, and per-field provenance.
//!
//! A [`Candidate`] is a single source's proposal for a single field; it
//! lives for one consensus round. A [`ProvenanceEntry`] is the durable
//! outcome: the winning value plus the evidence trail that backs it.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Extraction methods
// ---------------------------------------------------------------------------

/// How a candidate value was pulled out of a document.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Structured data embedded in the page (`ld+json`).
    LdJson,
    /// A recognized specification table.
    SpecTable,
    /// Deterministic pattern extraction from prose.
    Regex,
    /// Vendor PDF spec sheet.
    Pdf,
    /// Full-text-search snippet promotion.
    Fts,
    /// LLM extraction.
    Llm,
}

impl ExtractionMethod {
    /// Preference rank used for deterministic ordering; lower is better.
    /// Structured sources outrank prose, prose outranks model output.
    #[must_use]
    pub fn preference(self) -> u8 {
        match self {
            ExtractionMethod::LdJson => 0,
            ExtractionMethod::SpecTable => 1,
            ExtractionMethod::Pdf => 2,
            ExtractionMethod::Regex => 3,
            ExtractionMethod::Fts => 4,
            ExtractionMethod::Llm => 5,
        }
    }

    /// Whether this method involved a language model.
    #[must_use]
    pub fn is_llm(self) -> bool {
        matches!(self, ExtractionMethod::Llm)
    }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// A single source's proposal for a single field.
///
/// Created during parsing, consumed by consensus, discarded when the round
/// ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Candidate {
    /// Field key the proposal is for.
    pub field: String,
    /// Proposed value (normalized form where the rules engine ran).
    pub value: String,
    /// Extraction method.
    pub method: ExtractionMethod,
    /// Whether the source host is on the category allow-list.
    pub approved_domain: bool,
    /// Source tier (1 = manufacturer).
    pub tier: u8,
    /// Extractor-reported confidence/weight in `[0, 1]`.
    pub score: f64,
    /// Registrable root domain of the source (`example.com`).
    pub root_domain: String,
    /// Snippet IDs backing this proposal.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_refs: Vec<String>,
    /// Hash of the snippet's normalized text, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_hash: Option<String>,
    /// Verbatim quote supporting the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    /// `[start, end)` byte span of the quote inside the snippet text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_span: Option<(usize, usize)>,
    /// When the source was retrieved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

impl Candidate {
    /// A minimal candidate for `field` = `value`; used widely in tests.
    #[must_use]
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            method: ExtractionMethod::SpecTable,
            approved_domain: false,
            tier: 3,
            score: 0.5,
            root_domain: String::new(),
            evidence_refs: vec![],
            snippet_hash: None,
            quote: None,
            quote_span: None,
            ts: None,
        }
    }

    /// Whether the candidate carries at least one evidence reference.
    #[must_use]
    pub fn has_evidence(&self) -> bool {
        !self.evidence_refs.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Evidence pack
// ---------------------------------------------------------------------------

/// A snippet as carried in a source's evidence pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PackSnippet {
    /// Stable snippet ID (`sn_…`).
    pub snippet_id: String,
    /// Hash of the normalized text.
    pub snippet_hash: String,
    /// Source document ID (`doc_…`).
    pub source_id: String,
    /// Page URL the snippet came from.
    pub url: String,
    /// Normalized snippet text quotes are verified against.
    pub normalized_text: String,
    /// When the page was retrieved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieved_at: Option<DateTime<Utc>>,
}

/// The evidence snippets a source round carries, keyed by snippet ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct EvidencePack {
    /// Snippet ID → snippet.
    pub snippets: BTreeMap<String, PackSnippet>,
}

impl EvidencePack {
    /// Look up a snippet by ID.
    #[must_use]
    pub fn snippet(&self, snippet_id: &str) -> Option<&PackSnippet> {
        self.snippets.get(snippet_id)
    }

    /// Insert a snippet, keyed by its own ID.
    pub fn insert(&mut self, snippet: PackSnippet) {
        self.snippets.insert(snippet.snippet_id.clone(), snippet);
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// One evidence citation inside a provenance entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EvidenceEntry {
    /// Page URL.
    pub url: String,
    /// Host the page was served from.
    pub host: String,
    /// Source tier.
    pub tier: u8,
    /// Extraction method of the contributing candidate.
    pub method: ExtractionMethod,
    /// Snippet ID, forwarded verbatim from the evidence pack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_id: Option<String>,
    /// Snippet hash, forwarded verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_hash: Option<String>,
    /// Document ID, forwarded verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Extraction method as recorded in the pack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<ExtractionMethod>,
    /// Supporting quote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
}

/// The durable per-field outcome of a consensus round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProvenanceEntry {
    /// The accepted value (`"unk"` when unresolved).
    pub value: String,
    /// Aggregate confidence in `[0, 1]`.
    pub confidence: f64,
    /// Whether the value met the field's pass target.
    pub meets_pass_target: bool,
    /// Whether the below-pass-target path produced this value.
    #[serde(default)]
    pub accepted_below_pass_target: bool,
    /// Number of instrumented-domain confirmations observed.
    #[serde(default)]
    pub instrumented_confirmations: u32,
    /// The evidence trail, ordered tier ascending then method preference.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<EvidenceEntry>,
}

impl ProvenanceEntry {
    /// The `unk` placeholder entry.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            value: UNKNOWN.into(),
            confidence: 0.0,
            meets_pass_target: false,
            accepted_below_pass_target: false,
            instrumented_confirmations: 0,
            evidence: vec![],
        }
    }

    /// Whether this entry holds a resolved (non-`unk`) value.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.value != UNKNOWN
    }
}

/// The sentinel value for an unresolved field.
pub const UNKNOWN: &str = "unk";
