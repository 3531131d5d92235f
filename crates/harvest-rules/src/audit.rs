// SPDX-License-Identifier: MIT OR Apache-2.0
//! Evidence auditing.
//!
//! A candidate's citation has to hold up: the snippet must exist in the
//! evidence pack, the quote must appear in the snippet's normalized text,
//! and in strict mode the span, hash, and source bookkeeping must all
//! check out. Numeric values get an auto-repair path: when the quote is
//! missing or stale, the auditor searches the snippet for the bare number
//! (with word boundaries) and rebuilds quote + span from the match.

use serde::{Deserialize, Serialize};

use harvest_core::candidate::{EvidencePack, ExtractionMethod};

use crate::{RulesEngine, reason};

/// The citation under audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EvidenceClaim {
    /// Page URL.
    pub url: String,
    /// Cited snippet ID.
    pub snippet_id: String,
    /// Supporting quote, if the extractor recorded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    /// `[start, end)` span of the quote in the snippet text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_span: Option<(usize, usize)>,
    /// Source document ID (strict mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Claimed snippet hash (strict mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_hash: Option<String>,
    /// Retrieval timestamp (strict mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieved_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Extraction method (strict mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<ExtractionMethod>,
}

/// Audit options.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditOptions {
    /// Require span, hash, source, timestamp, and method bookkeeping.
    pub strict: bool,
}

/// Outcome of one audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditOutcome {
    /// Whether the citation held up.
    pub ok: bool,
    /// Reason code on rejection.
    pub reason_code: Option<String>,
    /// The (possibly auto-repaired) quote.
    pub quote: Option<String>,
    /// The (possibly auto-repaired) span.
    pub quote_span: Option<(usize, usize)>,
}

impl AuditOutcome {
    fn fail(code: &str) -> Self {
        Self {
            ok: false,
            reason_code: Some(code.to_string()),
            quote: None,
            quote_span: None,
        }
    }
}

/// Extract the leading numeric substring of a value ("54 g" → "54").
fn numeric_substring(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    let end = trimmed
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*c == '.' && *i > 0) || (*c == '-' && *i == 0))
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    let s = &trimmed[..end];
    s.chars().any(|c| c.is_ascii_digit()).then_some(s)
}

/// Find `needle` in `haystack` at word boundaries so "54" cannot match
/// inside "154" or "543".
fn find_with_boundaries(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return None;
    }
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        let start = from + pos;
        let end = start + needle.len();
        let before_ok = start == 0
            || !haystack[..start]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '.');
        let after_ok = end == haystack.len()
            || !haystack[end..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '.');
        if before_ok && after_ok {
            return Some((start, end));
        }
        from = end;
    }
    None
}

impl RulesEngine {
    /// Audit a candidate's evidence citation against the pack.
    #[must_use]
    pub fn audit_evidence(
        &self,
        _field_key: &str,
        value: &str,
        claim: &EvidenceClaim,
        pack: &EvidencePack,
        opts: AuditOptions,
    ) -> AuditOutcome {
        if claim.url.is_empty() || claim.snippet_id.is_empty() {
            return AuditOutcome::fail(reason::MISSING_EVIDENCE_REFS);
        }
        let Some(snippet) = pack.snippet(&claim.snippet_id) else {
            return AuditOutcome::fail(reason::MISSING_EVIDENCE_REFS);
        };
        let text = &snippet.normalized_text;
        let numeric = numeric_substring(value);

        // Resolve a verified quote + span, repairing numerics if needed.
        let (quote, span) = match &claim.quote {
            Some(quote) if !quote.is_empty() => match find_with_boundaries(text, quote) {
                Some(span) => (quote.clone(), span),
                None => match numeric.and_then(|n| find_with_boundaries(text, n)) {
                    Some(span) => (numeric.unwrap_or_default().to_string(), span),
                    None => {
                        return AuditOutcome::fail(if numeric.is_some() {
                            reason::NUMERIC_VALUE_NOT_IN_SNIPPET
                        } else {
                            reason::QUOTE_NOT_IN_SNIPPET
                        });
                    }
                },
            },
            _ => {
                // No quote recorded: only numerics can be auto-repaired.
                let Some(n) = numeric else {
                    return AuditOutcome::fail(reason::MISSING_EVIDENCE_REFS);
                };
                match find_with_boundaries(text, n) {
                    Some(span) => (n.to_string(), span),
                    None => return AuditOutcome::fail(reason::NUMERIC_VALUE_NOT_IN_SNIPPET),
                }
            }
        };

        if opts.strict {
            if claim.source_id.is_none()
                || claim.retrieved_at.is_none()
                || claim.extraction_method.is_none()
            {
                return AuditOutcome::fail(reason::MISSING_EVIDENCE_REFS);
            }
            match &claim.snippet_hash {
                Some(hash) if *hash == snippet.snippet_hash => {}
                _ => return AuditOutcome::fail(reason::SNIPPET_HASH_MISMATCH),
            }
            let Some((s, e)) = claim.quote_span else {
                return AuditOutcome::fail(reason::QUOTE_SPAN_INVALID);
            };
            if s >= e || e > text.len() {
                return AuditOutcome::fail(reason::QUOTE_SPAN_INVALID);
            }
            let claimed_quote = claim.quote.as_deref().unwrap_or(&quote);
            if &text[s..e] != claimed_quote {
                return AuditOutcome::fail(reason::QUOTE_SPAN_MISMATCH);
            }
        }

        AuditOutcome {
            ok: true,
            reason_code: None,
            quote: Some(quote),
            quote_span: Some(span),
        }
    }
}
