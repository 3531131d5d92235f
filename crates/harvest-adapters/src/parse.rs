// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTML parsing into chunks, structured data, and field candidates.
//!
//! The real pipeline fronts a readability parser; the engine only relies
//! on determinism — identical input must parse identically. The built-in
//! [`SimpleHtmlParser`] understands `ld+json` blocks, two-column spec
//! tables, and labeled prose lines, which is enough for mock pages and
//! smoke runs.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use harvest_core::candidate::{Candidate, ExtractionMethod};
use harvest_url::root_domain;

/// One parsed chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedChunk {
    /// Chunk kind (`"spec_table"`, `"prose"`, `"ld_json"`).
    pub chunk_type: String,
    /// Raw text.
    pub text: String,
    /// Lowercased, whitespace-collapsed text.
    pub normalized_text: String,
    /// How the chunk was extracted.
    pub extraction_method: ExtractionMethod,
    /// Field keys the chunk likely speaks to.
    pub field_hints: Vec<String>,
}

/// Everything a parse produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParsedHtml {
    /// Page title, when present.
    pub title: Option<String>,
    /// Parsed chunks in document order.
    pub chunks: Vec<ParsedChunk>,
    /// Raw `ld+json` payloads.
    pub ld_json: Vec<serde_json::Value>,
    /// Captured network responses (empty for static parsers).
    pub network_responses: Vec<serde_json::Value>,
    /// Field candidates recognized during parsing.
    pub field_candidates: Vec<Candidate>,
}

/// The parser interface the engine sees. Must be deterministic on
/// identical input.
pub trait HtmlParser: Send + Sync {
    /// Parse one HTML document fetched from `url`.
    fn parse_html(&self, url: &str, html: &str) -> ParsedHtml;
}

/// Field labels the simple parser recognizes in spec tables and prose.
const FIELD_LABELS: &[(&str, &str)] = &[
    ("weight", "weight"),
    ("sensor", "sensor"),
    ("dpi", "dpi_max"),
    ("max dpi", "dpi_max"),
    ("polling rate", "polling_rates"),
    ("battery life", "battery_hours"),
    ("battery", "battery_hours"),
    ("connection", "connection"),
    ("connectivity", "connection"),
    ("switches", "switches"),
    ("length", "length_mm"),
    ("width", "width_mm"),
    ("height", "height_mm"),
];

fn normalize_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("static regex"))
}

fn ld_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<script[^>]*type\s*=\s*["']application/ld\+json["'][^>]*>(.*?)</script>"#)
            .expect("static regex")
    })
}

fn table_row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<tr[^>]*>\s*<t[hd][^>]*>(.*?)</t[hd]>\s*<t[hd][^>]*>(.*?)</t[hd]>")
            .expect("static regex")
    })
}

fn tag_strip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"))
}

fn strip_tags(raw: &str) -> String {
    tag_strip_re().replace_all(raw, " ").trim().to_string()
}

fn field_for_label(label: &str) -> Option<&'static str> {
    let label = label.trim().trim_end_matches(':').to_lowercase();
    FIELD_LABELS
        .iter()
        .find(|(needle, _)| label == *needle || label.starts_with(*needle))
        .map(|(_, field)| *field)
}

/// A small deterministic parser for spec-table style pages.
#[derive(Debug, Default)]
pub struct SimpleHtmlParser {
    /// Hosts treated as approved when minting candidates.
    pub approved_hosts: Vec<String>,
    /// Host → tier mapping; unlisted hosts get tier 3.
    pub host_tiers: Vec<(String, u8)>,
}

impl SimpleHtmlParser {
    /// Parser with no approved hosts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tier_for(&self, host: &str) -> u8 {
        let root = root_domain(host);
        self.host_tiers
            .iter()
            .find(|(h, _)| root_domain(h) == root)
            .map_or(3, |(_, tier)| *tier)
    }

    fn approved(&self, host: &str) -> bool {
        let root = root_domain(host);
        self.approved_hosts.iter().any(|h| root_domain(h) == root)
    }
}

impl HtmlParser for SimpleHtmlParser {
    fn parse_html(&self, url: &str, html: &str) -> ParsedHtml {
        let mut out = ParsedHtml::default();
        let host = harvest_url::canonicalize(url).domain;
        let tier = self.tier_for(&host);
        let approved = self.approved(&host);
        let root = root_domain(&host);

        out.title = title_re()
            .captures(html)
            .map(|c| strip_tags(c.get(1).map_or("", |m| m.as_str())));

        for caps in ld_json_re().captures_iter(html) {
            if let Some(m) = caps.get(1)
                && let Ok(value) = serde_json::from_str::<serde_json::Value>(m.as_str())
            {
                out.ld_json.push(value);
            }
        }

        for caps in table_row_re().captures_iter(html) {
            let label = strip_tags(caps.get(1).map_or("", |m| m.as_str()));
            let value = strip_tags(caps.get(2).map_or("", |m| m.as_str()));
            if label.is_empty() || value.is_empty() {
                continue;
            }
            let text = format!("{label}: {value}");
            let field = field_for_label(&label);
            out.chunks.push(ParsedChunk {
                chunk_type: "spec_table".into(),
                normalized_text: normalize_text(&text),
                text,
                extraction_method: ExtractionMethod::SpecTable,
                field_hints: field.map(|f| vec![f.to_string()]).unwrap_or_default(),
            });
            if let Some(field) = field {
                // Quotes are verified against normalized snippet text, so
                // they are minted in normalized form.
                let quote = normalize_text(&value);
                out.field_candidates.push(Candidate {
                    field: field.to_string(),
                    value,
                    method: ExtractionMethod::SpecTable,
                    approved_domain: approved,
                    tier,
                    score: 0.9,
                    root_domain: root.clone(),
                    evidence_refs: vec![],
                    snippet_hash: None,
                    quote: Some(quote),
                    quote_span: None,
                    ts: None,
                });
            }
        }

        out
    }
}
