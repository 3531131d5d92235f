// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-evidence
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use harvest_core::candidate::{Candidate, EvidencePack, ExtractionMethod, PackSnippet};
use harvest_core::events::DedupeOutcome;
use harvest_core::hex12;

/// Errors from the evidence index.
#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    /// SQLite failure.
    #[error("evidence database failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON encoding of hint lists failed.
    #[error("evidence serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Derive a document ID from its content address.
///
/// `doc_id = "doc_" + HEX12(sha256(content_hash || "|" || parser_version))`.
#[must_use]
pub fn doc_id(content_hash: &str, parser_version: &str) -> String {
    format!("doc_{}", hex12(&format!("{content_hash}|{parser_version}")))
}

/// Derive a snippet ID from its content address and ordinal.
///
/// `snippet_id = "sn_" + HEX12(sha256(content_hash || "|" || parser_version
/// || "|" || chunk_index))`.
#[must_use]
pub fn snippet_id(content_hash: &str, parser_version: &str, chunk_index: u32) -> String {
    format!("sn_{}", hex12(&format!("{content_hash}|{parser_version}|{chunk_index}")))
}

fn fact_id(content_hash: &str, parser_version: &str, chunk_index: u32, field_key: &str, value_raw: &str) -> String {
    format!("ft_{}", hex12(&format!("{content_hash}|{parser_version}|{chunk_index}|{field_key}|{value_raw}")))
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Document metadata presented for indexing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInput {
    /// Hash of the fetched content.
    pub content_hash: String,
    /// Version of the parser that produced the chunks.
    pub parser_version: String,
    /// Page URL.
    pub url: String,
    /// Serving host.
    pub host: String,
    /// Source tier.
    pub tier: u8,
    /// Source role (`"manufacturer"`, `"review"`, ...).
    pub role: String,
    /// Category slug.
    pub category: String,
    /// Product the fetch was for.
    pub product_id: String,
    /// Body size in bytes.
    pub bytes: u64,
}

/// One chunk presented for indexing. `chunk_index` is implicit in slice
/// position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInput {
    /// Chunk kind (`"spec_table"`, `"prose"`, ...).
    pub chunk_type: String,
    /// Raw chunk text.
    pub text: String,
    /// Normalized text (lowercased, whitespace-collapsed).
    pub normalized_text: String,
    /// How the chunk was extracted.
    pub extraction_method: ExtractionMethod,
    /// Field keys this chunk likely speaks to.
    pub field_hints: Vec<String>,
}

/// One fact presented for indexing, tied to a chunk by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactInput {
    /// Index of the chunk the fact came from.
    pub chunk_index: u32,
    /// Field key.
    pub field_key: String,
    /// Raw extracted value.
    pub value_raw: String,
    /// Normalized value.
    pub value_normalized: String,
    /// Unit, if any.
    pub unit: Option<String>,
    /// Extraction method.
    pub extraction_method: ExtractionMethod,
    /// Extractor confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Result of indexing one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexResult {
    /// The (stable) document ID.
    pub doc_id: String,
    /// Snippet IDs in chunk order.
    pub snippet_ids: Vec<String>,
    /// Chunks written this call (0 on dedupe hits).
    pub chunks_indexed: usize,
    /// Facts written this call.
    pub facts_indexed: usize,
    /// Dedupe classification.
    pub dedupe_outcome: DedupeOutcome,
}

/// A chunk row as returned from search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRow {
    /// Snippet ID.
    pub snippet_id: String,
    /// Owning document.
    pub doc_id: String,
    /// Chunk ordinal.
    pub chunk_index: u32,
    /// Chunk kind.
    pub chunk_type: String,
    /// Raw text.
    pub text: String,
    /// Normalized text.
    pub normalized_text: String,
    /// Hash of the normalized text.
    pub snippet_hash: String,
    /// Field hints.
    pub field_hints: Vec<String>,
    /// Page URL of the owning document.
    pub url: String,
    /// Host of the owning document.
    pub host: String,
    /// Tier of the owning document.
    pub tier: u8,
}

// ---------------------------------------------------------------------------
// EvidenceIndex
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS evidence_documents (
    doc_id         TEXT PRIMARY KEY,
    content_hash   TEXT NOT NULL,
    parser_version TEXT NOT NULL,
    url            TEXT NOT NULL,
    host           TEXT NOT NULL,
    tier           INTEGER NOT NULL,
    role           TEXT NOT NULL,
    category       TEXT NOT NULL,
    product_id     TEXT NOT NULL,
    bytes          INTEGER NOT NULL,
    created_ts     TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_content
    ON evidence_documents(content_hash, parser_version);
CREATE INDEX IF NOT EXISTS idx_documents_url ON evidence_documents(url);

CREATE TABLE IF NOT EXISTS evidence_chunks (
    snippet_id        TEXT PRIMARY KEY,
    doc_id            TEXT NOT NULL REFERENCES evidence_documents(doc_id),
    chunk_index       INTEGER NOT NULL,
    chunk_type        TEXT NOT NULL,
    text              TEXT NOT NULL,
    normalized_text   TEXT NOT NULL,
    snippet_hash      TEXT NOT NULL,
    extraction_method TEXT NOT NULL,
    field_hints       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS evidence_facts (
    fact_id           TEXT PRIMARY KEY,
    snippet_id        TEXT NOT NULL REFERENCES evidence_chunks(snippet_id),
    doc_id            TEXT NOT NULL REFERENCES evidence_documents(doc_id),
    field_key         TEXT NOT NULL,
    value_raw         TEXT NOT NULL,
    value_normalized  TEXT NOT NULL,
    unit              TEXT,
    extraction_method TEXT NOT NULL,
    confidence        REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_facts_field ON evidence_facts(field_key);

CREATE VIRTUAL TABLE IF NOT EXISTS evidence_fts USING fts5(
    snippet_id UNINDEXED,
    normalized_text,
    field_hints
);
";

/// The content-addressed evidence store.
pub struct EvidenceIndex {
    conn: Mutex<Connection>,
}

impl EvidenceIndex {
    /// Open (or create) the index at `path`.
    ///
    /// # Errors
    ///
    /// [`EvidenceError::Sqlite`] on database failures.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EvidenceError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory index, mainly for tests.
    ///
    /// # Errors
    ///
    /// [`EvidenceError::Sqlite`] on database failures.
    pub fn in_memory() -> Result<Self, EvidenceError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Index one parsed document with its chunks and facts.
    ///
    /// Dedupe outcomes:
    /// - no prior `(content_hash, parser_version)` row → `new`, insert;
    /// - prior row with the same content hash → `reused`, skip writes;
    /// - prior row with a different hash at the same URL → `updated`,
    ///   insert the new document and leave the old in place.
    ///
    /// # Errors
    ///
    /// [`EvidenceError::Sqlite`] / [`EvidenceError::Json`] on failures.
    pub fn index_document(
        &self,
        doc: &DocumentInput,
        chunks: &[ChunkInput],
        facts: &[FactInput],
    ) -> Result<IndexResult, EvidenceError> {
        let id = doc_id(&doc.content_hash, &doc.parser_version);
        let conn = self.conn.lock().expect("evidence db poisoned");

        let existing: Option<String> = conn
            .query_row(
                "SELECT doc_id FROM evidence_documents
                 WHERE content_hash = ?1 AND parser_version = ?2",
                params![doc.content_hash, doc.parser_version],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing_id) = existing {
            debug!(doc_id = %existing_id, "dedupe hit");
            let snippet_ids = (0..chunks.len() as u32)
                .map(|i| snippet_id(&doc.content_hash, &doc.parser_version, i))
                .collect();
            return Ok(IndexResult {
                doc_id: existing_id,
                snippet_ids,
                chunks_indexed: 0,
                facts_indexed: 0,
                dedupe_outcome: DedupeOutcome::Reused,
            });
        }

        let same_url: Option<String> = conn
            .query_row(
                "SELECT doc_id FROM evidence_documents WHERE url = ?1 LIMIT 1",
                params![doc.url],
                |row| row.get(0),
            )
            .optional()?;
        let outcome = if same_url.is_some() {
            DedupeOutcome::Updated
        } else {
            DedupeOutcome::New
        };

        conn.execute(
            "INSERT INTO evidence_documents (
                doc_id, content_hash, parser_version, url, host, tier, role,
                category, product_id, bytes, created_ts
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                doc.content_hash,
                doc.parser_version,
                doc.url,
                doc.host,
                i64::from(doc.tier),
                doc.role,
                doc.category,
                doc.product_id,
                doc.bytes as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;

        let mut snippet_ids = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let idx = i as u32;
            let sid = snippet_id(&doc.content_hash, &doc.parser_version, idx);
            let hints = serde_json::to_string(&chunk.field_hints)?;
            let snippet_hash = harvest_core::sha256_hex(chunk.normalized_text.as_bytes());
            conn.execute(
                "INSERT INTO evidence_chunks (
                    snippet_id, doc_id, chunk_index, chunk_type, text,
                    normalized_text, snippet_hash, extraction_method, field_hints
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    sid,
                    id,
                    i64::from(idx),
                    chunk.chunk_type,
                    chunk.text,
                    chunk.normalized_text,
                    snippet_hash,
                    method_str(chunk.extraction_method),
                    hints,
                ],
            )?;
            conn.execute(
                "INSERT INTO evidence_fts (snippet_id, normalized_text, field_hints)
                 VALUES (?1, ?2, ?3)",
                params![sid, chunk.normalized_text, chunk.field_hints.join(" ")],
            )?;
            snippet_ids.push(sid);
        }

        let mut facts_indexed = 0;
        for fact in facts {
            if fact.chunk_index as usize >= chunks.len() {
                continue;
            }
            let sid = snippet_id(&doc.content_hash, &doc.parser_version, fact.chunk_index);
            let fid = fact_id(
                &doc.content_hash,
                &doc.parser_version,
                fact.chunk_index,
                &fact.field_key,
                &fact.value_raw,
            );
            conn.execute(
                "INSERT OR REPLACE INTO evidence_facts (
                    fact_id, snippet_id, doc_id, field_key, value_raw,
                    value_normalized, unit, extraction_method, confidence
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    fid,
                    sid,
                    id,
                    fact.field_key,
                    fact.value_raw,
                    fact.value_normalized,
                    fact.unit,
                    method_str(fact.extraction_method),
                    fact.confidence,
                ],
            )?;
            facts_indexed += 1;
        }

        Ok(IndexResult {
            doc_id: id,
            snippet_ids,
            chunks_indexed: chunks.len(),
            facts_indexed,
            dedupe_outcome: outcome,
        })
    }

    /// FTS over normalized text and field hints, scoped to one product.
    ///
    /// Terms shorter than two characters are dropped; if nothing usable
    /// remains the result is empty.
    ///
    /// # Errors
    ///
    /// [`EvidenceError::Sqlite`] on database failures.
    pub fn search_by_field(
        &self,
        category: &str,
        product_id: &str,
        _field_key: &str,
        query_terms: &[String],
        max_results: usize,
    ) -> Result<Vec<ChunkRow>, EvidenceError> {
        let usable: Vec<String> = query_terms
            .iter()
            .filter(|t| t.trim().len() >= 2)
            .map(|t| format!("\"{}\"", t.trim().replace('"', "")))
            .collect();
        if usable.is_empty() {
            return Ok(vec![]);
        }
        let match_expr = usable.join(" OR ");

        let conn = self.conn.lock().expect("evidence db poisoned");
        let mut stmt = conn.prepare(
            "SELECT c.snippet_id, c.doc_id, c.chunk_index, c.chunk_type, c.text,
                    c.normalized_text, c.snippet_hash, c.field_hints,
                    d.url, d.host, d.tier
             FROM evidence_fts
             JOIN evidence_chunks c ON c.snippet_id = evidence_fts.snippet_id
             JOIN evidence_documents d ON d.doc_id = c.doc_id
             WHERE evidence_fts MATCH ?1
               AND d.category = ?2 AND d.product_id = ?3
             ORDER BY evidence_fts.rank
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![match_expr, category, product_id, max_results as i64],
            |row| {
                let hints_raw: String = row.get(7)?;
                Ok(ChunkRow {
                    snippet_id: row.get(0)?,
                    doc_id: row.get(1)?,
                    chunk_index: row.get::<_, i64>(2)? as u32,
                    chunk_type: row.get(3)?,
                    text: row.get(4)?,
                    normalized_text: row.get(5)?,
                    snippet_hash: row.get(6)?,
                    field_hints: serde_json::from_str(&hints_raw).unwrap_or_default(),
                    url: row.get(8)?,
                    host: row.get(9)?,
                    tier: row.get::<_, i64>(10)? as u8,
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Facts recorded for `field_key` on the given snippet.
    ///
    /// # Errors
    ///
    /// [`EvidenceError::Sqlite`] on database failures.
    pub fn facts_for_snippet(
        &self,
        snippet: &str,
        field_key: &str,
    ) -> Result<Vec<FactInput>, EvidenceError> {
        let conn = self.conn.lock().expect("evidence db poisoned");
        let mut stmt = conn.prepare(
            "SELECT c.chunk_index, f.field_key, f.value_raw, f.value_normalized,
                    f.unit, f.extraction_method, f.confidence
             FROM evidence_facts f
             JOIN evidence_chunks c ON c.snippet_id = f.snippet_id
             WHERE f.snippet_id = ?1 AND f.field_key = ?2",
        )?;
        let rows = stmt.query_map(params![snippet, field_key], |row| {
            Ok(FactInput {
                chunk_index: row.get::<_, i64>(0)? as u32,
                field_key: row.get(1)?,
                value_raw: row.get(2)?,
                value_normalized: row.get(3)?,
                unit: row.get(4)?,
                extraction_method: parse_method(&row.get::<_, String>(5)?),
                confidence: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Map FTS results into the consensus candidate pool.
    ///
    /// Each chunk contributes one candidate per matching fact, with the
    /// snippet added to the evidence pack. `is_approved` classifies hosts
    /// against the category allow-list.
    ///
    /// # Errors
    ///
    /// [`EvidenceError::Sqlite`] on database failures.
    pub fn fts_to_evidence_pool(
        &self,
        rows: &[ChunkRow],
        field_key: &str,
        is_approved: &dyn Fn(&str) -> bool,
    ) -> Result<(Vec<Candidate>, EvidencePack), EvidenceError> {
        let mut candidates = Vec::new();
        let mut pack = EvidencePack::default();
        for row in rows {
            let facts = self.facts_for_snippet(&row.snippet_id, field_key)?;
            if facts.is_empty() {
                continue;
            }
            pack.insert(PackSnippet {
                snippet_id: row.snippet_id.clone(),
                snippet_hash: row.snippet_hash.clone(),
                source_id: row.doc_id.clone(),
                url: row.url.clone(),
                normalized_text: row.normalized_text.clone(),
                retrieved_at: None,
            });
            for fact in facts {
                candidates.push(Candidate {
                    field: field_key.to_string(),
                    value: if fact.value_normalized.is_empty() {
                        fact.value_raw.clone()
                    } else {
                        fact.value_normalized.clone()
                    },
                    method: ExtractionMethod::Fts,
                    approved_domain: is_approved(&row.host),
                    tier: row.tier,
                    score: fact.confidence,
                    root_domain: harvest_url::root_domain(&row.host),
                    evidence_refs: vec![row.snippet_id.clone()],
                    snippet_hash: Some(row.snippet_hash.clone()),
                    quote: Some(fact.value_raw.clone()),
                    quote_span: None,
                    ts: None,
                });
            }
        }
        Ok((candidates, pack))
    }

    /// Number of documents indexed.
    ///
    /// # Errors
    ///
    /// [`EvidenceError::Sqlite`] on database failures.
    pub fn document_count(&self) -> Result<u64, EvidenceError> {
        let conn = self.conn.lock().expect("evidence db poisoned");
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM evidence_documents", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

fn method_str(method: ExtractionMethod) -> &'static str {
    match method {
        ExtractionMethod::LdJson => "ld_json",
        ExtractionMethod::SpecTable => "spec_table",
        ExtractionMethod::Regex => "regex",
        ExtractionMethod::Pdf => "pdf",
        ExtractionMethod::Fts => "fts",
        ExtractionMethod::Llm => "llm",
    }
}

fn parse_method(raw: &str) -> ExtractionMethod {
    match raw {
        "ld_json" => ExtractionMethod::LdJson,
        "regex" => ExtractionMethod::Regex,
        "pdf" => ExtractionMethod::Pdf,
        "fts" => ExtractionMethod::Fts,
        "llm" => ExtractionMethod::Llm,
        _ => ExtractionMethod::SpecTable,
    }
}
