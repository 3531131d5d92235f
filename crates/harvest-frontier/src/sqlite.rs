// SPDX-License-Identifier: MIT OR Apache-2.0
//! SQLite frontier backend.
//!
//! Rows mirror [`FrontierCore`] write-through; decisions always run against
//! the in-memory core, so this backend and the JSON backend produce
//! identical reason strings and durations for identical input sequences.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;

use crate::store::{
    Cooldown, FrontierCore, FrontierError, FrontierSnapshot, FrontierTuning, PathStats, QueryRow,
    RecordedFetch, SkipDecision, UrlRow,
};
use crate::cooldown::CooldownReason;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS frontier_urls (
    key               TEXT PRIMARY KEY,
    product_id        TEXT NOT NULL,
    canonical_url     TEXT NOT NULL,
    domain            TEXT NOT NULL,
    path_signature    TEXT NOT NULL,
    first_seen_ts     TEXT NOT NULL,
    last_seen_ts      TEXT NOT NULL,
    last_status       INTEGER NOT NULL,
    notfound_count    INTEGER NOT NULL,
    blocked_count     INTEGER NOT NULL,
    parsed_ok_count   INTEGER NOT NULL,
    consecutive_403   INTEGER NOT NULL,
    consecutive_429   INTEGER NOT NULL,
    fields_found      TEXT NOT NULL,
    cooldown_reason   TEXT,
    cooldown_seconds  INTEGER,
    cooldown_until_ts TEXT,
    content_hash      TEXT
);
CREATE TABLE IF NOT EXISTS frontier_queries (
    key              TEXT PRIMARY KEY,
    product_id       TEXT NOT NULL,
    normalized_query TEXT NOT NULL,
    provider         TEXT NOT NULL,
    fields           TEXT NOT NULL,
    last_run_ts      TEXT NOT NULL,
    result_url_count INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS frontier_paths (
    key       TEXT PRIMARY KEY,
    notfound  INTEGER NOT NULL,
    parsed_ok INTEGER NOT NULL
);
";

/// Frontier store persisted in an embedded SQLite database.
pub struct SqliteFrontier {
    conn: Mutex<Connection>,
    core: FrontierCore,
    tuning: FrontierTuning,
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SqliteFrontier {
    /// Open (or create) the frontier database at `path`.
    ///
    /// # Errors
    ///
    /// [`FrontierError::Sqlite`] on database failures.
    pub fn open(path: impl AsRef<Path>, tuning: FrontierTuning) -> Result<Self, FrontierError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, tuning)
    }

    /// In-memory database, mainly for tests.
    ///
    /// # Errors
    ///
    /// [`FrontierError::Sqlite`] on database failures.
    pub fn in_memory(tuning: FrontierTuning) -> Result<Self, FrontierError> {
        Self::with_connection(Connection::open_in_memory()?, tuning)
    }

    fn with_connection(conn: Connection, tuning: FrontierTuning) -> Result<Self, FrontierError> {
        conn.execute_batch(SCHEMA)?;
        let core = Self::load_core(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            core,
            tuning,
        })
    }

    fn load_core(conn: &Connection) -> Result<FrontierCore, FrontierError> {
        let mut core = FrontierCore::default();

        let mut stmt = conn.prepare(
            "SELECT key, product_id, canonical_url, domain, path_signature, first_seen_ts,
                    last_seen_ts, last_status, notfound_count, blocked_count, parsed_ok_count,
                    consecutive_403, consecutive_429, fields_found, cooldown_reason,
                    cooldown_seconds, cooldown_until_ts, content_hash
             FROM frontier_urls",
        )?;
        let rows = stmt.query_map([], |row| {
            let key: String = row.get(0)?;
            let fields_raw: String = row.get(13)?;
            let cooldown_reason: Option<String> = row.get(14)?;
            let cooldown = match cooldown_reason {
                Some(reason_str) => {
                    let seconds: u64 = row.get::<_, i64>(15)? as u64;
                    let until: String = row.get(16)?;
                    serde_json::from_value::<CooldownReason>(serde_json::Value::String(reason_str))
                        .ok()
                        .map(|reason| Cooldown {
                            reason,
                            seconds,
                            until_ts: parse_ts(&until),
                        })
                }
                None => None,
            };
            Ok((
                key,
                UrlRow {
                    product_id: row.get(1)?,
                    canonical_url: row.get(2)?,
                    domain: row.get(3)?,
                    path_signature: row.get(4)?,
                    first_seen_ts: parse_ts(&row.get::<_, String>(5)?),
                    last_seen_ts: parse_ts(&row.get::<_, String>(6)?),
                    last_status: row.get::<_, i64>(7)? as u16,
                    notfound_count: row.get::<_, i64>(8)? as u32,
                    blocked_count: row.get::<_, i64>(9)? as u32,
                    parsed_ok_count: row.get::<_, i64>(10)? as u32,
                    consecutive_403: row.get::<_, i64>(11)? as u32,
                    consecutive_429: row.get::<_, i64>(12)? as u32,
                    fields_found: serde_json::from_str(&fields_raw).unwrap_or_default(),
                    cooldown,
                    content_hash: row.get(17)?,
                },
            ))
        })?;
        for row in rows {
            let (key, url_row) = row?;
            core.urls.insert(key, url_row);
        }

        let mut stmt = conn.prepare(
            "SELECT key, product_id, normalized_query, provider, fields, last_run_ts,
                    result_url_count
             FROM frontier_queries",
        )?;
        let rows = stmt.query_map([], |row| {
            let key: String = row.get(0)?;
            let fields_raw: String = row.get(4)?;
            Ok((
                key,
                QueryRow {
                    product_id: row.get(1)?,
                    normalized_query: row.get(2)?,
                    provider: row.get(3)?,
                    fields: serde_json::from_str(&fields_raw).unwrap_or_default(),
                    last_run_ts: parse_ts(&row.get::<_, String>(5)?),
                    result_url_count: row.get::<_, i64>(6)? as u32,
                },
            ))
        })?;
        for row in rows {
            let (key, query_row) = row?;
            core.queries.insert(key, query_row);
        }

        let mut stmt = conn.prepare("SELECT key, notfound, parsed_ok FROM frontier_paths")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                PathStats {
                    notfound: row.get::<_, i64>(1)? as u64,
                    parsed_ok: row.get::<_, i64>(2)? as u64,
                },
            ))
        })?;
        for row in rows {
            let (key, stats) = row?;
            core.path_stats.insert(key, stats);
        }

        Ok(core)
    }

    fn upsert_url(&self, key: &str, row: &UrlRow) -> Result<(), FrontierError> {
        let conn = self.conn.lock().expect("frontier db poisoned");
        let fields = serde_json::to_string(&row.fields_found)?;
        conn.execute(
            "INSERT OR REPLACE INTO frontier_urls (
                key, product_id, canonical_url, domain, path_signature, first_seen_ts,
                last_seen_ts, last_status, notfound_count, blocked_count, parsed_ok_count,
                consecutive_403, consecutive_429, fields_found, cooldown_reason,
                cooldown_seconds, cooldown_until_ts, content_hash
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                key,
                row.product_id,
                row.canonical_url,
                row.domain,
                row.path_signature,
                row.first_seen_ts.to_rfc3339(),
                row.last_seen_ts.to_rfc3339(),
                i64::from(row.last_status),
                i64::from(row.notfound_count),
                i64::from(row.blocked_count),
                i64::from(row.parsed_ok_count),
                i64::from(row.consecutive_403),
                i64::from(row.consecutive_429),
                fields,
                row.cooldown.map(|c| c.reason.as_str().to_string()),
                row.cooldown.map(|c| c.seconds as i64),
                row.cooldown.map(|c| c.until_ts.to_rfc3339()),
                row.content_hash,
            ],
        )?;
        Ok(())
    }

    fn upsert_query(&self, key: &str, row: &QueryRow) -> Result<(), FrontierError> {
        let conn = self.conn.lock().expect("frontier db poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO frontier_queries (
                key, product_id, normalized_query, provider, fields, last_run_ts, result_url_count
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key,
                row.product_id,
                row.normalized_query,
                row.provider,
                serde_json::to_string(&row.fields)?,
                row.last_run_ts.to_rfc3339(),
                i64::from(row.result_url_count),
            ],
        )?;
        Ok(())
    }

    fn upsert_path(&self, key: &str, stats: PathStats) -> Result<(), FrontierError> {
        let conn = self.conn.lock().expect("frontier db poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO frontier_paths (key, notfound, parsed_ok)
             VALUES (?1, ?2, ?3)",
            params![key, stats.notfound as i64, stats.parsed_ok as i64],
        )?;
        Ok(())
    }

    /// See [`FrontierCore::should_skip_query_at`].
    #[must_use]
    pub fn should_skip_query(&self, product_id: &str, query: &str, force: bool) -> bool {
        self.core
            .should_skip_query_at(product_id, query, force, Utc::now(), &self.tuning)
    }

    /// Record a query, write-through.
    ///
    /// # Errors
    ///
    /// [`FrontierError::Sqlite`] on database failures.
    pub fn record_query(
        &mut self,
        product_id: &str,
        query: &str,
        provider: &str,
        fields: &[String],
        result_url_count: u32,
    ) -> Result<(), FrontierError> {
        self.core
            .record_query_at(product_id, query, provider, fields, result_url_count, Utc::now());
        let normalized = crate::store::normalize_query(query);
        let key = format!("{product_id}|{normalized}");
        let row = self.core.queries.get(&key).expect("query row just inserted").clone();
        self.upsert_query(&key, &row)
    }

    /// See [`FrontierCore::should_skip_url_at`].
    #[must_use]
    pub fn should_skip_url(&self, url: &str) -> SkipDecision {
        self.core.should_skip_url_at(url, Utc::now(), &self.tuning)
    }

    /// Record a fetch, write-through.
    ///
    /// # Errors
    ///
    /// [`FrontierError::InvalidUrl`] or [`FrontierError::Sqlite`].
    pub fn record_fetch(
        &mut self,
        product_id: &str,
        url: &str,
        fetch: &RecordedFetch,
    ) -> Result<UrlRow, FrontierError> {
        let row = self
            .core
            .record_fetch_at(product_id, url, fetch, Utc::now(), &self.tuning)?;
        let key = format!("{product_id}|{}", row.canonical_url);
        self.upsert_url(&key, &row)?;
        let pkey = format!("{}{}", row.domain, row.path_signature);
        if let Some(stats) = self.core.path_stats.get(&pkey).copied() {
            self.upsert_path(&pkey, stats)?;
        }
        Ok(row)
    }

    /// See [`FrontierCore::rank_penalty_for_url_at`].
    #[must_use]
    pub fn rank_penalty_for_url(&self, url: &str) -> f64 {
        self.core.rank_penalty_for_url_at(url, Utc::now())
    }

    /// See [`FrontierCore::snapshot_for_product`].
    #[must_use]
    pub fn snapshot_for_product(&self, product_id: &str) -> FrontierSnapshot {
        self.core.snapshot_for_product(product_id)
    }

    /// Read access to the underlying state (tests, parity checks).
    #[must_use]
    pub fn core(&self) -> &FrontierCore {
        &self.core
    }
}
