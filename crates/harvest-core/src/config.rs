// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runtime configuration: every knob the engine recognizes, with TOML
//! loading, overlay merging, and advisory warnings.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Errors / warnings
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A cooldown was configured shorter than is ever useful.
    ShortCooldown {
        /// Configuration key.
        key: &'static str,
        /// Configured seconds.
        secs: u64,
    },
    /// A lane concurrency was configured unusually high.
    LargeConcurrency {
        /// Lane name.
        lane: &'static str,
        /// Configured slot count.
        slots: usize,
    },
    /// Discovery is enabled but allows zero queries.
    DiscoveryStarved,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ShortCooldown { key, secs } => {
                write!(f, "cooldown '{key}' is very short ({secs}s)")
            }
            ConfigWarning::LargeConcurrency { lane, slots } => {
                write!(f, "lane '{lane}' has a large concurrency ({slots})")
            }
            ConfigWarning::DiscoveryStarved => {
                write!(f, "discovery enabled with discoveryMaxQueries = 0")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Per-lane concurrency caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LaneConcurrency {
    /// Search lane slots.
    pub search: usize,
    /// Fetch lane slots.
    pub fetch: usize,
    /// Parse lane slots.
    pub parse: usize,
    /// LLM lane slots.
    pub llm: usize,
}

impl Default for LaneConcurrency {
    fn default() -> Self {
        Self {
            search: 2,
            fetch: 4,
            parse: 4,
            llm: 2,
        }
    }
}

/// The full runtime configuration.
///
/// Wire keys are camelCase to match the on-disk config format
/// (`frontierCooldown404Seconds` and friends).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct HarvestConfig {
    /// Root of compiled helper-file artifacts.
    pub helper_files_root: PathBuf,
    /// Root of product job seeds.
    pub local_input_root: PathBuf,
    /// Root of run outputs.
    pub local_output_root: PathBuf,
    /// Root of workbook imports.
    pub imports_root: PathBuf,

    /// Suppress duplicate queries recorded within this window.
    pub frontier_query_cooldown_seconds: u64,
    /// Cooldown after a first-strike 404.
    pub frontier_cooldown404_seconds: u64,
    /// Cooldown after repeated 404s on a dead path signature.
    pub frontier_cooldown404_repeat_seconds: u64,
    /// Base for 403 exponential backoff.
    pub frontier_cooldown403_base_seconds: u64,
    /// Base for 429 exponential backoff.
    pub frontier_cooldown429_base_seconds: u64,
    /// Long quarantine after a 410.
    pub frontier_cooldown410_seconds: u64,
    /// 404 count per path signature before the signature is declared dead.
    pub frontier_path_penalty_notfound_threshold: u32,

    /// Search provider identifier.
    pub search_provider: String,
    /// Whether discovery runs at all.
    pub discovery_enabled: bool,
    /// Max queries per discovery round.
    pub discovery_max_queries: usize,
    /// Results requested per query.
    pub discovery_results_per_query: usize,
    /// Cap on newly discovered URLs per round.
    pub discovery_max_discovered: usize,
    /// Concurrent discovery queries.
    pub discovery_query_concurrency: usize,

    /// Lane concurrency caps.
    pub lanes: LaneConcurrency,

    /// Allow the manufacturer+tier-2 below-pass-target acceptance path.
    pub allow_below_pass_target_fill: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            helper_files_root: PathBuf::from("helper_files"),
            local_input_root: PathBuf::from("specs/inputs"),
            local_output_root: PathBuf::from("specs/outputs"),
            imports_root: PathBuf::from("imports"),
            frontier_query_cooldown_seconds: 3600,
            frontier_cooldown404_seconds: 6 * 3600,
            frontier_cooldown404_repeat_seconds: 7 * 24 * 3600,
            frontier_cooldown403_base_seconds: 1800,
            frontier_cooldown429_base_seconds: 900,
            frontier_cooldown410_seconds: 30 * 24 * 3600,
            frontier_path_penalty_notfound_threshold: 3,
            search_provider: "default".into(),
            discovery_enabled: true,
            discovery_max_queries: 8,
            discovery_results_per_query: 10,
            discovery_max_discovered: 40,
            discovery_query_concurrency: 2,
            lanes: LaneConcurrency::default(),
            allow_below_pass_target_fill: false,
        }
    }
}

impl HarvestConfig {
    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileNotFound`] when `path` does not exist,
    /// [`ConfigError::ParseError`] on malformed TOML,
    /// [`ConfigError::ValidationError`] on semantic problems.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&raw).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] listing every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();
        if self.frontier_path_penalty_notfound_threshold == 0 {
            reasons.push("frontierPathPenaltyNotfoundThreshold must be >= 1".to_string());
        }
        if self.discovery_results_per_query == 0 {
            reasons.push("discoveryResultsPerQuery must be >= 1".to_string());
        }
        for (lane, slots) in [
            ("search", self.lanes.search),
            ("fetch", self.lanes.fetch),
            ("parse", self.lanes.parse),
            ("llm", self.lanes.llm),
        ] {
            if slots == 0 {
                reasons.push(format!("lane '{lane}' concurrency must be >= 1"));
            }
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }

    /// Advisory warnings for suspicious-but-legal settings.
    #[must_use]
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut out = Vec::new();
        for (key, secs) in [
            ("frontierCooldown404Seconds", self.frontier_cooldown404_seconds),
            ("frontierCooldown403BaseSeconds", self.frontier_cooldown403_base_seconds),
            ("frontierCooldown429BaseSeconds", self.frontier_cooldown429_base_seconds),
        ] {
            if secs < 60 {
                out.push(ConfigWarning::ShortCooldown { key, secs });
            }
        }
        for (lane, slots) in [
            ("search", self.lanes.search),
            ("fetch", self.lanes.fetch),
            ("parse", self.lanes.parse),
            ("llm", self.lanes.llm),
        ] {
            if slots > 32 {
                out.push(ConfigWarning::LargeConcurrency { lane, slots });
            }
        }
        if self.discovery_enabled && self.discovery_max_queries == 0 {
            out.push(ConfigWarning::DiscoveryStarved);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = HarvestConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.lanes.search, 2);
        assert_eq!(cfg.lanes.fetch, 4);
        assert_eq!(cfg.lanes.parse, 4);
        assert_eq!(cfg.lanes.llm, 2);
        assert_eq!(cfg.frontier_query_cooldown_seconds, 3600);
    }

    #[test]
    fn camel_case_wire_keys() {
        let json = serde_json::to_value(HarvestConfig::default()).unwrap();
        assert!(json.get("frontierCooldown404Seconds").is_some());
        assert!(json.get("frontierCooldown404RepeatSeconds").is_some());
        assert!(json.get("allowBelowPassTargetFill").is_some());
        assert!(json.get("helperFilesRoot").is_some());
        assert!(json.get("discoveryMaxQueries").is_some());
    }

    #[test]
    fn toml_overlay_parses_partial() {
        let cfg: HarvestConfig = toml::from_str(
            r#"
            frontierCooldown403BaseSeconds = 60
            allowBelowPassTargetFill = true

            [lanes]
            search = 1
            fetch = 2
            parse = 2
            llm = 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.frontier_cooldown403_base_seconds, 60);
        assert!(cfg.allow_below_pass_target_fill);
        assert_eq!(cfg.lanes.fetch, 2);
        // untouched keys keep their defaults
        assert_eq!(cfg.frontier_query_cooldown_seconds, 3600);
    }

    #[test]
    fn zero_lane_concurrency_rejected() {
        let mut cfg = HarvestConfig::default();
        cfg.lanes.parse = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn starved_discovery_warns() {
        let mut cfg = HarvestConfig::default();
        cfg.discovery_max_queries = 0;
        assert!(cfg.warnings().contains(&ConfigWarning::DiscoveryStarved));
    }
}
