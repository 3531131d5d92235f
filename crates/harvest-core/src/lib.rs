// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the spec harvester.
//!
//! If you only take one dependency, take this one.

/// Per-source candidates, evidence packs, and per-field provenance.
pub mod candidate;
/// Runtime configuration recognized by the engine.
pub mod config;
/// The five-key event envelope and closed event-name helpers.
pub mod events;
/// Need-set entries and identity-lock state reporting.
pub mod needset;
/// Compiled field rules, contracts, and known-value tables.
pub mod rules;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current artifact-format version embedded in compiled outputs.
pub const ARTIFACT_VERSION: &str = "harvest/v1";

/// Source tier constants.
///
/// Tiers are small integers, lower is more authoritative: tier 1 is the
/// manufacturer itself, tier 2 is a credible independent source, tier 3 is
/// the approval ceiling for consensus counting.
pub mod tier {
    /// Manufacturer-operated domain.
    pub const MANUFACTURER: u8 = 1;
    /// Credible independent source (labs, major retailers).
    pub const CREDIBLE: u8 = 2;
    /// Highest tier still counted as approved.
    pub const APPROVED_MAX: u8 = 3;
}

// ---------------------------------------------------------------------------
// Product identity
// ---------------------------------------------------------------------------

/// The brand/model/variant and hard identifiers fixed at the start of a
/// product run. Consensus never overwrites these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct IdentityLock {
    /// Brand name. Required.
    pub brand: String,
    /// Model name. Required.
    pub model: String,
    /// Variant / edition, if the product line distinguishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Stock keeping unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    /// Manufacturer part number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpn: Option<String>,
    /// Global trade item number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtin: Option<String>,
}

impl IdentityLock {
    /// Whether the lock carries at least one hard identifier (SKU/MPN/GTIN).
    #[must_use]
    pub fn has_hard_id(&self) -> bool {
        self.sku.is_some() || self.mpn.is_some() || self.gtin.is_some()
    }

    /// The set of field keys whose values come from the lock rather than
    /// from consensus.
    #[must_use]
    pub fn locked_field_keys() -> &'static [&'static str] {
        &["id", "brand", "model", "base_model", "category", "sku"]
    }

    /// Lock value for a locked field key, if the lock defines one.
    #[must_use]
    pub fn value_for(&self, field_key: &str) -> Option<String> {
        match field_key {
            "brand" => Some(self.brand.clone()),
            "model" | "base_model" => Some(self.model.clone()),
            "sku" => self.sku.clone(),
            _ => None,
        }
    }
}

/// Immutable identity of the product a run works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProductIdentity {
    /// Category slug (e.g. `"gaming-mice"`).
    pub category: String,
    /// Opaque product key, derived once from the identity lock.
    pub product_id: String,
    /// The locked identity attributes.
    pub identity_lock: IdentityLock,
}

impl ProductIdentity {
    /// Build an identity for `category`, deriving `product_id` from the lock.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::IdentityIncomplete`] when `brand` or `model`
    /// is empty.
    pub fn new(category: impl Into<String>, lock: IdentityLock) -> Result<Self, ContractError> {
        if lock.brand.trim().is_empty() || lock.model.trim().is_empty() {
            return Err(ContractError::IdentityIncomplete);
        }
        let product_id = derive_product_id(&lock);
        Ok(Self {
            category: category.into(),
            product_id,
            identity_lock: lock,
        })
    }
}

/// Derive the deterministic product slug from an identity lock.
///
/// The slug is `brand-model[-variant]`, lowercased, with runs of
/// non-alphanumeric characters collapsed to single dashes. The result is
/// treated as an opaque key thereafter.
///
/// # Examples
///
/// ```
/// use harvest_core::{IdentityLock, derive_product_id};
///
/// let lock = IdentityLock {
///     brand: "Razer".into(),
///     model: "Viper V3 Pro".into(),
///     ..IdentityLock::default()
/// };
/// assert_eq!(derive_product_id(&lock), "razer-viper-v3-pro");
/// ```
#[must_use]
pub fn derive_product_id(lock: &IdentityLock) -> String {
    let mut raw = format!("{} {}", lock.brand, lock.model);
    if let Some(variant) = &lock.variant {
        raw.push(' ');
        raw.push_str(variant);
    }
    slugify(&raw)
}

/// Lowercase `raw` and collapse every run of non-alphanumeric characters
/// into a single `-`, trimming leading/trailing dashes.
#[must_use]
pub fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Hashing helpers
// ---------------------------------------------------------------------------

/// Errors from contract-level operations (serialization, identity).
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// JSON serialization or deserialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// An identity lock was missing its required `brand` or `model`.
    #[error("identity lock requires non-empty brand and model")]
    IdentityIncomplete,
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// First twelve hex characters of the SHA-256 digest of `input`.
///
/// This is the truncation used for document and snippet IDs; it is stable
/// across restarts and machines because it depends only on the input bytes.
#[must_use]
pub fn hex12(input: &str) -> String {
    sha256_hex(input.as_bytes())[..12].to_string()
}

/// Produce a deterministic JSON string for hashing and artifact output.
///
/// Not a full JCS implementation, but stable for our types: keys are sorted
/// (serde_json objects round-trip through `Value` as sorted maps when the
/// `preserve_order` feature is off) and numbers serialize consistently.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Pretty canonical form used for on-disk artifacts: sorted keys, two-space
/// indent, LF line endings, exactly one trailing newline.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
pub fn canonical_json_pretty<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let v = serde_json::to_value(value)?;
    let mut s = serde_json::to_string_pretty(&v)?;
    s.push('\n');
    Ok(s)
}
