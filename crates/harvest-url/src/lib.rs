// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-url
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use url::Url;

/// Query parameter names stripped as tracking noise (exact matches).
const TRACKING_EXACT: &[&str] = &[
    "gclid", "fbclid", "ref", "igshid", "msclkid", "dclid", "yclid", "twclid", "ttclid",
    "srsltid", "mkt_tok", "s_kwcid", "_ga", "_gl", "spm", "cmpid",
];

/// Query parameter prefixes stripped as tracking noise.
const TRACKING_PREFIXES: &[&str] = &["utm_", "mc_", "pk_", "piwik_", "matomo_"];

/// Second-level suffixes treated as part of the public suffix when
/// computing root domains.
const MULTI_PART_TLDS: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "com.au", "net.au", "org.au", "co.jp", "co.kr",
    "com.br", "com.cn", "com.tw", "co.nz", "co.in", "com.mx", "com.sg",
];

/// The result of canonicalizing a URL.
///
/// All fields are empty strings when the input could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CanonicalUrl {
    /// The canonical form used for dedupe.
    pub canonical_url: String,
    /// Normalized host (`www.` stripped, lowercased).
    pub domain: String,
    /// Path with numeric/hex segments collapsed (`/mice/:id/specs`).
    pub path_signature: String,
    /// Names of the query parameters that were stripped.
    pub tracking_stripped: Vec<String>,
}

impl CanonicalUrl {
    /// Whether canonicalization succeeded.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.canonical_url.is_empty()
    }
}

/// Whether a query parameter name is in the tracking set.
fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    TRACKING_EXACT.contains(&lower.as_str())
        || TRACKING_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Normalize a host: lowercase, strip a single leading `www.`.
#[must_use]
pub fn normalize_host(host: &str) -> String {
    let lower = host.to_ascii_lowercase();
    lower.strip_prefix("www.").unwrap_or(&lower).to_string()
}

/// Registrable root domain of a host (`shop.example.co.uk` → `example.co.uk`).
///
/// Uses a small built-in multi-part TLD list rather than the full public
/// suffix list; hosts with fewer than two labels come back unchanged.
#[must_use]
pub fn root_domain(host: &str) -> String {
    let host = normalize_host(host);
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host;
    }
    let last_two = labels[labels.len() - 2..].join(".");
    if MULTI_PART_TLDS.contains(&last_two.as_str()) && labels.len() >= 3 {
        labels[labels.len() - 3..].join(".")
    } else {
        last_two
    }
}

/// Compute the path signature: numeric segments become `:id`, hex-only
/// segments of length ≥ 8 become `:hex`.
#[must_use]
pub fn path_signature(path: &str) -> String {
    let mut out = String::new();
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        out.push('/');
        if segment.chars().all(|c| c.is_ascii_digit()) {
            out.push_str(":id");
        } else if segment.len() >= 8 && segment.chars().all(|c| c.is_ascii_hexdigit()) {
            out.push_str(":hex");
        } else {
            out.push_str(segment);
        }
    }
    if out.is_empty() { "/".to_string() } else { out }
}

/// Canonicalize a URL string.
///
/// Rules: lowercase scheme and host, drop default ports, strip `www.`,
/// drop the fragment, strip tracking query parameters, strip a leading
/// `/amp/` path segment, and strip a single trailing slash unless the path
/// is `/`. Unparseable input yields a [`CanonicalUrl`] of empty strings.
///
/// Canonicalization is idempotent: applying it to its own output is a
/// fixed point.
///
/// # Examples
///
/// ```
/// use harvest_url::canonicalize;
///
/// let c = canonicalize("HTTPS://WWW.Example.com:443/amp/Mice/123/?utm_source=x&b=1#top");
/// assert_eq!(c.canonical_url, "https://example.com/Mice/123?b=1");
/// assert_eq!(c.domain, "example.com");
/// assert_eq!(c.path_signature, "/Mice/:id");
/// assert_eq!(c.tracking_stripped, vec!["utm_source".to_string()]);
/// ```
#[must_use]
pub fn canonicalize(raw: &str) -> CanonicalUrl {
    let Ok(parsed) = Url::parse(raw.trim()) else {
        return CanonicalUrl::default();
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return CanonicalUrl::default();
    }
    let Some(host) = parsed.host_str() else {
        return CanonicalUrl::default();
    };

    let domain = normalize_host(host);

    // Path: strip one leading /amp/ segment, then a single trailing slash.
    let mut path = parsed.path().to_string();
    if let Some(rest) = path.strip_prefix("/amp/") {
        path = format!("/{rest}");
    } else if path == "/amp" {
        path = "/".to_string();
    }
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }

    // Query: keep non-tracking params in their original order.
    let mut kept: Vec<(String, String)> = Vec::new();
    let mut stripped: Vec<String> = Vec::new();
    for (k, v) in parsed.query_pairs() {
        if is_tracking_param(&k) {
            stripped.push(k.into_owned());
        } else {
            kept.push((k.into_owned(), v.into_owned()));
        }
    }

    let mut canonical = format!("{}://{domain}", parsed.scheme());
    // Url::parse already drops default ports; keep explicit non-default ones.
    if let Some(port) = parsed.port() {
        canonical.push_str(&format!(":{port}"));
    }
    canonical.push_str(&path);
    if !kept.is_empty() {
        canonical.push('?');
        let encoded: Vec<String> = kept
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect();
        canonical.push_str(&encoded.join("&"));
    }

    CanonicalUrl {
        canonical_url: canonical,
        domain,
        path_signature: path_signature(&path),
        tracking_stripped: stripped,
    }
}
