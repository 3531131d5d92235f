// SPDX-License-Identifier: MIT OR Apache-2.0
//! The fetcher interface and its implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::AdapterError;
use harvest_core::sha256_hex;

/// What a fetch produced. `final_url` is what the pipeline records when
/// the fetcher followed redirects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    /// HTTP status (0 for transport failure).
    pub status: u16,
    /// URL after redirects.
    pub final_url: String,
    /// Response content type.
    pub content_type: Option<String>,
    /// Body size in bytes.
    pub bytes: u64,
    /// Body text when HTML.
    pub html: Option<String>,
    /// SHA-256 of the body.
    pub content_hash: String,
    /// Wall-clock fetch time in milliseconds.
    pub fetch_ms: u64,
    /// Which fetcher produced this (`"mock"`, `"reqwest"`).
    pub fetcher_kind: String,
}

/// The fetch interface the engine sees.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch one URL. Non-2xx statuses are results, not errors; `Err` is
    /// reserved for transport failures the caller maps to `fetch_error`.
    async fn fetch(&self, url: &str) -> Result<FetchResult, AdapterError>;
}

/// Scripted fetcher for tests: URL → (status, body).
#[derive(Debug, Default)]
pub struct MockFetcher {
    responses: Mutex<BTreeMap<String, (u16, String)>>,
    /// URLs fetched, in order.
    fetched: Mutex<Vec<String>>,
}

impl MockFetcher {
    /// Empty mock; unknown URLs 404.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a response.
    pub fn stub(&self, url: &str, status: u16, body: &str) {
        self.responses
            .lock()
            .expect("mock fetcher poisoned")
            .insert(url.to_string(), (status, body.to_string()));
    }

    /// URLs fetched so far, in order.
    #[must_use]
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().expect("mock fetcher poisoned").clone()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResult, AdapterError> {
        self.fetched
            .lock()
            .expect("mock fetcher poisoned")
            .push(url.to_string());
        let (status, body) = self
            .responses
            .lock()
            .expect("mock fetcher poisoned")
            .get(url)
            .cloned()
            .unwrap_or((404, String::new()));
        Ok(FetchResult {
            status,
            final_url: url.to_string(),
            content_type: Some("text/html".into()),
            bytes: body.len() as u64,
            content_hash: sha256_hex(body.as_bytes()),
            html: Some(body),
            fetch_ms: 1,
            fetcher_kind: "mock".into(),
        })
    }
}

/// reqwest-backed fetcher.
#[cfg(feature = "net")]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

#[cfg(feature = "net")]
impl ReqwestFetcher {
    /// Build with a per-request timeout.
    ///
    /// # Errors
    ///
    /// [`AdapterError::Fetch`] when the client cannot be constructed.
    pub fn new(timeout: std::time::Duration) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Fetch(e.to_string()))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "net")]
#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResult, AdapterError> {
        let started = std::time::Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AdapterError::Fetch(e.to_string()))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| AdapterError::Fetch(e.to_string()))?;
        let html = std::str::from_utf8(&body).ok().map(str::to_string);
        Ok(FetchResult {
            status,
            final_url,
            content_type,
            bytes: body.len() as u64,
            content_hash: sha256_hex(&body),
            html,
            fetch_ms: started.elapsed().as_millis() as u64,
            fetcher_kind: "reqwest".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_serves_stubbed_response() {
        let fetcher = MockFetcher::new();
        fetcher.stub("https://a.com/p", 200, "<html>body</html>");
        let result = fetcher.fetch("https://a.com/p").await.unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.content_hash, sha256_hex(b"<html>body</html>"));
        assert_eq!(fetcher.fetched(), vec!["https://a.com/p".to_string()]);
    }

    #[tokio::test]
    async fn mock_unknown_url_is_404() {
        let fetcher = MockFetcher::new();
        let result = fetcher.fetch("https://nowhere.com/x").await.unwrap();
        assert_eq!(result.status, 404);
    }

    #[tokio::test]
    async fn identical_bodies_share_a_hash() {
        let fetcher = MockFetcher::new();
        fetcher.stub("https://a.com/1", 200, "same");
        fetcher.stub("https://a.com/2", 200, "same");
        let one = fetcher.fetch("https://a.com/1").await.unwrap();
        let two = fetcher.fetch("https://a.com/2").await.unwrap();
        assert_eq!(one.content_hash, two.content_hash);
    }
}
