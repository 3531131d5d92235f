// SPDX-License-Identifier: MIT OR Apache-2.0
//! The discovery search provider interface.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::AdapterError;

/// A search provider: query in, candidate URLs out.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Run one query, returning up to `limit` result URLs in rank order.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, AdapterError>;
}

/// Provider used when no search backend is configured: every query
/// returns nothing, so discovery rides on seed URLs alone.
#[derive(Debug, Default)]
pub struct NullSearchProvider;

#[async_trait]
impl SearchProvider for NullSearchProvider {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<String>, AdapterError> {
        Ok(vec![])
    }
}

/// Scripted provider for tests: substring → URLs.
#[derive(Debug, Default)]
pub struct MockSearchProvider {
    results: Mutex<BTreeMap<String, Vec<String>>>,
}

impl MockSearchProvider {
    /// Empty provider; every query returns nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// URLs returned for queries containing `needle`.
    pub fn stub(&self, needle: &str, urls: &[&str]) {
        self.results
            .lock()
            .expect("mock search poisoned")
            .insert(needle.to_string(), urls.iter().map(|s| s.to_string()).collect());
    }
}

#[async_trait]
impl SearchProvider for MockSearchProvider {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, AdapterError> {
        let results = self.results.lock().expect("mock search poisoned");
        let mut out = Vec::new();
        let query = query.to_lowercase();
        for (needle, urls) in results.iter() {
            if query.contains(&needle.to_lowercase()) {
                out.extend(urls.iter().cloned());
            }
        }
        out.truncate(limit);
        Ok(out)
    }
}
