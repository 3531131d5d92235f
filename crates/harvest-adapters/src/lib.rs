// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-adapters
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// HTTP fetching.
pub mod fetch;
/// LLM routing with per-provider circuit breakers.
pub mod llm;
/// HTML parsing into chunks and candidates.
pub mod parse;
/// PDF text and table extraction.
pub mod pdf;
/// Discovery search providers.
pub mod search;
/// JSON-file workbooks for the compiler.
pub mod workbook;

pub use fetch::{FetchResult, Fetcher, MockFetcher};
#[cfg(feature = "net")]
pub use fetch::ReqwestFetcher;
pub use llm::{CircuitState, LlmClient, LlmError, LlmResponse, LlmRouter, MockLlmClient, RouterConfig};
pub use parse::{HtmlParser, ParsedHtml, SimpleHtmlParser};
pub use pdf::{PdfExtractor, PlainTextPdf};
pub use search::{MockSearchProvider, NullSearchProvider, SearchProvider};
pub use workbook::load_json_workbook;

/// Errors shared by adapter implementations.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Transport-level fetch failure.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// A file-backed adapter could not read its input.
    #[error("adapter I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A file-backed adapter could not parse its input.
    #[error("adapter parse failed: {0}")]
    Json(#[from] serde_json::Error),
}
