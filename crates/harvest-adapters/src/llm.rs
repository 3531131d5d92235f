// SPDX-License-Identifier: MIT OR Apache-2.0
//! The LLM router.
//!
//! Providers sit behind a per-provider circuit breaker
//! (closed → open → half-open): after `failure_threshold` consecutive
//! failures the provider short-circuits for `open_ms`, then a single
//! probe call decides whether it closes again. A short-circuited call is
//! a typed error the pipeline treats as "LLM-degraded", never a round
//! failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A completed LLM call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// The model output.
    pub response: String,
    /// Prompt tokens consumed.
    pub prompt_tokens: u64,
    /// Completion tokens produced.
    pub completion_tokens: u64,
    /// Total tokens billed.
    pub total_tokens: u64,
    /// Model identifier.
    pub model: String,
    /// Provider name.
    pub provider: String,
}

/// Errors from LLM routing.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The provider's circuit is open; the call was not attempted.
    #[error("provider '{provider}' circuit open")]
    CircuitOpen {
        /// The short-circuited provider.
        provider: String,
    },

    /// No provider is registered under this name.
    #[error("unknown provider '{provider}'")]
    UnknownProvider {
        /// The requested provider.
        provider: String,
    },

    /// The provider call itself failed (or timed out).
    #[error("provider '{provider}' call failed: {reason}")]
    CallFailed {
        /// The failing provider.
        provider: String,
        /// Failure detail.
        reason: String,
    },
}

/// A single model provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one call. `reason` is an audit label ("extract_fields",
    /// "disambiguate_identity", ...).
    async fn call(&self, reason: &str, prompt: &str) -> Result<LlmResponse, String>;
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls short-circuit until the open window elapses.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

/// Router configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit stays open.
    pub open_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, open_ms: 30_000 }
    }
}

struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

struct Provider {
    client: std::sync::Arc<dyn LlmClient>,
    breaker: Breaker,
}

/// Routes calls to named providers through their circuit breakers.
pub struct LlmRouter {
    providers: Mutex<BTreeMap<String, Provider>>,
    config: RouterConfig,
}

impl LlmRouter {
    /// Empty router.
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        Self { providers: Mutex::new(BTreeMap::new()), config }
    }

    /// Register a provider.
    pub fn register(&self, name: &str, client: Box<dyn LlmClient>) {
        self.providers.lock().expect("router poisoned").insert(
            name.to_string(),
            Provider { client: client.into(), breaker: Breaker::new() },
        );
    }

    /// The provider's current circuit state.
    #[must_use]
    pub fn circuit_state(&self, provider: &str) -> Option<CircuitState> {
        self.providers
            .lock()
            .expect("router poisoned")
            .get(provider)
            .map(|p| p.breaker.state)
    }

    /// Call `provider`, honoring its circuit breaker.
    ///
    /// # Errors
    ///
    /// [`LlmError::CircuitOpen`] without attempting the call while the
    /// breaker is open; [`LlmError::CallFailed`] on provider failure
    /// (which also feeds the breaker).
    pub async fn call(
        &self,
        provider: &str,
        reason: &str,
        prompt: &str,
    ) -> Result<LlmResponse, LlmError> {
        // Phase 1: admission under the lock.
        {
            let mut providers = self.providers.lock().expect("router poisoned");
            let entry = providers.get_mut(provider).ok_or_else(|| LlmError::UnknownProvider {
                provider: provider.to_string(),
            })?;
            match entry.breaker.state {
                CircuitState::Closed | CircuitState::HalfOpen => {}
                CircuitState::Open => {
                    let elapsed = entry
                        .breaker
                        .opened_at
                        .map(|t| t.elapsed())
                        .unwrap_or_default();
                    if elapsed >= Duration::from_millis(self.config.open_ms) {
                        debug!(provider, "circuit half-open; probing");
                        entry.breaker.state = CircuitState::HalfOpen;
                    } else {
                        return Err(LlmError::CircuitOpen { provider: provider.to_string() });
                    }
                }
            }
        }

        // Phase 2: the call itself, outside the lock.
        let client = {
            let providers = self.providers.lock().expect("router poisoned");
            let entry = providers.get(provider).ok_or_else(|| LlmError::UnknownProvider {
                provider: provider.to_string(),
            })?;
            std::sync::Arc::clone(&entry.client)
        };
        let result = client.call(reason, prompt).await;

        // Phase 3: feed the breaker.
        let mut providers = self.providers.lock().expect("router poisoned");
        let entry = providers.get_mut(provider).ok_or_else(|| LlmError::UnknownProvider {
            provider: provider.to_string(),
        })?;
        match result {
            Ok(response) => {
                entry.breaker.consecutive_failures = 0;
                entry.breaker.state = CircuitState::Closed;
                entry.breaker.opened_at = None;
                Ok(response)
            }
            Err(reason_text) => {
                entry.breaker.consecutive_failures += 1;
                let should_open = entry.breaker.state == CircuitState::HalfOpen
                    || entry.breaker.consecutive_failures >= self.config.failure_threshold;
                if should_open {
                    warn!(provider, failures = entry.breaker.consecutive_failures, "circuit opened");
                    entry.breaker.state = CircuitState::Open;
                    entry.breaker.opened_at = Some(Instant::now());
                }
                Err(LlmError::CallFailed {
                    provider: provider.to_string(),
                    reason: reason_text,
                })
            }
        }
    }
}

/// Scripted LLM client for tests.
pub struct MockLlmClient {
    /// Responses served in order; `Err` simulates a failure.
    pub script: Mutex<Vec<Result<String, String>>>,
    /// Model name reported.
    pub model: String,
}

impl MockLlmClient {
    /// Client that always succeeds with `response`.
    #[must_use]
    pub fn always(response: &str) -> Self {
        Self {
            script: Mutex::new(vec![]),
            model: format!("mock:{response}"),
        }
    }

    /// Client that serves the given script then fails.
    #[must_use]
    pub fn scripted(script: Vec<Result<String, String>>) -> Self {
        Self { script: Mutex::new(script), model: "mock".into() }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn call(&self, _reason: &str, prompt: &str) -> Result<LlmResponse, String> {
        let mut script = self.script.lock().expect("mock llm poisoned");
        let outcome = if script.is_empty() {
            Ok(format!("echo:{prompt}"))
        } else {
            script.remove(0)
        };
        outcome.map(|response| LlmResponse {
            prompt_tokens: prompt.len() as u64 / 4,
            completion_tokens: response.len() as u64 / 4,
            total_tokens: (prompt.len() + response.len()) as u64 / 4,
            response,
            model: self.model.clone(),
            provider: "mock".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(threshold: u32, open_ms: u64) -> LlmRouter {
        LlmRouter::new(RouterConfig { failure_threshold: threshold, open_ms })
    }

    #[tokio::test]
    async fn successful_calls_stay_closed() {
        let r = router(3, 1000);
        r.register("mock", Box::new(MockLlmClient::always("ok")));
        let out = r.call("mock", "extract_fields", "weight?").await.unwrap();
        assert_eq!(out.response, "echo:weight?");
        assert_eq!(r.circuit_state("mock"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn unknown_provider_is_typed() {
        let r = router(3, 1000);
        assert!(matches!(
            r.call("ghost", "x", "y").await,
            Err(LlmError::UnknownProvider { .. })
        ));
    }

    #[tokio::test]
    async fn threshold_failures_open_the_circuit() {
        let r = router(2, 60_000);
        r.register(
            "flaky",
            Box::new(MockLlmClient::scripted(vec![
                Err("timeout".into()),
                Err("timeout".into()),
            ])),
        );
        assert!(matches!(r.call("flaky", "x", "p").await, Err(LlmError::CallFailed { .. })));
        assert_eq!(r.circuit_state("flaky"), Some(CircuitState::Closed));
        assert!(matches!(r.call("flaky", "x", "p").await, Err(LlmError::CallFailed { .. })));
        assert_eq!(r.circuit_state("flaky"), Some(CircuitState::Open));

        // Short-circuited without calling through.
        assert!(matches!(r.call("flaky", "x", "p").await, Err(LlmError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn half_open_probe_recovers() {
        let r = router(1, 0); // opens on first failure, reopens immediately
        r.register(
            "recovering",
            Box::new(MockLlmClient::scripted(vec![Err("boom".into()), Ok("fine".into())])),
        );
        assert!(r.call("recovering", "x", "p").await.is_err());
        assert_eq!(r.circuit_state("recovering"), Some(CircuitState::Open));

        // open_ms = 0: the next call probes half-open and succeeds.
        let out = r.call("recovering", "x", "p").await.unwrap();
        assert_eq!(out.response, "fine");
        assert_eq!(r.circuit_state("recovering"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let r = router(1, 0);
        r.register(
            "hopeless",
            Box::new(MockLlmClient::scripted(vec![Err("a".into()), Err("b".into())])),
        );
        let _ = r.call("hopeless", "x", "p").await;
        let _ = r.call("hopeless", "x", "p").await; // half-open probe fails
        assert_eq!(r.circuit_state("hopeless"), Some(CircuitState::Open));
    }
}
