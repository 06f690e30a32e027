// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synthesis orchestrator.
//!
//! The [`SynthesisOrchestrator`] is the façade that ties together:
//! - the [`TieredCache`] (memory, SQLite, Redis)
//! - the [`CircuitBreaker`] guarding the upstream API
//! - per-class retry with backoff
//! - the [`SynthesisClient`] doing the actual HTTP call
//!
//! # Request flow
//!
//! ```text
//! synthesize(text)
//!   → validate → key → cache lookup ──hit──► audio (was_cached)
//!                         │ miss
//!                         ▼
//!                  breaker.allow() ──refused──► CircuitOpen
//!                         │
//!                         ▼
//!                  retry(client.synthesize) ──fail──► record failure → error
//!                         │ ok
//!                         ▼
//!                  record success → cache.put → audio
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tts_cache::{HttpSynthesisClient, SynthesisOrchestrator, TtsCacheConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = TtsCacheConfig::from_env().expect("config");
//! let client = HttpSynthesisClient::new(config.client_config()).expect("client");
//! let orchestrator = SynthesisOrchestrator::from_config(&config, Arc::new(client))
//!     .await
//!     .expect("orchestrator");
//!
//! match orchestrator.synthesize_best_effort("Hello Bitcoin").await {
//!     Some(result) => println!("{} bytes, cached={}", result.audio.len(), result.was_cached),
//!     None => println!("text only"),
//! }
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{SynthesisResult, SynthesizeOptions};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cache_key::CacheKeyGenerator;
use crate::resilience::backoff::RetryPolicies;
use crate::resilience::cancel::CancelHandle;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::synthesis::SynthesisClient;
use crate::tiered::TieredCache;

/// Name of the breaker guarding the synthesis API, used in logs and metrics.
pub const SYNTHESIS_CIRCUIT: &str = "synthesis_api";

/// Cache-first, failure-tolerant access to a speech-synthesis API.
///
/// `Send + Sync`; share one instance (behind an `Arc`) across all request
/// handlers so they share the cache and the breaker.
pub struct SynthesisOrchestrator {
    pub(super) cache: Arc<TieredCache>,
    pub(super) breaker: Arc<CircuitBreaker>,
    pub(super) client: Arc<dyn SynthesisClient>,
    pub(super) keys: CacheKeyGenerator,
    pub(super) policies: RetryPolicies,
    pub(super) max_text_chars: usize,
    /// Bound on a single upstream attempt
    pub(super) attempt_timeout: Duration,
    pub(super) default_deadline: Option<Duration>,
    /// Background expiry sweep started by `from_config`
    pub(super) cleanup: Option<CleanupTask>,
}

/// A running sweep; stopped when the orchestrator is dropped.
pub(super) struct CleanupTask {
    pub(super) stop: CancelHandle,
    pub(super) handle: JoinHandle<()>,
}

impl Drop for SynthesisOrchestrator {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup.take() {
            task.stop.cancel();
            task.handle.abort();
        }
    }
}

impl std::fmt::Debug for SynthesisOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisOrchestrator")
            .field("cache", &self.cache)
            .field("breaker", &self.breaker)
            .field("namespace", &self.keys.namespace())
            .field("cleanup_running", &self.has_cleanup_task())
            .finish()
    }
}

impl SynthesisOrchestrator {
    /// Start building an orchestrator around an existing cache and client.
    pub fn builder(client: Arc<dyn SynthesisClient>, cache: Arc<TieredCache>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            client,
            cache,
            circuit: CircuitConfig::default(),
            policies: RetryPolicies::default(),
            keys: CacheKeyGenerator::new(),
            max_text_chars: 5000,
            attempt_timeout: Duration::from_secs(45),
            default_deadline: None,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    #[must_use]
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn key_generator(&self) -> &CacheKeyGenerator {
        &self.keys
    }

    /// Whether a background expiry sweep is attached and still running.
    #[must_use]
    pub fn has_cleanup_task(&self) -> bool {
        self.cleanup.as_ref().is_some_and(|task| !task.handle.is_finished())
    }
}

/// Builder for [`SynthesisOrchestrator`]. Defaults follow
/// [`TtsCacheConfig::default`](crate::TtsCacheConfig).
pub struct OrchestratorBuilder {
    client: Arc<dyn SynthesisClient>,
    cache: Arc<TieredCache>,
    circuit: CircuitConfig,
    policies: RetryPolicies,
    keys: CacheKeyGenerator,
    max_text_chars: usize,
    attempt_timeout: Duration,
    default_deadline: Option<Duration>,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn circuit_config(mut self, config: CircuitConfig) -> Self {
        self.circuit = config;
        self
    }

    #[must_use]
    pub fn retry_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    #[must_use]
    pub fn key_generator(mut self, keys: CacheKeyGenerator) -> Self {
        self.keys = keys;
        self
    }

    #[must_use]
    pub fn max_text_chars(mut self, max: usize) -> Self {
        self.max_text_chars = max;
        self
    }

    #[must_use]
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    #[must_use]
    pub fn default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }

    #[must_use]
    pub fn build(self) -> SynthesisOrchestrator {
        SynthesisOrchestrator {
            cache: self.cache,
            breaker: Arc::new(CircuitBreaker::new(SYNTHESIS_CIRCUIT, self.circuit)),
            client: self.client,
            keys: self.keys,
            policies: self.policies,
            max_text_chars: self.max_text_chars,
            attempt_timeout: self.attempt_timeout,
            default_deadline: self.default_deadline,
            cleanup: None,
        }
    }
}
