//! Request path: synthesize, cache management and circuit controls.

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache_key::normalize_text;
use crate::error::SynthesisError;
use crate::resilience::cancel::CancelToken;
use crate::resilience::circuit_breaker::{CircuitSnapshot, CircuitState};
use crate::resilience::retry::{retry, RetryError};
use crate::synthesis::ClientError;
use crate::tiered::{CleanupReport, TieredStats};

use super::{SynthesisOrchestrator, SynthesisResult, SynthesizeOptions};

impl SynthesisOrchestrator {
    /// Audio for `text`, from cache when possible.
    ///
    /// Errors are final: transient upstream failures have already been
    /// retried. Callers should fall back to text-only output on `Err`.
    pub async fn synthesize(&self, text: &str) -> Result<SynthesisResult, SynthesisError> {
        self.synthesize_with(text, SynthesizeOptions::default()).await
    }

    /// [`synthesize`](Self::synthesize) with a deadline and/or cancel token.
    ///
    /// A cancelled or timed-out request is not counted against the circuit
    /// breaker.
    #[tracing::instrument(skip(self, text, options), fields(chars = text.len()))]
    pub async fn synthesize_with(
        &self,
        text: &str,
        options: SynthesizeOptions,
    ) -> Result<SynthesisResult, SynthesisError> {
        let result = self.run(text, options).await;
        let outcome = match &result {
            Ok(r) if r.was_cached => "cached",
            Ok(_) => "synthesized",
            Err(e) => e.kind(),
        };
        crate::metrics::record_synthesis(outcome);
        result
    }

    /// Never fails: logs the error and returns `None` so the caller can
    /// degrade to text-only output.
    pub async fn synthesize_best_effort(&self, text: &str) -> Option<SynthesisResult> {
        match self.synthesize(text).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(error = %e, "Audio unavailable, falling back to text only");
                None
            }
        }
    }

    async fn run(&self, text: &str, options: SynthesizeOptions) -> Result<SynthesisResult, SynthesisError> {
        let normalized = normalize_text(text);
        self.validate(&normalized)?;
        let key = self.keys.key_normalized(&normalized);

        if let Some(hit) = self.cache.lookup(&key).await {
            debug!(tier = hit.tier, key = %key, "Serving cached audio");
            return Ok(SynthesisResult {
                audio: hit.payload,
                was_cached: true,
                synthesis_time: std::time::Duration::ZERO,
            });
        }

        let permit = self.breaker.allow().map_err(|open| SynthesisError::CircuitOpen {
            retry_after: open.retry_after,
        })?;

        let cancel = options.cancel.unwrap_or_else(CancelToken::never);
        let deadline = options.deadline.or(self.default_deadline);
        let start = Instant::now();

        let text = normalized.as_str();
        let call = retry("synthesize", &self.policies, &cancel, move || self.attempt(text));
        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Dropping the permit records nothing
                    drop(permit);
                    debug!(?deadline, "Synthesis deadline exceeded");
                    return Err(SynthesisError::DeadlineExceeded(deadline));
                }
            },
            None => call.await,
        };

        match outcome {
            Ok(audio) => {
                permit.record_success();
                let synthesis_time = start.elapsed();
                crate::metrics::record_synthesis_latency(synthesis_time);
                crate::metrics::record_audio_bytes(audio.len());
                debug!(bytes = audio.len(), ?synthesis_time, "Synthesized audio");

                self.cache.put(&key, audio.clone()).await;
                Ok(SynthesisResult {
                    audio,
                    was_cached: false,
                    synthesis_time,
                })
            }
            Err(RetryError::Cancelled) => {
                drop(permit);
                Err(SynthesisError::Cancelled)
            }
            Err(RetryError::Fatal(e)) => {
                permit.record_failure();
                Err(SynthesisError::Auth(e.message))
            }
            Err(RetryError::Exhausted { class, attempts, last }) => {
                permit.record_failure();
                Err(SynthesisError::RetryExhausted {
                    class,
                    attempts,
                    message: last.message,
                })
            }
        }
    }

    /// One upstream call, bounded by the attempt timeout.
    async fn attempt(&self, text: &str) -> Result<Bytes, ClientError> {
        match tokio::time::timeout(self.attempt_timeout, self.client.synthesize(text)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::network(format!(
                "synthesis attempt timed out after {:?}",
                self.attempt_timeout
            ))),
        }
    }

    fn validate(&self, normalized: &str) -> Result<(), SynthesisError> {
        if normalized.is_empty() {
            return Err(SynthesisError::Validation("text is empty".into()));
        }
        let chars = normalized.chars().count();
        if chars > self.max_text_chars {
            return Err(SynthesisError::Validation(format!(
                "text is {} characters, limit is {}",
                chars, self.max_text_chars
            )));
        }
        Ok(())
    }

    /// Whether audio for `text` is cached in any tier. Does not count as a
    /// cache access.
    pub async fn is_cached(&self, text: &str) -> bool {
        let key = self.keys.key(text);
        self.cache.has(&key).await
    }

    /// Drop cached audio for `text` from every tier.
    pub async fn invalidate(&self, text: &str) {
        let key = self.keys.key(text);
        self.cache.remove(&key).await;
        debug!(key = %key, "Invalidated cached audio");
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
        info!("Audio cache cleared");
    }

    /// Per-tier hit/miss/error counts and sizes.
    pub async fn cache_stats(&self) -> TieredStats {
        self.cache.stats().await
    }

    /// Run one expiry sweep now.
    pub async fn cleanup_expired(&self) -> CleanupReport {
        self.cache.cleanup_expired().await
    }

    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    #[must_use]
    pub fn circuit_snapshot(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Operator override: close the breaker.
    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }

    /// Operator override: stop calling the API until the cooldown passes.
    pub fn force_circuit_open(&self) {
        self.breaker.force_open();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClassification;
    use crate::resilience::backoff::{BackoffPolicy, RetryPolicies};
    use crate::resilience::cancel::CancelHandle;
    use crate::storage::memory::MemoryBackend;
    use crate::storage::traits::CacheConfig;
    use crate::synthesis::SynthesisClient;
    use crate::tiered::TieredCache;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Replays scripted outcomes, then repeats the last one.
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<Bytes, ClientError>>>,
        last: Mutex<Option<Result<Bytes, ClientError>>>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<Bytes, ClientError>>) -> Arc<Self> {
            Self::slow(script, Duration::ZERO)
        }

        fn slow(script: Vec<Result<Bytes, ClientError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                delay,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SynthesisClient for ScriptedClient {
        async fn synthesize(&self, _text: &str) -> Result<Bytes, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().pop_front();
            match next {
                Some(outcome) => {
                    *self.last.lock() = Some(outcome.clone());
                    outcome
                }
                None => self
                    .last
                    .lock()
                    .clone()
                    .unwrap_or_else(|| Err(ClientError::new(ErrorClassification::Unknown, "script empty"))),
            }
        }
    }

    fn audio() -> Result<Bytes, ClientError> {
        Ok(Bytes::from_static(b"ID3audio"))
    }

    fn server_error() -> Result<Bytes, ClientError> {
        Err(ClientError::from_status(503, "unavailable"))
    }

    fn no_delay(max_retries: u32) -> RetryPolicies {
        RetryPolicies::uniform(BackoffPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_retries,
            jitter_fraction: 0.0,
        })
    }

    fn orchestrator(client: Arc<ScriptedClient>, policies: RetryPolicies) -> SynthesisOrchestrator {
        let memory = Arc::new(MemoryBackend::new(CacheConfig {
            max_entries: 100,
            max_bytes: 0,
            default_ttl: Duration::from_secs(3600),
        }));
        SynthesisOrchestrator::builder(client, Arc::new(TieredCache::new(memory)))
            .retry_policies(policies)
            .max_text_chars(50)
            .build()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let client = ScriptedClient::new(vec![audio()]);
        let orch = orchestrator(client.clone(), no_delay(0));

        let first = orch.synthesize("Hello Bitcoin").await.unwrap();
        assert!(!first.was_cached);
        assert_eq!(first.audio.as_ref(), b"ID3audio");

        let second = orch.synthesize("  Hello   Bitcoin ").await.unwrap();
        assert!(second.was_cached);
        assert_eq!(second.synthesis_time, Duration::ZERO);
        assert_eq!(second.audio, first.audio);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_validation_never_calls_upstream() {
        let client = ScriptedClient::new(vec![audio()]);
        let orch = orchestrator(client.clone(), no_delay(0));

        assert!(matches!(orch.synthesize(" \n ").await, Err(SynthesisError::Validation(_))));
        let long = "a".repeat(51);
        assert!(matches!(orch.synthesize(&long).await, Err(SynthesisError::Validation(_))));
        assert!(orch.synthesize(&"a".repeat(50)).await.is_ok());
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_absorbed() {
        let client = ScriptedClient::new(vec![server_error(), server_error(), audio()]);
        let orch = orchestrator(client.clone(), no_delay(2));

        let result = orch.synthesize("retry me").await.unwrap();
        assert!(!result.was_cached);
        assert_eq!(client.calls(), 3);
        // One request, one breaker outcome
        assert_eq!(orch.circuit_snapshot().successes, 1);
        assert_eq!(orch.circuit_snapshot().failures, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_record_one_failure() {
        let client = ScriptedClient::new(vec![server_error()]);
        let orch = orchestrator(client.clone(), no_delay(2));

        match orch.synthesize("doomed").await {
            Err(SynthesisError::RetryExhausted { class, attempts, .. }) => {
                assert_eq!(class, ErrorClassification::ServerError);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
        assert_eq!(client.calls(), 3);
        assert_eq!(orch.circuit_snapshot().failures, 1);
        assert!(!orch.is_cached("doomed").await);
    }

    #[tokio::test]
    async fn test_auth_error_is_not_retried() {
        let client = ScriptedClient::new(vec![Err(ClientError::from_status(401, "invalid api key"))]);
        let orch = orchestrator(client.clone(), no_delay(3));

        assert!(matches!(orch.synthesize("hi").await, Err(SynthesisError::Auth(_))));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_upstream() {
        let client = ScriptedClient::new(vec![audio()]);
        let orch = orchestrator(client.clone(), no_delay(0));
        orch.force_circuit_open();

        assert!(matches!(
            orch.synthesize("hi").await,
            Err(SynthesisError::CircuitOpen { retry_after: Some(_) })
        ));
        assert_eq!(client.calls(), 0);

        orch.reset_circuit();
        assert_eq!(orch.circuit_state(), CircuitState::Closed);
        assert!(orch.synthesize("hi").await.is_ok());
    }

    #[tokio::test]
    async fn test_cached_audio_served_while_circuit_open() {
        let client = ScriptedClient::new(vec![audio()]);
        let orch = orchestrator(client.clone(), no_delay(0));
        orch.synthesize("cached line").await.unwrap();

        orch.force_circuit_open();
        let result = orch.synthesize("cached line").await.unwrap();
        assert!(result.was_cached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_as_network_error() {
        let client = ScriptedClient::slow(vec![audio()], Duration::from_secs(60));
        let memory = Arc::new(MemoryBackend::new(CacheConfig::default()));
        let orch = SynthesisOrchestrator::builder(client.clone(), Arc::new(TieredCache::new(memory)))
            .retry_policies(no_delay(1))
            .attempt_timeout(Duration::from_secs(5))
            .build();

        match orch.synthesize("slow").await {
            Err(SynthesisError::RetryExhausted { class, attempts, .. }) => {
                assert_eq!(class, ErrorClassification::NetworkError);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_not_a_breaker_failure() {
        let client = ScriptedClient::slow(vec![audio()], Duration::from_secs(60));
        let orch = orchestrator(client.clone(), no_delay(0));

        let result = orch
            .synthesize_with("slow", SynthesizeOptions::default().with_deadline(Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(SynthesisError::DeadlineExceeded(_))));

        let snap = orch.circuit_snapshot();
        assert_eq!(snap.failures, 0);
        assert_eq!(snap.window_len, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let client = ScriptedClient::new(vec![server_error()]);
        let policies = RetryPolicies::uniform(BackoffPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            max_retries: 3,
            jitter_fraction: 0.0,
        });
        let orch = Arc::new(orchestrator(client.clone(), policies));
        let handle = CancelHandle::new();

        let task = tokio::spawn({
            let orch = orch.clone();
            let token = handle.token();
            async move {
                orch.synthesize_with("hi", SynthesizeOptions::default().with_cancel(token))
                    .await
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();

        assert!(matches!(task.await.unwrap(), Err(SynthesisError::Cancelled)));
        assert_eq!(client.calls(), 1);
        assert_eq!(orch.circuit_snapshot().failures, 0);
    }

    #[tokio::test]
    async fn test_best_effort_degrades_to_none() {
        let client = ScriptedClient::new(vec![server_error()]);
        let orch = orchestrator(client, no_delay(0));
        assert!(orch.synthesize_best_effort("hi").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let client = ScriptedClient::new(vec![audio()]);
        let orch = orchestrator(client.clone(), no_delay(0));

        orch.synthesize("one").await.unwrap();
        orch.synthesize("two").await.unwrap();
        assert!(orch.is_cached("one").await);

        orch.invalidate("one").await;
        assert!(!orch.is_cached("one").await);
        assert!(orch.is_cached("two").await);

        orch.clear_cache().await;
        assert!(!orch.is_cached("two").await);
        assert_eq!(orch.cache_stats().await.tiers[0].backend.as_ref().unwrap().entries, Some(0));
    }
}
