// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for tts-cache.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `tts_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for sizes
//!
//! # Labels
//! - `tier`: memory, sqlite, redis
//! - `operation`: get, put, has, remove, clear, cleanup, warm
//! - `outcome`: hit, miss, error / success, failure, rejected
//! - `class`: rate_limited, server_error, network_error, auth_error, unknown

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a cache lookup against one tier
pub fn record_lookup(tier: &str, outcome: &str) {
    counter!(
        "tts_cache_lookups_total",
        "tier" => tier.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record backend operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "tts_cache_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record entries evicted to stay under a tier's limits
pub fn record_eviction(tier: &str, count: usize) {
    counter!("tts_cache_evictions_total", "tier" => tier.to_string()).increment(count as u64);
}

/// Record entries removed by an expiry sweep
pub fn record_expired(tier: &str, count: u64) {
    counter!("tts_cache_expired_total", "tier" => tier.to_string()).increment(count);
}

/// Record a slower-tier hit copied into a faster tier
pub fn record_warm(tier: &str) {
    counter!("tts_cache_warms_total", "tier" => tier.to_string()).increment(1);
}

/// Record audio bytes written through the cache
pub fn record_bytes_written(bytes: usize) {
    counter!("tts_cache_bytes_written_total").increment(bytes as u64);
}

/// Set current tier size. Tiers that can't report are skipped.
pub fn set_tier_size(tier: &str, entries: Option<u64>, bytes: Option<u64>) {
    if let Some(entries) = entries {
        gauge!("tts_cache_tier_entries", "tier" => tier.to_string()).set(entries as f64);
    }
    if let Some(bytes) = bytes {
        gauge!("tts_cache_tier_bytes", "tier" => tier.to_string()).set(bytes as f64);
    }
}

/// Record a backend error
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "tts_cache_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a backend operation that hit its timeout
pub fn record_timeout(tier: &str, operation: &str) {
    counter!(
        "tts_cache_timeouts_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state (0=closed, 1=half_open, 2=open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "tts_cache_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record a call decision/outcome seen by a circuit breaker
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "tts_cache_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a retry scheduled after a classified failure
pub fn record_retry(operation: &str, class: &str) {
    counter!(
        "tts_cache_retries_total",
        "operation" => operation.to_string(),
        "class" => class.to_string()
    )
    .increment(1);
}

/// Record the final outcome of a synthesize request
/// (`cached`, `synthesized`, or a `SynthesisError` kind)
pub fn record_synthesis(outcome: &str) {
    counter!(
        "tts_cache_synthesis_requests_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record time spent calling the upstream API, retries included
pub fn record_synthesis_latency(duration: Duration) {
    histogram!("tts_cache_synthesis_seconds").record(duration.as_secs_f64());
}

/// Record the size of synthesized audio
pub fn record_audio_bytes(bytes: usize) {
    histogram!("tts_cache_audio_bytes").record(bytes as f64);
}

/// Record how a cache tier came up at startup
pub fn set_tier_enabled(tier: &str, enabled: bool) {
    gauge!("tts_cache_tier_enabled", "tier" => tier.to_string()).set(if enabled { 1.0 } else { 0.0 });
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
