//! Configuration for the audio cache and synthesis pipeline.
//!
//! # Example
//!
//! ```
//! use tts_cache::TtsCacheConfig;
//!
//! // Minimal config (uses defaults)
//! let config = TtsCacheConfig::default();
//! assert_eq!(config.memory_max_entries, 100);
//! assert_eq!(config.ttl_hours, 24.0);
//!
//! // Full config
//! let config = TtsCacheConfig {
//!     persistent_path: Some("./tts_cache.db".into()),
//!     redis_url: Some("redis://localhost:6379".into()),
//!     circuit_cooldown_secs: 30,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! Every field can also come from the environment with a `TTS_CACHE_` prefix
//! (`TTS_CACHE_MEMORY_MAX_ENTRIES=500`, `TTS_CACHE_REDIS_URL=...`).

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::resilience::backoff::{BackoffPolicy, RetryPolicies};
use crate::resilience::circuit_breaker::CircuitConfig;
use crate::storage::traits::CacheConfig;
use crate::synthesis::ClientConfig;

const MB: u64 = 1024 * 1024;

/// Longest accepted entry lifetime (ten years).
const MAX_TTL_HOURS: f64 = 24.0 * 365.0 * 10.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the cache tiers, circuit breaker, retry policies and
/// synthesis client.
///
/// All fields have defaults. Without `persistent_path` or `redis_url` only
/// the memory tier runs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TtsCacheConfig {
    /// Memory tier entry ceiling (0 = unlimited)
    #[serde(default = "default_memory_max_entries")]
    pub memory_max_entries: usize,
    /// Memory tier size ceiling in MB (0 = unlimited)
    #[serde(default = "default_memory_max_mb")]
    pub memory_max_mb: u64,

    /// SQLite file for the persistent tier (None = disabled)
    #[serde(default)]
    pub persistent_path: Option<String>,
    #[serde(default = "default_persistent_max_entries")]
    pub persistent_max_entries: usize,
    #[serde(default = "default_persistent_max_mb")]
    pub persistent_max_mb: u64,

    /// Entry lifetime, all tiers
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: f64,
    /// Expiry sweep period (0 = no background sweep)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Redis connection string for the shared tier (None = disabled)
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
    /// Per-operation Redis timeout
    #[serde(default = "default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,

    /// Window failure fraction that opens the circuit
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: f64,
    #[serde(default = "default_circuit_window_size")]
    pub circuit_window_size: usize,
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,
    #[serde(default = "default_circuit_success_threshold")]
    pub circuit_success_threshold: u32,
    /// Concurrent half-open trials (defaults to the success threshold)
    #[serde(default)]
    pub circuit_half_open_max_calls: Option<u32>,

    /// Retry settings per error class
    #[serde(default = "default_retry_rate_limited_max_retries")]
    pub retry_rate_limited_max_retries: u32,
    #[serde(default = "default_retry_rate_limited_base_ms")]
    pub retry_rate_limited_base_ms: u64,
    #[serde(default = "default_retry_rate_limited_max_ms")]
    pub retry_rate_limited_max_ms: u64,
    #[serde(default = "default_retry_server_error_max_retries")]
    pub retry_server_error_max_retries: u32,
    #[serde(default = "default_retry_server_error_base_ms")]
    pub retry_server_error_base_ms: u64,
    #[serde(default = "default_retry_server_error_max_ms")]
    pub retry_server_error_max_ms: u64,
    #[serde(default = "default_retry_network_error_max_retries")]
    pub retry_network_error_max_retries: u32,
    #[serde(default = "default_retry_network_error_base_ms")]
    pub retry_network_error_base_ms: u64,
    #[serde(default = "default_retry_network_error_max_ms")]
    pub retry_network_error_max_ms: u64,
    #[serde(default = "default_retry_unknown_max_retries")]
    pub retry_unknown_max_retries: u32,
    #[serde(default = "default_retry_unknown_base_ms")]
    pub retry_unknown_base_ms: u64,
    #[serde(default = "default_retry_unknown_max_ms")]
    pub retry_unknown_max_ms: u64,
    #[serde(default = "default_retry_jitter_fraction")]
    pub retry_jitter_fraction: f64,

    /// Synthesis API
    #[serde(default = "default_synthesis_base_url")]
    pub synthesis_base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_total_timeout_secs")]
    pub total_timeout_secs: u64,

    /// Longest accepted text, in characters
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
    /// Default per-request deadline (None = only the HTTP timeouts apply)
    #[serde(default)]
    pub request_deadline_secs: Option<u64>,
}

fn default_memory_max_entries() -> usize { 100 }
fn default_memory_max_mb() -> u64 { 64 }
fn default_persistent_max_entries() -> usize { 10_000 }
fn default_persistent_max_mb() -> u64 { 1024 } // 1 GB
fn default_ttl_hours() -> f64 { 24.0 }
fn default_cleanup_interval_secs() -> u64 { 3600 }
fn default_redis_prefix() -> String { "tts:audio:".to_string() }
fn default_redis_timeout_ms() -> u64 { 250 }
fn default_circuit_failure_threshold() -> f64 { 0.5 }
fn default_circuit_window_size() -> usize { 10 }
fn default_circuit_cooldown_secs() -> u64 { 60 }
fn default_circuit_success_threshold() -> u32 { 3 }
fn default_retry_rate_limited_max_retries() -> u32 { 3 }
fn default_retry_rate_limited_base_ms() -> u64 { 1000 }
fn default_retry_rate_limited_max_ms() -> u64 { 16_000 }
fn default_retry_server_error_max_retries() -> u32 { 2 }
fn default_retry_server_error_base_ms() -> u64 { 500 }
fn default_retry_server_error_max_ms() -> u64 { 8000 }
fn default_retry_network_error_max_retries() -> u32 { 2 }
fn default_retry_network_error_base_ms() -> u64 { 500 }
fn default_retry_network_error_max_ms() -> u64 { 8000 }
fn default_retry_unknown_max_retries() -> u32 { 1 }
fn default_retry_unknown_base_ms() -> u64 { 500 }
fn default_retry_unknown_max_ms() -> u64 { 4000 }
fn default_retry_jitter_fraction() -> f64 { 0.25 }
fn default_synthesis_base_url() -> String { "https://api.elevenlabs.io".to_string() }
fn default_voice_id() -> String { "21m00Tcm4TlvDq8Ikwh2".to_string() }
fn default_model_id() -> String { "eleven_turbo_v2".to_string() }
fn default_output_format() -> String { "mp3_44100_128".to_string() }
fn default_connect_timeout_secs() -> u64 { 10 }
fn default_read_timeout_secs() -> u64 { 30 }
fn default_total_timeout_secs() -> u64 { 45 }
fn default_max_text_chars() -> usize { 5000 }

impl Default for TtsCacheConfig {
    fn default() -> Self {
        Self {
            memory_max_entries: default_memory_max_entries(),
            memory_max_mb: default_memory_max_mb(),
            persistent_path: None,
            persistent_max_entries: default_persistent_max_entries(),
            persistent_max_mb: default_persistent_max_mb(),
            ttl_hours: default_ttl_hours(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            redis_url: None,
            redis_prefix: default_redis_prefix(),
            redis_timeout_ms: default_redis_timeout_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_window_size: default_circuit_window_size(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
            circuit_success_threshold: default_circuit_success_threshold(),
            circuit_half_open_max_calls: None,
            retry_rate_limited_max_retries: default_retry_rate_limited_max_retries(),
            retry_rate_limited_base_ms: default_retry_rate_limited_base_ms(),
            retry_rate_limited_max_ms: default_retry_rate_limited_max_ms(),
            retry_server_error_max_retries: default_retry_server_error_max_retries(),
            retry_server_error_base_ms: default_retry_server_error_base_ms(),
            retry_server_error_max_ms: default_retry_server_error_max_ms(),
            retry_network_error_max_retries: default_retry_network_error_max_retries(),
            retry_network_error_base_ms: default_retry_network_error_base_ms(),
            retry_network_error_max_ms: default_retry_network_error_max_ms(),
            retry_unknown_max_retries: default_retry_unknown_max_retries(),
            retry_unknown_base_ms: default_retry_unknown_base_ms(),
            retry_unknown_max_ms: default_retry_unknown_max_ms(),
            retry_jitter_fraction: default_retry_jitter_fraction(),
            synthesis_base_url: default_synthesis_base_url(),
            api_key: None,
            voice_id: default_voice_id(),
            model_id: default_model_id(),
            output_format: default_output_format(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            total_timeout_secs: default_total_timeout_secs(),
            max_text_chars: default_max_text_chars(),
            request_deadline_secs: None,
        }
    }
}

impl TtsCacheConfig {
    /// Load from `TTS_CACHE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from an optional config file (any format the `config` crate
    /// understands), overridden by `TTS_CACHE_*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("TTS_CACHE").try_parsing(true));

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that can't work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if !(self.ttl_hours > 0.0 && self.ttl_hours <= MAX_TTL_HOURS) {
            return invalid("ttl_hours must be positive and at most ten years");
        }
        if !(self.circuit_failure_threshold > 0.0 && self.circuit_failure_threshold <= 1.0) {
            return invalid("circuit_failure_threshold must be in (0, 1]");
        }
        if self.circuit_window_size == 0 {
            return invalid("circuit_window_size must be at least 1");
        }
        if self.circuit_success_threshold == 0 {
            return invalid("circuit_success_threshold must be at least 1");
        }
        if self.circuit_half_open_max_calls == Some(0) {
            return invalid("circuit_half_open_max_calls must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_fraction) {
            return invalid("retry_jitter_fraction must be in [0, 1]");
        }
        if self.max_text_chars == 0 {
            return invalid("max_text_chars must be at least 1");
        }
        if self.total_timeout_secs == 0 {
            return invalid("total_timeout_secs must be at least 1");
        }
        if self.request_deadline_secs == Some(0) {
            return invalid("request_deadline_secs must be at least 1");
        }
        if self.persistent_path.as_deref().is_some_and(str::is_empty) {
            return invalid("persistent_path must not be empty");
        }
        Ok(())
    }

    /// Entry lifetime, clamped to the accepted range.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::try_from_secs_f64(self.ttl_hours.min(MAX_TTL_HOURS) * 3600.0).unwrap_or_default()
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_secs > 0).then(|| Duration::from_secs(self.cleanup_interval_secs))
    }

    #[must_use]
    pub fn request_deadline(&self) -> Option<Duration> {
        self.request_deadline_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn memory_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.memory_max_entries,
            max_bytes: self.memory_max_mb.saturating_mul(MB),
            default_ttl: self.ttl(),
        }
    }

    #[must_use]
    pub fn persistent_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.persistent_max_entries,
            max_bytes: self.persistent_max_mb.saturating_mul(MB),
            default_ttl: self.ttl(),
        }
    }

    /// Redis sizes itself; only the TTL applies.
    #[must_use]
    pub fn distributed_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: 0,
            max_bytes: 0,
            default_ttl: self.ttl(),
        }
    }

    #[must_use]
    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            window_size: self.circuit_window_size,
            minimum_calls: self.circuit_window_size,
            cooldown: Duration::from_secs(self.circuit_cooldown_secs),
            success_threshold: self.circuit_success_threshold,
            half_open_max_calls: self
                .circuit_half_open_max_calls
                .unwrap_or(self.circuit_success_threshold),
        }
    }

    #[must_use]
    pub fn retry_policies(&self) -> RetryPolicies {
        let policy = |max_retries: u32, base_ms: u64, max_ms: u64| BackoffPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            max_retries,
            jitter_fraction: self.retry_jitter_fraction,
        };
        RetryPolicies {
            rate_limited: policy(
                self.retry_rate_limited_max_retries,
                self.retry_rate_limited_base_ms,
                self.retry_rate_limited_max_ms,
            ),
            server_error: policy(
                self.retry_server_error_max_retries,
                self.retry_server_error_base_ms,
                self.retry_server_error_max_ms,
            ),
            network_error: policy(
                self.retry_network_error_max_retries,
                self.retry_network_error_base_ms,
                self.retry_network_error_max_ms,
            ),
            unknown: policy(
                self.retry_unknown_max_retries,
                self.retry_unknown_base_ms,
                self.retry_unknown_max_ms,
            ),
        }
    }

    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.synthesis_base_url.clone(),
            api_key: self.api_key.clone(),
            voice_id: self.voice_id.clone(),
            model_id: self.model_id.clone(),
            output_format: self.output_format.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            total_timeout: Duration::from_secs(self.total_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_values() {
        let config = TtsCacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl(), Duration::from_secs(24 * 3600));
        assert_eq!(config.cleanup_interval(), Some(Duration::from_secs(3600)));

        let circuit = config.circuit_config();
        assert_eq!(circuit.failure_threshold, 0.5);
        assert_eq!(circuit.window_size, 10);
        assert_eq!(circuit.cooldown, Duration::from_secs(60));
        assert_eq!(circuit.success_threshold, 3);
        assert_eq!(circuit.half_open_max_calls, 3);

        assert_eq!(config.retry_policies(), RetryPolicies::default());
    }

    #[test]
    fn test_component_configs() {
        let config = TtsCacheConfig {
            memory_max_entries: 50,
            memory_max_mb: 2,
            ttl_hours: 0.5,
            ..Default::default()
        };
        let memory = config.memory_cache_config();
        assert_eq!(memory.max_entries, 50);
        assert_eq!(memory.max_bytes, 2 * 1024 * 1024);
        assert_eq!(memory.default_ttl, Duration::from_secs(1800));

        let persistent = config.persistent_cache_config();
        assert_eq!(persistent.max_entries, 10_000);
        assert_eq!(persistent.max_bytes, 1024 * 1024 * 1024);

        assert_eq!(config.distributed_cache_config().max_entries, 0);
        assert_eq!(config.client_config().total_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{"memory_max_entries": 7, "redis_url": "redis://cache:6379", "circuit_half_open_max_calls": 1}"#;
        let config: TtsCacheConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.memory_max_entries, 7);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.circuit_config().half_open_max_calls, 1);
        // Everything else defaulted
        assert_eq!(config.persistent_max_entries, 10_000);
        assert_eq!(config.redis_prefix, "tts:audio:");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad = [
            TtsCacheConfig { ttl_hours: 0.0, ..Default::default() },
            TtsCacheConfig { ttl_hours: f64::NAN, ..Default::default() },
            TtsCacheConfig { ttl_hours: f64::INFINITY, ..Default::default() },
            TtsCacheConfig { ttl_hours: 1e18, ..Default::default() },
            TtsCacheConfig { request_deadline_secs: Some(0), ..Default::default() },
            TtsCacheConfig { circuit_failure_threshold: 0.0, ..Default::default() },
            TtsCacheConfig { circuit_failure_threshold: 1.5, ..Default::default() },
            TtsCacheConfig { circuit_window_size: 0, ..Default::default() },
            TtsCacheConfig { circuit_success_threshold: 0, ..Default::default() },
            TtsCacheConfig { circuit_half_open_max_calls: Some(0), ..Default::default() },
            TtsCacheConfig { retry_jitter_fraction: -0.1, ..Default::default() },
            TtsCacheConfig { max_text_chars: 0, ..Default::default() },
            TtsCacheConfig { persistent_path: Some(String::new()), ..Default::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{:?}", config);
        }
    }

    #[test]
    fn test_extreme_values_never_panic() {
        let config = TtsCacheConfig {
            ttl_hours: 1e18,
            memory_max_mb: u64::MAX,
            persistent_max_mb: u64::MAX / 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.ttl(), Duration::from_secs(87_600 * 3600));
        assert_eq!(config.memory_cache_config().max_bytes, u64::MAX);
        assert_eq!(config.persistent_cache_config().max_bytes, u64::MAX);

        let negative = TtsCacheConfig { ttl_hours: -1.0, ..Default::default() };
        assert_eq!(negative.ttl(), Duration::ZERO);

        let longest = TtsCacheConfig { ttl_hours: 87_600.0, ..Default::default() };
        assert!(longest.validate().is_ok());
    }

    #[test]
    fn test_load_without_sources_gives_defaults() {
        // No file and (presumably) no TTS_CACHE_ variables in the test env
        if std::env::vars().any(|(k, _)| k.starts_with("TTS_CACHE")) {
            return;
        }
        let config = TtsCacheConfig::load(Some("/nonexistent/tts_cache_config")).unwrap();
        assert_eq!(config, TtsCacheConfig::default());
    }
}
