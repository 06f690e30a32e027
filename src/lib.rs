//! # TTS Cache
//!
//! A tiered audio cache and failure-tolerant orchestrator for text-to-speech
//! APIs. Identical text is synthesized once; upstream outages degrade to
//! "no audio" instead of errors that take the host down.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   SynthesisOrchestrator                     │
//! │  • normalize + validate text, derive SHA-256 key           │
//! │  • cache-first, then breaker → retry → API                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   L1: In-Memory LRU                         │
//! │  • entry and byte ceilings, TTL checked on read            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ miss
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   L2: SQLite (optional)                     │
//! │  • survives restarts, LRU by last access                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ miss
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   L3: Redis (optional)                      │
//! │  • shared between instances, native expiry                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ miss
//!                              ▼
//!                 circuit breaker → retry/backoff → HTTP API
//! ```
//!
//! A hit in a slower tier is copied into every faster tier. A failing tier
//! reads as a miss and never fails the request.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tts_cache::{SynthesisOrchestrator, TtsCacheConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TtsCacheConfig::from_env().expect("config");
//!     let tts = SynthesisOrchestrator::from_config_http(&config)
//!         .await
//!         .expect("orchestrator");
//!
//!     if let Some(result) = tts.synthesize_best_effort("Hello Bitcoin").await {
//!         println!("{} bytes of audio (cached: {})", result.audio.len(), result.was_cached);
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`]: The [`SynthesisOrchestrator`] façade
//! - [`tiered`]: Read-through/write-through over the tiers
//! - [`storage`]: Cache backends (memory, SQLite, Redis)
//! - [`resilience`]: Circuit breaker, classified retry, backoff, cancellation
//! - [`synthesis`]: The upstream client trait and its HTTP implementation
//! - [`cache_key`]: Text normalization and key derivation

pub mod cache_key;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod resilience;
pub mod storage;
pub mod synthesis;
pub mod tiered;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use cache_key::{normalize_text, CacheKey, CacheKeyGenerator};
pub use config::{ConfigError, TtsCacheConfig};
pub use error::{Classify, ErrorClassification, SynthesisError};
pub use orchestrator::{OrchestratorBuilder, SynthesisOrchestrator, SynthesisResult, SynthesizeOptions};
pub use resilience::backoff::{BackoffPolicy, RetryPolicies};
pub use resilience::cancel::{CancelHandle, CancelToken};
pub use resilience::circuit_breaker::{
    CircuitBreaker, CircuitConfig, CircuitError, CircuitOpen, CircuitPermit, CircuitSnapshot, CircuitState,
};
pub use resilience::retry::{retry, RetryError};
pub use storage::memory::MemoryBackend;
pub use storage::redis::RedisBackend;
pub use storage::sqlite::SqliteBackend;
pub use storage::traits::{BackendStats, CacheBackend, CacheConfig, CacheEntry, StorageError};
pub use synthesis::{ClientConfig, ClientError, HttpSynthesisClient, SynthesisClient};
pub use tiered::{CacheHit, CleanupReport, TierStats, TieredCache, TieredStats};
pub use metrics::LatencyTimer;
