//! Orchestrator lifecycle: construction from config, tier startup and the
//! background expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache_key::CacheKeyGenerator;
use crate::config::{ConfigError, TtsCacheConfig};
use crate::resilience::cancel::{CancelHandle, CancelToken};
use crate::storage::memory::MemoryBackend;
use crate::storage::redis::RedisBackend;
use crate::storage::sqlite::SqliteBackend;
use crate::synthesis::{HttpSynthesisClient, SynthesisClient};
use crate::tiered::TieredCache;

use super::{CleanupTask, SynthesisOrchestrator};

impl SynthesisOrchestrator {
    /// Build an orchestrator from configuration.
    ///
    /// Startup sequence:
    /// 1. Validate the config (the only hard failure)
    /// 2. Memory tier, always present
    /// 3. SQLite tier if `persistent_path` is set
    /// 4. Redis tier if `redis_url` is set
    ///
    /// An optional tier that can't be opened is logged and skipped; the
    /// orchestrator runs on whatever tiers came up. When
    /// `cleanup_interval_secs` is non-zero an expiry sweep is started and
    /// runs until the orchestrator is dropped.
    #[tracing::instrument(skip(config, client), fields(has_sqlite, has_redis))]
    pub async fn from_config(
        config: &TtsCacheConfig,
        client: Arc<dyn SynthesisClient>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = Self::connect_tiers(config).await;
        info!(tiers = ?cache.tier_names(), "Audio cache ready");

        let mut orchestrator = Self::builder(client, Arc::new(cache))
            .circuit_config(config.circuit_config())
            .retry_policies(config.retry_policies())
            .key_generator(CacheKeyGenerator::with_namespace(&config.voice_id, &config.model_id))
            .max_text_chars(config.max_text_chars)
            .attempt_timeout(Duration::from_secs(config.total_timeout_secs))
            .default_deadline(config.request_deadline())
            .build();

        if let Some(interval) = config.cleanup_interval() {
            let stop = CancelHandle::new();
            let handle = orchestrator.spawn_cleanup(interval, stop.token());
            debug!(?interval, "Cache cleanup scheduled");
            orchestrator.cleanup = Some(CleanupTask { stop, handle });
        }

        Ok(orchestrator)
    }

    /// [`from_config`](Self::from_config) with the bundled HTTP client.
    pub async fn from_config_http(config: &TtsCacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = HttpSynthesisClient::new(config.client_config())
            .map_err(|e| ConfigError::Invalid(format!("synthesis client: {}", e)))?;
        Self::from_config(config, Arc::new(client)).await
    }

    /// Open every configured tier, fastest first.
    pub async fn connect_tiers(config: &TtsCacheConfig) -> TieredCache {
        let span = tracing::Span::current();
        let mut cache = TieredCache::new(Arc::new(MemoryBackend::new(config.memory_cache_config())));
        crate::metrics::set_tier_enabled("memory", true);

        if let Some(path) = config.persistent_path.as_deref() {
            match SqliteBackend::open(path, config.persistent_cache_config()).await {
                Ok(sqlite) => {
                    info!(path, "Persistent cache tier enabled");
                    cache = cache.with_tier(Arc::new(sqlite));
                    crate::metrics::set_tier_enabled("sqlite", true);
                    span.record("has_sqlite", true);
                }
                Err(e) => {
                    warn!(path, error = %e, "Persistent cache unavailable, continuing without it");
                    crate::metrics::set_tier_enabled("sqlite", false);
                    span.record("has_sqlite", false);
                }
            }
        }

        if let Some(url) = config.redis_url.as_deref() {
            match RedisBackend::connect(
                url,
                &config.redis_prefix,
                config.redis_timeout(),
                config.distributed_cache_config(),
            )
            .await
            {
                Ok(redis) => {
                    info!(prefix = %config.redis_prefix, "Distributed cache tier enabled");
                    cache = cache.with_tier(Arc::new(redis));
                    crate::metrics::set_tier_enabled("redis", true);
                    span.record("has_redis", true);
                }
                Err(e) => {
                    // Don't log the URL, it may carry credentials
                    warn!(error = %e, "Distributed cache unavailable, continuing without it");
                    crate::metrics::set_tier_enabled("redis", false);
                    span.record("has_redis", false);
                }
            }
        }

        cache
    }

    /// Sweep expired entries from every tier each `interval` until `cancel`
    /// fires. The first sweep runs one interval after spawning.
    pub fn spawn_cleanup(&self, interval: Duration, cancel: CancelToken) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Cache cleanup stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = cache.cleanup_expired().await;
                        if report.total() > 0 || !report.failed.is_empty() {
                            info!(
                                removed = report.total(),
                                failed = ?report.failed,
                                "Expired audio swept"
                            );
                        }
                    }
                }
            }
        })
    }
}
