//! Redis storage backend for the distributed audio tier.
//!
//! Shared between every instance pointed at the same Redis. Each entry is a
//! hash under `{prefix}{cache_key}`:
//!
//! ```text
//! HSET tts:audio:9f86d0... payload <bytes> created_at 1767084657058 ttl_ms 86400000
//! PEXPIRE tts:audio:9f86d0... <remaining ttl>
//! ```
//!
//! Expiry is delegated to Redis (`PEXPIRE` with the entry's remaining TTL) and
//! size-based eviction to the server's `maxmemory-policy` (use `allkeys-lru`).
//!
//! Every network call is bounded by a per-operation timeout. The tier above
//! treats any error from here as a miss, so an unreachable Redis never fails
//! a synthesis request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client};
use tracing::debug;

use super::traits::{now_millis, BackendStats, CacheBackend, CacheConfig, CacheEntry, StorageError};
use crate::cache_key::CacheKey;
use crate::resilience::backoff::{BackoffPolicy, RetryPolicies};
use crate::resilience::cancel::CancelToken;
use crate::resilience::retry::retry;

/// Keys deleted per SCAN page during `clear()`.
const SCAN_COUNT: usize = 500;

fn redis_err(e: redis::RedisError) -> StorageError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
        StorageError::Unavailable(e.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

pub struct RedisBackend {
    connection: ConnectionManager,
    /// Namespace for keys (e.g. "tts:audio:" → "tts:audio:9f86d0...")
    prefix: String,
    op_timeout: Duration,
    config: CacheConfig,
    expired_removed: AtomicU64,
}

impl RedisBackend {
    /// Connect to Redis.
    ///
    /// `config.max_entries`/`max_bytes` are informational for this tier;
    /// Redis enforces its own memory ceiling.
    pub async fn connect(
        url: &str,
        prefix: &str,
        op_timeout: Duration,
        config: CacheConfig,
    ) -> Result<Self, StorageError> {
        let client = Client::open(url).map_err(redis_err)?;

        // Startup config: fail fast on a wrong URL instead of hanging
        let policies = RetryPolicies::uniform(BackoffPolicy::startup());
        let connection = retry("redis_connect", &policies, &CancelToken::never(), || {
            let client = client.clone();
            async move { ConnectionManager::new(client).await.map_err(redis_err) }
        })
        .await?;

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            op_timeout,
            config,
            expired_removed: AtomicU64::new(0),
        })
    }

    /// Apply the prefix to a key.
    #[inline]
    fn prefixed_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Get the configured prefix
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Get a clone of the connection manager
    #[must_use]
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Round-trip a PING, returning latency.
    pub async fn ping(&self) -> Result<Duration, StorageError> {
        let start = std::time::Instant::now();
        let mut conn = self.connection.clone();
        self.bounded("redis_ping", async move {
            let _: String = cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await?;
        Ok(start.elapsed())
    }

    /// Run a Redis future under the per-operation timeout.
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StorageError>
    where
        F: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(redis_err),
            Err(_) => {
                crate::metrics::record_timeout("redis", operation);
                Err(StorageError::Timeout {
                    operation,
                    after: self.op_timeout,
                })
            }
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn config(&self) -> &CacheConfig {
        &self.config
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StorageError> {
        let mut conn = self.connection.clone();
        let redis_key = self.prefixed_key(key);

        let (payload, created_at, ttl_ms): (Option<Vec<u8>>, Option<u64>, Option<u64>) = self
            .bounded("redis_get", async move {
                cmd("HMGET")
                    .arg(&redis_key)
                    .arg("payload")
                    .arg("created_at")
                    .arg("ttl_ms")
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let now = now_millis();
        let entry = CacheEntry {
            key: key.clone(),
            size_bytes: payload.len(),
            payload: Bytes::from(payload),
            created_at: created_at.unwrap_or(now),
            last_accessed_at: now,
            access_count: 1,
            ttl: Duration::from_millis(ttl_ms.unwrap_or(self.config.default_ttl.as_millis() as u64)),
        };

        // Redis expiry has millisecond precision but may lag by a tick
        if entry.is_expired_at(now) {
            self.expired_removed.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StorageError> {
        let Some(remaining) = entry.remaining_ttl() else {
            debug!(key = %entry.key, "Skipping expired entry for redis");
            return Ok(());
        };

        let mut conn = self.connection.clone();
        let redis_key = self.prefixed_key(&entry.key);
        let remaining_ms = remaining.as_millis().max(1) as u64;

        self.bounded("redis_put", async move {
            // HSET + PEXPIRE in one MULTI so a half-written key never lingers
            // without a TTL
            let mut pipeline = pipe();
            pipeline
                .atomic()
                .cmd("DEL")
                .arg(&redis_key)
                .ignore()
                .cmd("HSET")
                .arg(&redis_key)
                .arg("payload")
                .arg(entry.payload.as_ref())
                .arg("created_at")
                .arg(entry.created_at)
                .arg("ttl_ms")
                .arg(entry.ttl.as_millis() as u64)
                .ignore()
                .cmd("PEXPIRE")
                .arg(&redis_key)
                .arg(remaining_ms)
                .ignore();
            let _: () = pipeline.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn has(&self, key: &CacheKey) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let redis_key = self.prefixed_key(key);
        self.bounded("redis_exists", async move {
            let exists: bool = cmd("EXISTS").arg(&redis_key).query_async(&mut conn).await?;
            Ok(exists)
        })
        .await
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let redis_key = self.prefixed_key(key);
        self.bounded("redis_delete", async move {
            let _: () = cmd("DEL").arg(&redis_key).query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    /// Delete every key under this backend's prefix, one SCAN page at a time.
    async fn clear(&self) -> Result<(), StorageError> {
        let pattern = format!("{}*", self.prefix);
        let mut cursor: u64 = 0;

        loop {
            let mut conn = self.connection.clone();
            let pattern = pattern.clone();
            let (next, keys): (u64, Vec<String>) = self
                .bounded("redis_scan", async move {
                    cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            if !keys.is_empty() {
                let mut conn = self.connection.clone();
                self.bounded("redis_clear", async move {
                    let _: () = cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                    Ok(())
                })
                .await?;
            }

            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }

    /// Redis expires keys itself; nothing to sweep.
    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        Ok(0)
    }

    async fn stats(&self) -> Result<BackendStats, StorageError> {
        Ok(BackendStats {
            entries: None,
            size_bytes: None,
            evictions: 0,
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
        })
    }
}
