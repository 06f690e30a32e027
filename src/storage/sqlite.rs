// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistent audio tier backed by a local SQLite file.
//!
//! Survives restarts. Schema:
//! ```sql
//! CREATE TABLE audio_cache (
//!   cache_key        TEXT PRIMARY KEY,   -- hex sha256
//!   payload          BLOB NOT NULL,
//!   created_at       INTEGER NOT NULL,   -- ms since epoch
//!   last_accessed_at INTEGER NOT NULL,   -- ms since epoch (LRU order)
//!   access_count     INTEGER NOT NULL,
//!   size_bytes       INTEGER NOT NULL,
//!   ttl_ms           INTEGER NOT NULL,
//!   expires_at       INTEGER NOT NULL    -- created_at + ttl_ms
//! )
//! ```
//!
//! Eviction order is `last_accessed_at`, then `created_at`, then `rowid`
//! (insertion order) so that entries written within the same millisecond
//! still evict deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;
use tracing::{debug, info};

use super::traits::{now_millis, BackendStats, CacheBackend, CacheConfig, CacheEntry, StorageError};
use crate::cache_key::CacheKey;
use crate::resilience::backoff::{BackoffPolicy, RetryPolicies};
use crate::resilience::cancel::CancelToken;
use crate::resilience::retry::retry;

/// Expired rows deleted per statement during a sweep.
const CLEANUP_BATCH: i64 = 500;

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct SqliteBackend {
    pool: SqlitePool,
    path: String,
    config: CacheConfig,
    evictions: AtomicU64,
    expired_removed: AtomicU64,
}

impl SqliteBackend {
    /// Open (or create) the cache database at `path`.
    ///
    /// Uses startup retry: a bad path or locked file fails within a few
    /// seconds instead of hanging.
    pub async fn open(path: &str, config: CacheConfig) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            // WAL lets readers proceed while a put is evicting
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let policies = RetryPolicies::uniform(BackoffPolicy::startup());
        let pool = retry("sqlite_connect", &policies, &CancelToken::never(), || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(8)
                    .acquire_timeout(Duration::from_secs(10))
                    .idle_timeout(Duration::from_secs(300))
                    .connect_with(options)
                    .await
                    .map_err(backend_err)
            }
        })
        .await?;

        let backend = Self {
            pool,
            path: path.to_string(),
            config,
            evictions: AtomicU64::new(0),
            expired_removed: AtomicU64::new(0),
        };
        backend.init_schema().await?;

        info!(path = %backend.path, "Persistent audio cache opened");
        Ok(backend)
    }

    /// Path of the database file
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get a clone of the connection pool.
    #[must_use]
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audio_cache (
                cache_key TEXT PRIMARY KEY,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                size_bytes INTEGER NOT NULL,
                ttl_ms INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audio_cache_lru ON audio_cache (last_accessed_at, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audio_cache_expiry ON audio_cache (expires_at)")
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(())
    }

    /// Delete least recently used rows until both ceilings hold.
    /// Runs inside the caller's transaction.
    async fn evict_over_limits(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ) -> Result<u64, StorageError> {
        let mut evicted = 0u64;
        loop {
            let row = sqlx::query(
                "SELECT COUNT(*) AS entries, COALESCE(SUM(size_bytes), 0) AS bytes FROM audio_cache",
            )
            .fetch_one(&mut **tx)
            .await
            .map_err(backend_err)?;
            let entries: i64 = row.try_get("entries").map_err(backend_err)?;
            let bytes: i64 = row.try_get("bytes").map_err(backend_err)?;

            if !self.config.is_exceeded(entries as usize, bytes as u64) {
                return Ok(evicted);
            }

            let deleted = sqlx::query(
                r#"
                DELETE FROM audio_cache WHERE cache_key = (
                    SELECT cache_key FROM audio_cache
                    ORDER BY last_accessed_at ASC, created_at ASC, rowid ASC
                    LIMIT 1
                )
                "#,
            )
            .execute(&mut **tx)
            .await
            .map_err(backend_err)?
            .rows_affected();

            if deleted == 0 {
                return Ok(evicted);
            }
            evicted += deleted;
        }
    }
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn config(&self) -> &CacheConfig {
        &self.config
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StorageError> {
        let row = sqlx::query(
            "SELECT payload, created_at, access_count, size_bytes, ttl_ms, expires_at FROM audio_cache WHERE cache_key = ?",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let now = now_millis();
        let expires_at: i64 = row.try_get("expires_at").map_err(backend_err)?;
        if now as i64 >= expires_at {
            self.remove(key).await?;
            self.expired_removed.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Persistent entry expired on read");
            return Ok(None);
        }

        sqlx::query(
            "UPDATE audio_cache SET last_accessed_at = ?, access_count = access_count + 1 WHERE cache_key = ?",
        )
        .bind(now as i64)
        .bind(key.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        let payload: Vec<u8> = row.try_get("payload").map_err(backend_err)?;
        let created_at: i64 = row.try_get("created_at").map_err(backend_err)?;
        let access_count: i64 = row.try_get("access_count").map_err(backend_err)?;
        let size_bytes: i64 = row.try_get("size_bytes").map_err(backend_err)?;
        let ttl_ms: i64 = row.try_get("ttl_ms").map_err(backend_err)?;

        Ok(Some(CacheEntry {
            key: key.clone(),
            payload: Bytes::from(payload),
            created_at: created_at as u64,
            last_accessed_at: now,
            access_count: access_count as u64 + 1,
            size_bytes: size_bytes as usize,
            ttl: Duration::from_millis(ttl_ms as u64),
        }))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StorageError> {
        if self.config.max_bytes > 0 && entry.size_bytes as u64 > self.config.max_bytes {
            debug!(key = %entry.key, size = entry.size_bytes, "Entry larger than persistent tier, not caching");
            return Ok(());
        }
        if entry.is_expired() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO audio_cache
                (cache_key, payload, created_at, last_accessed_at, access_count, size_bytes, ttl_ms, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.key.as_str())
        .bind(entry.payload.as_ref())
        .bind(entry.created_at as i64)
        .bind(entry.last_accessed_at as i64)
        .bind(entry.access_count as i64)
        .bind(entry.size_bytes as i64)
        .bind(entry.ttl.as_millis() as i64)
        .bind(entry.expires_at() as i64)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;

        let evicted = self.evict_over_limits(&mut tx).await?;
        tx.commit().await.map_err(backend_err)?;

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            crate::metrics::record_eviction("sqlite", evicted as usize);
            debug!(evicted, "Persistent tier evicted LRU entries");
        }
        Ok(())
    }

    async fn has(&self, key: &CacheKey) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM audio_cache WHERE cache_key = ? AND expires_at > ?")
            .bind(key.as_str())
            .bind(now_millis() as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(row.is_some())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM audio_cache WHERE cache_key = ?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM audio_cache")
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        let now = now_millis() as i64;
        let mut removed = 0u64;

        // Small batches keep each write transaction short
        loop {
            let deleted = sqlx::query(
                r#"
                DELETE FROM audio_cache WHERE cache_key IN (
                    SELECT cache_key FROM audio_cache WHERE expires_at <= ? LIMIT ?
                )
                "#,
            )
            .bind(now)
            .bind(CLEANUP_BATCH)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?
            .rows_affected();

            removed += deleted;
            if deleted < CLEANUP_BATCH as u64 {
                break;
            }
        }

        self.expired_removed.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    async fn stats(&self) -> Result<BackendStats, StorageError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS entries, COALESCE(SUM(size_bytes), 0) AS bytes FROM audio_cache",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(backend_err)?;
        let entries: i64 = row.try_get("entries").map_err(backend_err)?;
        let bytes: i64 = row.try_get("bytes").map_err(backend_err)?;

        Ok(BackendStats {
            entries: Some(entries as u64),
            size_bytes: Some(bytes as u64),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
        })
    }
}
