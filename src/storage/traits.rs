use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache_key::CacheKey;
use crate::error::{Classify, ErrorClassification};
use crate::resilience::retry::RetryError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Milliseconds since the Unix epoch.
///
/// Entry timestamps are wall-clock so they stay meaningful in the persistent
/// tier across restarts.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A synthesized audio payload as stored by a cache tier.
///
/// Entries are immutable once written. A re-synthesis creates a new entry
/// that overwrites the old one by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Bytes,
    /// Creation time, ms since epoch
    pub created_at: u64,
    /// Last read time, ms since epoch
    pub last_accessed_at: u64,
    pub access_count: u64,
    pub size_bytes: usize,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: Bytes, ttl: Duration) -> Self {
        let now = now_millis();
        Self {
            key,
            size_bytes: payload.len(),
            payload,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            ttl,
        }
    }

    /// Expiry instant in ms since epoch (saturating).
    #[must_use]
    pub fn expires_at(&self) -> u64 {
        self.created_at.saturating_add(self.ttl.as_millis() as u64)
    }

    /// `now - created_at >= ttl`
    #[must_use]
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at()
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Time left before expiry, `None` once expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Option<Duration> {
        let now = now_millis();
        let expires = self.expires_at();
        (expires > now).then(|| Duration::from_millis(expires - now))
    }

    pub fn record_access(&mut self) {
        self.last_accessed_at = now_millis();
        self.access_count = self.access_count.saturating_add(1);
    }
}

/// Limits for a single backend.
///
/// A limit of `0` means unlimited. With both limits set, eviction runs as soon
/// as either one is exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: u64,
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_bytes: 64 * 1024 * 1024,
            default_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

impl CacheConfig {
    /// True when `entries`/`bytes` exceed either configured ceiling.
    #[must_use]
    pub fn is_exceeded(&self, entries: usize, bytes: u64) -> bool {
        (self.max_entries > 0 && entries > self.max_entries)
            || (self.max_bytes > 0 && bytes > self.max_bytes)
    }
}

/// Point-in-time view of a backend.
///
/// `entries` and `size_bytes` are `None` for backends that can't report them
/// cheaply (the distributed tier).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub entries: Option<u64>,
    pub size_bytes: Option<u64>,
    pub evictions: u64,
    pub expired_removed: u64,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short tier name used in logs and metrics ("memory", "sqlite", "redis").
    fn name(&self) -> &'static str;

    /// Limits this backend was built with.
    fn config(&self) -> &CacheConfig;

    /// Fetch an entry. Expired entries are removed and reported as a miss.
    /// Counts as an access for LRU purposes.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StorageError>;

    /// Store an entry, evicting least recently used entries while over limits.
    async fn put(&self, entry: CacheEntry) -> Result<(), StorageError>;

    /// Existence check. Never counts as an access.
    async fn has(&self, key: &CacheKey) -> Result<bool, StorageError>;

    async fn remove(&self, key: &CacheKey) -> Result<(), StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;

    /// Remove every expired entry, returning how many were removed.
    async fn cleanup_expired(&self) -> Result<u64, StorageError>;

    async fn stats(&self) -> Result<BackendStats, StorageError>;
}

impl From<RetryError<StorageError>> for StorageError {
    fn from(e: RetryError<StorageError>) -> Self {
        match e {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal(inner) => inner,
            RetryError::Cancelled => StorageError::Unavailable("operation cancelled".into()),
        }
    }
}

/// Storage failures are transient from the caller's point of view.
impl Classify for StorageError {
    fn classify(&self) -> ErrorClassification {
        ErrorClassification::NetworkError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ttl: Duration) -> CacheEntry {
        CacheEntry::new(CacheKey::from_hex("ab".repeat(32)), Bytes::from_static(b"audio"), ttl)
    }

    #[test]
    fn test_entry_size_matches_payload() {
        let e = entry(Duration::from_secs(1));
        assert_eq!(e.size_bytes, 5);
        assert_eq!(e.access_count, 0);
        assert_eq!(e.created_at, e.last_accessed_at);
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let e = entry(Duration::from_millis(100));
        assert!(!e.is_expired_at(e.created_at + 99));
        assert!(e.is_expired_at(e.created_at + 100));
    }

    #[test]
    fn test_zero_ttl_is_immediately_expired() {
        let e = entry(Duration::ZERO);
        assert!(e.is_expired());
        assert!(e.remaining_ttl().is_none());
    }

    #[test]
    fn test_record_access() {
        let mut e = entry(Duration::from_secs(60));
        e.record_access();
        e.record_access();
        assert_eq!(e.access_count, 2);
        assert!(e.last_accessed_at >= e.created_at);
    }

    #[test]
    fn test_limits_trigger_on_either_ceiling() {
        let config = CacheConfig {
            max_entries: 2,
            max_bytes: 100,
            default_ttl: Duration::from_secs(1),
        };
        assert!(!config.is_exceeded(2, 100));
        assert!(config.is_exceeded(3, 10));
        assert!(config.is_exceeded(1, 101));
    }

    #[test]
    fn test_zero_limits_are_unlimited() {
        let config = CacheConfig {
            max_entries: 0,
            max_bytes: 0,
            default_ttl: Duration::from_secs(1),
        };
        assert!(!config.is_exceeded(usize::MAX, u64::MAX));
    }
}
