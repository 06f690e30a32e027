//! In-process LRU tier.
//!
//! Entries live in an [`LruCache`] behind a single `parking_lot::Mutex`. A
//! second index ordered by expiry time lets the periodic sweep pop expired
//! entries in small batches instead of walking the whole cache under the lock.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::traits::{now_millis, BackendStats, CacheBackend, CacheConfig, CacheEntry, StorageError};
use crate::cache_key::CacheKey;

/// Expired entries removed per lock acquisition during a sweep.
const CLEANUP_BATCH: usize = 256;

struct LruState {
    entries: LruCache<CacheKey, CacheEntry>,
    /// (expires_at, key) for every live entry
    expiry: BTreeSet<(u64, CacheKey)>,
    total_bytes: u64,
}

impl LruState {
    fn detach(&mut self, entry: &CacheEntry) {
        self.expiry.remove(&(entry.expires_at(), entry.key.clone()));
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes as u64);
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.detach(&entry);
        Some(entry)
    }
}

pub struct MemoryBackend {
    config: CacheConfig,
    state: Mutex<LruState>,
    evictions: AtomicU64,
    expired_removed: AtomicU64,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LruState {
                entries: LruCache::unbounded(),
                expiry: BTreeSet::new(),
                total_bytes: 0,
            }),
            evictions: AtomicU64::new(0),
            expired_removed: AtomicU64::new(0),
        }
    }

    /// Current entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of payload sizes currently held
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    fn insert(&self, entry: CacheEntry) -> usize {
        let mut state = self.state.lock();

        if let Some(old) = state.remove(&entry.key) {
            debug!(key = %old.key, "Replacing existing memory entry");
        }

        state.total_bytes += entry.size_bytes as u64;
        state.expiry.insert((entry.expires_at(), entry.key.clone()));
        state.entries.put(entry.key.clone(), entry);

        // LruCache keeps strict recency order, so the LRU end is always the
        // oldest access; no two entries share a recency slot.
        let mut evicted = 0;
        while self.config.is_exceeded(state.entries.len(), state.total_bytes) {
            match state.entries.pop_lru() {
                Some((_, victim)) => {
                    state.detach(&victim);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn config(&self) -> &CacheConfig {
        &self.config
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StorageError> {
        let mut state = self.state.lock();
        let now = now_millis();

        match state.entries.get_mut(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired_at(now) => {
                entry.record_access();
                return Ok(Some(entry.clone()));
            }
            Some(_) => {}
        }

        state.remove(key);
        self.expired_removed.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Memory entry expired on read");
        Ok(None)
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), StorageError> {
        if self.config.max_bytes > 0 && entry.size_bytes as u64 > self.config.max_bytes {
            warn!(
                key = %entry.key,
                size = entry.size_bytes,
                max_bytes = self.config.max_bytes,
                "Entry larger than memory tier, not caching"
            );
            return Ok(());
        }
        if entry.is_expired() {
            return Ok(());
        }

        let evicted = self.insert(entry);
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            crate::metrics::record_eviction("memory", evicted);
        }
        Ok(())
    }

    async fn has(&self, key: &CacheKey) -> Result<bool, StorageError> {
        let state = self.state.lock();
        Ok(state
            .entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired()))
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), StorageError> {
        self.state.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.entries.clear();
        state.expiry.clear();
        state.total_bytes = 0;
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        let now = now_millis();
        let mut removed = 0u64;

        loop {
            let swept = {
                let mut state = self.state.lock();
                let batch: Vec<CacheKey> = state
                    .expiry
                    .iter()
                    .take_while(|(expires_at, _)| *expires_at <= now)
                    .take(CLEANUP_BATCH)
                    .map(|(_, key)| key.clone())
                    .collect();
                for key in &batch {
                    state.remove(key);
                }
                batch.len()
            };

            removed += swept as u64;
            if swept < CLEANUP_BATCH {
                break;
            }
            tokio::task::yield_now().await;
        }

        self.expired_removed.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    async fn stats(&self) -> Result<BackendStats, StorageError> {
        let state = self.state.lock();
        Ok(BackendStats {
            entries: Some(state.entries.len() as u64),
            size_bytes: Some(state.total_bytes),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::CacheKeyGenerator;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn key(text: &str) -> CacheKey {
        CacheKeyGenerator::new().key(text)
    }

    fn entry(text: &str, payload: &'static [u8], ttl: Duration) -> CacheEntry {
        CacheEntry::new(key(text), Bytes::from_static(payload), ttl)
    }

    fn backend(max_entries: usize, max_bytes: u64) -> MemoryBackend {
        MemoryBackend::new(CacheConfig {
            max_entries,
            max_bytes,
            default_ttl: Duration::from_secs(60),
        })
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_new_backend_is_empty() {
        let mem = backend(10, 0);
        assert!(mem.is_empty());
        assert_eq!(mem.size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let mem = backend(10, 0);
        mem.put(entry("a", b"alpha", HOUR)).await.unwrap();

        let got = mem.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(got.payload, Bytes::from_static(b"alpha"));
        assert_eq!(got.access_count, 1);
        assert_eq!(mem.size_bytes(), 5);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let mem = backend(10, 0);
        assert!(mem.get(&key("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lru_evicts_oldest_on_entry_limit() {
        let mem = backend(2, 0);
        mem.put(entry("a", b"1", HOUR)).await.unwrap();
        mem.put(entry("b", b"2", HOUR)).await.unwrap();
        mem.put(entry("c", b"3", HOUR)).await.unwrap();

        assert!(!mem.has(&key("a")).await.unwrap());
        assert!(mem.has(&key("b")).await.unwrap());
        assert!(mem.has(&key("c")).await.unwrap());
        assert_eq!(mem.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_get_refreshes_recency() {
        let mem = backend(2, 0);
        mem.put(entry("a", b"1", HOUR)).await.unwrap();
        mem.put(entry("b", b"2", HOUR)).await.unwrap();
        mem.get(&key("a")).await.unwrap();
        mem.put(entry("c", b"3", HOUR)).await.unwrap();

        assert!(mem.has(&key("a")).await.unwrap());
        assert!(!mem.has(&key("b")).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_does_not_refresh_recency() {
        let mem = backend(2, 0);
        mem.put(entry("a", b"1", HOUR)).await.unwrap();
        mem.put(entry("b", b"2", HOUR)).await.unwrap();
        assert!(mem.has(&key("a")).await.unwrap());
        mem.put(entry("c", b"3", HOUR)).await.unwrap();

        assert!(!mem.has(&key("a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_byte_limit_evicts() {
        let mem = backend(0, 10);
        mem.put(entry("a", b"aaaa", HOUR)).await.unwrap();
        mem.put(entry("b", b"bbbb", HOUR)).await.unwrap();
        mem.put(entry("c", b"cccc", HOUR)).await.unwrap();

        assert!(!mem.has(&key("a")).await.unwrap());
        assert_eq!(mem.len(), 2);
        assert_eq!(mem.size_bytes(), 8);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_skipped() {
        let mem = backend(0, 4);
        mem.put(entry("small", b"ok", HOUR)).await.unwrap();
        mem.put(entry("big", b"too large", HOUR)).await.unwrap();

        assert!(mem.has(&key("small")).await.unwrap());
        assert!(!mem.has(&key("big")).await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_bytes() {
        let mem = backend(10, 0);
        mem.put(entry("a", b"short", HOUR)).await.unwrap();
        mem.put(entry("a", b"much longer", HOUR)).await.unwrap();

        assert_eq!(mem.len(), 1);
        assert_eq!(mem.size_bytes(), 11);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let mem = backend(10, 0);
        mem.put(entry("a", b"1", Duration::from_millis(30))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!mem.has(&key("a")).await.unwrap());
        assert!(mem.get(&key("a")).await.unwrap().is_none());
        assert!(mem.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let mem = backend(0, 0);
        for i in 0..600 {
            mem.put(entry(&format!("short-{}", i), b"x", Duration::from_millis(20)))
                .await
                .unwrap();
        }
        mem.put(entry("keep", b"y", HOUR)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let removed = mem.cleanup_expired().await.unwrap();
        assert_eq!(removed, 600);
        assert_eq!(mem.len(), 1);
        assert!(mem.has(&key("keep")).await.unwrap());
        assert_eq!(mem.size_bytes(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let mem = backend(10, 0);
        mem.put(entry("a", b"1", HOUR)).await.unwrap();
        mem.put(entry("b", b"2", HOUR)).await.unwrap();

        mem.remove(&key("a")).await.unwrap();
        assert!(!mem.has(&key("a")).await.unwrap());
        assert_eq!(mem.len(), 1);

        mem.clear().await.unwrap();
        assert!(mem.is_empty());
        assert_eq!(mem.size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let mem = Arc::new(backend(0, 0));
        let mut handles = vec![];

        for batch in 0..10 {
            let mem = mem.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let text = format!("batch-{}-item-{}", batch, i);
                    mem.put(CacheEntry::new(key(&text), Bytes::from(text.clone()), HOUR))
                        .await
                        .unwrap();
                    assert!(mem.get(&key(&text)).await.unwrap().is_some());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(mem.len(), 100);
    }
}
