// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Layered audio cache.
//!
//! Tiers are consulted fastest first:
//!
//! ```text
//! get(key) ──► memory ──miss──► sqlite ──miss──► redis ──miss──► None
//!                 ▲               │ hit            │ hit
//!                 └── warm ───────┴────────────────┘
//! ```
//!
//! A hit in a slower tier is copied into every faster tier on a spawned task,
//! keeping the entry's original `created_at` and `ttl` so the copies expire
//! together. Writes go to every tier, each applying its own TTL and eviction.
//!
//! Only the memory tier is infallible. Errors from the others are logged,
//! counted per tier and treated as a miss: the cache never fails a request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::cache_key::CacheKey;
use crate::metrics::LatencyTimer;
use crate::storage::traits::{BackendStats, CacheBackend, CacheEntry};

struct Tier {
    backend: Arc<dyn CacheBackend>,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: Arc<AtomicU64>,
}

impl Tier {
    fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    fn name(&self) -> &'static str {
        self.backend.name()
    }

    fn record_error(&self, operation: &'static str, error: &dyn std::fmt::Display) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_error(self.name(), operation, "backend");
        warn!(tier = self.name(), operation, error = %error, "Cache tier failed, continuing without it");
    }
}

/// A cache hit and the tier that served it.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub payload: Bytes,
    pub tier: &'static str,
}

/// Per-tier counters plus whatever the backend reports about itself.
#[derive(Debug, Clone)]
pub struct TierStats {
    pub name: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    /// `None` when the backend couldn't be queried
    pub backend: Option<BackendStats>,
}

#[derive(Debug, Clone, Default)]
pub struct TieredStats {
    /// Fastest tier first
    pub tiers: Vec<TierStats>,
}

impl TieredStats {
    #[must_use]
    pub fn tier(&self, name: &str) -> Option<&TierStats> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// Lookups answered by any tier.
    #[must_use]
    pub fn total_hits(&self) -> u64 {
        self.tiers.iter().map(|t| t.hits).sum()
    }

    /// Lookups that fell through every tier. Every lookup reaches the first
    /// tier, so full misses are its misses minus the hits further down.
    #[must_use]
    pub fn total_misses(&self) -> u64 {
        let first_misses = self.tiers.first().map_or(0, |t| t.misses);
        let lower_hits: u64 = self.tiers.iter().skip(1).map(|t| t.hits).sum();
        first_misses.saturating_sub(lower_hits)
    }

    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.total_hits();
        let total = hits + self.total_misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Result of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// (tier, entries removed)
    pub removed: Vec<(&'static str, u64)>,
    /// Tiers whose sweep failed
    pub failed: Vec<&'static str>,
}

impl CleanupReport {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.removed.iter().map(|(_, n)| n).sum()
    }
}

/// Ordered set of cache tiers behind one get/put interface.
pub struct TieredCache {
    tiers: Vec<Tier>,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("tiers", &self.tier_names())
            .finish()
    }
}

impl TieredCache {
    /// Cache with a single (fastest) tier.
    pub fn new(first: Arc<dyn CacheBackend>) -> Self {
        Self {
            tiers: vec![Tier::new(first)],
        }
    }

    /// Append a slower tier.
    #[must_use]
    pub fn with_tier(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.tiers.push(Tier::new(backend));
        self
    }

    /// Tier names, fastest first.
    #[must_use]
    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(Tier::name).collect()
    }

    /// Payload for `key`, or `None` on a miss in every tier.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.lookup(key).await.map(|hit| hit.payload)
    }

    /// Like [`get`](Self::get), also reporting which tier answered.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheHit> {
        for (index, tier) in self.tiers.iter().enumerate() {
            let result = {
                let _timer = LatencyTimer::new(tier.name(), "get");
                tier.backend.get(key).await
            };

            match result {
                Ok(Some(entry)) => {
                    tier.hits.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_lookup(tier.name(), "hit");
                    debug!(tier = tier.name(), key = %key, "Cache hit");
                    if index > 0 {
                        self.warm(index, entry.clone());
                    }
                    return Some(CacheHit {
                        payload: entry.payload,
                        tier: tier.name(),
                    });
                }
                Ok(None) => {
                    tier.misses.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_lookup(tier.name(), "miss");
                }
                Err(e) => {
                    tier.misses.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_lookup(tier.name(), "error");
                    tier.record_error("get", &e);
                }
            }
        }
        debug!(key = %key, "Cache miss in every tier");
        None
    }

    /// Copy `entry` into every tier faster than `hit_index`, off the request
    /// path.
    fn warm(&self, hit_index: usize, entry: CacheEntry) {
        let targets: Vec<(Arc<dyn CacheBackend>, Arc<AtomicU64>)> = self.tiers[..hit_index]
            .iter()
            .map(|t| (t.backend.clone(), t.errors.clone()))
            .collect();

        tokio::spawn(async move {
            for (backend, errors) in targets {
                match backend.put(entry.clone()).await {
                    Ok(()) => {
                        crate::metrics::record_warm(backend.name());
                        debug!(tier = backend.name(), key = %entry.key, "Warmed faster tier");
                    }
                    Err(e) => {
                        errors.fetch_add(1, Ordering::Relaxed);
                        crate::metrics::record_error(backend.name(), "warm", "backend");
                        warn!(tier = backend.name(), error = %e, "Failed to warm cache tier");
                    }
                }
            }
        });
    }

    /// Store `payload` in every tier, each with its own default TTL.
    pub async fn put(&self, key: &CacheKey, payload: Bytes) {
        for tier in &self.tiers {
            let entry = CacheEntry::new(key.clone(), payload.clone(), tier.backend.config().default_ttl);
            let _timer = LatencyTimer::new(tier.name(), "put");
            if let Err(e) = tier.backend.put(entry).await {
                tier.record_error("put", &e);
            }
        }
        crate::metrics::record_bytes_written(payload.len());
    }

    /// Whether any tier holds a live entry. Never an LRU access.
    pub async fn has(&self, key: &CacheKey) -> bool {
        for tier in &self.tiers {
            match tier.backend.has(key).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => tier.record_error("has", &e),
            }
        }
        false
    }

    pub async fn remove(&self, key: &CacheKey) {
        for tier in &self.tiers {
            if let Err(e) = tier.backend.remove(key).await {
                tier.record_error("remove", &e);
            }
        }
    }

    pub async fn clear(&self) {
        for tier in &self.tiers {
            if let Err(e) = tier.backend.clear().await {
                tier.record_error("clear", &e);
            }
        }
    }

    /// Sweep expired entries from every tier.
    pub async fn cleanup_expired(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for tier in &self.tiers {
            match tier.backend.cleanup_expired().await {
                Ok(removed) => {
                    crate::metrics::record_expired(tier.name(), removed);
                    report.removed.push((tier.name(), removed));
                }
                Err(e) => {
                    tier.record_error("cleanup", &e);
                    report.failed.push(tier.name());
                }
            }
        }
        report
    }

    pub async fn stats(&self) -> TieredStats {
        let mut stats = TieredStats::default();
        for tier in &self.tiers {
            let backend = match tier.backend.stats().await {
                Ok(s) => {
                    crate::metrics::set_tier_size(tier.name(), s.entries, s.size_bytes);
                    Some(s)
                }
                Err(e) => {
                    tier.record_error("stats", &e);
                    None
                }
            };
            stats.tiers.push(TierStats {
                name: tier.name(),
                hits: tier.hits.load(Ordering::Relaxed),
                misses: tier.misses.load(Ordering::Relaxed),
                errors: tier.errors.load(Ordering::Relaxed),
                backend,
            });
        }
        stats
    }
}
