//! Memory Tier - RAM-resident LRU
//!
//! Bounded by both a byte budget and an entry count. Eviction is strict LRU:
//! a read refreshes recency, and inserting past either bound drops the least
//! recently used entries until the new one fits.
//!
//! While the host reports memory pressure, inserts are refused so the tier
//! stays empty after a purge; reads keep working.

use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::entry::CacheEntry;
use super::key::CacheKey;
use super::metrics::CacheMetrics;
use super::pressure::PressureState;
use super::{DEFAULT_MEMORY_MAX_BYTES, DEFAULT_MEMORY_MAX_COUNT};

/// Memory tier configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTierConfig {
    /// Maximum total payload bytes
    pub max_bytes: u64,
    /// Maximum number of entries
    pub max_count: usize,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MEMORY_MAX_BYTES,
            max_count: DEFAULT_MEMORY_MAX_COUNT,
        }
    }
}

struct Inner {
    entries: LruCache<CacheKey, CacheEntry>,
    size: u64,
}

/// Memory tier - RAM-based LRU cache
pub struct MemoryTier {
    inner: Mutex<Inner>,
    config: MemoryTierConfig,
    pressure: Arc<PressureState>,
    metrics: Arc<CacheMetrics>,
}

impl MemoryTier {
    /// Create a standalone tier with its own pressure state and metrics
    pub fn with_config(config: MemoryTierConfig) -> Self {
        Self::new(
            config,
            Arc::new(PressureState::new()),
            Arc::new(CacheMetrics::new()),
        )
    }

    /// Create a tier wired to shared pressure state and metrics
    pub fn new(
        config: MemoryTierConfig,
        pressure: Arc<PressureState>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                // Bounds are enforced by `put`, so the LRU itself never drops entries.
                entries: LruCache::unbounded(),
                size: 0,
            }),
            config,
            pressure,
            metrics,
        }
    }

    /// Look up a payload, refreshing its recency on hit
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.record_access();
                self.metrics.record_memory_hit();
                Some(entry.payload().clone())
            }
            None => {
                self.metrics.record_memory_miss();
                None
            }
        }
    }

    /// Insert a payload costed at its length.
    ///
    /// Returns `false` when the tier declined the insert.
    pub fn put(&self, key: CacheKey, payload: Bytes) -> bool {
        self.put_entry(key, CacheEntry::new(payload))
    }

    /// Insert a payload with an explicit cost
    pub fn put_with_cost(&self, key: CacheKey, payload: Bytes, cost: u64) -> bool {
        self.put_entry(key, CacheEntry::with_cost(payload, cost))
    }

    fn put_entry(&self, key: CacheKey, entry: CacheEntry) -> bool {
        if self.pressure.is_under_pressure() {
            trace!(key = ?key, "Memory tier insert skipped under pressure");
            self.metrics.record_memory_rejection();
            return false;
        }

        let cost = entry.cost();
        if cost > self.config.max_bytes || self.config.max_count == 0 {
            debug!(
                key = ?key,
                cost,
                max_bytes = self.config.max_bytes,
                "Payload exceeds memory tier budget, not cached"
            );
            self.metrics.record_memory_rejection();
            // Never keep serving the bytes this payload replaces
            self.remove(&key);
            return false;
        }

        let mut inner = self.inner.lock();

        // A signal may have purged the tier since the check above
        if self.pressure.is_under_pressure() {
            trace!(key = ?key, "Memory tier insert skipped under pressure");
            self.metrics.record_memory_rejection();
            return false;
        }

        if let Some(old) = inner.entries.pop(&key) {
            inner.size -= old.cost();
        }

        let mut evicted = 0u64;
        while inner.size + cost > self.config.max_bytes
            || inner.entries.len() >= self.config.max_count
        {
            match inner.entries.pop_lru() {
                Some((_, victim)) => {
                    inner.size -= victim.cost();
                    evicted += 1;
                }
                None => break,
            }
        }

        inner.entries.put(key, entry);
        inner.size += cost;
        drop(inner);

        if evicted > 0 {
            trace!(evicted, "Memory tier evicted LRU entries");
            self.metrics.record_memory_evictions(evicted);
        }
        true
    }

    /// Remove an entry, returning its payload if present
    pub fn remove(&self, key: &CacheKey) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.pop(key)?;
        inner.size -= entry.cost();
        Some(entry.into_payload())
    }

    /// Drop every entry, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.size = 0;
        removed
    }

    /// Check for a key without touching recency
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if the tier holds nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total cost of resident entries
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Get configuration
    pub fn config(&self) -> &MemoryTierConfig {
        &self.config
    }

    /// Get tier statistics
    pub fn stats(&self) -> MemoryTierStats {
        let inner = self.inner.lock();
        MemoryTierStats {
            entries: inner.entries.len(),
            size: inner.size,
            max_bytes: self.config.max_bytes,
            max_count: self.config.max_count,
            utilization: if self.config.max_bytes == 0 {
                0.0
            } else {
                inner.size as f64 / self.config.max_bytes as f64
            },
        }
    }
}

/// Memory tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct MemoryTierStats {
    pub entries: usize,
    pub size: u64,
    pub max_bytes: u64,
    pub max_count: usize,
    pub utilization: f64,
}

// =============================================================================
// Tests
// =============================================================================
