//! Image Cache - Unified Two-Tier Facade
//!
//! Orchestrates the memory tier, the disk tier and the fetch coordinator.
//! Lookups fall through memory, then disk (promoting hits back into
//! memory), then a coalesced fetch that writes through to both tiers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::disk::{DiskTier, DiskTierConfig, EvictionResult};
use super::fetch::{FetchConfig, FetchCoordinator, FetchPriority, Fetcher};
use super::key::{derive_key, CacheKey};
use super::limiter::LimiterStats;
use super::memory::{MemoryTier, MemoryTierConfig};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::prefetch::{PrefetchBatch, Prefetcher};
use super::pressure::{
    PressureConfig, PressureMonitor, PressureNotifier, PressureResponse, PressureSignal,
    PressureSnapshot, PressureState, PressureSubscription,
};
use super::sizing::{budget_for, MemoryProbe, TierBudget};
use crate::error::{Error, Result};

/// Where a lookup was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Memory,
    Disk,
    Network,
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheSource::Memory => write!(f, "memory"),
            CacheSource::Disk => write!(f, "disk"),
            CacheSource::Network => write!(f, "network"),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory: MemoryTierConfig,
    pub disk: DiskTierConfig,
    pub fetch: FetchConfig,
    pub pressure: PressureConfig,
}

impl CacheConfig {
    /// Defaults with tier budgets sized to the device's memory
    pub fn adaptive(probe: &dyn MemoryProbe) -> Self {
        let total = probe.total_memory_bytes();
        let budget = budget_for(total);
        debug!(total_memory = ?total, ?budget, "Selected adaptive tier budget");

        let mut config = Self::default();
        config.apply_budget(budget);
        config
    }

    /// Overwrite tier budgets
    pub fn apply_budget(&mut self, budget: TierBudget) {
        self.memory.max_bytes = budget.memory_max_bytes;
        self.memory.max_count = budget.memory_max_count;
        self.disk.max_bytes = budget.disk_max_bytes;
    }

    /// Parse YAML; missing fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a YAML file
    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml_str(&contents)
    }

    /// Reject settings the tiers cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.disk.max_bytes == 0 {
            return Err(Error::Config("disk.max_bytes must be greater than 0".into()));
        }
        if !(self.disk.eviction_target_ratio > 0.0 && self.disk.eviction_target_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "disk.eviction_target_ratio must be within (0, 1], got {}",
                self.disk.eviction_target_ratio
            )));
        }
        let f = &self.fetch;
        if f.low_concurrency == 0 {
            return Err(Error::Config("fetch.low_concurrency must be at least 1".into()));
        }
        if f.normal_concurrency < f.low_concurrency
            || f.high_concurrency < f.normal_concurrency
            || f.immediate_concurrency < f.high_concurrency
        {
            return Err(Error::Config(
                "fetch concurrency must not decrease with priority".into(),
            ));
        }
        Ok(())
    }
}

/// Cache lookup result
#[derive(Debug, Clone)]
pub struct CacheResult {
    pub payload: Bytes,
    pub source: CacheSource,
    pub latency: Duration,
}

/// Outcome of [`ImageCache::clear_all`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClearResult {
    pub memory_entries: usize,
    pub disk_entries: usize,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub disk_bytes: u64,
    pub disk_budget: u64,
    pub disk_entries: usize,
    pub memory_entry_count: usize,
    pub memory_bytes: u64,
    pub memory_budget: u64,
    pub in_flight_fetches: usize,
    pub is_under_pressure: bool,
    pub pressure: PressureSnapshot,
    pub limiter: LimiterStats,
    pub collected_at: DateTime<Utc>,
}

/// Two-tier image cache
pub struct ImageCache {
    memory: Arc<MemoryTier>,
    disk: Arc<DiskTier>,
    coordinator: FetchCoordinator,
    prefetcher: Prefetcher,
    pressure: PressureMonitor,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,
}

impl ImageCache {
    /// Open the cache, creating or rescanning the disk directory
    pub async fn open(config: CacheConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(CacheMetrics::new());
        let state = Arc::new(PressureState::new());

        let memory = Arc::new(MemoryTier::new(
            config.memory.clone(),
            Arc::clone(&state),
            Arc::clone(&metrics),
        ));
        let disk = Arc::new(DiskTier::open_with_metrics(config.disk.clone(), Arc::clone(&metrics)).await?);

        let coordinator = FetchCoordinator::new(
            fetcher,
            Arc::clone(&memory),
            Arc::clone(&disk),
            config.fetch.clone(),
            Arc::clone(&metrics),
        );
        let prefetcher = Prefetcher::new(
            coordinator.clone(),
            Arc::clone(&memory),
            Arc::clone(&disk),
            Arc::clone(&metrics),
        );
        let pressure = PressureMonitor::new(
            state,
            Arc::clone(&memory),
            Arc::clone(&disk),
            config.pressure.clone(),
            Arc::clone(&metrics),
        );

        info!(
            memory_max_bytes = config.memory.max_bytes,
            memory_max_count = config.memory.max_count,
            disk_root = %config.disk.root.display(),
            disk_max_bytes = config.disk.max_bytes,
            "Image cache ready"
        );

        Ok(Self {
            memory,
            disk,
            coordinator,
            prefetcher,
            pressure,
            config,
            metrics,
        })
    }

    fn key_for(locator: &str) -> Result<CacheKey> {
        if locator.is_empty() {
            return Err(Error::InvalidLocator("locator is empty".into()));
        }
        Ok(derive_key(locator))
    }

    /// Look up a payload, reporting which tier served it
    pub async fn lookup(&self, locator: &str, priority: FetchPriority) -> Result<CacheResult> {
        let key = Self::key_for(locator)?;
        let tracker = LatencyTracker::start();

        if let Some(payload) = self.memory.get(&key) {
            return Ok(CacheResult {
                payload,
                source: CacheSource::Memory,
                latency: tracker.elapsed(),
            });
        }

        if let Some(payload) = self.disk.load(&key).await {
            self.memory.put(key, payload.clone());
            return Ok(CacheResult {
                payload,
                source: CacheSource::Disk,
                latency: tracker.elapsed(),
            });
        }

        let payload = self.coordinator.request(key, locator, priority).await?;
        Ok(CacheResult {
            payload,
            source: CacheSource::Network,
            latency: tracker.elapsed(),
        })
    }

    /// Get a payload from the nearest tier, fetching on a full miss
    pub async fn get(&self, locator: &str, priority: FetchPriority) -> Result<Bytes> {
        self.lookup(locator, priority).await.map(|r| r.payload)
    }

    /// Insert a payload directly into both tiers
    pub async fn put(&self, locator: &str, payload: Bytes) -> Result<()> {
        let key = Self::key_for(locator)?;
        self.memory.put(key, payload.clone());
        self.disk.store(key, payload).await;
        Ok(())
    }

    /// Remove a locator from both tiers; returns whether anything was removed
    pub async fn invalidate(&self, locator: &str) -> Result<bool> {
        let key = Self::key_for(locator)?;
        let in_memory = self.memory.remove(&key).is_some();
        let on_disk = self.disk.remove(&key).await;
        Ok(in_memory || on_disk)
    }

    /// Empty both tiers
    pub async fn clear_all(&self) -> ClearResult {
        let result = ClearResult {
            memory_entries: self.memory.clear(),
            disk_entries: self.disk.clear().await,
        };
        info!(
            memory_entries = result.memory_entries,
            disk_entries = result.disk_entries,
            "Image cache cleared"
        );
        result
    }

    /// Warm the cache for upcoming locators at low priority
    pub fn prefetch<I, S>(&self, locators: I) -> PrefetchBatch
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.prefetcher.prefetch(locators)
    }

    /// Handle a host memory pressure signal
    pub async fn on_pressure_signal(&self) -> PressureResponse {
        self.pressure.on_pressure_signal().await
    }

    /// Route a stream of host pressure signals into the cache
    pub fn subscribe_pressure<S>(&self, signals: S) -> PressureSubscription
    where
        S: Stream<Item = PressureSignal> + Send + 'static,
    {
        self.pressure.subscribe(signals)
    }

    /// Subscribe a channel the host can raise signals through
    pub fn pressure_channel(&self) -> (PressureNotifier, PressureSubscription) {
        self.pressure.subscribe_channel()
    }

    /// Remove disk entries idle longer than the configured age
    pub async fn sweep_expired(&self) -> EvictionResult {
        self.disk.sweep_expired(self.config.disk.max_age()).await
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        let pressure = self.pressure.state().snapshot();
        CacheStats {
            disk_bytes: self.disk.current_size(),
            disk_budget: self.disk.max_bytes(),
            disk_entries: self.disk.entry_count(),
            memory_entry_count: self.memory.len(),
            memory_bytes: self.memory.size(),
            memory_budget: self.config.memory.max_bytes,
            in_flight_fetches: self.coordinator.in_flight_count(),
            is_under_pressure: pressure.under_pressure,
            pressure,
            limiter: self.coordinator.limiter_stats(),
            collected_at: Utc::now(),
        }
    }

    /// Counter snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn memory(&self) -> &Arc<MemoryTier> {
        &self.memory
    }

    pub fn disk(&self) -> &Arc<DiskTier> {
        &self.disk
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    pub fn pressure(&self) -> &PressureMonitor {
        &self.pressure
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fetch::{FetchOutcome, FetchRequest};
    use crate::cache::sizing::FixedMemoryProbe;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, _request: &FetchRequest) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(PNG))
        }
    }

    async fn open(dir: &TempDir) -> (ImageCache, Arc<CountingFetcher>) {
        let fetcher = Arc::new(CountingFetcher::default());
        let config = CacheConfig {
            disk: DiskTierConfig::at(dir.path()),
            ..Default::default()
        };
        let cache = ImageCache::open(config, fetcher.clone()).await.unwrap();
        (cache, fetcher)
    }

    #[tokio::test]
    async fn test_lookup_falls_through_tiers() {
        let dir = TempDir::new().unwrap();
        let (cache, fetcher) = open(&dir).await;

        let first = cache.lookup("a.png", FetchPriority::Normal).await.unwrap();
        assert_eq!(first.source, CacheSource::Network);

        let second = cache.lookup("a.png", FetchPriority::Normal).await.unwrap();
        assert_eq!(second.source, CacheSource::Memory);

        cache.memory().clear();
        let third = cache.lookup("a.png", FetchPriority::Normal).await.unwrap();
        assert_eq!(third.source, CacheSource::Disk);
        // Disk hit promoted back into memory
        assert!(cache.memory().contains(&derive_key("a.png")));

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_locator_rejected() {
        let dir = TempDir::new().unwrap();
        let (cache, fetcher) = open(&dir).await;
        assert_matches!(
            cache.get("", FetchPriority::High).await,
            Err(Error::InvalidLocator(_))
        );
        assert_matches!(cache.invalidate("").await, Err(Error::InvalidLocator(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_put_invalidate_clear() {
        let dir = TempDir::new().unwrap();
        let (cache, fetcher) = open(&dir).await;

        cache.put("manual", Bytes::from_static(PNG)).await.unwrap();
        assert_eq!(
            cache.get("manual", FetchPriority::Low).await.unwrap(),
            Bytes::from_static(PNG)
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

        assert!(cache.invalidate("manual").await.unwrap());
        assert!(!cache.invalidate("manual").await.unwrap());

        cache.put("x", Bytes::from_static(PNG)).await.unwrap();
        let cleared = cache.clear_all().await;
        assert_eq!(cleared.memory_entries, 1);
        assert_eq!(cleared.disk_entries, 1);

        let stats = cache.stats();
        assert_eq!(stats.disk_bytes, 0);
        assert_eq!(stats.memory_entry_count, 0);
    }

    #[tokio::test]
    async fn test_stats_report_pressure() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = open(&dir).await;
        cache.put("p", Bytes::from_static(PNG)).await.unwrap();

        cache.on_pressure_signal().await;
        let stats = cache.stats();
        assert!(stats.is_under_pressure);
        assert_eq!(stats.memory_entry_count, 0);
        assert_eq!(stats.disk_entries, 1);
        assert_eq!(stats.pressure.consecutive_warnings, 1);
    }

    #[test]
    fn test_config_yaml_defaults_and_overrides() {
        let config = CacheConfig::from_yaml_str(
            r#"
memory:
  max_bytes: 1048576
disk:
  root: /var/cache/imgtier
fetch:
  validate_payloads: false
"#,
        )
        .unwrap();

        assert_eq!(config.memory.max_bytes, 1_048_576);
        assert_eq!(config.memory.max_count, MemoryTierConfig::default().max_count);
        assert_eq!(config.disk.root, Path::new("/var/cache/imgtier"));
        assert!(!config.fetch.validate_payloads);
        assert_eq!(config.pressure.cooldown_secs, 60);
    }

    #[test]
    fn test_config_validation() {
        assert_matches!(
            CacheConfig::from_yaml_str("fetch:\n  low_concurrency: 0\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheConfig::from_yaml_str("fetch:\n  low_concurrency: 5\n  normal_concurrency: 2\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheConfig::from_yaml_str("disk:\n  eviction_target_ratio: 0\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheConfig::from_yaml_str("memory: [not, a, map]"),
            Err(Error::ConfigParse(_))
        );
    }

    #[test]
    fn test_adaptive_config() {
        let small = CacheConfig::adaptive(&FixedMemoryProbe(1 << 30));
        let large = CacheConfig::adaptive(&FixedMemoryProbe(16 << 30));
        assert!(small.memory.max_bytes < large.memory.max_bytes);
        assert!(small.disk.max_bytes < large.disk.max_bytes);
    }
}
