//! Speculative prefetching.
//!
//! Schedules low-priority fetches for locators that are not already cached
//! or being fetched. Results only land in the tiers; callers never see them.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::disk::DiskTier;
use super::fetch::{FetchCoordinator, FetchPriority};
use super::key::derive_key;
use super::memory::MemoryTier;
use super::metrics::CacheMetrics;

/// Warms the cache in the background
#[derive(Clone)]
pub struct Prefetcher {
    coordinator: FetchCoordinator,
    memory: Arc<MemoryTier>,
    disk: Arc<DiskTier>,
    metrics: Arc<CacheMetrics>,
}

impl Prefetcher {
    pub fn new(
        coordinator: FetchCoordinator,
        memory: Arc<MemoryTier>,
        disk: Arc<DiskTier>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            coordinator,
            memory,
            disk,
            metrics,
        }
    }

    /// Schedule fetches for every locator that is not already resident or
    /// in flight. Empty and repeated locators are skipped.
    pub fn prefetch<I, S>(&self, locators: I) -> PrefetchBatch
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut handles = Vec::new();

        for locator in locators {
            let locator = locator.as_ref();
            if locator.is_empty() {
                continue;
            }
            let key = derive_key(locator);
            if !seen.insert(key) {
                continue;
            }
            if self.memory.contains(&key) || self.disk.contains(&key) || self.coordinator.is_in_flight(&key) {
                trace!(key = ?key, "Prefetch skipped, already available");
                continue;
            }

            let coordinator = self.coordinator.clone();
            let locator = locator.to_string();
            handles.push(tokio::spawn(async move {
                // Failures are logged by the coordinator
                let _ = coordinator.request(key, &locator, FetchPriority::Low).await;
            }));
        }

        if !handles.is_empty() {
            self.metrics.record_prefetch_scheduled(handles.len() as u64);
            debug!(scheduled = handles.len(), "Prefetch scheduled");
        }
        PrefetchBatch { handles }
    }
}

/// Fetches scheduled by one prefetch call
#[must_use = "dropping the batch does not cancel it; call `scheduled` or `settled`"]
pub struct PrefetchBatch {
    handles: Vec<JoinHandle<()>>,
}

impl PrefetchBatch {
    /// Number of fetches scheduled
    pub fn scheduled(&self) -> usize {
        self.handles.len()
    }

    /// Wait until every scheduled fetch has finished
    pub async fn settled(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::disk::DiskTierConfig;
    use crate::cache::fetch::{FetchConfig, FetchOutcome, FetchRequest, Fetcher};
    use crate::cache::memory::MemoryTierConfig;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[derive(Default)]
    struct RecordingFetcher {
        requests: Mutex<Vec<FetchRequest>>,
    }

    #[async_trait]
    impl Fetcher for RecordingFetcher {
        async fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
            self.requests.lock().push(request.clone());
            Ok(Bytes::from_static(PNG))
        }
    }

    async fn setup() -> (TempDir, Arc<RecordingFetcher>, Prefetcher, Arc<MemoryTier>, Arc<DiskTier>) {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(RecordingFetcher::default());
        let metrics = Arc::new(CacheMetrics::new());
        let memory = Arc::new(MemoryTier::with_config(MemoryTierConfig::default()));
        let disk = Arc::new(DiskTier::open(DiskTierConfig::at(dir.path())).await.unwrap());
        let coordinator = FetchCoordinator::new(
            fetcher.clone(),
            Arc::clone(&memory),
            Arc::clone(&disk),
            FetchConfig::default(),
            Arc::clone(&metrics),
        );
        let prefetcher = Prefetcher::new(coordinator, Arc::clone(&memory), Arc::clone(&disk), metrics);
        (dir, fetcher, prefetcher, memory, disk)
    }

    #[tokio::test]
    async fn test_prefetch_skips_resident_and_duplicates() {
        let (_dir, fetcher, prefetcher, memory, disk) = setup().await;
        memory.put(derive_key("in-memory"), Bytes::from_static(PNG));
        disk.store(derive_key("on-disk"), Bytes::from_static(PNG)).await;

        let batch = prefetcher.prefetch(["in-memory", "on-disk", "new-1", "new-2", "new-1", ""]);
        assert_eq!(batch.scheduled(), 2);
        batch.settled().await;

        let requests = fetcher.requests.lock();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.priority == FetchPriority::Low));
        assert!(memory.contains(&derive_key("new-1")));
        assert!(disk.contains(&derive_key("new-2")));
    }

    #[tokio::test]
    async fn test_prefetch_empty_list() {
        let (_dir, fetcher, prefetcher, _, _) = setup().await;
        let batch = prefetcher.prefetch(Vec::<String>::new());
        assert_eq!(batch.scheduled(), 0);
        batch.settled().await;
        assert!(fetcher.requests.lock().is_empty());
    }
}
