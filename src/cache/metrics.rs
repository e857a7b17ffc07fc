//! Cache Metrics Collection
//!
//! Lock-free counters shared by both tiers, the fetch coordinator and the
//! pressure monitor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Memory tier
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    memory_evictions: AtomicU64,
    memory_rejections: AtomicU64,

    // Disk tier
    disk_hits: AtomicU64,
    disk_misses: AtomicU64,
    disk_evictions: AtomicU64,
    disk_expirations: AtomicU64,
    disk_corruptions: AtomicU64,
    disk_write_failures: AtomicU64,
    disk_bytes_written: AtomicU64,

    // Fetch coordinator
    fetch_requests: AtomicU64,
    fetches_started: AtomicU64,
    fetches_coalesced: AtomicU64,
    fetch_failures: AtomicU64,
    decode_failures: AtomicU64,
    prefetches_scheduled: AtomicU64,

    // Pressure monitor
    pressure_signals: AtomicU64,
    pressure_escalations: AtomicU64,

    // Latencies (microseconds, exponential moving average)
    disk_read_latency_us: AtomicU64,
    fetch_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    // Memory tier
    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_miss(&self) {
        self.memory_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_evictions(&self, count: u64) {
        self.memory_evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_memory_rejection(&self) {
        self.memory_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn memory_hits(&self) -> u64 {
        self.memory_hits.load(Ordering::Relaxed)
    }

    pub fn memory_misses(&self) -> u64 {
        self.memory_misses.load(Ordering::Relaxed)
    }

    pub fn memory_evictions(&self) -> u64 {
        self.memory_evictions.load(Ordering::Relaxed)
    }

    // Disk tier
    pub fn record_disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_miss(&self) {
        self.disk_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_evictions(&self, count: u64) {
        self.disk_evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_disk_expirations(&self, count: u64) {
        self.disk_expirations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_disk_corruption(&self) {
        self.disk_corruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_write_failure(&self) {
        self.disk_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_write(&self, bytes: u64) {
        self.disk_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn disk_hits(&self) -> u64 {
        self.disk_hits.load(Ordering::Relaxed)
    }

    pub fn disk_misses(&self) -> u64 {
        self.disk_misses.load(Ordering::Relaxed)
    }

    pub fn disk_corruptions(&self) -> u64 {
        self.disk_corruptions.load(Ordering::Relaxed)
    }

    pub fn disk_write_failures(&self) -> u64 {
        self.disk_write_failures.load(Ordering::Relaxed)
    }

    // Fetch coordinator
    pub fn record_fetch_request(&self) {
        self.fetch_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_started(&self) {
        self.fetches_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_coalesced(&self) {
        self.fetches_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_scheduled(&self, count: u64) {
        self.prefetches_scheduled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn fetches_started(&self) -> u64 {
        self.fetches_started.load(Ordering::Relaxed)
    }

    pub fn fetches_coalesced(&self) -> u64 {
        self.fetches_coalesced.load(Ordering::Relaxed)
    }

    // Pressure monitor
    pub fn record_pressure_signal(&self) {
        self.pressure_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pressure_escalation(&self) {
        self.pressure_escalations.fetch_add(1, Ordering::Relaxed);
    }

    // Latency tracking
    pub fn record_disk_read_latency(&self, duration: Duration) {
        self.update_latency_ema(&self.disk_read_latency_us, duration);
    }

    pub fn record_fetch_latency(&self, duration: Duration) {
        self.update_latency_ema(&self.fetch_latency_us, duration);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn disk_read_latency(&self) -> Duration {
        Duration::from_micros(self.disk_read_latency_us.load(Ordering::Relaxed))
    }

    pub fn fetch_latency(&self) -> Duration {
        Duration::from_micros(self.fetch_latency_us.load(Ordering::Relaxed))
    }

    /// Fraction of lookups served without a fetch
    pub fn overall_hit_ratio(&self) -> f64 {
        let hits = self.memory_hits() + self.disk_hits();
        let lookups = self.memory_hits() + self.memory_misses();
        if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_hits: self.memory_hits(),
            memory_misses: self.memory_misses(),
            memory_evictions: self.memory_evictions(),
            memory_rejections: self.memory_rejections.load(Ordering::Relaxed),

            disk_hits: self.disk_hits(),
            disk_misses: self.disk_misses(),
            disk_evictions: self.disk_evictions.load(Ordering::Relaxed),
            disk_expirations: self.disk_expirations.load(Ordering::Relaxed),
            disk_corruptions: self.disk_corruptions(),
            disk_write_failures: self.disk_write_failures(),
            disk_bytes_written: self.disk_bytes_written.load(Ordering::Relaxed),

            fetch_requests: self.fetch_requests.load(Ordering::Relaxed),
            fetches_started: self.fetches_started(),
            fetches_coalesced: self.fetches_coalesced(),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            prefetches_scheduled: self.prefetches_scheduled.load(Ordering::Relaxed),

            pressure_signals: self.pressure_signals.load(Ordering::Relaxed),
            pressure_escalations: self.pressure_escalations.load(Ordering::Relaxed),

            disk_read_latency_us: self.disk_read_latency().as_micros() as u64,
            fetch_latency_us: self.fetch_latency().as_micros() as u64,
            overall_hit_ratio: self.overall_hit_ratio(),
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub memory_evictions: u64,
    pub memory_rejections: u64,

    pub disk_hits: u64,
    pub disk_misses: u64,
    pub disk_evictions: u64,
    pub disk_expirations: u64,
    pub disk_corruptions: u64,
    pub disk_write_failures: u64,
    pub disk_bytes_written: u64,

    pub fetch_requests: u64,
    pub fetches_started: u64,
    pub fetches_coalesced: u64,
    pub fetch_failures: u64,
    pub decode_failures: u64,
    pub prefetches_scheduled: u64,

    pub pressure_signals: u64,
    pub pressure_escalations: u64,

    pub disk_read_latency_us: u64,
    pub fetch_latency_us: u64,
    pub overall_hit_ratio: f64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
