//! Metrics module
//!
//! Exposes cache counters and gauges in the Prometheus text format. The
//! exporter owns its own registry and is refreshed from the cache on each
//! scrape.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::{CacheStats, MetricsSnapshot};
use crate::error::Result;

const NAMESPACE: &str = "imgtier";

/// Prometheus view of an [`ImageCache`](crate::cache::ImageCache)
pub struct CacheExporter {
    registry: Registry,
    lookups: IntCounterVec,
    evictions: IntCounterVec,
    fetches: IntCounterVec,
    disk_corruptions: IntCounter,
    disk_write_failures: IntCounter,
    pressure_signals: IntCounter,
    pressure_escalations: IntCounter,
    bytes: IntGaugeVec,
    entries: IntGaugeVec,
    in_flight: IntGauge,
    under_pressure: IntGauge,
}

impl CacheExporter {
    /// Create the exporter and register every metric
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let lookups = IntCounterVec::new(
            Opts::new("lookups_total", "Tier lookups by tier and result").namespace(NAMESPACE),
            &["tier", "result"],
        )?;
        let evictions = IntCounterVec::new(
            Opts::new("evictions_total", "Entries evicted or expired by tier").namespace(NAMESPACE),
            &["tier", "reason"],
        )?;
        let fetches = IntCounterVec::new(
            Opts::new("fetches_total", "Fetch requests by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let disk_corruptions = IntCounter::with_opts(
            Opts::new("disk_corruptions_total", "Corrupt disk entries removed").namespace(NAMESPACE),
        )?;
        let disk_write_failures = IntCounter::with_opts(
            Opts::new("disk_write_failures_total", "Disk entries that failed to persist")
                .namespace(NAMESPACE),
        )?;
        let pressure_signals = IntCounter::with_opts(
            Opts::new("pressure_signals_total", "Memory pressure signals handled").namespace(NAMESPACE),
        )?;
        let pressure_escalations = IntCounter::with_opts(
            Opts::new("pressure_escalations_total", "Pressure signals that wiped the disk tier")
                .namespace(NAMESPACE),
        )?;
        let bytes = IntGaugeVec::new(
            Opts::new("tier_bytes", "Bytes resident per tier").namespace(NAMESPACE),
            &["tier"],
        )?;
        let entries = IntGaugeVec::new(
            Opts::new("tier_entries", "Entries resident per tier").namespace(NAMESPACE),
            &["tier"],
        )?;
        let in_flight = IntGauge::with_opts(
            Opts::new("in_flight_fetches", "Fetches currently outstanding").namespace(NAMESPACE),
        )?;
        let under_pressure = IntGauge::with_opts(
            Opts::new("under_pressure", "1 while memory caching is suspended").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(lookups.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(fetches.clone()))?;
        registry.register(Box::new(disk_corruptions.clone()))?;
        registry.register(Box::new(disk_write_failures.clone()))?;
        registry.register(Box::new(pressure_signals.clone()))?;
        registry.register(Box::new(pressure_escalations.clone()))?;
        registry.register(Box::new(bytes.clone()))?;
        registry.register(Box::new(entries.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(under_pressure.clone()))?;

        Ok(Self {
            registry,
            lookups,
            evictions,
            fetches,
            disk_corruptions,
            disk_write_failures,
            pressure_signals,
            pressure_escalations,
            bytes,
            entries,
            in_flight,
            under_pressure,
        })
    }

    /// Bring every metric up to date with the cache
    pub fn refresh(&self, stats: &CacheStats, snapshot: &MetricsSnapshot) {
        let lookup = |tier: &str, result: &str| self.lookups.with_label_values(&[tier, result]);
        advance(&lookup("memory", "hit"), snapshot.memory_hits);
        advance(&lookup("memory", "miss"), snapshot.memory_misses);
        advance(&lookup("disk", "hit"), snapshot.disk_hits);
        advance(&lookup("disk", "miss"), snapshot.disk_misses);

        advance(&self.evictions.with_label_values(&["memory", "capacity"]), snapshot.memory_evictions);
        advance(&self.evictions.with_label_values(&["disk", "capacity"]), snapshot.disk_evictions);
        advance(&self.evictions.with_label_values(&["disk", "expired"]), snapshot.disk_expirations);

        advance(&self.fetches.with_label_values(&["started"]), snapshot.fetches_started);
        advance(&self.fetches.with_label_values(&["coalesced"]), snapshot.fetches_coalesced);
        advance(&self.fetches.with_label_values(&["failed"]), snapshot.fetch_failures);

        advance(&self.disk_corruptions, snapshot.disk_corruptions);
        advance(&self.disk_write_failures, snapshot.disk_write_failures);
        advance(&self.pressure_signals, snapshot.pressure_signals);
        advance(&self.pressure_escalations, snapshot.pressure_escalations);

        self.bytes.with_label_values(&["memory"]).set(stats.memory_bytes as i64);
        self.bytes.with_label_values(&["disk"]).set(stats.disk_bytes as i64);
        self.entries
            .with_label_values(&["memory"])
            .set(stats.memory_entry_count as i64);
        self.entries.with_label_values(&["disk"]).set(stats.disk_entries as i64);
        self.in_flight.set(stats.in_flight_fetches as i64);
        self.under_pressure.set(i64::from(stats.is_under_pressure));
    }

    /// Render the registry in the text exposition format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Counters only move forward; catch up to the cache's running total
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}
