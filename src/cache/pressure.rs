//! Memory pressure handling.
//!
//! The host signals pressure; the monitor answers by dropping the memory
//! tier and refusing new memory inserts until a cooldown elapses. Repeated
//! signals escalate to wiping the disk tier as well.
//!
//! ```text
//! signal ──► warnings += 1 ──► under_pressure = true ──► memory.clear()
//!                 │
//!                 └── warnings > threshold ──► disk.clear(), warnings = 0
//!
//! each signal (re)arms the cooldown timer:
//!   cooldown elapsed ──► under_pressure = false, warnings = 0
//! ```
//!
//! [`PressureState`] is written only by the monitor. Tiers hold a shared
//! reference and read it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::disk::DiskTier;
use super::memory::MemoryTier;
use super::metrics::CacheMetrics;

/// Pressure monitor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Quiet period after the last signal before pressure ends
    pub cooldown_secs: u64,
    /// Consecutive warnings tolerated before the disk tier is wiped too
    pub escalation_threshold: u32,
    /// Poll the host's memory statistics (Linux only)
    pub watch_system_memory: bool,
    /// Poll interval for the system memory watcher
    pub poll_interval_secs: u64,
    /// Available/total ratio below which the watcher raises a signal
    pub available_ratio_threshold_percent: u8,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            escalation_threshold: 2,
            watch_system_memory: false,
            poll_interval_secs: 10,
            available_ratio_threshold_percent: 10,
        }
    }
}

impl PressureConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

// =============================================================================
// Shared state
// =============================================================================

/// Pressure flags shared between the monitor and the tiers
#[derive(Debug, Default)]
pub struct PressureState {
    under_pressure: AtomicBool,
    consecutive_warnings: AtomicU32,
    /// Bumped on every signal; a cooldown only ends pressure for its own generation
    generation: AtomicU64,
    cooldown_deadline: Mutex<Option<Instant>>,
    last_signal_at: Mutex<Option<DateTime<Utc>>>,
}

impl PressureState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if new memory inserts are currently refused
    #[inline]
    pub fn is_under_pressure(&self) -> bool {
        self.under_pressure.load(Ordering::Acquire)
    }

    /// Signals received since the last reset
    pub fn consecutive_warnings(&self) -> u32 {
        self.consecutive_warnings.load(Ordering::Acquire)
    }

    /// When the current cooldown ends, if one is running
    pub fn cooldown_deadline(&self) -> Option<Instant> {
        *self.cooldown_deadline.lock()
    }

    pub fn snapshot(&self) -> PressureSnapshot {
        PressureSnapshot {
            under_pressure: self.is_under_pressure(),
            consecutive_warnings: self.consecutive_warnings(),
            cooldown_remaining_ms: self
                .cooldown_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64),
            last_signal_at: *self.last_signal_at.lock(),
        }
    }

    /// Register a signal, returning the new warning count and generation
    pub(crate) fn record_signal(&self, cooldown: Duration) -> (u32, u64) {
        let warnings = self.consecutive_warnings.fetch_add(1, Ordering::AcqRel) + 1;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.under_pressure.store(true, Ordering::Release);
        *self.cooldown_deadline.lock() = Some(Instant::now() + cooldown);
        *self.last_signal_at.lock() = Some(Utc::now());
        (warnings, generation)
    }

    pub(crate) fn reset_warnings(&self) {
        self.consecutive_warnings.store(0, Ordering::Release);
    }

    /// End pressure if no signal arrived since `generation`
    pub(crate) fn end_cooldown(&self, generation: u64) -> bool {
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.under_pressure.store(false, Ordering::Release);
        self.consecutive_warnings.store(0, Ordering::Release);
        *self.cooldown_deadline.lock() = None;
        true
    }
}

/// Point-in-time view of pressure state
#[derive(Debug, Clone, Serialize)]
pub struct PressureSnapshot {
    pub under_pressure: bool,
    pub consecutive_warnings: u32,
    pub cooldown_remaining_ms: Option<u64>,
    pub last_signal_at: Option<DateTime<Utc>>,
}

/// A pressure notification from the host
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PressureSignal {
    /// Available/total memory ratio at the time of the signal, if known
    pub available_ratio: Option<f64>,
}

/// What the monitor did in response to a signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PressureResponse {
    /// Warning count after this signal (before any escalation reset)
    pub consecutive_warnings: u32,
    pub memory_entries_purged: usize,
    /// Set when the signal escalated to a disk wipe
    pub disk_entries_purged: Option<usize>,
}

impl PressureResponse {
    pub fn escalated(&self) -> bool {
        self.disk_entries_purged.is_some()
    }
}

// =============================================================================
// Monitor
// =============================================================================

struct MonitorInner {
    state: Arc<PressureState>,
    memory: Arc<MemoryTier>,
    disk: Arc<DiskTier>,
    config: PressureConfig,
    metrics: Arc<CacheMetrics>,
    cooldown_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        if let Some(task) = self.cooldown_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Reacts to host memory pressure signals
#[derive(Clone)]
pub struct PressureMonitor {
    inner: Arc<MonitorInner>,
}

impl PressureMonitor {
    pub fn new(
        state: Arc<PressureState>,
        memory: Arc<MemoryTier>,
        disk: Arc<DiskTier>,
        config: PressureConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                state,
                memory,
                disk,
                config,
                metrics,
                cooldown_task: Mutex::new(None),
            }),
        }
    }

    /// Shared pressure state
    pub fn state(&self) -> &Arc<PressureState> {
        &self.inner.state
    }

    pub fn config(&self) -> &PressureConfig {
        &self.inner.config
    }

    /// Handle one pressure signal
    pub async fn on_pressure_signal(&self) -> PressureResponse {
        let inner = &self.inner;
        let (warnings, generation) = inner.state.record_signal(inner.config.cooldown());
        inner.metrics.record_pressure_signal();

        let memory_entries_purged = inner.memory.clear();
        warn!(
            consecutive_warnings = warnings,
            purged = memory_entries_purged,
            "Memory pressure signal, memory tier purged"
        );

        let disk_entries_purged = if warnings > inner.config.escalation_threshold {
            inner.state.reset_warnings();
            inner.metrics.record_pressure_escalation();
            let removed = inner.disk.clear().await;
            warn!(
                consecutive_warnings = warnings,
                purged = removed,
                "Repeated memory pressure, disk tier purged"
            );
            Some(removed)
        } else {
            None
        };

        self.arm_cooldown(generation);

        PressureResponse {
            consecutive_warnings: warnings,
            memory_entries_purged,
            disk_entries_purged,
        }
    }

    fn arm_cooldown(&self, generation: u64) {
        let state = Arc::clone(&self.inner.state);
        let cooldown = self.inner.config.cooldown();

        let task = tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            if state.end_cooldown(generation) {
                info!("Memory pressure cooldown elapsed, caching resumed");
            }
        });

        if let Some(previous) = self.inner.cooldown_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Forward every item of `signals` to [`on_pressure_signal`](Self::on_pressure_signal)
    /// until the stream ends or the subscription is dropped.
    pub fn subscribe<S>(&self, signals: S) -> PressureSubscription
    where
        S: Stream<Item = PressureSignal> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let monitor = self.clone();

        let task = tokio::spawn(async move {
            let mut signals = Box::pin(signals);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = signals.next() => match next {
                        Some(signal) => {
                            debug!(available_ratio = ?signal.available_ratio, "Pressure signal received");
                            monitor.on_pressure_signal().await;
                        }
                        None => break,
                    },
                }
            }
            debug!("Pressure subscription ended");
        });

        PressureSubscription {
            cancel,
            task: Some(task),
        }
    }

    /// Subscribe to a channel; signals are raised through the returned notifier
    pub fn subscribe_channel(&self) -> (PressureNotifier, PressureSubscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let signals = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|signal| (signal, rx))
        });
        (PressureNotifier { tx }, self.subscribe(signals))
    }
}

/// Raises pressure signals into a channel subscription
#[derive(Clone)]
pub struct PressureNotifier {
    tx: mpsc::UnboundedSender<PressureSignal>,
}

impl PressureNotifier {
    /// Raise a signal; returns `false` once the subscription is gone
    pub fn notify(&self, signal: PressureSignal) -> bool {
        self.tx.send(signal).is_ok()
    }
}

/// Registration with a pressure source; unregisters on drop
pub struct PressureSubscription {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PressureSubscription {
    /// Check if the subscription is still forwarding signals
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Unregister and wait for the forwarding task to stop
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PressureSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::disk::DiskTierConfig;
    use crate::cache::key::derive_key;
    use crate::cache::memory::MemoryTierConfig;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        memory: Arc<MemoryTier>,
        disk: Arc<DiskTier>,
        monitor: PressureMonitor,
    }

    async fn harness(config: PressureConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let state = Arc::new(PressureState::new());
        let metrics = Arc::new(CacheMetrics::new());
        let memory = Arc::new(MemoryTier::new(
            MemoryTierConfig::default(),
            Arc::clone(&state),
            Arc::clone(&metrics),
        ));
        let disk = Arc::new(
            DiskTier::open_with_metrics(DiskTierConfig::at(dir.path()), Arc::clone(&metrics))
                .await
                .unwrap(),
        );
        let monitor = PressureMonitor::new(
            state,
            Arc::clone(&memory),
            Arc::clone(&disk),
            config,
            metrics,
        );
        Harness {
            _dir: dir,
            memory,
            disk,
            monitor,
        }
    }

    async fn populate(h: &Harness) {
        for name in ["a", "b", "c"] {
            let key = derive_key(name);
            h.memory.put(key, Bytes::from_static(b"payload"));
            h.disk.store(key, Bytes::from_static(b"payload")).await;
        }
    }

    #[tokio::test]
    async fn test_signal_purges_memory_and_blocks_puts() {
        let h = harness(PressureConfig::default()).await;
        populate(&h).await;

        let response = h.monitor.on_pressure_signal().await;

        assert_eq!(response.memory_entries_purged, 3);
        assert!(!response.escalated());
        assert_eq!(h.memory.len(), 0);
        assert_eq!(h.disk.entry_count(), 3);
        assert!(h.monitor.state().is_under_pressure());

        assert!(!h.memory.put(derive_key("d"), Bytes::from_static(b"x")));
        assert_eq!(h.memory.len(), 0);
    }

    #[tokio::test]
    async fn test_third_signal_escalates_to_disk() {
        let h = harness(PressureConfig::default()).await;
        populate(&h).await;

        assert!(!h.monitor.on_pressure_signal().await.escalated());
        assert!(!h.monitor.on_pressure_signal().await.escalated());
        let third = h.monitor.on_pressure_signal().await;

        assert_eq!(third.consecutive_warnings, 3);
        assert_eq!(third.disk_entries_purged, Some(3));
        assert_eq!(h.disk.current_size(), 0);
        assert_eq!(h.monitor.state().consecutive_warnings(), 0);
        assert!(h.monitor.state().is_under_pressure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_ends_pressure() {
        let h = harness(PressureConfig::default()).await;

        h.monitor.on_pressure_signal().await;
        assert!(h.monitor.state().is_under_pressure());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(h.monitor.state().is_under_pressure());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!h.monitor.state().is_under_pressure());
        assert_eq!(h.monitor.state().consecutive_warnings(), 0);
        assert!(h.monitor.state().cooldown_deadline().is_none());
        assert!(h.memory.put(derive_key("after"), Bytes::from_static(b"x")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_signal_restarts_cooldown() {
        let h = harness(PressureConfig::default()).await;

        h.monitor.on_pressure_signal().await;
        tokio::time::sleep(Duration::from_secs(40)).await;
        h.monitor.on_pressure_signal().await;

        // 70s after the first signal, 30s after the second
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.monitor.state().is_under_pressure());
        assert_eq!(h.monitor.state().consecutive_warnings(), 2);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!h.monitor.state().is_under_pressure());
    }

    #[test]
    fn test_stale_generation_does_not_end_pressure() {
        let state = PressureState::new();
        let (_, first) = state.record_signal(Duration::from_secs(60));
        let (warnings, second) = state.record_signal(Duration::from_secs(60));
        assert_eq!(warnings, 2);

        assert!(!state.end_cooldown(first));
        assert!(state.is_under_pressure());
        assert!(state.end_cooldown(second));
        assert!(!state.is_under_pressure());
    }

    #[tokio::test]
    async fn test_channel_subscription_and_unregister() {
        let h = harness(PressureConfig::default()).await;
        populate(&h).await;

        let (notifier, subscription) = h.monitor.subscribe_channel();
        assert!(notifier.notify(PressureSignal::default()));

        while h.monitor.state().consecutive_warnings() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.memory.len(), 0);

        subscription.shutdown().await;
        assert!(!notifier.notify(PressureSignal::default()));
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_forwarding() {
        let h = harness(PressureConfig::default()).await;
        let (notifier, subscription) = h.monitor.subscribe_channel();
        drop(subscription);

        // Forwarding task observes cancellation and drops the receiver
        while notifier.notify(PressureSignal::default()) {
            tokio::task::yield_now().await;
        }
        assert!(!notifier.notify(PressureSignal::default()));
    }

    #[test]
    fn test_snapshot_serializes() {
        let state = PressureState::new();
        state.record_signal(Duration::from_secs(60));
        let json = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["under_pressure"], true);
        assert_eq!(json["consecutive_warnings"], 1);
    }
}
