//! Fetch coordination with request coalescing.
//!
//! At most one retrieval runs per key. The first caller for a key starts
//! the fetch; every caller arriving while it is outstanding joins it and
//! receives a clone of the same outcome.
//!
//! ```text
//! get(A) ─┐
//!         │                                     Fetcher
//! get(A) ─┼──► FetchCoordinator ── limiter ──► (one call)
//!         │        │                                │
//! get(A) ─┘        │                                ▼
//!                  │                      validate, memory.put,
//!                  ▼                          disk.store
//!           [all three resolve with the same Result]
//! ```
//!
//! The fetch runs on its own task, so it completes and populates both tiers
//! even if every caller stops waiting. Its in-flight entry is removed before
//! the outcome is published, which means a caller arriving after completion
//! starts a fresh fetch rather than observing a stale one.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::disk::DiskTier;
use super::format::validate_payload;
use super::key::CacheKey;
use super::limiter::{LimiterStats, PriorityLimiter, PriorityLimits};
use super::memory::MemoryTier;
use super::metrics::{CacheMetrics, LatencyTracker};
use crate::error::FetchFailure;

/// Outcome shared by every caller joined on a fetch
pub type FetchOutcome = std::result::Result<Bytes, FetchFailure>;

type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

// =============================================================================
// Priority
// =============================================================================

/// Urgency of a request; governs concurrency share and timeout
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FetchPriority {
    /// Speculative prefetch
    Low,
    /// Ordinary on-screen request
    #[default]
    Normal,
    /// User is waiting on this image
    High,
    /// Blocking the current interaction
    Immediate,
}

impl FetchPriority {
    /// All priorities, lowest first
    pub const ALL: [FetchPriority; 4] = [
        FetchPriority::Low,
        FetchPriority::Normal,
        FetchPriority::High,
        FetchPriority::Immediate,
    ];

    /// Zero-based rank, lowest first
    #[inline]
    pub fn rank(&self) -> usize {
        *self as usize
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchPriority::Low => "low",
            FetchPriority::Normal => "normal",
            FetchPriority::High => "high",
            FetchPriority::Immediate => "immediate",
        }
    }
}

impl fmt::Display for FetchPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FetchPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(FetchPriority::Low),
            "normal" => Ok(FetchPriority::Normal),
            "high" => Ok(FetchPriority::High),
            "immediate" => Ok(FetchPriority::Immediate),
            other => Err(format!(
                "unknown priority '{}', expected low, normal, high or immediate",
                other
            )),
        }
    }
}

// =============================================================================
// Fetcher capability
// =============================================================================

/// A single retrieval handed to the [`Fetcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub locator: String,
    pub priority: FetchPriority,
    /// Budget the transport should honour
    pub timeout: Duration,
}

/// Retrieves raw image bytes for a locator
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> FetchOutcome;
}

// =============================================================================
// Configuration
// =============================================================================

/// Fetch coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Concurrent fetches available to low priority
    pub low_concurrency: usize,
    /// Concurrent fetches available to normal priority and below
    pub normal_concurrency: usize,
    /// Concurrent fetches available to high priority and below
    pub high_concurrency: usize,
    /// Concurrent fetches available to immediate priority and below
    pub immediate_concurrency: usize,

    pub low_timeout_secs: u64,
    pub normal_timeout_secs: u64,
    pub high_timeout_secs: u64,
    pub immediate_timeout_secs: u64,

    /// Reject payloads that do not carry a known image signature
    pub validate_payloads: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            low_concurrency: 2,
            normal_concurrency: 4,
            high_concurrency: 6,
            immediate_concurrency: 8,
            low_timeout_secs: 60,
            normal_timeout_secs: 30,
            high_timeout_secs: 20,
            immediate_timeout_secs: 15,
            validate_payloads: true,
        }
    }
}

impl FetchConfig {
    /// Timeout for a priority
    pub fn timeout_for(&self, priority: FetchPriority) -> Duration {
        Duration::from_secs(match priority {
            FetchPriority::Low => self.low_timeout_secs,
            FetchPriority::Normal => self.normal_timeout_secs,
            FetchPriority::High => self.high_timeout_secs,
            FetchPriority::Immediate => self.immediate_timeout_secs,
        })
    }

    /// Concurrency limits per priority
    pub fn limits(&self) -> PriorityLimits {
        PriorityLimits {
            low: self.low_concurrency,
            normal: self.normal_concurrency,
            high: self.high_concurrency,
            immediate: self.immediate_concurrency,
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// State of a key in the in-flight table
#[derive(Clone)]
pub enum InFlight {
    /// A fetch is outstanding; awaiting the handle joins it
    Pending(SharedFetch),
    /// No fetch is outstanding
    Absent,
}

impl InFlight {
    /// Check if a fetch is outstanding
    pub fn is_pending(&self) -> bool {
        matches!(self, InFlight::Pending(_))
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InFlight::Pending(_) => f.write_str("InFlight::Pending"),
            InFlight::Absent => f.write_str("InFlight::Absent"),
        }
    }
}

struct CoordinatorInner {
    fetcher: Arc<dyn Fetcher>,
    limiter: PriorityLimiter,
    in_flight: Mutex<HashMap<CacheKey, SharedFetch>>,
    memory: Arc<MemoryTier>,
    disk: Arc<DiskTier>,
    config: FetchConfig,
    metrics: Arc<CacheMetrics>,
}

/// Deduplicates fetches and writes results through to both tiers
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl FetchCoordinator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        memory: Arc<MemoryTier>,
        disk: Arc<DiskTier>,
        config: FetchConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                fetcher,
                limiter: PriorityLimiter::new(config.limits()),
                in_flight: Mutex::new(HashMap::new()),
                memory,
                disk,
                config,
                metrics,
            }),
        }
    }

    /// Start or join the fetch for `key`.
    ///
    /// `locator` and `priority` only matter to the caller that starts the
    /// fetch; joiners inherit whatever the first caller asked for.
    pub async fn request(&self, key: CacheKey, locator: &str, priority: FetchPriority) -> FetchOutcome {
        self.inner.metrics.record_fetch_request();

        let pending = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&key) {
                Some(shared) => {
                    self.inner.metrics.record_fetch_coalesced();
                    debug!(key = ?key, "Joining in-flight fetch");
                    shared.clone()
                }
                None => {
                    let shared = Self::drive(Arc::clone(&self.inner), key, locator.to_string(), priority)
                        .boxed()
                        .shared();
                    in_flight.insert(key, shared.clone());
                    self.inner.metrics.record_fetch_started();
                    debug!(
                        key = ?key,
                        %priority,
                        in_flight = in_flight.len(),
                        "Starting fetch"
                    );
                    // Detached so the fetch outlives callers that stop waiting
                    tokio::spawn(shared.clone());
                    shared
                }
            }
        };

        pending.await
    }

    /// In-flight state of a key
    pub fn lookup(&self, key: &CacheKey) -> InFlight {
        self.inner
            .in_flight
            .lock()
            .get(key)
            .cloned()
            .map_or(InFlight::Absent, InFlight::Pending)
    }

    /// Check if a fetch for `key` is outstanding
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.in_flight.lock().contains_key(key)
    }

    /// Number of outstanding fetches
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Limiter occupancy
    pub fn limiter_stats(&self) -> LimiterStats {
        self.inner.limiter.stats()
    }

    /// Get configuration
    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    async fn drive(
        inner: Arc<CoordinatorInner>,
        key: CacheKey,
        locator: String,
        priority: FetchPriority,
    ) -> FetchOutcome {
        let outcome = inner.fetch_and_store(key, locator, priority).await;
        inner.in_flight.lock().remove(&key);
        outcome
    }
}

impl CoordinatorInner {
    async fn fetch_and_store(&self, key: CacheKey, locator: String, priority: FetchPriority) -> FetchOutcome {
        let tracker = LatencyTracker::start();

        let request = FetchRequest {
            timeout: self.config.timeout_for(priority),
            locator,
            priority,
        };

        let result = {
            let Some(_permit) = self.limiter.acquire(priority).await else {
                self.metrics.record_fetch_failure();
                return Err(FetchFailure::transport(request.locator, "fetch limiter closed"));
            };
            match tokio::time::timeout(request.timeout, self.fetcher.fetch(&request)).await {
                Ok(result) => result,
                Err(_) => Err(FetchFailure::Timeout {
                    locator: request.locator.clone(),
                    timeout_ms: request.timeout.as_millis() as u64,
                }),
            }
        };

        let payload = match result.and_then(|payload| self.validate(&request.locator, payload)) {
            Ok(payload) => payload,
            Err(failure) => {
                if failure.is_decode() {
                    self.metrics.record_decode_failure();
                }
                self.metrics.record_fetch_failure();
                warn!(key = ?key, %priority, error = %failure, "Fetch failed");
                return Err(failure);
            }
        };

        self.metrics.record_fetch_latency(tracker.elapsed());
        self.memory.put(key, payload.clone());
        self.disk.store(key, payload.clone()).await;

        debug!(
            key = ?key,
            %priority,
            size = payload.len(),
            latency_ms = tracker.elapsed().as_millis() as u64,
            "Fetch completed"
        );
        Ok(payload)
    }

    fn validate(&self, locator: &str, payload: Bytes) -> FetchOutcome {
        if payload.is_empty() {
            return Err(FetchFailure::decode(locator, "empty payload"));
        }
        if self.config.validate_payloads {
            validate_payload(&payload).map_err(|reason| FetchFailure::decode(locator, reason))?;
        }
        Ok(payload)
    }
}

// =============================================================================
// Tests
// =============================================================================
