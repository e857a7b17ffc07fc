//! Two-Tier Image Cache
//!
//! Memory (LRU) and disk (persistent) tiers in front of a pluggable fetcher.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            ImageCache                                 │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  MemoryTier (RAM)     │ DiskTier (files)     │ FetchCoordinator       │
//! │  ┌────────────────┐   │ ┌────────────────┐   │ ┌──────────────────┐   │
//! │  │ LRU, bytes +   │   │ │ <hex>.img      │   │ │ in-flight map    │   │
//! │  │ count budget   │   │ │ + index        │   │ │ + priority pools │   │
//! │  └────────────────┘   │ └────────────────┘   │ └──────────────────┘   │
//! │         ▲             │         │            │          │             │
//! │         └── promote ──┴─────────┘            │   write-through ──►    │
//! │                                              │   memory + disk        │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  PressureMonitor: purge memory on signal, disk on repeated signals    │
//! │  Prefetcher: low-priority warming of upcoming locators                │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

mod disk;
mod entry;
mod fetch;
mod format;
mod key;
mod limiter;
mod manager;
mod memory;
mod metrics;
mod prefetch;
mod pressure;
mod sizing;

pub use disk::{default_cache_dir, DiskTier, DiskTierConfig, DiskTierStats, EvictionResult, HEADER_LEN};
pub use entry::CacheEntry;
pub use fetch::{
    FetchConfig, FetchCoordinator, FetchOutcome, FetchPriority, FetchRequest, Fetcher, InFlight,
};
pub use format::{validate_payload, ImageFormat};
pub use key::{derive_key, CacheKey, KEY_HEX_LEN, KEY_LEN};
pub use limiter::{FetchPermit, LimiterStats, PriorityLimiter, PriorityLimits};
pub use manager::{CacheConfig, CacheResult, CacheSource, CacheStats, ClearResult, ImageCache};
pub use memory::{MemoryTier, MemoryTierConfig, MemoryTierStats};
pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
pub use prefetch::{PrefetchBatch, Prefetcher};
pub use pressure::{
    PressureConfig, PressureMonitor, PressureNotifier, PressureResponse, PressureSignal,
    PressureSnapshot, PressureState, PressureSubscription,
};
pub use sizing::{budget_for, FixedMemoryProbe, MemoryProbe, SystemMemoryProbe, TierBudget};

/// Default memory tier byte budget (128MB)
pub const DEFAULT_MEMORY_MAX_BYTES: u64 = 128 * 1024 * 1024;

/// Default memory tier entry budget
pub const DEFAULT_MEMORY_MAX_COUNT: usize = 400;

/// Default disk tier byte budget (500MB)
pub const DEFAULT_DISK_MAX_BYTES: u64 = 500 * 1024 * 1024;

/// Default maximum idle age of a disk entry (7 days)
pub const DEFAULT_DISK_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Fraction of the disk budget that eviction shrinks down to
pub const DEFAULT_EVICTION_TARGET_RATIO: f64 = 0.8;

// =============================================================================
// Tests
// =============================================================================
