//! imgtier - Two-Tier Image Cache
//!
//! Memory and disk caching of encoded image payloads keyed by locator, with
//! fetch deduplication, priority-aware concurrency and memory-pressure
//! handling.
//!
//! # Architecture
//!
//! ```text
//! get(locator) ──► MemoryTier ──miss──► DiskTier ──miss──► FetchCoordinator ──► Fetcher
//!                      ▲                   │                      │
//!                      └──── promote ──────┘      write-through ◄─┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, fetch coordination, pressure handling, prefetching
//! - [`adapters`] - HTTP fetcher and system memory pressure source
//! - [`metrics`] - Prometheus exposition
//! - [`error`] - Error types

pub mod adapters;
pub mod cache;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use cache::{
    derive_key, CacheConfig, CacheKey, CacheStats, FetchPriority, FetchRequest, Fetcher,
    ImageCache,
};
pub use error::{Error, FetchFailure, Result};
