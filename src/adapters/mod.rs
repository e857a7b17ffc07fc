//! Infrastructure Adapters
//!
//! Implementations of the cache's host-facing ports.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         ImageCache                           │
//! │        Fetcher (trait)        │     pressure signals         │
//! └─────────────────────────────────────────────────────────────┘
//!                 ▲                              ▲
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Adapters (This Module)                    │
//! │        HttpFetcher            │     MemInfoWatcher           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod http;
mod meminfo;

pub use http::{HttpFetcher, HttpFetcherConfig};
pub use meminfo::{MemInfo, MemInfoWatcher, PROC_MEMINFO};
