//! Cache Entry Types
//!
//! In-memory representation of a cached image payload.

use std::time::{Duration, Instant};

use bytes::Bytes;

/// A payload held by the memory tier
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Encoded image bytes (cheap to clone)
    payload: Bytes,
    /// Cost charged against the tier byte budget
    cost: u64,
    /// Insertion time
    inserted_at: Instant,
    /// Last time the entry was read
    last_access: Instant,
    /// Number of reads since insertion
    access_count: u32,
}

impl CacheEntry {
    /// Create an entry whose cost is the payload length
    pub fn new(payload: Bytes) -> Self {
        let cost = payload.len() as u64;
        Self::with_cost(payload, cost)
    }

    /// Create an entry with an explicit cost
    pub fn with_cost(payload: Bytes, cost: u64) -> Self {
        let now = Instant::now();
        Self {
            payload,
            cost,
            inserted_at: now,
            last_access: now,
            access_count: 0,
        }
    }

    /// Payload bytes
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the entry, returning its payload
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Budget cost in bytes
    #[inline]
    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// Reads since insertion
    #[inline]
    pub fn access_count(&self) -> u32 {
        self.access_count
    }

    /// Time since insertion
    pub fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }

    /// Time since the last read (or insertion)
    pub fn idle(&self) -> Duration {
        self.last_access.elapsed()
    }

    /// Record a read
    pub fn record_access(&mut self) {
        self.last_access = Instant::now();
        self.access_count = self.access_count.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_cost_defaults_to_len() {
        let entry = CacheEntry::new(Bytes::from_static(b"0123456789"));
        assert_eq!(entry.cost(), 10);
        assert_eq!(entry.access_count(), 0);
    }

    #[test]
    fn test_record_access() {
        let mut entry = CacheEntry::with_cost(Bytes::from_static(b"abc"), 100);
        entry.record_access();
        entry.record_access();
        assert_eq!(entry.access_count(), 2);
        assert_eq!(entry.cost(), 100);
        assert!(entry.idle() <= entry.age());
    }
}
