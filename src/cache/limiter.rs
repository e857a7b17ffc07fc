//! Priority-aware fetch concurrency limiter.
//!
//! Permits are split into stacked pools. Each priority may draw from its
//! own reserve and from every pool below it, so a burst of background work
//! can never occupy the capacity held back for more urgent requests.
//!
//! ```text
//! Limits (cumulative): low=2 normal=4 high=6 immediate=8
//! ├── shared            2   low, normal, high, immediate
//! ├── normal reserve    2   normal, high, immediate
//! ├── high reserve      2   high, immediate
//! └── immediate reserve 2   immediate
//! ```
//!
//! A request first tries its most exclusive pool without waiting, then the
//! pools below it, and only then waits on whichever accessible pool frees a
//! permit first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{select_all, FutureExt};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::fetch::FetchPriority;

/// Cumulative concurrency allowance per priority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityLimits {
    pub low: usize,
    pub normal: usize,
    pub high: usize,
    pub immediate: usize,
}

impl PriorityLimits {
    /// Force the limits to be at least 1 and non-decreasing by priority
    pub fn normalized(self) -> Self {
        let low = self.low.max(1);
        let normal = self.normal.max(low);
        let high = self.high.max(normal);
        let immediate = self.immediate.max(high);
        Self {
            low,
            normal,
            high,
            immediate,
        }
    }

    /// Allowance for a priority
    pub fn for_priority(&self, priority: FetchPriority) -> usize {
        match priority {
            FetchPriority::Low => self.low,
            FetchPriority::Normal => self.normal,
            FetchPriority::High => self.high,
            FetchPriority::Immediate => self.immediate,
        }
    }
}

/// Priority-aware concurrency limiter for fetches
#[derive(Debug)]
pub struct PriorityLimiter {
    /// Pools indexed by priority rank: shared, then each reserve
    pools: [Arc<Semaphore>; 4],
    limits: PriorityLimits,
    /// In-flight counters indexed by priority rank
    in_flight: [Arc<AtomicUsize>; 4],
}

impl PriorityLimiter {
    /// Create a limiter from cumulative limits
    pub fn new(limits: PriorityLimits) -> Self {
        let limits = limits.normalized();
        let sizes = [
            limits.low,
            limits.normal - limits.low,
            limits.high - limits.normal,
            limits.immediate - limits.high,
        ];

        debug!(
            shared = sizes[0],
            normal_reserve = sizes[1],
            high_reserve = sizes[2],
            immediate_reserve = sizes[3],
            "Created fetch priority limiter"
        );

        Self {
            pools: sizes.map(|n| Arc::new(Semaphore::new(n))),
            limits,
            in_flight: std::array::from_fn(|_| Arc::new(AtomicUsize::new(0))),
        }
    }

    /// Acquire a permit for `priority`, waiting if its pools are exhausted.
    ///
    /// Returns `None` only if the limiter's semaphores were closed.
    pub async fn acquire(&self, priority: FetchPriority) -> Option<FetchPermit> {
        let rank = priority.rank();
        let accessible = || (0..=rank).rev().filter(move |&i| self.limits_for_pool(i) > 0);

        // Fast path: most exclusive pool first
        for pool in accessible() {
            if let Ok(permit) = Arc::clone(&self.pools[pool]).try_acquire_owned() {
                return Some(self.grant(rank, permit));
            }
        }

        let waiters: Vec<_> = accessible()
            .map(|pool| Arc::clone(&self.pools[pool]).acquire_owned().boxed())
            .collect();
        if waiters.is_empty() {
            return None;
        }

        let (acquired, _, _) = select_all(waiters).await;
        acquired.ok().map(|permit| self.grant(rank, permit))
    }

    /// Acquire without waiting
    pub fn try_acquire(&self, priority: FetchPriority) -> Option<FetchPermit> {
        let rank = priority.rank();
        (0..=rank).rev().find_map(|pool| {
            Arc::clone(&self.pools[pool])
                .try_acquire_owned()
                .ok()
                .map(|permit| self.grant(rank, permit))
        })
    }

    fn grant(&self, rank: usize, permit: OwnedSemaphorePermit) -> FetchPermit {
        self.in_flight[rank].fetch_add(1, Ordering::Relaxed);
        FetchPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight[rank]),
        }
    }

    fn limits_for_pool(&self, pool: usize) -> usize {
        let l = &self.limits;
        match pool {
            0 => l.low,
            1 => l.normal - l.low,
            2 => l.high - l.normal,
            _ => l.immediate - l.high,
        }
    }

    /// Configured limits
    pub fn limits(&self) -> PriorityLimits {
        self.limits
    }

    /// Operations in flight for one priority
    pub fn in_flight(&self, priority: FetchPriority) -> usize {
        self.in_flight[priority.rank()].load(Ordering::Relaxed)
    }

    /// Operations in flight across all priorities
    pub fn total_in_flight(&self) -> usize {
        self.in_flight
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Snapshot of pool occupancy
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            low_in_flight: self.in_flight(FetchPriority::Low),
            normal_in_flight: self.in_flight(FetchPriority::Normal),
            high_in_flight: self.in_flight(FetchPriority::High),
            immediate_in_flight: self.in_flight(FetchPriority::Immediate),
            shared_available: self.pools[0].available_permits(),
        }
    }
}

/// Limiter occupancy
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub low_in_flight: usize,
    pub normal_in_flight: usize,
    pub high_in_flight: usize,
    pub immediate_in_flight: usize,
    pub shared_available: usize,
}

/// A fetch permit; released on drop
pub struct FetchPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for FetchPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready};

    fn limits(low: usize, normal: usize, high: usize, immediate: usize) -> PriorityLimits {
        PriorityLimits {
            low,
            normal,
            high,
            immediate,
        }
    }

    #[test]
    fn test_normalized_limits() {
        let l = limits(0, 3, 2, 10).normalized();
        assert_eq!(l, limits(1, 3, 3, 10));
    }

    #[test]
    fn test_low_is_capped_at_shared_pool() {
        let limiter = PriorityLimiter::new(limits(2, 4, 6, 8));
        let a = limiter.try_acquire(FetchPriority::Low);
        let b = limiter.try_acquire(FetchPriority::Low);
        assert!(a.is_some() && b.is_some());
        assert!(limiter.try_acquire(FetchPriority::Low).is_none());
        assert_eq!(limiter.in_flight(FetchPriority::Low), 2);

        // Reserves untouched by background work
        assert!(limiter.try_acquire(FetchPriority::Normal).is_some());
        assert!(limiter.try_acquire(FetchPriority::Immediate).is_some());
    }

    #[test]
    fn test_immediate_can_use_every_pool() {
        let limiter = PriorityLimiter::new(limits(1, 2, 3, 4));
        let permits: Vec<_> = (0..4)
            .filter_map(|_| limiter.try_acquire(FetchPriority::Immediate))
            .collect();
        assert_eq!(permits.len(), 4);
        assert!(limiter.try_acquire(FetchPriority::Low).is_none());
    }

    #[test]
    fn test_high_prefers_own_reserve() {
        let limiter = PriorityLimiter::new(limits(1, 1, 2, 2));
        let _high = limiter.try_acquire(FetchPriority::High).unwrap();
        // Shared pool still free for low priority
        assert!(limiter.try_acquire(FetchPriority::Low).is_some());
    }

    #[test]
    fn test_permit_release_on_drop() {
        let limiter = PriorityLimiter::new(limits(1, 1, 1, 1));
        {
            let _p = limiter.try_acquire(FetchPriority::Normal).unwrap();
            assert_eq!(limiter.total_in_flight(), 1);
        }
        assert_eq!(limiter.total_in_flight(), 0);
        assert!(limiter.try_acquire(FetchPriority::Normal).is_some());
    }

    #[tokio::test]
    async fn test_waiter_woken_by_release() {
        let limiter = Arc::new(PriorityLimiter::new(limits(1, 1, 1, 1)));
        let held = limiter.try_acquire(FetchPriority::Low).unwrap();

        let mut waiter = tokio_test::task::spawn({
            let limiter = Arc::clone(&limiter);
            async move { limiter.acquire(FetchPriority::Normal).await.is_some() }
        });
        assert_pending!(waiter.poll());

        drop(held);
        assert!(waiter.is_woken());
        assert!(assert_ready!(waiter.poll()));
    }

    #[tokio::test]
    async fn test_immediate_waits_on_any_pool() {
        let limiter = Arc::new(PriorityLimiter::new(limits(1, 1, 1, 2)));
        let _immediate = limiter.try_acquire(FetchPriority::Immediate).unwrap();
        let shared = limiter.try_acquire(FetchPriority::Low).unwrap();

        let waiter = tokio::spawn({
            let limiter = Arc::clone(&limiter);
            async move { limiter.acquire(FetchPriority::Immediate).await.is_some() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(shared);

        let acquired = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired);
    }
}
