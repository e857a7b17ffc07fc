//! Adaptive tier budgets.
//!
//! Devices with less RAM get smaller caches. The table is keyed on total
//! physical memory; the first bucket whose ceiling exceeds it wins.

use serde::Serialize;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Budgets for both tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierBudget {
    pub memory_max_bytes: u64,
    pub memory_max_count: usize,
    pub disk_max_bytes: u64,
}

struct Bucket {
    /// Exclusive upper bound on device memory
    below: u64,
    budget: TierBudget,
}

const BUDGETS: &[Bucket] = &[
    Bucket {
        below: 2 * GIB,
        budget: TierBudget {
            memory_max_bytes: 32 * MIB,
            memory_max_count: 100,
            disk_max_bytes: 100 * MIB,
        },
    },
    Bucket {
        below: 4 * GIB,
        budget: TierBudget {
            memory_max_bytes: 64 * MIB,
            memory_max_count: 200,
            disk_max_bytes: 250 * MIB,
        },
    },
    Bucket {
        below: 8 * GIB,
        budget: TierBudget {
            memory_max_bytes: 128 * MIB,
            memory_max_count: 400,
            disk_max_bytes: 500 * MIB,
        },
    },
    Bucket {
        below: u64::MAX,
        budget: TierBudget {
            memory_max_bytes: 256 * MIB,
            memory_max_count: 800,
            disk_max_bytes: GIB,
        },
    },
];

/// Budget for a device with `total_memory` bytes of RAM.
///
/// Unknown memory is treated like a 2-4 GiB device.
pub fn budget_for(total_memory: Option<u64>) -> TierBudget {
    let total = total_memory.unwrap_or(2 * GIB);
    BUDGETS
        .iter()
        .find(|bucket| total < bucket.below)
        .map_or(BUDGETS[BUDGETS.len() - 1].budget, |bucket| bucket.budget)
}

/// Source of the device's total physical memory
pub trait MemoryProbe: Send + Sync {
    fn total_memory_bytes(&self) -> Option<u64>;
}

/// Reads physical memory from the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    #[cfg(unix)]
    fn total_memory_bytes(&self) -> Option<u64> {
        // SAFETY: sysconf has no preconditions and only reads system configuration
        let (pages, page_size) =
            unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
        if pages <= 0 || page_size <= 0 {
            return None;
        }
        (pages as u64).checked_mul(page_size as u64)
    }

    #[cfg(not(unix))]
    fn total_memory_bytes(&self) -> Option<u64> {
        None
    }
}

/// Reports a fixed amount of memory
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe(pub u64);

impl MemoryProbe for FixedMemoryProbe {
    fn total_memory_bytes(&self) -> Option<u64> {
        Some(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_selection() {
        assert_eq!(budget_for(Some(GIB)).memory_max_bytes, 32 * MIB);
        assert_eq!(budget_for(Some(3 * GIB)).disk_max_bytes, 250 * MIB);
        assert_eq!(budget_for(Some(6 * GIB)).memory_max_bytes, 128 * MIB);
        assert_eq!(budget_for(Some(64 * GIB)).disk_max_bytes, GIB);
    }

    #[test]
    fn test_bucket_boundaries_are_exclusive() {
        assert_eq!(budget_for(Some(2 * GIB - 1)).memory_max_bytes, 32 * MIB);
        assert_eq!(budget_for(Some(2 * GIB)).memory_max_bytes, 64 * MIB);
    }

    #[test]
    fn test_unknown_memory_is_conservative() {
        assert_eq!(budget_for(None), budget_for(Some(3 * GIB)));
    }

    #[test]
    fn test_budgets_grow_with_memory() {
        let budgets: Vec<_> = [GIB, 3 * GIB, 6 * GIB, 16 * GIB]
            .into_iter()
            .map(|m| budget_for(Some(m)))
            .collect();
        for pair in budgets.windows(2) {
            assert!(pair[0].memory_max_bytes < pair[1].memory_max_bytes);
            assert!(pair[0].disk_max_bytes < pair[1].disk_max_bytes);
            assert!(pair[0].memory_max_count < pair[1].memory_max_count);
        }
    }

    #[test]
    fn test_fixed_probe() {
        assert_eq!(FixedMemoryProbe(42).total_memory_bytes(), Some(42));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_probe_reports_memory() {
        let total = SystemMemoryProbe.total_memory_bytes();
        assert!(total.is_some_and(|t| t > 0));
    }
}
