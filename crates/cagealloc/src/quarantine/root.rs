use crate::quarantine::AllocatorRoot;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Point-in-time view of a root's counters. The counters are statistics,
/// not synchronization: they may drift under relaxed ordering and must not
/// gate decisions that need exactness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuarantineStats {
    pub count: usize,
    pub size_in_bytes: usize,
    pub cumulative_count: usize,
    pub cumulative_size_in_bytes: usize,
    pub quarantine_miss_count: usize,
}

/// One quarantine system per (partition, purpose). Outlives every branch
/// attached to it.
pub struct QuarantineRoot<'a, R: AllocatorRoot> {
    pub(crate) allocator_root: &'a R,
    pub(crate) size_in_bytes: AtomicUsize,
    pub(crate) count: AtomicUsize,
    pub(crate) cumulative_count: AtomicUsize,
    pub(crate) cumulative_size_in_bytes: AtomicUsize,
    pub(crate) quarantine_miss_count: AtomicUsize,
}

impl<'a, R: AllocatorRoot> QuarantineRoot<'a, R> {
    pub fn new(allocator_root: &'a R) -> Self {
        QuarantineRoot {
            allocator_root,
            size_in_bytes: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            cumulative_count: AtomicUsize::new(0),
            cumulative_size_in_bytes: AtomicUsize::new(0),
            quarantine_miss_count: AtomicUsize::new(0),
        }
    }

    pub fn allocator_root(&self) -> &'a R {
        self.allocator_root
    }

    /// Bytes currently quarantined across all branches. Acquire pairs with
    /// the release decrement after a deferred batch free, so a reader that
    /// observes freed quota also observes the frees.
    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes.load(Ordering::Acquire)
    }

    pub fn accumulate_stats(&self, stats: &mut QuarantineStats) {
        stats.count += self.count.load(Ordering::Relaxed);
        stats.size_in_bytes += self.size_in_bytes.load(Ordering::Relaxed);
        stats.cumulative_count += self.cumulative_count.load(Ordering::Relaxed);
        stats.cumulative_size_in_bytes += self.cumulative_size_in_bytes.load(Ordering::Relaxed);
        stats.quarantine_miss_count += self.quarantine_miss_count.load(Ordering::Relaxed);
    }

    pub fn stats_snapshot(&self) -> QuarantineStats {
        let mut stats = QuarantineStats::default();
        self.accumulate_stats(&mut stats);
        stats
    }
}
