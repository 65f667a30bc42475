//! Per-arena, per-class allocation counters.
//!
//! Resolves §9 Open Question 1 explicitly: counters are `AtomicU64`,
//! written while the arena mutex is held and readable lock-free for
//! [`crate::facade::PooledAllocator::stats`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::size_class::SizeClass;

/// Monotonically increasing (de)allocation counters for one arena, split by
/// size class.
#[derive(Debug, Default)]
pub struct ArenaStats {
    pub tiny_allocs: AtomicU64,
    pub tiny_deallocs: AtomicU64,
    pub small_allocs: AtomicU64,
    pub small_deallocs: AtomicU64,
    pub normal_allocs: AtomicU64,
    pub normal_deallocs: AtomicU64,
    pub huge_allocs: AtomicU64,
    pub huge_deallocs: AtomicU64,
}

impl ArenaStats {
    pub fn record_alloc(&self, class: SizeClass) {
        let counter = match class {
            SizeClass::Tiny => &self.tiny_allocs,
            SizeClass::Small => &self.small_allocs,
            SizeClass::Normal => &self.normal_allocs,
            SizeClass::Huge => &self.huge_allocs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dealloc(&self, class: SizeClass) {
        let counter = match class {
            SizeClass::Tiny => &self.tiny_deallocs,
            SizeClass::Small => &self.small_deallocs,
            SizeClass::Normal => &self.normal_deallocs,
            SizeClass::Huge => &self.huge_deallocs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ArenaSnapshot {
        ArenaSnapshot {
            tiny_allocs: self.tiny_allocs.load(Ordering::Relaxed),
            tiny_deallocs: self.tiny_deallocs.load(Ordering::Relaxed),
            small_allocs: self.small_allocs.load(Ordering::Relaxed),
            small_deallocs: self.small_deallocs.load(Ordering::Relaxed),
            normal_allocs: self.normal_allocs.load(Ordering::Relaxed),
            normal_deallocs: self.normal_deallocs.load(Ordering::Relaxed),
            huge_allocs: self.huge_allocs.load(Ordering::Relaxed),
            huge_deallocs: self.huge_deallocs.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time, best-effort copy of one arena's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaSnapshot {
    pub tiny_allocs: u64,
    pub tiny_deallocs: u64,
    pub small_allocs: u64,
    pub small_deallocs: u64,
    pub normal_allocs: u64,
    pub normal_deallocs: u64,
    pub huge_allocs: u64,
    pub huge_deallocs: u64,
}

/// Counters for every heap and direct arena in a [`crate::facade::PooledAllocator`].
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub heap: Vec<ArenaSnapshot>,
    pub direct: Vec<ArenaSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_independent_class_counters() {
        let stats = ArenaStats::default();
        stats.record_alloc(SizeClass::Tiny);
        stats.record_alloc(SizeClass::Tiny);
        stats.record_alloc(SizeClass::Normal);
        stats.record_dealloc(SizeClass::Tiny);

        let snap = stats.snapshot();
        assert_eq!(snap.tiny_allocs, 2);
        assert_eq!(snap.tiny_deallocs, 1);
        assert_eq!(snap.normal_allocs, 1);
        assert_eq!(snap.small_allocs, 0);
    }
}
