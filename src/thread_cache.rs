//! Per-thread magazine of recently freed handles, keyed by size class, so
//! the hot allocate/free path can usually avoid the arena mutex entirely.
//!
//! Grounded on `other_examples/39fc7722_backtrace-labs-slitter__src-mill.rs.rs`'s
//! per-thread cache draining into a shared allocator for the overall
//! cache/drain shape, with `crossbeam_queue::ArrayQueue` standing in for a
//! hand-rolled SPSC ring (see DESIGN.md for why the stronger MPMC primitive
//! is an acceptable substitute: only the owning thread ever pops).

use std::cell::Cell;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use log::debug;
use parking_lot::Mutex;

use crate::arena::PoolArena;
use crate::chunk::ChunkId;
use crate::handle::Handle;
use crate::size_class::{self, SizeClass};

/// A freed allocation sitting in a thread's cache, with everything needed
/// to either bind a buffer to it directly (on a hit) or hand it back to the
/// arena (on a miss/drain) without recomputing geometry.
#[derive(Clone)]
pub struct CachedHandle {
    pub chunk_id: ChunkId,
    pub handle: Handle,
    pub offset: usize,
    pub length: usize,
    pub memory: Arc<Mutex<Vec<u8>>>,
}

/// How many cache hits without an intervening miss trigger a halving drain
/// (§4.5's trim policy), absent an explicit `Config` override.
const DEFAULT_TRIM_THRESHOLD: usize = 8192;

/// Per-class bounded rings for one coarse group (tiny, small, or normal).
struct ClassQueues {
    queues: Vec<ArrayQueue<CachedHandle>>,
}

impl ClassQueues {
    fn new(num_classes: usize, capacity: usize) -> ClassQueues {
        ClassQueues {
            queues: (0..num_classes).map(|_| ArrayQueue::new(capacity.max(1))).collect(),
        }
    }
}

/// A single thread's magazine of cached handles for one arena. A thread
/// binds to at most one heap-arena cache and one direct-arena cache (see
/// `facade::PooledAllocator`); each `ThreadCache` is used exclusively by
/// the thread that created it, so its counters need only `Cell`, not
/// atomics.
pub struct ThreadCache {
    arena: Arc<PoolArena>,
    tiny: ClassQueues,
    small: ClassQueues,
    normal: ClassQueues,
    hits_since_miss: Cell<usize>,
    misses: Cell<u64>,
    trim_threshold: usize,
}

impl ThreadCache {
    pub fn new(
        arena: Arc<PoolArena>,
        tiny_cache_size: usize,
        small_cache_size: usize,
        normal_cache_size: usize,
    ) -> ThreadCache {
        let page_size = arena.page_size();
        let chunk_size = arena.chunk_size();
        ThreadCache {
            tiny: ClassQueues::new(size_class::NUM_TINY_CLASSES, tiny_cache_size),
            small: ClassQueues::new(size_class::num_small_classes(page_size), small_cache_size),
            normal: ClassQueues::new(size_class::num_normal_classes(page_size, chunk_size), normal_cache_size),
            arena,
            hits_since_miss: Cell::new(0),
            misses: Cell::new(0),
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
        }
    }

    pub fn arena(&self) -> &Arc<PoolArena> {
        &self.arena
    }

    fn queues_for(&self, class: SizeClass) -> Option<&ClassQueues> {
        match class {
            SizeClass::Tiny => Some(&self.tiny),
            SizeClass::Small => Some(&self.small),
            SizeClass::Normal => Some(&self.normal),
            SizeClass::Huge => None,
        }
    }

    fn class_and_idx(&self, norm_capacity: usize) -> Option<(SizeClass, usize)> {
        let class = size_class::classify(norm_capacity, self.arena.page_size(), self.arena.chunk_size());
        let idx = match class {
            SizeClass::Tiny => size_class::tiny_idx(norm_capacity),
            SizeClass::Small => size_class::small_idx(norm_capacity),
            SizeClass::Normal => size_class::normal_idx(norm_capacity, self.arena.page_size()),
            SizeClass::Huge => return None,
        };
        Some((class, idx))
    }

    /// Attempts to satisfy `norm_capacity` from this thread's cache. `None`
    /// means a miss; the caller must fall through to the arena.
    pub fn try_allocate(&self, norm_capacity: usize) -> Option<CachedHandle> {
        let (class, idx) = self.class_and_idx(norm_capacity)?;
        let queues = self.queues_for(class)?;
        match queues.queues[idx].pop() {
            Some(cached) => {
                let hits = self.hits_since_miss.get() + 1;
                if hits >= self.trim_threshold {
                    self.drain_half();
                    self.hits_since_miss.set(0);
                } else {
                    self.hits_since_miss.set(hits);
                }
                Some(cached)
            }
            None => {
                self.hits_since_miss.set(0);
                self.misses.set(self.misses.get() + 1);
                None
            }
        }
    }

    /// Offers a freed handle to this thread's cache. Returns it back
    /// (unchanged) if the matching queue has no room or the size class is
    /// `huge` (never cached), so the caller can fall through to
    /// `PoolArena::free`.
    pub fn try_free(&self, norm_capacity: usize, cached: CachedHandle) -> Option<CachedHandle> {
        let Some((class, idx)) = self.class_and_idx(norm_capacity) else {
            return Some(cached);
        };
        let queues = match self.queues_for(class) {
            Some(q) => q,
            None => return Some(cached),
        };
        queues.queues[idx].push(cached).err()
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.get()
    }

    /// Halves every queue, returning the drained handles to the arena.
    /// Triggered automatically after `trim_threshold` consecutive hits.
    fn drain_half(&self) {
        debug!("thread cache trim: draining half of each queue (arena idx {})", self.arena.idx);
        for group in [&self.tiny, &self.small, &self.normal] {
            for queue in &group.queues {
                let to_drain = queue.len() / 2;
                for _ in 0..to_drain {
                    if let Some(cached) = queue.pop() {
                        let _ = self.arena.free(cached.chunk_id, cached.handle);
                    } else {
                        break;
                    }
                }
            }
        }
    }

    /// Drains every queue in full, returning every cached handle to the
    /// arena. Called on thread exit (via `Drop`).
    fn drain_all(&self) {
        for group in [&self.tiny, &self.small, &self.normal] {
            for queue in &group.queues {
                while let Some(cached) = queue.pop() {
                    let _ = self.arena.free(cached.chunk_id, cached.handle);
                }
            }
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        self.drain_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKind;
    use crate::backing::HeapBacking;

    const PAGE: usize = 8192;
    const MAX_ORDER: u32 = 11;
    const PAGE_SHIFTS: u32 = 13;

    fn new_arena() -> Arc<PoolArena> {
        Arc::new(PoolArena::new(ArenaKind::Heap, 0, PAGE, PAGE_SHIFTS, MAX_ORDER, Arc::new(HeapBacking)))
    }

    fn fake_cached(chunk_id: ChunkId, handle: Handle) -> CachedHandle {
        CachedHandle {
            chunk_id,
            handle,
            offset: 0,
            length: 16,
            memory: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[test]
    fn miss_on_empty_cache() {
        let cache = ThreadCache::new(new_arena(), 4, 4, 4);
        assert!(cache.try_allocate(16).is_none());
        assert_eq!(cache.miss_count(), 1);
    }

    #[test]
    fn free_then_hit_round_trips() {
        let arena = new_arena();
        let alloc = arena.allocate(16).unwrap();
        let cache = ThreadCache::new(Arc::clone(&arena), 4, 4, 4);
        let cached = fake_cached(alloc.chunk_id, alloc.handle);
        assert!(cache.try_free(16, cached).is_none(), "queue has room");
        let hit = cache.try_allocate(16).expect("should hit");
        assert_eq!(hit.chunk_id, alloc.chunk_id);
        assert_eq!(hit.handle, alloc.handle);
    }

    #[test]
    fn overfull_queue_returns_item_to_caller() {
        let arena = new_arena();
        let cache = ThreadCache::new(Arc::clone(&arena), 1, 1, 1);
        let a = arena.allocate(16).unwrap();
        let b = arena.allocate(16).unwrap();
        assert!(cache.try_free(16, fake_cached(a.chunk_id, a.handle)).is_none());
        let bounced = cache.try_free(16, fake_cached(b.chunk_id, b.handle));
        assert!(bounced.is_some(), "queue at capacity 1 must bounce the second push");
    }

    #[test]
    fn huge_requests_are_never_cached() {
        let arena = new_arena();
        let cache = ThreadCache::new(Arc::clone(&arena), 4, 4, 4);
        let chunk_size = arena.chunk_size();
        let cached = fake_cached(0, Handle::for_run(1));
        let bounced = cache.try_free(chunk_size + 1, cached);
        assert!(bounced.is_some(), "huge class must never be accepted into a queue");
    }

    #[test]
    fn drain_on_drop_returns_handles_to_arena() {
        let arena = new_arena();
        let alloc = arena.allocate(16).unwrap();
        {
            let cache = ThreadCache::new(Arc::clone(&arena), 4, 4, 4);
            let cached = fake_cached(alloc.chunk_id, alloc.handle);
            assert!(cache.try_free(16, cached).is_none());
            // cache drops here, should drain and free back to the arena.
        }
        // A fresh allocation of the same size must succeed (proves the
        // arena's slab bookkeeping reflects the drained free).
        let second = arena.allocate(16).unwrap();
        assert_eq!(second.chunk_id, alloc.chunk_id);
    }
}
