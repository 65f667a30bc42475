//! `PooledAllocator`: the crate's entry point. Owns arrays of heap and
//! direct arenas, binds each calling thread to a home arena of each kind on
//! first use, and routes `huge` requests around pooling entirely.
//!
//! Grounded on the teacher's top-level allocator construct (a single
//! fixed-size-class allocator owning its page lists), generalised to an
//! array of [`PoolArena`]s per §4.6, with `num_cpus` (already an ecosystem
//! crate used for default arena counts in server/pool crates across the
//! pack) sizing the defaults.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error};

use crate::arena::{ArenaKind, PoolArena};
use crate::backing::{BackingProvider, DirectBacking, HeapBacking};
use crate::buffer::{bind_unpooled, Binding, BufferSink, PoolBuffer, PoolBufferSink};
use crate::config::Config;
use crate::error::AllocError;
use crate::size_class::{self, SizeClass};
use crate::stats::Snapshot;
use crate::thread_cache::{CachedHandle, ThreadCache};

/// Largest request the façade accepts before normalisation, per §7's
/// overflow guard (`Integer.MAX_VALUE / 2` translated to `isize::MAX / 2`).
const MAX_REQUEST: usize = isize::MAX as usize / 2;

static NEXT_FACADE_ID: AtomicU64 = AtomicU64::new(0);

/// One calling thread's cache for each arena kind, within one façade.
/// Created lazily, on that thread, the first time it allocates.
struct ThreadBinding {
    heap: Option<ThreadCache>,
    direct: Option<ThreadCache>,
}

impl ThreadBinding {
    fn empty() -> ThreadBinding {
        ThreadBinding {
            heap: None,
            direct: None,
        }
    }

    fn slot(&self, kind: ArenaKind) -> &Option<ThreadCache> {
        match kind {
            ArenaKind::Heap => &self.heap,
            ArenaKind::Direct => &self.direct,
        }
    }

    fn slot_mut(&mut self, kind: ArenaKind) -> &mut Option<ThreadCache> {
        match kind {
            ArenaKind::Heap => &mut self.heap,
            ArenaKind::Direct => &mut self.direct,
        }
    }
}

thread_local! {
    /// Keyed by façade id rather than holding one slot per thread, since a
    /// process may build more than one `PooledAllocator`. Most programs
    /// build exactly one, in which case this is a single-entry map.
    static BINDINGS: RefCell<HashMap<u64, ThreadBinding>> = RefCell::new(HashMap::new());
}

/// Owns every heap and direct arena and routes requests to them. Cheap to
/// share: clone an `Arc<PooledAllocator>` across threads, or construct one
/// per subsystem.
pub struct PooledAllocator {
    id: u64,
    config: Config,
    heap_arenas: Vec<Arc<PoolArena>>,
    direct_arenas: Vec<Arc<PoolArena>>,
    heap_backing: Arc<dyn BackingProvider>,
    direct_backing: Arc<dyn BackingProvider>,
    sink: PoolBufferSink,
}

impl PooledAllocator {
    /// Validates `config` (§7) and builds every configured arena. No chunks
    /// are acquired yet; chunks are created lazily, inside an arena's
    /// mutex, on first allocation (§5).
    pub fn new(config: Config) -> Result<PooledAllocator, AllocError> {
        config.validate()?;
        let page_size = config.page_size;
        let page_shifts = config.page_shifts();
        let max_order = config.max_order;

        let heap_backing: Arc<dyn BackingProvider> = Arc::new(HeapBacking);
        let direct_backing: Arc<dyn BackingProvider> = Arc::new(DirectBacking::new(config.cache_line_alignment));

        let heap_arenas = (0..config.heap_arena_count)
            .map(|idx| {
                Arc::new(PoolArena::new(
                    ArenaKind::Heap,
                    idx,
                    page_size,
                    page_shifts,
                    max_order,
                    Arc::clone(&heap_backing),
                ))
            })
            .collect();
        let direct_arenas = (0..config.direct_arena_count)
            .map(|idx| {
                Arc::new(PoolArena::new(
                    ArenaKind::Direct,
                    idx,
                    page_size,
                    page_shifts,
                    max_order,
                    Arc::clone(&direct_backing),
                ))
            })
            .collect();

        Ok(PooledAllocator {
            id: NEXT_FACADE_ID.fetch_add(1, Ordering::Relaxed),
            config,
            heap_arenas,
            direct_arenas,
            heap_backing,
            direct_backing,
            sink: PoolBufferSink,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// §6's plain `allocate(capacity) -> Buffer` entry point: allocates
    /// from the heap arenas.
    pub fn allocate(&self, capacity: usize) -> Result<PoolBuffer, AllocError> {
        self.allocate_kind(capacity, ArenaKind::Heap)
    }

    pub fn allocate_heap(&self, capacity: usize) -> Result<PoolBuffer, AllocError> {
        self.allocate_kind(capacity, ArenaKind::Heap)
    }

    pub fn allocate_direct(&self, capacity: usize) -> Result<PoolBuffer, AllocError> {
        self.allocate_kind(capacity, ArenaKind::Direct)
    }

    /// Frees `buffer`, idempotent exactly once: calling it a second time on
    /// the same logical allocation is a contract violation the allocator
    /// does not detect (§7: a double free is a programming error, not a
    /// recoverable condition).
    pub fn free(&self, buffer: PoolBuffer) -> Result<(), AllocError> {
        if buffer.is_unpooled() {
            if buffer.allocated_length() > 0 {
                self.record_huge(buffer.kind(), false);
            }
            return Ok(());
        }

        let chunk_id = buffer.chunk_id().expect("pooled buffer always carries a chunk id");
        let handle = buffer.handle().expect("pooled buffer always carries a handle");
        let arena = Arc::clone(buffer.home_arena().expect("pooled buffer always carries its home arena"));
        let kind = buffer.kind();
        let length = buffer.allocated_length();

        if self.config.use_cache_for_all_threads {
            let cached = CachedHandle {
                chunk_id,
                handle,
                offset: buffer.offset(),
                length,
                memory: buffer.memory(),
            };
            let bounced = BINDINGS.with(|bindings| {
                let map = bindings.borrow();
                match map.get(&self.id).and_then(|binding| binding.slot(kind).as_ref()) {
                    // Only offer the handle to *this* thread's cache if this
                    // thread's home arena of this kind is the same arena the
                    // handle came from (§4.5: a cross-thread free must not
                    // land in a cache it doesn't belong to).
                    Some(cache) if Arc::ptr_eq(cache.arena(), &arena) => cache.try_free(length, cached),
                    _ => Some(cached),
                }
            });
            return match bounced {
                None => Ok(()),
                Some(cached) => arena.free(cached.chunk_id, cached.handle),
            };
        }

        arena.free(chunk_id, handle)
    }

    /// Frees `buffer` and allocates `new_capacity` bytes of the same kind,
    /// copying `min(old, new)` bytes across. Allocates before freeing the
    /// old handle so the copy always has both regions live.
    pub fn reallocate(&self, buffer: PoolBuffer, new_capacity: usize) -> Result<PoolBuffer, AllocError> {
        let kind = buffer.kind();
        let fresh = self.allocate_kind(new_capacity, kind)?;
        fresh.copy_from(&buffer);
        self.free(buffer)?;
        Ok(fresh)
    }

    /// Per-arena, per-class allocation counters; lock-free to read (§4.4).
    pub fn stats(&self) -> Snapshot {
        Snapshot {
            heap: self.heap_arenas.iter().map(|a| a.stats.snapshot()).collect(),
            direct: self.direct_arenas.iter().map(|a| a.stats.snapshot()).collect(),
        }
    }

    fn allocate_kind(&self, capacity: usize, kind: ArenaKind) -> Result<PoolBuffer, AllocError> {
        if capacity == 0 {
            // A zero-length request never touches an arena; it is still a
            // valid, freeable handle (§8 boundary behaviour).
            return bind_unpooled(Vec::new(), 0, 0, 0, kind);
        }
        if capacity > MAX_REQUEST {
            error!("rejected allocation request of {capacity} bytes: exceeds the representable maximum");
            return Err(AllocError::RequestTooLarge { requested: capacity });
        }

        let chunk_size = self.config.chunk_size();
        let normalized = size_class::align_up(
            size_class::normalize(capacity, chunk_size),
            self.config.cache_line_alignment,
        );

        if normalized > chunk_size {
            return self.allocate_huge(capacity, normalized, kind);
        }

        self.ensure_bound(kind)?;

        if self.config.use_cache_for_all_threads {
            if let Some((cached, arena)) = self.try_cache_hit(normalized, kind) {
                return Ok(self.sink.bind(
                    Binding {
                        chunk_id: Some(cached.chunk_id),
                        handle: cached.handle,
                        memory: cached.memory,
                        absolute_offset: cached.offset,
                        request_capacity: capacity,
                        allocated_length: cached.length,
                        kind,
                    },
                    Some(arena),
                ));
            }
        }

        let arena = self.home_arena(kind);
        let alloc = arena.allocate(normalized).map_err(|e| {
            error!("allocation of {capacity} bytes ({kind:?}) failed: {e}");
            e
        })?;
        Ok(self.sink.bind(
            Binding {
                chunk_id: Some(alloc.chunk_id),
                handle: alloc.handle,
                memory: alloc.memory,
                absolute_offset: alloc.offset,
                request_capacity: capacity,
                allocated_length: alloc.length,
                kind,
            },
            Some(arena),
        ))
    }

    /// Acquires a single-use, exactly-sized backing region directly from
    /// the kind's provider, bypassing every arena (§4.2's "Unpooled chunks").
    fn allocate_huge(&self, request_capacity: usize, normalized: usize, kind: ArenaKind) -> Result<PoolBuffer, AllocError> {
        let backing = self.backing_for(kind);
        let (region, offset) = backing.acquire(normalized).map_err(|e| {
            error!("huge allocation of {request_capacity} bytes failed to acquire backing memory: {e}");
            e
        })?;
        self.record_huge(kind, true);
        bind_unpooled(region, offset, normalized, request_capacity, kind)
    }

    fn backing_for(&self, kind: ArenaKind) -> &Arc<dyn BackingProvider> {
        match kind {
            ArenaKind::Heap => &self.heap_backing,
            ArenaKind::Direct => &self.direct_backing,
        }
    }

    fn arenas(&self, kind: ArenaKind) -> &[Arc<PoolArena>] {
        match kind {
            ArenaKind::Heap => &self.heap_arenas,
            ArenaKind::Direct => &self.direct_arenas,
        }
    }

    /// `huge` requests bypass arenas, but their counters still live on one
    /// so `stats()` surfaces them without a separate counter bank; the
    /// first arena of the matching kind is the nominal home. If no arena of
    /// that kind exists the counts are simply not recorded.
    fn record_huge(&self, kind: ArenaKind, alloc: bool) {
        if let Some(arena) = self.arenas(kind).first() {
            if alloc {
                arena.stats.record_alloc(SizeClass::Huge);
            } else {
                arena.stats.record_dealloc(SizeClass::Huge);
            }
        }
    }

    /// Ensures the calling thread has a home arena (and cache) of `kind`,
    /// binding it to whichever arena currently has the fewest thread
    /// registrations (ties broken by lowest index, i.e. round-robin) on
    /// first use.
    fn ensure_bound(&self, kind: ArenaKind) -> Result<(), AllocError> {
        let arenas = self.arenas(kind);
        if arenas.is_empty() {
            return Err(AllocError::ContractViolation(match kind {
                ArenaKind::Heap => "no heap arenas configured",
                ArenaKind::Direct => "no direct arenas configured",
            }));
        }
        BINDINGS.with(|bindings| {
            let mut map = bindings.borrow_mut();
            let binding = map.entry(self.id).or_insert_with(ThreadBinding::empty);
            if binding.slot(kind).is_none() {
                let arena = arenas
                    .iter()
                    .min_by_key(|a| a.registration_count())
                    .expect("checked non-empty above")
                    .clone();
                arena.record_registration();
                debug!(
                    "thread bound to {:?} arena idx={} (registrations={})",
                    kind,
                    arena.idx,
                    arena.registration_count()
                );
                *binding.slot_mut(kind) = Some(ThreadCache::new(
                    arena,
                    self.config.tiny_cache_size,
                    self.config.small_cache_size,
                    self.config.normal_cache_size,
                ));
            }
        });
        Ok(())
    }

    fn home_arena(&self, kind: ArenaKind) -> Arc<PoolArena> {
        BINDINGS.with(|bindings| {
            let map = bindings.borrow();
            let binding = map.get(&self.id).expect("ensure_bound must run first");
            Arc::clone(binding.slot(kind).as_ref().expect("ensure_bound must run first").arena())
        })
    }

    fn try_cache_hit(&self, normalized: usize, kind: ArenaKind) -> Option<(CachedHandle, Arc<PoolArena>)> {
        BINDINGS.with(|bindings| {
            let map = bindings.borrow();
            let binding = map.get(&self.id)?;
            let cache = binding.slot(kind).as_ref()?;
            let cached = cache.try_allocate(normalized)?;
            Some((cached, Arc::clone(cache.arena())))
        })
    }
}
