//! A chunk list buckets `PoolChunk`s by usage percentage into a fixed band,
//! so the arena's slow allocation path only probes chunks whose current
//! occupancy makes them likely to have room, visiting bands in the order
//! that favours filling partially-used chunks over fresh ones.
//!
//! Grounded on `other_examples/a3a8c205_mmtk-mmtk-core__src-util-heap-freelistpageresource.rs.rs`'s
//! shape of a free-region list owned by a resource pool, adapted to the
//! spec's six fixed usage bands and hysteresis migration thresholds.

use crate::chunk::{ChunkId, PoolChunk};

/// Chunks live in exactly one band at a time: `[min_usage, max_usage)`,
/// except `q000` (`min_usage == 0`, accepts fully-free chunks) and `q100`
/// (`max_usage == 100`, the dumping ground for chunks with no room left).
pub struct ChunkList {
    pub name: &'static str,
    pub min_usage: u32,
    pub max_usage: u32,
    head: Option<ChunkId>,
}

/// The arena's chunk slab; chunk lists are intrusive over it via each
/// chunk's `list_prev`/`list_next` fields, so a list owns no allocation of
/// its own beyond the head pointer.
pub type ChunkSlab = Vec<Option<Box<PoolChunk>>>;

fn get<'a>(chunks: &'a ChunkSlab, id: ChunkId) -> &'a PoolChunk {
    chunks[id as usize].as_ref().expect("dangling chunk id in list")
}

fn get_mut<'a>(chunks: &'a mut ChunkSlab, id: ChunkId) -> &'a mut PoolChunk {
    chunks[id as usize].as_mut().expect("dangling chunk id in list")
}

impl ChunkList {
    pub fn new(name: &'static str, min_usage: u32, max_usage: u32) -> ChunkList {
        ChunkList {
            name,
            min_usage,
            max_usage,
            head: None,
        }
    }

    /// `true` iff `usage` (0-100) belongs in this band.
    pub fn accepts(&self, usage: u32) -> bool {
        usage >= self.min_usage && usage < self.max_usage
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn head(&self) -> Option<ChunkId> {
        self.head
    }

    /// Links `id` at the front of this list. `id` must not already be
    /// linked anywhere.
    pub fn push_front(&mut self, id: ChunkId, chunks: &mut ChunkSlab) {
        debug_assert!(get(chunks, id).list_prev.is_none() && get(chunks, id).list_next.is_none());
        let old_head = self.head;
        {
            let c = get_mut(chunks, id);
            c.list_next = old_head;
            c.list_prev = None;
        }
        if let Some(h) = old_head {
            get_mut(chunks, h).list_prev = Some(id);
        }
        self.head = Some(id);
    }

    /// Unlinks `id` from this list, wherever in it the chunk sits.
    pub fn remove(&mut self, id: ChunkId, chunks: &mut ChunkSlab) {
        let (prev, next) = {
            let c = get(chunks, id);
            (c.list_prev, c.list_next)
        };
        match prev {
            Some(p) => get_mut(chunks, p).list_next = next,
            None => self.head = next,
        }
        if let Some(n) = next {
            get_mut(chunks, n).list_prev = prev;
        }
        let c = get_mut(chunks, id);
        c.list_prev = None;
        c.list_next = None;
    }

    /// Chunk ids in this band, head to tail. Collected eagerly so callers
    /// can mutate chunks (and migrate them between lists) while iterating.
    pub fn snapshot(&self, chunks: &ChunkSlab) -> Vec<ChunkId> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(id) = cur {
            out.push(id);
            cur = get(chunks, id).list_next;
        }
        out
    }
}

/// Index of `qInit` within the fixed six-band array passed to [`migrate`].
/// `bands` is always laid out `[qInit, q000, q025, q050, q075, q100]`.
pub const Q_INIT: usize = 0;

/// Outcome of a [`migrate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The chunk's usage still belongs to `from`; no list surgery happened.
    Unchanged,
    /// The chunk moved to band index `.0`; the caller should update the
    /// chunk's own `band` bookkeeping field to match.
    Moved(usize),
    /// The chunk fell below `qInit`'s minimum usage and was unlinked from
    /// every band. The caller must destroy the chunk and return its backing
    /// memory, per the spec's "falls below qInit's minUsage" trigger.
    Destroy,
}

/// Moves `id` out of `from` and into whichever of `bands` now accepts its
/// current usage, walking the six bands in their fixed topological order
/// (`qInit, q000, q025, q050, q075, q100`). A chunk that has ever left
/// `qInit` may never migrate back into it, mirroring the spec's
/// hysteresis design, this stops a chunk sitting right at the `q000`/`qInit`
/// boundary from flip-flopping between the two bands on every alloc/free.
pub fn migrate(bands: &mut [ChunkList], from: usize, id: ChunkId, chunks: &mut ChunkSlab) -> MigrationOutcome {
    let usage = get(chunks, id).usage();
    if usage == 0 {
        // A chunk that has given back every byte is always destroyed,
        // regardless of which band it currently sits in: `freeBytes ==
        // chunkSize` is the spec's precondition for destruction, and qInit
        // (the band with no predecessor) has nowhere lower to demote it to.
        bands[from].remove(id, chunks);
        return MigrationOutcome::Destroy;
    }
    if bands[from].accepts(usage) {
        return MigrationOutcome::Unchanged;
    }
    bands[from].remove(id, chunks);
    let candidates = if from == Q_INIT { &bands[..] } else { &bands[Q_INIT + 1..] };
    let offset = if from == Q_INIT { 0 } else { Q_INIT + 1 };
    for (i, band) in candidates.iter().enumerate() {
        if band.accepts(usage) {
            bands[offset + i].push_front(id, chunks);
            return MigrationOutcome::Moved(offset + i);
        }
    }
    MigrationOutcome::Destroy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::PoolChunk;

    const PAGE: usize = 8192;
    const MAX_ORDER: u32 = 11;
    const PAGE_SHIFTS: u32 = 13;
    const CHUNK: usize = PAGE << MAX_ORDER;

    fn new_chunk(id: ChunkId) -> PoolChunk {
        PoolChunk::new(id, vec![0u8; CHUNK], 0, PAGE, PAGE_SHIFTS, MAX_ORDER)
    }

    fn six_bands() -> Vec<ChunkList> {
        vec![
            ChunkList::new("qInit", 0, 25),
            ChunkList::new("q000", 0, 50),
            ChunkList::new("q025", 25, 75),
            ChunkList::new("q050", 50, 100),
            ChunkList::new("q075", 75, 100),
            ChunkList::new("q100", 100, 101),
        ]
    }

    #[test]
    fn push_and_remove_round_trip() {
        let mut chunks: ChunkSlab = vec![Some(Box::new(new_chunk(0))), Some(Box::new(new_chunk(1)))];
        let mut list = ChunkList::new("q000", 0, 50);
        list.push_front(0, &mut chunks);
        list.push_front(1, &mut chunks);
        assert_eq!(list.snapshot(&chunks), vec![1, 0]);
        list.remove(1, &mut chunks);
        assert_eq!(list.snapshot(&chunks), vec![0]);
        assert!(chunks[1].as_ref().unwrap().list_prev.is_none());
        assert!(chunks[1].as_ref().unwrap().list_next.is_none());
    }

    #[test]
    fn accepts_respects_half_open_bands() {
        let q025 = ChunkList::new("q025", 25, 75);
        assert!(!q025.accepts(24));
        assert!(q025.accepts(25));
        assert!(q025.accepts(74));
        assert!(!q025.accepts(75));
    }

    #[test]
    fn migrate_moves_chunk_to_matching_band() {
        let mut chunks: ChunkSlab = vec![Some(Box::new(new_chunk(0)))];
        let mut bands = six_bands();
        bands[0].push_front(0, &mut chunks);
        chunks[0].as_mut().unwrap().free_bytes = 0; // usage == 100
        let outcome = migrate(&mut bands, 0, 0, &mut chunks);
        assert_eq!(outcome, MigrationOutcome::Moved(5));
        assert!(bands[0].is_empty());
        assert_eq!(bands[5].snapshot(&chunks), vec![0]);
    }

    #[test]
    fn migrate_is_noop_when_band_still_matches() {
        let mut chunks: ChunkSlab = vec![Some(Box::new(new_chunk(0)))];
        let mut bands = six_bands();
        bands[1].push_front(0, &mut chunks);
        let outcome = migrate(&mut bands, 1, 0, &mut chunks);
        assert_eq!(outcome, MigrationOutcome::Unchanged);
        assert_eq!(bands[1].snapshot(&chunks), vec![0]);
    }

    #[test]
    fn migrate_destroys_chunk_that_becomes_fully_free() {
        let mut chunks: ChunkSlab = vec![Some(Box::new(new_chunk(0)))];
        let mut bands = six_bands();
        bands[2].push_front(0, &mut chunks); // q025
        let full = chunks[0].as_ref().unwrap().chunk_size;
        chunks[0].as_mut().unwrap().free_bytes = full; // usage == 0
        let outcome = migrate(&mut bands, 2, 0, &mut chunks);
        assert_eq!(outcome, MigrationOutcome::Destroy);
        assert!(bands[2].is_empty());
    }
}
