//! A chunk is a contiguous backing region of `chunk_size` bytes, split into
//! `page_size`-sized runs by a complete-binary buddy tree.
//!
//! Grounded on the buddy-tree shape of
//! `other_examples/b60f667c_hyyking-kernel__kalloc-src-buddy.rs.rs` and
//! `other_examples/5121d622_asterinas-asterinas__kernel-libs-aster-page-allocator-src-buddy_allocator.rs.rs`,
//! combined with the teacher's `AllocablePage` abstraction (`pages.rs`) for
//! how a leaf page converts into a bitmap-tracked slab.

use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::handle::Handle;
use crate::subpage::{Subpage, SubpageRef};

/// Numeric identity of a chunk within its owning arena's chunk slab.
pub type ChunkId = u32;

/// A pooled chunk: backing memory plus the buddy-tree bookkeeping needed to
/// carve it into runs and, for `tiny`/`small` requests, into slab pages.
pub struct PoolChunk {
    pub id: ChunkId,
    pub page_size: usize,
    pub page_shifts: u32,
    pub max_order: u32,
    pub chunk_size: usize,
    /// `memory_map[i]`: shallowest free depth reachable under node `i`.
    /// Index 0 is unused; indices `1..=2N-1` are live, `N = 1 << max_order`.
    memory_map: Vec<u8>,
    /// `depth_map[i]`: the fixed depth of node `i` (`floor(log2(i))`).
    depth_map: Vec<u8>,
    /// One slot per leaf page, populated lazily when a leaf becomes a slab.
    subpages: Vec<Option<Subpage>>,
    /// Bytes not currently handed out to any live allocation.
    pub free_bytes: usize,
    /// Backing storage for this chunk's bytes, behind its own lightweight
    /// mutex so that a live [`crate::buffer::PoolBuffer`] can read/write its
    /// region without contending with the arena's tree-mutating mutex (see
    /// DESIGN.md's buffer-binding entry).
    pub memory: Arc<Mutex<Vec<u8>>>,
    /// Byte offset into `memory` at which the usable region begins (used by
    /// direct/aligned chunks; always 0 for heap chunks).
    pub alignment_offset: usize,
    /// Doubly-linked membership in exactly one arena `ChunkList` bucket.
    pub list_prev: Option<ChunkId>,
    pub list_next: Option<ChunkId>,
    /// Index of the `ChunkList` band (within the arena's fixed six-band
    /// array) this chunk currently belongs to. Maintained by the arena
    /// alongside `list_prev`/`list_next` so a migration can find a chunk's
    /// current band without a linear scan of all six lists.
    pub band: usize,
    /// "No free descendant" sentinel stored in `memory_map`, `max_order + 1`
    /// per the spec.
    unusable: u8,
}

impl PoolChunk {
    pub fn new(
        id: ChunkId,
        memory: Vec<u8>,
        alignment_offset: usize,
        page_size: usize,
        page_shifts: u32,
        max_order: u32,
    ) -> PoolChunk {
        let num_nodes = 1usize << (max_order + 1);
        let n = 1usize << max_order;
        let mut depth_map = vec![0u8; num_nodes];
        for (i, slot) in depth_map.iter_mut().enumerate().skip(1) {
            *slot = (63 - (i as u64).leading_zeros()) as u8;
        }
        let chunk_size = page_size << max_order;
        trace!("chunk {id} created, chunk_size={chunk_size}");
        PoolChunk {
            id,
            page_size,
            page_shifts,
            max_order,
            chunk_size,
            memory_map: depth_map.clone(),
            depth_map,
            subpages: (0..n).map(|_| None).collect(),
            free_bytes: chunk_size,
            memory: Arc::new(Mutex::new(memory)),
            alignment_offset,
            list_prev: None,
            list_next: None,
            band: 0,
            unusable: (max_order + 1) as u8,
        }
    }

    #[inline(always)]
    fn depth(&self, id: usize) -> u8 {
        self.depth_map[id]
    }

    /// Bytes covered by the node at `id`.
    pub fn run_length(&self, id: u32) -> usize {
        let log2_chunk_size = self.chunk_size.trailing_zeros();
        1usize << (log2_chunk_size - self.depth(id as usize) as u32)
    }

    /// Byte offset within the chunk covered by node `id`.
    pub fn run_offset(&self, id: u32) -> usize {
        let d = self.depth(id as usize) as u32;
        let shifted_id = (id as usize) ^ (1 << d);
        shifted_id * self.run_length(id)
    }

    /// Index into `subpages[]` for leaf node `leaf_id`.
    fn subpage_idx(&self, leaf_id: u32) -> usize {
        let n = 1usize << self.max_order;
        (leaf_id as usize) ^ n
    }

    /// Walks the buddy tree to find and claim a free node at depth `d`.
    /// Returns the claimed node id, or `None` if no node at that depth is
    /// free.
    fn allocate_node(&mut self, d: u8) -> Option<u32> {
        if self.memory_map[1] > d {
            return None;
        }
        let mut id: usize = 1;
        // Bits at or above position `d` pinned to the single bit `1 << d`;
        // this is the fast "am I exactly at depth d" test from the spec.
        let mask = (1usize << d).wrapping_neg();
        let target = 1usize << d;
        let mut val = self.memory_map[id];
        while val < d || (id & mask) != target {
            id <<= 1;
            val = self.memory_map[id];
            if val > d {
                // left child can't serve depth d; take its right sibling.
                id ^= 1;
                val = self.memory_map[id];
            }
        }
        self.memory_map[id] = self.unusable;
        self.update_ancestors(id);
        Some(id as u32)
    }

    fn update_ancestors(&mut self, mut id: usize) {
        while id > 1 {
            let parent = id >> 1;
            let left_val = self.memory_map[parent << 1];
            let right_val = self.memory_map[(parent << 1) + 1];
            self.memory_map[parent] = left_val.min(right_val);
            id = parent;
        }
    }

    fn free_node(&mut self, id: usize) {
        self.memory_map[id] = self.depth_map[id];
        let mut cur = id;
        while cur > 1 {
            let parent = cur >> 1;
            let left = parent << 1;
            let right = left + 1;
            let left_val = self.memory_map[left];
            let right_val = self.memory_map[right];
            let child_depth = self.depth_map[left];
            if left_val == child_depth && right_val == child_depth {
                self.memory_map[parent] = child_depth - 1;
            } else {
                self.memory_map[parent] = left_val.min(right_val);
            }
            cur = parent;
        }
    }

    /// Allocates a run of `norm_capacity` bytes (`>= page_size`). Returns a
    /// run handle on success.
    pub fn allocate_run(&mut self, norm_capacity: usize) -> Option<Handle> {
        let d = self.max_order as i32
            - ((norm_capacity.trailing_zeros() as i32) - self.page_shifts as i32);
        debug_assert!(d >= 0, "requested run larger than chunk_size");
        let id = self.allocate_node(d as u8)?;
        self.free_bytes -= self.run_length(id);
        Some(Handle::for_run(id))
    }

    /// Allocates one element of `elem_size` bytes (`< page_size`) from a
    /// slab page, creating a new slab if none of this arena's existing
    /// pages for `elem_size` have room. `reuse` is an already-linked
    /// subpage of this size class to try first; if it has no room (or is
    /// absent) a fresh leaf is carved from the buddy tree.
    pub fn allocate_subpage(
        &mut self,
        elem_size: usize,
        reuse: Option<SubpageRef>,
    ) -> Option<(Handle, SubpageRef, bool)> {
        if let Some(subpage_ref) = reuse {
            debug_assert_eq!(subpage_ref.chunk_id, self.id);
            let page_idx = subpage_ref.page_idx as usize;
            if let Some(sp) = self.subpages[page_idx].as_mut() {
                if let Some(bitmap_idx) = sp.allocate() {
                    let leaf_id = page_idx ^ (1 << self.max_order);
                    return Some((
                        Handle::for_subpage(bitmap_idx, leaf_id as u32),
                        subpage_ref,
                        false,
                    ));
                }
            }
        }

        let leaf_id = self.allocate_node(self.max_order as u8)?;
        self.free_bytes -= self.run_length(leaf_id);
        let page_idx = self.subpage_idx(leaf_id);
        let mut sp = Subpage::new(elem_size, self.page_size);
        let bitmap_idx = sp.allocate().expect("fresh subpage always has room");
        self.subpages[page_idx] = Some(sp);
        trace!("chunk {} created subpage at leaf {leaf_id} for elem_size={elem_size}", self.id);
        let subpage_ref = SubpageRef {
            chunk_id: self.id,
            page_idx: page_idx as u32,
        };
        Some((Handle::for_subpage(bitmap_idx, leaf_id), subpage_ref, true))
    }

    /// Frees a previously-issued handle. `has_sibling` is only consulted
    /// for subpage handles (see [`Subpage::free`]). Returns `true` if a
    /// page was returned to the buddy tree (the caller must then unlink
    /// the corresponding subpage from its arena class list, if any).
    pub fn free(&mut self, handle: Handle, has_sibling: bool) -> bool {
        let memory_map_idx = handle.memory_map_idx();
        if handle.is_subpage() {
            let page_idx = self.subpage_idx(memory_map_idx);
            let retain = {
                let sp = self.subpages[page_idx]
                    .as_mut()
                    .expect("free of handle with no backing subpage");
                sp.free(handle.bitmap_idx(), has_sibling)
            };
            if retain {
                return false;
            }
            // subpage fully drained and no sibling remains: return the
            // page to the buddy tree and drop the slab bookkeeping.
            self.subpages[page_idx] = None;
            self.free_node(memory_map_idx as usize);
            self.free_bytes += self.run_length(memory_map_idx);
            trace!("chunk {} destroyed subpage at leaf {memory_map_idx}", self.id);
            true
        } else {
            self.free_bytes += self.run_length(memory_map_idx);
            self.free_node(memory_map_idx as usize);
            true
        }
    }

    /// Current overall usage, 0-100. Rounds on the free side
    /// (`100 - floor(free_bytes*100/chunk_size)`), matching the band
    /// semantics the spec derives from: at a threshold boundary this can
    /// differ from rounding the used side by one, and it is the free-side
    /// rounding that keeps a chunk from seating one bucket too low.
    pub fn usage(&self) -> u32 {
        if self.free_bytes == 0 {
            return 100;
        }
        let free_pct = (self.free_bytes as u128 * 100) / self.chunk_size as u128;
        100 - free_pct as u32
    }

    /// `true` iff the entire backing region is currently unallocated.
    pub fn is_fully_free(&self) -> bool {
        self.free_bytes == self.chunk_size
    }

    /// Used only by tests/invariant checks: compares `memory_map` against
    /// `depth_map` element-wise (true iff every node is maximally free).
    #[cfg(test)]
    pub fn memory_map_matches_depth_map(&self) -> bool {
        self.memory_map == self.depth_map
    }

    /// Reference to a live subpage, for invariant checks and the arena's
    /// free path.
    pub fn subpage(&self, page_idx: u32) -> Option<&Subpage> {
        self.subpages[page_idx as usize].as_ref()
    }

    pub fn subpage_mut(&mut self, page_idx: u32) -> Option<&mut Subpage> {
        self.subpages[page_idx as usize].as_mut()
    }

    /// A cheap `Arc` clone of this chunk's backing storage, handed to a
    /// [`crate::buffer::PoolBuffer`] so it can read/write its region
    /// directly, per §4.8's "records the backing region so future
    /// reads/writes can occur without further allocator interaction".
    pub fn memory_handle(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 8192;
    const MAX_ORDER: u32 = 11;
    const PAGE_SHIFTS: u32 = 13; // log2(8192)
    const CHUNK: usize = PAGE << MAX_ORDER;

    fn new_chunk(id: ChunkId) -> PoolChunk {
        PoolChunk::new(id, vec![0u8; CHUNK], 0, PAGE, PAGE_SHIFTS, MAX_ORDER)
    }

    #[test]
    fn fresh_chunk_is_fully_free() {
        let c = new_chunk(0);
        assert!(c.is_fully_free());
        assert!(c.memory_map_matches_depth_map());
        assert_eq!(c.usage(), 0);
    }

    #[test]
    fn scenario_b_three_page_runs() {
        let mut c = new_chunk(0);
        let mut handles = Vec::new();
        for _ in 0..3 {
            let h = c.allocate_run(PAGE).expect("room for a page run");
            handles.push(h);
        }
        let unique: std::collections::HashSet<_> = handles.iter().map(|h| h.memory_map_idx()).collect();
        assert_eq!(unique.len(), 3);
        assert_eq!(c.free_bytes, CHUNK - 3 * PAGE);
    }

    #[test]
    fn scenario_c_allocate_page_then_free_restores_state() {
        let mut c = new_chunk(0);
        let h = c.allocate_run(PAGE).unwrap();
        assert_eq!(c.free_bytes, CHUNK - PAGE);
        c.free(h, false);
        assert_eq!(c.free_bytes, CHUNK);
        assert!(c.memory_map_matches_depth_map());
    }

    #[test]
    fn allocate_whole_chunk_occupies_root() {
        let mut c = new_chunk(0);
        let h = c.allocate_run(CHUNK).unwrap();
        assert_eq!(h.memory_map_idx(), 1);
        assert_eq!(c.free_bytes, 0);
        assert!(c.allocate_run(PAGE).is_none());
        c.free(h, false);
        assert!(c.is_fully_free());
    }

    #[test]
    fn run_offset_and_length_partition_the_chunk() {
        let mut c = new_chunk(0);
        let mut spans = Vec::new();
        for _ in 0..4 {
            let h = c.allocate_run(PAGE * 4).unwrap();
            let off = c.run_offset(h.memory_map_idx());
            let len = c.run_length(h.memory_map_idx());
            spans.push((off, off + len));
        }
        spans.sort();
        for w in spans.windows(2) {
            assert!(w[0].1 <= w[1].0, "overlapping runs: {:?}", spans);
        }
    }

    #[test]
    fn subpage_lifecycle_round_trip() {
        let mut c = new_chunk(0);
        let (h1, subpage_ref, created) = c.allocate_subpage(16, None).unwrap();
        assert!(created);
        assert!(h1.is_subpage());
        let (h2, subpage_ref2, created2) = c.allocate_subpage(16, Some(subpage_ref)).unwrap();
        assert!(!created2);
        assert_eq!(subpage_ref, subpage_ref2);
        assert_ne!(h1.bitmap_idx(), h2.bitmap_idx());

        // free both; second free has no sibling, so the page returns to the tree.
        assert!(!c.free(h1, true));
        assert!(c.free(h2, false));
        assert!(c.is_fully_free());
        assert!(c.memory_map_matches_depth_map());
    }

    #[test]
    fn fill_slab_then_new_slab_created() {
        let mut c = new_chunk(0);
        let (_h, subpage_ref, _) = c.allocate_subpage(16, None).unwrap();
        for _ in 1..(PAGE / 16) {
            let (_h, r, created) = c.allocate_subpage(16, Some(subpage_ref)).unwrap();
            assert!(!created);
        }
        // slab is now full: allocate_subpage with the same ref must fall
        // through to a fresh page.
        let (_h, new_ref, created) = c.allocate_subpage(16, Some(subpage_ref)).unwrap();
        assert!(created);
        assert_ne!(new_ref, subpage_ref);
    }
}
