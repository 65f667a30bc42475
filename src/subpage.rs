//! A subpage is one leaf page of a [`PoolChunk`](crate::chunk::PoolChunk)
//! carved into `maxNumElems` equal-size elements, tracked by a bitmap.
//!
//! Generalises the teacher's `Bitfield`/`AllocablePage` pair (a fixed 8 KiB
//! page split into a fixed object size) to a page whose `elem_size` and
//! `bitmap_len` are runtime parameters, and replaces the teacher's raw
//! `Rawlink<T>` intrusive list with index-based [`SubpageRef`] links so that
//! subpage list membership never needs `unsafe`.

use log::trace;

/// Identifies a subpage by the chunk that owns it and its leaf index within
/// that chunk's `subpages` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubpageRef {
    pub chunk_id: u32,
    pub page_idx: u32,
}

/// Bitmap-tracked slab living inside one buddy-tree leaf page.
#[derive(Debug)]
pub struct Subpage {
    /// Fixed element size served by this slab (one tiny/small class).
    pub elem_size: usize,
    /// `page_size / elem_size`.
    pub max_num_elems: usize,
    /// Number of words of `bitmap` actually in use: `ceil(max_num_elems / 64)`.
    pub bitmap_len: usize,
    /// One bit per element; a set bit denotes "allocated". Sized for the
    /// smallest element class (`page_size / 16 / 64` words); only the first
    /// `bitmap_len` entries are meaningful.
    bitmap: Vec<u64>,
    /// Free element count.
    pub num_avail: usize,
    /// A one-element hint cache: the most recently freed slot, consumed
    /// directly by the next allocation and then invalidated. `None` when
    /// there is no such hint.
    next_avail: Option<u32>,
    /// False once the subpage has been unlinked and its page returned to
    /// the buddy tree; a destroyed subpage must never be allocated from.
    pub do_not_destroy: bool,
    /// Doubly-linked membership in the arena's per-size-class subpage head
    /// list. `None` for `prev` means "this is the first real node after the
    /// head"; `None` for `next` means "this is the last node".
    pub prev: Option<SubpageRef>,
    pub next: Option<SubpageRef>,
}

impl Subpage {
    /// Creates a new slab for `elem_size`-byte elements inside a page of
    /// `page_size` bytes. All elements start free.
    pub fn new(elem_size: usize, page_size: usize) -> Subpage {
        let max_num_elems = page_size / elem_size;
        let bitmap_len = (max_num_elems + 63) / 64;
        let smallest_elem_size = 16;
        let full_bitmap_words = page_size / smallest_elem_size / 64;
        Subpage {
            elem_size,
            max_num_elems,
            bitmap_len,
            bitmap: vec![0u64; full_bitmap_words.max(bitmap_len).max(1)],
            num_avail: max_num_elems,
            next_avail: None,
            do_not_destroy: true,
            prev: None,
            next: None,
        }
    }

    #[inline(always)]
    fn is_allocated(&self, idx: u32) -> bool {
        let word = (idx as usize) >> 6;
        let bit = idx & 63;
        self.bitmap[word] & (1u64 << bit) != 0
    }

    #[inline(always)]
    fn set_bit(&mut self, idx: u32) {
        let word = (idx as usize) >> 6;
        let bit = idx & 63;
        self.bitmap[word] |= 1u64 << bit;
    }

    #[inline(always)]
    fn clear_bit(&mut self, idx: u32) {
        let word = (idx as usize) >> 6;
        let bit = idx & 63;
        self.bitmap[word] &= !(1u64 << bit);
    }

    /// First free bit in `bitmap[0..bitmap_len)`, scanning words low to
    /// high and bits LSB to MSB within a word. `O(bitmap_len)` worst case.
    fn find_first_fit(&self) -> Option<u32> {
        for word_idx in 0..self.bitmap_len {
            let word = self.bitmap[word_idx];
            if word == u64::MAX {
                continue;
            }
            let first_free_bit = (!word).trailing_zeros();
            let idx = (word_idx as u32) * 64 + first_free_bit;
            if (idx as usize) < self.max_num_elems {
                return Some(idx);
            }
        }
        None
    }

    /// Allocates one element, returning its bitmap index, or `None` if the
    /// subpage is exhausted or has been marked for destruction.
    pub fn allocate(&mut self) -> Option<u32> {
        if self.num_avail == 0 || !self.do_not_destroy {
            return None;
        }

        let idx = match self.next_avail.take() {
            Some(idx) => idx,
            None => self.find_first_fit()?,
        };

        debug_assert!(!self.is_allocated(idx));
        self.set_bit(idx);
        self.num_avail -= 1;
        Some(idx)
    }

    /// Frees element `idx`. Returns `true` if the page must be retained as
    /// a slab (still in use, or the sole survivor of its class list);
    /// returns `false` iff the subpage has become fully free *and* the
    /// caller should treat it as no longer needed; the chunk is then
    /// responsible for unlinking it and returning the page to the buddy
    /// tree. The `has_sibling` flag tells us whether another subpage of
    /// this element size remains in the arena's class list; per the spec
    /// (§9 Open Question 2) a lone empty subpage is deliberately kept
    /// around rather than destroyed, to avoid thrashing.
    pub fn free(&mut self, idx: u32, has_sibling: bool) -> bool {
        debug_assert!(self.is_allocated(idx), "double free of slot {idx}");
        let was_full = self.num_avail == 0;
        self.clear_bit(idx);
        self.next_avail = Some(idx);
        self.num_avail += 1;

        if was_full {
            trace!("subpage relinked after first free, elem_size={}", self.elem_size);
        }

        if self.num_avail == self.max_num_elems {
            !has_sibling
        } else {
            true
        }
    }

    /// `true` iff this subpage should be present in its class's head list:
    /// it has free capacity and hasn't been marked for destruction.
    pub fn should_be_linked(&self) -> bool {
        self.num_avail > 0 && self.do_not_destroy
    }
}
