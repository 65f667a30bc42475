//! Size classes and request normalisation.

/// The coarse class a normalised request capacity falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Multiples of 16 B, `[16, 496]`.
    Tiny,
    /// Powers of two, `[512, pageSize)`.
    Small,
    /// Powers of two, `[pageSize, chunkSize]`.
    Normal,
    /// Strictly greater than `chunkSize`; bypasses pooling.
    Huge,
}

const TINY_STEP: usize = 16;
const TINY_MAX: usize = 496;
const SMALL_MIN: usize = 512;

/// Rounds `size` up to the allocator's normalised class boundary, given the
/// arena's `chunk_size`. Idempotent: `normalize(normalize(x)) == normalize(x)`,
/// and `normalize(x) >= x`. Requests above `chunk_size` are `huge` and pass
/// through unrounded (they bypass pooling entirely).
pub fn normalize(size: usize, chunk_size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    if size > chunk_size {
        // huge: unpooled, no rounding beyond the raw request.
        return size;
    }
    if size < SMALL_MIN {
        normalize_tiny(size)
    } else {
        normalize_pow2(size)
    }
}

/// Round a sub-512B request up to the next multiple of 16.
fn normalize_tiny(size: usize) -> usize {
    if size & 15 == 0 {
        size.max(TINY_STEP)
    } else {
        (size & !15) + TINY_STEP
    }
}

/// Classic five-stage bit-smear round-up to the next power of two.
pub fn normalize_pow2(size: usize) -> usize {
    let mut n = size.wrapping_sub(1);
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    #[cfg(target_pointer_width = "64")]
    {
        n |= n >> 32;
    }
    n.wrapping_add(1)
}

/// Further rounds `size` up to `alignment` (a power of two), if alignment
/// is non-zero (0 means "disabled").
pub fn align_up(size: usize, alignment: usize) -> usize {
    if alignment == 0 {
        size
    } else {
        (size + alignment - 1) & !(alignment - 1)
    }
}

/// Classifies an already-normalised capacity given the arena's geometry.
pub fn classify(normalized: usize, page_size: usize, chunk_size: usize) -> SizeClass {
    if normalized > chunk_size {
        SizeClass::Huge
    } else if normalized >= page_size {
        SizeClass::Normal
    } else if normalized >= SMALL_MIN {
        SizeClass::Small
    } else {
        SizeClass::Tiny
    }
}

/// Index of a tiny class (`size / 16 - 1`), for table-driven subpage head
/// lookups. Valid only for `size` in `[16, 496]`.
pub fn tiny_idx(size: usize) -> usize {
    debug_assert!(size >= TINY_STEP && size <= TINY_MAX && size % TINY_STEP == 0);
    size / TINY_STEP - 1
}

/// Number of tiny classes (16, 32, ..., 496).
pub const NUM_TINY_CLASSES: usize = TINY_MAX / TINY_STEP;

/// Index of a small class (log2(size) - log2(512)), for table-driven
/// subpage head lookups. Valid only for powers of two in `[512, pageSize)`.
pub fn small_idx(size: usize) -> usize {
    debug_assert!(size >= SMALL_MIN && size.is_power_of_two());
    (size.trailing_zeros() - SMALL_MIN.trailing_zeros()) as usize
}

/// Number of small classes given `page_size` (powers of two from 512 up to
/// but excluding `page_size`).
pub fn num_small_classes(page_size: usize) -> usize {
    debug_assert!(page_size.is_power_of_two() && page_size >= SMALL_MIN);
    (page_size.trailing_zeros() - SMALL_MIN.trailing_zeros()) as usize
}

/// Index of a normal class (`log2(size) - log2(page_size)`), for
/// table-driven thread-cache queue lookups. Valid only for powers of two in
/// `[page_size, chunk_size]`.
pub fn normal_idx(size: usize, page_size: usize) -> usize {
    debug_assert!(size >= page_size && size.is_power_of_two());
    (size.trailing_zeros() - page_size.trailing_zeros()) as usize
}

/// Number of normal classes given `page_size`/`chunk_size` (powers of two
/// from `page_size` up to and including `chunk_size`).
pub fn num_normal_classes(page_size: usize, chunk_size: usize) -> usize {
    debug_assert!(chunk_size.is_power_of_two() && page_size.is_power_of_two());
    (chunk_size.trailing_zeros() - page_size.trailing_zeros()) as usize + 1
}
