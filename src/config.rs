//! Validated, builder-style allocator configuration.
//!
//! `Config` is a plain struct constructed via `with_*` setters and checked
//! once, explicitly, in [`Config::validate`] (no environment/CLI sniffing
//! and no persisted state, per §6).

use crate::error::AllocError;

/// Largest permitted `page_size << max_order` product (1 GiB, per §6).
const MAX_CHUNK_SIZE: usize = 1 << 30;

/// Allocator construction knobs, with defaults matching §6.
#[derive(Debug, Clone)]
pub struct Config {
    pub page_size: usize,
    pub max_order: u32,
    pub heap_arena_count: usize,
    pub direct_arena_count: usize,
    pub tiny_cache_size: usize,
    pub small_cache_size: usize,
    pub normal_cache_size: usize,
    pub cache_line_alignment: usize,
    pub use_cache_for_all_threads: bool,
}

impl Default for Config {
    fn default() -> Config {
        let cpus = num_cpus::get().max(1);
        Config {
            page_size: 8 * 1024,
            max_order: 11,
            heap_arena_count: 2 * cpus,
            direct_arena_count: 2 * cpus,
            tiny_cache_size: 512,
            small_cache_size: 256,
            normal_cache_size: 64,
            cache_line_alignment: 0,
            use_cache_for_all_threads: true,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> Config {
        self.page_size = page_size;
        self
    }

    pub fn with_max_order(mut self, max_order: u32) -> Config {
        self.max_order = max_order;
        self
    }

    pub fn with_heap_arena_count(mut self, count: usize) -> Config {
        self.heap_arena_count = count;
        self
    }

    pub fn with_direct_arena_count(mut self, count: usize) -> Config {
        self.direct_arena_count = count;
        self
    }

    pub fn with_tiny_cache_size(mut self, size: usize) -> Config {
        self.tiny_cache_size = size;
        self
    }

    pub fn with_small_cache_size(mut self, size: usize) -> Config {
        self.small_cache_size = size;
        self
    }

    pub fn with_normal_cache_size(mut self, size: usize) -> Config {
        self.normal_cache_size = size;
        self
    }

    pub fn with_cache_line_alignment(mut self, alignment: usize) -> Config {
        self.cache_line_alignment = alignment;
        self
    }

    pub fn with_use_cache_for_all_threads(mut self, enabled: bool) -> Config {
        self.use_cache_for_all_threads = enabled;
        self
    }

    /// `page_size << max_order`.
    pub fn chunk_size(&self) -> usize {
        self.page_size << self.max_order
    }

    /// `log2(page_size)`.
    pub fn page_shifts(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    /// Checks every invariant §7 requires of construction-time config.
    /// Called once by [`crate::facade::PooledAllocator::new`]; never
    /// re-validated afterwards, since `Config` fields are immutable once
    /// an allocator is built.
    pub fn validate(&self) -> Result<(), AllocError> {
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err(AllocError::InvalidConfig(format!(
                "page_size must be a power of two >= 512, got {}",
                self.page_size
            )));
        }
        if self.max_order > 14 {
            return Err(AllocError::InvalidConfig(format!(
                "max_order must be <= 14, got {}",
                self.max_order
            )));
        }
        if self.chunk_size() > MAX_CHUNK_SIZE {
            return Err(AllocError::InvalidConfig(format!(
                "page_size << max_order = {} exceeds the 1 GiB chunk size ceiling",
                self.chunk_size()
            )));
        }
        if self.heap_arena_count == 0 && self.direct_arena_count == 0 {
            return Err(AllocError::InvalidConfig(
                "at least one of heap_arena_count/direct_arena_count must be non-zero".into(),
            ));
        }
        if self.cache_line_alignment != 0 && !self.cache_line_alignment.is_power_of_two() {
            return Err(AllocError::InvalidConfig(format!(
                "cache_line_alignment must be 0 or a power of two, got {}",
                self.cache_line_alignment
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
        assert_eq!(Config::default().chunk_size(), 16 * 1024 * 1024);
        assert_eq!(Config::default().page_shifts(), 13);
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let cfg = Config::new().with_page_size(1000);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_oversized_chunk() {
        let cfg = Config::new().with_page_size(1 << 20).with_max_order(14);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_alignment() {
        let cfg = Config::new().with_cache_line_alignment(100);
        assert!(cfg.validate().is_err());
        assert!(Config::new().with_cache_line_alignment(128).validate().is_ok());
    }

    #[test]
    fn rejects_zero_arenas() {
        let cfg = Config::new().with_heap_arena_count(0).with_direct_arena_count(0);
        assert!(cfg.validate().is_err());
    }
}
