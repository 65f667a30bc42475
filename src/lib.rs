//! `pooled-alloc`: a two-level pooled byte-buffer allocator.
//!
//! Large backing regions ("chunks") are carved into page-sized runs by a
//! complete-binary-tree buddy algorithm ([`chunk`]); individual pages are
//! further split into fixed-size "slab" elements tracked by bitmaps
//! ([`subpage`]). An [`arena::PoolArena`] owns a set of chunks plus
//! per-size-class subpage lists behind one mutex, and a per-thread
//! [`thread_cache::ThreadCache`] shields that mutex from the hot
//! allocate/free path. [`facade::PooledAllocator`] ties the pieces
//! together: normalise a request's size, pick a home arena per thread, and
//! bind the resulting `(memory, offset, length)` triple to a
//! [`buffer::PoolBuffer`].
//!
//! ```
//! use pooled_alloc::{Config, PooledAllocator};
//!
//! let alloc = PooledAllocator::new(Config::new()).unwrap();
//! let buf = alloc.allocate(128).unwrap();
//! buf.write(b"hello");
//! assert_eq!(&buf.read_to_vec()[..5], b"hello");
//! alloc.free(buf).unwrap();
//! ```
//!
//! The allocator core never touches the network/channel stack its original
//! host repository is embedded in: it consumes only a
//! [`backing::BackingProvider`] for raw memory and exposes a
//! [`buffer::BufferSink`] a caller may implement to bind allocations to its
//! own buffer type, instead of [`buffer::PoolBuffer`].

pub mod arena;
pub mod backing;
pub mod buffer;
pub mod chunk;
pub mod chunk_list;
pub mod config;
pub mod error;
pub mod facade;
pub mod handle;
pub mod size_class;
pub mod stats;
pub mod subpage;
pub mod thread_cache;

pub use arena::{ArenaAlloc, ArenaKind, PoolArena};
pub use backing::{BackingProvider, DirectBacking, HeapBacking};
pub use buffer::{BufferSink, PoolBuffer, PoolBufferSink};
pub use config::Config;
pub use error::AllocError;
pub use facade::PooledAllocator;
pub use handle::Handle;
pub use size_class::SizeClass;
pub use stats::{ArenaSnapshot, Snapshot};
