//! Buffer binding: initialising a caller-visible buffer object from a
//! handle's `(memory, offset, length)` triple (§4.8, §6's "Buffer binding
//! (consumed)").
//!
//! Grounded on `other_examples/abc72605_merlinai-com-quickstep__src-buffer.rs.rs`'s
//! minimal pooled-buffer-object shape (handle + offset + len + a reference
//! to the backing store, with safe slice accessors), generalised into a
//! small `BufferSink` trait so an embedding caller may bind to its own
//! buffer type, plus one concrete `PoolBuffer` implementation the façade's
//! convenience methods return.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{ArenaKind, PoolArena};
use crate::chunk::ChunkId;
use crate::error::AllocError;
use crate::handle::Handle;

/// Everything known about one live allocation at the moment it is bound to
/// a buffer: which handle it is, where its bytes live, and the requested
/// vs. allocated size (the latter is always `>=` the former, since requests
/// are normalised up to a class boundary before allocation).
pub struct Binding {
    /// `None` for an unpooled (`huge`) allocation, which has no owning
    /// chunk or arena.
    pub chunk_id: Option<ChunkId>,
    pub handle: Handle,
    pub memory: Arc<Mutex<Vec<u8>>>,
    pub absolute_offset: usize,
    pub request_capacity: usize,
    pub allocated_length: usize,
    /// Which of the façade's two backing strategies produced this
    /// allocation (kept even for `huge`/unpooled buffers so
    /// `PooledAllocator::reallocate` knows which convenience path to
    /// re-enter.
    pub kind: ArenaKind,
}

/// Binds a handle's backing region to a caller-supplied buffer type. The
/// allocator core depends only on this trait (§1's "mechanism for a caller
/// to bind a resulting (memory, offset, length) triple to a user-visible
/// buffer object"); `PoolBuffer` below is the crate's own implementation,
/// sufficient to exercise and test the allocator without a downstream
/// network-buffer type.
pub trait BufferSink {
    type Output;

    fn bind(&self, binding: Binding, arena: Option<Arc<PoolArena>>) -> Self::Output;
}

/// The default `BufferSink`: produces a [`PoolBuffer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolBufferSink;

impl BufferSink for PoolBufferSink {
    type Output = PoolBuffer;

    fn bind(&self, binding: Binding, arena: Option<Arc<PoolArena>>) -> PoolBuffer {
        let origin = match (binding.chunk_id, arena) {
            (Some(chunk_id), Some(arena)) => BufferOrigin::Pooled {
                arena,
                chunk_id,
                handle: binding.handle,
            },
            _ => BufferOrigin::Unpooled,
        };
        PoolBuffer {
            origin,
            memory: binding.memory,
            offset: binding.absolute_offset,
            allocated_length: binding.allocated_length,
            request_capacity: binding.request_capacity,
            kind: binding.kind,
        }
    }
}

/// Where a [`PoolBuffer`]'s bytes ultimately come from, and therefore how
/// freeing it must behave.
enum BufferOrigin {
    /// Backed by a slot inside one arena's chunk; freeing returns the slot
    /// to the arena (or a thread cache).
    Pooled {
        arena: Arc<PoolArena>,
        chunk_id: ChunkId,
        handle: Handle,
    },
    /// A `huge` request's raw, single-use backing region; freeing simply
    /// drops the memory.
    Unpooled,
}

/// A live allocation: a `(memory, offset, length)` view plus enough
/// identity to free or reallocate it later. Reads/writes go through a
/// lightweight per-chunk mutex (independent of the arena's allocation
/// mutex), matching §4.8's "future reads/writes can occur without further
/// allocator interaction", no call back into `PoolArena::allocate`/`free`
/// is needed to access the bytes, only a short-lived lock on this buffer's
/// own backing store.
pub struct PoolBuffer {
    origin: BufferOrigin,
    memory: Arc<Mutex<Vec<u8>>>,
    offset: usize,
    allocated_length: usize,
    request_capacity: usize,
    kind: ArenaKind,
}

impl PoolBuffer {
    /// The capacity the caller originally asked for (`<=` `allocated_length`).
    pub fn request_capacity(&self) -> usize {
        self.request_capacity
    }

    /// The normalised class size actually backing this buffer.
    pub fn allocated_length(&self) -> usize {
        self.allocated_length
    }

    pub fn is_unpooled(&self) -> bool {
        matches!(self.origin, BufferOrigin::Unpooled)
    }

    /// Runs `f` with a read-only view of this buffer's bytes.
    pub fn with_slice<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.memory.lock();
        f(&guard[self.offset..self.offset + self.allocated_length])
    }

    /// Runs `f` with a mutable view of this buffer's bytes.
    pub fn with_slice_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.memory.lock();
        f(&mut guard[self.offset..self.offset + self.allocated_length])
    }

    pub fn read_to_vec(&self) -> Vec<u8> {
        self.with_slice(|s| s.to_vec())
    }

    /// Overwrites the buffer's leading `data.len()` bytes (which must fit
    /// within `allocated_length`).
    pub fn write(&self, data: &[u8]) {
        assert!(data.len() <= self.allocated_length, "write overflows allocated region");
        self.with_slice_mut(|s| s[..data.len()].copy_from_slice(data));
    }

    /// Copies `min(self.len, other.len)` bytes from `other` into `self`,
    /// used by `PooledAllocator::reallocate` (§6).
    pub(crate) fn copy_from(&self, other: &PoolBuffer) {
        let n = self.allocated_length.min(other.allocated_length);
        let src = other.read_to_vec();
        self.with_slice_mut(|dst| dst[..n].copy_from_slice(&src[..n]));
    }

    pub(crate) fn chunk_id(&self) -> Option<ChunkId> {
        match &self.origin {
            BufferOrigin::Pooled { chunk_id, .. } => Some(*chunk_id),
            BufferOrigin::Unpooled => None,
        }
    }

    pub(crate) fn handle(&self) -> Option<Handle> {
        match &self.origin {
            BufferOrigin::Pooled { handle, .. } => Some(*handle),
            BufferOrigin::Unpooled => None,
        }
    }

    pub(crate) fn home_arena(&self) -> Option<&Arc<PoolArena>> {
        match &self.origin {
            BufferOrigin::Pooled { arena, .. } => Some(arena),
            BufferOrigin::Unpooled => None,
        }
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn memory(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.memory)
    }

    pub(crate) fn kind(&self) -> ArenaKind {
        self.kind
    }
}

/// Builds the unpooled (`huge`) buffer variant directly from a freshly
/// acquired backing region (§4.2's "Unpooled chunks"). `offset`/`length`
/// let a `DirectBacking`-sourced region (padded for alignment) expose only
/// its usable, aligned span rather than the full over-allocated buffer.
pub fn bind_unpooled(
    memory: Vec<u8>,
    offset: usize,
    length: usize,
    request_capacity: usize,
    kind: ArenaKind,
) -> Result<PoolBuffer, AllocError> {
    debug_assert!(offset + length <= memory.len());
    Ok(PoolBuffer {
        origin: BufferOrigin::Unpooled,
        memory: Arc::new(Mutex::new(memory)),
        offset,
        allocated_length: length,
        request_capacity,
        kind,
    })
}
