//! The allocation interface (§4.5): a boundary the core calls through but
//! never reaches past. The raw allocator and free-list layout are an
//! external collaborator — spec.md §1 explicitly puts their internals out of
//! scope — so this module defines only the seam: `allocate`/`publish_free`,
//! plus a minimal bump-style backend good enough to drive the core's own
//! tests without a real allocator collaborator attached.
//!
//! Grounded in `mmtk-core`'s `util/alloc::Allocator` trait (the same
//! "core calls an `Allocator`, never touches space internals" shape) and its
//! `BumpAllocator` (`util/alloc/bumpallocator.rs`) for the cursor/limit
//! bump-then-refill structure, re-expressed over `OffsetPtr`s into the
//! mmap'd object heap instead of `Address`.

use std::sync::Mutex;

use crate::offset_ptr::OffsetPtr;

/// Opaque handle the allocator hands back alongside an offset (§4.5
/// "gc_chunk*"). The core never interprets this; it only carries it for the
/// allocator's own bookkeeping and passes it back where an API expects one.
pub type GcChunkHandle = usize;

/// The external collaborator seen from the core (§4.5): allocate `size_words`
/// words, or publish a previously-live region of `size_words` words starting
/// at `offset` back to the free list. Neither method's internals are
/// specified here — any allocator the mutator's process links against can
/// implement this trait.
pub trait AllocationBackend: Send + Sync {
    /// Claims `size_words` words of fresh heap storage. Returns `None` if the
    /// backend is exhausted.
    fn allocate(&self, size_words: usize) -> Option<(OffsetPtr, GcChunkHandle)>;

    /// Returns a swept region to the backend's free list (§4.2 "publishes a
    /// free chunk to the global free list").
    fn publish_free(&self, offset: OffsetPtr, size_words: usize);
}

const WORD_BYTES: usize = std::mem::size_of::<u64>();

struct Inner {
    cursor_words: usize,
    free: Vec<(usize, usize)>,
}

/// A single-mutex bump allocator over a fixed-size arena, used by this
/// core's own end-to-end tests (§8) in place of a real allocator
/// collaborator. Freed regions are tracked as `(offset_words, size_words)`
/// pairs and served first-fit before the bump cursor advances into untouched
/// space — adequate for test scenarios, not a production free-list policy.
pub struct BumpAllocator {
    capacity_words: usize,
    inner: Mutex<Inner>,
}

impl BumpAllocator {
    pub fn new(capacity_words: usize) -> Self {
        BumpAllocator { capacity_words, inner: Mutex::new(Inner { cursor_words: 0, free: Vec::new() }) }
    }
}

impl AllocationBackend for BumpAllocator {
    fn allocate(&self, size_words: usize) -> Option<(OffsetPtr, GcChunkHandle)> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.free.iter().position(|&(_, len)| len >= size_words) {
            let (offset_words, len) = inner.free.remove(pos);
            if len > size_words {
                inner.free.push((offset_words + size_words, len - size_words));
            }
            return Some((OffsetPtr::from_raw((offset_words * WORD_BYTES) as isize), 0));
        }
        let new_cursor = inner.cursor_words + size_words;
        if new_cursor > self.capacity_words {
            return None;
        }
        let start = inner.cursor_words;
        inner.cursor_words = new_cursor;
        Some((OffsetPtr::from_raw((start * WORD_BYTES) as isize), 0))
    }

    fn publish_free(&self, offset: OffsetPtr, size_words: usize) {
        let offset_words = offset.raw() as usize / WORD_BYTES;
        self.inner.lock().unwrap().free.push((offset_words, size_words));
    }
}
