//! The external-reference-table spine (§4.3 "Allocation"): up to `n_blocks`
//! lazily-allocated blocks of `block_size` slots each, with a mutex guarding
//! spine growth and free-list transfer but not per-slot reads.
//!
//! Grounded in `mmtk-core`'s block-structured `util/heap` allocators for the
//! lazily-grown-block shape, adapted to the original's own spine-of-blocks
//! free list (`original_source/include/mpgc/external_gc_ptr.h`).

use std::sync::Mutex;

use crate::offset_ptr::OffsetPtr;
use crate::xrt::slot::Slot;

struct Inner {
    spine: Vec<Option<Box<[Slot]>>>,
    free_head: Option<u32>,
    next_new: usize,
}

impl Inner {
    /// Returns a pointer to `index`'s slot, allocating its containing block
    /// on first touch. Must be called while holding the table's mutex; the
    /// returned pointer stays valid for the table's lifetime regardless,
    /// since a spine entry is only ever set once and never moved or dropped.
    fn slot_ptr(&mut self, block_size: usize, index: usize) -> *const Slot {
        let block_idx = index / block_size;
        let offset = index % block_size;
        if self.spine[block_idx].is_none() {
            let block: Vec<Slot> = (0..block_size).map(|_| Slot::new_free(None)).collect();
            self.spine[block_idx] = Some(block.into_boxed_slice());
        }
        &self.spine[block_idx].as_ref().unwrap()[offset] as *const Slot
    }
}

pub struct XrtTable {
    inner: Mutex<Inner>,
    block_size: usize,
    n_blocks: usize,
}

impl XrtTable {
    pub fn new(block_size: usize, n_blocks: usize) -> Self {
        let mut spine = Vec::with_capacity(n_blocks);
        spine.resize_with(n_blocks, || None);
        XrtTable { inner: Mutex::new(Inner { spine, free_head: None, next_new: 0 }), block_size, n_blocks }
    }

    pub fn capacity(&self) -> usize {
        self.block_size * self.n_blocks
    }

    /// Reads `index`'s slot pointer, growing its block if needed. Used by
    /// every read/write below; callers outside this module should prefer
    /// the higher-level operations.
    ///
    /// # Safety
    /// `index` must be `< capacity()`.
    unsafe fn slot(&self, index: usize) -> &Slot {
        let mut inner = self.inner.lock().unwrap();
        let ptr = inner.slot_ptr(self.block_size, index);
        // SAFETY: the pointer was just produced from a live allocation that
        // outlives `self`; the lock is only needed to create or find it.
        unsafe { &*ptr }
    }

    /// Claims a slot for `referent`, reusing a freed index before growing
    /// the spine (§4.3 "Allocation"). Returns `None` once both the free
    /// list and every block are exhausted.
    pub fn alloc(&self, referent: OffsetPtr) -> Option<u32> {
        let index = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(free) = inner.free_head {
                let next = {
                    let ptr = inner.slot_ptr(self.block_size, free as usize);
                    unsafe { (*ptr).next_free() }
                };
                inner.free_head = next;
                free
            } else {
                if inner.next_new >= self.block_size * self.n_blocks {
                    return None;
                }
                let idx = inner.next_new as u32;
                inner.next_new += 1;
                idx
            }
        };
        // SAFETY: `index` was just claimed and is `< capacity()`.
        unsafe { self.slot(index as usize) }.set_in_use(referent);
        Some(index)
    }

    /// Re-stamps an already-claimed slot with a new referent, bypassing the
    /// free-list bookkeeping in [`XrtTable::alloc`]. Used when a thread's
    /// local free-index cache hands back an index it never returned to the
    /// table's own free list (§4.3 "Per-thread cache... to satisfy
    /// anchor-create without touching the mutex").
    pub(crate) fn restamp(&self, index: u32, referent: OffsetPtr) {
        // SAFETY: the caller holds exclusive, just-dequeued ownership of
        // `index` (it is neither on the table's free list nor in use).
        unsafe { self.slot(index as usize) }.set_in_use(referent);
    }

    /// Returns `index`'s slot to the free list (§4.3 anchor release).
    pub fn release(&self, index: u32) {
        let mut inner = self.inner.lock().unwrap();
        let next = inner.free_head;
        let ptr = inner.slot_ptr(self.block_size, index as usize);
        unsafe { (*ptr).set_free(next) };
        inner.free_head = Some(index);
    }

    /// Marks `index`'s slot free without linking it into the table's own
    /// free-list chain (§4.3 "roots... reflects whether an anchor is
    /// live, independent of which free list currently holds the index").
    /// Used when a released index is being handed to a thread's local
    /// free-index cache instead of the table's free list: the index must
    /// stop counting as a root the moment its anchor drops, even though it
    /// isn't reachable by walking `free_head` until [`XrtTable::release`]
    /// (or this thread dying) returns it there.
    pub(crate) fn mark_free_unlinked(&self, index: u32) {
        // SAFETY: the caller holds exclusive, just-released ownership of
        // `index` (its last `Anchor` has already dropped).
        unsafe { self.slot(index as usize) }.set_free(None);
    }

    pub fn referent(&self, index: u32) -> Option<OffsetPtr> {
        // SAFETY: callers only hold indices this table itself handed out.
        unsafe { self.slot(index as usize) }.referent()
    }

    /// Every currently in-use slot's referent (§4.3 "the set of slots
    /// currently in use is a root of the collector"). Called at preMarking.
    pub fn roots(&self) -> Vec<OffsetPtr> {
        let allocated = self.inner.lock().unwrap().next_new;
        (0..allocated).filter_map(|i| self.referent(i as u32)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_release_then_realloc_reuses_the_slot() {
        let t = XrtTable::new(4, 2);
        let a = t.alloc(OffsetPtr::from_raw(800)).unwrap();
        assert_eq!(t.referent(a), Some(OffsetPtr::from_raw(800)));
        t.release(a);
        let b = t.alloc(OffsetPtr::from_raw(1600)).unwrap();
        assert_eq!(b, a);
        assert_eq!(t.referent(b), Some(OffsetPtr::from_raw(1600)));
    }

    #[test]
    fn allocation_spans_multiple_lazily_grown_blocks() {
        let t = XrtTable::new(2, 3);
        let indices: Vec<u32> = (0..6).map(|i| t.alloc(OffsetPtr::from_raw(8 * (i + 1))).unwrap()).collect();
        assert_eq!(indices.len(), 6);
        assert!(t.alloc(OffsetPtr::from_raw(8)).is_none());
    }

    #[test]
    fn roots_reports_only_in_use_slots() {
        let t = XrtTable::new(4, 1);
        let a = t.alloc(OffsetPtr::from_raw(800)).unwrap();
        let b = t.alloc(OffsetPtr::from_raw(1600)).unwrap();
        t.release(a);
        let roots = t.roots();
        assert_eq!(roots, vec![OffsetPtr::from_raw(1600)]);
        let _ = b;
    }
}
