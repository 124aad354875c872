//! The two tiers of caching that keep anchor-create off the spine's mutex
//! and off repeated table probes for a hot object (§4.3 "Per-thread cache",
//! "Global cache").
//!
//! Two independent caches live here:
//! - a per-thread LIFO of *freed slot indices*, so releasing and re-creating
//!   an anchor on the same thread never touches [`XrtTable`]'s mutex;
//! - a per-thread and a process-wide *weak-reference hit cache*, keyed by
//!   the low bits of the referent's offset, so re-anchoring an object that's
//!   already anchored returns the existing [`Anchor`] instead of claiming a
//!   fresh slot. Both are literally `Weak<AnchorHandle>` — Rust's own weak
//!   reference already has exactly the "correct but possibly stale, upgrade
//!   may fail" semantics §4.3 asks for, so there's no need to hand-roll a
//!   generation counter.

use std::cell::RefCell;
use std::sync::{Arc, Mutex, Weak};

use lazy_static::lazy_static;

use crate::config;
use crate::offset_ptr::OffsetPtr;
use crate::xrt::anchor::{Anchor, AnchorHandle};
use crate::xrt::table::XrtTable;

struct FreeIndexCache {
    table: Option<Arc<XrtTable>>,
    indices: Vec<u32>,
}

impl Drop for FreeIndexCache {
    fn drop(&mut self) {
        donate(self);
    }
}

fn donate(cache: &mut FreeIndexCache) {
    if let Some(table) = cache.table.take() {
        for idx in cache.indices.drain(..) {
            table.release(idx);
        }
    }
}

fn rebind(cache: &mut FreeIndexCache, table: &Arc<XrtTable>) {
    let same = cache.table.as_ref().is_some_and(|t| Arc::ptr_eq(t, table));
    if !same {
        donate(cache);
        cache.table = Some(table.clone());
    }
}

thread_local! {
    static FREE_INDEX_CACHE: RefCell<FreeIndexCache> =
        RefCell::new(FreeIndexCache { table: None, indices: Vec::new() });
    static LOCAL_WEAK_CACHE: RefCell<Vec<Option<Weak<AnchorHandle>>>> =
        RefCell::new(vec![None; local_cache_capacity()]);
}

fn local_cache_capacity() -> usize {
    config::Options::from_env().local_cache_size.get() as usize
}

fn global_cache_capacity() -> usize {
    config::Options::from_env().global_cache_size.get() as usize
}

/// Pops a cached free slot index for `table`, without touching its mutex
/// (§4.3 "without touching the mutex in the common case").
pub fn try_take_cached(table: &Arc<XrtTable>) -> Option<u32> {
    FREE_INDEX_CACHE.with(|cell| {
        let mut cache = cell.borrow_mut();
        rebind(&mut cache, table);
        cache.indices.pop()
    })
}

/// Returns a released slot index to this thread's cache, falling back to
/// the table's own free list once the cache is full. Either way the slot
/// itself is marked free immediately, so it stops being a GC root as soon
/// as its last `Anchor` drops (§4.3) regardless of which free list ends up
/// holding the index.
pub fn release_or_cache(table: &Arc<XrtTable>, index: u32, capacity: usize) {
    FREE_INDEX_CACHE.with(|cell| {
        let mut cache = cell.borrow_mut();
        rebind(&mut cache, table);
        if cache.indices.len() < capacity {
            table.mark_free_unlinked(index);
            cache.indices.push(index);
        } else {
            table.release(index);
        }
    });
}

fn cache_index(p: OffsetPtr, len: usize) -> usize {
    (p.raw() as usize) & (len - 1)
}

/// Looks up a live, still-valid anchor for `p` in this thread's local weak
/// cache (§4.3 "a hit returns the existing anchor without touching the
/// global cache").
pub fn lookup_local(p: OffsetPtr) -> Option<Anchor> {
    LOCAL_WEAK_CACHE.with(|cell| {
        let cache = cell.borrow();
        let idx = cache_index(p, cache.len());
        let handle = cache[idx].as_ref()?.upgrade()?;
        if handle.table().referent(handle.index()) == Some(p) {
            Some(Anchor::from_handle(handle))
        } else {
            None
        }
    })
}

pub fn publish_local(p: OffsetPtr, anchor: &Anchor) {
    LOCAL_WEAK_CACHE.with(|cell| {
        let mut cache = cell.borrow_mut();
        let idx = cache_index(p, cache.len());
        cache[idx] = Some(Arc::downgrade(anchor.handle()));
    });
}

struct GlobalEntry(Mutex<Option<Weak<AnchorHandle>>>);

struct GlobalCache {
    entries: Vec<GlobalEntry>,
}

impl GlobalCache {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(1);
        let entries = (0..capacity).map(|_| GlobalEntry(Mutex::new(None))).collect();
        GlobalCache { entries }
    }

    /// A `try_lock` here *is* the "coarse per-entry test-and-set lock"
    /// (§4.3): contention is reported as a cache miss rather than waited on,
    /// matching "readers that fail to acquire the lock fall back to
    /// creating a fresh anchor".
    fn lookup(&self, p: OffsetPtr) -> Option<Anchor> {
        let entry = &self.entries[cache_index(p, self.entries.len())];
        let guard = entry.0.try_lock().ok()?;
        let handle = guard.as_ref()?.upgrade()?;
        if handle.table().referent(handle.index()) == Some(p) {
            Some(Anchor::from_handle(handle))
        } else {
            None
        }
    }

    fn publish(&self, p: OffsetPtr, anchor: &Anchor) {
        let entry = &self.entries[cache_index(p, self.entries.len())];
        if let Ok(mut guard) = entry.0.try_lock() {
            *guard = Some(Arc::downgrade(anchor.handle()));
        }
    }
}

lazy_static! {
    static ref GLOBAL_CACHE: GlobalCache = GlobalCache::new(global_cache_capacity());
}

pub fn lookup_global(p: OffsetPtr) -> Option<Anchor> {
    GLOBAL_CACHE.lookup(p)
}

pub fn publish_global(p: OffsetPtr, anchor: &Anchor) {
    GLOBAL_CACHE.publish(p, anchor);
}
