//! Anchors (§4.3 "Creation of an anchor") and sub-anchors (§11.1).
//!
//! An `Anchor` is a cheaply-cloneable handle onto a claimed table slot: the
//! slot's strong heap reference is what actually roots the object, so as
//! long as any clone of the `Anchor` is alive, the referent is a GC root.
//! The last clone's drop releases the slot — back to this thread's free
//! cache if there's room, otherwise straight to the table's free list
//! (§4.3 "on last external-reference drop, the hook returns the slot to the
//! per-thread free list").

use std::ops::{Add, Sub};
use std::sync::Arc;

use crate::offset_ptr::{ByteOffset, OffsetPtr};
use crate::xrt::cache;
use crate::xrt::table::XrtTable;

/// The slot-owning half of an anchor; `Anchor` is `Arc<AnchorHandle>` so
/// multiple anchor handles (e.g. a cache hit and the handle that created the
/// entry) can share the same claimed slot.
pub struct AnchorHandle {
    table: Arc<XrtTable>,
    index: u32,
    local_cache_capacity: usize,
}

impl Drop for AnchorHandle {
    fn drop(&mut self) {
        cache::release_or_cache(&self.table, self.index, self.local_cache_capacity);
    }
}

impl AnchorHandle {
    pub(crate) fn table(&self) -> &Arc<XrtTable> {
        &self.table
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }
}

#[derive(Clone)]
pub struct Anchor(Arc<AnchorHandle>);

impl Anchor {
    /// Creates (or reuses, via the weak-reference hit caches) an anchor for
    /// `referent` (§4.3 "Creation of an anchor"). Returns `None` only if the
    /// table is exhausted and the per-thread/global caches offer no hit.
    pub fn create(table: &Arc<XrtTable>, referent: OffsetPtr, local_cache_capacity: usize) -> Option<Anchor> {
        if let Some(hit) = cache::lookup_local(referent) {
            return Some(hit);
        }
        if let Some(hit) = cache::lookup_global(referent) {
            cache::publish_local(referent, &hit);
            return Some(hit);
        }
        let index = match cache::try_take_cached(table) {
            // a slot drawn from the thread-local free cache still holds
            // whatever it was stamped with before release; restamp it.
            Some(idx) => {
                table.restamp(idx, referent);
                idx
            }
            None => table.alloc(referent)?,
        };
        let handle = Arc::new(AnchorHandle { table: table.clone(), index, local_cache_capacity });
        let anchor = Anchor(handle);
        cache::publish_local(referent, &anchor);
        cache::publish_global(referent, &anchor);
        Some(anchor)
    }

    pub fn referent(&self) -> OffsetPtr {
        self.0.table.referent(self.0.index).expect("anchor's slot is in use for its entire lifetime")
    }

    pub fn slot_index(&self) -> u32 {
        self.0.index
    }

    pub(crate) fn handle(&self) -> &Arc<AnchorHandle> {
        &self.0
    }

    pub(crate) fn from_handle(handle: Arc<AnchorHandle>) -> Anchor {
        Anchor(handle)
    }
}

/// An interior pointer into an anchored object, kept alive by pairing it
/// with the whole-object `Anchor` (§11.1). Arithmetic and comparisons act on
/// the interior pointer; the anchor is carried along purely to keep the
/// enclosing object rooted.
#[derive(Clone)]
pub struct SubAnchor {
    anchor: Anchor,
    interior: OffsetPtr,
}

impl SubAnchor {
    pub fn new(anchor: Anchor, interior: OffsetPtr) -> Self {
        SubAnchor { anchor, interior }
    }

    pub fn anchor(&self) -> &Anchor {
        &self.anchor
    }

    pub fn interior(&self) -> OffsetPtr {
        self.interior
    }
}

impl Add<ByteOffset> for SubAnchor {
    type Output = SubAnchor;
    fn add(self, rhs: ByteOffset) -> SubAnchor {
        SubAnchor { anchor: self.anchor, interior: self.interior + rhs }
    }
}

impl Sub<ByteOffset> for SubAnchor {
    type Output = SubAnchor;
    fn sub(self, rhs: ByteOffset) -> SubAnchor {
        SubAnchor { anchor: self.anchor, interior: self.interior - rhs }
    }
}

impl PartialEq for SubAnchor {
    fn eq(&self, other: &Self) -> bool {
        self.interior == other.interior
    }
}

impl PartialOrd for SubAnchor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.interior.partial_cmp(&other.interior)
    }
}
