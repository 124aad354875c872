//! A single external-reference-table slot (§4.3 "Slot"): either a strong
//! heap reference keeping its referent alive, or a link in the table's free
//! list. Packed into one `AtomicU64` so every slot operation is a single
//! atomic op with no locking (§5 "External-reference spine:
//! mutex-protected growth only; per-slot operations lock-free").

use std::sync::atomic::{AtomicU64, Ordering};

use crate::offset_ptr::OffsetPtr;

/// Marks a slot as free; the remaining 32 bits are the next-free index, or
/// `NO_NEXT_BITS` at the end of the chain. Heap offsets are always
/// non-negative and far below 2^63, so the tag bit never collides with a
/// real referent.
const FREE_TAG: u64 = 1 << 63;
const NO_NEXT_BITS: u64 = u32::MAX as u64;

pub struct Slot(AtomicU64);

impl Slot {
    pub fn new_free(next: Option<u32>) -> Self {
        Slot(AtomicU64::new(Self::encode_free(next)))
    }

    fn encode_free(next: Option<u32>) -> u64 {
        FREE_TAG | next.map(|n| n as u64).unwrap_or(NO_NEXT_BITS)
    }

    pub fn is_free(&self) -> bool {
        self.0.load(Ordering::Acquire) & FREE_TAG != 0
    }

    /// The next free slot in the chain. Panics if called on an in-use slot.
    pub fn next_free(&self) -> Option<u32> {
        let v = self.0.load(Ordering::Acquire);
        debug_assert!(v & FREE_TAG != 0, "next_free on an in-use slot");
        let bits = v & !FREE_TAG;
        if bits == NO_NEXT_BITS {
            None
        } else {
            Some(bits as u32)
        }
    }

    pub fn set_free(&self, next: Option<u32>) {
        self.0.store(Self::encode_free(next), Ordering::Release);
    }

    pub fn set_in_use(&self, referent: OffsetPtr) {
        debug_assert!(referent.raw() >= 0, "slot referents are heap offsets, never negative");
        self.0.store(referent.raw() as u64, Ordering::Release);
    }

    /// The slot's strong reference, or `None` if the slot is currently free
    /// (§4.3 "the set of slots currently in use is a root of the collector").
    pub fn referent(&self) -> Option<OffsetPtr> {
        let v = self.0.load(Ordering::Acquire);
        if v & FREE_TAG != 0 {
            None
        } else {
            Some(OffsetPtr::from_raw(v as isize))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slot_is_free_with_no_next() {
        let s = Slot::new_free(None);
        assert!(s.is_free());
        assert_eq!(s.next_free(), None);
    }

    #[test]
    fn in_use_slot_reports_its_referent() {
        let s = Slot::new_free(None);
        s.set_in_use(OffsetPtr::from_raw(800));
        assert!(!s.is_free());
        assert_eq!(s.referent(), Some(OffsetPtr::from_raw(800)));
    }

    #[test]
    fn free_chain_round_trips() {
        let s = Slot::new_free(Some(41));
        assert_eq!(s.next_free(), Some(41));
        s.set_free(None);
        assert_eq!(s.next_free(), None);
    }
}
