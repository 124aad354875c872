//! The genuinely shared-memory slice of per-process state (§3 `liveness`,
//! `barrier_info`, `status`; §5 "Per-process blocks: single-writer for most
//! fields, multi-reader always; liveness is the one field every process may
//! write, via CAS").
//!
//! `process::Block` (see `block.rs`) is a rich, process-local Rust value —
//! its `MarkBuffer` and `TraversalQueue` own real heap pointers and cannot be
//! placed in a file mapped at different base addresses in different
//! processes without the offset-relocatable allocator spec.md §1 explicitly
//! puts out of scope for this core. What genuinely must be visible to every
//! attached process — because the whole point is that a peer can read or CAS
//! it without calling into the owning process at all — is exactly the
//! `Liveness` and `BarrierInfo` records. `SharedProcessTable` is the fixed
//! array of those records living at a known offset in the control heap
//! (§6 "control heap"), one slot per attached process.

use atomic::Atomic;

use crate::process::block::BarrierInfo;
use crate::process::liveness::{Alive, Liveness};

/// One process's slice of cross-process-visible state, laid out for direct
/// placement in the mmap'd control heap. `repr(C)` so every attached process
/// agrees on the byte layout regardless of build (§6 "control block").
#[repr(C)]
pub struct SharedProcessRecord {
    liveness: Atomic<Liveness>,
    barrier_info: Atomic<BarrierInfo>,
}

impl SharedProcessRecord {
    /// The value an unused slot holds: a dead, zeroed liveness record (§6
    /// "the control block is zero-initialized on first creation").
    const EMPTY: Liveness = Liveness { creation_time: 0, pid: 0, alive: Alive::Dead };

    fn init_in_place(&self) {
        self.liveness.store(Self::EMPTY, atomic::Ordering::Release);
        self.barrier_info.store(BarrierInfo::default(), atomic::Ordering::Release);
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.load(atomic::Ordering::Acquire)
    }

    pub fn store_liveness(&self, l: Liveness) {
        self.liveness.store(l, atomic::Ordering::Release);
    }

    /// The death-takeover CAS (§4.1): any process may attempt this, not only
    /// the owner.
    pub fn try_mark_dead(&self, expected: Liveness) -> bool {
        if !expected.is_live() {
            return true;
        }
        self.liveness
            .compare_exchange(expected, expected.as_dead(), atomic::Ordering::AcqRel, atomic::Ordering::Acquire)
            .is_ok()
    }

    pub fn barrier_info(&self) -> BarrierInfo {
        self.barrier_info.load(atomic::Ordering::Acquire)
    }

    pub fn store_barrier_info(&self, info: BarrierInfo) {
        self.barrier_info.store(info, atomic::Ordering::Release);
    }

    /// A slot is available for a newly-attaching process once its occupant
    /// is dead (§6 "reclaim a dead process's slot").
    pub fn is_free(&self) -> bool {
        !self.liveness().is_live()
    }
}

/// A fixed-capacity view over a run of `SharedProcessRecord`s living
/// somewhere in the mmap'd control heap. Construction is unsafe: the caller
/// must guarantee `base` points at `capacity` correctly-aligned,
/// already-mapped records that outlive this value (`heap::ProcessHandle`
/// owns that guarantee in practice).
pub struct SharedProcessTable {
    base: *mut SharedProcessRecord,
    capacity: usize,
}

// The table is a read-many/write-via-atomics view over shared memory; the
// records themselves synchronize access, so sharing the table across threads
// is sound as long as the underlying mapping is valid.
unsafe impl Send for SharedProcessTable {}
unsafe impl Sync for SharedProcessTable {}

impl SharedProcessTable {
    /// Wraps `capacity` already-mapped, contiguous `SharedProcessRecord`s
    /// starting at `base`. Does not initialize them — use
    /// [`SharedProcessTable::init`] exactly once, from whichever process
    /// creates the control heap (§6 "the first process to create the heap
    /// files zero-initializes the control block").
    ///
    /// # Safety
    /// `base` must point at `capacity` valid, writable, properly aligned
    /// `SharedProcessRecord` slots for the lifetime of the returned value.
    pub unsafe fn from_raw(base: *mut SharedProcessRecord, capacity: usize) -> Self {
        SharedProcessTable { base, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn record(&self, index: usize) -> &SharedProcessRecord {
        assert!(index < self.capacity, "slot index {index} out of bounds ({})", self.capacity);
        // SAFETY: `from_raw`'s caller guaranteed `base..base+capacity` are
        // valid records; `index < capacity` was just checked.
        unsafe { &*self.base.add(index) }
    }

    /// Zero-initializes every slot. Must be called exactly once per heap
    /// lifetime, by the process that creates the heap files (§6).
    pub fn init(&self) {
        for i in 0..self.capacity {
            self.record(i).init_in_place();
        }
    }

    /// Finds and claims the first free slot for the calling process,
    /// publishing its liveness record (§6 "allocate this process's
    /// per-process block"). Returns the claimed slot index, or `None` if
    /// every slot is occupied by a live process.
    pub fn claim_slot(&self) -> Option<usize> {
        let mine = Liveness::for_current_process();
        for i in 0..self.capacity {
            let record = self.record(i);
            if record.is_free() {
                let prior = record.liveness();
                if record.try_mark_dead(prior) {
                    // already dead; now publish ourselves into the slot.
                    record.store_liveness(mine);
                    record.store_barrier_info(BarrierInfo::default());
                    return Some(i);
                }
            }
        }
        None
    }

    pub fn slot(&self, index: usize) -> &SharedProcessRecord {
        self.record(index)
    }

    /// Iterates every slot currently holding a live process (§4.1 "the
    /// driver polls every live process's barrier stage").
    pub fn live_slots(&self) -> impl Iterator<Item = (usize, &SharedProcessRecord)> {
        (0..self.capacity).map(move |i| (i, self.record(i))).filter(|(_, r)| r.liveness().is_live())
    }
}

#[cfg(test)]
impl SharedProcessRecord {
    /// Test-only constructor used by peer modules (`handshake::driver`'s
    /// tests) that need a bare backing slot without going through a real
    /// heap mapping.
    pub(crate) fn __test_empty() -> Self {
        SharedProcessRecord {
            liveness: Atomic::new(Liveness { creation_time: 0, pid: 0, alive: Alive::Dead }),
            barrier_info: Atomic::new(BarrierInfo::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_table(capacity: usize) -> (Vec<SharedProcessRecord>, SharedProcessTable) {
        let mut backing: Vec<SharedProcessRecord> = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            backing.push(SharedProcessRecord {
                liveness: Atomic::new(Liveness { creation_time: 0, pid: 0, alive: Alive::Dead }),
                barrier_info: Atomic::new(BarrierInfo::default()),
            });
        }
        let base = backing.as_mut_ptr();
        let table = unsafe { SharedProcessTable::from_raw(base, capacity) };
        table.init();
        (backing, table)
    }

    #[test]
    fn claim_slot_publishes_calling_process_liveness() {
        let (_backing, table) = test_table(4);
        let slot = table.claim_slot().expect("a free slot");
        assert!(table.slot(slot).liveness().is_live());
        assert_eq!(table.slot(slot).liveness().pid, std::process::id());
    }

    #[test]
    fn exhausted_table_returns_none() {
        let (_backing, table) = test_table(2);
        table.claim_slot().unwrap();
        table.claim_slot().unwrap();
        assert_eq!(table.claim_slot(), None);
    }

    #[test]
    fn dead_slot_is_reclaimed_by_a_new_claim() {
        let (_backing, table) = test_table(1);
        let slot = table.claim_slot().unwrap();
        let snapshot = table.slot(slot).liveness();
        assert!(table.slot(slot).try_mark_dead(snapshot));
        let reclaimed = table.claim_slot().expect("dead slot should be reclaimable");
        assert_eq!(reclaimed, slot);
        assert!(table.slot(slot).liveness().is_live());
    }

    #[test]
    fn live_slots_excludes_dead_occupants() {
        let (_backing, table) = test_table(3);
        let a = table.claim_slot().unwrap();
        let b = table.claim_slot().unwrap();
        let snapshot = table.slot(a).liveness();
        table.slot(a).try_mark_dead(snapshot);
        let live: Vec<usize> = table.live_slots().map(|(i, _)| i).collect();
        assert_eq!(live, vec![b]);
    }
}
