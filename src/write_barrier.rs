//! The write barrier (§4.4): the six-step protocol every reference-field
//! store goes through so a concurrent marker never loses a reference it
//! still needs to trace.
//!
//! Grounded in `original_source/include/mpgc/write_barrier.h`. A thread
//! disables phase application around the barrier (so a handshake arriving
//! mid-barrier cannot change which discipline — insertion or deletion — the
//! barrier is applying partway through), performs the grey-ing appropriate
//! to the currently observed phase, runs the caller's update, then re-enables
//! phase application and applies any phase change that arrived while
//! disabled.

use std::cell::Cell;
use std::sync::atomic::{compiler_fence, Ordering};

use crate::bitmap::MarkBitmap;
use crate::handshake::phase::{BarrierMode, Phase};
use crate::mark_buffer::MarkBuffer;
use crate::offset_ptr::OffsetPtr;
use crate::process::block::Block;

const WORD_BYTES: isize = std::mem::size_of::<u64>() as isize;

fn word_of(p: OffsetPtr) -> usize {
    (p.raw() / WORD_BYTES) as usize
}

thread_local! {
    /// §4.4 "defers handshake". Set for the duration of a barrier so a
    /// concurrent phase change cannot be observed halfway through.
    static MARK_SIGNAL_DISABLED: Cell<bool> = Cell::new(false);
    /// A phase change that arrived while disabled, to be applied once the
    /// barrier completes.
    static MARK_SIGNAL_REQUESTED: Cell<Option<Phase>> = Cell::new(None);
}

/// Adds `p` to `mark_buffer` if it is a real reference not already marked
/// (§4.4 `mark_gray`: "called by the write barrier and by stack/root
/// scanning"). Skipping already-marked referents keeps the mark buffer from
/// filling with redundant entries under a hot field that's repeatedly
/// overwritten with the same already-black value.
pub fn mark_gray(p: OffsetPtr, bitmap: &MarkBitmap, mark_buffer: &MarkBuffer) {
    if p.is_null() {
        return;
    }
    let word = word_of(p);
    if word < bitmap.capacity_words() && !bitmap.is_marked(word) {
        mark_buffer.push(p);
    }
}

/// Applies a phase change to `block`'s observed phase, deferring it if the
/// calling thread is currently inside a write barrier (§4.4 "checks if a
/// handshake is pending" on re-enable). Called by the process's own
/// handshake-polling loop, never by a peer.
pub fn observe_phase_change(block: &Block, new_phase: Phase) {
    let disabled = MARK_SIGNAL_DISABLED.with(Cell::get);
    if disabled {
        MARK_SIGNAL_REQUESTED.with(|r| r.set(Some(new_phase)));
    } else {
        block.observed_phase.store(new_phase);
    }
}

/// Performs a barrier-guarded reference update: `*lhs_field = rhs` (or
/// whatever `update` does — it is handed the field store itself so the
/// barrier can bracket it exactly). `lhs` is the field's current value
/// before the update, `rhs` is the value about to be stored.
///
/// Short-circuits to a bare `update()` when `lhs == rhs` (§4.4: "If lhs and
/// rhs are both same, then we don't need to trigger the barrier").
pub fn write_barrier<F: FnOnce()>(block: &Block, bitmap: &MarkBitmap, lhs: OffsetPtr, rhs: OffsetPtr, update: F) {
    if lhs == rhs {
        update();
        return;
    }

    MARK_SIGNAL_DISABLED.with(|d| d.set(true));
    // This fence must happen before either reference reaches the mark
    // buffer below (§4.4).
    compiler_fence(Ordering::Release);

    match BarrierMode::from(block.observed_phase.load()) {
        BarrierMode::Insertion => {
            // Dijkstra-style: grey both the outgoing and incoming reference.
            mark_gray(rhs, bitmap, &block.mark_buffer);
            mark_gray(lhs, bitmap, &block.mark_buffer);
        }
        BarrierMode::Deletion => {
            // Yuasa-style: only the reference about to be overwritten needs
            // greying; the new value is reachable from wherever it came from.
            mark_gray(lhs, bitmap, &block.mark_buffer);
        }
        BarrierMode::Inactive => {}
    }

    update();

    // This fence must happen before phase application is re-enabled below
    // (§4.4).
    compiler_fence(Ordering::Release);
    MARK_SIGNAL_DISABLED.with(|d| d.set(false));

    if let Some(requested) = MARK_SIGNAL_REQUESTED.with(Cell::take) {
        block.observed_phase.store(requested);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::phase::Phase;
    use std::cell::Cell as StdCell;

    fn heap_bitmap() -> MarkBitmap {
        MarkBitmap::new(4096, 64)
    }

    #[test]
    fn identical_lhs_and_rhs_skips_the_barrier_entirely() {
        let block = Block::new(0);
        let bitmap = heap_bitmap();
        let same = OffsetPtr::from_raw(800);
        let ran = StdCell::new(false);
        write_barrier(&block, &bitmap, same, same, || ran.set(true));
        assert!(ran.get());
        assert!(block.mark_buffer.is_empty());
    }

    #[test]
    fn insertion_mode_greys_both_sides() {
        let block = Block::new(0);
        block.observed_phase.store(Phase::Sync);
        let bitmap = heap_bitmap();
        let lhs = OffsetPtr::from_raw(800);
        let rhs = OffsetPtr::from_raw(1600);
        write_barrier(&block, &bitmap, lhs, rhs, || {});
        assert_eq!(block.mark_buffer.pop(), Some(rhs));
        assert_eq!(block.mark_buffer.pop(), Some(lhs));
        assert_eq!(block.mark_buffer.pop(), None);
    }

    #[test]
    fn deletion_mode_greys_only_lhs() {
        let block = Block::new(0);
        block.observed_phase.store(Phase::Marking1);
        let bitmap = heap_bitmap();
        let lhs = OffsetPtr::from_raw(800);
        let rhs = OffsetPtr::from_raw(1600);
        write_barrier(&block, &bitmap, lhs, rhs, || {});
        assert_eq!(block.mark_buffer.pop(), Some(lhs));
        assert_eq!(block.mark_buffer.pop(), None);
    }

    #[test]
    fn inactive_mode_greys_nothing() {
        let block = Block::new(0);
        block.observed_phase.store(Phase::PreSweep);
        let bitmap = heap_bitmap();
        write_barrier(&block, &bitmap, OffsetPtr::from_raw(800), OffsetPtr::from_raw(1600), || {});
        assert!(block.mark_buffer.is_empty());
    }

    #[test]
    fn phase_change_requested_mid_barrier_applies_once_barrier_completes() {
        let block = Block::new(0);
        block.observed_phase.store(Phase::PreMarking);
        let bitmap = heap_bitmap();
        write_barrier(&block, &bitmap, OffsetPtr::from_raw(800), OffsetPtr::from_raw(1600), || {
            // a concurrent phase change arriving mid-barrier must defer.
            observe_phase_change(&block, Phase::Marking1);
            assert_eq!(block.observed_phase.load(), Phase::PreMarking);
        });
        assert_eq!(block.observed_phase.load(), Phase::Marking1);
    }

    #[test]
    fn already_marked_referent_is_not_regreyed() {
        let block = Block::new(0);
        block.observed_phase.store(Phase::Marking1);
        let bitmap = heap_bitmap();
        let lhs = OffsetPtr::from_raw(800);
        bitmap.mark_begin(word_of(lhs));
        write_barrier(&block, &bitmap, lhs, OffsetPtr::from_raw(1600), || {});
        assert!(block.mark_buffer.is_empty());
    }
}
