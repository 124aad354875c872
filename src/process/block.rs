//! Per-process block (§3 `Per-process block`): the published state a process
//! exposes to the rest of the collective — liveness, observed phase, barrier
//! counters, mark buffers, traversal queue, and the pre-sweep list.
//!
//! Grounded in `original_source/include/mpgc/gc_thread.h`'s
//! `per_process_struct`. Liveness and barrier bookkeeping are double-word
//! CAS-able records placed where every process's `Block` agrees on their
//! layout (§5 "Per-process blocks: single-writer... multi-reader always");
//! the mark buffer, traversal queue, and pre-sweep list are per-process
//! runtime collections a process's own threads push into and, on liveness
//! takeover, the driver drains directly (see `DESIGN.md` for why these
//! collections are process-local Rust collections rather than literally
//! placed in the mmap'd file — that placement is the raw-allocator
//! collaborator's job and out of this core's scope per spec.md §1).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use atomic::Atomic;
use bytemuck::NoUninit;

use crate::handshake::phase::{ObservedPhase, Phase};
use crate::mark_buffer::MarkBuffer;
use crate::offset_ptr::OffsetPtr;
use crate::process::liveness::Liveness;
use crate::traversal_queue::TraversalQueue;

/// §4.1 "Barrier protocol": each process moves its own stage through these
/// three states exactly once per phase transition.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, NoUninit)]
pub enum BarrierStage {
    Unincremented = 0,
    Incrementing = 1,
    Incremented = 2,
}

/// A 64-bit packed barrier record (§3 `barrier_info`): `{barrier_index,
/// barrier_stage, per-phase counter/version}`, CAS-able as a single unit so
/// a process can move through `unincremented → incrementing → incremented`
/// without tearing against a concurrent reader (the driver, polling for
/// "all live processes incremented"). `NoUninit` so it can live in
/// `atomic::Atomic` (`atomic` 0.6 bounds its CAS methods on `T: NoUninit`).
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Debug, NoUninit)]
pub struct BarrierInfo {
    /// Bumped exactly once per phase by each live process (§4.1).
    pub barrier: u16,
    /// Carried so marking phases can force a re-run when late greys appear
    /// (§4.1 "For marking phases the barrier also carries a version").
    pub version: u16,
    pub phase: Phase,
    pub stage: BarrierStage,
    _pad: u16,
}

static_assertions::assert_eq_size!(BarrierInfo, u64);

impl Default for BarrierInfo {
    fn default() -> Self {
        BarrierInfo { barrier: 0, version: 0, phase: Phase::PreMarking, stage: BarrierStage::Unincremented, _pad: 0 }
    }
}

impl BarrierInfo {
    /// Resets for a new phase, carrying the version forward only for the
    /// marking phases (§3, matching `reset_barrier_info`'s behavior: the
    /// version is per-marking-phase bookkeeping, not reset across every
    /// transition).
    pub fn reset_for(&self, phase: Phase) -> BarrierInfo {
        let version = if matches!(phase, Phase::Marking1 | Phase::Marking2) { self.version } else { 0 };
        BarrierInfo { barrier: self.barrier, version, phase, stage: BarrierStage::Unincremented, _pad: 0 }
    }
}

/// §9 Design Notes: "Union of current sweep chunk / currently-scanning
/// reference... Model as a tagged sum rather than an unchecked overlap."
#[derive(Copy, Clone, Debug)]
pub enum SweepOrMarking {
    Idle,
    /// The logical chunk this process currently owns in sweep1/sweep2.
    SweepChunk(usize),
    /// The reference this process is currently scanning in marking1/marking2.
    MarkingRef(OffsetPtr),
}

/// Per-process published state (§3). One `Block` is created on attach and
/// lives for the process's lifetime; `liveness` is the only field another
/// process is ever expected to write (the takeover CAS, §4.1).
pub struct Block {
    pub liveness: Atomic<Liveness>,
    pub observed_phase: ObservedPhase,
    pub barrier_info: Atomic<BarrierInfo>,
    pub mark_buffer: MarkBuffer,
    pub traversal_queue: TraversalQueue,
    pub pre_sweep_list: Mutex<VecDeque<usize>>,
    pub global_list_index: AtomicUsize,
    sweep_or_marking: Mutex<SweepOrMarking>,
}

impl Block {
    /// Creates the block for the calling process (§6 "allocate this
    /// process's per-process block").
    pub fn new(global_list_index: usize) -> Self {
        Block {
            liveness: Atomic::new(Liveness::for_current_process()),
            observed_phase: ObservedPhase::default(),
            barrier_info: Atomic::new(BarrierInfo::default()),
            mark_buffer: MarkBuffer::new(),
            traversal_queue: TraversalQueue::new(),
            pre_sweep_list: Mutex::new(VecDeque::new()),
            global_list_index: AtomicUsize::new(global_list_index),
            sweep_or_marking: Mutex::new(SweepOrMarking::Idle),
        }
    }

    /// Current liveness snapshot (§4.1 "the driver loads each block's
    /// liveness").
    pub fn liveness(&self) -> Liveness {
        self.liveness.load(Ordering::Acquire)
    }

    /// Attempts the death-takeover CAS (§4.1 "the driver CASes liveness to
    /// Dead"). Returns `true` if this call performed the transition, `false`
    /// if the block was already dead or the expected value no longer
    /// matches (someone else raced us, or the process resumed progress).
    pub fn try_mark_dead(&self, expected: Liveness) -> bool {
        if !expected.is_live() {
            return true;
        }
        self.liveness.compare_exchange(expected, expected.as_dead(), Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Marks this process's own liveness Dead on clean exit (§6 "On clean
    /// exit: mark liveness Dead").
    pub fn mark_dead_on_exit(&self) {
        let mut current = self.liveness();
        while current.is_live() {
            match self.liveness.compare_exchange(
                current,
                current.as_dead(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn set_sweep_chunk(&self, chunk: usize) {
        *self.sweep_or_marking.lock().unwrap() = SweepOrMarking::SweepChunk(chunk);
    }

    pub fn set_marking_ref(&self, r: OffsetPtr) {
        *self.sweep_or_marking.lock().unwrap() = SweepOrMarking::MarkingRef(r);
    }

    pub fn clear_sweep_or_marking(&self) {
        *self.sweep_or_marking.lock().unwrap() = SweepOrMarking::Idle;
    }

    pub fn sweep_or_marking(&self) -> SweepOrMarking {
        *self.sweep_or_marking.lock().unwrap()
    }
}
