//! The eight-phase collection cycle (§4.1) and the write-barrier mode each
//! phase implies (§4.4).

use std::sync::atomic::{AtomicU8, Ordering};

use bytemuck::NoUninit;

/// One phase of a collection cycle (§4.1):
/// `preMarking → marking1 → sync → marking2 → preSweep → sweep1 → sweep2 → postSweep → preMarking …`
/// `NoUninit` so it can sit inside `BarrierInfo`, which lives in `atomic::Atomic`.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, NoUninit)]
pub enum Phase {
    PreMarking = 0,
    Marking1 = 1,
    Sync = 2,
    Marking2 = 3,
    PreSweep = 4,
    Sweep1 = 5,
    Sweep2 = 6,
    PostSweep = 7,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::PreMarking,
        Phase::Marking1,
        Phase::Sync,
        Phase::Marking2,
        Phase::PreSweep,
        Phase::Sweep1,
        Phase::Sweep2,
        Phase::PostSweep,
    ];

    /// The next phase in the cycle (§4.1). `marking2` may in practice be
    /// re-entered by the driver (see `handshake::driver`) before the cycle
    /// is allowed to advance past it, when late greys appear during `sync`;
    /// that re-run is a driver decision, not a property of this ordering.
    pub fn next(self) -> Phase {
        match self {
            Phase::PreMarking => Phase::Marking1,
            Phase::Marking1 => Phase::Sync,
            Phase::Sync => Phase::Marking2,
            Phase::Marking2 => Phase::PreSweep,
            Phase::PreSweep => Phase::Sweep1,
            Phase::Sweep1 => Phase::Sweep2,
            Phase::Sweep2 => Phase::PostSweep,
            Phase::PostSweep => Phase::PreMarking,
        }
    }

    fn from_u8(v: u8) -> Phase {
        Phase::ALL[v as usize % Phase::ALL.len()]
    }
}

/// The write-barrier discipline a phase implies (§4.4): Dijkstra-style
/// insertion during `sync`, Yuasa-style deletion during the marking phases,
/// no barrier action otherwise.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BarrierMode {
    Inactive,
    /// `sync1`/`sync2` in the original's `Signum`; this crate's phase
    /// machine has a single `sync` phase (spec.md §4.1 lists `sync` once),
    /// so both of the original's sync sub-stages map to it.
    Insertion,
    /// `async` in the original's `Signum`.
    Deletion,
}

impl From<Phase> for BarrierMode {
    fn from(p: Phase) -> BarrierMode {
        match p {
            Phase::Sync => BarrierMode::Insertion,
            Phase::Marking1 | Phase::Marking2 => BarrierMode::Deletion,
            Phase::PreMarking | Phase::PreSweep | Phase::Sweep1 | Phase::Sweep2 | Phase::PostSweep => {
                BarrierMode::Inactive
            }
        }
    }
}

/// The phase each process observes, read by its write barrier at every
/// critical section (§3 `status`, §4.1 "per-process status words").
/// Backed by a single byte so a mutator's read is always wait-free.
pub struct ObservedPhase(AtomicU8);

impl Default for ObservedPhase {
    fn default() -> Self {
        ObservedPhase(AtomicU8::new(Phase::PreMarking as u8))
    }
}

impl ObservedPhase {
    pub fn load(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}
