//! Per-process work-stealing deque of grey references awaiting
//! descriptor-driven scan (§3 `traversal_queue`, §4.1 marking).
//!
//! Grounded in `mmtk-core`'s `scheduler/scheduler.rs` use of
//! `crossbeam::deque::{Injector, Steal}` for its work queues; `crossbeam` is
//! already part of the teacher's dependency stack. Each process owns a
//! `Worker` end it pushes/pops from locally, and publishes a `Stealer` so
//! idle peers can steal work from it during marking (§4.1 "Idle processes
//! steal from peers").

use crossbeam::deque::{Steal, Stealer, Worker};

use crate::offset_ptr::OffsetPtr;

/// A process's traversal queue: its own LIFO `Worker` end, plus the
/// `Stealer` handle peers use when they run out of work (§4.1).
pub struct TraversalQueue {
    worker: Worker<OffsetPtr>,
}

impl Default for TraversalQueue {
    fn default() -> Self {
        TraversalQueue { worker: Worker::new_lifo() }
    }
}

impl TraversalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stealable handle onto this process's queue, to be published where
    /// peers can find it (the per-process block, see `process::Block`).
    pub fn stealer(&self) -> Stealer<OffsetPtr> {
        self.worker.stealer()
    }

    /// Enqueues a grey reference for this process's own marking loop to
    /// scan (§4.1 "processes its traversal queue").
    pub fn push(&self, p: OffsetPtr) {
        self.worker.push(p);
    }

    /// Pops from this process's own queue, preferring locally-pushed work
    /// over stealing.
    pub fn pop(&self) -> Option<OffsetPtr> {
        self.worker.pop()
    }

    /// Is this process's own queue empty right now? Does not account for
    /// work it could still steal from peers; `marking1`/`marking2`
    /// termination additionally requires a bounded number of failed steal
    /// attempts against every peer (§4.1, §10.3 `MPGC_STEAL_ATTEMPTS`).
    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }
}

/// Attempts to steal one item from `from`, retrying past spurious
/// contention failures up to `attempts` times (§4.1 "bounded number of
/// steal attempts", §10.3 `MPGC_STEAL_ATTEMPTS`). Returns `None` once
/// `attempts` consecutive `Retry`s are seen or the peer reports `Empty`.
pub fn try_steal(from: &Stealer<OffsetPtr>, attempts: u64) -> Option<OffsetPtr> {
    for _ in 0..attempts.max(1) {
        match from.steal() {
            Steal::Success(p) => return Some(p),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
    None
}
