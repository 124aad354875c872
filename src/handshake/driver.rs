//! The phase-advance and barrier protocol (§4.1): moving the collective
//! through `preMarking → marking1 → sync → marking2 → preSweep → sweep1 →
//! sweep2 → postSweep → …`, detecting when every live process has crossed
//! each barrier, reaping work left behind by a process the liveness check
//! declares dead, and driving the marking and sweeping work itself once a
//! phase is underway (`drive_marking`, `drive_sweep1`, `drive_sweep2`).
//!
//! Grounded in `original_source/include/mpgc/gc_thread.h`'s phase-advance,
//! barrier-wait, marking, and sweep loops. Any attached process may act as
//! the driver for a given transition (§4.1 "phase advance is not pinned to
//! one process"); `Collective` is the shared handle every process's driver
//! logic runs against.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::alloc::AllocationBackend;
use crate::bitmap::MarkBitmap;
use crate::config::Options;
use crate::descriptor::{self, Descriptor};
use crate::handshake::phase::{BarrierMode, ObservedPhase, Phase};
use crate::offset_ptr::OffsetPtr;
use crate::process::block::{BarrierInfo, BarrierStage, Block};
use crate::process::liveness::is_process_alive;
use crate::process::shared::SharedProcessTable;
use crate::traversal_queue::try_steal;

const WORD_BYTES: isize = std::mem::size_of::<u64>() as isize;

fn word_of(p: OffsetPtr) -> usize {
    (p.raw() / WORD_BYTES) as usize
}

fn ptr_of(word: usize) -> OffsetPtr {
    OffsetPtr::from_raw(word as isize * WORD_BYTES)
}

/// The shared handle to a running collection. In a real deployment each
/// process reaches the same `SharedProcessTable` through the mmap'd control
/// heap (`heap::ProcessHandle`); the local `blocks` registry is valid only
/// under the cooperating-threads simulation SPEC_FULL.md licenses for
/// testing (real separate OS processes would instead reach a peer's queue
/// only indirectly, by adopting its buffered offsets after takeover — see
/// `DESIGN.md`).
pub struct Collective {
    table: Arc<SharedProcessTable>,
    phase: ObservedPhase,
    blocks: Mutex<HashMap<usize, Arc<Block>>>,
    opts: Options,
}

impl Collective {
    pub fn new(table: Arc<SharedProcessTable>, opts: Options) -> Self {
        Collective { table, phase: ObservedPhase::default(), blocks: Mutex::new(HashMap::new()), opts }
    }

    pub fn table(&self) -> &SharedProcessTable {
        &self.table
    }

    pub fn current_phase(&self) -> Phase {
        self.phase.load()
    }

    pub fn barrier_mode(&self) -> BarrierMode {
        BarrierMode::from(self.current_phase())
    }

    /// Registers a newly-attached process's local block so driver logic
    /// running in this address space (see struct docs) can reach its
    /// traversal queue for stealing and takeover.
    pub fn register(&self, slot: usize, block: Arc<Block>) {
        self.blocks.lock().unwrap().insert(slot, block);
    }

    pub fn unregister(&self, slot: usize) {
        self.blocks.lock().unwrap().remove(&slot);
    }

    fn block(&self, slot: usize) -> Option<Arc<Block>> {
        self.blocks.lock().unwrap().get(&slot).cloned()
    }

    /// A process announces it has crossed the current phase's barrier
    /// (§4.1 "bump its own barrier, `unincremented → incrementing →
    /// incremented`"). `own_block` must belong to the calling process.
    pub fn cross_barrier(&self, slot: usize, own_block: &Block) {
        let phase = self.current_phase();
        let mut info = own_block.barrier_info.load(atomic::Ordering::Acquire);
        if info.phase != phase {
            info = info.reset_for(phase);
        }
        info.stage = BarrierStage::Incrementing;
        own_block.barrier_info.store(info, atomic::Ordering::Release);
        // Matches the original's fence-between-stages discipline: the
        // "incrementing" half-step is itself observable so a racing reader
        // never mistakes a barrier in flight for one that never started.
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        info.barrier = info.barrier.wrapping_add(1);
        info.stage = BarrierStage::Incremented;
        own_block.barrier_info.store(info, atomic::Ordering::Release);
        self.table.slot(slot).store_barrier_info(info);
    }

    /// `true` once every currently-live process has crossed the current
    /// phase's barrier (§4.1 "the driver polls every live process's barrier
    /// stage"). A process whose liveness has lapsed is not waited on — see
    /// [`Collective::reap_lapsed`].
    pub fn all_crossed_current_barrier(&self) -> bool {
        let phase = self.current_phase();
        self.table
            .live_slots()
            .all(|(_, record)| {
                let info = record.barrier_info();
                info.phase == phase && info.stage == BarrierStage::Incremented
            })
    }

    /// Advances to the next phase once every live process has crossed the
    /// current barrier (§4.1). Returns the new phase, or `None` if the
    /// barrier has not yet closed.
    pub fn try_advance(&self) -> Option<Phase> {
        if !self.all_crossed_current_barrier() {
            return None;
        }
        let next = self.current_phase().next();
        self.phase.store(next);
        Some(next)
    }

    /// Polls the liveness of every live-recorded slot other than `self_slot`
    /// and, for any whose `/proc` check now disagrees with its recorded
    /// creation time, performs the takeover CAS and drains its buffered work
    /// into `self_block`'s own mark buffer and traversal queue (§4.1
    /// "liveness takeover folds the dead process's pending work into the
    /// reaper's own queues so no grey reference is lost").
    pub fn reap_lapsed(&self, self_slot: usize, self_block: &Block) -> Vec<usize> {
        let mut reaped = Vec::new();
        for (slot, record) in self.table.live_slots() {
            if slot == self_slot {
                continue;
            }
            let recorded = record.liveness();
            if is_process_alive(&recorded) {
                continue;
            }
            if !record.try_mark_dead(recorded) {
                continue; // raced with another reaper, or the peer recovered
            }
            if let Some(peer_block) = self.block(slot) {
                while let Some(p) = peer_block.mark_buffer.pop() {
                    self_block.mark_buffer.push(p);
                }
                while let Some(p) = peer_block.traversal_queue.pop() {
                    self_block.traversal_queue.push(p);
                }
                peer_block.mark_buffer.mark_dead();
            }
            self.unregister(slot);
            reaped.push(slot);
        }
        reaped
    }

    /// Marking termination detection (§4.1): a process is done with
    /// marking1/marking2 once its own buffer and queue are empty and a
    /// bounded number of steal attempts against every live peer all come up
    /// empty. Returns `true` once that holds for every live peer right now;
    /// callers are expected to re-check after attempting to make progress,
    /// since a peer may still publish new work concurrently.
    pub fn marking_appears_done(&self, self_slot: usize, self_block: &Block) -> bool {
        if !self_block.mark_buffer.is_empty() || !self_block.traversal_queue.is_empty() {
            return false;
        }
        let attempts = self.opts.steal_attempts.get();
        for (slot, _) in self.table.live_slots() {
            if slot == self_slot {
                continue;
            }
            if let Some(peer) = self.block(slot) {
                if try_steal(&peer.traversal_queue.stealer(), attempts).is_some() {
                    return false;
                }
            }
        }
        true
    }

    /// Blocks the calling thread until either every live process has
    /// crossed the current barrier, or `timeout` elapses and a liveness
    /// sweep is due (§4.1, §10.3 `MPGC_LIVENESS_TIMEOUT_MS`). Returns the
    /// slots reaped, if any, so the caller can fold their work in before
    /// re-checking the barrier.
    pub fn wait_for_barrier(&self, self_slot: usize, self_block: &Block, timeout: Duration) -> Vec<usize> {
        let start = Instant::now();
        loop {
            if self.all_crossed_current_barrier() {
                return Vec::new();
            }
            if start.elapsed() >= timeout {
                return self.reap_lapsed(self_slot, self_block);
            }
            std::thread::yield_now();
        }
    }

    /// Drives this process's marking1/marking2 body (§4.1): drains the mark
    /// buffer into the traversal queue, scans each popped reference through
    /// `descriptor_of`, enqueuing everything it points at, and steals from a
    /// live peer once local work runs out. Returns once neither source
    /// yields anything; a concurrent write barrier can still grey a fresh
    /// reference after this call returns, so callers re-enter it after each
    /// `wait_for_barrier`/`marking_appears_done` check comes back negative.
    pub fn drive_marking<D: Descriptor>(
        &self,
        self_slot: usize,
        self_block: &Block,
        bitmap: &MarkBitmap,
        descriptor_of: &dyn Fn(OffsetPtr) -> D,
    ) {
        loop {
            while let Some(p) = self_block.mark_buffer.pop() {
                self_block.traversal_queue.push(p);
            }
            let next = match self_block.traversal_queue.pop() {
                Some(p) => p,
                None => match self.steal_from_peers(self_slot) {
                    Some(p) => p,
                    None => return,
                },
            };
            self.scan_one(next, self_block, bitmap, descriptor_of);
        }
    }

    fn steal_from_peers(&self, self_slot: usize) -> Option<OffsetPtr> {
        let attempts = self.opts.steal_attempts.get();
        for (slot, _) in self.table.live_slots() {
            if slot == self_slot {
                continue;
            }
            if let Some(peer) = self.block(slot) {
                if let Some(p) = try_steal(&peer.traversal_queue.stealer(), attempts) {
                    return Some(p);
                }
            }
        }
        None
    }

    /// Scans one grey reference (§4.1 "processes its traversal queue"):
    /// claims the begin-bit (a peer may have raced us to it), publishes it
    /// as this process's currently-scanning reference (§9 `SweepOrMarking`),
    /// reads its outgoing references through `descriptor_of`, and enqueues
    /// each one for further traversal.
    fn scan_one<D: Descriptor>(
        &self,
        p: OffsetPtr,
        self_block: &Block,
        bitmap: &MarkBitmap,
        descriptor_of: &dyn Fn(OffsetPtr) -> D,
    ) {
        let word = word_of(p);
        if !bitmap.mark_begin(word) {
            return;
        }
        self_block.set_marking_ref(p);
        let desc = descriptor_of(p);
        bitmap.mark_end(word + desc.size_words().saturating_sub(1));
        // SAFETY: the begin-bit CAS above is this process's sole license to
        // scan `p`, and `p` is a live object shaped exactly as `desc` describes.
        let refs = unsafe { descriptor::scan_references(p.resolve::<OffsetPtr>(), &desc) };
        for r in refs {
            self_block.traversal_queue.push(r);
        }
        self_block.clear_sweep_or_marking();
    }

    /// Drives sweep1 (§4.1, §4.2): cooperatively claims logical chunks from
    /// `bitmap`'s atomic cursor, reconstituting and publishing every free
    /// region found to `backend`. A free region that abuts either edge of
    /// its chunk cannot be resolved without a neighboring chunk also being
    /// swept, so that chunk is staged on `self_block.pre_sweep_list` for
    /// sweep2 instead of being marked done.
    pub fn drive_sweep1(&self, self_block: &Block, bitmap: &MarkBitmap, backend: &dyn AllocationBackend) {
        while let Some(chunk) = bitmap.claim_next_chunk() {
            self_block.set_sweep_chunk(chunk);
            if self.sweep_chunk(chunk, bitmap, backend) {
                self_block.pre_sweep_list.lock().unwrap().push_back(chunk);
            } else {
                bitmap.mark_chunk_done(chunk);
            }
        }
        self_block.clear_sweep_or_marking();
    }

    /// Drives sweep2 (§4.1, §4.2): revisits the chunks sweep1 staged on
    /// `self_block.pre_sweep_list`, then sweeps the rest of the bitmap for
    /// any chunk `chunk_needs_sweep2` still flags — covering a boundary
    /// chunk whose own staging process lapsed before sweep2 ran. Each
    /// chunk's `expand_free_chunk` CAS still guarantees a straddling free
    /// region is published exactly once, however many processes revisit it.
    pub fn drive_sweep2(&self, self_block: &Block, bitmap: &MarkBitmap, backend: &dyn AllocationBackend) {
        loop {
            let chunk = self_block.pre_sweep_list.lock().unwrap().pop_front();
            let Some(chunk) = chunk else { break };
            if bitmap.chunk_needs_sweep2(chunk) {
                self_block.set_sweep_chunk(chunk);
                self.sweep_chunk(chunk, bitmap, backend);
                bitmap.mark_chunk_done(chunk);
            }
        }
        for chunk in 0..bitmap.chunk_count() {
            if bitmap.chunk_needs_sweep2(chunk) {
                self_block.set_sweep_chunk(chunk);
                self.sweep_chunk(chunk, bitmap, backend);
                bitmap.mark_chunk_done(chunk);
            }
        }
        self_block.clear_sweep_or_marking();
    }

    /// Walks logical chunk `chunk`'s words for free regions, reconstituting
    /// each with `MarkBitmap::expand_free_chunk` and publishing the winning
    /// claim to `backend` (§4.2 "free-chunk reconstitution"). Returns
    /// whether any free region's true extent reached past either edge of
    /// the chunk — the condition sweep1/sweep2 use to decide whether the
    /// chunk needs a second look (§4.1).
    fn sweep_chunk(&self, chunk: usize, bitmap: &MarkBitmap, backend: &dyn AllocationBackend) -> bool {
        let start = bitmap.chunk_start_word(chunk);
        let end = bitmap.chunk_end_word(chunk);
        let mut word = start;
        let mut touches_boundary = false;
        while word < end {
            if bitmap.is_marked(word) {
                word = bitmap.find_next_free_word(word, end);
                continue;
            }
            let free_end = bitmap.find_next_used_word(word, end);
            let size = free_end - word;
            let (b, e, claimed) = bitmap.expand_free_chunk(word, size);
            if b < start || e > end {
                touches_boundary = true;
            }
            if claimed {
                backend.publish_free(ptr_of(b), e - b);
            }
            word = free_end;
        }
        touches_boundary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::liveness::{Alive, Liveness};
    use crate::process::shared::SharedProcessRecord;
    use atomic::Atomic;

    fn collective(capacity: usize) -> (Vec<SharedProcessRecord>, Arc<Collective>) {
        let mut backing: Vec<SharedProcessRecord> = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            backing.push(SharedProcessRecord::__test_empty());
        }
        let table = unsafe { SharedProcessTable::from_raw(backing.as_mut_ptr(), capacity) };
        table.init();
        let collective = Arc::new(Collective::new(Arc::new(table), Options::default()));
        (backing, collective)
    }

    #[test]
    fn advances_only_once_every_live_process_has_crossed() {
        let (_backing, collective) = collective(2);
        let slot_a = collective.table.claim_slot().unwrap();
        let slot_b = collective.table.claim_slot().unwrap();
        let block_a = Arc::new(Block::new(slot_a));
        let block_b = Arc::new(Block::new(slot_b));
        collective.register(slot_a, block_a.clone());
        collective.register(slot_b, block_b.clone());

        assert!(collective.try_advance().is_none());
        collective.cross_barrier(slot_a, &block_a);
        assert!(collective.try_advance().is_none());
        collective.cross_barrier(slot_b, &block_b);
        assert_eq!(collective.try_advance(), Some(Phase::Marking1));
    }

    #[test]
    fn reaping_a_dead_peer_folds_its_queue_into_the_reaper() {
        let (_backing, collective) = collective(2);
        let slot_a = collective.table.claim_slot().unwrap();
        let slot_b = collective.table.claim_slot().unwrap();
        let block_a = Arc::new(Block::new(slot_a));
        let block_b = Arc::new(Block::new(slot_b));
        collective.register(slot_a, block_a.clone());
        collective.register(slot_b, block_b.clone());

        block_b.traversal_queue.push(crate::offset_ptr::OffsetPtr::from_raw(8));
        // simulate a lapsed peer: publish a liveness record the OS check
        // will never agree with.
        collective.table.slot(slot_b).store_liveness(Liveness { creation_time: 0xDEAD, pid: u32::MAX, alive: Alive::Live });

        let reaped = collective.reap_lapsed(slot_a, &block_a);
        assert_eq!(reaped, vec![slot_b]);
        assert_eq!(block_a.traversal_queue.pop(), Some(crate::offset_ptr::OffsetPtr::from_raw(8)));
    }

    #[test]
    fn marking_is_not_done_while_a_live_peer_still_has_stealable_work() {
        let (_backing, collective) = collective(2);
        let slot_a = collective.table.claim_slot().unwrap();
        let slot_b = collective.table.claim_slot().unwrap();
        let block_a = Arc::new(Block::new(slot_a));
        let block_b = Arc::new(Block::new(slot_b));
        collective.register(slot_a, block_a.clone());
        collective.register(slot_b, block_b.clone());

        assert!(collective.marking_appears_done(slot_a, &block_a));
        block_b.traversal_queue.push(crate::offset_ptr::OffsetPtr::from_raw(8));
        assert!(!collective.marking_appears_done(slot_a, &block_a));
    }
}
