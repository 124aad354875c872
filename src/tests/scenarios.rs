//! End-to-end scenarios (§8): each test drives the mark bitmap, write
//! barrier, external-reference table, and handshake driver together the way
//! a real collection cycle would. Most scenarios use `mark_reachable`/
//! `sweep_all` below, small helpers that collapse marking1/marking2 and
//! sweep1/sweep2 into one pass each for tests that don't care about the
//! phase split; `handshake::driver::Collective` itself now owns the real,
//! phase-aware `drive_marking`/`drive_sweep1`/`drive_sweep2` engine, which
//! the last scenario in this file drives directly.
//!
//! Multiple cooperating processes are simulated as threads sharing one
//! address space, per SPEC_FULL.md §10.4's license for test tooling.

use std::sync::{Arc, Mutex};

use crate::alloc::{AllocationBackend, BumpAllocator};
use crate::bitmap::MarkBitmap;
use crate::descriptor::{self, StaticDescriptor};
use crate::handshake::{BarrierMode, Collective};
use crate::offset_ptr::OffsetPtr;
use crate::process::block::Block;
use crate::process::liveness::{Alive, Liveness};
use crate::process::shared::{SharedProcessRecord, SharedProcessTable};
use crate::traversal_queue::TraversalQueue;
use crate::write_barrier;
use crate::xrt::{Anchor, XrtTable};

const WORD_BYTES: isize = std::mem::size_of::<u64>() as isize;

fn word_of(p: OffsetPtr) -> usize {
    (p.raw() / WORD_BYTES) as usize
}

fn ptr_of(word: usize) -> OffsetPtr {
    OffsetPtr::from_raw(word as isize * WORD_BYTES)
}

/// A plain `Vec<OffsetPtr>` standing in for the object heap a real
/// `GcHeap` mapping would back; word-indexed, guarded by a mutex since a
/// couple of scenarios below touch it from more than one simulated process.
struct TestHeap {
    words: Mutex<Vec<OffsetPtr>>,
}

impl TestHeap {
    fn new(size_words: usize) -> Self {
        TestHeap { words: Mutex::new(vec![OffsetPtr::NULL; size_words]) }
    }

    fn get(&self, word: usize) -> OffsetPtr {
        self.words.lock().unwrap()[word]
    }

    fn set(&self, word: usize, value: OffsetPtr) {
        self.words.lock().unwrap()[word] = value;
    }

    fn snapshot(&self, base: usize, size_words: usize) -> Vec<OffsetPtr> {
        self.words.lock().unwrap()[base..base + size_words].to_vec()
    }
}

/// Drains `queue` (seeded with `roots`), marking every reachable object in
/// `bm` and scanning its outgoing references via `desc_of` (§4.1
/// marking1/marking2, collapsed into a single pass since these tests run
/// without a concurrent mutator).
fn mark_reachable(
    bm: &MarkBitmap,
    queue: &TraversalQueue,
    heap: &TestHeap,
    roots: &[OffsetPtr],
    desc_of: impl Fn(OffsetPtr) -> StaticDescriptor,
) {
    for &r in roots {
        if !r.is_null() {
            queue.push(r);
        }
    }
    while let Some(p) = queue.pop() {
        let word = word_of(p);
        if !bm.mark_begin(word) {
            continue;
        }
        let desc = desc_of(p);
        bm.mark_end(word + desc.size_words - 1);
        let snapshot = heap.snapshot(word, desc.size_words);
        let refs = unsafe { descriptor::scan_references(snapshot.as_ptr(), &desc) };
        for r in refs {
            queue.push(r);
        }
    }
}

/// Sweeps every logical chunk of `bm`, publishing each free region found to
/// `backend` exactly once (§4.1 sweep1/sweep2, collapsed into a single pass:
/// `MarkBitmap::expand_free_chunk`'s begin-bit CAS is what actually
/// guarantees "exactly once" at a chunk boundary, not the two-pass
/// scheduling around it).
fn sweep_all(bm: &MarkBitmap, backend: &dyn AllocationBackend) -> Vec<(usize, usize)> {
    let mut published = Vec::new();
    while let Some(chunk) = bm.claim_next_chunk() {
        let start = bm.chunk_start_word(chunk);
        let end = bm.chunk_end_word(chunk);
        let mut word = start;
        while word < end {
            if bm.is_marked(word) {
                while word < end && !bm.is_end_marked(word) {
                    word += 1;
                }
                word += 1;
                continue;
            }
            let mut free_end = word;
            while free_end < end && !bm.is_marked(free_end) {
                free_end += 1;
            }
            let size = free_end - word;
            if size > 0 {
                let (b, e, claimed) = bm.expand_free_chunk(word, size);
                if claimed {
                    let sz = e - b;
                    backend.publish_free(ptr_of(b), sz);
                    published.push((b, sz));
                }
            }
            word = free_end;
        }
        bm.mark_chunk_done(chunk);
    }
    published
}

const NO_REFS: StaticDescriptor = StaticDescriptor { size_words: 8, reference_offsets: &[] };

fn no_refs(_p: OffsetPtr) -> StaticDescriptor {
    NO_REFS
}

#[test]
fn allocate_mark_sweep_leaf_is_collected_when_unreachable() {
    // Heap layout: a live "prefix" object [0, 64), the leaf O at [64, 72),
    // a live "suffix" object [72, 4096) — isolating O as the only free gap.
    let bm = MarkBitmap::new(4096, 64);
    bm.mark_begin_first(0, 63);
    bm.mark_begin_first(72, 4095);
    assert!(!bm.is_marked(64));

    let backend = BumpAllocator::new(4096);
    let freed = sweep_all(&bm, &backend);

    assert_eq!(freed, vec![(64, 8)]);
}

#[test]
fn anchored_root_keeps_its_object_alive_across_a_cycle() {
    let bm = MarkBitmap::new(4096, 64);
    bm.mark_begin_first(0, 63);
    bm.mark_begin_first(72, 4095);

    let table = Arc::new(XrtTable::new(8, 2));
    let anchor = Anchor::create(&table, ptr_of(64), 4).unwrap();

    let heap = TestHeap::new(4096);
    let queue = TraversalQueue::new();
    mark_reachable(&bm, &queue, &heap, &table.roots(), no_refs);
    assert!(bm.is_marked(64));

    let backend = BumpAllocator::new(4096);
    let freed = sweep_all(&bm, &backend);
    assert!(freed.is_empty(), "the anchored object must not be swept");

    // A fresh cycle with the anchor dropped collects it.
    drop(anchor);
    bm.begin_cycle();
    bm.mark_begin_first(0, 63);
    bm.mark_begin_first(72, 4095);
    mark_reachable(&bm, &queue, &heap, &table.roots(), no_refs);
    let freed = sweep_all(&bm, &backend);
    assert_eq!(freed, vec![(64, 8)]);
}

#[test]
fn last_writer_wins_and_the_overwritten_object_is_collected() {
    // R is a root object with one reference field F at word offset 1;
    // O and O' are two candidate referents. Both stores happen while the
    // barrier is inactive (no concurrent marking yet), matching the
    // "allocate, then store, then run a cycle" scenario rather than a
    // store racing a live marking phase.
    let bm = MarkBitmap::new(4096, 64);
    let heap = TestHeap::new(4096);
    let r_desc = StaticDescriptor { size_words: 2, reference_offsets: &[1] };
    let r_word = 800usize;
    let o_word = 64usize;
    let o_prime_word = 128usize;
    heap.set(r_word + 1, OffsetPtr::NULL);

    let block = Block::new(0);
    assert_eq!(block.observed_phase.load(), crate::handshake::Phase::PreMarking);
    assert_eq!(BarrierMode::from(block.observed_phase.load()), BarrierMode::Inactive);

    // P1 stores O into F.
    let lhs = heap.get(r_word + 1);
    write_barrier::write_barrier(&block, &bm, lhs, ptr_of(o_word), || heap.set(r_word + 1, ptr_of(o_word)));
    // P2 overwrites F with O'.
    let lhs = heap.get(r_word + 1);
    write_barrier::write_barrier(&block, &bm, lhs, ptr_of(o_prime_word), || {
        heap.set(r_word + 1, ptr_of(o_prime_word))
    });
    assert!(block.mark_buffer.is_empty(), "an inactive barrier greys nothing");

    bm.mark_begin_first(r_word, r_word + 1);
    let queue = TraversalQueue::new();
    mark_reachable(&bm, &queue, &heap, &[ptr_of(r_word)], |p| {
        if word_of(p) == r_word {
            r_desc
        } else {
            StaticDescriptor { size_words: 8, reference_offsets: &[] }
        }
    });

    assert!(bm.is_marked(o_prime_word), "O' is reachable through F and must survive");
    assert!(!bm.is_marked(o_word), "O is no longer reachable and must be collected");
}

#[test]
fn a_dead_process_mid_marking_does_not_lose_its_grey_work() {
    let capacity = 2;
    let mut backing: Vec<SharedProcessRecord> = (0..capacity).map(|_| SharedProcessRecord::__test_empty()).collect();
    let table = unsafe { SharedProcessTable::from_raw(backing.as_mut_ptr(), capacity) };
    table.init();
    let collective = Arc::new(Collective::new(Arc::new(table), crate::config::Options::default()));

    let slot_a = collective.table().claim_slot().unwrap();
    let slot_b = collective.table().claim_slot().unwrap();
    let block_a = Arc::new(Block::new(slot_a));
    let block_b = Arc::new(Block::new(slot_b));
    collective.register(slot_a, block_a.clone());
    collective.register(slot_b, block_b.clone());

    let bm = MarkBitmap::new(4096, 64);
    let heap = TestHeap::new(4096);
    let live_word = 256usize;
    // B discovered `live_word` but dies before marking it.
    block_b.traversal_queue.push(ptr_of(live_word));

    // B's process vanished: publish a liveness record the OS check can
    // never agree with (same technique as handshake::driver's own tests).
    collective
        .table()
        .slot(slot_b)
        .store_liveness(Liveness { creation_time: 0xDEAD, pid: u32::MAX, alive: Alive::Live });

    let reaped = collective.reap_lapsed(slot_a, &block_a);
    assert_eq!(reaped, vec![slot_b]);

    mark_reachable(&bm, &block_a.traversal_queue, &heap, &[], no_refs);
    assert!(bm.is_marked(live_word), "A must finish marking B's orphaned grey reference");
}

#[test]
fn a_free_region_straddling_a_chunk_boundary_is_published_exactly_once() {
    // chunk_words=1 means one rep-word (64 heap words) per logical chunk;
    // chunks 5 and 6 cover words [320, 384) and [384, 448).
    let bm = MarkBitmap::new(4096, 1);
    bm.mark_begin_first(300, 349);
    bm.mark_begin_first(400, 449);

    // Sweeper for chunk 5 only sees as far as its own chunk boundary.
    let (b1, e1, claimed1) = bm.expand_free_chunk(350, 384 - 350);
    // Sweeper for chunk 6 starts from its own boundary.
    let (b2, e2, claimed2) = bm.expand_free_chunk(384, 400 - 384);

    assert_eq!((b1, e1), (350, 400));
    assert_eq!((b2, e2), (350, 400));
    assert_ne!(claimed1, claimed2, "exactly one sweeper must win the boundary CAS");
}

#[test]
fn drive_marking_and_drive_sweep_collect_an_unreachable_leaf() {
    // Same heap layout as `allocate_mark_sweep_leaf_is_collected_when_unreachable`,
    // but driven end to end through `Collective::drive_marking`/`drive_sweep1`/
    // `drive_sweep2` instead of this module's own `mark_reachable`/`sweep_all`
    // glue, to exercise the library's own marking and sweeping engine.
    let backing = vec![OffsetPtr::NULL; 4096];
    crate::offset_ptr::set_base(backing.as_ptr() as *const u8);

    let mut table_backing: Vec<SharedProcessRecord> = vec![SharedProcessRecord::__test_empty()];
    let table = unsafe { SharedProcessTable::from_raw(table_backing.as_mut_ptr(), table_backing.len()) };
    table.init();
    let collective = Collective::new(Arc::new(table), crate::config::Options::default());
    let slot = collective.table().claim_slot().unwrap();
    let block = Arc::new(Block::new(slot));
    collective.register(slot, block.clone());

    let bm = MarkBitmap::new(4096, 64);
    block.traversal_queue.push(ptr_of(0));
    block.traversal_queue.push(ptr_of(72));

    let desc_of = |p: OffsetPtr| {
        if word_of(p) == 0 {
            StaticDescriptor { size_words: 64, reference_offsets: &[] }
        } else {
            StaticDescriptor { size_words: 4096 - 72, reference_offsets: &[] }
        }
    };
    collective.drive_marking(slot, &block, &bm, &desc_of);
    assert!(bm.is_marked(0));
    assert!(bm.is_marked(72));
    assert!(!bm.is_marked(64), "the leaf at [64, 72) was never a traversal root");

    let backend = BumpAllocator::new(4096);
    collective.drive_sweep1(&block, &bm, &backend);
    collective.drive_sweep2(&block, &bm, &backend);

    let (reused, _) = backend.allocate(8).unwrap();
    assert_eq!(reused, ptr_of(64), "the swept leaf's region is reused before the bump cursor advances");

    crate::offset_ptr::set_base(std::ptr::null());
}

#[test]
fn repeated_external_anchor_acquisition_across_threads_hits_the_cache() {
    let table = Arc::new(XrtTable::new(8, 2));
    let p = ptr_of(64);

    let anchor = Anchor::create(&table, p, 4).unwrap();
    let slot = anchor.slot_index();

    // A second "process" (thread) re-acquiring an anchor for the same
    // referent must hit the global weak-reference cache rather than
    // claiming a fresh slot, as long as some handle keeps the slot alive.
    let table_for_peer = table.clone();
    let peer_slot = std::thread::spawn(move || {
        let hit = Anchor::create(&table_for_peer, p, 4).unwrap();
        hit.slot_index()
    })
    .join()
    .unwrap();

    assert_eq!(peer_slot, slot);
    assert_eq!(table.roots(), vec![p]);
}
