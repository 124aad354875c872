//! Per-process bounded FIFO of grey references (§3 `mark_buffer_list`, §4.1).
//!
//! Grounded in `original_source/include/mpgc/mark_buffer.h`'s `mark_buffer<T>`:
//! a chain of fixed-size buffers (`buffer_size = 254`), appended to by the
//! owning process's write barrier and drained, in order, by marking. The
//! original backs the chain with a lock-free `sesd_queue`; a mark buffer is
//! single-writer (the owning process) and single-reader (the owning process,
//! or the driver once it has adopted a dead process's buffer under the
//! liveness CAS) by construction, so a mutex-protected `VecDeque` gives the
//! same access pattern without hand-rolling a lock-free queue for a path that
//! is never contended outside of an already-serialized takeover.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::offset_ptr::OffsetPtr;

/// Matches the original's `buffer_size = 254`.
pub const BUFFER_SIZE: usize = 254;

struct Buffer {
    data: [OffsetPtr; BUFFER_SIZE],
    len: usize,
    read: usize,
}

impl Buffer {
    fn new() -> Self {
        Buffer { data: [OffsetPtr::NULL; BUFFER_SIZE], len: 0, read: 0 }
    }

    fn is_full(&self) -> bool {
        self.len == BUFFER_SIZE
    }

    fn is_drained(&self) -> bool {
        self.read == self.len
    }
}

/// A process's mark buffer: the destination of every `mark-grey` performed
/// by its write barrier (§4.4), and the source marking drains from (§4.1
/// marking1/marking2).
pub struct MarkBuffer {
    buffers: Mutex<VecDeque<Buffer>>,
    dead: std::sync::atomic::AtomicBool,
}

impl Default for MarkBuffer {
    fn default() -> Self {
        MarkBuffer { buffers: Mutex::new(VecDeque::new()), dead: std::sync::atomic::AtomicBool::new(false) }
    }
}

impl MarkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a grey reference (§4.4 `mark-grey`). Starts a fresh buffer
    /// when the tail is full or the chain is empty.
    pub fn push(&self, p: OffsetPtr) {
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.back().map_or(true, Buffer::is_full) {
            buffers.push_back(Buffer::new());
        }
        let tail = buffers.back_mut().unwrap();
        tail.data[tail.len] = p;
        tail.len += 1;
    }

    /// Drains the next grey reference, in FIFO order, for marking to process
    /// (§4.1 "drains its own mark buffer, moving references to its
    /// traversal queue"). Buffers are dropped once fully read.
    pub fn pop(&self) -> Option<OffsetPtr> {
        let mut buffers = self.buffers.lock().unwrap();
        loop {
            let front = buffers.front_mut()?;
            if front.is_drained() {
                buffers.pop_front();
                continue;
            }
            let p = front.data[front.read];
            front.read += 1;
            return Some(p);
        }
    }

    /// §4.1 "cooperation invariant": a process must drain its buffer fully
    /// before crossing a barrier. `true` once every queued buffer is empty.
    pub fn is_empty(&self) -> bool {
        let buffers = self.buffers.lock().unwrap();
        buffers.iter().all(Buffer::is_drained)
    }

    /// Marks this process's buffer dead (§4.1 liveness takeover): the
    /// buffer's remaining contents are still valid and will be drained by
    /// whichever process adopts them, but no further pushes should occur.
    pub fn mark_dead(&self) {
        self.dead.store(true, std::sync::atomic::Ordering::Release);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Drops every buffered entry without processing them (postSweep
    /// "fold their mark buffers into oblivion" for reaped dead processes
    /// whose contents were already adopted and drained during the cycle).
    pub fn clear(&self) {
        self.buffers.lock().unwrap().clear();
    }
}
