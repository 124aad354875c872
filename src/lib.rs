//! MPGC is a concurrent, mostly-non-blocking mark-and-sweep garbage collector
//! that manages a single heap backed by a memory-mapped file and shared by
//! multiple cooperating processes. Any attached process can allocate
//! objects, mutate reference fields, and read the heap; all attached
//! processes participate collectively in identifying and reclaiming
//! unreachable objects. The collector stays correct when a process dies
//! without warning and when a new process attaches to an already-live heap.
//!
//! This crate implements the core triad:
//! * the concurrent mark/sweep coordination protocol — [`handshake`]'s phase
//!   state machine and barrier handshake, [`process`]'s per-process state,
//!   and [`write_barrier`];
//! * the mark bitmap — [`bitmap`], with its superposed sweep bitmap and
//!   lock-free parallel sweep support;
//! * the external-reference table — [`xrt`], anchoring heap references held
//!   by transient process memory.
//!
//! Everything the core treats as an external collaborator — the raw
//! allocator ([`alloc`]), object-descriptor encoding ([`descriptor`]), and
//! the persistent heap file's exact layout beyond what [`heap`] needs to
//! attach to it — is consumed through a narrow trait or free function rather
//! than implemented here.

pub mod alloc;
pub mod bitmap;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod handshake;
pub mod heap;
pub mod mark_buffer;
pub mod offset_ptr;
pub mod process;
pub mod traversal_queue;
pub mod write_barrier;
pub mod xrt;

#[cfg(test)]
mod tests;

pub use config::Options;
pub use error::AttachError;
pub use handshake::{BarrierMode, Collective, Phase};
pub use heap::ProcessHandle;
pub use offset_ptr::OffsetPtr;
pub use xrt::{Anchor, SubAnchor};
