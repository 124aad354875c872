//! Object descriptors: the external collaborator's encoding is out of
//! scope (§1 Non-goals), but the core needs an interface to consume
//! "enumerate outgoing references of this object, given its descriptor."

use crate::offset_ptr::OffsetPtr;

/// Resolves an object's size in words and the offsets of its reference-typed
/// fields. Implemented by whatever owns the object-descriptor encoding;
/// the core only ever calls through this trait.
pub trait Descriptor {
    /// Size of the object, in heap words, including its header word.
    fn size_words(&self) -> usize;

    /// Offsets, in words from the object's start, of every reference-typed
    /// field. Used by marking to enqueue outgoing references (§4.1
    /// marking1/marking2).
    fn reference_offsets(&self) -> &[usize];
}

/// A descriptor is "invalid" (§7 "Descriptor invalid") when it names a word
/// offset that does not land within the object it claims to describe, or an
/// object that does not start at the claimed word. Debug builds assert;
/// release builds treat the offending reference as a non-reference (a leak
/// risk, not a crash), matching §7's documented policy.
pub fn validate<D: Descriptor>(desc: &D) -> bool {
    let size = desc.size_words();
    let ok = desc.reference_offsets().iter().all(|&off| off < size);
    debug_assert!(ok, "descriptor names a reference offset outside its own object");
    ok
}

/// Decodes a hex descriptor bit-string and logs its field layout, for the
/// out-of-scope `descprint` CLI to build on (§6, §11.3). This function does
/// no allocation and does not touch the heap; it only decodes the bit
/// pattern a descriptor word encodes into (size, reference-offset count).
///
/// The bit layout mirrors the original `gc_descriptor::trace_desc`: the low
/// 32 bits give the object size in words, the high 32 bits give a count of
/// trailing reference-offset words that would follow the descriptor in the
/// heap (decoding those words themselves is the allocator collaborator's
/// concern and out of scope here).
pub fn trace_desc(word: u64, label: &str) {
    let size_words = word & 0xFFFF_FFFF;
    let ref_count = word >> 32;
    log::info!(
        "{label}: descriptor 0x{word:016x} -> size_words={size_words}, reference_offset_count={ref_count}"
    );
}

/// A fixed reference map, useful for tests and for small fixed-shape objects
/// that know their own layout at compile time.
pub struct StaticDescriptor {
    pub size_words: usize,
    pub reference_offsets: &'static [usize],
}

impl Descriptor for StaticDescriptor {
    fn size_words(&self) -> usize {
        self.size_words
    }
    fn reference_offsets(&self) -> &[usize] {
        self.reference_offsets
    }
}

/// Enumerates the non-null outgoing references of an object starting at
/// `base`, given its descriptor. Each yielded `OffsetPtr` is read directly
/// out of the object's payload words.
///
/// # Safety
/// `base` must point at a live, fully-initialized object of exactly the
/// shape `desc` describes.
pub unsafe fn scan_references<D: Descriptor>(base: *const OffsetPtr, desc: &D) -> Vec<OffsetPtr> {
    desc.reference_offsets()
        .iter()
        .map(|&word_off| unsafe { *base.add(word_off) })
        .filter(|p| !p.is_null())
        .collect()
}
