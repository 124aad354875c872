//! Process-independent heap references.
//!
//! A heap reference is stored as a signed byte offset from a base address that
//! is re-derived by every process at attach time (`Heap::attach`, see
//! `heap.rs`). Because every process's mapping begins logically at the same
//! base, two processes holding the same `OffsetPtr` point at the same logical
//! object even though the absolute address of the mapping differs between
//! them. A zero offset is reserved for null and is preserved across processes
//! without translation.

use std::cmp;
use std::fmt;
use std::mem;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::atomic::{AtomicIsize, Ordering};

/// Size in bytes.
pub type ByteSize = usize;
/// Signed offset in bytes.
pub type ByteOffset = isize;

/// The process-local base that offsets are resolved against. Set exactly
/// once per process by `Heap::attach`, before any `OffsetPtr` is resolved.
static BASE: AtomicIsize = AtomicIsize::new(0);

/// Rebase this process onto `base`. Must be called once, before any
/// `OffsetPtr::resolve` / `OffsetPtr::from_ptr` call in this process.
pub fn set_base(base: *const u8) {
    BASE.store(base as isize, Ordering::Release);
}

fn base() -> isize {
    BASE.load(Ordering::Acquire)
}

/// A process-independent reference into the shared heap: a signed offset
/// from the per-process base. Zero always denotes null, in every process,
/// regardless of where the backing file happened to be mapped.
///
/// This type is `repr(transparent)` over `isize` so it can be packed directly
/// into descriptor words and mark-bitmap-adjacent structures without padding.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash)]
pub struct OffsetPtr(isize);

impl OffsetPtr {
    /// The null offset pointer. Null in every process.
    pub const NULL: OffsetPtr = OffsetPtr(0);

    /// Constructs an `OffsetPtr` from a raw offset already expressed relative
    /// to the shared base. Only `Heap`/`offset_ptr` internals should call
    /// this; arbitrary offsets are not guaranteed to land inside the heap.
    #[inline(always)]
    pub(crate) fn from_raw(offset: isize) -> OffsetPtr {
        OffsetPtr(offset)
    }

    /// Returns the raw offset, for storage in descriptor words or the
    /// mark bitmap's auxiliary tables.
    #[inline(always)]
    pub(crate) fn raw(&self) -> isize {
        self.0
    }

    /// Derives the `OffsetPtr` for a live pointer in the *current* process's
    /// mapping. The pointer must fall within the heap mapping this process
    /// attached to, or the resulting offset is meaningless in other
    /// processes.
    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> OffsetPtr {
        if ptr.is_null() {
            return OffsetPtr::NULL;
        }
        OffsetPtr(ptr as isize - base())
    }

    /// Resolves this offset to an absolute pointer valid in the current
    /// process. Returns a null pointer for `OffsetPtr::NULL`.
    ///
    /// # Safety
    /// The caller must ensure the offset was produced from a pointer that
    /// was valid for some live object in the shared heap; this function does
    /// no bounds checking against the heap extent.
    #[inline(always)]
    pub unsafe fn resolve<T>(&self) -> *const T {
        if self.is_null() {
            return std::ptr::null();
        }
        (base() + self.0) as *const T
    }

    /// Mutable counterpart of `resolve`.
    ///
    /// # Safety
    /// Same contract as `resolve`.
    #[inline(always)]
    pub unsafe fn resolve_mut<T>(&self) -> *mut T {
        self.resolve::<T>() as *mut T
    }

    /// Is this the null offset?
    #[inline(always)]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Shifts the offset by `count` `T`-sized elements.
    #[inline(always)]
    pub fn shift<T>(self, count: isize) -> Self {
        self + mem::size_of::<T>() as isize * count
    }

    /// Aligns the offset up to `align`, which must be a power of two.
    #[inline(always)]
    pub fn align_up(&self, align: ByteSize) -> OffsetPtr {
        let a = align as isize;
        OffsetPtr((self.0 + a - 1) & !(a - 1))
    }

    /// Is this offset aligned to `align` (a power of two)?
    #[inline(always)]
    pub fn is_aligned_to(&self, align: usize) -> bool {
        self.0 as usize % align == 0
    }
}

impl Add<ByteSize> for OffsetPtr {
    type Output = OffsetPtr;
    fn add(self, n: ByteSize) -> OffsetPtr {
        OffsetPtr(self.0 + n as isize)
    }
}

impl AddAssign<ByteSize> for OffsetPtr {
    fn add_assign(&mut self, n: ByteSize) {
        self.0 += n as isize;
    }
}

impl Add<ByteOffset> for OffsetPtr {
    type Output = OffsetPtr;
    fn add(self, n: ByteOffset) -> OffsetPtr {
        OffsetPtr(self.0 + n)
    }
}

impl AddAssign<ByteOffset> for OffsetPtr {
    fn add_assign(&mut self, n: ByteOffset) {
        self.0 += n;
    }
}

impl Sub<ByteSize> for OffsetPtr {
    type Output = OffsetPtr;
    fn sub(self, n: ByteSize) -> OffsetPtr {
        OffsetPtr(self.0 - n as isize)
    }
}

impl SubAssign<ByteSize> for OffsetPtr {
    fn sub_assign(&mut self, n: ByteSize) {
        self.0 -= n as isize;
    }
}

/// Distance between two offsets, in bytes. `self` must not be before `other`.
impl Sub<OffsetPtr> for OffsetPtr {
    type Output = ByteOffset;
    fn sub(self, other: OffsetPtr) -> ByteOffset {
        self.0 - other.0
    }
}

impl PartialEq for OffsetPtr {
    #[inline(always)]
    fn eq(&self, other: &OffsetPtr) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for OffsetPtr {
    #[inline(always)]
    fn partial_cmp(&self, other: &OffsetPtr) -> Option<cmp::Ordering> {
        Some(self.0.cmp(&other.0))
    }
}

impl Ord for OffsetPtr {
    #[inline(always)]
    fn cmp(&self, other: &OffsetPtr) -> cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for OffsetPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OffsetPtr(0x{:x})", self.0)
    }
}

impl Default for OffsetPtr {
    fn default() -> Self {
        OffsetPtr::NULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_zero_and_null_in_every_process() {
        assert!(OffsetPtr::NULL.is_null());
        assert_eq!(OffsetPtr::default(), OffsetPtr::NULL);
        // null resolves to a null pointer regardless of what base is set to.
        set_base(0x1000 as *const u8);
        assert!(unsafe { OffsetPtr::NULL.resolve::<u8>() }.is_null());
        set_base(std::ptr::null());
    }

    #[test]
    fn round_trips_through_from_ptr_and_resolve() {
        let backing = vec![0u8; 64];
        set_base(backing.as_ptr());
        let mid = unsafe { backing.as_ptr().add(16) };
        let off = OffsetPtr::from_ptr(mid);
        assert_eq!(off.raw(), 16);
        let resolved = unsafe { off.resolve::<u8>() };
        assert_eq!(resolved, mid);
        set_base(std::ptr::null());
    }

    #[test]
    fn arithmetic_matches_byte_semantics() {
        let a = OffsetPtr::from_raw(100);
        assert_eq!((a + 8usize).raw(), 108);
        assert_eq!((a - 8usize).raw(), 92);
        assert_eq!((a + (-8isize)).raw(), 92);
        assert_eq!(a - OffsetPtr::from_raw(40), 60);
    }

    #[test]
    fn align_up_rounds_to_next_multiple() {
        let a = OffsetPtr::from_raw(9);
        assert_eq!(a.align_up(8).raw(), 16);
        assert!(OffsetPtr::from_raw(16).is_aligned_to(8));
        assert!(!OffsetPtr::from_raw(9).is_aligned_to(8));
    }

    #[test]
    fn shift_scales_by_element_size() {
        let a = OffsetPtr::from_raw(0);
        assert_eq!(a.shift::<u64>(3).raw(), 24);
    }
}
