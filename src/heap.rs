//! File-backed `MAP_SHARED` heaps and the process-attach protocol (§6).
//!
//! Grounded in `mmtk-core`'s `util/os/posix_common.rs` raw-libc mmap style
//! (`wrap_libc_call`): the teacher already depends on `libc` and maps memory
//! through raw syscalls rather than a higher-level crate, so the file-backed
//! shared mapping this core needs follows the same idiom instead of pulling
//! in `memmap2`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::{self, Options};
use crate::error::AttachError;
use crate::handshake::Collective;
use crate::offset_ptr;
use crate::process::block::Block;
use crate::process::shared::SharedProcessTable;

/// Default size of the object heap when this process is the first to create
/// it. spec.md's environment-variable list (§6) names only the *path*
/// overrides, not a size tunable, so the size is a fixed constant here; a
/// real deployment that needs a larger heap creates the file itself ahead of
/// time; a later attach that errors with `SizeMismatch` is the textual
/// record of why the existing file's size wins (see `open_or_create_sized`).
const DEFAULT_GC_HEAP_BYTES: usize = 64 * 1024 * 1024;

/// Opens `path`, creating it at `size` bytes if this call is the one that
/// creates it. If the file already exists, its current size must be at
/// least `size` — the existing file always wins (§9 Open Question: "a heap
/// file is never silently shrunk or grown by an attacher that didn't create
/// it").
fn open_or_create_sized(path: &Path, size: u64) -> Result<File, AttachError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|source| AttachError::HeapsDir { path: parent.to_path_buf(), source })?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|source| AttachError::HeapFile { path: path.to_path_buf(), source })?;
    let metadata = file.metadata().map_err(|source| AttachError::HeapFile { path: path.to_path_buf(), source })?;
    if metadata.len() == 0 {
        file.set_len(size).map_err(|source| AttachError::HeapFile { path: path.to_path_buf(), source })?;
    } else if metadata.len() < size {
        return Err(AttachError::SizeMismatch { expected: size as usize, actual: metadata.len() as usize });
    }
    Ok(file)
}

/// Maps `file`'s first `size` bytes `MAP_SHARED`, `PROT_READ | PROT_WRITE`.
fn mmap_shared(file: &File, size: usize) -> io::Result<*mut u8> {
    // SAFETY: `file` is open for read/write and at least `size` bytes long
    // (the caller sized it via `open_or_create_sized`); the resulting
    // mapping is released in the owning type's `Drop`.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(addr as *mut u8)
}

/// The object heap: a raw `MAP_SHARED` mapping every attached process
/// resolves `OffsetPtr`s against (§6 "Heap file").
pub struct GcHeap {
    _file: File,
    base: *mut u8,
    size: usize,
}

// The mapping is shared, position-independent memory; synchronization of
// its contents is the mark bitmap's / allocator's job, not this wrapper's.
unsafe impl Send for GcHeap {}
unsafe impl Sync for GcHeap {}

impl GcHeap {
    fn open(path: &Path, size: usize) -> Result<Self, AttachError> {
        let file = open_or_create_sized(path, size as u64)?;
        let base = mmap_shared(&file, size).map_err(AttachError::Mmap)?;
        Ok(GcHeap { _file: file, base, size })
    }

    pub fn base(&self) -> *const u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for GcHeap {
    fn drop(&mut self) {
        // SAFETY: `base`/`size` describe exactly the mapping created in
        // `open`, never resized or partially unmapped elsewhere.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

const CONTROL_MAGIC: u32 = 0x4D50_4743; // "MPGC" in ASCII, read little-endian.
const CONTROL_VERSION: u32 = 1;

/// The control heap's fixed header: a magic/version word pair CAS'd into
/// place by whichever process first creates the file (§6 "verify-or-install
/// the control block"), immediately followed by the `SharedProcessRecord`
/// spine.
#[repr(C)]
struct ControlHeader {
    magic: AtomicU32,
    version: AtomicU32,
}

/// The control heap: the magic/version header plus the `SharedProcessTable`
/// every attached process reads and CASes directly (§6 "control block").
pub struct ControlHeap {
    _file: File,
    base: *mut u8,
    size: usize,
    slot_capacity: usize,
}

unsafe impl Send for ControlHeap {}
unsafe impl Sync for ControlHeap {}

impl ControlHeap {
    fn header_bytes() -> usize {
        std::mem::size_of::<ControlHeader>()
    }

    fn table_bytes(slot_capacity: usize) -> usize {
        slot_capacity * std::mem::size_of::<crate::process::shared::SharedProcessRecord>()
    }

    /// Opens the control heap, returning it alongside whether this call was
    /// the one that installed the control block (first attacher) as opposed
    /// to merely verifying an existing one.
    fn open(path: &Path, slot_capacity: usize) -> Result<(Self, bool), AttachError> {
        let size = Self::header_bytes() + Self::table_bytes(slot_capacity);
        let file = open_or_create_sized(path, size as u64)?;
        let base = mmap_shared(&file, size).map_err(AttachError::Mmap)?;
        let control = ControlHeap { _file: file, base, size, slot_capacity };
        let installed = control.install_or_verify()?;
        Ok((control, installed))
    }

    fn header(&self) -> &ControlHeader {
        // SAFETY: `base` points at a mapping at least `header_bytes()` long.
        unsafe { &*(self.base as *const ControlHeader) }
    }

    /// First attacher wins the magic/version CAS and is responsible for
    /// initializing the table region that follows; every later attacher
    /// only verifies (§6 "verify-or-install the control block").
    fn install_or_verify(&self) -> Result<bool, AttachError> {
        let header = self.header();
        match header.magic.compare_exchange(0, CONTROL_MAGIC, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                header.version.store(CONTROL_VERSION, Ordering::Release);
                Ok(true)
            }
            Err(found) if found == CONTROL_MAGIC => {
                let version = header.version.load(Ordering::Acquire);
                if version != CONTROL_VERSION {
                    return Err(AttachError::BadMagic { found: version as u64 });
                }
                Ok(false)
            }
            Err(found) => Err(AttachError::BadMagic { found: found as u64 }),
        }
    }

    /// The `SharedProcessTable` living just past the header. The first
    /// attacher must call [`SharedProcessTable::init`] on the result before
    /// any slot is touched; `ProcessHandle::attach` does this.
    fn table(&self) -> SharedProcessTable {
        // SAFETY: `records_base` points at `table_bytes(slot_capacity)`
        // mapped bytes immediately following the header, for the lifetime
        // of this `ControlHeap`'s mapping.
        let records_base =
            unsafe { self.base.add(Self::header_bytes()) } as *mut crate::process::shared::SharedProcessRecord;
        unsafe { SharedProcessTable::from_raw(records_base, self.slot_capacity) }
    }
}

impl Drop for ControlHeap {
    fn drop(&mut self) {
        // SAFETY: see `GcHeap::drop`.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

/// A successfully attached process: owns both heap mappings, its claimed
/// slot in the shared process table, its local `Block`, and the `Collective`
/// handle the handshake/write-barrier code runs against (§6 "allocate this
/// process's per-process block").
pub struct ProcessHandle {
    _gc_heap: GcHeap,
    control_heap: ControlHeap,
    slot: usize,
    block: Arc<Block>,
    collective: Arc<Collective>,
}

impl ProcessHandle {
    /// Runs the full attach protocol (§6): open-or-create both heap files,
    /// map them, verify-or-install the control block, claim a slot, publish
    /// liveness.
    pub fn attach(opts: Options) -> Result<ProcessHandle, AttachError> {
        let gc_heap = GcHeap::open(&config::gc_heap_file(), DEFAULT_GC_HEAP_BYTES)?;
        offset_ptr::set_base(gc_heap.base());

        let slot_capacity = num_cpus::get().max(4) * 4;
        let (control_heap, installed) = ControlHeap::open(&config::control_heap_file(), slot_capacity)?;
        let table = control_heap.table();
        if installed {
            // Only the process that won the magic-word CAS zeroes the slot
            // region into the all-`Dead` state; every later attacher relies
            // on that having already happened (§6 "verify-or-install").
            table.init();
        }

        let slot = table.claim_slot().ok_or_else(|| AttachError::SizeMismatch {
            expected: slot_capacity,
            actual: table.live_slots().count(),
        })?;
        let block = Arc::new(Block::new(slot));
        let collective = Arc::new(Collective::new(Arc::new(table), opts));
        collective.register(slot, block.clone());

        Ok(ProcessHandle { _gc_heap: gc_heap, control_heap, slot, block, collective })
    }

    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    pub fn collective(&self) -> &Arc<Collective> {
        &self.collective
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // §6 "On clean exit: mark liveness Dead" — published to the
        // genuinely shared record so peers see it without needing this
        // process's local `Block` to still be registered anywhere.
        self.block.mark_dead_on_exit();
        let table = self.control_heap.table();
        table.slot(self.slot).store_liveness(self.block.liveness());
        self.collective.unregister(self.slot);
    }
}
