//! Error types for the one fallible surface the core exposes: attaching to
//! the shared heap. Every other error kind named in the design (remote
//! process death, lost global-cache race, descriptor-invalid, traversal-queue
//! overflow) is recovered in-protocol per the error handling policy and never
//! surfaces as a `Result` — it is logged and handled inline instead.

use std::fmt;
use std::io;

/// Unrecoverable environment errors encountered while attaching to the
/// shared heap. The collector cannot make progress without its heap, so
/// callers are expected to log this via `error!` and abort the process.
#[derive(Debug)]
pub enum AttachError {
    /// A heap file could not be opened or created.
    HeapFile { path: std::path::PathBuf, source: io::Error },
    /// `mmap` itself failed.
    Mmap(io::Error),
    /// The control heap file is smaller than a control block, or the file's
    /// recorded size disagrees with the gc heap file actually mapped.
    SizeMismatch { expected: usize, actual: usize },
    /// The control block's magic/version word does not match this build.
    BadMagic { found: u64 },
    /// `MPGC_HEAPS_DIR` (or an override) does not name a directory that can
    /// be created.
    HeapsDir { path: std::path::PathBuf, source: io::Error },
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachError::HeapFile { path, source } => {
                write!(f, "failed to open heap file {}: {}", path.display(), source)
            }
            AttachError::Mmap(e) => write!(f, "mmap failed: {}", e),
            AttachError::SizeMismatch { expected, actual } => write!(
                f,
                "heap size mismatch: control block expects {} bytes, file is {} bytes",
                expected, actual
            ),
            AttachError::BadMagic { found } => {
                write!(f, "control block magic mismatch: found 0x{:x}", found)
            }
            AttachError::HeapsDir { path, source } => {
                write!(f, "failed to prepare heaps directory {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AttachError::HeapFile { source, .. } => Some(source),
            AttachError::Mmap(source) => Some(source),
            AttachError::HeapsDir { source, .. } => Some(source),
            _ => None,
        }
    }
}
