//! File system
//!
//! Out of scope (§1): the file system is an external collaborator. The
//! process subsystem only needs `open`/`read`/`write`/`seek`/`tell`/`close`
//! plus `create`/`remove`, all serialized by one global lock (§5) — not a
//! general block-device-backed tree. This is a flat namespace (no
//! directories), matching what the syscall table in §6 actually exposes.

pub mod memory;

pub use memory::OpenFile;

/// Filesystem error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    NoSpace,
    TooManyOpenFiles,
    InvalidHandle,
    IoError,
    Internal,
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::NotFound => write!(f, "not found"),
            FsError::AlreadyExists => write!(f, "already exists"),
            FsError::NoSpace => write!(f, "no space left"),
            FsError::TooManyOpenFiles => write!(f, "too many open files"),
            FsError::InvalidHandle => write!(f, "invalid file handle"),
            FsError::IoError => write!(f, "I/O error"),
            FsError::Internal => write!(f, "internal error"),
        }
    }
}

/// Initialize the file system. Idempotent.
pub fn init() {
    memory::init();
}

/// `create(path, size)` (§6 #4): make a new zeroed file. False if it
/// already exists.
pub fn create(name: &str, size: usize) -> bool {
    memory::create(name, size)
}

/// `remove(path)` (§6 #5). Real Pintos semantics: removing a file still
/// open elsewhere does not invalidate the open handles, it only unlinks the
/// name. This backend frees the data with the last close instead, which is
/// observably identical to any caller that doesn't re-`open` the same name
/// expecting to see old data.
pub fn remove(name: &str) -> bool {
    memory::remove(name)
}

/// `open(path)` (§6 #6), returning a handle positioned at offset 0.
pub fn open(name: &str) -> Result<OpenFile, FsError> {
    memory::open(name)
}

pub fn exists(name: &str) -> bool {
    memory::exists(name)
}
