//! # Storage Backend Abstraction
//!
//! The `Backend` trait is the seam between the engine and its bytes. Two
//! implementations exist, selected at open time and held as a trait
//! object:
//!
//! | Backend       | Bytes live in        | Advisory locks |
//! |---------------|----------------------|----------------|
//! | `FileBackend` | memory-mapped file   | fcntl ranges   |
//! | `MemBackend`  | owned buffer         | always granted |
//!
//! `MemBackend` exists for scratch databases and tests: a single handle
//! owns the buffer, so there is no other process to exclude and every
//! lock request succeeds immediately.
//!
//! Byte-range locks are part of the trait because they belong to the same
//! resource: the lock addresses are byte positions in the file, and only
//! the backend knows whether there is a real file descriptor to lock.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::{Error, Result};

use super::mmap::MmapArena;

/// A byte-range lock request passed down to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeLock {
    Read,
    Write,
    Unlock,
}

/// Byte-granular storage with advisory range locking.
pub trait Backend: Send {
    /// A shared, bounds-checked view of `len` bytes at `off`.
    fn read(&self, off: u32, len: u32) -> Result<&[u8]>;

    /// Writes `data` at `off`. Fails on a read-only backend.
    fn write(&mut self, off: u32, data: &[u8]) -> Result<()>;

    /// Current backing size in bytes.
    fn len(&self) -> u32;

    /// Extends the backing store to `new_len` bytes (no-op if smaller).
    fn expand(&mut self, new_len: u32) -> Result<()>;

    /// Flushes dirty state to durable storage.
    fn sync(&self) -> Result<()>;

    /// Applies an advisory lock over `[off, off+len)`. `wait` selects
    /// blocking acquisition; a non-blocking miss reports a lock failure.
    fn lock_range(&self, kind: RangeLock, off: u32, len: u32, wait: bool) -> Result<()>;

    /// The raw descriptor, when one exists, for external stat/fsync.
    fn raw_fd(&self) -> Option<RawFd>;
}

/// Memory-mapped file storage with fcntl advisory locks.
pub struct FileBackend {
    arena: MmapArena,
}

impl FileBackend {
    pub fn open_rw(file: File) -> Result<Self> {
        Ok(Self {
            arena: MmapArena::map_rw(file)?,
        })
    }

    pub fn open_ro(file: File) -> Result<Self> {
        Ok(Self {
            arena: MmapArena::map_ro(file)?,
        })
    }
}

impl Backend for FileBackend {
    fn read(&self, off: u32, len: u32) -> Result<&[u8]> {
        self.arena.range(off, len)
    }

    fn write(&mut self, off: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| Error::Oom(format!("write of {} bytes", data.len())))?;
        self.arena.range_mut(off, len)?.copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> u32 {
        self.arena.len()
    }

    fn expand(&mut self, new_len: u32) -> Result<()> {
        self.arena.grow(new_len)
    }

    fn sync(&self) -> Result<()> {
        self.arena.sync()
    }

    fn lock_range(&self, kind: RangeLock, off: u32, len: u32, wait: bool) -> Result<()> {
        fcntl_lock(self.arena.file().as_raw_fd(), kind, off, len, wait)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.arena.file().as_raw_fd())
    }
}

/// Buffer-backed storage for scratch databases and tests.
pub struct MemBackend {
    bytes: Vec<u8>,
}

impl MemBackend {
    pub fn with_len(len: u32) -> Self {
        Self {
            bytes: vec![0u8; len as usize],
        }
    }
}

impl Backend for MemBackend {
    fn read(&self, off: u32, len: u32) -> Result<&[u8]> {
        let end = off
            .checked_add(len)
            .filter(|&end| end as usize <= self.bytes.len())
            .ok_or_else(|| {
                Error::Corrupt(format!(
                    "access [{off}, {off}+{len}) past end of buffer ({} bytes)",
                    self.bytes.len()
                ))
            })?;
        Ok(&self.bytes[off as usize..end as usize])
    }

    fn write(&mut self, off: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| Error::Oom(format!("write of {} bytes", data.len())))?;
        let end = off
            .checked_add(len)
            .filter(|&end| end as usize <= self.bytes.len())
            .ok_or_else(|| {
                Error::Corrupt(format!(
                    "access [{off}, {off}+{len}) past end of buffer ({} bytes)",
                    self.bytes.len()
                ))
            })?;
        self.bytes[off as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn expand(&mut self, new_len: u32) -> Result<()> {
        if new_len as usize > self.bytes.len() {
            self.bytes.resize(new_len as usize, 0);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn lock_range(&self, _kind: RangeLock, _off: u32, _len: u32, _wait: bool) -> Result<()> {
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// One fcntl record-lock call, retried through EINTR.
pub(crate) fn fcntl_lock(fd: RawFd, kind: RangeLock, off: u32, len: u32, wait: bool) -> Result<()> {
    let l_type = match kind {
        RangeLock::Read => libc::F_RDLCK,
        RangeLock::Write => libc::F_WRLCK,
        RangeLock::Unlock => libc::F_UNLCK,
    };
    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };

    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = off as libc::off_t;
    fl.l_len = len as libc::off_t;

    loop {
        // SAFETY: fd is a valid open descriptor owned by the arena and fl
        // is a fully initialized flock structure.
        let rc = unsafe { libc::fcntl(fd, cmd, &fl) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) | Some(libc::EACCES) if !wait => {
                return Err(Error::Lock(format!(
                    "byte range [{off}, {off}+{len}) held by another process"
                )));
            }
            _ => return Err(Error::Io(err)),
        }
    }
}
