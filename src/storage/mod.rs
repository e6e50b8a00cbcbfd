//! # Storage Module
//!
//! On-disk layout definitions and the byte-level access layer for flatdb.
//!
//! ## Layout Constants
//!
//! The file begins with a fixed 128-byte header, followed by the hash
//! directory: `hash_size + 1` four-byte chain heads. Slot 0 is the head of
//! the free-space chain (the allocator's virtual bucket); slot `1 + b` is
//! the head of hash bucket `b`. The record heap starts immediately after
//! the directory and runs to end of file.
//!
//! Records are self-describing: a 24-byte header, `total_length` bytes of
//! payload capacity (key bytes then data bytes, possibly with slack), and
//! a 4-byte tailer repeating `total_length`. A record therefore occupies
//! `total_length + RECORD_OVERHEAD` bytes, and the record immediately to
//! the left of any offset can be found by reading the 4 bytes before it.
//!
//! ## Access Layer
//!
//! All reads and writes go through the [`Backend`] trait: a bounds-checked
//! byte arena over either a memory-mapped file ([`FileBackend`]) or an
//! owned buffer ([`MemBackend`], used for scratch databases and tests).
//! Out-of-range access is reported as corruption, never as a panic; record
//! offsets are a dedicated index type ([`Off`]) rather than bare integers.
//!
//! Multi-byte fields are host byte order on disk. A handle that detects a
//! foreign-endian file at open time byte-swaps struct copies at this
//! boundary; nothing above the storage layer sees swapped values.

mod backend;
mod header;
mod mmap;
mod record;

pub use backend::{Backend, FileBackend, MemBackend, RangeLock};
pub(crate) use backend::fcntl_lock as raw_range_lock;
pub use header::{FileHeader, FILE_MAGIC, FORMAT_VERSION};
pub use mmap::MmapArena;
pub use record::{RecordHeader, RecordTag};

/// Size of the fixed file header.
pub const FILE_HEADER_SIZE: u32 = 128;

/// Byte offset of the hash directory (equal to the header size).
pub const DIRECTORY_OFFSET: u32 = FILE_HEADER_SIZE;

/// Byte offset of the sequence-number field inside the header. The field
/// doubles as the anchor for its own one-byte advisory lock, so it must
/// stay outside the directory lock range.
pub const SEQNUM_OFFSET: u32 = 48;

/// Size of a record header on disk.
pub const RECORD_HEADER_SIZE: u32 = 24;

/// Size of the tailer that terminates every record.
pub const TAILER_SIZE: u32 = 4;

/// Bytes of bookkeeping around every record's payload capacity.
pub const RECORD_OVERHEAD: u32 = RECORD_HEADER_SIZE + TAILER_SIZE;

/// Payload lengths are rounded up to this multiple.
pub const ALIGNMENT: u32 = 4;

/// Minimum surplus worth splitting off a recycled free record. Anything
/// smaller stays as slack inside the allocated record.
pub const MIN_REC_SIZE: u32 = RECORD_OVERHEAD + ALIGNMENT;

/// Default number of hash buckets for newly created databases.
pub const DEFAULT_HASH_SIZE: u32 = 131;

/// Rounds a payload length up to [`ALIGNMENT`].
#[inline]
pub const fn align_up(len: u32) -> u32 {
    (len + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}

/// A byte offset into the database file.
///
/// `Off(0)` is the null offset: chains use it as their end marker, and no
/// record can ever live at offset zero (the header does).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Off(pub u32);

impl Off {
    /// The end-of-chain marker.
    pub const NULL: Off = Off(0);

    /// Returns true for the end-of-chain marker.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The raw byte offset.
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Off {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Byte offset of a directory slot. List -1 is the free-space chain;
/// lists `0..hash_size` are the hash buckets.
#[inline]
pub fn directory_slot(list: i64) -> u32 {
    debug_assert!(list >= -1);
    DIRECTORY_OFFSET + ((list + 1) as u32) * 4
}

/// Byte offset of the first record, given the directory width.
#[inline]
pub fn heap_start(hash_size: u32) -> u32 {
    DIRECTORY_OFFSET + (hash_size + 1) * 4
}
