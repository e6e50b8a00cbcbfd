//! # Record Format
//!
//! Every entry in the record heap, live or free, carries the same 24-byte
//! header:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -------------------------------------------------------
//! 0       4     next: offset of the next record in this chain (0 = end)
//! 4       4     total_length: payload capacity in bytes
//! 8       4     key_length
//! 12      4     data_length
//! 16      4     owning_hash: full hash of the key
//! 20      4     status tag: live / free / dead magic
//! ```
//!
//! The payload area holds `key_length` key bytes immediately followed by
//! `data_length` data bytes; any remaining capacity is slack left behind
//! by an in-place update or by an allocation not worth splitting. The
//! 4 bytes after the payload area repeat `total_length` (the tailer), so
//! given any record boundary the record to its left can be found without
//! a forward scan.
//!
//! Status tags are non-zero magic constants: freshly grown file space and
//! torn writes read as neither live, free, nor dead, and surface as
//! corruption instead of being misinterpreted.
//!
//! A *dead* record is logically deleted but still physically linked in
//! its bucket chain. Deletion leaves a record dead when unlinking it
//! would race a traversal pin, or when the handle runs with a dead-record
//! budget to avoid taking the allocator lock on every delete. Dead
//! records are skipped by lookups and reclaimed by purge passes.

use zerocopy::native_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{Off, RECORD_HEADER_SIZE, RECORD_OVERHEAD};
use crate::error::{Error, Result};

const TAG_LIVE: u32 = 0x6c69_7665; // "live"
const TAG_FREE: u32 = 0x6672_6565; // "free"
const TAG_DEAD: u32 = 0x6465_6164; // "dead"

/// Status of a record in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTag {
    /// Reachable through a hash-bucket chain.
    Live,
    /// Linked into the free-space chain, available for reuse.
    Free,
    /// Logically deleted, awaiting physical reclamation.
    Dead,
}

impl RecordTag {
    #[inline]
    pub fn magic(self) -> u32 {
        match self {
            RecordTag::Live => TAG_LIVE,
            RecordTag::Free => TAG_FREE,
            RecordTag::Dead => TAG_DEAD,
        }
    }

    #[inline]
    pub fn from_magic(raw: u32) -> Option<Self> {
        match raw {
            TAG_LIVE => Some(RecordTag::Live),
            TAG_FREE => Some(RecordTag::Free),
            TAG_DEAD => Some(RecordTag::Dead),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RecordHeader {
    next: U32,
    total_length: U32,
    key_length: U32,
    data_length: U32,
    owning_hash: U32,
    tag: U32,
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == RECORD_HEADER_SIZE as usize);

impl RecordHeader {
    pub fn new(
        next: Off,
        total_length: u32,
        key_length: u32,
        data_length: u32,
        owning_hash: u32,
        tag: RecordTag,
    ) -> Self {
        Self {
            next: U32::new(next.get()),
            total_length: U32::new(total_length),
            key_length: U32::new(key_length),
            data_length: U32::new(data_length),
            owning_hash: U32::new(owning_hash),
            tag: U32::new(tag.magic()),
        }
    }

    /// Header for a free record of the given capacity.
    pub fn free(next: Off, total_length: u32) -> Self {
        Self::new(next, total_length, 0, 0, 0, RecordTag::Free)
    }

    /// Parses a header copy out of `bytes`, swapping fields if `convert`.
    ///
    /// Validates the status tag; length plausibility against the file size
    /// is the caller's job since only it knows the mapping bounds.
    pub fn parse(bytes: &[u8], convert: bool) -> Result<Self> {
        if bytes.len() < RECORD_HEADER_SIZE as usize {
            return Err(Error::Corrupt(format!(
                "truncated record header: {} < {}",
                bytes.len(),
                RECORD_HEADER_SIZE
            )));
        }
        let header = Self::read_from_bytes(&bytes[..RECORD_HEADER_SIZE as usize])
            .map_err(|e| Error::Corrupt(format!("unreadable record header: {e:?}")))?;
        let header = if convert { header.byte_swapped() } else { header };

        if header.status().is_none() {
            return Err(Error::Corrupt(format!(
                "bad record status tag {:#x}",
                header.tag.get()
            )));
        }
        if header
            .key_length
            .get()
            .checked_add(header.data_length.get())
            .map_or(true, |used| used > header.total_length.get())
        {
            return Err(Error::Corrupt(format!(
                "record payload {}+{} exceeds capacity {}",
                header.key_length.get(),
                header.data_length.get(),
                header.total_length.get()
            )));
        }

        Ok(header)
    }

    /// Serializes the header, swapping fields if `convert`.
    pub fn to_disk(&self, convert: bool) -> [u8; RECORD_HEADER_SIZE as usize] {
        let header = if convert {
            self.byte_swapped()
        } else {
            *self
        };
        let mut out = [0u8; RECORD_HEADER_SIZE as usize];
        out.copy_from_slice(header.as_bytes());
        out
    }

    /// Returns a copy with every field byte-swapped.
    pub fn byte_swapped(&self) -> Self {
        Self {
            next: U32::new(self.next.get().swap_bytes()),
            total_length: U32::new(self.total_length.get().swap_bytes()),
            key_length: U32::new(self.key_length.get().swap_bytes()),
            data_length: U32::new(self.data_length.get().swap_bytes()),
            owning_hash: U32::new(self.owning_hash.get().swap_bytes()),
            tag: U32::new(self.tag.get().swap_bytes()),
        }
    }

    /// The record's status, or `None` for a corrupt tag.
    #[inline]
    pub fn status(&self) -> Option<RecordTag> {
        RecordTag::from_magic(self.tag.get())
    }

    #[inline]
    pub fn set_status(&mut self, tag: RecordTag) {
        self.tag = U32::new(tag.magic());
    }

    /// Offset of the next record in this record's chain.
    #[inline]
    pub fn next_off(&self) -> Off {
        Off(self.next.get())
    }

    #[inline]
    pub fn set_next_off(&mut self, next: Off) {
        self.next = U32::new(next.get());
    }

    /// Total bytes this record occupies on disk, overhead included.
    #[inline]
    pub fn region_size(&self) -> u32 {
        self.total_length.get() + RECORD_OVERHEAD
    }

    /// Offset of this record's tailer, given the record's own offset.
    #[inline]
    pub fn tailer_off(&self, off: Off) -> u32 {
        off.get() + RECORD_HEADER_SIZE + self.total_length.get()
    }

    /// Offset of the record immediately to the right of this one.
    #[inline]
    pub fn right_neighbor(&self, off: Off) -> Off {
        Off(off.get() + self.region_size())
    }

    zerocopy_accessors! {
        total_length: u32,
        key_length: u32,
        data_length: u32,
        owning_hash: u32,
    }
}
