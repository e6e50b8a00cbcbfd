//! # File Header
//!
//! The first 128 bytes of every database file. Layout:
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ----------------------------------------------
//! 0       32    Magic: "flatdb key-value store v1\n" + NULs
//! 32      4     Format version
//! 36      4     hash_size: number of hash buckets
//! 40      4     Reserved, always zero
//! 44      4     recovery_start: offset of a crash-recovery area (0 = none)
//! 48      4     sequence_number: best-effort change counter
//! 52      76    Zero padding to 128 bytes
//! ```
//!
//! Multi-byte fields are host byte order. A file written on a
//! foreign-endian machine is recognized by its version field reading
//! correctly only after a byte swap; the handle then swaps every
//! multi-byte field crossing the disk boundary. The magic is a byte
//! string and identifies the file either way.
//!
//! The recovery-area pointer is carried for a future write-ahead
//! transaction log. Nothing in this crate creates one, but `wipe_all`
//! preserves an area another writer may have installed.

use zerocopy::native_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::FILE_HEADER_SIZE;
use crate::error::{Error, Result};

/// Identifies a flatdb database file.
pub const FILE_MAGIC: &[u8; 32] = b"flatdb key-value store v1\n\0\0\0\0\0\0";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 32],
    version: U32,
    hash_size: U32,
    reserved0: U32,
    recovery_start: U32,
    sequence_number: U32,
    padding: [u8; 76],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE as usize);

impl FileHeader {
    pub fn new(hash_size: u32) -> Self {
        Self {
            magic: *FILE_MAGIC,
            version: U32::new(FORMAT_VERSION),
            hash_size: U32::new(hash_size),
            reserved0: U32::new(0),
            recovery_start: U32::new(0),
            sequence_number: U32::new(0),
            padding: [0u8; 76],
        }
    }

    /// Parses a header copy out of `bytes`, detecting foreign endianness.
    ///
    /// Returns the header in host byte order plus the convert flag: true
    /// when the file was written with the opposite byte order and every
    /// multi-byte field must be swapped at the disk boundary.
    pub fn parse(bytes: &[u8]) -> Result<(Self, bool)> {
        if bytes.len() < FILE_HEADER_SIZE as usize {
            return Err(Error::Corrupt(format!(
                "file too small for header: {} < {}",
                bytes.len(),
                FILE_HEADER_SIZE
            )));
        }

        let header = Self::read_from_bytes(&bytes[..FILE_HEADER_SIZE as usize])
            .map_err(|e| Error::Corrupt(format!("unreadable file header: {e:?}")))?;

        if &header.magic != FILE_MAGIC {
            return Err(Error::Corrupt("bad magic: not a flatdb file".into()));
        }

        let (header, convert) = if header.version.get() == FORMAT_VERSION {
            (header, false)
        } else if header.version.get().swap_bytes() == FORMAT_VERSION {
            (header.byte_swapped(), true)
        } else {
            return Err(Error::Corrupt(format!(
                "unsupported format version {:#x}",
                header.version.get()
            )));
        };

        if header.reserved0.get() != 0 {
            return Err(Error::Corrupt("nonzero reserved header field".into()));
        }
        if header.hash_size.get() == 0 {
            return Err(Error::Corrupt("zero hash_size in header".into()));
        }

        Ok((header, convert))
    }

    /// Returns a copy with every multi-byte field byte-swapped.
    pub fn byte_swapped(&self) -> Self {
        Self {
            magic: self.magic,
            version: U32::new(self.version.get().swap_bytes()),
            hash_size: U32::new(self.hash_size.get().swap_bytes()),
            reserved0: U32::new(self.reserved0.get().swap_bytes()),
            recovery_start: U32::new(self.recovery_start.get().swap_bytes()),
            sequence_number: U32::new(self.sequence_number.get().swap_bytes()),
            padding: self.padding,
        }
    }

    zerocopy_accessors! {
        version: u32,
        hash_size: u32,
        recovery_start: u32,
        sequence_number: u32,
    }
}
