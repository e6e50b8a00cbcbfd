//! # Memory-Mapped Arena
//!
//! `MmapArena` maps a database file into the process address space and
//! hands out bounds-checked byte ranges. The OS page cache does all the
//! caching; there is no user-space buffer layer.
//!
//! ## Safety Model
//!
//! Memory-mapped regions become invalid when the file is grown and
//! remapped. The arena leans on the borrow checker instead of runtime
//! guards:
//!
//! ```text
//! range(&self) -> &[u8]          // immutable borrow of self
//! range_mut(&mut self) -> &mut [u8]  // mutable borrow of self
//! grow(&mut self)                // exclusive borrow
//! ```
//!
//! Since `grow()` requires `&mut self`, no byte reference can be held
//! across a remap. Out-of-range access returns a corruption error rather
//! than panicking: a record header declaring a length past end of file is
//! a damaged database, not a caller bug.
//!
//! ## Read-Only Mappings
//!
//! A handle opened read-only maps the file shared read-only; any attempt
//! to obtain a mutable range reports the read-only violation instead of
//! faulting on the mapping.

use std::fs::File;

use memmap2::{Mmap, MmapMut};

use crate::error::{Error, Result};

enum Map {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

pub struct MmapArena {
    file: File,
    map: Map,
    len: u32,
}

impl MmapArena {
    /// Maps an already-sized file read-write.
    pub fn map_rw(file: File) -> Result<Self> {
        let len = file_len(&file)?;
        // SAFETY: the mapping's lifetime is tied to the arena, every
        // access is bounds-checked against `len`, and concurrent writers
        // coordinate through the advisory lock layer before touching any
        // byte of the shared region.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            map: Map::ReadWrite(map),
            len,
        })
    }

    /// Maps an already-sized file read-only.
    pub fn map_ro(file: File) -> Result<Self> {
        let len = file_len(&file)?;
        // SAFETY: as in `map_rw`; the mapping is additionally immutable.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            file,
            map: Map::ReadOnly(map),
            len,
        })
    }

    /// Total mapped bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// The underlying file, for lock calls and external stat/fsync.
    #[inline]
    pub fn file(&self) -> &File {
        &self.file
    }

    /// A shared view of `len` bytes starting at `off`.
    pub fn range(&self, off: u32, len: u32) -> Result<&[u8]> {
        let end = check_range(off, len, self.len)?;
        let bytes = match &self.map {
            Map::ReadWrite(m) => &m[off as usize..end],
            Map::ReadOnly(m) => &m[off as usize..end],
        };
        Ok(bytes)
    }

    /// An exclusive view of `len` bytes starting at `off`.
    pub fn range_mut(&mut self, off: u32, len: u32) -> Result<&mut [u8]> {
        let end = check_range(off, len, self.len)?;
        match &mut self.map {
            Map::ReadWrite(m) => Ok(&mut m[off as usize..end]),
            Map::ReadOnly(_) => Err(Error::ReadOnly),
        }
    }

    /// Extends the file to `new_len` bytes and remaps.
    pub fn grow(&mut self, new_len: u32) -> Result<()> {
        if new_len <= self.len {
            return Ok(());
        }
        match &self.map {
            Map::ReadWrite(m) => m.flush()?,
            Map::ReadOnly(_) => return Err(Error::ReadOnly),
        }
        self.file.set_len(u64::from(new_len))?;
        // SAFETY: grow() holds &mut self, so no range borrows exist; the
        // old mapping is dropped on reassignment after the flush above.
        self.map = Map::ReadWrite(unsafe { MmapMut::map_mut(&self.file)? });
        self.len = new_len;
        Ok(())
    }

    /// Flushes dirty pages to the file.
    pub fn sync(&self) -> Result<()> {
        if let Map::ReadWrite(m) = &self.map {
            m.flush()?;
        }
        Ok(())
    }
}

fn file_len(file: &File) -> Result<u32> {
    let len = file.metadata()?.len();
    u32::try_from(len).map_err(|_| {
        Error::Invalid(format!("file of {len} bytes exceeds the 4 GiB format limit"))
    })
}

fn check_range(off: u32, len: u32, total: u32) -> Result<usize> {
    match off.checked_add(len) {
        Some(end) if end <= total => Ok(end as usize),
        _ => Err(Error::Corrupt(format!(
            "access [{off}, {off}+{len}) past end of file ({total} bytes)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn scratch_file(len: u64) -> (File, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("arena.fdb"))
            .unwrap();
        file.set_len(len).unwrap();
        (file, dir)
    }

    #[test]
    fn ranges_are_bounds_checked() {
        let (file, _dir) = scratch_file(256);
        let arena = MmapArena::map_rw(file).unwrap();

        assert!(arena.range(0, 256).is_ok());
        assert!(arena.range(255, 1).is_ok());
        assert!(arena.range(256, 1).is_err());
        assert!(arena.range(0, 257).is_err());
        assert!(arena.range(u32::MAX, 8).is_err());
    }

    #[test]
    fn writes_persist_through_remap() {
        let (file, _dir) = scratch_file(64);
        let mut arena = MmapArena::map_rw(file).unwrap();

        arena.range_mut(10, 4).unwrap().copy_from_slice(b"abcd");
        arena.grow(4096).unwrap();

        assert_eq!(arena.len(), 4096);
        assert_eq!(arena.range(10, 4).unwrap(), b"abcd");
    }

    #[test]
    fn grow_to_smaller_size_is_noop() {
        let (file, _dir) = scratch_file(128);
        let mut arena = MmapArena::map_rw(file).unwrap();

        arena.grow(64).unwrap();

        assert_eq!(arena.len(), 128);
    }

    #[test]
    fn read_only_mapping_rejects_mutation() {
        let (file, _dir) = scratch_file(64);
        let mut arena = MmapArena::map_ro(file).unwrap();

        assert!(arena.range(0, 64).is_ok());
        assert!(matches!(arena.range_mut(0, 1), Err(Error::ReadOnly)));
        assert!(matches!(arena.grow(128), Err(Error::ReadOnly)));
    }
}
