//! # Database Handle
//!
//! This module provides the public `Database` API: opening and creating
//! database files, the CRUD operations, whole-file locking, sequence
//! tracking, and wipe. The handle is `Send + Sync`; all mutable state
//! (backend, lock table, cursor, last error) sits behind one mutex, so a
//! handle can be shared across threads while cross-process coordination
//! stays with the advisory lock layer.
//!
//! ## Operation Shape
//!
//! Every keyed operation follows the same pattern:
//!
//! ```text
//! hash the key -> lock the owning bucket -> walk the chain ->
//! mutate or copy out -> unlock -> (optionally) bump the sequence number
//! ```
//!
//! Chain walks skip records tagged dead: those are logically deleted
//! entries left in place either because a traversal pinned them or
//! because the handle runs with a dead-record budget to keep deletes off
//! the allocator lock. When the per-chain dead count exceeds the budget,
//! the next delete purges the whole chain in one pass.
//!
//! ## Store Modes
//!
//! `Insert` fails on an existing key, `Modify` fails on a missing one,
//! `Replace` takes either. An update whose bytes already match is a no-op;
//! an update that fits the existing record's capacity is done in place,
//! which is the only mutation path that never touches the allocator.

use std::fs;
use std::os::unix::fs::FileExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use zerocopy::IntoBytes;

use crate::error::{Error, ErrorCode, Result};
use crate::hash::{bucket_of, key_hash};
use crate::locks::{LockMode, LockTable, FREE_LIST};
use crate::storage::{
    directory_slot, heap_start, Backend, FileBackend, FileHeader, MemBackend, Off, RangeLock,
    RecordHeader, RecordTag, DEFAULT_HASH_SIZE, FILE_HEADER_SIZE, RECORD_HEADER_SIZE,
    SEQNUM_OFFSET,
};

/// Severity passed to a handle's log callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Debug,
}

/// Per-handle log callback; receives a severity and formatted message.
pub type LogFn = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Collision policy for [`Database::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Fail with `Exists` if the key is already present.
    Insert,
    /// Store unconditionally.
    Replace,
    /// Fail with `NotFound` unless the key is already present.
    Modify,
}

/// Builder for database handles.
#[derive(Clone)]
pub struct OpenOptions {
    hash_size: u32,
    read_only: bool,
    create: bool,
    no_lock: bool,
    max_dead: u32,
    sequence: bool,
    log: Option<LogFn>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            hash_size: DEFAULT_HASH_SIZE,
            read_only: false,
            create: true,
            no_lock: false,
            max_dead: 0,
            sequence: false,
            log: None,
        }
    }
}

impl OpenOptions {
    /// Number of hash buckets for a newly created file. Existing files
    /// keep the bucket count they were created with; it is never resized.
    pub fn hash_size(mut self, hash_size: u32) -> Self {
        self.hash_size = hash_size;
        self
    }

    /// Open for reading only; every mutation fails with `ReadOnly`.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Create the file if it does not exist (default true).
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Skip every OS lock call. Only safe when exactly one process uses
    /// the file; in-process lock bookkeeping still runs.
    pub fn no_lock(mut self, no_lock: bool) -> Self {
        self.no_lock = no_lock;
        self
    }

    /// Dead-record budget per chain. Non-zero makes deletes tag records
    /// dead instead of freeing them, deferring allocator work until a
    /// chain accumulates more than this many dead records.
    pub fn max_dead(mut self, max_dead: u32) -> Self {
        self.max_dead = max_dead;
        self
    }

    /// Bump the header's sequence number on every mutation.
    pub fn sequence(mut self, sequence: bool) -> Self {
        self.sequence = sequence;
        self
    }

    /// Per-handle log callback; without one, events go to `tracing`.
    pub fn log_fn(mut self, log: LogFn) -> Self {
        self.log = Some(log);
        self
    }

    /// Opens (or creates) a database file.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Database> {
        Database::open_with(self, path.as_ref())
    }

    /// Creates a database backed by an in-process buffer: nothing touches
    /// the filesystem and the handle is its only user.
    pub fn open_in_memory(self) -> Result<Database> {
        Database::open_memory_with(self)
    }
}

/// One record pinned by the first/next-key cursor or a traversal.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CursorState {
    pub(crate) list: i64,
    pub(crate) off: Off,
}

pub(crate) struct DbInner {
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) hash_size: u32,
    pub(crate) convert: bool,
    pub(crate) read_only: bool,
    pub(crate) no_lock: bool,
    pub(crate) max_dead: u32,
    pub(crate) sequence: bool,
    pub(crate) locks: LockTable,
    pub(crate) cursor: Option<CursorState>,
    pub(crate) traversals: u32,
    pub(crate) last_error: ErrorCode,
    log: Option<LogFn>,
}

/// A hash-indexed, memory-mapped, single-file key-value store.
pub struct Database {
    inner: Mutex<DbInner>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Opens `path` with default options, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        OpenOptions::default().open(path)
    }

    /// Returns an options builder.
    pub fn options() -> OpenOptions {
        OpenOptions::default()
    }

    fn open_with(opts: OpenOptions, path: &Path) -> Result<Self> {
        if opts.hash_size == 0 {
            return Err(Error::Invalid("hash_size must be at least 1".into()));
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(!opts.read_only)
            .create(opts.create && !opts.read_only)
            .open(path)?;

        if file.metadata()?.len() == 0 {
            if opts.read_only {
                return Err(Error::Invalid(
                    "cannot open an empty database read-only".into(),
                ));
            }
            initialize_file(&file, opts.hash_size, opts.no_lock)?;
        }

        let backend: Box<dyn Backend> = if opts.read_only {
            Box::new(FileBackend::open_ro(file)?)
        } else {
            Box::new(FileBackend::open_rw(file)?)
        };

        let db = Self::from_backend(backend, opts, Some(path.to_path_buf()))?;
        Ok(db)
    }

    fn open_memory_with(opts: OpenOptions) -> Result<Self> {
        if opts.hash_size == 0 {
            return Err(Error::Invalid("hash_size must be at least 1".into()));
        }
        let top = heap_start(opts.hash_size);
        let mut backend = MemBackend::with_len(top);
        let header = FileHeader::new(opts.hash_size);
        backend.write(0, header.as_bytes())?;

        let mut opts = opts;
        // A buffer has exactly one user; OS locks would be meaningless.
        opts.no_lock = true;
        opts.read_only = false;
        Self::from_backend(Box::new(backend), opts, None)
    }

    fn from_backend(
        backend: Box<dyn Backend>,
        opts: OpenOptions,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let header_bytes = backend.read(0, FILE_HEADER_SIZE)?.to_vec();
        let (header, convert) = FileHeader::parse(&header_bytes)?;
        let hash_size = header.hash_size();

        if backend.len() < heap_start(hash_size) {
            return Err(Error::Corrupt(format!(
                "file of {} bytes cannot hold a {hash_size}-bucket directory",
                backend.len()
            )));
        }

        Ok(Self {
            inner: Mutex::new(DbInner {
                backend,
                hash_size,
                convert,
                read_only: opts.read_only,
                no_lock: opts.no_lock,
                max_dead: opts.max_dead,
                sequence: opts.sequence,
                locks: LockTable::default(),
                cursor: None,
                traversals: 0,
                last_error: ErrorCode::Success,
                log: opts.log,
            }),
            path,
        })
    }

    /// Path this handle was opened on; `None` for in-memory databases.
    pub fn name(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of hash buckets, fixed at file creation.
    pub fn hash_size(&self) -> u32 {
        self.inner.lock().hash_size
    }

    /// Code of the last failed public operation on this handle
    /// (`Success` if the most recent one succeeded).
    pub fn last_error(&self) -> ErrorCode {
        self.inner.lock().last_error
    }

    /// The raw file descriptor, for external `stat`/`fsync` by backup
    /// tools. `None` for in-memory databases.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.inner.lock().backend.raw_fd()
    }

    /// The handle's log callback, if one was installed at open time.
    pub fn log_fn(&self) -> Option<LogFn> {
        self.inner.lock().log.clone()
    }

    /// Enables sequence tracking for the rest of this handle's lifetime.
    pub fn enable_sequence(&self) {
        self.inner.lock().sequence = true;
    }

    pub(crate) fn with_inner<T>(&self, f: impl FnOnce(&mut DbInner) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        let result = f(&mut inner);
        inner.last_error = match &result {
            Ok(_) => ErrorCode::Success,
            Err(e) => e.code(),
        };
        result
    }

    #[cfg(test)]
    pub(crate) fn inner_for_tests(&self) -> parking_lot::MutexGuard<'_, DbInner> {
        self.inner.lock()
    }

    /// Stores `data` under `key` according to `mode`.
    pub fn store(&self, key: &[u8], data: &[u8], mode: StoreMode) -> Result<()> {
        self.with_inner(|inner| {
            let mutated = inner.store_op(key, data, mode)?;
            if mutated {
                inner.bump_sequence();
            }
            Ok(())
        })
    }

    /// Copies out the value stored under `key`.
    pub fn fetch(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.with_inner(|inner| inner.fetch_op(key))
    }

    /// Removes `key`. Reports `NotFound` if it was never stored, and on
    /// the second of two back-to-back deletes.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.with_inner(|inner| {
            inner.delete_op(key)?;
            inner.bump_sequence();
            Ok(())
        })
    }

    /// Appends `data` to the value under `key`, creating it if missing.
    pub fn append(&self, key: &[u8], data: &[u8]) -> Result<()> {
        self.with_inner(|inner| {
            inner.append_op(key, data)?;
            inner.bump_sequence();
            Ok(())
        })
    }

    /// True if `key` is currently stored.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.with_inner(|inner| inner.exists_op(key))
    }

    /// Drops every key in one operation, without per-key deletion.
    ///
    /// The entire former data region is re-inserted into the free chain,
    /// as two pieces if a crash-recovery area installed by an external
    /// writer sits in the middle, which is preserved untouched. Repeating
    /// the call never changes the file size.
    pub fn wipe_all(&self) -> Result<()> {
        self.with_inner(|inner| {
            if inner.read_only {
                return Err(Error::ReadOnly);
            }
            inner.lock_all(LockMode::Write, true)?;
            let result = inner.wipe_locked();
            let unlock = inner.unlock_all(LockMode::Write);
            result.and(unlock)?;
            inner.bump_sequence();
            Ok(())
        })
    }

    /// Locks the whole database exclusively, blocking until granted.
    pub fn lock_all(&self) -> Result<()> {
        self.with_inner(|inner| {
            if inner.read_only {
                return Err(Error::ReadOnly);
            }
            inner.lock_all(LockMode::Write, true)
        })
    }

    /// Non-blocking [`Self::lock_all`]; fails with `Lock` when contended.
    pub fn try_lock_all(&self) -> Result<()> {
        self.with_inner(|inner| {
            if inner.read_only {
                return Err(Error::ReadOnly);
            }
            inner.lock_all(LockMode::Write, false)
        })
    }

    /// Releases one exclusive whole-database lock reference.
    pub fn unlock_all(&self) -> Result<()> {
        self.with_inner(|inner| inner.unlock_all(LockMode::Write))
    }

    /// Locks the whole database shared: writers block, readers proceed.
    pub fn lock_all_read(&self) -> Result<()> {
        self.with_inner(|inner| inner.lock_all(LockMode::Read, true))
    }

    /// Non-blocking [`Self::lock_all_read`].
    pub fn try_lock_all_read(&self) -> Result<()> {
        self.with_inner(|inner| inner.lock_all(LockMode::Read, false))
    }

    /// Releases one shared whole-database lock reference.
    pub fn unlock_all_read(&self) -> Result<()> {
        self.with_inner(|inner| inner.unlock_all(LockMode::Read))
    }

    /// Current value of the header's change counter.
    pub fn sequence_number(&self) -> Result<u32> {
        self.with_inner(|inner| inner.word_read(SEQNUM_OFFSET))
    }

    /// Overwrites the header's change counter.
    pub fn set_sequence_number(&self, value: u32) -> Result<()> {
        self.with_inner(|inner| {
            if inner.read_only {
                return Err(Error::ReadOnly);
            }
            inner.with_seqnum_locked(|inner| inner.word_write(SEQNUM_OFFSET, value))
        })
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.drop_cursor();
        if inner.any_lock_held() {
            inner.note(
                LogLevel::Debug,
                "closing with locks still held; the descriptor close releases them",
            );
        }
        let _ = inner.backend.sync();
    }
}

/// Writes a fresh header and zeroed directory into an empty file,
/// serialized against racing creators by a lock on the header's first
/// byte.
fn initialize_file(file: &fs::File, hash_size: u32, no_lock: bool) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    if !no_lock {
        crate::storage::raw_range_lock(file.as_raw_fd(), RangeLock::Write, 0, 1, true)?;
    }
    let result = (|| -> Result<()> {
        // Another process may have finished initialization while we
        // waited for the lock.
        if file.metadata()?.len() != 0 {
            return Ok(());
        }
        let top = heap_start(hash_size);
        file.set_len(u64::from(top))?;
        let header = FileHeader::new(hash_size);
        file.write_all_at(header.as_bytes(), 0)?;
        file.sync_all()?;
        Ok(())
    })();
    if !no_lock {
        let _ = crate::storage::raw_range_lock(file.as_raw_fd(), RangeLock::Unlock, 0, 1, true);
    }
    result
}

impl DbInner {
    /// First byte of the record heap.
    #[inline]
    pub(crate) fn heap_top(&self) -> u32 {
        heap_start(self.hash_size)
    }

    /// Reads one u32 field, honoring the cross-endian conversion flag.
    pub(crate) fn word_read(&self, off: u32) -> Result<u32> {
        let bytes = self.backend.read(off, 4)?;
        let value = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(if self.convert {
            value.swap_bytes()
        } else {
            value
        })
    }

    /// Writes one u32 field, honoring the cross-endian conversion flag.
    pub(crate) fn word_write(&mut self, off: u32, value: u32) -> Result<()> {
        let value = if self.convert {
            value.swap_bytes()
        } else {
            value
        };
        self.backend.write(off, &value.to_ne_bytes())
    }

    /// Reads a chain-head slot.
    pub(crate) fn ofs_read(&self, slot: u32) -> Result<Off> {
        Ok(Off(self.word_read(slot)?))
    }

    /// Writes a chain-head slot.
    pub(crate) fn ofs_write(&mut self, slot: u32, off: Off) -> Result<()> {
        self.word_write(slot, off.get())
    }

    /// Reads and validates the record header at `off`.
    ///
    /// Rejects offsets inside the header/directory, unknown status tags,
    /// and declared lengths that run past end of file.
    pub(crate) fn read_record(&self, off: Off) -> Result<RecordHeader> {
        if off.get() < self.heap_top() {
            return Err(Error::Corrupt(format!(
                "record offset {off} inside the directory"
            )));
        }
        let bytes = self.backend.read(off.get(), RECORD_HEADER_SIZE)?;
        let rec = RecordHeader::parse(bytes, self.convert)?;
        match off.get().checked_add(rec.region_size()) {
            Some(end) if end <= self.backend.len() => Ok(rec),
            _ => Err(Error::Corrupt(format!(
                "record {off} with capacity {} overruns end of file",
                rec.total_length()
            ))),
        }
    }

    /// Writes the record header at `off`.
    pub(crate) fn write_record(&mut self, off: Off, rec: &RecordHeader) -> Result<()> {
        self.backend.write(off.get(), &rec.to_disk(self.convert))
    }

    /// Writes the record's tailer: a trailing copy of its capacity.
    pub(crate) fn write_tailer(&mut self, off: Off, rec: &RecordHeader) -> Result<()> {
        self.word_write(rec.tailer_off(off), rec.total_length())
    }

    /// Copies `len` bytes out of the file.
    pub(crate) fn read_bytes(&self, off: u32, len: u32) -> Result<Vec<u8>> {
        Ok(self.backend.read(off, len)?.to_vec())
    }

    /// Routes an event to the handle's callback, or to `tracing`.
    pub(crate) fn note(&self, level: LogLevel, msg: &str) {
        match &self.log {
            Some(log) => log(level, msg),
            None => match level {
                LogLevel::Error => tracing::error!(target: "flatdb", "{msg}"),
                LogLevel::Warn => tracing::warn!(target: "flatdb", "{msg}"),
                LogLevel::Debug => tracing::debug!(target: "flatdb", "{msg}"),
            },
        }
    }

    /// Walks `list`'s chain for `key`. Caller holds the chain lock.
    ///
    /// Dead records are skipped; a chain entry pointing at itself is
    /// corruption.
    pub(crate) fn find(
        &self,
        list: i64,
        hash: u32,
        key: &[u8],
    ) -> Result<Option<(Off, RecordHeader)>> {
        let mut cur = self.ofs_read(directory_slot(list))?;
        while !cur.is_null() {
            let rec = self.read_record(cur)?;
            if rec.next_off() == cur {
                return Err(Error::Corrupt(format!("hash chain cycles at {cur}")));
            }
            if rec.status() == Some(RecordTag::Live)
                && rec.owning_hash() == hash
                && rec.key_length() as usize == key.len()
                && self.backend.read(cur.get() + RECORD_HEADER_SIZE, rec.key_length())? == key
            {
                return Ok(Some((cur, rec)));
            }
            cur = rec.next_off();
        }
        Ok(None)
    }

    /// Unlinks `off` from `list` by rewriting its predecessor's pointer.
    pub(crate) fn unlink_record(&mut self, list: i64, off: Off, next: Off) -> Result<()> {
        let slot = directory_slot(list);
        let head = self.ofs_read(slot)?;
        if head == off {
            return self.ofs_write(slot, next);
        }
        let mut cur = head;
        while !cur.is_null() {
            let mut rec = self.read_record(cur)?;
            if rec.next_off() == cur {
                return Err(Error::Corrupt(format!("hash chain cycles at {cur}")));
            }
            if rec.next_off() == off {
                rec.set_next_off(next);
                return self.write_record(cur, &rec);
            }
            cur = rec.next_off();
        }
        Err(Error::Corrupt(format!(
            "record {off} is not linked into its chain"
        )))
    }

    /// Physically deletes a found record, or tags it dead when it cannot
    /// be reclaimed yet: a traversal of this handle may be resting on it,
    /// another process may have it pinned, or the handle runs with a
    /// dead-record budget and defers allocator work on purpose.
    pub(crate) fn do_delete(&mut self, list: i64, off: Off, rec: &RecordHeader) -> Result<()> {
        let deferred = self.max_dead > 0;
        let pinned_locally = self.traversals > 0 || self.is_pinned(off);
        if deferred || pinned_locally || !self.probe_record(off) {
            let mut dead = *rec;
            dead.set_status(RecordTag::Dead);
            return self.write_record(off, &dead);
        }
        self.unlink_record(list, off, rec.next_off())?;
        self.release(off, *rec)
    }

    /// Counts dead records on `list`. Caller holds the chain lock.
    fn count_dead(&self, list: i64) -> Result<u32> {
        let mut count = 0;
        let mut cur = self.ofs_read(directory_slot(list))?;
        while !cur.is_null() {
            let rec = self.read_record(cur)?;
            if rec.next_off() == cur {
                return Err(Error::Corrupt(format!("hash chain cycles at {cur}")));
            }
            if rec.status() == Some(RecordTag::Dead) {
                count += 1;
            }
            cur = rec.next_off();
        }
        Ok(count)
    }

    /// Unlinks and frees every dead record on `list` in one pass, under
    /// a single allocator lock. A record that fails to free is left
    /// unlinked and logged; one bad record must not wedge the chain.
    pub(crate) fn purge_dead(&mut self, list: i64) -> Result<()> {
        self.with_list_locked(FREE_LIST, LockMode::Write, |inner| {
            let slot = directory_slot(list);
            let mut prev: Option<Off> = None;
            let mut cur = inner.ofs_read(slot)?;
            while !cur.is_null() {
                let rec = inner.read_record(cur)?;
                let next = rec.next_off();
                if next == cur {
                    return Err(Error::Corrupt(format!("hash chain cycles at {cur}")));
                }
                if rec.status() == Some(RecordTag::Dead) && !inner.is_pinned(cur) {
                    match prev {
                        None => inner.ofs_write(slot, next)?,
                        Some(p) => {
                            let mut prev_rec = inner.read_record(p)?;
                            prev_rec.set_next_off(next);
                            inner.write_record(p, &prev_rec)?;
                        }
                    }
                    if let Err(e) = inner.release(cur, rec) {
                        inner.note(
                            LogLevel::Warn,
                            &format!("purge could not free dead record {cur}: {e}"),
                        );
                    }
                } else {
                    prev = Some(cur);
                }
                cur = next;
            }
            Ok(())
        })
    }

    /// Links a fresh record for (key, data) into `list`, recycling a dead
    /// record from the same chain when the budget makes that likely to
    /// pay off. Caller holds the chain lock.
    fn insert_record(&mut self, list: i64, hash: u32, key: &[u8], data: &[u8]) -> Result<()> {
        let needed = payload_len(key, data)?;

        if self.max_dead > 0 {
            if let Some((off, dead)) = self.find_dead(list, needed)? {
                // Reuse in place: the record keeps its chain position.
                let rec = RecordHeader::new(
                    dead.next_off(),
                    dead.total_length(),
                    key.len() as u32,
                    data.len() as u32,
                    hash,
                    RecordTag::Live,
                );
                self.write_record(off, &rec)?;
                self.write_payload(off, key, data)?;
                return Ok(());
            }
        }

        let (off, claimed) = self.allocate(needed)?;
        let slot = directory_slot(list);
        let head = self.ofs_read(slot)?;
        let rec = RecordHeader::new(
            head,
            claimed.total_length(),
            key.len() as u32,
            data.len() as u32,
            hash,
            RecordTag::Live,
        );
        self.write_record(off, &rec)?;
        self.write_payload(off, key, data)?;
        self.ofs_write(slot, off)
    }

    /// First dead record on `list` with at least `needed` capacity.
    fn find_dead(&self, list: i64, needed: u32) -> Result<Option<(Off, RecordHeader)>> {
        let mut cur = self.ofs_read(directory_slot(list))?;
        while !cur.is_null() {
            let rec = self.read_record(cur)?;
            if rec.next_off() == cur {
                return Err(Error::Corrupt(format!("hash chain cycles at {cur}")));
            }
            if rec.status() == Some(RecordTag::Dead)
                && rec.total_length() >= needed
                && !self.is_pinned(cur)
            {
                return Ok(Some((cur, rec)));
            }
            cur = rec.next_off();
        }
        Ok(None)
    }

    fn write_payload(&mut self, off: Off, key: &[u8], data: &[u8]) -> Result<()> {
        self.backend.write(off.get() + RECORD_HEADER_SIZE, key)?;
        self.backend
            .write(off.get() + RECORD_HEADER_SIZE + key.len() as u32, data)
    }

    /// Store body; returns whether anything was written.
    pub(crate) fn store_op(&mut self, key: &[u8], data: &[u8], mode: StoreMode) -> Result<bool> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        payload_len(key, data)?;
        let hash = key_hash(key);
        let list = i64::from(bucket_of(hash, self.hash_size));
        self.with_list_locked(list, LockMode::Write, |inner| {
            inner.store_locked(list, hash, key, data, mode)
        })
    }

    /// Store under an already-held chain lock (shared with append).
    fn store_locked(
        &mut self,
        list: i64,
        hash: u32,
        key: &[u8],
        data: &[u8],
        mode: StoreMode,
    ) -> Result<bool> {
        if let Some((off, mut rec)) = self.find(list, hash, key)? {
            if mode == StoreMode::Insert {
                return Err(Error::Exists);
            }

            let value_off = off.get() + RECORD_HEADER_SIZE + rec.key_length();
            if rec.data_length() as usize == data.len()
                && self.backend.read(value_off, rec.data_length())? == data
            {
                // Byte-identical update: nothing to do.
                return Ok(false);
            }

            if payload_len(key, data)? <= rec.total_length() {
                // In-place update: the only mutation that skips the
                // allocator entirely.
                self.backend.write(value_off, data)?;
                rec.set_data_length(data.len() as u32);
                self.write_record(off, &rec)?;
                return Ok(true);
            }

            self.do_delete(list, off, &rec)?;
        } else if mode == StoreMode::Modify {
            return Err(Error::NotFound);
        }

        self.insert_record(list, hash, key, data)?;
        Ok(true)
    }

    pub(crate) fn fetch_op(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let hash = key_hash(key);
        let list = i64::from(bucket_of(hash, self.hash_size));
        self.with_list_locked(list, LockMode::Read, |inner| {
            let (off, rec) = inner.find(list, hash, key)?.ok_or(Error::NotFound)?;
            inner.read_bytes(
                off.get() + RECORD_HEADER_SIZE + rec.key_length(),
                rec.data_length(),
            )
        })
    }

    pub(crate) fn exists_op(&mut self, key: &[u8]) -> Result<bool> {
        let hash = key_hash(key);
        let list = i64::from(bucket_of(hash, self.hash_size));
        self.with_list_locked(list, LockMode::Read, |inner| {
            Ok(inner.find(list, hash, key)?.is_some())
        })
    }

    pub(crate) fn delete_op(&mut self, key: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let hash = key_hash(key);
        let list = i64::from(bucket_of(hash, self.hash_size));
        self.with_list_locked(list, LockMode::Write, |inner| {
            let (off, rec) = inner.find(list, hash, key)?.ok_or(Error::NotFound)?;
            if inner.max_dead > 0 {
                // Purge first so the freshly tagged record stays cheap.
                if inner.count_dead(list)? >= inner.max_dead {
                    inner.purge_dead(list)?;
                }
                let mut dead = rec;
                dead.set_status(RecordTag::Dead);
                inner.write_record(off, &dead)
            } else {
                inner.do_delete(list, off, &rec)
            }
        })
    }

    pub(crate) fn append_op(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let hash = key_hash(key);
        let list = i64::from(bucket_of(hash, self.hash_size));
        // One chain lock across read-modify-write keeps the append atomic
        // against other processes appending to the same key.
        self.with_list_locked(list, LockMode::Write, |inner| {
            let mut value = match inner.find(list, hash, key)? {
                Some((off, rec)) => inner.read_bytes(
                    off.get() + RECORD_HEADER_SIZE + rec.key_length(),
                    rec.data_length(),
                )?,
                None => Vec::new(),
            };
            value.extend_from_slice(data);
            inner.store_locked(list, hash, key, &value, StoreMode::Replace)?;
            Ok(())
        })
    }

    /// Wipe body; caller holds the whole-file lock.
    fn wipe_locked(&mut self) -> Result<()> {
        let top = self.heap_top();
        let len = self.backend.len();

        self.ofs_write(directory_slot(FREE_LIST), Off::NULL)?;
        for bucket in 0..self.hash_size {
            self.ofs_write(directory_slot(i64::from(bucket)), Off::NULL)?;
        }

        let recovery = self.word_read(RECOVERY_OFFSET)?;
        if recovery == 0 {
            self.free_region(top, len)?;
        } else {
            if recovery < top || recovery >= len {
                return Err(Error::Corrupt(format!(
                    "recovery area at {recovery:#x} outside the data region"
                )));
            }
            // The recovery area is record-shaped; its capacity field
            // gives the bytes to preserve untouched.
            let rec_total = self.word_read(recovery + 4)?;
            let rec_end = recovery
                .checked_add(rec_total)
                .and_then(|e| e.checked_add(crate::storage::RECORD_OVERHEAD))
                .filter(|&e| e <= len)
                .ok_or_else(|| {
                    Error::Corrupt(format!("recovery area at {recovery:#x} overruns the file"))
                })?;
            self.free_region(top, recovery)?;
            self.free_region(rec_end, len)?;
        }
        Ok(())
    }

    /// Free-lists `[start, end)` as a single record. Regions too small to
    /// carry a record header are skipped; tailer plausibility checks keep
    /// such slivers from ever being misread as neighbors.
    fn free_region(&mut self, start: u32, end: u32) -> Result<()> {
        if end <= start {
            return Ok(());
        }
        let size = end - start;
        if size < crate::storage::RECORD_OVERHEAD + crate::storage::ALIGNMENT {
            self.note(
                LogLevel::Warn,
                &format!("skipping {size}-byte sliver at {start:#x}"),
            );
            return Ok(());
        }
        let head = self.ofs_read(directory_slot(FREE_LIST))?;
        let rec = RecordHeader::free(head, size - crate::storage::RECORD_OVERHEAD);
        let off = Off(start);
        self.write_record(off, &rec)?;
        self.write_tailer(off, &rec)?;
        self.ofs_write(directory_slot(FREE_LIST), off)
    }

    /// Increments the header's change counter under its dedicated lock.
    /// Best-effort by design: failure to bump never fails the operation.
    pub(crate) fn bump_sequence(&mut self) {
        if !self.sequence {
            return;
        }
        let _ = self.with_seqnum_locked(|inner| {
            let value = inner.word_read(SEQNUM_OFFSET)?.wrapping_add(1);
            inner.word_write(SEQNUM_OFFSET, value)
        });
    }

    /// Runs `f` holding the one-byte sequence-number lock. The byte sits
    /// inside the header, outside every chain and whole-file range, so
    /// this never punches a hole in another held lock.
    fn with_seqnum_locked<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if !self.no_lock {
            self.backend
                .lock_range(RangeLock::Write, SEQNUM_OFFSET, 1, true)?;
        }
        let result = f(self);
        if !self.no_lock {
            let unlock = self
                .backend
                .lock_range(RangeLock::Unlock, SEQNUM_OFFSET, 1, true);
            return match result {
                Ok(v) => unlock.map(|_| v),
                Err(e) => Err(e),
            };
        }
        result
    }
}

/// Byte offset of the header's recovery-area pointer.
const RECOVERY_OFFSET: u32 = 44;

/// Combined payload length, rejecting sizes the format cannot hold
/// (the limit leaves room for alignment rounding).
fn payload_len(key: &[u8], data: &[u8]) -> Result<u32> {
    key.len()
        .checked_add(data.len())
        .and_then(|n| u32::try_from(n).ok())
        .filter(|&n| n <= u32::MAX - crate::storage::ALIGNMENT)
        .ok_or_else(|| Error::Oom("key and data exceed the record size limit".into()))
}
