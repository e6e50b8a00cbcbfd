//! # Lock Manager
//!
//! Cross-process mutual exclusion is built entirely from POSIX advisory
//! byte-range locks on the database file. Every lock has a fixed,
//! deterministic byte address, so unrelated processes agree on what
//! "locking bucket 7" means without any shared memory:
//!
//! - **Chain locks**: one byte at the bucket's own directory-slot address.
//!   List -1 (the free-space chain) locks the slot at the directory start;
//!   this is the allocator lock guarding every length-changing operation.
//! - **Whole-file lock**: one range covering all directory slots at once.
//!   Taking it while any individual chain lock is held by the same handle
//!   would deadlock against ourselves, so that is refused in-process
//!   before the OS ever sees the request.
//! - **Record pins**: one byte at a record's own offset, taken by the
//!   traversal layer to keep a record from being physically reclaimed
//!   while no chain lock is held. Record offsets are always beyond the
//!   directory, so pins never overlap the whole-file range.
//!
//! ## Refcounting
//!
//! OS record locks do not stack: a second lock over the same range is a
//! no-op and the first unlock drops it. Each handle therefore keeps a
//! table of held (list, mode) locks with refcounts, issuing the OS call
//! only on the 0→1 and 1→0 transitions. Re-acquiring a held lock in a
//! compatible mode (read under read, read under write) just bumps the
//! count; an upgrade from read to write is refused rather than risking a
//! cross-process deadlock. While a whole-file lock of compatible mode is
//! held, individual chain lock and unlock requests succeed without
//! touching the table or the OS.

use smallvec::SmallVec;

use crate::db::DbInner;
use crate::error::{Error, Result};
use crate::storage::{directory_slot, Off, RangeLock};

/// List id of the free-space chain (the allocator lock).
pub(crate) const FREE_LIST: i64 = -1;

/// Acquisition mode for chain and whole-file locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Read,
    Write,
}

impl LockMode {
    #[inline]
    pub(crate) fn range_kind(self) -> RangeLock {
        match self {
            LockMode::Read => RangeLock::Read,
            LockMode::Write => RangeLock::Write,
        }
    }
}

/// One refcounted chain lock held by this handle.
#[derive(Debug)]
pub(crate) struct HeldLock {
    list: i64,
    mode: LockMode,
    count: u32,
}

/// One refcounted record pin held by this handle.
#[derive(Debug)]
pub(crate) struct RecordPin {
    off: u32,
    count: u32,
    os: bool,
}

/// Per-handle lock bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    held: SmallVec<[HeldLock; 8]>,
    pins: SmallVec<[RecordPin; 4]>,
    allrecord: Option<(LockMode, u32)>,
}

impl DbInner {
    /// Byte address of a list's lock: the list's own directory slot.
    #[inline]
    fn lock_offset(&self, list: i64) -> u32 {
        directory_slot(list)
    }

    /// Width of the whole-file lock range: every directory slot.
    #[inline]
    fn directory_width(&self) -> u32 {
        (self.hash_size + 1) * 4
    }

    /// Whether a held whole-file lock already satisfies `mode`.
    /// `Some(Err)` means one is held but in an incompatible mode.
    fn allrecord_covers(&self, mode: LockMode) -> Option<Result<()>> {
        match self.locks.allrecord {
            None => None,
            Some((LockMode::Write, _)) => Some(Ok(())),
            Some((LockMode::Read, _)) if mode == LockMode::Read => Some(Ok(())),
            Some((LockMode::Read, _)) => Some(Err(Error::Lock(
                "write lock requested under a shared whole-file lock".into(),
            ))),
        }
    }

    /// Acquires (or refcounts) the lock for one list, blocking.
    pub(crate) fn lock_list(&mut self, list: i64, mode: LockMode) -> Result<()> {
        if list < FREE_LIST || list >= i64::from(self.hash_size) {
            return Err(Error::Invalid(format!("lock of invalid list {list}")));
        }
        if let Some(covered) = self.allrecord_covers(mode) {
            return covered;
        }
        if let Some(held) = self.locks.held.iter_mut().find(|h| h.list == list) {
            if mode == LockMode::Read || held.mode == LockMode::Write {
                held.count += 1;
                return Ok(());
            }
            return Err(Error::Lock(format!(
                "list {list} already locked for read; upgrades are not supported"
            )));
        }
        if !self.no_lock {
            self.backend
                .lock_range(mode.range_kind(), self.lock_offset(list), 1, true)?;
        }
        self.locks.held.push(HeldLock {
            list,
            mode,
            count: 1,
        });
        Ok(())
    }

    /// Releases one reference on a list lock, issuing the OS unlock at zero.
    pub(crate) fn unlock_list(&mut self, list: i64, mode: LockMode) -> Result<()> {
        if self.allrecord_covers(mode).is_some() {
            return Ok(());
        }
        let pos = self
            .locks
            .held
            .iter()
            .position(|h| h.list == list)
            .ok_or_else(|| Error::Lock(format!("unlock of list {list} which is not held")))?;
        self.locks.held[pos].count -= 1;
        if self.locks.held[pos].count == 0 {
            self.locks.held.swap_remove(pos);
            if !self.no_lock {
                self.backend
                    .lock_range(RangeLock::Unlock, self.lock_offset(list), 1, true)?;
            }
        }
        Ok(())
    }

    /// Runs `f` with `list` locked, releasing on every exit path.
    pub(crate) fn with_list_locked<T>(
        &mut self,
        list: i64,
        mode: LockMode,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.lock_list(list, mode)?;
        let result = f(self);
        let unlock = self.unlock_list(list, mode);
        match result {
            Ok(value) => unlock.map(|_| value),
            Err(e) => Err(e),
        }
    }

    /// Takes the whole-file lock over every directory slot.
    ///
    /// Refused in-process while any chain lock or record pin is held by
    /// this handle: the OS request would block on our own locks.
    pub(crate) fn lock_all(&mut self, mode: LockMode, wait: bool) -> Result<()> {
        if let Some((held_mode, count)) = &mut self.locks.allrecord {
            if *held_mode == mode {
                *count += 1;
                return Ok(());
            }
            return Err(Error::Lock(
                "whole-file lock already held in a different mode".into(),
            ));
        }
        if !self.locks.held.is_empty() {
            return Err(Error::Lock(
                "whole-file lock requested while chain locks are held".into(),
            ));
        }
        if !self.locks.pins.is_empty() {
            return Err(Error::Lock(
                "whole-file lock requested while a traversal pin is held".into(),
            ));
        }
        if !self.no_lock {
            self.backend.lock_range(
                mode.range_kind(),
                directory_slot(FREE_LIST),
                self.directory_width(),
                wait,
            )?;
        }
        self.locks.allrecord = Some((mode, 1));
        Ok(())
    }

    /// Releases one reference on the whole-file lock.
    pub(crate) fn unlock_all(&mut self, mode: LockMode) -> Result<()> {
        match &mut self.locks.allrecord {
            Some((held_mode, count)) if *held_mode == mode => {
                *count -= 1;
                if *count == 0 {
                    self.locks.allrecord = None;
                    if !self.no_lock {
                        self.backend.lock_range(
                            RangeLock::Unlock,
                            directory_slot(FREE_LIST),
                            self.directory_width(),
                            true,
                        )?;
                    }
                }
                Ok(())
            }
            Some(_) => Err(Error::Lock(
                "whole-file unlock does not match the held mode".into(),
            )),
            None => Err(Error::Lock("whole-file lock is not held".into())),
        }
    }

    /// Pins a record against physical reclamation by other processes.
    ///
    /// Skips the OS call while a whole-file lock is held, since no other
    /// process can reach the chains at all in that state. A read-only
    /// handle pins with a shared lock (its descriptor cannot carry
    /// exclusive ones); that still conflicts with a deleter's probe.
    pub(crate) fn pin_record(&mut self, off: Off) -> Result<()> {
        if let Some(pin) = self.locks.pins.iter_mut().find(|p| p.off == off.get()) {
            pin.count += 1;
            return Ok(());
        }
        let os = !self.no_lock && self.locks.allrecord.is_none();
        if os {
            let kind = if self.read_only {
                RangeLock::Read
            } else {
                RangeLock::Write
            };
            self.backend.lock_range(kind, off.get(), 1, true)?;
        }
        self.locks.pins.push(RecordPin {
            off: off.get(),
            count: 1,
            os,
        });
        Ok(())
    }

    /// Drops one reference on a record pin; never double-unlocks.
    pub(crate) fn unpin_record(&mut self, off: Off) -> Result<()> {
        let pos = self
            .locks
            .pins
            .iter()
            .position(|p| p.off == off.get())
            .ok_or_else(|| Error::Lock(format!("unpin of record {off} which is not pinned")))?;
        self.locks.pins[pos].count -= 1;
        if self.locks.pins[pos].count == 0 {
            let issue_os = self.locks.pins[pos].os;
            self.locks.pins.swap_remove(pos);
            if issue_os {
                self.backend
                    .lock_range(RangeLock::Unlock, off.get(), 1, true)?;
            }
        }
        Ok(())
    }

    /// True while this handle pins `off`.
    pub(crate) fn is_pinned(&self, off: Off) -> bool {
        self.locks.pins.iter().any(|p| p.off == off.get())
    }

    /// Non-blocking check that no *other* process pins `off`.
    ///
    /// Callers must rule out their own pins first: POSIX locks do not
    /// conflict within a process, and the probe's unlock would silently
    /// drop an own pin covering the same byte.
    pub(crate) fn probe_record(&self, off: Off) -> bool {
        debug_assert!(!self.is_pinned(off));
        if self.no_lock {
            return true;
        }
        match self
            .backend
            .lock_range(RangeLock::Write, off.get(), 1, false)
        {
            Ok(()) => {
                let _ = self
                    .backend
                    .lock_range(RangeLock::Unlock, off.get(), 1, false);
                true
            }
            Err(_) => false,
        }
    }

    /// True while any chain lock or the whole-file lock is held.
    pub(crate) fn any_lock_held(&self) -> bool {
        !self.locks.held.is_empty() || self.locks.allrecord.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn scratch() -> Database {
        Database::options().hash_size(31).open_in_memory().unwrap()
    }

    #[test]
    fn chain_locks_refcount() {
        let db = scratch();
        let mut inner = db.inner_for_tests();

        inner.lock_list(3, LockMode::Read).unwrap();
        inner.lock_list(3, LockMode::Read).unwrap();
        assert!(inner.any_lock_held());

        inner.unlock_list(3, LockMode::Read).unwrap();
        assert!(inner.any_lock_held());
        inner.unlock_list(3, LockMode::Read).unwrap();
        assert!(!inner.any_lock_held());
    }

    #[test]
    fn read_request_rides_a_held_write_lock() {
        let db = scratch();
        let mut inner = db.inner_for_tests();

        inner.lock_list(0, LockMode::Write).unwrap();
        inner.lock_list(0, LockMode::Read).unwrap();
        inner.unlock_list(0, LockMode::Read).unwrap();
        inner.unlock_list(0, LockMode::Write).unwrap();
        assert!(!inner.any_lock_held());
    }

    #[test]
    fn upgrade_from_read_to_write_is_refused() {
        let db = scratch();
        let mut inner = db.inner_for_tests();

        inner.lock_list(5, LockMode::Read).unwrap();
        let err = inner.lock_list(5, LockMode::Write).unwrap_err();
        assert!(matches!(err, Error::Lock(_)));
        inner.unlock_list(5, LockMode::Read).unwrap();
    }

    #[test]
    fn unlock_of_unheld_list_is_an_error() {
        let db = scratch();
        let mut inner = db.inner_for_tests();

        let err = inner.unlock_list(7, LockMode::Read).unwrap_err();
        assert!(matches!(err, Error::Lock(_)));
    }

    #[test]
    fn whole_file_lock_covers_chain_requests() {
        let db = scratch();
        let mut inner = db.inner_for_tests();

        inner.lock_all(LockMode::Write, true).unwrap();
        // Chain locks under the whole-file lock are no-op successes.
        inner.lock_list(2, LockMode::Write).unwrap();
        inner.unlock_list(2, LockMode::Write).unwrap();
        inner.unlock_all(LockMode::Write).unwrap();
        assert!(!inner.any_lock_held());
    }

    #[test]
    fn whole_file_lock_refused_while_chain_lock_held() {
        let db = scratch();
        let mut inner = db.inner_for_tests();

        inner.lock_list(1, LockMode::Write).unwrap();
        let err = inner.lock_all(LockMode::Write, true).unwrap_err();
        assert!(matches!(err, Error::Lock(_)));
        inner.unlock_list(1, LockMode::Write).unwrap();
    }

    #[test]
    fn shared_whole_file_lock_rejects_write_requests() {
        let db = scratch();
        let mut inner = db.inner_for_tests();

        inner.lock_all(LockMode::Read, true).unwrap();
        assert!(inner.lock_list(0, LockMode::Read).is_ok());
        let err = inner.lock_list(0, LockMode::Write).unwrap_err();
        assert!(matches!(err, Error::Lock(_)));
        inner.unlock_all(LockMode::Read).unwrap();
    }

    #[test]
    fn record_pins_release_exactly_once() {
        let db = scratch();
        let mut inner = db.inner_for_tests();
        let off = Off(4096);

        inner.pin_record(off).unwrap();
        inner.pin_record(off).unwrap();
        assert!(inner.is_pinned(off));

        inner.unpin_record(off).unwrap();
        assert!(inner.is_pinned(off));
        inner.unpin_record(off).unwrap();
        assert!(!inner.is_pinned(off));

        let err = inner.unpin_record(off).unwrap_err();
        assert!(matches!(err, Error::Lock(_)));
    }

    #[test]
    fn with_list_locked_releases_on_error() {
        let db = scratch();
        let mut inner = db.inner_for_tests();

        let result: Result<()> = inner.with_list_locked(4, LockMode::Write, |_| {
            Err(Error::Corrupt("synthetic".into()))
        });
        assert!(result.is_err());
        assert!(!inner.any_lock_held());
    }
}
