//! # Traversal and Cursors
//!
//! Visiting every record of a live, shared database without stopping the
//! world takes three ingredients:
//!
//! - **Chain locks held briefly**: each bucket's lock is taken only while
//!   walking that chain, and always released before the user callback
//!   runs. Slow caller logic can never stall other processes' access to
//!   a bucket, and cannot deadlock against them.
//! - **Record pins**: between chain locks the traversal keeps a one-byte
//!   lock on its current record. Another process that deletes a pinned
//!   record tags it dead instead of freeing it, so the pinned offset
//!   stays readable until the traversal steps off and reclaims it.
//! - **Key identity**: the callback deletes through the key bytes, not
//!   the offset; offsets can be recycled for unrelated keys the moment
//!   locks are dropped. The first/next-key cursor re-validates that its
//!   pinned record still carries the expected key before advancing and
//!   falls back to a fresh find on mismatch.
//!
//! Empty buckets are skipped with an unlocked directory read before any
//! OS lock is paid for; the head is re-read under the lock once a
//! candidate bucket is chosen.
//!
//! Writable walks tidy as they go: dead records encountered on a chain
//! are unlinked and freed in passing, provided nobody has them pinned.

use crate::db::{CursorState, Database, DbInner};
use crate::error::{Error, Result};
use crate::hash::{bucket_of, key_hash};
use crate::locks::LockMode;
use crate::storage::{directory_slot, Off, RecordHeader, RecordTag, RECORD_HEADER_SIZE};
use crate::LogLevel;

/// What a traversal callback wants done after seeing a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseAction {
    /// Keep going.
    Continue,
    /// End the traversal after this record.
    Stop,
    /// Delete this record, then keep going. Only valid on a writable
    /// traversal.
    Delete,
}

impl Database {
    /// Visits every live record, with delete support via the callback's
    /// return value. Returns the number of records visited.
    pub fn traverse<F>(&self, mut f: F) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> TraverseAction,
    {
        self.with_inner(|inner| inner.traverse_op(&mut f, false))
    }

    /// Read-only traversal: takes shared chain locks throughout, so
    /// concurrent writers elsewhere in the table keep making progress.
    /// The callback must not return [`TraverseAction::Delete`].
    pub fn traverse_read<F>(&self, mut f: F) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> TraverseAction,
    {
        self.with_inner(|inner| inner.traverse_op(&mut f, true))
    }

    /// Positions the cursor on some first key and returns it.
    pub fn firstkey(&self) -> Result<Option<Vec<u8>>> {
        self.with_inner(|inner| inner.firstkey_op())
    }

    /// Returns the key after `oldkey` in traversal order, resuming from
    /// the cursor when it still points at `oldkey` and re-finding by key
    /// otherwise.
    pub fn nextkey(&self, oldkey: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_inner(|inner| inner.nextkey_op(oldkey))
    }
}

impl DbInner {
    /// Advances to the next live record after `state`, pinning it. The
    /// chain lock is released again before returning; on success the pin
    /// is the caller's to drop (directly or via the next advance).
    pub(crate) fn next_record(
        &mut self,
        state: &mut CursorState,
        mode: LockMode,
    ) -> Result<Option<(Off, RecordHeader)>> {
        while state.list < i64::from(self.hash_size) {
            // Unlocked pre-check saves the lock round-trip on the many
            // empty buckets of a sparse table.
            if state.off.is_null() && self.ofs_read(directory_slot(state.list))?.is_null() {
                state.list += 1;
                continue;
            }
            self.lock_list(state.list, mode)?;
            let step = self.advance_in_chain(state, mode == LockMode::Write);
            let unlock = self.unlock_list(state.list, mode);
            match step {
                Err(e) => return Err(e),
                Ok(found) => {
                    unlock?;
                    match found {
                        Some(hit) => return Ok(Some(hit)),
                        None => {
                            state.off = Off::NULL;
                            state.list += 1;
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// One locked step: resume past the current record (dropping its
    /// pin), then walk to the next live record of the bucket and pin it.
    fn advance_in_chain(
        &mut self,
        state: &mut CursorState,
        writable: bool,
    ) -> Result<Option<(Off, RecordHeader)>> {
        let slot = directory_slot(state.list);

        let mut cur = if state.off.is_null() {
            // Re-verified under the lock: the unlocked pre-check raced.
            self.ofs_read(slot)?
        } else {
            let resume = state.off;
            state.off = Off::NULL;
            let rec = match self.read_record(resume) {
                Ok(rec) => rec,
                Err(e) => {
                    let _ = self.unpin_record(resume);
                    return Err(e);
                }
            };
            if rec.next_off() == resume {
                let _ = self.unpin_record(resume);
                return Err(Error::Corrupt(format!("hash chain cycles at {resume}")));
            }
            self.unpin_record(resume)?;
            // A record the callback deleted was only tagged dead while we
            // sat on it; reclaim it now that we have stepped off.
            if writable
                && rec.status() == Some(RecordTag::Dead)
                && !self.is_pinned(resume)
                && self.probe_record(resume)
            {
                self.reclaim_dead(state.list, resume, &rec);
            }
            rec.next_off()
        };

        loop {
            if cur.is_null() {
                return Ok(None);
            }
            let rec = self.read_record(cur)?;
            if rec.next_off() == cur {
                return Err(Error::Corrupt(format!("hash chain cycles at {cur}")));
            }
            match rec.status() {
                Some(RecordTag::Live) => {
                    self.pin_record(cur)?;
                    state.off = cur;
                    return Ok(Some((cur, rec)));
                }
                Some(RecordTag::Dead) => {
                    let next = rec.next_off();
                    if writable && !self.is_pinned(cur) && self.probe_record(cur) {
                        self.reclaim_dead(state.list, cur, &rec);
                    }
                    cur = next;
                }
                Some(RecordTag::Free) => {
                    return Err(Error::Corrupt(format!(
                        "free record {cur} linked into a hash chain"
                    )));
                }
                None => {
                    return Err(Error::Corrupt(format!("bad status tag at {cur}")));
                }
            }
        }
    }

    /// Opportunistically unlinks and frees one dead record. Failure is
    /// logged, not propagated: tidying must never abort a traversal.
    fn reclaim_dead(&mut self, list: i64, off: Off, rec: &RecordHeader) {
        let result = self
            .unlink_record(list, off, rec.next_off())
            .and_then(|_| self.release(off, *rec));
        if let Err(e) = result {
            self.note(
                LogLevel::Warn,
                &format!("could not reclaim dead record {off}: {e}"),
            );
        }
    }

    pub(crate) fn traverse_op(
        &mut self,
        f: &mut dyn FnMut(&[u8], &[u8]) -> TraverseAction,
        read_only_walk: bool,
    ) -> Result<usize> {
        let mode = if read_only_walk || self.read_only {
            LockMode::Read
        } else {
            LockMode::Write
        };
        self.traversals += 1;
        let result = self.traverse_walk(f, mode);
        self.traversals -= 1;
        result
    }

    fn traverse_walk(
        &mut self,
        f: &mut dyn FnMut(&[u8], &[u8]) -> TraverseAction,
        mode: LockMode,
    ) -> Result<usize> {
        let mut state = CursorState {
            list: 0,
            off: Off::NULL,
        };
        let mut count = 0usize;

        let result = loop {
            let (off, rec) = match self.next_record(&mut state, mode) {
                Ok(Some(hit)) => hit,
                Ok(None) => break Ok(count),
                Err(e) => break Err(e),
            };
            count += 1;

            let key_off = off.get() + RECORD_HEADER_SIZE;
            let key = match self.read_bytes(key_off, rec.key_length()) {
                Ok(key) => key,
                Err(e) => break Err(e),
            };
            let data = match self.read_bytes(key_off + rec.key_length(), rec.data_length()) {
                Ok(data) => data,
                Err(e) => break Err(e),
            };

            match f(&key, &data) {
                TraverseAction::Continue => {}
                TraverseAction::Stop => break Ok(count),
                TraverseAction::Delete => {
                    if mode == LockMode::Read {
                        break Err(Error::ReadOnly);
                    }
                    if let Err(e) = self.delete_visited(&key) {
                        break Err(e);
                    }
                }
            }
        };

        // Any early exit leaves a pin on the current record.
        if !state.off.is_null() && self.is_pinned(state.off) {
            let _ = self.unpin_record(state.off);
        }
        result
    }

    /// Deletes the record the traversal is resting on, by key: the pin
    /// guarantees it only gets tagged dead, so the walk can still step
    /// through it afterwards.
    fn delete_visited(&mut self, key: &[u8]) -> Result<()> {
        let hash = key_hash(key);
        let list = i64::from(bucket_of(hash, self.hash_size));
        self.with_list_locked(list, LockMode::Write, |inner| {
            match inner.find(list, hash, key)? {
                Some((off, rec)) => inner.do_delete(list, off, &rec),
                // Another process removed it between callback and here.
                None => Ok(()),
            }
        })?;
        self.bump_sequence();
        Ok(())
    }

    fn cursor_mode(&self) -> LockMode {
        if self.read_only {
            LockMode::Read
        } else {
            LockMode::Write
        }
    }

    pub(crate) fn firstkey_op(&mut self) -> Result<Option<Vec<u8>>> {
        self.drop_cursor();
        let state = CursorState {
            list: 0,
            off: Off::NULL,
        };
        self.cursor_advance(state)
    }

    pub(crate) fn nextkey_op(&mut self, oldkey: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(state) = self.cursor {
            if !state.off.is_null() && self.cursor_still_at(state, oldkey)? {
                self.cursor = None;
                return self.cursor_advance(state);
            }
            self.drop_cursor();
        }
        // The offset was not a stable identity; the key bytes are.
        match self.seek(oldkey)? {
            Some(state) => self.cursor_advance(state),
            None => Ok(None),
        }
    }

    /// Whether the cursor's pinned record still carries `oldkey`. A
    /// record deleted and recycled for an unrelated key while our locks
    /// were briefly dropped must not be resumed from.
    fn cursor_still_at(&mut self, state: CursorState, oldkey: &[u8]) -> Result<bool> {
        let mode = self.cursor_mode();
        self.with_list_locked(state.list, mode, |inner| {
            let rec = match inner.read_record(state.off) {
                Ok(rec) => rec,
                Err(_) => return Ok(false),
            };
            if rec.status() != Some(RecordTag::Live)
                || rec.key_length() as usize != oldkey.len()
            {
                return Ok(false);
            }
            let stored = inner
                .backend
                .read(state.off.get() + RECORD_HEADER_SIZE, rec.key_length())?;
            Ok(stored == oldkey)
        })
    }

    fn cursor_advance(&mut self, mut state: CursorState) -> Result<Option<Vec<u8>>> {
        let advanced = self.next_record(&mut state, self.cursor_mode());
        let advanced = match advanced {
            Ok(hit) => hit,
            Err(e) => {
                if !state.off.is_null() && self.is_pinned(state.off) {
                    let _ = self.unpin_record(state.off);
                }
                self.cursor = None;
                return Err(e);
            }
        };
        match advanced {
            None => {
                self.cursor = None;
                Ok(None)
            }
            Some((off, rec)) => {
                match self.read_bytes(off.get() + RECORD_HEADER_SIZE, rec.key_length()) {
                    Ok(key) => {
                        self.cursor = Some(state);
                        Ok(Some(key))
                    }
                    Err(e) => {
                        let _ = self.unpin_record(off);
                        self.cursor = None;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Pins `key`'s record and builds a cursor resting on it.
    fn seek(&mut self, key: &[u8]) -> Result<Option<CursorState>> {
        let hash = key_hash(key);
        let list = i64::from(bucket_of(hash, self.hash_size));
        let mode = self.cursor_mode();
        self.with_list_locked(list, mode, |inner| match inner.find(list, hash, key)? {
            Some((off, _)) => {
                inner.pin_record(off)?;
                Ok(Some(CursorState { list, off }))
            }
            None => Ok(None),
        })
    }

    /// Releases the cursor and its pin, exactly once.
    pub(crate) fn drop_cursor(&mut self) {
        if let Some(state) = self.cursor.take() {
            if !state.off.is_null() && self.is_pinned(state.off) {
                let _ = self.unpin_record(state.off);
            }
        }
    }
}
