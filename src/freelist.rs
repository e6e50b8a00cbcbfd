//! # Free-Space Allocator
//!
//! Freed records are not returned to the filesystem; they are linked into
//! a distinguished chain (list -1, directory slot 0) and recycled by later
//! allocations. The allocator owns three jobs:
//!
//! - **Best-fit selection**: scan the free chain for the smallest record
//!   whose capacity satisfies the request, giving up on a better fit once
//!   a candidate wastes less than half its space. An exhaustive optimum is
//!   not worth the extra chain walking.
//! - **Splitting**: when the chosen record is more than `MIN_REC_SIZE`
//!   larger than needed, the surplus becomes a new free record rather than
//!   slack inside the allocation.
//! - **Coalescing**: on release, a free right neighbor is merged forward
//!   and a free left neighbor (found through the tailer just before the
//!   released offset) is merged backward, so no two adjacent free regions
//!   survive a release.
//!
//! Every operation here runs under the allocator lock (list -1), including
//! nested calls: `release` inside `allocate` relies on the handle's lock
//! refcounting rather than lock-free trickery. The chain may only be
//! touched under that lock even though its records also sit inside hash
//! buckets' address space, which keeps a release's coalescing step from
//! racing another process's allocation.
//!
//! Crash ordering: a release writes the record's tailer before any
//! linking, so an interrupted operation never leaves a record whose
//! neighbors cannot find its boundaries.

use crate::db::DbInner;
use crate::error::{Error, Result};
use crate::locks::{LockMode, FREE_LIST};
use crate::storage::{
    align_up, directory_slot, Off, RecordHeader, RecordTag, MIN_REC_SIZE, RECORD_OVERHEAD,
};
use crate::LogLevel;

impl DbInner {
    /// Claims a record with at least `length` bytes of payload capacity.
    ///
    /// The returned record is tagged live with zeroed lengths and a valid
    /// tailer; the caller fills in key, data, and chain linkage.
    pub(crate) fn allocate(&mut self, length: u32) -> Result<(Off, RecordHeader)> {
        let length = align_up(length);
        self.with_list_locked(FREE_LIST, LockMode::Write, |inner| loop {
            if let Some(claimed) = inner.claim_best_fit(length)? {
                return Ok(claimed);
            }
            inner.expand_heap(length)?;
        })
    }

    /// One best-fit pass over the free chain. `None` means no free record
    /// is large enough and the file must grow.
    fn claim_best_fit(&mut self, length: u32) -> Result<Option<(Off, RecordHeader)>> {
        let slot = directory_slot(FREE_LIST);
        let mut prev: Option<Off> = None;
        let mut cur = self.ofs_read(slot)?;
        let mut best: Option<(Off, Option<Off>, RecordHeader)> = None;

        while !cur.is_null() {
            let rec = self.read_record(cur)?;
            if rec.status() != Some(RecordTag::Free) {
                return Err(Error::Corrupt(format!(
                    "record {cur} on the free chain is not tagged free"
                )));
            }
            if rec.next_off() == cur {
                return Err(Error::Corrupt(format!("free chain cycles at {cur}")));
            }
            if rec.total_length() >= length {
                let improves = best
                    .as_ref()
                    .map_or(true, |(_, _, b)| rec.total_length() < b.total_length());
                if improves {
                    best = Some((cur, prev, rec));
                }
                // Good enough: less than half the candidate would be wasted.
                if rec.total_length() < length.saturating_mul(2) {
                    break;
                }
            }
            prev = Some(cur);
            cur = rec.next_off();
        }

        let Some((off, chain_prev, mut rec)) = best else {
            return Ok(None);
        };

        // Unlink by rewriting the predecessor's next pointer.
        match chain_prev {
            None => self.ofs_write(slot, rec.next_off())?,
            Some(p) => {
                let mut prev_rec = self.read_record(p)?;
                prev_rec.set_next_off(rec.next_off());
                self.write_record(p, &prev_rec)?;
            }
        }

        let surplus = rec.total_length() - length;
        let split = surplus > MIN_REC_SIZE;
        if split {
            rec.set_total_length(length);
        }

        // Claim the head before carving the tail: the tail's release reads
        // the head's tailer during its left-neighbor check.
        let claimed = RecordHeader::new(Off::NULL, rec.total_length(), 0, 0, 0, RecordTag::Live);
        self.write_record(off, &claimed)?;
        self.write_tailer(off, &claimed)?;

        if split {
            let tail_off = Off(off.get() + RECORD_OVERHEAD + length);
            let tail = RecordHeader::free(Off::NULL, surplus - RECORD_OVERHEAD);
            self.write_record(tail_off, &tail)?;
            self.write_tailer(tail_off, &tail)?;
            self.release(tail_off, tail)?;
        }

        Ok(Some((off, claimed)))
    }

    /// Grows the file by one record's worth of space and free-lists it.
    fn expand_heap(&mut self, length: u32) -> Result<()> {
        let old_len = self.backend.len();
        let growth = length + RECORD_OVERHEAD;
        let new_len = old_len
            .checked_add(growth)
            .ok_or_else(|| Error::Oom(format!("cannot grow past {old_len} bytes")))?;
        self.backend.expand(new_len)?;
        self.note(
            LogLevel::Debug,
            &format!("grew database from {old_len} to {new_len} bytes"),
        );

        let rec = RecordHeader::free(Off::NULL, growth - RECORD_OVERHEAD);
        let off = Off(old_len);
        self.write_record(off, &rec)?;
        self.write_tailer(off, &rec)?;
        // Released rather than linked directly so new space merges with a
        // free record that happens to end at the old file size.
        self.release(off, rec)
    }

    /// Returns a record to the free chain, coalescing with free neighbors.
    pub(crate) fn release(&mut self, off: Off, rec: RecordHeader) -> Result<()> {
        self.with_list_locked(FREE_LIST, LockMode::Write, |inner| {
            let mut off = off;
            let mut total = rec.total_length();

            // Terminate the region first so a crash between here and the
            // final link never leaves an unbounded record behind.
            inner.write_tailer(off, &rec)?;

            // Merge a free right neighbor into this record. A neighbor
            // that does not parse is left for chain walks to report.
            let right = rec.right_neighbor(off);
            if right.get() < inner.backend.len() {
                if let Ok(right_rec) = inner.read_record(right) {
                    if right_rec.status() == Some(RecordTag::Free) {
                        inner.unlink_free(right)?;
                        total += right_rec.region_size();
                    }
                }
            }

            // Merge into a free left neighbor, found via its tailer.
            if let Some((left_off, left_rec)) = inner.left_free_neighbor(off)? {
                inner.unlink_free(left_off)?;
                total += left_rec.region_size();
                off = left_off;
            }

            let head = inner.ofs_read(directory_slot(FREE_LIST))?;
            let merged = RecordHeader::free(head, total);
            inner.write_record(off, &merged)?;
            inner.write_tailer(off, &merged)?;
            inner.ofs_write(directory_slot(FREE_LIST), off)
        })
    }

    /// Locates a free record ending exactly at `off` via the tailer just
    /// before it. An uninitialized or implausible tailer value means "no
    /// left neighbor", not an error: slack and padding read as garbage.
    fn left_free_neighbor(&self, off: Off) -> Result<Option<(Off, RecordHeader)>> {
        let top = self.heap_top();
        if off.get() < top + RECORD_OVERHEAD + 4 {
            return Ok(None);
        }
        let left_total = self.word_read(off.get() - 4)?;
        if left_total == 0 || left_total % 4 != 0 {
            return Ok(None);
        }
        let Some(left_start) = off
            .get()
            .checked_sub(left_total + RECORD_OVERHEAD)
            .filter(|&s| s >= top)
        else {
            return Ok(None);
        };
        let left_off = Off(left_start);
        let Ok(left_rec) = self.read_record(left_off) else {
            return Ok(None);
        };
        // The candidate must be free and its geometry must agree with the
        // tailer we followed, or the tailer was payload coincidence.
        if left_rec.status() == Some(RecordTag::Free)
            && left_rec.total_length() == left_total
            && left_rec.right_neighbor(left_off) == off
        {
            Ok(Some((left_off, left_rec)))
        } else {
            Ok(None)
        }
    }

    /// Removes `target` from the free chain by rewriting its predecessor.
    fn unlink_free(&mut self, target: Off) -> Result<()> {
        let slot = directory_slot(FREE_LIST);
        let mut prev: Option<Off> = None;
        let mut cur = self.ofs_read(slot)?;

        while !cur.is_null() {
            let rec = self.read_record(cur)?;
            if rec.next_off() == cur {
                return Err(Error::Corrupt(format!("free chain cycles at {cur}")));
            }
            if cur == target {
                match prev {
                    None => self.ofs_write(slot, rec.next_off())?,
                    Some(p) => {
                        let mut prev_rec = self.read_record(p)?;
                        prev_rec.set_next_off(rec.next_off());
                        self.write_record(p, &prev_rec)?;
                    }
                }
                return Ok(());
            }
            prev = Some(cur);
            cur = rec.next_off();
        }

        Err(Error::Corrupt(format!(
            "record {target} tagged free but absent from the free chain"
        )))
    }
}
