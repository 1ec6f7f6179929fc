//! # Lookup Engine
//!
//! Sequence and UID lookups over the mmapped record array.
//!
//! Sequence numbers are 1-based positions among *live* records in file
//! order. The header's first-hole cursor splits the file into a prefix where
//! `sequence == record index + 1` holds (O(1) addressing) and a suffix that
//! must be walked counting live records. A per-handle `(position, sequence)`
//! cursor makes the common ascending-iteration pattern resume where the last
//! lookup stopped instead of rescanning from the hole.
//!
//! UID lookups probe the hash sidecar first and only fall back to a linear
//! scan when the probed prefix did not cover the whole range.

use eyre::{bail, ensure, Result};

use super::{IndexState, RecordPos};
use crate::storage::{index_flags, IndexRecord, LockType, INDEX_HEADER_SIZE, INDEX_RECORD_SIZE};

const REC: u64 = INDEX_RECORD_SIZE as u64;
const HDR: u64 = INDEX_HEADER_SIZE as u64;

impl IndexState {
    /// Looks up the `seq`'th live record. `Ok(None)` means the sequence is
    /// past the end of the mailbox.
    pub fn lookup(&mut self, seq: u32) -> Result<Option<RecordPos>> {
        ensure!(seq > 0, "sequence numbers are 1-based");
        ensure!(
            self.lock_type != LockType::Unlock,
            "lookup requires a held lock"
        );

        self.mmap.refresh(&self.file, &self.filepath)?;

        let result = self.lookup_mapped(seq)?;
        self.last_lookup = result.map(|pos| (pos, seq));
        Ok(result)
    }

    fn lookup_mapped(&mut self, seq: u32) -> Result<Option<RecordPos>> {
        if let Some((pos, last_seq)) = self.last_lookup {
            if last_seq == seq && !self.mmap.record_at(pos.0)?.is_hole() {
                return Ok(Some(pos));
            }
        }

        let naive = HDR + (seq as u64 - 1) * REC;
        if naive + REC > self.mmap.len() {
            return Ok(None);
        }

        let hdr = self.mmap.header()?;
        let hole_pos = hdr.first_hole_position();
        let hole_records = hdr.first_hole_records();

        if hole_pos == 0 || hole_pos > naive {
            // before the first hole the sequence is the record index
            if self.mmap.record_at(naive)?.is_hole() {
                tracing::warn!(
                    path = ?self.filepath,
                    seq,
                    "hole cursor is stale, scheduling a rebuild"
                );
                self.set_flags |= index_flags::REBUILD;
                bail!(
                    "first_hole_position of {:?} was not updated properly",
                    self.filepath
                );
            }
            return Ok(Some(RecordPos(naive)));
        }

        // past the first hole run: walk, preferring to resume from the last
        // lookup when it lies behind the wanted sequence
        let (mut pos, mut cur_seq) = match self.last_lookup {
            Some((pos, last_seq)) if seq > last_seq => (pos.0, last_seq),
            _ => {
                ensure!(
                    hole_records > 0,
                    "index {:?} has a hole cursor with no records",
                    self.filepath
                );
                let hole_index = (hole_pos - HDR) / REC;
                (
                    hole_pos + hole_records as u64 * REC,
                    hole_index as u32 + 1,
                )
            }
        };

        while pos + REC <= self.mmap.len() {
            if !self.mmap.record_at(pos)?.is_hole() {
                if cur_seq == seq {
                    return Ok(Some(RecordPos(pos)));
                }
                cur_seq += 1;
            }
            pos += REC;
        }

        Ok(None)
    }

    /// Borrows the record at `pos` out of the mapping.
    pub fn record(&self, pos: RecordPos) -> Result<&IndexRecord> {
        ensure!(
            self.lock_type != LockType::Unlock,
            "record access requires a held lock"
        );
        self.mmap.record_at(pos.0)
    }

    /// The next live record after `pos`, or `None` at end of file.
    pub fn next(&self, pos: RecordPos) -> Result<Option<RecordPos>> {
        ensure!(
            self.lock_type != LockType::Unlock,
            "record access requires a held lock"
        );
        ensure!(self.mmap.is_clean(), "index mapping is stale");

        let mut off = pos.0 + REC;
        while off + REC <= self.mmap.len() {
            if !self.mmap.record_at(off)?.is_hole() {
                return Ok(Some(RecordPos(off)));
            }
            off += REC;
        }
        Ok(None)
    }

    /// First live record whose UID falls within `[first_uid, last_uid]`.
    ///
    /// The hash is probed for the whole range when it spans fewer than ten
    /// UIDs, otherwise for the first five; when those probes already covered
    /// the range, a miss is final and the scan is skipped.
    pub fn lookup_uid_range(&mut self, first_uid: u32, last_uid: u32) -> Result<Option<RecordPos>> {
        ensure!(
            self.lock_type != LockType::Unlock,
            "lookup requires a held lock"
        );
        ensure!(first_uid > 0 && last_uid > 0, "uids are 1-based");

        if first_uid > last_uid {
            return Ok(None);
        }

        self.mmap.refresh(&self.file, &self.filepath)?;

        let last_try_uid = if last_uid - first_uid < 10 {
            last_uid
        } else {
            first_uid + 4
        };

        for uid in first_uid..=last_try_uid {
            let pos = self.hash.lookup(uid)?;
            if pos == 0 {
                continue;
            }
            if let Ok(rec) = self.mmap.record_at(pos) {
                if rec.uid() == uid {
                    return Ok(Some(RecordPos(pos)));
                }
            }
            // the sidecar points at the wrong record
            self.set_flags |= index_flags::REBUILD_HASH;
        }

        if last_try_uid == last_uid {
            return Ok(None);
        }

        // rare path, no cleverness needed: scan until the range is passed
        let mut off = HDR;
        while off + REC <= self.mmap.len() {
            let rec = self.mmap.record_at(off)?;
            let uid = rec.uid();
            if uid != 0 {
                if uid > last_uid {
                    return Ok(None);
                }
                if uid >= first_uid {
                    return Ok(Some(RecordPos(off)));
                }
            }
            off += REC;
        }

        Ok(None)
    }

    /// Sequence number of the live record at `pos`.
    pub fn get_sequence(&self, pos: RecordPos) -> Result<u32> {
        ensure!(
            self.lock_type != LockType::Unlock,
            "record access requires a held lock"
        );

        if let Some((last_pos, last_seq)) = self.last_lookup {
            if last_pos == pos {
                return Ok(last_seq);
            }
        }

        let hdr = self.mmap.header()?;
        let hole_pos = hdr.first_hole_position();

        if hole_pos == 0 || pos.0 < hole_pos {
            return Ok(((pos.0 - HDR) / REC) as u32 + 1);
        }

        // the sequence right after the hole run is known; count live records
        // from there up to the wanted position
        let hole_records = hdr.first_hole_records();
        let mut seq = ((hole_pos - HDR) / REC) as u32 + 1;
        let mut off = hole_pos + hole_records as u64 * REC;
        while off < pos.0 {
            if !self.mmap.record_at(off)?.is_hole() {
                seq += 1;
            }
            off += REC;
        }

        Ok(seq)
    }

    /// Cached field payload for the record at `pos`.
    ///
    /// A field the record does not carry is remembered in the deferred
    /// cache-fields mask so future appends include it; if appends already
    /// cache it, the CACHE_FIELDS pass is scheduled instead so existing
    /// records catch up. A field the record *claims* but the data file
    /// cannot produce is corruption and schedules a rebuild.
    pub fn lookup_field(&mut self, pos: RecordPos, field_bit: u32) -> Result<Option<&[u8]>> {
        ensure!(
            self.lock_type != LockType::Unlock,
            "lookup requires a held lock"
        );

        self.mmap.refresh(&self.file, &self.filepath)?;
        let rec = *self.mmap.record_at(pos.0)?;

        if rec.cached_fields() & field_bit != field_bit {
            if self.mmap.header()?.cache_fields() & field_bit == 0 {
                // remember the interest; only new records get it, since many
                // clients ask for a field exactly once
                self.set_cache_fields |= field_bit;
            } else {
                // at least the second time this is wanted: materialize it
                // for old records on the next open
                self.set_flags |= index_flags::CACHE_FIELDS;
            }
            return Ok(None);
        }

        match self
            .data
            .find_field(rec.data_position(), rec.data_size(), rec.uid(), field_bit)?
        {
            Some((off, len)) => Ok(Some(self.data.slice(off, len)?)),
            None => {
                tracing::warn!(
                    path = ?self.filepath,
                    uid = rec.uid(),
                    field = field_bit,
                    "record advertises a field the data file cannot produce"
                );
                self.set_flags |= index_flags::REBUILD;
                Ok(None)
            }
        }
    }
}
