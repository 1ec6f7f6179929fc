//! # Mutation Engine
//!
//! Append, expunge and flag updates. All mutators require the exclusive
//! lock and write straight through the mapping; durability comes from the
//! release path of the lock protocol.
//!
//! ## Holes
//!
//! An expunge does not move records: the victim's UID is zeroed and the slot
//! becomes a hole that keeps sequence arithmetic stable for the rest of the
//! session. The header tracks the first contiguous hole run so lookups can
//! skip it in O(1); the moment a *second* run appears, COMPRESS is scheduled
//! and the next open compacts the file.
//!
//! ## Counter Accounting
//!
//! `messages_count`, `seen_messages_count` and `deleted_messages_count` are
//! maintained on every transition, together with the unseen/deleted UID
//! lowwater marks that let callers start predicate scans past the known-
//! clean prefix. Seen and deleted transitions are accounted independently:
//! a single update may change both.

use eyre::{ensure, Result};

use super::{IndexState, RecordPos};
use crate::storage::{index_flags, mail_flags, IndexHeader, IndexRecord, LockType};
use crate::storage::{INDEX_HEADER_SIZE, INDEX_RECORD_SIZE};

const REC: u64 = INDEX_RECORD_SIZE as u64;
const HDR: u64 = INDEX_HEADER_SIZE as u64;

fn mark_flag_changes(hdr: &mut IndexHeader, uid: u32, old_flags: u32, new_flags: u32) {
    use mail_flags::{DELETED, SEEN};

    if old_flags & SEEN == 0 && new_flags & SEEN != 0 {
        hdr.set_seen_messages_count(hdr.seen_messages_count() + 1);
    } else if old_flags & SEEN != 0 && new_flags & SEEN == 0 {
        if hdr.seen_messages_count() == hdr.messages_count() {
            // until now every message was seen
            hdr.set_first_unseen_uid_lowwater(uid);
        } else if uid < hdr.first_unseen_uid_lowwater() {
            hdr.set_first_unseen_uid_lowwater(uid);
        }
        hdr.set_seen_messages_count(hdr.seen_messages_count() - 1);
    }

    if old_flags & DELETED == 0 && new_flags & DELETED != 0 {
        hdr.set_deleted_messages_count(hdr.deleted_messages_count() + 1);
        if hdr.deleted_messages_count() == 1 {
            hdr.set_first_deleted_uid_lowwater(uid);
        } else if uid < hdr.first_deleted_uid_lowwater() {
            hdr.set_first_deleted_uid_lowwater(uid);
        }
    } else if old_flags & DELETED != 0 && new_flags & DELETED == 0 {
        hdr.set_deleted_messages_count(hdr.deleted_messages_count() - 1);
    }
}

impl IndexState {
    /// Appends a record for a new mail. The next UID is assigned, the field
    /// payloads go to the data file, and the returned position points into
    /// the refreshed mapping.
    pub fn append(&mut self, msg_flags: u32, fields: &[(u32, &[u8])]) -> Result<RecordPos> {
        ensure!(
            self.lock_type == LockType::Exclusive,
            "append requires the exclusive lock"
        );
        self.mmap.refresh(&self.file, &self.filepath)?;

        let uid = {
            let hdr = self.mmap.header_mut()?;
            let uid = hdr.next_uid();
            hdr.set_next_uid(uid + 1);
            uid
        };

        let (data_position, data_size) = self.data.append(uid, fields)?;
        let cached_fields = fields.iter().fold(0u32, |mask, (field, _)| mask | field);
        let rec = IndexRecord::new(uid, msg_flags, cached_fields, data_position, data_size);

        let pos = self.mmap.len();
        {
            use std::os::unix::fs::FileExt;
            use zerocopy::IntoBytes;
            self.file
                .write_all_at(rec.as_bytes(), pos)
                .map_err(|err| eyre::eyre!("failed to append to index {:?}: {}", self.filepath, err))?;
        }

        {
            let hdr = self.mmap.header_mut()?;
            hdr.set_messages_count(hdr.messages_count() + 1);
            mark_flag_changes(hdr, uid, 0, msg_flags);
            // a new unseen mail initializes the lowwater; appends never
            // lower it since UIDs only grow
            if msg_flags & mail_flags::SEEN == 0 && hdr.first_unseen_uid_lowwater() == 0 {
                hdr.set_first_unseen_uid_lowwater(uid);
            }
        }

        if !self.hash.update(uid, pos)? || self.hash.needs_rebuild() {
            self.set_flags |= index_flags::REBUILD_HASH;
        }

        self.mmap.mark_dirty();
        self.mmap.refresh(&self.file, &self.filepath)?;

        Ok(RecordPos(pos))
    }

    /// Expunges the record at `pos`. `seq` names its sequence number for the
    /// modify log; 0 means the message was never visible to this session and
    /// suppresses the log entry. `external` tags changes not initiated by
    /// this process's own client.
    pub fn expunge(&mut self, pos: RecordPos, seq: u32, external: bool) -> Result<()> {
        ensure!(
            self.lock_type == LockType::Exclusive,
            "expunge requires the exclusive lock"
        );
        self.mmap.refresh(&self.file, &self.filepath)?;

        let rec = *self.mmap.record_at(pos.0)?;
        ensure!(!rec.is_hole(), "record at {} is already expunged", pos.0);

        if seq != 0 {
            self.modifylog.add_expunge(seq, rec.uid(), external)?;
        }

        if !self.hash.update(rec.uid(), 0)? {
            self.set_flags |= index_flags::REBUILD_HASH;
        }

        // zeroing the UID is what deletes the mail from the index
        self.mmap.record_at_mut(pos.0)?.set_uid(0);

        if seq != 0 {
            match &mut self.last_lookup {
                Some((_, last_seq)) if *last_seq == seq => self.last_lookup = None,
                Some((_, last_seq)) if seq < *last_seq => *last_seq -= 1,
                _ => {}
            }
        }

        self.update_hole_cursor(pos.0)?;

        {
            let hdr = self.mmap.header_mut()?;
            hdr.set_messages_count(hdr.messages_count() - 1);
            mark_flag_changes(hdr, rec.uid(), rec.msg_flags(), 0);
        }

        if self.mmap.header()?.messages_count() == 0 {
            // nothing left: drop every record and the data file's payload
            self.truncate_empty()?;
        } else if self.data.add_deleted_space(rec.data_size())? {
            self.set_flags |= index_flags::COMPRESS_DATA;
        }

        Ok(())
    }

    fn update_hole_cursor(&mut self, expunged_at: u64) -> Result<()> {
        let (hole_pos, hole_records) = {
            let hdr = self.mmap.header()?;
            (hdr.first_hole_position(), hdr.first_hole_records())
        };

        if hole_pos == 0 {
            // first expunged message in the file
            let hdr = self.mmap.header_mut()?;
            hdr.set_first_hole_position(expunged_at);
            hdr.set_first_hole_records(1);
        } else if hole_pos - REC == expunged_at {
            // the record right before the run
            let hdr = self.mmap.header_mut()?;
            hdr.set_first_hole_position(expunged_at);
            hdr.set_first_hole_records(hole_records + 1);
        } else if hole_pos + hole_records as u64 * REC == expunged_at {
            // the record right after the run; absorb any holes behind it too
            let grown = self.hole_run_length(expunged_at)?;
            let hdr = self.mmap.header_mut()?;
            hdr.set_first_hole_records(hole_records + grown);
        } else {
            // a second hole run appears; sequence scans degrade from here,
            // so the next open compacts the file
            self.set_flags |= index_flags::COMPRESS;
            if hole_pos > expunged_at {
                let hdr = self.mmap.header_mut()?;
                hdr.set_first_hole_position(expunged_at);
                hdr.set_first_hole_records(1);
            }
        }

        Ok(())
    }

    /// Length of the contiguous hole run starting at `from`.
    fn hole_run_length(&self, from: u64) -> Result<u32> {
        let mut off = from;
        let mut run = 0u32;
        while off + REC <= self.mmap.len() && self.mmap.record_at(off)?.is_hole() {
            run += 1;
            off += REC;
        }
        Ok(run)
    }

    fn truncate_empty(&mut self) -> Result<()> {
        {
            let hdr = self.mmap.header_mut()?;
            hdr.set_first_hole_position(0);
            hdr.set_first_hole_records(0);
        }

        self.file
            .set_len(HDR)
            .map_err(|err| eyre::eyre!("failed to truncate index {:?}: {}", self.filepath, err))?;
        self.mmap.mark_dirty();
        self.mmap.refresh(&self.file, &self.filepath)?;
        self.last_lookup = None;

        self.data.reset(self.indexid)
    }

    /// Replaces the cached fields of an existing record. The payloads go to
    /// a fresh data-file record, the index record is repointed at it, and
    /// the old payload's space is accounted as deleted. UID, flags and the
    /// record's position are untouched, so open cursors and the hash stay
    /// valid.
    pub fn update_record_fields(
        &mut self,
        pos: RecordPos,
        fields: &[(u32, &[u8])],
    ) -> Result<()> {
        ensure!(
            self.lock_type == LockType::Exclusive,
            "field updates require the exclusive lock"
        );
        self.mmap.refresh(&self.file, &self.filepath)?;

        let rec = *self.mmap.record_at(pos.0)?;
        ensure!(!rec.is_hole(), "record at {} is expunged", pos.0);

        let (data_position, data_size) = self.data.append(rec.uid(), fields)?;
        let cached_fields = fields.iter().fold(0u32, |mask, (field, _)| mask | field);

        {
            let live = self.mmap.record_at_mut(pos.0)?;
            live.set_data_position(data_position);
            live.set_data_size(data_size);
            live.set_cached_fields(cached_fields);
        }

        if self.data.add_deleted_space(rec.data_size())? {
            self.set_flags |= index_flags::COMPRESS_DATA;
        }

        Ok(())
    }

    /// Rewrites a record's flags, accounting counter and lowwater changes
    /// and journaling the event. Writing the flags a record already has is
    /// a no-op and reaches neither the mapping nor the modify log.
    pub fn update_flags(
        &mut self,
        pos: RecordPos,
        seq: u32,
        msg_flags: u32,
        external: bool,
    ) -> Result<()> {
        ensure!(
            self.lock_type == LockType::Exclusive,
            "flag updates require the exclusive lock"
        );
        ensure!(seq != 0, "flag updates need the record's sequence number");
        self.mmap.refresh(&self.file, &self.filepath)?;

        let rec = *self.mmap.record_at(pos.0)?;
        if msg_flags == rec.msg_flags() {
            return Ok(());
        }

        {
            let hdr = self.mmap.header_mut()?;
            mark_flag_changes(hdr, rec.uid(), rec.msg_flags(), msg_flags);
        }
        self.mmap.record_at_mut(pos.0)?.set_msg_flags(msg_flags);

        self.modifylog.add_flags(seq, rec.uid(), external)
    }
}
