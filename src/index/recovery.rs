//! # Recovery Driver
//!
//! Every open walks the same ladder of repair steps, each conditioned on a
//! header flag read before the first lock:
//!
//! 1. REBUILD: the backend repopulates the index from the mailbox, then
//!    the hash is rebuilt.
//! 2. FSCK: the backend repairs minor inconsistencies (an exclusive writer
//!    died without a clean release).
//! 3. COMPRESS: holes are compacted out of the record array.
//! 4. REBUILD_HASH: the UID sidecar is regenerated from the records.
//! 5. CACHE_FIELDS: newly requested cache fields are materialized for
//!    existing records.
//! 6. COMPRESS_DATA: dead space is compacted out of the data file. This
//!    runs after CACHE_FIELDS, which may itself free space.
//!
//! A failing step fails the whole open. The ladder ends with a mailbox sync
//! and the `\Recent` bookkeeping, and the index is left unlocked.

use eyre::{ensure, Result};
use tracing::debug;

use super::{sidecar_path, IndexState, MailIndex, MailboxBackend};
use crate::storage::{
    index_flags, wall_clock_secs, DataFile, IndexHeader, LockType, INDEX_HEADER_SIZE,
    INDEX_RECORD_SIZE, REBUILD_UID_LIMIT,
};

const REC: u64 = INDEX_RECORD_SIZE as u64;
const HDR: u64 = INDEX_HEADER_SIZE as u64;

impl<B: MailboxBackend> MailIndex<B> {
    /// Runs the recovery ladder against the header `snapshot` read at open.
    /// Whatever happens, the index ends up unlocked.
    pub(crate) fn run_recovery(
        &mut self,
        snapshot: &IndexHeader,
        hash_fresh: bool,
        update_recent: bool,
    ) -> Result<()> {
        self.updating = true;
        let steps = self.recovery_steps(snapshot, hash_fresh, update_recent);
        self.updating = false;

        let unlocked = match self.state.as_mut() {
            Some(state) => state.set_lock(LockType::Unlock),
            None => Ok(()),
        };

        steps.and(unlocked)
    }

    fn recovery_steps(
        &mut self,
        snapshot: &IndexHeader,
        hash_fresh: bool,
        update_recent: bool,
    ) -> Result<()> {
        let (state, backend) = self.parts()?;
        let flags = snapshot.flags();

        if flags & index_flags::REBUILD != 0 {
            debug!(path = ?state.filepath(), "index marked corrupt, rebuilding");
            state.set_lock(LockType::Exclusive)?;
            backend.rebuild(state)?;
            state.clear_header_flag_bits(index_flags::REBUILD)?;
            state.rebuild_hash()?;
        } else if hash_fresh && snapshot.messages_count() > 0 {
            // the sidecar was recreated empty under a populated index
            state.set_lock(LockType::Exclusive)?;
            state.rebuild_hash()?;
        }

        if flags & index_flags::FSCK != 0 {
            debug!(path = ?state.filepath(), "unclean shutdown detected, fscking");
            state.set_lock(LockType::Exclusive)?;
            backend.fsck(state)?;
        }

        if flags & index_flags::COMPRESS != 0 {
            state.set_lock(LockType::Exclusive)?;
            state.compress()?;
        }

        if flags & index_flags::REBUILD_HASH != 0 {
            state.set_lock(LockType::Exclusive)?;
            state.rebuild_hash()?;
        }

        if flags & index_flags::CACHE_FIELDS != 0 {
            // records catch up with newly requested cache fields in place;
            // indexid and UID assignment must not change, this is routine
            // maintenance, not corruption
            debug!(path = ?state.filepath(), "materializing newly requested cache fields");
            state.set_lock(LockType::Exclusive)?;
            backend.update_cache(state)?;
            state.clear_header_flag_bits(index_flags::CACHE_FIELDS)?;
        }

        if flags & index_flags::COMPRESS_DATA != 0 {
            state.set_lock(LockType::Exclusive)?;
            state.compress_data()?;
        }

        backend.sync(state)?;
        open_init(state, update_recent, snapshot)
    }
}

/// `\Recent` bookkeeping and UID-exhaustion check at the end of open.
pub(crate) fn open_init(
    state: &mut IndexState,
    update_recent: bool,
    snapshot: &IndexHeader,
) -> Result<()> {
    if update_recent && snapshot.last_nonrecent_uid() != snapshot.next_uid() - 1 {
        // claim the recent range: everything above last_nonrecent_uid is
        // ours, and the header moves up so later sessions see it non-recent
        if state.lock_type() == LockType::Shared {
            state.set_lock(LockType::Unlock)?;
        }
        state.set_lock(LockType::Exclusive)?;

        let first_recent;
        {
            let hdr = state.mmap.header_mut()?;
            first_recent = hdr.last_nonrecent_uid() + 1;
            let next_uid = hdr.next_uid();
            hdr.set_last_nonrecent_uid(next_uid - 1);
        }
        state.first_recent_uid = first_recent;
    } else {
        state.first_recent_uid = snapshot.last_nonrecent_uid() + 1;
    }

    if snapshot.next_uid() >= REBUILD_UID_LIMIT {
        tracing::warn!(
            next_uid = snapshot.next_uid(),
            "uid space nearly exhausted, scheduling a rebuild"
        );
        state.set_flags |= index_flags::REBUILD;
    }

    Ok(())
}

impl IndexState {
    /// Resets the index for a backend rebuild: a fresh header under a *new*
    /// `indexid` (other handles must notice the generation change), an empty
    /// record array and reset sidecars. The REBUILD flag stays up until
    /// [`rebuild_complete`](Self::rebuild_complete).
    pub fn rebuild_reset(&mut self) -> Result<()> {
        ensure!(
            self.lock_type == LockType::Exclusive,
            "rebuild requires the exclusive lock"
        );

        let now = wall_clock_secs();
        let cache_fields = {
            let merged = self.mmap.header()?.cache_fields() | self.set_cache_fields;
            self.set_cache_fields = 0;
            merged
        };

        let mut hdr = IndexHeader::fresh(now);
        hdr.set_cache_fields(cache_fields);
        // the exclusive lock is held right now
        hdr.set_flag_bits(index_flags::FSCK);

        {
            use std::os::unix::fs::FileExt;
            use zerocopy::IntoBytes;
            self.file
                .write_all_at(hdr.as_bytes(), 0)
                .map_err(|err| {
                    eyre::eyre!("failed to rewrite index header {:?}: {}", self.filepath, err)
                })?;
        }
        self.file.set_len(HDR).map_err(|err| {
            eyre::eyre!("failed to truncate index {:?}: {}", self.filepath, err)
        })?;

        self.mmap.mark_dirty();
        self.mmap.refresh(&self.file, &self.filepath)?;

        self.indexid = now;
        self.set_flags = 0;
        self.last_lookup = None;

        self.data.reset(now)?;
        self.hash.reset(now)?;
        self.modifylog.reset(now)
    }

    /// Marks a backend rebuild finished by dropping the REBUILD flag.
    pub fn rebuild_complete(&mut self) -> Result<()> {
        self.clear_header_flag_bits(index_flags::REBUILD)
    }

    /// Recomputes every derived header field from the record array: counts,
    /// lowwater marks, the hole cursor and `next_uid`. The usual core of a
    /// backend's `fsck` hook.
    pub fn fsck_recount(&mut self) -> Result<()> {
        ensure!(
            self.lock_type == LockType::Exclusive,
            "fsck requires the exclusive lock"
        );
        self.mmap.refresh(&self.file, &self.filepath)?;

        let mut messages = 0u32;
        let mut seen = 0u32;
        let mut deleted = 0u32;
        let mut max_uid = 0u32;
        let mut unseen_lowwater = 0u32;
        let mut deleted_lowwater = 0u32;
        let mut hole_pos = 0u64;
        let mut hole_records = 0u32;
        let mut in_first_run = false;

        let mut off = HDR;
        while off + REC <= self.mmap.len() {
            let rec = self.mmap.record_at(off)?;
            let uid = rec.uid();
            if uid == 0 {
                if hole_pos == 0 {
                    hole_pos = off;
                    hole_records = 1;
                    in_first_run = true;
                } else if in_first_run {
                    hole_records += 1;
                }
            } else {
                in_first_run = false;
                messages += 1;
                max_uid = max_uid.max(uid);
                let flags = rec.msg_flags();
                if flags & crate::storage::mail_flags::SEEN != 0 {
                    seen += 1;
                } else if unseen_lowwater == 0 || uid < unseen_lowwater {
                    unseen_lowwater = uid;
                }
                if flags & crate::storage::mail_flags::DELETED != 0 {
                    deleted += 1;
                    if deleted_lowwater == 0 || uid < deleted_lowwater {
                        deleted_lowwater = uid;
                    }
                }
            }
            off += REC;
        }

        let hdr = self.mmap.header_mut()?;
        hdr.set_messages_count(messages);
        hdr.set_seen_messages_count(seen);
        hdr.set_deleted_messages_count(deleted);
        hdr.set_first_unseen_uid_lowwater(unseen_lowwater);
        hdr.set_first_deleted_uid_lowwater(deleted_lowwater);
        hdr.set_first_hole_position(hole_pos);
        hdr.set_first_hole_records(hole_records);
        if hdr.next_uid() <= max_uid {
            hdr.set_next_uid(max_uid + 1);
        }

        Ok(())
    }

    /// Regenerates the UID hash from the record array.
    pub fn rebuild_hash(&mut self) -> Result<()> {
        ensure!(
            self.lock_type == LockType::Exclusive,
            "hash rebuild requires the exclusive lock"
        );
        self.mmap.refresh(&self.file, &self.filepath)?;

        let mut entries = Vec::with_capacity(self.mmap.header()?.messages_count() as usize);
        let mut off = HDR;
        while off + REC <= self.mmap.len() {
            let uid = self.mmap.record_at(off)?.uid();
            if uid != 0 {
                entries.push((uid, off));
            }
            off += REC;
        }

        self.hash.rebuild(self.indexid, &entries)?;

        self.mmap
            .header_mut()?
            .clear_flag_bits(index_flags::REBUILD_HASH);
        self.set_flags &= !index_flags::REBUILD_HASH;
        Ok(())
    }

    /// Compacts holes out of the record array. Record positions change, so
    /// the hash is rebuilt afterwards and the lookup cursor dropped.
    pub fn compress(&mut self) -> Result<()> {
        ensure!(
            self.lock_type == LockType::Exclusive,
            "compress requires the exclusive lock"
        );
        self.mmap.refresh(&self.file, &self.filepath)?;

        let new_len;
        {
            let bytes = self.mmap.records_bytes_mut()?;
            let total = bytes.len();
            let mut read = 0usize;
            let mut write = 0usize;
            while read + INDEX_RECORD_SIZE <= total {
                let uid = u32::from_le_bytes([
                    bytes[read],
                    bytes[read + 1],
                    bytes[read + 2],
                    bytes[read + 3],
                ]);
                if uid != 0 {
                    if read != write {
                        bytes.copy_within(read..read + INDEX_RECORD_SIZE, write);
                    }
                    write += INDEX_RECORD_SIZE;
                }
                read += INDEX_RECORD_SIZE;
            }
            new_len = HDR + write as u64;
        }

        {
            let hdr = self.mmap.header_mut()?;
            hdr.set_first_hole_position(0);
            hdr.set_first_hole_records(0);
            hdr.clear_flag_bits(index_flags::COMPRESS);
        }
        self.set_flags &= !index_flags::COMPRESS;

        self.mmap.flush()?;
        self.file.set_len(new_len).map_err(|err| {
            eyre::eyre!("failed to truncate index {:?}: {}", self.filepath, err)
        })?;
        self.mmap.mark_dirty();
        self.mmap.refresh(&self.file, &self.filepath)?;
        self.last_lookup = None;

        self.rebuild_hash()
    }

    /// Rewrites the data file keeping only records the index still
    /// references, then repoints every record at its new payload.
    pub fn compress_data(&mut self) -> Result<()> {
        ensure!(
            self.lock_type == LockType::Exclusive,
            "data compression requires the exclusive lock"
        );
        self.mmap.refresh(&self.file, &self.filepath)?;

        let data_path = self.data.path().to_path_buf();
        let temp_path = sidecar_path(&data_path, ".tmp");
        let mut fresh = DataFile::create(&temp_path, self.indexid)?;

        // copy live payloads aside, remembering where each record's data
        // lands in the rewritten file
        let mut moves: Vec<(u64, u64, u32)> = Vec::new();
        let mut lost_records = false;
        let mut off = HDR;
        while off + REC <= self.mmap.len() {
            let rec = *self.mmap.record_at(off)?;
            if !rec.is_hole() {
                match self
                    .data
                    .raw_record(rec.data_position(), rec.data_size(), rec.uid())?
                {
                    Some(bytes) => {
                        let (pos, size) = fresh.append_raw(&bytes)?;
                        moves.push((off, pos, size));
                    }
                    None => {
                        lost_records = true;
                        moves.push((off, 0, 0));
                    }
                }
            }
            off += REC;
        }

        drop(fresh);
        std::fs::rename(&temp_path, &data_path).map_err(|err| {
            eyre::eyre!(
                "rename({:?}, {:?}) failed: {}",
                temp_path,
                data_path,
                err
            )
        })?;
        self.data = DataFile::open(&data_path, self.indexid)?;

        for (rec_off, pos, size) in moves {
            let rec = self.mmap.record_at_mut(rec_off)?;
            rec.set_data_position(pos);
            rec.set_data_size(size);
        }

        if lost_records {
            tracing::warn!(
                path = ?self.filepath,
                "data records went missing during compaction, scheduling a rebuild"
            );
            self.set_flags |= index_flags::REBUILD;
        }

        self.mmap
            .header_mut()?
            .clear_flag_bits(index_flags::COMPRESS_DATA);
        self.set_flags &= !index_flags::COMPRESS_DATA;
        Ok(())
    }
}
