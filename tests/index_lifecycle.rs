//! # Index Lifecycle Tests
//!
//! End-to-end coverage of the index engine through its public API:
//!
//! 1. Fresh creation produces an empty, clean index
//! 2. Appends maintain counters, lowwater marks and UID assignment
//! 3. Expunges punch holes that sequence lookups skip
//! 4. A second hole run schedules compaction
//! 5. A crashed writer leaves FSCK set and the next open repairs
//! 6. A concurrent rebuild (indexid change) poisons open handles
//!
//! The `TestBackend` stands in for a mailbox format: its `mails` vector is
//! the source of truth a rebuild regenerates the index from.

use eyre::Result;
use mailidx::index::IndexState;
use mailidx::{field, index_flags, mail_flags, LockType, MailIndex, MailboxBackend};
use mailidx::{LogEntryKind, INDEX_HEADER_SIZE, INDEX_RECORD_SIZE};

const HDR: u64 = INDEX_HEADER_SIZE as u64;
const REC: u64 = INDEX_RECORD_SIZE as u64;

#[derive(Default)]
struct TestBackend {
    mails: Vec<(u32, Vec<u8>)>,
    rebuild_calls: usize,
    sync_calls: usize,
    fsck_calls: usize,
    update_cache_calls: usize,
}

impl TestBackend {
    fn with_mails(mails: Vec<(u32, &str)>) -> Self {
        Self {
            mails: mails
                .into_iter()
                .map(|(flags, loc)| (flags, loc.as_bytes().to_vec()))
                .collect(),
            ..Self::default()
        }
    }
}

impl MailboxBackend for TestBackend {
    fn rebuild(&mut self, index: &mut IndexState) -> Result<()> {
        self.rebuild_calls += 1;
        index.rebuild_reset()?;
        let mails = self.mails.clone();
        for (flags, location) in &mails {
            index.append(*flags, &[(field::LOCATION, location.as_slice())])?;
        }
        index.rebuild_complete()
    }

    fn sync(&mut self, _index: &mut IndexState) -> Result<()> {
        self.sync_calls += 1;
        Ok(())
    }

    fn fsck(&mut self, index: &mut IndexState) -> Result<()> {
        self.fsck_calls += 1;
        index.fsck_recount()
    }

    fn update_cache(&mut self, index: &mut IndexState) -> Result<()> {
        self.update_cache_calls += 1;
        let wanted = index.cache_fields()?;
        let mut seq = 1u32;
        while let Some(pos) = index.lookup(seq)? {
            let location = index
                .lookup_field(pos, field::LOCATION)?
                .map(|bytes| bytes.to_vec())
                .unwrap_or_default();
            let mut fields: Vec<(u32, &[u8])> = vec![(field::LOCATION, location.as_slice())];
            if wanted & field::ENVELOPE != 0 {
                fields.push((field::ENVELOPE, &b"From: caching@example"[..]));
            }
            index.update_record_fields(pos, &fields)?;
            seq += 1;
        }
        Ok(())
    }
}

fn open_index(dir: &std::path::Path) -> MailIndex<TestBackend> {
    let mut index = MailIndex::new(dir, TestBackend::default());
    index.open_or_create(true).unwrap();
    index
}

/// Appends three mails with flags {none, SEEN, DELETED} under one exclusive
/// lock, leaving the index unlocked.
fn append_three(index: &mut MailIndex<TestBackend>) {
    index.set_lock(LockType::Exclusive).unwrap();
    index.append(0, &[(field::LOCATION, b"mbox/1")]).unwrap();
    index
        .append(mail_flags::SEEN, &[(field::LOCATION, b"mbox/2")])
        .unwrap();
    index
        .append(mail_flags::DELETED, &[(field::LOCATION, b"mbox/3")])
        .unwrap();
    index.set_lock(LockType::Unlock).unwrap();
}

mod creation_tests {
    use super::*;

    #[test]
    fn fresh_create_produces_clean_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());

        index.set_lock(LockType::Shared).unwrap();
        let hdr = index.header().unwrap();
        assert_eq!(hdr.flags(), 0, "initial rebuild SHOULD clear all flags");
        assert_eq!(hdr.next_uid(), 1);
        assert_eq!(hdr.messages_count(), 0);
        assert_ne!(hdr.indexid(), 0);
        assert_eq!(hdr.uid_validity(), hdr.indexid());
        index.set_lock(LockType::Unlock).unwrap();

        assert_eq!(index.backend().rebuild_calls, 1);
        assert!(dir.path().join(".mailidx").exists());
        assert!(dir.path().join(".mailidx.data").exists());
        assert!(dir.path().join(".mailidx.hash").exists());
        assert!(dir.path().join(".mailidx.log").exists());
    }

    #[test]
    fn create_then_plain_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut index = open_index(dir.path());
            append_three(&mut index);
        }

        let mut index = MailIndex::new(dir.path(), TestBackend::default());
        index.open(true).unwrap();
        index.set_lock(LockType::Shared).unwrap();
        assert_eq!(index.header().unwrap().messages_count(), 3);
        index.set_lock(LockType::Unlock).unwrap();
        // a clean open never rebuilds
        assert_eq!(index.backend().rebuild_calls, 0);
    }

    #[test]
    fn open_without_index_fails_but_open_or_create_succeeds() {
        let dir = tempfile::tempdir().unwrap();

        let mut index = MailIndex::new(dir.path(), TestBackend::default());
        assert!(index.open(true).is_err());

        let mut index = MailIndex::new(dir.path(), TestBackend::default());
        index.open_or_create(true).unwrap();
    }

    #[test]
    fn incompatible_primary_falls_back_to_host_named_index() {
        let dir = tempfile::tempdir().unwrap();
        // something else owns the primary name
        std::fs::write(dir.path().join(".mailidx"), b"not an index at all").unwrap();

        let mut index = MailIndex::new(dir.path(), TestBackend::default());
        index.open_or_create(true).unwrap();
        assert_ne!(
            index.state().unwrap().filepath(),
            dir.path().join(".mailidx").as_path()
        );

        // the fallback is discovered by the directory scan
        let mut index2 = MailIndex::new(dir.path(), TestBackend::default());
        index2.open(true).unwrap();
        assert_eq!(
            index2.state().unwrap().filepath(),
            index.state().unwrap().filepath()
        );
    }

    #[test]
    fn rebuild_repopulates_from_the_mailbox() {
        let dir = tempfile::tempdir().unwrap();
        let backend = TestBackend::with_mails(vec![
            (0, "cur/100"),
            (mail_flags::SEEN, "cur/101"),
        ]);
        let mut index = MailIndex::new(dir.path(), backend);
        index.open_or_create(true).unwrap();

        index.set_lock(LockType::Shared).unwrap();
        let hdr = index.header().unwrap();
        assert_eq!(hdr.messages_count(), 2);
        assert_eq!(hdr.seen_messages_count(), 1);
        assert_eq!(hdr.next_uid(), 3);
        index.set_lock(LockType::Unlock).unwrap();
    }
}

mod append_tests {
    use super::*;

    #[test]
    fn three_appends_maintain_counters_and_lowwaters() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());
        append_three(&mut index);

        index.set_lock(LockType::Shared).unwrap();
        let hdr = index.header().unwrap();
        assert_eq!(hdr.messages_count(), 3);
        assert_eq!(hdr.seen_messages_count(), 1);
        assert_eq!(hdr.deleted_messages_count(), 1);
        assert_eq!(hdr.next_uid(), 4);
        assert_eq!(hdr.first_unseen_uid_lowwater(), 1);
        assert_eq!(hdr.first_deleted_uid_lowwater(), 3);
        assert_eq!(hdr.flags(), 0);
        index.set_lock(LockType::Unlock).unwrap();
    }

    #[test]
    fn uids_are_strictly_increasing_and_below_next_uid() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());
        append_three(&mut index);

        index.set_lock(LockType::Shared).unwrap();
        let next_uid = index.header().unwrap().next_uid();
        let mut pos = index.lookup(1).unwrap().unwrap();
        let mut prev_uid = index.record(pos).unwrap().uid();
        assert!(prev_uid < next_uid);
        while let Some(next) = index.next(pos).unwrap() {
            let uid = index.record(next).unwrap().uid();
            assert!(uid > prev_uid && uid < next_uid);
            prev_uid = uid;
            pos = next;
        }
        index.set_lock(LockType::Unlock).unwrap();
    }

    #[test]
    fn appended_record_is_found_by_uid_and_field() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());

        index.set_lock(LockType::Exclusive).unwrap();
        let pos = index
            .append(mail_flags::SEEN, &[(field::LOCATION, b"cur/1017")])
            .unwrap();
        let uid = index.record(pos).unwrap().uid();

        let found = index.lookup_uid_range(uid, uid).unwrap().unwrap();
        assert_eq!(index.record(found).unwrap().uid(), uid);
        assert_eq!(
            index.lookup_field(found, field::LOCATION).unwrap(),
            Some(&b"cur/1017"[..])
        );
        index.set_lock(LockType::Unlock).unwrap();
    }

    #[test]
    fn uid_range_scan_falls_back_past_the_probed_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());

        index.set_lock(LockType::Exclusive).unwrap();
        for i in 0..30u32 {
            index
                .append(0, &[(field::LOCATION, format!("cur/{i}").as_bytes())])
                .unwrap();
        }
        // expunge uids 1..=20 so the hash probes on 21..25 miss nothing but
        // the wide range still exercises the scan path
        for _ in 0..20 {
            let pos = index.lookup(1).unwrap().unwrap();
            index.expunge(pos, 1, false).unwrap();
        }

        let found = index.lookup_uid_range(1, 30).unwrap().unwrap();
        assert_eq!(index.record(found).unwrap().uid(), 21);
        assert!(index.lookup_uid_range(1, 20).unwrap().is_none());
        index.set_lock(LockType::Unlock).unwrap();
    }
}

mod expunge_tests {
    use super::*;

    #[test]
    fn middle_expunge_punches_a_hole_and_requeues_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());
        append_three(&mut index);

        index.set_lock(LockType::Exclusive).unwrap();
        let pos = index.lookup(2).unwrap().unwrap();
        index.expunge(pos, 2, false).unwrap();

        let hdr = index.header().unwrap();
        assert_eq!(hdr.first_hole_position(), HDR + REC);
        assert_eq!(hdr.first_hole_records(), 1);
        assert_eq!(hdr.messages_count(), 2);
        assert_eq!(hdr.seen_messages_count(), 0);

        let pos = index.lookup(2).unwrap().unwrap();
        assert_eq!(index.record(pos).unwrap().uid(), 3);
        assert_eq!(index.get_sequence(pos).unwrap(), 2);
        index.set_lock(LockType::Unlock).unwrap();

        let mut entries = Vec::new();
        {
            let state = index.state_mut().unwrap();
            entries.extend(state.modifylog_records().unwrap());
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LogEntryKind::Expunge);
        assert_eq!(entries[0].seq, 2);
        assert_eq!(entries[0].uid, 2);
    }

    #[test]
    fn adjacent_expunges_extend_the_hole_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());

        index.set_lock(LockType::Exclusive).unwrap();
        for i in 0..4u32 {
            index
                .append(0, &[(field::LOCATION, format!("cur/{i}").as_bytes())])
                .unwrap();
        }

        // punch uid 2, then uid 3 (upward extension), then uid 1 (downward)
        let pos = index.lookup(2).unwrap().unwrap();
        index.expunge(pos, 2, false).unwrap();
        let pos = index.lookup(2).unwrap().unwrap();
        assert_eq!(index.record(pos).unwrap().uid(), 3);
        index.expunge(pos, 2, false).unwrap();
        let pos = index.lookup(1).unwrap().unwrap();
        index.expunge(pos, 1, false).unwrap();

        let hdr = index.header().unwrap();
        assert_eq!(hdr.first_hole_position(), HDR);
        assert_eq!(hdr.first_hole_records(), 3);
        assert!(!hdr.has_flags(index_flags::COMPRESS));

        let pos = index.lookup(1).unwrap().unwrap();
        assert_eq!(index.record(pos).unwrap().uid(), 4);
        assert_eq!(index.get_sequence(pos).unwrap(), 1);
        index.set_lock(LockType::Unlock).unwrap();
    }

    #[test]
    fn second_hole_run_schedules_compress() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());
        append_three(&mut index);

        index.set_lock(LockType::Exclusive).unwrap();
        let pos = index.lookup(2).unwrap().unwrap();
        index.expunge(pos, 2, false).unwrap();

        // uid 4 lands at the tail; expunging it is not adjacent to the hole
        // at uid 2 because live uid 3 sits in between
        index.append(0, &[(field::LOCATION, b"mbox/4")]).unwrap();
        let pos = index.lookup(3).unwrap().unwrap();
        assert_eq!(index.record(pos).unwrap().uid(), 4);
        index.expunge(pos, 3, false).unwrap();
        index.set_lock(LockType::Unlock).unwrap();

        index.set_lock(LockType::Shared).unwrap();
        assert!(index.header().unwrap().has_flags(index_flags::COMPRESS));
        index.set_lock(LockType::Unlock).unwrap();
    }

    #[test]
    fn reopen_after_compress_flag_compacts_the_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut index = open_index(dir.path());
            append_three(&mut index);
            index.set_lock(LockType::Exclusive).unwrap();
            let pos = index.lookup(2).unwrap().unwrap();
            index.expunge(pos, 2, false).unwrap();
            index.append(0, &[(field::LOCATION, b"mbox/4")]).unwrap();
            let pos = index.lookup(3).unwrap().unwrap();
            index.expunge(pos, 3, false).unwrap();
            index.set_lock(LockType::Unlock).unwrap();
        }

        let mut index = MailIndex::new(dir.path(), TestBackend::default());
        index.open(true).unwrap();

        index.set_lock(LockType::Shared).unwrap();
        let hdr = index.header().unwrap();
        assert!(!hdr.has_flags(index_flags::COMPRESS));
        assert_eq!(hdr.first_hole_position(), 0);
        assert_eq!(hdr.messages_count(), 2);

        let pos = index.lookup(2).unwrap().unwrap();
        assert_eq!(index.record(pos).unwrap().uid(), 3);
        assert_eq!(index.get_sequence(pos).unwrap(), 2);
        index.set_lock(LockType::Unlock).unwrap();

        let len = std::fs::metadata(dir.path().join(".mailidx")).unwrap().len();
        assert_eq!(len, HDR + 2 * REC);
    }

    #[test]
    fn expunging_the_last_message_truncates_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());

        index.set_lock(LockType::Exclusive).unwrap();
        let pos = index.append(0, &[(field::LOCATION, b"mbox/1")]).unwrap();
        let uid = index.record(pos).unwrap().uid();
        index.expunge(pos, 1, false).unwrap();

        assert!(index.lookup_uid_range(uid, uid).unwrap().is_none());
        let hdr = index.header().unwrap();
        assert_eq!(hdr.messages_count(), 0);
        assert_eq!(hdr.first_hole_position(), 0);
        assert_eq!(hdr.first_hole_records(), 0);
        index.set_lock(LockType::Unlock).unwrap();

        // record array and data payload are both gone
        let len = std::fs::metadata(dir.path().join(".mailidx")).unwrap().len();
        assert_eq!(len, HDR);
        let data_len = std::fs::metadata(dir.path().join(".mailidx.data"))
            .unwrap()
            .len();
        assert_eq!(data_len, 32);
    }

    #[test]
    fn get_sequence_inverts_lookup_across_holes() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());

        index.set_lock(LockType::Exclusive).unwrap();
        for i in 0..8u32 {
            index
                .append(0, &[(field::LOCATION, format!("cur/{i}").as_bytes())])
                .unwrap();
        }
        let pos = index.lookup(3).unwrap().unwrap();
        index.expunge(pos, 3, false).unwrap();
        let pos = index.lookup(3).unwrap().unwrap();
        index.expunge(pos, 3, false).unwrap();

        for seq in 1..=6u32 {
            let pos = index.lookup(seq).unwrap().unwrap();
            assert_eq!(index.get_sequence(pos).unwrap(), seq, "seq {seq}");
        }
        assert!(index.lookup(7).unwrap().is_none());
        index.set_lock(LockType::Unlock).unwrap();
    }
}

mod flag_update_tests {
    use super::*;

    #[test]
    fn flag_transitions_move_counters_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());
        append_three(&mut index);

        index.set_lock(LockType::Exclusive).unwrap();
        let pos = index.lookup(1).unwrap().unwrap();
        index
            .update_flags(pos, 1, mail_flags::SEEN | mail_flags::DELETED, false)
            .unwrap();

        let hdr = index.header().unwrap();
        assert_eq!(hdr.seen_messages_count(), 2);
        assert_eq!(hdr.deleted_messages_count(), 2);
        assert_eq!(hdr.first_deleted_uid_lowwater(), 1);

        index.update_flags(pos, 1, 0, false).unwrap();
        let hdr = index.header().unwrap();
        assert_eq!(hdr.seen_messages_count(), 1);
        assert_eq!(hdr.deleted_messages_count(), 1);
        index.set_lock(LockType::Unlock).unwrap();
    }

    #[test]
    fn idempotent_flag_update_skips_the_modify_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());
        append_three(&mut index);

        index.set_lock(LockType::Exclusive).unwrap();
        let pos = index.lookup(1).unwrap().unwrap();
        index.update_flags(pos, 1, mail_flags::FLAGGED, true).unwrap();
        index.update_flags(pos, 1, mail_flags::FLAGGED, true).unwrap();
        index.set_lock(LockType::Unlock).unwrap();

        let entries = index.state_mut().unwrap().modifylog_records().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LogEntryKind::FlagChange);
        assert_eq!(entries[0].uid, 1);
        assert!(entries[0].external);
    }
}

mod deferred_bits_tests {
    use super::*;

    #[test]
    fn field_interest_under_shared_lock_lands_in_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());
        append_three(&mut index);

        index.set_lock(LockType::Shared).unwrap();
        let pos = index.lookup(1).unwrap().unwrap();
        // not cached on the record nor promised by the header yet
        assert!(index.lookup_field(pos, field::ENVELOPE).unwrap().is_none());
        index.set_lock(LockType::Unlock).unwrap();

        index.set_lock(LockType::Shared).unwrap();
        let cache = index.header().unwrap().cache_fields();
        assert_ne!(cache & field::ENVELOPE, 0, "deferred bit SHOULD be OR'd in");
        assert_ne!(cache & field::LOCATION, 0, "existing bits survive");
        index.set_lock(LockType::Unlock).unwrap();
    }

    #[test]
    fn second_read_of_promised_field_schedules_cache_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());
        append_three(&mut index);

        // first read: record interest
        index.set_lock(LockType::Shared).unwrap();
        let pos = index.lookup(1).unwrap().unwrap();
        index.lookup_field(pos, field::ENVELOPE).unwrap();
        index.set_lock(LockType::Unlock).unwrap();

        // second read: the header promises it, the record lacks it
        index.set_lock(LockType::Shared).unwrap();
        let pos = index.lookup(1).unwrap().unwrap();
        assert!(index.lookup_field(pos, field::ENVELOPE).unwrap().is_none());
        index.set_lock(LockType::Unlock).unwrap();

        index.set_lock(LockType::Shared).unwrap();
        assert!(index
            .header()
            .unwrap()
            .has_flags(index_flags::CACHE_FIELDS));
        index.set_lock(LockType::Unlock).unwrap();
    }
}

mod recovery_tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn crashed_writer_leaves_fsck_and_reopen_repairs() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut index = open_index(dir.path());
            index.set_lock(LockType::Exclusive).unwrap();
            index.append(0, &[(field::LOCATION, b"mbox/1")]).unwrap();
            // simulated crash: the handle dies without releasing the lock,
            // so FSCK stays set in the header
        }

        let mut index = MailIndex::new(dir.path(), TestBackend::default());
        index.open(true).unwrap();
        assert_eq!(index.backend().fsck_calls, 1);
        assert_eq!(index.backend().rebuild_calls, 0);

        index.set_lock(LockType::Shared).unwrap();
        let hdr = index.header().unwrap();
        assert!(!hdr.has_flags(index_flags::FSCK));
        assert_eq!(hdr.messages_count(), 1);
        assert_eq!(hdr.next_uid(), 2);
        index.set_lock(LockType::Unlock).unwrap();
    }

    #[test]
    fn clean_release_clears_fsck_and_stamps_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());

        index.set_sync_stamp(1_600_000_000).unwrap();
        index.set_lock(LockType::Exclusive).unwrap();
        index.append(0, &[(field::LOCATION, b"mbox/1")]).unwrap();
        index.set_lock(LockType::Unlock).unwrap();

        index.set_lock(LockType::Shared).unwrap();
        assert!(!index.header().unwrap().has_flags(index_flags::FSCK));
        index.set_lock(LockType::Unlock).unwrap();

        let mtime = std::fs::metadata(dir.path().join(".mailidx"))
            .unwrap()
            .modified()
            .unwrap();
        let expected = std::time::SystemTime::UNIX_EPOCH
            + std::time::Duration::from_secs(1_600_000_000);
        assert_eq!(mtime, expected);
    }

    #[test]
    fn indexid_change_poisons_the_open_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(dir.path());
        append_three(&mut index);

        index.set_lock(LockType::Shared).unwrap();
        index.set_lock(LockType::Unlock).unwrap();

        // another process rebuilds the index: indexid changes underneath us
        {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .open(dir.path().join(".mailidx"))
                .unwrap();
            file.seek(SeekFrom::Start(8)).unwrap();
            file.write_all(&0xdead_beefu32.to_le_bytes()).unwrap();
        }

        assert!(index.set_lock(LockType::Shared).is_err());
        assert!(index.is_inconsistent());
        // poisoned: everything but teardown keeps failing
        assert!(index.set_lock(LockType::Shared).is_err());
        index.close();
    }

    #[test]
    fn rebuild_flag_found_on_lock_triggers_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let backend = TestBackend::with_mails(vec![(0, "cur/1"), (mail_flags::SEEN, "cur/2")]);
        let mut index = MailIndex::new(dir.path(), backend);
        index.open_or_create(true).unwrap();
        let rebuilds_after_open = index.backend().rebuild_calls;

        // corrupt-flag the live header the way a peer would
        index.set_lock(LockType::Exclusive).unwrap();
        index
            .state_mut()
            .unwrap()
            .request_header_flags(index_flags::REBUILD);
        index.set_lock(LockType::Unlock).unwrap();

        index.set_lock(LockType::Shared).unwrap();
        assert_eq!(index.backend().rebuild_calls, rebuilds_after_open + 1);
        let hdr = index.header().unwrap();
        assert!(!hdr.has_flags(index_flags::REBUILD));
        assert_eq!(hdr.messages_count(), 2);
        index.set_lock(LockType::Unlock).unwrap();
    }

    #[test]
    fn cache_fields_pass_preserves_the_index_generation() {
        let dir = tempfile::tempdir().unwrap();
        let generation;
        {
            let mut index = open_index(dir.path());
            append_three(&mut index);

            // first read records the interest, second read escalates it to
            // a CACHE_FIELDS request for existing records
            for _ in 0..2 {
                index.set_lock(LockType::Shared).unwrap();
                let pos = index.lookup(1).unwrap().unwrap();
                index.lookup_field(pos, field::ENVELOPE).unwrap();
                index.set_lock(LockType::Unlock).unwrap();
            }
            generation = index.state().unwrap().indexid();
        }

        let mut index = MailIndex::new(dir.path(), TestBackend::default());
        index.open(true).unwrap();
        assert_eq!(index.backend().update_cache_calls, 1);
        assert_eq!(
            index.backend().rebuild_calls,
            0,
            "materializing cache fields is not a rebuild"
        );

        index.set_lock(LockType::Shared).unwrap();
        let hdr = index.header().unwrap();
        assert!(!hdr.has_flags(index_flags::CACHE_FIELDS));
        assert_eq!(hdr.indexid(), generation, "generation survives the pass");
        assert_eq!(hdr.messages_count(), 3);
        assert_eq!(hdr.next_uid(), 4);

        // the materialized field is now served from the data file
        let pos = index.lookup(1).unwrap().unwrap();
        assert_eq!(
            index.lookup_field(pos, field::ENVELOPE).unwrap(),
            Some(&b"From: caching@example"[..])
        );
        index.set_lock(LockType::Unlock).unwrap();
    }

    #[test]
    fn cache_fields_pass_does_not_poison_peer_handles() {
        let dir = tempfile::tempdir().unwrap();
        let mut peer = open_index(dir.path());
        append_three(&mut peer);

        // this session leaves a CACHE_FIELDS request behind
        for _ in 0..2 {
            peer.set_lock(LockType::Shared).unwrap();
            let pos = peer.lookup(1).unwrap().unwrap();
            peer.lookup_field(pos, field::ENVELOPE).unwrap();
            peer.set_lock(LockType::Unlock).unwrap();
        }

        // another process opens the index and runs the pass
        let mut other = MailIndex::new(dir.path(), TestBackend::default());
        other.open(true).unwrap();
        assert_eq!(other.backend().update_cache_calls, 1);
        drop(other);

        // the first handle keeps working on the same generation
        peer.set_lock(LockType::Shared).unwrap();
        assert!(!peer.is_inconsistent());
        assert_eq!(peer.header().unwrap().messages_count(), 3);
        peer.set_lock(LockType::Unlock).unwrap();
    }

    #[test]
    fn recent_range_is_claimed_once_per_generation() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut index = open_index(dir.path());
            append_three(&mut index);
            assert_eq!(index.first_recent_uid().unwrap(), 1);
        }

        // uids 1..=3 exist; a new session claims them all as non-recent
        let mut index = MailIndex::new(dir.path(), TestBackend::default());
        index.open(true).unwrap();
        assert_eq!(index.first_recent_uid().unwrap(), 1);

        index.set_lock(LockType::Shared).unwrap();
        assert_eq!(index.header().unwrap().last_nonrecent_uid(), 3);
        index.set_lock(LockType::Unlock).unwrap();
        drop(index);

        // the next session sees nothing recent
        let mut index = MailIndex::new(dir.path(), TestBackend::default());
        index.open(true).unwrap();
        assert_eq!(index.first_recent_uid().unwrap(), 4);
    }
}
