//! # Mail Index
//!
//! The top-level handle over a mailbox's index file family. A `MailIndex`
//! pairs the storage state with a [`MailboxBackend`] and drives the protocol
//! glue: lock transitions with their maintenance duties, index discovery,
//! creation and the recovery ladder that runs during open.
//!
//! ## Handle Lifecycle
//!
//! ```text
//! closed -> opened (unlocked) -> shared/exclusive locked -> unlocked -> ...
//! ```
//!
//! An `inconsistent` handle is poisoned: another process rebuilt the index
//! underneath it (detected by an `indexid` change on lock acquisition), so
//! the cached state cannot be trusted and every operation except teardown
//! fails.
//!
//! ## Lock Protocol
//!
//! Readers take `Shared`, the single writer takes `Exclusive`, and
//! `Shared -> Exclusive` promotion is forbidden (drop to `Unlock` first).
//! Releasing an exclusive lock clears the FSCK crash marker, folds deferred
//! header bits in, msyncs the mapping, syncs the sidecars, stamps the file
//! mtime with the last mailbox sync time and fsyncs. Acquiring any lock
//! refreshes the mapping and re-verifies `indexid`.
//!
//! The first lock of a session additionally runs the backend's `sync` hook
//! so the index catches up with mailbox changes made while it was unlocked;
//! a REBUILD flag found in the live header triggers the full rebuild
//! pipeline before the caller proceeds. Both behaviors are suppressed while
//! already mid-update.

mod backend;
mod lookup;
mod mutate;
mod recovery;

pub use backend::MailboxBackend;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, eyre, Result, WrapErr};
use zerocopy::{FromBytes, IntoBytes};

use crate::storage::{
    self, index_flags, set_lock_blocking, wall_clock_secs, DataFile, DirLock, HashFile,
    IndexHeader, IndexMmap, IndexRecord, LockType, ModifyLog, DATA_FILE_SUFFIX, HASH_FILE_SUFFIX,
    INDEX_FILE_PREFIX, INDEX_HEADER_SIZE, LOG_FILE_SUFFIX, MIN_HASH_CAPACITY,
};

/// Byte offset of a record inside the index file, standing in for the raw
/// record pointer of the mmapped view. Positions stay valid across remaps
/// (appends) but not across compaction or rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPos(pub(crate) u64);

impl RecordPos {
    pub fn offset(self) -> u64 {
        self.0
    }
}

/// The storage side of an open index: the mmapped file, its lock state and
/// the three sidecars. Backend hooks receive `&mut IndexState`, which keeps
/// them callable from inside [`MailIndex`] operations without aliasing the
/// backend itself.
#[derive(Debug)]
pub struct IndexState {
    filepath: PathBuf,
    file: File,
    mmap: IndexMmap,
    lock_type: LockType,
    indexid: u32,
    inconsistent: bool,

    /// Header flag bits accumulated under a shared lock, OR'd into the
    /// header at the next exclusive release.
    set_flags: u32,
    /// Cache-field bits accumulated the same way.
    set_cache_fields: u32,

    /// `(position, sequence)` of the most recent lookup; reset on unlock and
    /// adjusted by expunges.
    last_lookup: Option<(RecordPos, u32)>,

    first_recent_uid: u32,
    file_sync_stamp: i64,

    data: DataFile,
    hash: HashFile,
    modifylog: ModifyLog,
}

impl IndexState {
    fn new(
        filepath: PathBuf,
        file: File,
        indexid: u32,
        data: DataFile,
        hash: HashFile,
        modifylog: ModifyLog,
    ) -> Self {
        Self {
            filepath,
            file,
            mmap: IndexMmap::new(),
            lock_type: LockType::Unlock,
            indexid,
            inconsistent: false,
            set_flags: 0,
            set_cache_fields: 0,
            last_lookup: None,
            first_recent_uid: 0,
            file_sync_stamp: wall_clock_secs() as i64,
            data,
            hash,
            modifylog,
        }
    }

    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    pub fn indexid(&self) -> u32 {
        self.indexid
    }

    /// Lowest UID considered `\Recent` by this session.
    pub fn first_recent_uid(&self) -> u32 {
        self.first_recent_uid
    }

    /// Mailbox modification time the index was last synced against; written
    /// to the index file's mtime on exclusive release so other processes can
    /// detect staleness cheaply.
    pub fn set_sync_stamp(&mut self, stamp: i64) {
        self.file_sync_stamp = stamp;
    }

    /// The live header. Requires a held lock: the mapping may be replaced
    /// or truncated while unlocked.
    pub fn header(&self) -> Result<&IndexHeader> {
        ensure!(
            self.lock_type != LockType::Unlock,
            "index header access requires a held lock"
        );
        self.mmap.header()
    }

    /// Field kinds appends should cache right now, deferred requests
    /// included.
    pub fn cache_fields(&self) -> Result<u32> {
        Ok(self.header()?.cache_fields() | self.set_cache_fields)
    }

    /// Requests header flag bits without holding the exclusive lock; the
    /// bits are applied at the next eligible release.
    pub fn request_header_flags(&mut self, bits: u32) {
        self.set_flags |= bits;
    }

    /// Clears header flag bits in place. Exclusive only.
    pub fn clear_header_flag_bits(&mut self, bits: u32) -> Result<()> {
        ensure!(
            self.lock_type == LockType::Exclusive,
            "clearing header flags requires the exclusive lock"
        );
        self.mmap.header_mut()?.clear_flag_bits(bits);
        self.set_flags &= !bits;
        Ok(())
    }

    /// Drives a lock transition with all of its maintenance duties. This is
    /// the storage-level half of the protocol; the backend-involving parts
    /// (mailbox sync, rebuild-on-REBUILD) live in [`MailIndex::set_lock`].
    pub fn set_lock(&mut self, lock: LockType) -> Result<()> {
        ensure!(
            !self.inconsistent,
            "index {:?} is inconsistent, only teardown is allowed",
            self.filepath
        );

        if self.lock_type == lock {
            return Ok(());
        }

        assert!(
            lock != LockType::Exclusive || self.lock_type != LockType::Shared,
            "shared lock cannot be promoted to exclusive"
        );

        if self.lock_type == LockType::Exclusive && self.mmap.is_mapped() {
            // releasing the writer lock: drop the crash marker, fold in the
            // deferred header bits and push everything out. With the mapping
            // gone (a failed refresh), skip straight to the fcntl release so
            // the OS lock never sticks.
            self.mmap.header_mut()?.clear_flag_bits(index_flags::FSCK);
            self.apply_header_changes()?;
            if let Err(err) = self.sync_file() {
                tracing::warn!(path = ?self.filepath, error = %err, "sync on lock release failed");
            }
        }

        set_lock_blocking(&self.file, lock, &self.filepath)?;

        if lock == LockType::Unlock {
            // the cursor would point into a mapping we may replace next time
            self.last_lookup = None;
        }

        let old = self.lock_type;
        self.lock_type = lock;

        if lock != LockType::Unlock {
            if let Err(err) = self.mmap.refresh(&self.file, &self.filepath) {
                let _ = self.set_lock(LockType::Unlock);
                return Err(err);
            }

            if self.mmap.header()?.indexid() != self.indexid {
                tracing::warn!(
                    path = ?self.filepath,
                    "index was rebuilt while this handle had it open"
                );
                self.inconsistent = true;
                bail!(
                    "index {:?} was rebuilt while it was open",
                    self.filepath
                );
            }
        } else if old == LockType::Shared {
            // bits accumulated under the shared lock need the writer lock to
            // land; take it once and let its release apply them
            let hdr = self.mmap.header()?;
            let flags = hdr.flags();
            let cache = hdr.cache_fields();
            if (flags | self.set_flags) != flags || (cache | self.set_cache_fields) != cache {
                self.set_lock(LockType::Exclusive)?;
                return self.set_lock(LockType::Unlock);
            }
        }

        if lock == LockType::Exclusive {
            // crash marker: stays set while mutating so an unclean death is
            // noticed by the next open
            self.mmap.header_mut()?.set_flag_bits(index_flags::FSCK);
            if let Err(err) = self.fmsync_header() {
                let _ = self.set_lock(LockType::Unlock);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Non-blocking lock probe. On success the transition is completed with
    /// full [`set_lock`](Self::set_lock) semantics; `Ok(false)` means
    /// another process holds a conflicting lock.
    pub fn try_lock(&mut self, lock: LockType) -> Result<bool> {
        ensure!(
            !self.inconsistent,
            "index {:?} is inconsistent, only teardown is allowed",
            self.filepath
        );
        if self.lock_type == lock {
            return Ok(true);
        }
        if !storage::try_lock(&self.file, lock, &self.filepath)? {
            return Ok(false);
        }
        // the fcntl lock is already ours; the blocking path completes
        // immediately and runs the usual transition duties
        self.set_lock(lock)?;
        Ok(true)
    }

    fn apply_header_changes(&mut self) -> Result<()> {
        if self.set_flags != 0 {
            let bits = self.set_flags;
            self.set_flags = 0;
            self.mmap.header_mut()?.set_flag_bits(bits);
        }
        if self.set_cache_fields != 0 {
            let bits = self.set_cache_fields;
            self.set_cache_fields = 0;
            let hdr = self.mmap.header_mut()?;
            let merged = hdr.cache_fields() | bits;
            hdr.set_cache_fields(merged);
        }
        Ok(())
    }

    /// Pushes the index and all sidecars to disk and stamps the index file's
    /// mtime with the mailbox sync time.
    pub fn sync_file(&mut self) -> Result<()> {
        self.data.sync_file()?;
        self.mmap.flush()?;

        let mut failed: Option<eyre::Report> = None;
        if let Err(err) = self.hash.sync_file() {
            failed = Some(err);
        }
        if let Err(err) = self.modifylog.sync_file() {
            if failed.is_none() {
                failed = Some(err);
            }
        }

        storage::set_mtime(&self.filepath, self.file_sync_stamp)?;
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to fsync index file {:?}", self.filepath))?;

        match failed {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fmsync_header(&mut self) -> Result<()> {
        self.mmap.flush_header()?;
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to fsync index file {:?}", self.filepath))
    }

    /// Read-only view of the modify log, mainly for peers and tests.
    pub fn modifylog_records(&mut self) -> Result<Vec<storage::LogEntry>> {
        self.modifylog.records()
    }
}

/// An open (or openable) mail index bound to a mailbox backend.
#[derive(Debug)]
pub struct MailIndex<B: MailboxBackend> {
    dir: PathBuf,
    backend: B,
    state: Option<IndexState>,
    updating: bool,
    opened: bool,
}

impl<B: MailboxBackend> MailIndex<B> {
    pub fn new(dir: impl Into<PathBuf>, backend: B) -> Self {
        Self {
            dir: dir.into(),
            backend,
            state: None,
            updating: false,
            opened: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn state(&self) -> Result<&IndexState> {
        self.state.as_ref().ok_or_else(|| eyre!("index is not open"))
    }

    pub fn state_mut(&mut self) -> Result<&mut IndexState> {
        self.state.as_mut().ok_or_else(|| eyre!("index is not open"))
    }

    pub(crate) fn parts(&mut self) -> Result<(&mut IndexState, &mut B)> {
        match self.state.as_mut() {
            Some(state) => Ok((state, &mut self.backend)),
            None => bail!("index is not open"),
        }
    }

    /// Opens an existing compatible index in the directory.
    pub fn open(&mut self, update_recent: bool) -> Result<()> {
        ensure!(!self.opened, "index is already open");

        let name = find_index(&self.dir)?
            .ok_or_else(|| eyre!("no compatible index found in {:?}", self.dir))?;
        self.open_file(&name, update_recent)?;
        self.opened = true;
        Ok(())
    }

    /// Creates a fresh index, populating it through the backend's rebuild.
    pub fn create(&mut self, update_recent: bool) -> Result<()> {
        ensure!(!self.opened, "index is already open");

        let dir_lock = DirLock::acquire(&self.dir)?;
        self.create_index(update_recent, dir_lock)?;
        self.opened = true;
        Ok(())
    }

    /// Opens the index if a compatible one exists, creating it otherwise.
    /// The probe-create window is closed with the directory lock.
    pub fn open_or_create(&mut self, update_recent: bool) -> Result<()> {
        ensure!(!self.opened, "index is already open");

        if let Some(name) = find_index(&self.dir)? {
            match self.open_file(&name, update_recent) {
                Ok(()) => {
                    self.opened = true;
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        dir = ?self.dir,
                        error = %err,
                        "existing index failed to open, recreating"
                    );
                }
            }
        }

        let dir_lock = DirLock::acquire(&self.dir)?;

        // re-probe under the lock so two processes cannot both create
        let reopened = match find_index(&self.dir)? {
            Some(name) => self.open_file(&name, update_recent).is_ok(),
            None => false,
        };

        if !reopened {
            self.create_index(update_recent, dir_lock)?;
        }

        self.opened = true;
        Ok(())
    }

    /// Tears the handle down. Files stay on disk; an unreleased exclusive
    /// lock leaves FSCK set so the next open repairs.
    pub fn close(&mut self) {
        self.state = None;
        self.opened = false;
        self.updating = false;
    }

    pub fn is_inconsistent(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.inconsistent)
    }

    /// Full lock transition: storage-level duties plus the backend glue.
    /// The first acquisition of a session runs the mailbox `sync` hook, and
    /// a REBUILD flag found in the header triggers the rebuild pipeline.
    pub fn set_lock(&mut self, lock: LockType) -> Result<()> {
        if lock != LockType::Unlock
            && !self.updating
            && self.state()?.lock_type() == LockType::Unlock
        {
            self.updating = true;
            let ret = self.sync_and_lock(lock);
            self.updating = false;
            ret?;
            // the recursion above ran with the update guard held, so the
            // rebuild check was suppressed; run it now that the lock is held
            return self.maybe_rebuild(lock);
        }

        self.state_mut()?.set_lock(lock)?;
        self.maybe_rebuild(lock)
    }

    fn sync_and_lock(&mut self, lock: LockType) -> Result<()> {
        let (state, backend) = self.parts()?;
        if let Err(err) = backend.sync(state) {
            tracing::warn!(error = %err, "mailbox sync before locking failed");
        }
        self.set_lock(lock)
    }

    fn maybe_rebuild(&mut self, lock: LockType) -> Result<()> {
        if self.updating || lock == LockType::Unlock {
            return Ok(());
        }
        if !self.state()?.header()?.has_flags(index_flags::REBUILD) {
            return Ok(());
        }

        self.updating = true;
        let ret = self.rebuild_and_relock(lock);
        self.updating = false;
        ret
    }

    fn rebuild_and_relock(&mut self, lock: LockType) -> Result<()> {
        {
            let (state, backend) = self.parts()?;
            if lock == LockType::Shared {
                state.set_lock(LockType::Unlock)?;
            }
            state.set_lock(LockType::Exclusive)?;
            backend.rebuild(state)?;
            state.clear_header_flag_bits(index_flags::REBUILD)?;
            state.rebuild_hash()?;
        }
        self.state_mut()?.set_lock(lock)
    }

    /// Non-blocking variant of [`set_lock`](Self::set_lock). The mailbox
    /// sync hook is skipped: a probe must not block on mailbox I/O.
    pub fn try_lock(&mut self, lock: LockType) -> Result<bool> {
        self.state_mut()?.try_lock(lock)
    }

    fn open_file(&mut self, name: &str, update_recent: bool) -> Result<()> {
        let result = self.open_file_inner(name, update_recent);
        if result.is_err() {
            self.state = None;
        }
        result
    }

    fn open_file_inner(&mut self, name: &str, update_recent: bool) -> Result<()> {
        let filepath = self.dir.join(name);
        let mut file = File::options()
            .read(true)
            .write(true)
            .open(&filepath)
            .wrap_err_with(|| format!("failed to open index {:?}", filepath))?;

        let mut hdr = read_and_verify_header(&mut file, &filepath)?;
        let indexid = hdr.indexid();

        let data_path = sidecar_path(&filepath, DATA_FILE_SUFFIX);
        let data = match DataFile::open(&data_path, indexid) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(
                    path = ?data_path,
                    error = %err,
                    "data file unusable, recreating and scheduling a rebuild"
                );
                hdr.set_flag_bits(index_flags::REBUILD);
                DataFile::create(&data_path, indexid)?
            }
        };

        let (hash, hash_fresh) =
            HashFile::open_or_create(&sidecar_path(&filepath, HASH_FILE_SUFFIX), indexid)?;
        let modifylog =
            ModifyLog::open_or_create(&sidecar_path(&filepath, LOG_FILE_SUFFIX), indexid)?;

        self.state = Some(IndexState::new(
            filepath, file, indexid, data, hash, modifylog,
        ));

        self.run_recovery(&hdr, hash_fresh, update_recent)
    }

    fn create_index(&mut self, update_recent: bool, dir_lock: DirLock) -> Result<()> {
        let result = self.create_index_inner(update_recent, dir_lock);
        if result.is_err() {
            self.state = None;
        }
        result
    }

    fn create_index_inner(&mut self, update_recent: bool, dir_lock: DirLock) -> Result<()> {
        let hdr = IndexHeader::fresh(wall_clock_secs());

        // build the file aside, then link it into place atomically
        let temp_path = self
            .dir
            .join(format!("{}.tmp.{}", INDEX_FILE_PREFIX, std::process::id()));
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .wrap_err_with(|| format!("failed to create temp index {:?}", temp_path))?;
        file.write_all(hdr.as_bytes())
            .wrap_err_with(|| format!("failed to write temp index {:?}", temp_path))?;

        let primary = self.dir.join(INDEX_FILE_PREFIX);
        let filepath = match std::fs::hard_link(&temp_path, &primary) {
            Ok(()) => {
                let _ = std::fs::remove_file(&temp_path);
                primary
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                // an incompatible index owns the primary name; fall back to a
                // host-qualified name, hostnames being unique per system
                let fallback = self
                    .dir
                    .join(format!("{}-{}", INDEX_FILE_PREFIX, storage::hostname()));
                std::fs::rename(&temp_path, &fallback).wrap_err_with(|| {
                    format!("rename({:?}, {:?}) failed", temp_path, fallback)
                })?;
                fallback
            }
            Err(err) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(err)
                    .wrap_err_with(|| format!("link({:?}, {:?}) failed", temp_path, primary));
            }
        };

        let indexid = hdr.indexid();
        let data = DataFile::create(&sidecar_path(&filepath, DATA_FILE_SUFFIX), indexid)?;
        let hash = HashFile::create(
            &sidecar_path(&filepath, HASH_FILE_SUFFIX),
            indexid,
            MIN_HASH_CAPACITY,
        )?;
        let modifylog = ModifyLog::create(&sidecar_path(&filepath, LOG_FILE_SUFFIX), indexid)?;

        self.state = Some(IndexState::new(
            filepath, file, indexid, data, hash, modifylog,
        ));

        self.state_mut()?.set_lock(LockType::Exclusive)?;
        // the index file lock now guards creation; the directory can go
        drop(dir_lock);

        self.updating = true;
        let populated = self.create_populate(update_recent);
        self.updating = false;
        populated?;

        self.state_mut()?.set_lock(LockType::Unlock)
    }

    fn create_populate(&mut self, update_recent: bool) -> Result<()> {
        let (state, backend) = self.parts()?;
        backend.rebuild(state)?;
        state.clear_header_flag_bits(index_flags::REBUILD)?;

        let snapshot = *state.header()?;
        recovery::open_init(state, update_recent, &snapshot)
    }

    // convenience delegates over the storage state

    pub fn header(&self) -> Result<&IndexHeader> {
        self.state()?.header()
    }

    pub fn first_recent_uid(&self) -> Result<u32> {
        Ok(self.state()?.first_recent_uid())
    }

    pub fn set_sync_stamp(&mut self, stamp: i64) -> Result<()> {
        self.state_mut()?.set_sync_stamp(stamp);
        Ok(())
    }

    pub fn lookup(&mut self, seq: u32) -> Result<Option<RecordPos>> {
        self.state_mut()?.lookup(seq)
    }

    pub fn record(&self, pos: RecordPos) -> Result<&IndexRecord> {
        self.state()?.record(pos)
    }

    pub fn next(&self, pos: RecordPos) -> Result<Option<RecordPos>> {
        self.state()?.next(pos)
    }

    pub fn lookup_uid_range(&mut self, first_uid: u32, last_uid: u32) -> Result<Option<RecordPos>> {
        self.state_mut()?.lookup_uid_range(first_uid, last_uid)
    }

    pub fn get_sequence(&self, pos: RecordPos) -> Result<u32> {
        self.state()?.get_sequence(pos)
    }

    pub fn lookup_field(&mut self, pos: RecordPos, field_bit: u32) -> Result<Option<&[u8]>> {
        self.state_mut()?.lookup_field(pos, field_bit)
    }

    pub fn append(&mut self, msg_flags: u32, fields: &[(u32, &[u8])]) -> Result<RecordPos> {
        self.state_mut()?.append(msg_flags, fields)
    }

    pub fn expunge(&mut self, pos: RecordPos, seq: u32, external: bool) -> Result<()> {
        self.state_mut()?.expunge(pos, seq, external)
    }

    pub fn update_flags(
        &mut self,
        pos: RecordPos,
        seq: u32,
        msg_flags: u32,
        external: bool,
    ) -> Result<()> {
        self.state_mut()?.update_flags(pos, seq, msg_flags, external)
    }
}

fn sidecar_path(filepath: &Path, suffix: &str) -> PathBuf {
    let mut os = filepath.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Reads and validates the header of an index file: exact compat tuple and
/// exact version, anything else is a different build's index.
fn read_and_verify_header(file: &mut File, path: &Path) -> Result<IndexHeader> {
    file.seek(SeekFrom::Start(0))
        .wrap_err_with(|| format!("failed to seek index {:?}", path))?;

    let mut bytes = [0u8; INDEX_HEADER_SIZE];
    file.read_exact(&mut bytes)
        .wrap_err_with(|| format!("failed to read index header from {:?}", path))?;

    let hdr = IndexHeader::read_from_bytes(&bytes)
        .map_err(|e| eyre!("failed to parse index header of {:?}: {:?}", path, e))?;

    ensure!(
        hdr.is_compatible(),
        "incompatible index file {:?} (compat {:?}, version {})",
        path,
        hdr.compat_data(),
        hdr.version()
    );

    Ok(hdr)
}

fn is_compatible_index(path: &Path) -> bool {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return false,
    };

    let mut bytes = [0u8; INDEX_HEADER_SIZE];
    if file.read_exact(&mut bytes).is_err() {
        return false;
    }

    match IndexHeader::read_from_bytes(&bytes) {
        Ok(hdr) => hdr.is_compatible(),
        Err(_) => false,
    }
}

/// Finds a compatible index file: the primary name first, then any sibling
/// sharing the prefix (a fallback created by another host, or left behind by
/// an older build whose primary got replaced).
fn find_index(dir: &Path) -> Result<Option<String>> {
    if is_compatible_index(&dir.join(INDEX_FILE_PREFIX)) {
        return Ok(Some(INDEX_FILE_PREFIX.to_string()));
    }

    let entries = std::fs::read_dir(dir)
        .wrap_err_with(|| format!("failed to read mailbox directory {:?}", dir))?;

    for entry in entries {
        let entry = entry.wrap_err("failed to read directory entry")?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(INDEX_FILE_PREFIX) && is_compatible_index(&entry.path()) {
            return Ok(Some(name.into_owned()));
        }
    }

    Ok(None)
}
