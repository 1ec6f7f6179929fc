//! # mailidx: a mail index storage engine
//!
//! A single-writer, memory-mapped, crash-recoverable index mapping
//! monotonically increasing message UIDs to fixed-size metadata records,
//! with three sidecar stores: a data file for variable-length cached fields,
//! a UID hash for O(1) UID lookups, and an append-only modify log that peer
//! processes tail to observe expunges and flag changes.
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailidx::{LockType, MailIndex, mail_flags, field};
//!
//! let mut index = MailIndex::new("./Maildir/.INBOX", MyBackend::new());
//! index.open_or_create(true)?;
//!
//! index.set_lock(LockType::Exclusive)?;
//! let pos = index.append(mail_flags::SEEN, &[(field::LOCATION, b"cur/1017")])?;
//! index.set_lock(LockType::Unlock)?;
//!
//! index.set_lock(LockType::Shared)?;
//! let rec = index.record(pos)?;
//! println!("uid {} flags {:#x}", rec.uid(), rec.msg_flags());
//! index.set_lock(LockType::Unlock)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │       MailIndex<B: MailboxBackend>           │
//! │  open/create pipeline, lock protocol glue    │
//! ├──────────────────────────────────────────────┤
//! │   Lookup Engine   │     Mutation Engine      │
//! │ seq/uid/field     │  append/expunge/flags    │
//! ├──────────────────────────────────────────────┤
//! │              Recovery Driver                 │
//! │ rebuild / fsck / compress / rebuild-hash     │
//! ├───────────┬───────────┬───────────┬──────────┤
//! │ IndexMmap │ DataFile  │ HashFile  │ModifyLog │
//! └───────────┴───────────┴───────────┴──────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Single-threaded per process; processes coordinate through advisory
//! whole-file locks. Readers hold shared locks, the one writer holds the
//! exclusive lock, and shared-to-exclusive promotion is forbidden. Header
//! bits requested under a shared lock are deferred and folded in at the
//! next exclusive release.
//!
//! ## Crash Story
//!
//! - A torn index append leaves a partial record: silently truncated on the
//!   next map.
//! - A torn modify-log append leaves a bad checksum: the log is cut there.
//! - A writer dying with the exclusive lock leaves FSCK set in the header:
//!   the next open runs the backend's fsck hook.
//! - Anything worse sets REBUILD and the next open regenerates the whole
//!   index (under a fresh `indexid`, which poisons other open handles).

pub mod index;
pub mod storage;

pub use index::{IndexState, MailIndex, MailboxBackend, RecordPos};
pub use storage::{
    field, index_flags, mail_flags, DirLock, IndexHeader, IndexRecord, LockType, LogEntry,
    LogEntryKind, INDEX_FILE_PREFIX, INDEX_HEADER_SIZE, INDEX_RECORD_SIZE, INDEX_VERSION,
};
