//! # Modify Log
//!
//! Append-only journal of expunges and flag changes. Peer processes holding
//! the same index open tail this file to learn what changed between their
//! own lock windows; the index itself never reads it back except to validate
//! it on open.
//!
//! ## Frame Format
//!
//! ```text
//! Offset  Size  Description
//! 0       4     kind: 1 = expunge, 2 = flag change
//! 4       4     seq: sequence number at the time of the event
//! 8       4     uid
//! 12      4     external: nonzero when the change originated outside IMAP
//! 16      8     checksum: CRC64 over the preceding 16 bytes
//! ```
//!
//! Frames are written with a single `write`, so a crash can only leave a
//! partial frame at the tail. On open the log is scanned and cut back at the
//! first frame whose checksum does not match; an invalid frame is an end-of-
//! log marker, not an error.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const LOG_HEADER_SIZE: usize = 16;
pub const LOG_FRAME_SIZE: usize = 24;

const LOG_MAGIC: &[u8; 8] = b"MIDXLOG\0";
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ModifyLogHeader {
    magic: [u8; 8],
    indexid: U32,
    reserved: U32,
}

const _: () = assert!(size_of::<ModifyLogHeader>() == LOG_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct LogFrame {
    kind: U32,
    seq: U32,
    uid: U32,
    external: U32,
    checksum: U64,
}

const _: () = assert!(size_of::<LogFrame>() == LOG_FRAME_SIZE);

const KIND_EXPUNGE: u32 = 1;
const KIND_FLAGS: u32 = 2;

fn compute_checksum(kind: u32, seq: u32, uid: u32, external: u32) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&kind.to_le_bytes());
    digest.update(&seq.to_le_bytes());
    digest.update(&uid.to_le_bytes());
    digest.update(&external.to_le_bytes());
    digest.finalize()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryKind {
    Expunge,
    FlagChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: LogEntryKind,
    pub seq: u32,
    pub uid: u32,
    pub external: bool,
}

#[derive(Debug)]
pub struct ModifyLog {
    file: File,
    path: PathBuf,
}

impl ModifyLog {
    pub fn create(path: &Path, indexid: u32) -> Result<Self> {
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create modify log {:?}", path))?;

        let hdr = ModifyLogHeader {
            magic: *LOG_MAGIC,
            indexid: U32::new(indexid),
            reserved: U32::new(0),
        };
        file.write_all(hdr.as_bytes())
            .wrap_err_with(|| format!("failed to write modify log header {:?}", path))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Opens the log, recreating it when missing, foreign or unreadable, and
    /// truncating any torn tail frame.
    pub fn open_or_create(path: &Path, indexid: u32) -> Result<Self> {
        match Self::open(path, indexid) {
            Ok(log) => Ok(log),
            Err(err) => {
                tracing::warn!(path = ?path, error = %err, "modify log unusable, recreating");
                Self::create(path, indexid)
            }
        }
    }

    fn open(path: &Path, indexid: u32) -> Result<Self> {
        let mut file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open modify log {:?}", path))?;

        let mut hdr_bytes = [0u8; LOG_HEADER_SIZE];
        file.read_exact(&mut hdr_bytes)
            .wrap_err_with(|| format!("truncated modify log {:?}", path))?;
        let hdr: &ModifyLogHeader = ModifyLogHeader::ref_from_bytes(&hdr_bytes)
            .map_err(|e| eyre::eyre!("failed to parse modify log header: {:?}", e))?;

        ensure!(&hdr.magic == LOG_MAGIC, "bad magic in modify log {:?}", path);
        ensure!(
            hdr.indexid.get() == indexid,
            "modify log {:?} belongs to another index generation",
            path
        );

        // scan forward, cutting the log at the first torn or corrupt frame
        let mut offset = LOG_HEADER_SIZE as u64;
        let mut frame = [0u8; LOG_FRAME_SIZE];
        loop {
            match file.read_exact(&mut frame) {
                Ok(()) => {}
                Err(_) => break,
            }
            let parsed: &LogFrame = match LogFrame::ref_from_bytes(&frame) {
                Ok(f) => f,
                Err(_) => break,
            };
            let expect = compute_checksum(
                parsed.kind.get(),
                parsed.seq.get(),
                parsed.uid.get(),
                parsed.external.get(),
            );
            if parsed.checksum.get() != expect {
                break;
            }
            offset += LOG_FRAME_SIZE as u64;
        }

        if offset != file.metadata()?.len() {
            file.set_len(offset)
                .wrap_err_with(|| format!("failed to truncate torn modify log {:?}", path))?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    fn append(&mut self, kind: u32, seq: u32, uid: u32, external: bool) -> Result<()> {
        let external = external as u32;
        let frame = LogFrame {
            kind: U32::new(kind),
            seq: U32::new(seq),
            uid: U32::new(uid),
            external: U32::new(external),
            checksum: U64::new(compute_checksum(kind, seq, uid, external)),
        };

        self.file
            .seek(SeekFrom::End(0))
            .and_then(|_| self.file.write_all(frame.as_bytes()))
            .wrap_err_with(|| format!("failed to append to modify log {:?}", self.path))
    }

    pub fn add_expunge(&mut self, seq: u32, uid: u32, external: bool) -> Result<()> {
        self.append(KIND_EXPUNGE, seq, uid, external)
    }

    pub fn add_flags(&mut self, seq: u32, uid: u32, external: bool) -> Result<()> {
        self.append(KIND_FLAGS, seq, uid, external)
    }

    /// All valid entries currently in the log, oldest first.
    pub fn records(&mut self) -> Result<Vec<LogEntry>> {
        self.file.seek(SeekFrom::Start(LOG_HEADER_SIZE as u64))?;

        let mut entries = Vec::new();
        let mut frame = [0u8; LOG_FRAME_SIZE];
        while self.file.read_exact(&mut frame).is_ok() {
            let parsed: &LogFrame = LogFrame::ref_from_bytes(&frame)
                .map_err(|e| eyre::eyre!("failed to parse modify log frame: {:?}", e))?;
            let expect = compute_checksum(
                parsed.kind.get(),
                parsed.seq.get(),
                parsed.uid.get(),
                parsed.external.get(),
            );
            if parsed.checksum.get() != expect {
                break;
            }
            let kind = match parsed.kind.get() {
                KIND_EXPUNGE => LogEntryKind::Expunge,
                KIND_FLAGS => LogEntryKind::FlagChange,
                other => {
                    tracing::warn!(kind = other, "unknown modify log frame kind, stopping scan");
                    break;
                }
            };
            entries.push(LogEntry {
                kind,
                seq: parsed.seq.get(),
                uid: parsed.uid.get(),
                external: parsed.external.get() != 0,
            });
        }

        Ok(entries)
    }

    /// Drops all entries, rebinding the log to a new index generation.
    pub fn reset(&mut self, indexid: u32) -> Result<()> {
        self.file
            .set_len(0)
            .wrap_err_with(|| format!("failed to truncate modify log {:?}", self.path))?;
        self.file.seek(SeekFrom::Start(0))?;
        let hdr = ModifyLogHeader {
            magic: *LOG_MAGIC,
            indexid: U32::new(indexid),
            reserved: U32::new(0),
        };
        self.file.write_all(hdr.as_bytes())?;
        Ok(())
    }

    pub fn sync_file(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to fsync modify log {:?}", self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appended_entries_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.log");
        let mut log = ModifyLog::create(&path, 7).unwrap();

        log.add_expunge(2, 12, false).unwrap();
        log.add_flags(1, 11, true).unwrap();

        let entries = log.records().unwrap();
        assert_eq!(
            entries,
            vec![
                LogEntry {
                    kind: LogEntryKind::Expunge,
                    seq: 2,
                    uid: 12,
                    external: false
                },
                LogEntry {
                    kind: LogEntryKind::FlagChange,
                    seq: 1,
                    uid: 11,
                    external: true
                },
            ]
        );
    }

    #[test]
    fn torn_tail_frame_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.log");

        {
            let mut log = ModifyLog::create(&path, 7).unwrap();
            log.add_expunge(1, 5, false).unwrap();
            // simulate a torn write
            log.file.seek(SeekFrom::End(0)).unwrap();
            log.file.write_all(&[0xde, 0xad, 0xbe]).unwrap();
        }

        let mut log = ModifyLog::open_or_create(&path, 7).unwrap();
        let entries = log.records().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].uid, 5);

        let expected = (LOG_HEADER_SIZE + LOG_FRAME_SIZE) as u64;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    }

    #[test]
    fn corrupt_frame_ends_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.log");

        {
            let mut log = ModifyLog::create(&path, 7).unwrap();
            log.add_expunge(1, 5, false).unwrap();
            log.add_flags(2, 6, false).unwrap();
            // flip a byte inside the second frame's uid
            let off = (LOG_HEADER_SIZE + LOG_FRAME_SIZE + 8) as u64;
            log.file.seek(SeekFrom::Start(off)).unwrap();
            log.file.write_all(&[0xff]).unwrap();
        }

        let mut log = ModifyLog::open_or_create(&path, 7).unwrap();
        assert_eq!(log.records().unwrap().len(), 1);
    }

    #[test]
    fn generation_mismatch_recreates_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.log");

        {
            let mut log = ModifyLog::create(&path, 7).unwrap();
            log.add_expunge(1, 5, false).unwrap();
        }

        let mut log = ModifyLog::open_or_create(&path, 8).unwrap();
        assert!(log.records().unwrap().is_empty());
    }
}
