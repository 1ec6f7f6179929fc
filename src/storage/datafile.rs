//! # Data File
//!
//! Variable-length cached fields live outside the fixed-size record array, in
//! a sidecar addressed by the `(data_position, data_size)` pair each index
//! record carries.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Description
//! 0       8     Magic: "MIDXDAT\0"
//! 8       4     indexid of the owning index
//! 12      4     Reserved
//! 16      8     used_file_size: append offset, includes this header
//! 24      8     deleted_space: bytes orphaned by expunges
//! ```
//!
//! Each data record is a small header followed by tagged field entries:
//!
//! ```text
//! +-----+-----------+  +-------+------+---------+  +-------+ ...
//! | uid | body_size |  | field | size | payload |  | field | ...
//! | u32 | u32       |  | u32   | u32  | <size>  |  | u32   |
//! +-----+-----------+  +-------+------+---------+  +-------+
//! ```
//!
//! Expunges do not rewrite the file; they only grow `deleted_space`. Once
//! half the payload is dead, `add_deleted_space` recommends a data-file
//! compaction and the caller schedules COMPRESS_DATA.
//!
//! Lookups verify the record header against the expected UID before trusting
//! any entry. A mismatch means the index and data file disagree, which the
//! caller escalates to a rebuild.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::MmapMut;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{parse_zerocopy, parse_zerocopy_mut};

pub const DATA_HEADER_SIZE: usize = 32;
pub const DATA_RECORD_HEADER_SIZE: usize = 8;
const DATA_ENTRY_HEADER_SIZE: usize = 8;

const DATA_MAGIC: &[u8; 8] = b"MIDXDAT\0";

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DataFileHeader {
    magic: [u8; 8],
    indexid: U32,
    reserved: U32,
    used_file_size: U64,
    deleted_space: U64,
}

const _: () = assert!(size_of::<DataFileHeader>() == DATA_HEADER_SIZE);

impl DataFileHeader {
    fn fresh(indexid: u32) -> Self {
        Self {
            magic: *DATA_MAGIC,
            indexid: U32::new(indexid),
            reserved: U32::new(0),
            used_file_size: U64::new(DATA_HEADER_SIZE as u64),
            deleted_space: U64::new(0),
        }
    }

    fn indexid(&self) -> u32 {
        self.indexid.get()
    }

    fn used_file_size(&self) -> u64 {
        self.used_file_size.get()
    }

    fn set_used_file_size(&mut self, size: u64) {
        self.used_file_size = U64::new(size);
    }

    fn deleted_space(&self) -> u64 {
        self.deleted_space.get()
    }

    fn set_deleted_space(&mut self, bytes: u64) {
        self.deleted_space = U64::new(bytes);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DataRecordHeader {
    uid: U32,
    body_size: U32,
}

const _: () = assert!(size_of::<DataRecordHeader>() == DATA_RECORD_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DataEntryHeader {
    field: U32,
    size: U32,
}

#[derive(Debug)]
pub struct DataFile {
    file: File,
    path: PathBuf,
    map: Option<MmapMut>,
    dirty: bool,
}

impl DataFile {
    pub fn create(path: &Path, indexid: u32) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create data file {:?}", path))?;

        file.write_all_at(DataFileHeader::fresh(indexid).as_bytes(), 0)
            .wrap_err_with(|| format!("failed to write data file header {:?}", path))?;

        let mut data = Self {
            file,
            path: path.to_path_buf(),
            map: None,
            dirty: true,
        };
        data.refresh()?;
        Ok(data)
    }

    /// Opens an existing data file, validating magic, indexid and the
    /// recorded append offset. Any validation failure is corruption, which
    /// the open pipeline answers by recreating the file and rebuilding.
    pub fn open(path: &Path, indexid: u32) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open data file {:?}", path))?;

        let len = file.metadata()?.len();
        ensure!(
            len >= DATA_HEADER_SIZE as u64,
            "truncated data file {:?}: {} bytes",
            path,
            len
        );

        let mut data = Self {
            file,
            path: path.to_path_buf(),
            map: None,
            dirty: true,
        };
        data.refresh()?;

        let hdr = data.header()?;
        ensure!(&hdr.magic == DATA_MAGIC, "bad magic in data file {:?}", path);
        ensure!(
            hdr.indexid() == indexid,
            "data file {:?} belongs to another index generation ({} != {})",
            path,
            hdr.indexid(),
            indexid
        );
        ensure!(
            hdr.used_file_size() >= DATA_HEADER_SIZE as u64 && hdr.used_file_size() <= len,
            "data file {:?} has corrupted append offset {}",
            path,
            hdr.used_file_size()
        );

        Ok(data)
    }

    fn refresh(&mut self) -> Result<()> {
        if !self.dirty && self.map.is_some() {
            return Ok(());
        }

        self.map = None;
        let len = self.file.metadata()?.len();
        ensure!(
            len >= DATA_HEADER_SIZE as u64,
            "truncated data file {:?}",
            self.path
        );

        // SAFETY: shared read/write mapping of a file only this process
        // appends to; the mapping is dropped before every remap and access
        // is bounds-checked against the mapped length.
        let map = unsafe {
            MmapMut::map_mut(&self.file)
                .wrap_err_with(|| format!("failed to mmap data file {:?}", self.path))?
        };
        self.map = Some(map);
        self.dirty = false;
        Ok(())
    }

    fn map_bytes(&self) -> Result<&[u8]> {
        match &self.map {
            Some(map) => Ok(&map[..]),
            None => bail!("data file {:?} is not mapped", self.path),
        }
    }

    fn header(&self) -> Result<&DataFileHeader> {
        parse_zerocopy(self.map_bytes()?, "DataFileHeader")
    }

    fn header_mut(&mut self) -> Result<&mut DataFileHeader> {
        match &mut self.map {
            Some(map) => parse_zerocopy_mut(&mut map[..], "DataFileHeader"),
            None => bail!("data file {:?} is not mapped", self.path),
        }
    }

    pub fn used_file_size(&self) -> Result<u64> {
        Ok(self.header()?.used_file_size())
    }

    pub fn deleted_space(&self) -> Result<u64> {
        Ok(self.header()?.deleted_space())
    }

    /// Appends a data record for `uid` and returns its `(position, size)`
    /// address for the index record.
    pub fn append(&mut self, uid: u32, fields: &[(u32, &[u8])]) -> Result<(u64, u32)> {
        self.refresh()?;
        let pos = self.header()?.used_file_size();

        let body_size: usize = fields
            .iter()
            .map(|(_, data)| DATA_ENTRY_HEADER_SIZE + data.len())
            .sum();
        let total = DATA_RECORD_HEADER_SIZE + body_size;

        let mut buf = Vec::with_capacity(total);
        let rec_hdr = DataRecordHeader {
            uid: U32::new(uid),
            body_size: U32::new(body_size as u32),
        };
        buf.extend_from_slice(rec_hdr.as_bytes());
        for (field, data) in fields {
            let entry = DataEntryHeader {
                field: U32::new(*field),
                size: U32::new(data.len() as u32),
            };
            buf.extend_from_slice(entry.as_bytes());
            buf.extend_from_slice(data);
        }

        self.file
            .write_all_at(&buf, pos)
            .wrap_err_with(|| format!("failed to append to data file {:?}", self.path))?;

        self.dirty = true;
        self.refresh()?;
        let new_used = pos + total as u64;
        self.header_mut()?.set_used_file_size(new_used);

        Ok((pos, total as u32))
    }

    /// Appends an already encoded data record verbatim, used by compaction.
    pub fn append_raw(&mut self, bytes: &[u8]) -> Result<(u64, u32)> {
        self.refresh()?;
        let pos = self.header()?.used_file_size();

        self.file
            .write_all_at(bytes, pos)
            .wrap_err_with(|| format!("failed to append to data file {:?}", self.path))?;

        self.dirty = true;
        self.refresh()?;
        self.header_mut()?.set_used_file_size(pos + bytes.len() as u64);

        Ok((pos, bytes.len() as u32))
    }

    /// Validates the data record at `(pos, size)` against the UID the index
    /// record claims. `Ok(false)` means the two files disagree.
    pub fn record_verify(&mut self, pos: u64, size: u32, uid: u32) -> Result<bool> {
        Ok(self.record_body(pos, size, uid)?.is_some())
    }

    /// Bounds-checks the record and returns its body range, or `None` when
    /// the record is mismatched or malformed.
    fn record_body(&mut self, pos: u64, size: u32, uid: u32) -> Result<Option<(u64, u32)>> {
        self.refresh()?;
        let used = self.header()?.used_file_size();

        if (size as usize) < DATA_RECORD_HEADER_SIZE
            || pos < DATA_HEADER_SIZE as u64
            || pos + size as u64 > used
        {
            return Ok(None);
        }

        let bytes = self.map_bytes()?;
        let rec: &DataRecordHeader =
            parse_zerocopy(&bytes[pos as usize..], "DataRecordHeader")?;
        if rec.uid.get() != uid
            || rec.body_size.get() as usize + DATA_RECORD_HEADER_SIZE != size as usize
        {
            return Ok(None);
        }

        Ok(Some((
            pos + DATA_RECORD_HEADER_SIZE as u64,
            rec.body_size.get(),
        )))
    }

    /// Locates `field` inside the record at `(pos, size)`. Returns the
    /// payload's `(offset, length)`, or `None` when the record is corrupt or
    /// the field is genuinely absent.
    pub fn find_field(
        &mut self,
        pos: u64,
        size: u32,
        uid: u32,
        field: u32,
    ) -> Result<Option<(u64, u32)>> {
        let (body_pos, body_size) = match self.record_body(pos, size, uid)? {
            Some(body) => body,
            None => return Ok(None),
        };

        let bytes = self.map_bytes()?;
        let mut cur = body_pos as usize;
        let end = (body_pos + body_size as u64) as usize;

        while cur + DATA_ENTRY_HEADER_SIZE <= end {
            let entry: &DataEntryHeader = parse_zerocopy(&bytes[cur..], "DataEntryHeader")?;
            let payload = cur + DATA_ENTRY_HEADER_SIZE;
            let next = payload + entry.size.get() as usize;
            if next > end {
                // entry overruns its record, treat as corrupt
                return Ok(None);
            }
            if entry.field.get() == field {
                return Ok(Some((payload as u64, entry.size.get())));
            }
            cur = next;
        }

        Ok(None)
    }

    /// Borrow raw bytes out of the mapping.
    pub fn slice(&self, offset: u64, len: u32) -> Result<&[u8]> {
        let bytes = self.map_bytes()?;
        let start = offset as usize;
        let end = start + len as usize;
        ensure!(
            end <= bytes.len(),
            "data file slice {}..{} out of bounds ({})",
            start,
            end,
            bytes.len()
        );
        Ok(&bytes[start..end])
    }

    /// Whole verified record, header included, for compaction copies.
    pub fn raw_record(&mut self, pos: u64, size: u32, uid: u32) -> Result<Option<Vec<u8>>> {
        if self.record_body(pos, size, uid)?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.slice(pos, size)?.to_vec()))
    }

    /// Accounts bytes orphaned by an expunge. Returns `true` once at least
    /// half the payload is dead and a data-file compaction is worthwhile.
    pub fn add_deleted_space(&mut self, bytes: u32) -> Result<bool> {
        self.refresh()?;
        let hdr = self.header_mut()?;
        let deleted = hdr.deleted_space() + bytes as u64;
        hdr.set_deleted_space(deleted);

        let payload = hdr.used_file_size() - DATA_HEADER_SIZE as u64;
        Ok(payload > 0 && deleted * 2 >= payload)
    }

    /// Truncates back to an empty file owned by `indexid`.
    pub fn reset(&mut self, indexid: u32) -> Result<()> {
        self.map = None;
        self.file
            .set_len(DATA_HEADER_SIZE as u64)
            .wrap_err_with(|| format!("failed to truncate data file {:?}", self.path))?;
        self.file
            .write_all_at(DataFileHeader::fresh(indexid).as_bytes(), 0)?;
        self.dirty = true;
        self.refresh()
    }

    pub fn sync_file(&mut self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush()
                .wrap_err_with(|| format!("failed to msync data file {:?}", self.path))?;
        }
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to fsync data file {:?}", self.path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::field;

    #[test]
    fn append_and_find_field_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = DataFile::create(&dir.path().join("index.data"), 42).unwrap();

        let (pos, size) = data
            .append(1, &[(field::LOCATION, b"1017.mbox"), (field::MD5, b"digest")])
            .unwrap();

        assert!(data.record_verify(pos, size, 1).unwrap());
        let (off, len) = data.find_field(pos, size, 1, field::LOCATION).unwrap().unwrap();
        assert_eq!(data.slice(off, len).unwrap(), b"1017.mbox");
        let (off, len) = data.find_field(pos, size, 1, field::MD5).unwrap().unwrap();
        assert_eq!(data.slice(off, len).unwrap(), b"digest");
        assert!(data.find_field(pos, size, 1, field::ENVELOPE).unwrap().is_none());
    }

    #[test]
    fn uid_mismatch_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = DataFile::create(&dir.path().join("index.data"), 42).unwrap();

        let (pos, size) = data.append(5, &[(field::LOCATION, b"x")]).unwrap();
        assert!(!data.record_verify(pos, size, 6).unwrap());
        assert!(data.find_field(pos, size, 6, field::LOCATION).unwrap().is_none());
    }

    #[test]
    fn open_rejects_foreign_index_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.data");
        DataFile::create(&path, 42).unwrap();

        assert!(DataFile::open(&path, 43).is_err());
        assert!(DataFile::open(&path, 42).is_ok());
    }

    #[test]
    fn deleted_space_recommends_compaction_at_half() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = DataFile::create(&dir.path().join("index.data"), 1).unwrap();

        let (_, size1) = data.append(1, &[(field::LOCATION, b"aaaaaaaa")]).unwrap();
        let (_, _size2) = data.append(2, &[(field::LOCATION, b"bbbbbbbb")]).unwrap();

        assert!(!data.add_deleted_space(size1 / 2).unwrap());
        assert!(data.add_deleted_space(size1).unwrap());
    }

    #[test]
    fn reset_truncates_and_keeps_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.data");
        let mut data = DataFile::create(&path, 1).unwrap();
        data.append(1, &[(field::LOCATION, b"payload")]).unwrap();

        data.reset(2).unwrap();
        assert_eq!(data.used_file_size().unwrap(), DATA_HEADER_SIZE as u64);
        assert_eq!(data.deleted_space().unwrap(), 0);

        drop(data);
        assert!(DataFile::open(&path, 2).is_ok());
    }
}
