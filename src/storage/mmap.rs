//! # Memory-Mapped Index View
//!
//! `IndexMmap` owns the read/write mapping of the index file and hands out
//! typed views of the header and record array. The mapping is refreshed
//! lazily: appends and truncations mark it dirty, and the next `refresh`
//! remaps the file at its current length.
//!
//! ## Partial Tails
//!
//! An interrupted append can leave trailing bytes that do not add up to a
//! whole record. `refresh` silently truncates the file back to the nearest
//! record boundary; this is ordinary crash recovery, not corruption, so no
//! rebuild is requested. A file shorter than the header, on the other hand,
//! is corrupt and fails the refresh.
//!
//! ## Safety Model
//!
//! As with the rest of the crate, remap safety rides on the borrow checker:
//! `refresh` takes `&mut self`, so no `&IndexHeader` or `&IndexRecord`
//! borrowed from the old mapping can be alive when the region is replaced.
//! All offset-based accessors bounds-check against the mapped length and
//! require record alignment.

use std::fs::File;
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};

use super::{parse_zerocopy, parse_zerocopy_mut, IndexHeader, IndexRecord};
use super::{INDEX_HEADER_SIZE, INDEX_RECORD_SIZE};

#[derive(Debug)]
pub struct IndexMmap {
    map: Option<MmapMut>,
    length: u64,
    dirty: bool,
}

impl IndexMmap {
    /// A new manager starts dirty so the first lock acquisition maps the file.
    pub fn new() -> Self {
        Self {
            map: None,
            length: 0,
            dirty: true,
        }
    }

    /// Marks the mapping stale; the next [`refresh`](Self::refresh) remaps.
    #[inline]
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        !self.dirty && self.map.is_some()
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Mapped length in bytes (header plus whole records).
    #[inline]
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Number of records covered by the mapping.
    #[inline]
    pub fn record_count(&self) -> u32 {
        if self.map.is_none() || self.length < INDEX_HEADER_SIZE as u64 {
            return 0;
        }
        ((self.length - INDEX_HEADER_SIZE as u64) / INDEX_RECORD_SIZE as u64) as u32
    }

    /// (Re)maps the file if the view is stale. Trailing bytes that do not
    /// form a whole record are truncated away before mapping.
    pub fn refresh(&mut self, file: &File, path: &Path) -> Result<()> {
        if !self.dirty && self.map.is_some() {
            return Ok(());
        }

        self.map = None;

        let mut length = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat index file {:?}", path))?
            .len();

        if length < INDEX_HEADER_SIZE as u64 {
            bail!("truncated index file {:?}: {} bytes", path, length);
        }

        let extra = (length - INDEX_HEADER_SIZE as u64) % INDEX_RECORD_SIZE as u64;
        if extra != 0 {
            // partial append, cut the file back to the last whole record
            length -= extra;
            file.set_len(length)
                .wrap_err_with(|| format!("failed to truncate partial tail of {:?}", path))?;
        }

        // SAFETY: the file is mapped shared read/write for its full (record
        // aligned) length. A single process writes while holding an exclusive
        // advisory lock, the mapping is dropped before every remap, and all
        // access is bounds-checked against `length`.
        let map = unsafe {
            MmapOptions::new()
                .len(length as usize)
                .map_mut(file)
                .wrap_err_with(|| format!("failed to mmap index file {:?}", path))?
        };

        self.map = Some(map);
        self.length = length;
        self.dirty = false;
        Ok(())
    }

    fn bytes(&self) -> Result<&[u8]> {
        match &self.map {
            Some(map) => Ok(&map[..]),
            None => bail!("index file is not mapped"),
        }
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.map {
            Some(map) => Ok(&mut map[..]),
            None => bail!("index file is not mapped"),
        }
    }

    pub fn header(&self) -> Result<&IndexHeader> {
        parse_zerocopy(self.bytes()?, "IndexHeader")
    }

    pub fn header_mut(&mut self) -> Result<&mut IndexHeader> {
        parse_zerocopy_mut(self.bytes_mut()?, "IndexHeader")
    }

    fn check_offset(&self, offset: u64) -> Result<usize> {
        ensure!(
            offset >= INDEX_HEADER_SIZE as u64
                && offset + INDEX_RECORD_SIZE as u64 <= self.length
                && (offset - INDEX_HEADER_SIZE as u64) % INDEX_RECORD_SIZE as u64 == 0,
            "record offset {} out of bounds (mapped length {})",
            offset,
            self.length
        );
        Ok(offset as usize)
    }

    pub fn record_at(&self, offset: u64) -> Result<&IndexRecord> {
        let off = self.check_offset(offset)?;
        parse_zerocopy(&self.bytes()?[off..], "IndexRecord")
    }

    pub fn record_at_mut(&mut self, offset: u64) -> Result<&mut IndexRecord> {
        let off = self.check_offset(offset)?;
        parse_zerocopy_mut(&mut self.bytes_mut()?[off..], "IndexRecord")
    }

    /// Raw record-array access for compaction.
    pub fn records_bytes_mut(&mut self) -> Result<&mut [u8]> {
        Ok(&mut self.bytes_mut()?[INDEX_HEADER_SIZE..])
    }

    /// msync the whole mapping.
    pub fn flush(&self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush().wrap_err("failed to msync index mapping")?;
        }
        Ok(())
    }

    /// msync only the header page, used to persist the FSCK mark.
    pub fn flush_header(&self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush_range(0, INDEX_HEADER_SIZE)
                .wrap_err("failed to msync index header")?;
        }
        Ok(())
    }
}

impl Default for IndexMmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zerocopy::IntoBytes;

    fn index_with_records(dir: &std::path::Path, records: usize) -> (std::path::PathBuf, File) {
        let path = dir.join("index");
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.write_all(IndexHeader::fresh(1).as_bytes()).unwrap();
        for i in 0..records {
            let rec = IndexRecord::new(i as u32 + 1, 0, 0, 0, 0);
            file.write_all(rec.as_bytes()).unwrap();
        }
        (path, file)
    }

    #[test]
    fn refresh_maps_header_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let (path, file) = index_with_records(dir.path(), 3);

        let mut mmap = IndexMmap::new();
        mmap.refresh(&file, &path).unwrap();

        assert_eq!(mmap.record_count(), 3);
        assert_eq!(mmap.header().unwrap().next_uid(), 1);
        let off = INDEX_HEADER_SIZE as u64 + INDEX_RECORD_SIZE as u64;
        assert_eq!(mmap.record_at(off).unwrap().uid(), 2);
    }

    #[test]
    fn partial_tail_is_silently_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let (path, mut file) = index_with_records(dir.path(), 2);
        file.write_all(&[0xab; 7]).unwrap();

        let mut mmap = IndexMmap::new();
        mmap.refresh(&file, &path).unwrap();

        assert_eq!(mmap.record_count(), 2);
        let expected = (INDEX_HEADER_SIZE + 2 * INDEX_RECORD_SIZE) as u64;
        assert_eq!(file.metadata().unwrap().len(), expected);
    }

    #[test]
    fn file_shorter_than_header_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.write_all(&[0u8; 10]).unwrap();

        let mut mmap = IndexMmap::new();
        assert!(mmap.refresh(&file, &path).is_err());
    }

    #[test]
    fn record_offset_bounds_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (path, file) = index_with_records(dir.path(), 1);

        let mut mmap = IndexMmap::new();
        mmap.refresh(&file, &path).unwrap();

        assert!(mmap.record_at(0).is_err());
        assert!(mmap.record_at(INDEX_HEADER_SIZE as u64 + 1).is_err());
        assert!(mmap
            .record_at(INDEX_HEADER_SIZE as u64 + INDEX_RECORD_SIZE as u64)
            .is_err());
    }
}
