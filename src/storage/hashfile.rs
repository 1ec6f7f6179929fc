//! # UID Hash Sidecar
//!
//! Persistent `uid -> record offset` map that turns UID lookups into O(1)
//! probes instead of a record-array scan. The table is open-addressed with
//! linear probing over a power-of-two slot count and lives fully mmapped.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Description
//! 0       8     Magic: "MIDXHSH\0"
//! 8       4     indexid of the owning index
//! 12      4     capacity: slot count, power of two
//! 16      4     used: occupied slots (tombstones included)
//! 20      4     Reserved
//! 24      12*N  slots: {uid: u32, position: u64}
//! ```
//!
//! A slot with `uid == 0` is empty and ends a probe run. Deletion leaves the
//! uid in place with `position == 0` (a tombstone), so later probes keep
//! walking. The table never relocates in place; once the load factor passes
//! 3/4 or a probe run exhausts the table, `needs_rebuild` is raised and the
//! index schedules REBUILD_HASH.
//!
//! Misses are always legal: every caller falls back to scanning the record
//! array, so a stale or lost hash costs performance, never correctness.

use std::fs::File;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{parse_zerocopy, parse_zerocopy_mut};

pub const HASH_HEADER_SIZE: usize = 24;
pub const HASH_SLOT_SIZE: usize = 12;
pub const MIN_HASH_CAPACITY: u32 = 1024;

const HASH_MAGIC: &[u8; 8] = b"MIDXHSH\0";

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HashFileHeader {
    magic: [u8; 8],
    indexid: U32,
    capacity: U32,
    used: U32,
    reserved: U32,
}

const _: () = assert!(size_of::<HashFileHeader>() == HASH_HEADER_SIZE);

impl HashFileHeader {
    fn fresh(indexid: u32, capacity: u32) -> Self {
        Self {
            magic: *HASH_MAGIC,
            indexid: U32::new(indexid),
            capacity: U32::new(capacity),
            used: U32::new(0),
            reserved: U32::new(0),
        }
    }

    fn indexid(&self) -> u32 {
        self.indexid.get()
    }

    fn capacity(&self) -> u32 {
        self.capacity.get()
    }

    fn used(&self) -> u32 {
        self.used.get()
    }

    fn set_used(&mut self, used: u32) {
        self.used = U32::new(used);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HashSlot {
    uid: U32,
    position: U64,
}

const _: () = assert!(size_of::<HashSlot>() == HASH_SLOT_SIZE);

#[derive(Debug)]
pub struct HashFile {
    file: File,
    path: PathBuf,
    map: MmapMut,
    needs_rebuild: bool,
}

impl HashFile {
    pub fn create(path: &Path, indexid: u32, capacity: u32) -> Result<Self> {
        ensure!(
            capacity.is_power_of_two(),
            "hash capacity {} is not a power of two",
            capacity
        );

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create hash file {:?}", path))?;

        let len = HASH_HEADER_SIZE as u64 + capacity as u64 * HASH_SLOT_SIZE as u64;
        file.set_len(len)
            .wrap_err_with(|| format!("failed to size hash file {:?}", path))?;

        // SAFETY: shared read/write mapping of a file only this process
        // writes to; every access goes through bounds-checked slot offsets.
        let mut map = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to mmap hash file {:?}", path))?
        };
        map[..HASH_HEADER_SIZE].copy_from_slice(HashFileHeader::fresh(indexid, capacity).as_bytes());

        Ok(Self {
            file,
            path: path.to_path_buf(),
            map,
            needs_rebuild: false,
        })
    }

    /// Opens the sidecar, recreating it empty when missing or corrupt.
    /// The `bool` reports whether a fresh (empty) table was created, in which
    /// case the caller must rebuild it from the index.
    pub fn open_or_create(path: &Path, indexid: u32) -> Result<(Self, bool)> {
        match Self::open(path, indexid) {
            Ok(hash) => Ok((hash, false)),
            Err(err) => {
                tracing::warn!(
                    path = ?path,
                    error = %err,
                    "hash sidecar unusable, recreating empty"
                );
                Ok((Self::create(path, indexid, MIN_HASH_CAPACITY)?, true))
            }
        }
    }

    fn open(path: &Path, indexid: u32) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open hash file {:?}", path))?;

        let len = file.metadata()?.len();
        ensure!(
            len >= HASH_HEADER_SIZE as u64,
            "truncated hash file {:?}",
            path
        );

        // SAFETY: see create().
        let map = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to mmap hash file {:?}", path))?
        };

        let hdr: &HashFileHeader = parse_zerocopy(&map[..], "HashFileHeader")?;
        ensure!(&hdr.magic == HASH_MAGIC, "bad magic in hash file {:?}", path);
        ensure!(
            hdr.indexid() == indexid,
            "hash file {:?} belongs to another index generation",
            path
        );
        let capacity = hdr.capacity();
        ensure!(
            capacity.is_power_of_two()
                && len == HASH_HEADER_SIZE as u64 + capacity as u64 * HASH_SLOT_SIZE as u64,
            "hash file {:?} has inconsistent geometry",
            path
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            map,
            needs_rebuild: false,
        })
    }

    fn header(&self) -> Result<&HashFileHeader> {
        parse_zerocopy(&self.map[..], "HashFileHeader")
    }

    fn header_mut(&mut self) -> Result<&mut HashFileHeader> {
        parse_zerocopy_mut(&mut self.map[..], "HashFileHeader")
    }

    pub fn capacity(&self) -> Result<u32> {
        Ok(self.header()?.capacity())
    }

    /// Raised when an insert could not be placed; cleared by a rebuild.
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    fn slot(&self, idx: u32) -> Result<&HashSlot> {
        let off = HASH_HEADER_SIZE + idx as usize * HASH_SLOT_SIZE;
        parse_zerocopy(&self.map[off..], "HashSlot")
    }

    fn slot_mut(&mut self, idx: u32) -> Result<&mut HashSlot> {
        let off = HASH_HEADER_SIZE + idx as usize * HASH_SLOT_SIZE;
        parse_zerocopy_mut(&mut self.map[off..], "HashSlot")
    }

    /// Looks up the index-file offset cached for `uid`; 0 means a miss.
    pub fn lookup(&self, uid: u32) -> Result<u64> {
        let capacity = self.header()?.capacity();
        let mask = capacity - 1;

        let mut idx = uid & mask;
        for _ in 0..capacity {
            let slot = self.slot(idx)?;
            if slot.uid.get() == uid {
                return Ok(slot.position.get());
            }
            if slot.uid.get() == 0 {
                return Ok(0);
            }
            idx = (idx + 1) & mask;
        }

        Ok(0)
    }

    /// Inserts, updates or (with `position == 0`) tombstones an entry.
    /// Returns `false` when the table had no slot left; the entry is dropped
    /// and `needs_rebuild` is raised.
    pub fn update(&mut self, uid: u32, position: u64) -> Result<bool> {
        let (capacity, used) = {
            let hdr = self.header()?;
            (hdr.capacity(), hdr.used())
        };
        let mask = capacity - 1;

        let mut idx = uid & mask;
        for _ in 0..capacity {
            let slot = self.slot(idx)?;
            if slot.uid.get() == uid {
                self.slot_mut(idx)?.position = U64::new(position);
                return Ok(true);
            }
            if slot.uid.get() == 0 {
                if position == 0 {
                    // deleting an entry that was never cached
                    return Ok(true);
                }
                let slot = self.slot_mut(idx)?;
                slot.uid = U32::new(uid);
                slot.position = U64::new(position);
                self.header_mut()?.set_used(used + 1);
                if (used + 1) * 4 > capacity * 3 {
                    self.needs_rebuild = true;
                }
                return Ok(true);
            }
            idx = (idx + 1) & mask;
        }

        self.needs_rebuild = true;
        Ok(false)
    }

    /// Recreates the table sized for `entries` and inserts them all.
    pub fn rebuild(&mut self, indexid: u32, entries: &[(u32, u64)]) -> Result<()> {
        let capacity = (entries.len() as u32 * 2)
            .next_power_of_two()
            .max(MIN_HASH_CAPACITY);

        let len = HASH_HEADER_SIZE as u64 + capacity as u64 * HASH_SLOT_SIZE as u64;
        self.file
            .set_len(0)
            .and_then(|_| self.file.set_len(len))
            .wrap_err_with(|| format!("failed to resize hash file {:?}", self.path))?;

        // SAFETY: see create(); the previous mapping is replaced below and
        // no borrow of it can be live across this &mut self call.
        self.map = unsafe {
            MmapMut::map_mut(&self.file)
                .wrap_err_with(|| format!("failed to remap hash file {:?}", self.path))?
        };
        self.map[..HASH_HEADER_SIZE]
            .copy_from_slice(HashFileHeader::fresh(indexid, capacity).as_bytes());

        for &(uid, position) in entries {
            self.update(uid, position)?;
        }

        self.needs_rebuild = false;
        Ok(())
    }

    /// Drops all entries, rebinding the table to a new index generation.
    pub fn reset(&mut self, indexid: u32) -> Result<()> {
        self.rebuild(indexid, &[])
    }

    pub fn sync_file(&mut self) -> Result<()> {
        self.map
            .flush()
            .wrap_err_with(|| format!("failed to msync hash file {:?}", self.path))
    }
}
