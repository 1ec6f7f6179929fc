//! # Storage Module
//!
//! Foundational storage layer for the mail index: the on-disk binary formats,
//! the memory-mapped view of the index file, the advisory lock primitives, and
//! the three sidecar stores (data file, UID hash, modify log).
//!
//! ## File Family
//!
//! A mailbox directory carries one index file plus three sidecars named after
//! it:
//!
//! ```text
//! mailbox_dir/
//! ├── .mailidx            # header + packed record array (this file is mmapped)
//! ├── .mailidx.data       # variable-length cached fields
//! ├── .mailidx.hash       # uid -> record offset sidecar
//! └── .mailidx.log        # append-only expunge/flag journal
//! ```
//!
//! When the primary name is taken by an incompatible index, a host-qualified
//! fallback `.mailidx-<hostname>` is used instead; the sidecars follow the
//! index file's name.
//!
//! ## Access Model
//!
//! The index file is mapped read/write in whole and all reads return slices
//! into the mapping. A single writer mutates through the mapping while holding
//! an exclusive advisory lock; readers hold shared locks. The borrow checker
//! enforces that no record reference survives a remap: `IndexMmap::refresh`
//! takes `&mut self`, so outstanding `&IndexRecord` borrows must end first.
//!
//! ## Binary Conventions
//!
//! Multi-byte fields are little-endian via `zerocopy` wrapper types. The
//! index header carries no magic string; a compat tuple of native integer
//! widths plus an exact version number gates opens instead (see
//! [`headers::COMPAT_DATA`]). The sidecars each carry an eight-byte magic and
//! the owning index's `indexid` so files from different index generations are
//! never mixed.

mod datafile;
mod hashfile;
mod headers;
mod lock;
mod mmap;
mod modifylog;

pub use datafile::{DataFile, DATA_HEADER_SIZE, DATA_RECORD_HEADER_SIZE};
pub use hashfile::{HashFile, HASH_HEADER_SIZE, HASH_SLOT_SIZE, MIN_HASH_CAPACITY};
pub use headers::{
    field, index_flags, mail_flags, IndexHeader, IndexRecord, COMPAT_DATA, INDEX_VERSION,
};
pub use lock::{DirLock, LockType};
pub(crate) use lock::{set_lock_blocking, try_lock};
pub use mmap::IndexMmap;
pub use modifylog::{LogEntry, LogEntryKind, ModifyLog, LOG_FRAME_SIZE, LOG_HEADER_SIZE};

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::SystemTime;

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Primary index file name within a mailbox directory.
pub const INDEX_FILE_PREFIX: &str = ".mailidx";

pub const DATA_FILE_SUFFIX: &str = ".data";
pub const HASH_FILE_SUFFIX: &str = ".hash";
pub const LOG_FILE_SUFFIX: &str = ".log";

pub const INDEX_HEADER_SIZE: usize = 80;
pub const INDEX_RECORD_SIZE: usize = 24;

/// UIDs this close to `i32::MAX` request a rebuild so the next generation
/// restarts numbering from 1.
pub const REBUILD_UID_LIMIT: u32 = i32::MAX as u32 - 1024;

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );

    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Mutable variant of [`parse_zerocopy`].
#[inline]
pub fn parse_zerocopy_mut<'a, T: FromBytes + IntoBytes + KnownLayout + Immutable>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );

    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Seconds since the UNIX epoch, used for `indexid` / `uid_validity` stamps.
pub(crate) fn wall_clock_secs() -> u32 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Sets a file's modification time, keeping the access time current.
pub(crate) fn set_mtime(path: &Path, modtime: i64) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| eyre::eyre!("path contains NUL byte: {:?}", path))?;

    let times = libc::utimbuf {
        actime: wall_clock_secs() as libc::time_t,
        modtime: modtime as libc::time_t,
    };

    // SAFETY: cpath is a valid NUL-terminated string and times is a fully
    // initialized utimbuf; utime does not retain either pointer.
    let ret = unsafe { libc::utime(cpath.as_ptr(), &times) };
    ensure!(
        ret == 0,
        "utime() failed for {:?}: {}",
        path,
        std::io::Error::last_os_error()
    );
    Ok(())
}

/// Best-effort hostname for the fallback index file name.
pub(crate) fn hostname() -> String {
    let mut buf = [0u8; 256];

    // SAFETY: buf outlives the call and its length is passed alongside;
    // gethostname NUL-terminates on success.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len() - 1) };
    if ret != 0 {
        return "localhost".to_string();
    }

    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
