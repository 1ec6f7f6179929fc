//! # Advisory Lock Primitives
//!
//! Whole-file POSIX locks (`fcntl`) coordinating one writer with many
//! readers across processes. Blocking acquisition retries on signal
//! interruption; the non-blocking probe reports contention as `false`
//! instead of an error.
//!
//! `DirLock` serializes index *creation* within a mailbox directory: the
//! probe-then-create window in `open_or_create` is closed by holding an
//! exclusive lock on a dedicated lock file while re-probing and creating.
//! fcntl locks die with the owning process, so a crashed creator never
//! wedges the directory.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

/// Logical lock states of an index handle.
///
/// `Shared -> Exclusive` promotion is forbidden by the index lock protocol;
/// callers drop to `Unlock` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Unlock,
    Shared,
    Exclusive,
}

impl LockType {
    fn to_flock(self) -> libc::c_short {
        match self {
            LockType::Unlock => libc::F_UNLCK as libc::c_short,
            LockType::Shared => libc::F_RDLCK as libc::c_short,
            LockType::Exclusive => libc::F_WRLCK as libc::c_short,
        }
    }
}

fn whole_file_flock(lock: LockType) -> libc::flock {
    // SAFETY: flock is a plain C struct; zeroing produces a valid value and
    // the fields that matter are set explicitly below.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock.to_flock();
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;
    fl
}

/// Blocking whole-file lock transition, retried on EINTR.
pub(crate) fn set_lock_blocking(file: &File, lock: LockType, path: &Path) -> Result<()> {
    let fl = whole_file_flock(lock);

    loop {
        // SAFETY: fd is owned by `file` and fl points at a fully initialized
        // flock struct for the duration of the call.
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &fl) };
        if ret != -1 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        ensure!(
            err.raw_os_error() == Some(libc::EINTR),
            "fcntl(F_SETLKW, {:?}) failed for {:?}: {}",
            lock,
            path,
            err
        );
    }
}

/// Non-blocking probe: `Ok(false)` when the lock is held elsewhere.
pub(crate) fn try_lock(file: &File, lock: LockType, path: &Path) -> Result<bool> {
    let fl = whole_file_flock(lock);

    // SAFETY: same contract as in set_lock_blocking.
    let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) };
    if ret != -1 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
        _ => Err(err).wrap_err_with(|| format!("fcntl(F_SETLK, {:?}) failed for {:?}", lock, path)),
    }
}

/// Exclusive lock over a mailbox directory's index-creation critical section.
/// Released on drop (or when the owning process dies).
#[derive(Debug)]
pub struct DirLock {
    file: File,
}

const DIR_LOCK_FILE: &str = ".mailidx.dirlock";

impl DirLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(DIR_LOCK_FILE);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open directory lock {:?}", path))?;

        set_lock_blocking(&file, LockType::Exclusive, &path)?;
        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // closing the fd drops the fcntl lock; the explicit unlock just makes
        // the release immediate when the File has clones
        let fl = whole_file_flock(LockType::Unlock);
        // SAFETY: fd is still owned by self.file at this point.
        unsafe {
            libc::fcntl(self.file.as_raw_fd(), libc::F_SETLK, &fl);
        }
    }
}
