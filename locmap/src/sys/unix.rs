//! Advisory file locks through `flock(2)`.

use std::{fs::File, io, os::fd::AsRawFd as _};

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    // SAFETY: the descriptor is owned by `file` and stays open for the duration of the call.
    let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Take an exclusive lock on `file` without blocking. Fails with `EWOULDBLOCK` if another open
/// file description holds it.
pub fn try_lock_exclusive(file: &File) -> io::Result<()> {
    flock(file, libc::LOCK_EX | libc::LOCK_NB)
}

pub fn unlock(file: &File) -> io::Result<()> {
    flock(file, libc::LOCK_UN)
}
