//! An advisory lock on the directory holding the page files.

use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use crate::sys::unix;

/// Held for as long as a [`super::DirectoryStorage`] lives. A second store on the same
/// directory fails to open.
pub struct Flock {
    lock_fd: File,
}

impl Flock {
    pub fn lock(dir: &Path, lock_filename: &str) -> anyhow::Result<Self> {
        let lock_path = dir.join(lock_filename);

        let lock_fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        match unix::try_lock_exclusive(&lock_fd) {
            Ok(()) => Ok(Self { lock_fd }),
            Err(err) => {
                anyhow::bail!("Failed to lock directory {}: {err}", dir.display());
            }
        }
    }
}

impl Drop for Flock {
    fn drop(&mut self) {
        if let Err(e) = unix::unlock(&self.lock_fd) {
            tracing::warn!("Failed to unlock directory lock: {e}");
        }
    }
}
