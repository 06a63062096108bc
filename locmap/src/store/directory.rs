//! A storage backend keeping one OS file per page file in a directory.

use std::{
    fs::{self, File, OpenOptions},
    io::ErrorKind,
    os::unix::fs::FileExt as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use dashmap::DashMap;
use locmap_core::{Page, PAGE_SIZE};

use super::{backend::Storage, flock::Flock};
use crate::error::StoreError;

const LOCK_FILENAME: &str = "LOCK";

/// Stores every page file as `<dir>/<name>`, page `i` at byte offset `i * PAGE_SIZE`.
///
/// The directory is locked for the lifetime of the backend.
pub struct DirectoryStorage {
    dir: PathBuf,
    handles: DashMap<String, Arc<File>>,
    // keep alive.
    #[allow(unused)]
    flock: Flock,
}

impl DirectoryStorage {
    /// Open the directory, creating it if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "creating store directory");
            fs::create_dir_all(dir)?;
        }
        let flock = Flock::lock(dir, LOCK_FILENAME)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            handles: DashMap::new(),
            flock,
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn handle(&self, name: &str) -> Result<Arc<File>> {
        if let Some(handle) = self.handles.get(name) {
            return Ok(handle.clone());
        }
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path(name))
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::FileNotFound(name.to_string()).into())
            }
            Err(e) => return Err(e.into()),
        };
        let handle = Arc::new(file);
        self.handles.insert(name.to_string(), handle.clone());
        Ok(handle)
    }
}

impl Storage for DirectoryStorage {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(name != LOCK_FILENAME && self.path(name).try_exists()?)
    }

    fn create_file(&self, name: &str) -> Result<()> {
        if name == LOCK_FILENAME {
            return Err(StoreError::FileExists(name.to_string()).into());
        }
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.path(name))
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::FileExists(name.to_string()).into())
            }
            Err(e) => return Err(e.into()),
        };
        self.handles.insert(name.to_string(), Arc::new(file));
        Ok(())
    }

    fn open_file(&self, name: &str) -> Result<Vec<Page>> {
        let file = self.handle(name)?;
        // a torn trailing page is ignored.
        let len = file.metadata()?.len() / PAGE_SIZE as u64;
        let mut pages = Vec::with_capacity(len as usize);
        for index in 0..len {
            let mut page = Page::zeroed();
            file.read_exact_at(&mut page[..], index * PAGE_SIZE as u64)?;
            pages.push(page);
        }
        Ok(pages)
    }

    fn write_page(&self, name: &str, index: u64, page: &Page) -> Result<()> {
        let file = self.handle(name)?;
        file.write_all_at(&page[..], index * PAGE_SIZE as u64)?;
        Ok(())
    }

    fn sync(&self, name: &str) -> Result<()> {
        self.handle(name)?.sync_data()?;
        Ok(())
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.handles.remove(name);
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::FileNotFound(name.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        if self.exists(new_name)? || new_name == LOCK_FILENAME {
            return Err(StoreError::FileExists(new_name.to_string()).into());
        }
        self.handles.remove(old_name);
        fs::rename(self.path(old_name), self.path(new_name))?;
        Ok(())
    }
}
