//! The page store: named files of fixed-size pages, accessed through atomic operations.
//!
//! Every open file is kept in memory as a list of page frames. A frame holds the committed
//! versions of its page, each tagged with the epoch of the commit that produced it. Every commit
//! publishes all of its pages under one new epoch, and an atomic operation reads the newest
//! versions no later than its snapshot epoch, so it sees every commit either completely or not
//! at all. Readers never wait for writers.
//!
//! An atomic operation writing to a page takes the frame's writer lock and keeps it until it
//! commits or rolls back. Taking a writer lock moves the operation's snapshot to the latest
//! epoch, so the pages it reads are never older than the pages it locked. Pages are written
//! through to a [`Storage`] backend when an operation commits.

use std::{
    collections::{btree_map, BTreeMap},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use anyhow::Result;
use dashmap::DashMap;
use locmap_core::Page;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};

use crate::{
    error::StoreError,
    metrics::{Metric, Metrics},
    Options,
};

pub use self::atomic::AtomicOperation;
pub use self::backend::{MemoryStorage, Storage};
pub use self::directory::DirectoryStorage;

mod atomic;
mod backend;
mod directory;
mod flock;

/// Identifies an open file of a [`PageStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

type WriterGuard = ArcMutexGuard<RawMutex, ()>;

/// This is a lightweight handle and can be cloned cheaply.
#[derive(Clone)]
pub struct PageStore {
    shared: Arc<Shared>,
}

struct Shared {
    storage: Box<dyn Storage>,
    files: DashMap<FileId, Arc<FileFrames>>,
    names: DashMap<String, FileId>,
    next_file_id: AtomicU32,
    fsync_on_commit: bool,
    metrics: Metrics,
    // the epoch of the last commit. Commits publish under the write lock.
    epoch: RwLock<u64>,
    // snapshot epochs in use, with the number of operations reading at each.
    snapshots: Mutex<BTreeMap<u64, usize>>,
}

struct Version {
    epoch: u64,
    page: Page,
}

struct Frame {
    // ascending by epoch, never empty.
    versions: RwLock<Vec<Version>>,
    // held by the one operation allowed to write the page.
    writer: Arc<Mutex<()>>,
}

impl Frame {
    fn new(page: Page, epoch: u64) -> Arc<Self> {
        Arc::new(Frame {
            versions: RwLock::new(vec![Version { epoch, page }]),
            writer: Arc::new(Mutex::new(())),
        })
    }

    /// The newest version committed no later than `snapshot`.
    fn read_at(&self, snapshot: u64) -> Option<Page> {
        self.versions
            .read()
            .iter()
            .rev()
            .find(|version| version.epoch <= snapshot)
            .map(|version| version.page.clone())
    }

    fn latest(&self) -> Page {
        // UNWRAP: a frame is created with a version and pruning keeps at least one.
        self.versions.read().last().unwrap().page.clone()
    }

    /// Add the version committed at `epoch` and drop the versions no snapshot from `oldest` on
    /// can see.
    fn publish(&self, epoch: u64, page: Page, oldest: u64) {
        let mut versions = self.versions.write();
        versions.push(Version { epoch, page });
        let keep_from = versions
            .iter()
            .rposition(|version| version.epoch <= oldest)
            .unwrap_or(0);
        versions.drain(..keep_from);
    }

    #[cfg(test)]
    fn version_count(&self) -> usize {
        self.versions.read().len()
    }
}

struct FileFrames {
    name: RwLock<String>,
    pages: RwLock<Vec<Arc<Frame>>>,
    // held by the one operation allowed to append pages.
    tail: Arc<Mutex<()>>,
}

impl FileFrames {
    fn new(name: String, pages: Vec<Page>) -> Self {
        FileFrames {
            name: RwLock::new(name),
            // loaded pages are visible to every snapshot.
            pages: RwLock::new(pages.into_iter().map(|page| Frame::new(page, 0)).collect()),
            tail: Arc::new(Mutex::new(())),
        }
    }

    fn name(&self) -> String {
        self.name.read().clone()
    }

    fn len(&self) -> u64 {
        self.pages.read().len() as u64
    }

    fn frame(&self, index: u64) -> Result<Arc<Frame>> {
        let pages = self.pages.read();
        match pages.get(index as usize) {
            Some(frame) => Ok(frame.clone()),
            None => Err(StoreError::PageOutOfBounds {
                name: self.name(),
                index,
                len: pages.len() as u64,
            }
            .into()),
        }
    }
}

impl PageStore {
    /// Open a store with the provided `Options`.
    pub fn open(o: &Options) -> Result<Self> {
        let storage: Box<dyn Storage> = match o.path {
            Some(ref path) => Box::new(DirectoryStorage::open(path)?),
            None => Box::new(MemoryStorage::new()),
        };
        Ok(Self::with_storage(storage, o))
    }

    /// Open a store on top of a custom backend. `Options::path` is ignored.
    pub fn with_storage(storage: Box<dyn Storage>, o: &Options) -> Self {
        PageStore {
            shared: Arc::new(Shared {
                storage,
                files: DashMap::new(),
                names: DashMap::new(),
                next_file_id: AtomicU32::new(0),
                fsync_on_commit: o.fsync_on_commit,
                metrics: Metrics::new(o.metrics),
                epoch: RwLock::new(0),
                snapshots: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Start an atomic operation. Nothing it writes is visible to others before
    /// [`AtomicOperation::commit`]. Dropping it uncommitted rolls it back.
    pub fn begin_atomic_operation(&self) -> AtomicOperation {
        AtomicOperation::new(self.clone())
    }

    /// Run `f` inside a fresh atomic operation, committing it if `f` succeeds and rolling it
    /// back otherwise.
    pub fn execute_inside_atomic_operation<T>(
        &self,
        f: impl FnOnce(&mut AtomicOperation) -> Result<T>,
    ) -> Result<T> {
        let mut op = self.begin_atomic_operation();
        let value = f(&mut op)?;
        op.commit()?;
        Ok(value)
    }

    /// Whether a file with this name exists, open or not.
    pub fn file_exists(&self, name: &str) -> Result<bool> {
        if self.shared.names.contains_key(name) {
            return Ok(true);
        }
        self.shared.storage.exists(name)
    }

    /// The id of an open file.
    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.shared.names.get(name).map(|id| *id)
    }

    /// The current name of an open file.
    pub fn file_name(&self, file: FileId) -> Result<String> {
        Ok(self.frames(file)?.name())
    }

    /// Rename an open file. Its id stays the same.
    pub fn rename_file(&self, file: FileId, new_name: &str) -> Result<()> {
        let frames = self.frames(file)?;
        let mut name = frames.name.write();
        if *name == new_name {
            return Ok(());
        }
        if self.file_exists(new_name)? {
            return Err(StoreError::FileExists(new_name.to_string()).into());
        }

        self.shared.storage.rename_file(&name, new_name)?;
        self.shared.names.remove(name.as_str());
        self.shared.names.insert(new_name.to_string(), file);
        tracing::debug!(old = %*name, new = new_name, "renamed file");
        *name = new_name.to_string();
        Ok(())
    }

    /// Make every committed page of an open file durable.
    pub fn flush_file(&self, file: FileId) -> Result<()> {
        let name = self.file_name(file)?;
        self.shared.storage.sync(&name)
    }

    /// Make every committed page of every open file durable.
    pub fn flush(&self) -> Result<()> {
        let files: Vec<FileId> = self.shared.files.iter().map(|entry| *entry.key()).collect();
        for file in files {
            self.flush_file(file)?;
        }
        Ok(())
    }

    /// Close an open file, optionally flushing it first. Its id becomes invalid; the file can
    /// be loaded again by name.
    pub fn close_file(&self, file: FileId, flush: bool) -> Result<()> {
        if flush {
            self.flush_file(file)?;
        }
        let (_, frames) = self
            .shared
            .files
            .remove(&file)
            .ok_or(StoreError::UnknownFile(file))?;
        let name = frames.name();
        self.shared.names.remove(&name);
        tracing::debug!(name = %name, "closed file");
        Ok(())
    }

    /// The metrics collected by this store.
    pub fn metrics(&self) -> Metrics {
        self.shared.metrics.clone()
    }

    fn frames(&self, file: FileId) -> Result<Arc<FileFrames>> {
        match self.shared.files.get(&file) {
            Some(frames) => Ok(frames.clone()),
            None => Err(StoreError::UnknownFile(file).into()),
        }
    }

    fn register(&self, name: &str, pages: Vec<Page>) -> FileId {
        let file = FileId(self.shared.next_file_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .files
            .insert(file, Arc::new(FileFrames::new(name.to_string(), pages)));
        self.shared.names.insert(name.to_string(), file);
        file
    }

    fn add_file(&self, name: &str) -> Result<FileId> {
        if self.file_exists(name)? {
            return Err(StoreError::FileExists(name.to_string()).into());
        }
        self.shared.storage.create_file(name)?;
        tracing::debug!(name, "created file");
        Ok(self.register(name, Vec::new()))
    }

    fn load_file(&self, name: &str) -> Result<FileId> {
        if let Some(file) = self.file_id(name) {
            return Ok(file);
        }
        if !self.shared.storage.exists(name)? {
            return Err(StoreError::FileNotFound(name.to_string()).into());
        }
        let pages = self.shared.storage.open_file(name)?;
        tracing::debug!(name, pages = pages.len(), "opened file");
        Ok(self.register(name, pages))
    }

    fn remove_file(&self, file: FileId) -> Result<()> {
        let (_, frames) = self
            .shared
            .files
            .remove(&file)
            .ok_or(StoreError::UnknownFile(file))?;
        let name = frames.name();
        self.shared.names.remove(&name);
        self.shared.storage.delete_file(&name)?;
        tracing::debug!(name = %name, "deleted file");
        Ok(())
    }

    /// Register a reader at the current epoch.
    fn take_snapshot(&self) -> u64 {
        // registered under the epoch lock, so no commit prunes what the snapshot sees.
        let epoch = self.shared.epoch.read();
        *self.shared.snapshots.lock().entry(*epoch).or_default() += 1;
        *epoch
    }

    fn release_snapshot(&self, snapshot: u64) {
        let mut snapshots = self.shared.snapshots.lock();
        if let btree_map::Entry::Occupied(mut entry) = snapshots.entry(snapshot) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }

    /// Move a snapshot to the current epoch.
    fn refresh_snapshot(&self, snapshot: u64) -> u64 {
        let refreshed = self.take_snapshot();
        self.release_snapshot(snapshot);
        refreshed
    }

    /// The oldest snapshot in use. Called with the epoch lock held.
    fn oldest_snapshot(&self) -> Option<u64> {
        self.shared
            .snapshots
            .lock()
            .first_key_value()
            .map(|(epoch, _)| *epoch)
    }

    fn read_page(&self, file: FileId, index: u64, snapshot: u64) -> Result<Page> {
        let frames = self.frames(file)?;
        let frame = frames.frame(index)?;
        self.shared.metrics.count(Metric::PageReads);
        match frame.read_at(snapshot) {
            Some(page) => Ok(page),
            // appended after the snapshot.
            None => Err(StoreError::PageOutOfBounds {
                name: frames.name(),
                index,
                len: index,
            }
            .into()),
        }
    }

    /// Take the writer lock of a page and copy its latest committed content.
    fn lock_page(&self, file: FileId, index: u64) -> Result<(Arc<Frame>, WriterGuard, Page)> {
        let frame = self.frames(file)?.frame(index)?;
        self.shared.metrics.count(Metric::PageWrites);
        let guard = frame.writer.lock_arc();
        let page = frame.latest();
        Ok((frame, guard, page))
    }

    fn lock_tail(&self, file: FileId) -> Result<(WriterGuard, u64)> {
        let frames = self.frames(file)?;
        let guard = frames.tail.lock_arc();
        // nobody else appends while the tail is held.
        Ok((guard, frames.len()))
    }

    fn publish_appended(&self, file: FileId, pages: Vec<Box<Page>>, epoch: u64) -> Result<()> {
        let frames = self.frames(file)?;
        let mut frame_pages = frames.pages.write();
        frame_pages.extend(pages.into_iter().map(|page| Frame::new(*page, epoch)));
        Ok(())
    }
}
