//! Atomic operations over the page store.

use std::{borrow::Cow, collections::hash_map::Entry, mem, sync::Arc};

use anyhow::Result;
use fxhash::FxHashMap;
use locmap_core::Page;

use super::{FileId, Frame, PageStore, WriterGuard};
use crate::{error::StoreError, metrics::Metric};

struct DirtyPage {
    page: Box<Page>,
    frame: Arc<Frame>,
    // released after publication.
    guard: WriterGuard,
}

struct Appended {
    // released after publication.
    guard: WriterGuard,
    base: u64,
    pages: Vec<Box<Page>>,
}

/// A scope in which pages are read and written.
///
/// Writes go to private copies of the pages, which are published together by
/// [`AtomicOperation::commit`]. Until then other operations keep reading the committed pages,
/// while writers of a page this operation writes to wait for it to finish. Dropping the operation
/// without committing discards every write and removes the files it created.
///
/// Reads see the store as of a snapshot: the commits finished when the operation began or, once
/// it has locked a page for writing or appended to a file, when it last did so. Later commits
/// stay invisible to it.
///
/// Commit guarantees that either all or none of the writes become visible in the store. It does
/// not guarantee the same for the durable copy: a failure in the middle of writing through to
/// the backend may leave some pages written.
pub struct AtomicOperation {
    store: PageStore,
    snapshot: u64,
    dirty: FxHashMap<(FileId, u64), DirtyPage>,
    appended: FxHashMap<FileId, Appended>,
    created_files: Vec<FileId>,
    deleted_files: Vec<FileId>,
    committed: bool,
}

impl AtomicOperation {
    pub(super) fn new(store: PageStore) -> Self {
        AtomicOperation {
            snapshot: store.take_snapshot(),
            store,
            dirty: FxHashMap::default(),
            appended: FxHashMap::default(),
            created_files: Vec::new(),
            deleted_files: Vec::new(),
            committed: false,
        }
    }

    /// The store this operation runs against.
    pub fn store(&self) -> &PageStore {
        &self.store
    }

    fn is_deleted(&self, file: FileId) -> bool {
        self.deleted_files.contains(&file)
    }

    fn check_file(&self, file: FileId) -> Result<()> {
        if self.is_deleted(file) {
            return Err(StoreError::UnknownFile(file).into());
        }
        Ok(())
    }

    /// Create a new, empty file. The file is removed again if the operation rolls back.
    pub fn add_file(&mut self, name: &str) -> Result<FileId> {
        let file = self.store.add_file(name)?;
        self.created_files.push(file);
        Ok(file)
    }

    /// Open an existing file by name, or return the id it is already open under.
    pub fn load_file(&mut self, name: &str) -> Result<FileId> {
        match self.store.file_id(name) {
            Some(file) if self.is_deleted(file) => {
                Err(StoreError::FileNotFound(name.to_string()).into())
            }
            _ => self.store.load_file(name),
        }
    }

    /// Whether a file exists, as seen from this operation.
    pub fn file_exists(&self, name: &str) -> Result<bool> {
        match self.store.file_id(name) {
            Some(file) if self.is_deleted(file) => Ok(false),
            _ => self.store.file_exists(name),
        }
    }

    /// Schedule a file for deletion at commit. The file is unusable in this operation from now
    /// on; pending writes to it are dropped.
    pub fn delete_file(&mut self, file: FileId) -> Result<()> {
        self.check_file(file)?;
        // fail early on unknown files.
        self.store.frames(file)?;

        self.dirty.retain(|(dirty_file, _), _| *dirty_file != file);
        self.appended.remove(&file);
        self.deleted_files.push(file);
        Ok(())
    }

    /// The number of pages of the file, including the ones appended by this operation.
    pub fn filled_up_to(&self, file: FileId) -> Result<u64> {
        self.check_file(file)?;
        match self.appended.get(&file) {
            Some(appended) => Ok(appended.base + appended.pages.len() as u64),
            None => Ok(self.store.frames(file)?.len()),
        }
    }

    /// Append a zeroed page to the file. Returns its index and the page for writing.
    ///
    /// The first append to a file locks the end of that file for the rest of the operation.
    pub fn add_page(&mut self, file: FileId) -> Result<(u64, &mut Page)> {
        self.check_file(file)?;
        let appended = match self.appended.entry(file) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (guard, base) = self.store.lock_tail(file)?;
                self.snapshot = self.store.refresh_snapshot(self.snapshot);
                entry.insert(Appended {
                    guard,
                    base,
                    pages: Vec::new(),
                })
            }
        };

        self.store.shared.metrics.count(Metric::PageAllocations);
        let index = appended.base + appended.pages.len() as u64;
        appended.pages.push(Box::new(Page::zeroed()));
        // UNWRAP: just pushed.
        let page = appended.pages.last_mut().unwrap();
        Ok((index, &mut **page))
    }

    /// Read a page. Pages written by this operation are seen with their pending changes.
    pub fn load_page_for_read(&self, file: FileId, index: u64) -> Result<Cow<'_, Page>> {
        self.check_file(file)?;
        if let Some(appended) = self.appended.get(&file) {
            if index >= appended.base {
                return match appended.pages.get((index - appended.base) as usize) {
                    Some(page) => Ok(Cow::Borrowed(&**page)),
                    None => Err(self.out_of_bounds(file, index)),
                };
            }
        }
        if let Some(dirty) = self.dirty.get(&(file, index)) {
            return Ok(Cow::Borrowed(&*dirty.page));
        }
        Ok(Cow::Owned(self.store.read_page(file, index, self.snapshot)?))
    }

    /// Lock a page for writing for the rest of the operation and return the private copy.
    pub fn load_page_for_write(&mut self, file: FileId, index: u64) -> Result<&mut Page> {
        self.check_file(file)?;
        if let Some(appended) = self.appended.get(&file) {
            if index >= appended.base
                && (index - appended.base) as usize >= appended.pages.len()
            {
                return Err(self.out_of_bounds(file, index));
            }
        }
        if let Some(appended) = self.appended.get_mut(&file) {
            if index >= appended.base {
                let page = &mut appended.pages[(index - appended.base) as usize];
                return Ok(&mut **page);
            }
        }

        match self.dirty.entry((file, index)) {
            Entry::Occupied(entry) => Ok(&mut *entry.into_mut().page),
            Entry::Vacant(entry) => {
                let (frame, guard, page) = self.store.lock_page(file, index)?;
                self.snapshot = self.store.refresh_snapshot(self.snapshot);
                let dirty = entry.insert(DirtyPage {
                    page: Box::new(page),
                    frame,
                    guard,
                });
                Ok(&mut *dirty.page)
            }
        }
    }

    fn out_of_bounds(&self, file: FileId, index: u64) -> anyhow::Error {
        let name = self.store.file_name(file).unwrap_or_default();
        let len = self.filled_up_to(file).unwrap_or_default();
        StoreError::PageOutOfBounds { name, index, len }.into()
    }

    /// Publish every write of this operation.
    pub fn commit(mut self) -> Result<()> {
        let store = self.store.clone();
        let metrics = store.metrics();
        let _timer = metrics.record(Metric::CommitTime);

        let mut dirty: Vec<_> = mem::take(&mut self.dirty).into_iter().collect();
        dirty.sort_unstable_by_key(|(key, _)| *key);
        let mut appended: Vec<_> = mem::take(&mut self.appended).into_iter().collect();
        appended.sort_unstable_by_key(|(file, _)| *file);
        let deleted = mem::take(&mut self.deleted_files);

        let storage = &store.shared.storage;
        let mut touched = Vec::new();
        for ((file, index), page) in &dirty {
            let name = store.file_name(*file)?;
            storage.write_page(&name, *index, &page.page)?;
            if touched.last() != Some(file) {
                touched.push(*file);
            }
        }
        for (file, appended) in &appended {
            let name = store.file_name(*file)?;
            for (i, page) in appended.pages.iter().enumerate() {
                storage.write_page(&name, appended.base + i as u64, page)?;
            }
            if !touched.contains(file) {
                touched.push(*file);
            }
        }
        if store.shared.fsync_on_commit {
            for file in &touched {
                store.flush_file(*file)?;
            }
        }

        // from here on nothing fails but for vanished files.
        self.committed = true;
        store.release_snapshot(self.snapshot);

        let pages_written = dirty.len();
        let mut pages_appended = 0;
        let mut guards = Vec::with_capacity(dirty.len() + appended.len());
        {
            let mut epoch = store.shared.epoch.write();
            let next = *epoch + 1;
            let oldest = store.oldest_snapshot().unwrap_or(next);
            for (file, mut appended) in appended {
                pages_appended += appended.pages.len();
                store.publish_appended(file, mem::take(&mut appended.pages), next)?;
                guards.push(appended.guard);
            }
            for (_, DirtyPage { page, frame, guard }) in dirty {
                frame.publish(next, *page, oldest);
                guards.push(guard);
            }
            *epoch = next;
        }
        // released once the epoch is visible, so the next writer's snapshot covers it.
        drop(guards);

        for file in deleted {
            store.remove_file(file)?;
        }

        metrics.count(Metric::Commits);
        tracing::trace!(pages_written, pages_appended, "committed atomic operation");
        Ok(())
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.store.release_snapshot(self.snapshot);

        self.dirty.clear();
        self.appended.clear();
        for file in mem::take(&mut self.created_files) {
            if let Err(e) = self.store.remove_file(file) {
                tracing::warn!(?file, "failed to remove file on rollback: {e}");
            }
        }
        self.store.shared.metrics.count(Metric::Rollbacks);
        tracing::trace!("rolled back atomic operation");
    }
}
