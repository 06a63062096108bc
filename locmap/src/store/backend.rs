//! The durability seam of the page store.

use anyhow::Result;
use dashmap::DashMap;
use locmap_core::Page;

use crate::error::StoreError;

/// Where the pages of the store live between processes.
///
/// The page store keeps every open file in memory and calls into the backend to create and
/// remove files, to load a file when it is first opened and to write through every page an
/// atomic operation commits. Implementations are keyed by file name.
pub trait Storage: Send + Sync {
    /// Whether a file with this name exists.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Create an empty file. Fails with [`StoreError::FileExists`] if the name is taken.
    fn create_file(&self, name: &str) -> Result<()>;

    /// Read every page of an existing file.
    fn open_file(&self, name: &str) -> Result<Vec<Page>>;

    /// Write a page, extending the file if `index` is one past its end.
    fn write_page(&self, name: &str, index: u64, page: &Page) -> Result<()>;

    /// Make every page written so far durable.
    fn sync(&self, name: &str) -> Result<()>;

    /// Remove a file.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// Give a file a new name. Fails with [`StoreError::FileExists`] if the new name is taken.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;
}

/// Keeps the files of the store in process memory. Nothing survives the process, but files
/// closed by the store can be opened again.
#[derive(Default)]
pub struct MemoryStorage {
    files: DashMap<String, Vec<Page>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.files.contains_key(name))
    }

    fn create_file(&self, name: &str) -> Result<()> {
        match self.files.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::FileExists(name.to_string()).into())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Vec::new());
                Ok(())
            }
        }
    }

    fn open_file(&self, name: &str) -> Result<Vec<Page>> {
        match self.files.get(name) {
            Some(pages) => Ok(pages.clone()),
            None => Err(StoreError::FileNotFound(name.to_string()).into()),
        }
    }

    fn write_page(&self, name: &str, index: u64, page: &Page) -> Result<()> {
        let mut pages = self
            .files
            .get_mut(name)
            .ok_or_else(|| StoreError::FileNotFound(name.to_string()))?;
        let len = pages.len() as u64;
        if index < len {
            pages[index as usize] = page.clone();
        } else if index == len {
            pages.push(page.clone());
        } else {
            return Err(StoreError::PageOutOfBounds {
                name: name.to_string(),
                index,
                len,
            }
            .into());
        }
        Ok(())
    }

    fn sync(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match self.files.remove(name) {
            Some(_) => Ok(()),
            None => Err(StoreError::FileNotFound(name.to_string()).into()),
        }
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        if self.files.contains_key(new_name) {
            return Err(StoreError::FileExists(new_name.to_string()).into());
        }
        let (_, pages) = self
            .files
            .remove(old_name)
            .ok_or_else(|| StoreError::FileNotFound(old_name.to_string()))?;
        self.files.insert(new_name.to_string(), pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(byte: u8) -> Page {
        let mut page = Page::zeroed();
        page[0] = byte;
        page
    }

    #[test]
    fn pages_are_kept_per_file() {
        let storage = MemoryStorage::new();
        storage.create_file("a").unwrap();
        storage.write_page("a", 0, &page_with(1)).unwrap();
        storage.write_page("a", 1, &page_with(2)).unwrap();
        storage.write_page("a", 0, &page_with(3)).unwrap();

        let pages = storage.open_file("a").unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0][0], 3);
        assert_eq!(pages[1][0], 2);
    }

    #[test]
    fn writes_may_not_leave_holes() {
        let storage = MemoryStorage::new();
        storage.create_file("a").unwrap();
        let err = storage.write_page("a", 1, &page_with(1)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::PageOutOfBounds { index: 1, len: 0, .. })
        ));
    }

    #[test]
    fn rename_and_delete() {
        let storage = MemoryStorage::new();
        storage.create_file("a").unwrap();
        storage.create_file("b").unwrap();
        assert!(storage.create_file("a").is_err());
        assert!(storage.rename_file("a", "b").is_err());

        storage.rename_file("a", "c").unwrap();
        assert!(!storage.exists("a").unwrap());
        assert!(storage.exists("c").unwrap());

        storage.delete_file("c").unwrap();
        assert!(!storage.exists("c").unwrap());
        assert!(storage.open_file("c").is_err());
    }
}
