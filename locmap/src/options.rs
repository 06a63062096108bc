use std::path::PathBuf;

/// Options when opening a [`crate::PageStore`].
#[derive(Clone)]
pub struct Options {
    /// The directory holding the page files. `None` keeps every file in memory.
    pub(crate) path: Option<PathBuf>,
    /// Whether every commit syncs the files it touched.
    pub(crate) fsync_on_commit: bool,
    /// Enable or disable metrics collection.
    pub(crate) metrics: bool,
}

impl Options {
    /// Create a new `Options` instance with the default values: in memory, no fsync on commit,
    /// no metrics.
    pub fn new() -> Self {
        Self {
            path: None,
            fsync_on_commit: false,
            metrics: false,
        }
    }

    /// Set the path to the directory where the page files are stored.
    ///
    /// The directory is created if it does not exist and locked for the lifetime of the store.
    pub fn path(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    /// Keep every page file in memory. This is the default.
    pub fn in_memory(&mut self) {
        self.path = None;
    }

    /// Set whether a commit syncs the files it wrote to before returning.
    ///
    /// Without it, durability is reached by [`crate::PageStore::flush`] or by closing files
    /// with flushing enabled.
    ///
    /// Default: off.
    pub fn fsync_on_commit(&mut self, fsync_on_commit: bool) {
        self.fsync_on_commit = fsync_on_commit;
    }

    /// Set metrics collection on or off.
    ///
    /// Default: off.
    pub fn metrics(&mut self, metrics: bool) {
        self.metrics = metrics;
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
