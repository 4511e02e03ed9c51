//! Memoized URL to file resolution
//!
//! The cache remembers *which* path answers a URL (the file itself, or the
//! index candidates of a directory). Metadata is re-read on every hit so a
//! changed or removed file is noticed on the next request.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{fs, sync::Mutex as AsyncMutex};

/// Stat result for one filesystem path.
#[derive(Debug, Clone)]
pub(crate) struct FileEntry {
    path: PathBuf,
    suffix: String,
    len: u64,
    exists: bool,
}

impl FileEntry {
    async fn stat(path: PathBuf) -> Self {
        let suffix = suffix_of(&path).to_owned();
        let mut entry = Self {
            path,
            suffix,
            len: 0,
            exists: false,
        };

        entry.renew().await;
        entry
    }

    async fn renew(&mut self) {
        match fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => {
                self.exists = true;
                self.len = meta.len();
            }
            _ => {
                self.exists = false;
                self.len = 0;
            }
        }
    }

    #[inline(always)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// File suffix including the leading dot, empty when there is none.
    #[inline(always)]
    pub(crate) fn suffix(&self) -> &str {
        &self.suffix
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> u64 {
        self.len
    }
}

fn suffix_of(path: &Path) -> &str {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.rfind('.').map(|i| &name[i..]))
        .unwrap_or("")
}

#[derive(Debug)]
enum Resolution {
    File(FileEntry),
    /// Index candidates of a directory, in configured order.
    Index(Vec<FileEntry>),
}

#[derive(Debug)]
pub(crate) struct FileCache {
    root: String,
    indexes: Vec<String>,
    entries: Mutex<HashMap<String, Arc<AsyncMutex<Resolution>>>>,
}

impl FileCache {
    pub(crate) fn new(root: &str, indexes: &[String]) -> Self {
        Self {
            root: root.to_owned(),
            indexes: indexes.to_vec(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<Resolution>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves `url` to an existing regular file under the root.
    pub(crate) async fn lookup(&self, url: &str) -> Option<FileEntry> {
        if url.split('/').any(|segment| segment == "..") {
            return None;
        }

        let cached = self.entries().get(url).cloned();

        match cached {
            Some(resolution) => self.revalidate(url, &resolution).await,
            None => self.resolve(url).await,
        }
    }

    async fn revalidate(&self, url: &str, resolution: &AsyncMutex<Resolution>) -> Option<FileEntry> {
        let mut resolution = resolution.lock().await;

        let (found, vanished) = match &mut *resolution {
            Resolution::File(entry) => {
                entry.renew().await;
                (entry.exists.then(|| entry.clone()), !entry.exists)
            }
            Resolution::Index(candidates) => {
                for candidate in candidates.iter_mut() {
                    candidate.renew().await;
                }
                (candidates.iter().find(|c| c.exists).cloned(), false)
            }
        };

        drop(resolution);

        if vanished {
            self.entries().remove(url);
        }

        found
    }

    async fn resolve(&self, url: &str) -> Option<FileEntry> {
        let full = format!("{}{}", self.root, url);
        let meta = fs::metadata(&full).await.ok()?;

        let (found, resolution) = if meta.is_file() {
            let entry = FileEntry::stat(PathBuf::from(full)).await;
            (entry.exists.then(|| entry.clone()), Resolution::File(entry))
        } else if meta.is_dir() {
            let separator = if url.ends_with('/') { "" } else { "/" };

            let mut candidates = Vec::with_capacity(self.indexes.len());
            for index in &self.indexes {
                let path = PathBuf::from(format!("{full}{separator}{index}"));
                candidates.push(FileEntry::stat(path).await);
            }

            let found = candidates.iter().find(|c| c.exists).cloned();
            (found, Resolution::Index(candidates))
        } else {
            return None;
        };

        // An unresolvable directory is walked again next time
        if found.is_some() {
            self.entries()
                .entry(url.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(resolution)));
        }

        found
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.entries().len()
    }
}
