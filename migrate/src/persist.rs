//! Durable JSON documents.
//!
//! Every document is rewritten as a whole after each mutation. Writes go to a temporary file in
//! the same directory which is synced and renamed over the target, so a crash leaves either the
//! previous or the new content on disk, never a torn write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::MigrateResult;

/// Atomically replaces the content of `path` with `content`.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    let tmp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("document"),
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    );
    let tmp_path = parent.join(tmp_name);

    {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    sync_parent_dir(parent)?;

    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically to `path`.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> MigrateResult<()> {
    let mut content = serde_json::to_vec_pretty(value)?;
    content.push(b'\n');
    atomic_write_file(path, &content)?;

    Ok(())
}

/// Reads a JSON document, returning `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> MigrateResult<Option<T>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    Ok(Some(serde_json::from_slice(&content)?))
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A value that is persisted to disk every time it is written.
///
/// Reads are served from memory. Writes go through [`WatchedDocument::update`], which applies the
/// change and rewrites the whole document while still holding the lock, so concurrent writers are
/// serialized and the file always reflects the latest in-memory value.
#[derive(Debug)]
pub struct WatchedDocument<T> {
    value: Mutex<T>,
    path: Option<PathBuf>,
}

impl<T> WatchedDocument<T>
where
    T: Serialize + DeserializeOwned + Default + Clone,
{
    /// Loads the document from `path`, or starts from the default value when it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> MigrateResult<Self> {
        let path = path.into();
        let value = read_json(&path)?.unwrap_or_default();
        debug!(path = %path.display(), "opened watched document");

        Ok(Self {
            value: Mutex::new(value),
            path: Some(path),
        })
    }

    /// Creates a document that is never written to disk.
    pub fn in_memory(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        lock(&self.value).clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&lock(&self.value))
    }

    /// Applies `f` to the value and persists the result.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> MigrateResult<R> {
        let mut value = lock(&self.value);
        let result = f(&mut value);
        if let Some(path) = &self.path {
            write_json(path, &*value)?;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Document {
        id: String,
        count: u32,
    }

    #[test]
    fn atomic_write_replaces_content_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write_file(&path, b"first").unwrap();
        atomic_write_file(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn read_json_of_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<Document> = read_json(&dir.path().join("missing.json")).unwrap();

        assert!(value.is_none());
    }

    #[test]
    fn every_update_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");

        let document = WatchedDocument::<Document>::open(&path).unwrap();
        document
            .update(|doc| doc.id = "ocid1.compartment".to_owned())
            .unwrap();
        document.update(|doc| doc.count += 1).unwrap();

        let reopened = WatchedDocument::<Document>::open(&path).unwrap();
        assert_eq!(
            reopened.get(),
            Document {
                id: "ocid1.compartment".to_owned(),
                count: 1
            }
        );
    }

    #[test]
    fn in_memory_documents_do_not_touch_disk() {
        let document = WatchedDocument::in_memory(Document::default());
        let count = document.update(|doc| {
            doc.count = 7;
            doc.count
        });

        assert_eq!(count.unwrap(), 7);
        assert!(document.path().is_none());
        assert_eq!(document.read(|doc| doc.count), 7);
    }
}
