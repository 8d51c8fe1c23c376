//! Blob store: opaque byte blobs with atomic write and listing.
//!
//! Two implementations: in-memory (tests, ephemeral stores) and filesystem.
//! The engine works identically on either.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};
use uuid::Uuid;

use super::StorageError;

/// Opaque byte-blob storage keyed by slash-separated paths.
pub trait BlobStore: Send + Sync {
    fn exists(&self, path: &str) -> Result<bool, StorageError>;

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// All-or-nothing write: a failure leaves no partial file behind.
    fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Delete a blob. Deleting a missing blob is a no-op.
    fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// All blob paths starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// In-memory blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| StorageError::InvalidPath("blob store lock poisoned".to_string()))?;
        Ok(blobs.contains_key(path))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| StorageError::InvalidPath("blob store lock poisoned".to_string()))?;
        blobs
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::PathNotFound(path.to_string()))
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| StorageError::InvalidPath("blob store lock poisoned".to_string()))?;
        blobs.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        // A map insert is already all-or-nothing.
        self.write(path, bytes)
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| StorageError::InvalidPath("blob store lock poisoned".to_string()))?;
        blobs.remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| StorageError::InvalidPath("blob store lock poisoned".to_string()))?;
        let mut paths: Vec<String> = blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        paths.sort();
        Ok(paths)
    }
}

/// Filesystem blob store rooted at a data directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        if path.is_empty()
            || path.starts_with('/')
            || path.split('/').any(|part| part.is_empty() || part == "..")
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(path))
    }

    fn ensure_parent(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.resolve(path)?.is_file())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        if !full.is_file() {
            return Err(StorageError::PathNotFound(path.to_string()));
        }
        Ok(fs::read(&full)?)
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        self.ensure_parent(&full)?;
        fs::write(&full, bytes)?;
        debug!("Wrote {} bytes to {:?}", bytes.len(), full);
        Ok(())
    }

    fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        self.ensure_parent(&full)?;

        // Temp-then-rename in the same directory keeps the rename atomic.
        let tmp = full.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, bytes)?;
        if let Err(e) = fs::rename(&tmp, &full) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!("Atomically wrote {} bytes to {:?}", bytes.len(), full);
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to delete {:?}: {}", full, e);
                Err(e.into())
            }
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut paths = Vec::new();
        collect_files(&self.root, &self.root, &mut paths)?;
        paths.retain(|p| p.starts_with(prefix));
        paths.sort();
        Ok(paths)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), StorageError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            if let Some(rel) = rel.to_str() {
                out.push(rel.replace('\\', "/"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stores() -> (MemoryBlobStore, FsBlobStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let fs_store = FsBlobStore::new(temp_dir.path().to_path_buf());
        (MemoryBlobStore::new(), fs_store, temp_dir)
    }

    fn exercise_round_trip(store: &dyn BlobStore) {
        assert!(!store.exists("a/b.bin").unwrap());

        store.write("a/b.bin", b"hello").unwrap();
        assert!(store.exists("a/b.bin").unwrap());
        assert_eq!(store.read("a/b.bin").unwrap(), b"hello");

        store.write_atomic("a/b.bin", b"world").unwrap();
        assert_eq!(store.read("a/b.bin").unwrap(), b"world");

        store.delete("a/b.bin").unwrap();
        assert!(!store.exists("a/b.bin").unwrap());
        // Deleting again is a no-op.
        store.delete("a/b.bin").unwrap();
    }

    #[test]
    fn test_memory_round_trip() {
        let (mem, _fs, _tmp) = stores();
        exercise_round_trip(&mem);
    }

    #[test]
    fn test_fs_round_trip() {
        let (_mem, fs_store, _tmp) = stores();
        exercise_round_trip(&fs_store);
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let (mem, fs_store, _tmp) = stores();
        assert!(matches!(
            mem.read("missing").unwrap_err(),
            StorageError::PathNotFound(_)
        ));
        assert!(matches!(
            fs_store.read("missing").unwrap_err(),
            StorageError::PathNotFound(_)
        ));
    }

    #[test]
    fn test_list_by_prefix() {
        let (mem, fs_store, _tmp) = stores();
        for store in [&mem as &dyn BlobStore, &fs_store as &dyn BlobStore] {
            store.write("events/seg-a.parquet", b"1").unwrap();
            store.write("events/seg-b.parquet", b"2").unwrap();
            store.write("events/manifest.json", b"3").unwrap();
            store.write("other/seg-c.parquet", b"4").unwrap();

            let segments = store.list("events/seg-").unwrap();
            assert_eq!(
                segments,
                vec![
                    "events/seg-a.parquet".to_string(),
                    "events/seg-b.parquet".to_string()
                ]
            );

            let all = store.list("").unwrap();
            assert_eq!(all.len(), 4);
        }
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let (_mem, fs_store, tmp) = stores();
        fs_store.write_atomic("events/manifest.json", b"{}").unwrap();

        let mut names = Vec::new();
        collect_files(tmp.path(), tmp.path(), &mut names).unwrap();
        assert_eq!(names, vec!["events/manifest.json".to_string()]);
    }

    #[test]
    fn test_fs_rejects_traversal() {
        let (_mem, fs_store, _tmp) = stores();
        assert!(fs_store.read("../outside").is_err());
        assert!(fs_store.write("/absolute", b"x").is_err());
    }
}
