//! Content-addressable object storage
//!
//! Blobs are keyed by the SHA-256 of their uncompressed content and stored
//! lz4-compressed under a sharded directory layout (first two hash characters
//! form the shard), keeping directories small on multi-thousand-file trees:
//!
//! ```text
//! objects/
//! ├── ab/
//! │   └── cdef0123...   # remaining hash characters
//! └── ...
//! ```
//!
//! Identical content is stored once regardless of how many snapshots
//! reference it. Garbage collection is reachability-based: [`ObjectStore::retain`]
//! keeps exactly the hashes referenced by surviving snapshot manifests.

use crate::error::{Result, SafepointError};
use crate::utils::{atomic_write, hash_data};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Sharded object store rooted at one directory
#[derive(Debug)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root directory if missing; idempotent
    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Store a blob, returning its content hash
    ///
    /// Content already present is not rewritten.
    pub fn store(&self, content: &[u8]) -> Result<String> {
        let hash = hash_data(content);
        let path = self.object_path(&hash);

        if path.exists() {
            trace!("Object {} already stored", &hash[..8]);
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let compressed = lz4_flex::compress_prepend_size(content);
        atomic_write(&path, &compressed)?;
        Ok(hash)
    }

    /// Load a blob by content hash
    pub fn load(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.object_path(hash);
        let compressed = fs::read(&path)
            .map_err(|_| SafepointError::ObjectNotFound(hash.to_string()))?;
        lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| SafepointError::Decompression(format!("object {}: {}", hash, e)))
    }

    /// Whether a blob with this hash is present
    pub fn contains(&self, hash: &str) -> bool {
        self.object_path(hash).exists()
    }

    /// Delete every object whose hash is not in `referenced`
    ///
    /// Returns how many objects were removed and how many bytes of
    /// compressed storage were reclaimed.
    pub fn retain(&self, referenced: &HashSet<String>) -> Result<(usize, u64)> {
        if !self.root.exists() {
            return Ok((0, 0));
        }

        let mut removed = 0usize;
        let mut reclaimed = 0u64;

        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let hash = object_hash_of(entry.path(), &self.root);
            if referenced.contains(&hash) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if fs::remove_file(entry.path()).is_ok() {
                removed += 1;
                reclaimed += size;
                // Drop the shard directory once emptied
                if let Some(shard) = entry.path().parent() {
                    let _ = crate::utils::remove_dir_if_empty(shard);
                }
            }
        }

        if removed > 0 {
            debug!("Garbage-collected {} objects ({} bytes)", removed, reclaimed);
        }
        Ok((removed, reclaimed))
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        if hash.len() > 2 {
            self.root.join(&hash[..2]).join(&hash[2..])
        } else {
            self.root.join(hash)
        }
    }
}

fn object_hash_of(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .ok()
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .concat()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path().join("objects"));
        store.ensure_layout().unwrap();

        let content = b"fn main() { println!(\"hello\"); }";
        let hash = store.store(content).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(store.contains(&hash));
        assert_eq!(store.load(&hash).unwrap(), content);
    }

    #[test]
    fn test_dedupe() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path().join("objects"));
        store.ensure_layout().unwrap();

        let h1 = store.store(b"same content").unwrap();
        let h2 = store.store(b"same content").unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_missing_object() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path().join("objects"));
        store.ensure_layout().unwrap();

        let err = store.load(&"0".repeat(64)).unwrap_err();
        assert!(matches!(err, SafepointError::ObjectNotFound(_)));
    }

    #[test]
    fn test_retain_removes_unreferenced() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path().join("objects"));
        store.ensure_layout().unwrap();

        let keep = store.store(b"keep me").unwrap();
        let stale = store.store(b"drop me").unwrap();

        let mut referenced = HashSet::new();
        referenced.insert(keep.clone());
        let (removed, reclaimed) = store.retain(&referenced).unwrap();

        assert_eq!(removed, 1);
        assert!(reclaimed > 0);
        assert!(store.contains(&keep));
        assert!(!store.contains(&stale));
    }
}
