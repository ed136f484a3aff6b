//! Utility functions shared across the safepoint library
//!
//! File hashing, atomic writes, project identity derivation, and small
//! path/formatting helpers.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Number of hex characters in a project identity.
pub const PROJECT_ID_LEN: usize = 12;

/// Hash a file's content using SHA-256
///
/// Reads the file in 8KB chunks so large files do not have to fit in memory.
/// Returns the hash as a 64-character hexadecimal string.
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary data using SHA-256, returned as lowercase hex
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Derive the stable project identity for an absolute project path
///
/// The identity is the first [`PROJECT_ID_LEN`] hex characters of the
/// SHA-256 of the path string. The same path always yields the same
/// identity; distinct paths collide only with negligible probability.
pub fn project_id(project_path: &Path) -> String {
    let canonical = project_path
        .canonicalize()
        .unwrap_or_else(|_| project_path.to_path_buf());
    let mut id = hash_data(canonical.to_string_lossy().as_bytes());
    id.truncate(PROJECT_ID_LEN);
    id
}

/// Atomic file write (write to a temp file in the same directory, then rename)
///
/// Either the entire file is written or the previous content survives; a
/// crash mid-write never leaves a partially written file at `path`.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    std::io::Write::write_all(&mut tmp, content)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Remove directory if empty, returning whether it was removed
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Remove directories left empty after a deletion, walking up from `start`
/// to (but not including) `root`.
pub fn remove_empty_parents(start: &Path, root: &Path) {
    let mut current = start.to_path_buf();
    while current != root && current.starts_with(root) {
        match remove_dir_if_empty(&current) {
            Ok(true) => {}
            _ => break,
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}

/// Format bytes in human-readable form (binary units)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// File mode for manifest entries (0o644 where the platform has no modes)
#[cfg(unix)]
pub fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
pub fn file_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_data_stable() {
        let data = b"Hello, World!";
        let hash1 = hash_data(data);
        let hash2 = hash_data(data);
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_project_id_deterministic() {
        let temp_dir = TempDir::new().unwrap();
        let a = project_id(temp_dir.path());
        let b = project_id(temp_dir.path());
        assert_eq!(a, b);
        assert_eq!(a.len(), PROJECT_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let other = TempDir::new().unwrap();
        assert_ne!(a, project_id(other.path()));
    }

    #[test]
    fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("test.txt");

        atomic_write(&file_path, b"Test content").unwrap();
        assert_eq!(fs::read(&file_path).unwrap(), b"Test content");

        // Overwrite must replace the previous content in one step
        atomic_write(&file_path, b"Second").unwrap();
        assert_eq!(fs::read(&file_path).unwrap(), b"Second");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
    }

    #[test]
    fn test_remove_empty_parents_stops_at_root() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();

        remove_empty_parents(&nested, temp_dir.path());

        assert!(!temp_dir.path().join("a").exists());
        assert!(temp_dir.path().exists());
    }
}
