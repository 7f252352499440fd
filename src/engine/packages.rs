//! Package Storage
//!
//! Content-addressed package files: `<root>/<sha256>.zip`. The file name is
//! the opaque reference handed to clients.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::hasher;

const EXTENSION: &str = ".zip";

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Package not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPackage {
    pub reference: String,
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct PackageStore {
    root: PathBuf,
}

impl PackageStore {
    pub fn open(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn reference_for(hash: &str) -> String {
        format!("{}{}", hash.to_ascii_lowercase(), EXTENSION)
    }

    /// Store bytes under their digest; storing the same bytes twice is a no-op
    pub fn put(&self, bytes: &[u8]) -> io::Result<StoredPackage> {
        let hash = hasher::hash_bytes(bytes);
        let reference = Self::reference_for(&hash);
        let path = self.root.join(&reference);

        if !path.exists() {
            let temp_path = self.root.join(format!(".tmp-{}", reference));
            fs::write(&temp_path, bytes)?;
            fs::rename(&temp_path, &path)?;
        }

        Ok(StoredPackage {
            reference,
            hash,
            size: bytes.len() as u64,
        })
    }

    /// Location of a reference; `None` for anything that is not `<hex digest>.zip`
    pub fn path_for(&self, reference: &str) -> Option<PathBuf> {
        let digest = reference.strip_suffix(EXTENSION)?;
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.root.join(reference))
    }

    /// Digest embedded in a reference
    pub fn digest_of(reference: &str) -> Option<&str> {
        reference.strip_suffix(EXTENSION)
    }

    pub fn size_of(&self, reference: &str) -> Result<u64, PackageError> {
        let path = self
            .path_for(reference)
            .ok_or_else(|| PackageError::NotFound(reference.to_string()))?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(PackageError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.path_for(reference).is_some_and(|p| p.exists())
    }

    pub fn get(&self, reference: &str) -> Result<Vec<u8>, PackageError> {
        let path = self
            .path_for(reference)
            .ok_or_else(|| PackageError::NotFound(reference.to_string()))?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(PackageError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get() {
        let dir = tempdir().unwrap();
        let store = PackageStore::open(dir.path()).unwrap();

        let stored = store.put(b"package bytes").unwrap();
        assert_eq!(stored.hash, hasher::hash_bytes(b"package bytes"));
        assert_eq!(stored.reference, format!("{}.zip", stored.hash));
        assert_eq!(store.get(&stored.reference).unwrap(), b"package bytes");
        assert_eq!(store.size_of(&stored.reference).unwrap(), 13);
        assert_eq!(PackageStore::digest_of(&stored.reference), Some(stored.hash.as_str()));

        // idempotent
        assert_eq!(store.put(b"package bytes").unwrap(), stored);
    }

    #[test]
    fn test_rejects_foreign_references() {
        let dir = tempdir().unwrap();
        let store = PackageStore::open(dir.path()).unwrap();

        assert!(store.path_for("../secret.zip").is_none());
        assert!(store.path_for("abc.zip").is_none());
        assert!(matches!(
            store.get("../../etc/passwd"),
            Err(PackageError::NotFound(_))
        ));

        let missing = PackageStore::reference_for(&hasher::hash_bytes(b"nope"));
        assert!(!store.contains(&missing));
        assert!(matches!(store.get(&missing), Err(PackageError::NotFound(_))));
    }
}
