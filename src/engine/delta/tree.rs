//! Release tree scanning

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use super::{DeltaError, Result};
use crate::engine::hasher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEntry {
    File { hash: String, size: u64 },
    Dir,
}

impl TreeEntry {
    pub fn file(hash: &str, size: u64) -> Self {
        TreeEntry::File {
            hash: hash.to_string(),
            size,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, TreeEntry::File { .. })
    }
}

/// Path -> entry mapping of a release tree. Paths are relative and `/`-separated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    entries: BTreeMap<String, TreeEntry>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk `root` and hash every regular file. Symlinks are not followed.
    pub fn scan(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let key = relative_key(root, entry.path())?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                entries.insert(key, TreeEntry::Dir);
            } else if file_type.is_file() {
                let size = entry.metadata()?.len();
                let hash = hasher::hash_file(entry.path())?;
                entries.insert(key, TreeEntry::File { hash, size });
            }
        }

        Ok(Self { entries })
    }

    pub fn insert(&mut self, path: &str, entry: TreeEntry) {
        self.entries.insert(path.to_string(), entry);
    }

    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.entries.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TreeEntry)> {
        self.entries.iter()
    }

    /// Regular files only, as path -> hash
    pub fn file_hashes(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(path, entry)| match entry {
                TreeEntry::File { hash, .. } => Some((path.clone(), hash.clone())),
                TreeEntry::Dir => None,
            })
            .collect()
    }

    pub fn file_size(&self, path: &str) -> u64 {
        match self.entries.get(path) {
            Some(TreeEntry::File { size, .. }) => *size,
            _ => 0,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.entries
            .values()
            .map(|entry| match entry {
                TreeEntry::File { size, .. } => *size,
                TreeEntry::Dir => 0,
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, TreeEntry)> for FileTree {
    fn from_iter<I: IntoIterator<Item = (String, TreeEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// A scanned tree together with the directory it came from
#[derive(Debug, Clone)]
pub struct ReleaseTree {
    pub root: PathBuf,
    pub files: FileTree,
}

impl ReleaseTree {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(DeltaError::InvalidPath(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            files: FileTree::scan(root)?,
        })
    }

    pub fn path_of(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |acc, part| acc.join(part))
    }
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| DeltaError::InvalidPath(path.display().to_string()))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| DeltaError::InvalidPath(path.display().to_string()))?;
                parts.push(part);
            }
            _ => return Err(DeltaError::InvalidPath(path.display().to_string())),
        }
    }
    Ok(parts.join("/"))
}

/// Reject absolute paths, `..`, empty segments and backslashes
pub fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('/')
        && !key.contains('\\')
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Resolve a validated key under `root`
pub fn join_key(root: &Path, key: &str) -> Result<PathBuf> {
    if !is_safe_key(key) {
        return Err(DeltaError::InvalidPackage(format!("unsafe path '{}'", key)));
    }
    Ok(key.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part)))
}

/// Recursively copy `src` into `dest` (which is created)
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let key = relative_key(src, entry.path())?;
        let target = join_key(dest, &key)?;
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_scan_tree() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("assets/img")).unwrap();
        fs::write(dir.path().join("index.bundle"), b"bundle").unwrap();
        fs::write(dir.path().join("assets/img/logo.png"), b"png").unwrap();

        let tree = FileTree::scan(dir.path()).unwrap();
        assert_eq!(tree.get("assets"), Some(&TreeEntry::Dir));
        assert_eq!(tree.get("assets/img"), Some(&TreeEntry::Dir));
        assert_eq!(
            tree.get("index.bundle"),
            Some(&TreeEntry::file(&hasher::hash_bytes(b"bundle"), 6))
        );
        assert_eq!(tree.total_size(), 9);
        assert_eq!(tree.file_hashes().len(), 2);
    }

    #[test]
    fn test_safe_keys() {
        assert!(is_safe_key("a/b.js"));
        assert!(!is_safe_key("../escape"));
        assert!(!is_safe_key("/abs"));
        assert!(!is_safe_key("a//b"));
        assert!(!is_safe_key("a\\b"));
        assert!(!is_safe_key(""));
    }

    #[test]
    fn test_copy_tree() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        fs::create_dir_all(src.path().join("nested")).unwrap();
        fs::write(src.path().join("nested/file.txt"), b"x").unwrap();

        let target = dest.path().join("copy");
        copy_tree(src.path(), &target).unwrap();

        assert_eq!(
            FileTree::scan(src.path()).unwrap(),
            FileTree::scan(&target).unwrap()
        );
    }

    #[test]
    fn test_release_tree_requires_directory() {
        let dir = tempdir().unwrap();
        assert!(ReleaseTree::open(&dir.path().join("missing")).is_err());
    }
}
