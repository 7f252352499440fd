//! Delta manifest: which paths a package adds, modifies and deletes

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::tree::{is_safe_key, FileTree, TreeEntry};
use super::{DeltaError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaManifest {
    #[serde(default)]
    pub added: BTreeSet<String>,
    #[serde(default)]
    pub modified: BTreeSet<String>,
    #[serde(default)]
    pub deleted: BTreeSet<String>,
}

impl DeltaManifest {
    /// True when the two trees were identical
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Paths whose bytes travel in the package body
    pub fn changed_paths(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.modified.iter())
    }

    pub fn has_content(&self) -> bool {
        !self.added.is_empty() || !self.modified.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        for path in self.added.iter().chain(&self.modified).chain(&self.deleted) {
            if !is_safe_key(path) {
                return Err(DeltaError::InvalidPackage(format!(
                    "manifest path '{}' is not a relative tree path",
                    path
                )));
            }
        }
        if let Some(path) = self.added.intersection(&self.modified).next() {
            return Err(DeltaError::InvalidPackage(format!(
                "'{}' is both added and modified",
                path
            )));
        }
        Ok(())
    }
}

/// Classify every path of `new` against `old`.
///
/// A path that switches between directory and file is deleted and, when it is
/// a file in `new`, added again. Directories never appear as added.
pub fn diff(old: &FileTree, new: &FileTree) -> DeltaManifest {
    let mut manifest = DeltaManifest::default();

    for (path, new_entry) in new.iter() {
        match (old.get(path), new_entry) {
            (None, TreeEntry::File { .. }) => {
                manifest.added.insert(path.clone());
            }
            (None, TreeEntry::Dir) => {}
            (Some(TreeEntry::File { hash: old_hash, .. }), TreeEntry::File { hash, .. }) => {
                if old_hash != hash {
                    manifest.modified.insert(path.clone());
                }
            }
            (Some(TreeEntry::Dir), TreeEntry::Dir) => {}
            (Some(_), new_entry) => {
                manifest.deleted.insert(path.clone());
                if new_entry.is_file() {
                    manifest.added.insert(path.clone());
                }
            }
        }
    }

    for (path, _) in old.iter() {
        if new.get(path).is_none() {
            manifest.deleted.insert(path.clone());
        }
    }

    manifest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(files: &[(&str, &str)]) -> FileTree {
        files
            .iter()
            .map(|(path, hash)| (path.to_string(), TreeEntry::file(hash, 1)))
            .collect()
    }

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_diff_added_and_modified() {
        let old = tree(&[("a", "h1"), ("b", "h2")]);
        let new = tree(&[("a", "h1"), ("b", "h3"), ("c", "h4")]);

        let manifest = diff(&old, &new);
        assert_eq!(manifest.added, set(&["c"]));
        assert_eq!(manifest.modified, set(&["b"]));
        assert!(manifest.deleted.is_empty());
    }

    #[test]
    fn test_diff_deleted() {
        let old = tree(&[("a", "h1"), ("gone", "h2")]);
        let new = tree(&[("a", "h1")]);

        let manifest = diff(&old, &new);
        assert_eq!(manifest.deleted, set(&["gone"]));
        assert!(!manifest.has_content());
    }

    #[test]
    fn test_identical_trees() {
        let old = tree(&[("a", "h1")]);
        assert!(diff(&old, &old.clone()).is_empty());
    }

    #[test]
    fn test_dir_to_file_is_delete_then_add() {
        let mut old = FileTree::new();
        old.insert("assets", TreeEntry::Dir);
        old.insert("assets/x.png", TreeEntry::file("h1", 1));
        let new = tree(&[("assets", "h2")]);

        let manifest = diff(&old, &new);
        assert_eq!(manifest.deleted, set(&["assets", "assets/x.png"]));
        assert_eq!(manifest.added, set(&["assets"]));
        assert!(manifest.modified.is_empty());
    }

    #[test]
    fn test_file_to_dir_is_delete_then_add_children() {
        let old = tree(&[("lib", "h1")]);
        let mut new = FileTree::new();
        new.insert("lib", TreeEntry::Dir);
        new.insert("lib/index.js", TreeEntry::file("h2", 1));

        let manifest = diff(&old, &new);
        assert_eq!(manifest.deleted, set(&["lib"]));
        assert_eq!(manifest.added, set(&["lib/index.js"]));
    }

    #[test]
    fn test_validate_rejects_escaping_paths() {
        let manifest = DeltaManifest {
            deleted: set(&["../../etc/passwd"]),
            ..Default::default()
        };
        assert!(matches!(
            manifest.validate(),
            Err(DeltaError::InvalidPackage(_))
        ));
    }
}
