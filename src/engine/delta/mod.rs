//! Delta Packaging Engine
//!
//! File-level diffing between two release trees:
//! - `tree` - scanning a directory into path -> content hash entries
//! - `manifest` - the added / modified / deleted classification
//! - `package` - zip containers carrying changed files plus the manifest

pub mod manifest;
pub mod package;
pub mod tree;

pub use manifest::{diff, DeltaManifest};
pub use package::{
    apply_package, apply_package_to_copy, build_delta_between_packages, build_full_package,
    build_package, extract_full_package, is_delta_package, PackageStats, MANIFEST_ENTRY,
};
pub use tree::{FileTree, ReleaseTree, TreeEntry};

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeltaError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to walk release tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Package container error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid package: {0}")]
    InvalidPackage(String),

    #[error("Invalid path in release tree: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, DeltaError>;
