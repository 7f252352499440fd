//! Package containers
//!
//! Full packages are a zip of the whole release tree. Delta packages carry
//! `__diff.json` (the [`DeltaManifest`]) plus the bytes of every added or
//! modified file. Applying always targets a disposable directory.

use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::manifest::{diff, DeltaManifest};
use super::tree::{copy_tree, is_safe_key, join_key, ReleaseTree};
use super::{DeltaError, Result};

pub const MANIFEST_ENTRY: &str = "__diff.json";

/// Size report for a built package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageStats {
    /// Sum of all file sizes in the new tree
    pub full_size: u64,
    /// Sum of the file sizes carried by the package
    pub delta_size: u64,
    pub saved_percent: u8,
    pub files_included: usize,
}

impl PackageStats {
    fn compute(full_size: u64, delta_size: u64, files_included: usize) -> Self {
        let saved_percent = if full_size == 0 || files_included == 0 {
            0
        } else {
            let ratio = 1.0 - (delta_size as f64 / full_size as f64);
            (100.0 * ratio).round().clamp(0.0, 100.0) as u8
        };
        Self {
            full_size,
            delta_size,
            saved_percent,
            files_included,
        }
    }
}

fn file_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn open_archive(package: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>> {
    ZipArchive::new(Cursor::new(package))
        .map_err(|e| DeltaError::InvalidPackage(format!("unreadable container: {}", e)))
}

/// Serialize the manifest and every added/modified file of `new_tree`
pub fn build_package(
    new_tree: &ReleaseTree,
    manifest: &DeltaManifest,
) -> Result<(Vec<u8>, PackageStats)> {
    manifest.validate()?;

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file(MANIFEST_ENTRY, file_options())?;
    writer.write_all(&serde_json::to_vec_pretty(manifest)?)?;

    let mut delta_size = 0;
    let mut files_included = 0;
    for path in manifest.changed_paths() {
        let bytes = fs::read(new_tree.path_of(path))?;
        delta_size += bytes.len() as u64;
        files_included += 1;
        writer.start_file(path.as_str(), file_options())?;
        writer.write_all(&bytes)?;
    }

    let bytes = writer.finish()?.into_inner();
    let stats = PackageStats::compute(new_tree.files.total_size(), delta_size, files_included);
    debug!(
        files = files_included,
        saved_percent = stats.saved_percent,
        "Built delta package"
    );
    Ok((bytes, stats))
}

/// Zip an entire release tree
pub fn build_full_package(tree: &ReleaseTree) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (path, _) in tree.files.file_hashes() {
        writer.start_file(path.as_str(), file_options())?;
        writer.write_all(&fs::read(tree.path_of(&path))?)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Whether the container carries a delta manifest
pub fn is_delta_package(package: &[u8]) -> Result<bool> {
    let archive = open_archive(package)?;
    let has_manifest = archive.file_names().any(|name| name == MANIFEST_ENTRY);
    Ok(has_manifest)
}

fn read_manifest(archive: &mut ZipArchive<Cursor<&[u8]>>) -> Result<DeltaManifest> {
    let mut entry = archive
        .by_name(MANIFEST_ENTRY)
        .map_err(|_| DeltaError::InvalidPackage("missing delta manifest".to_string()))?;
    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .map_err(|e| DeltaError::InvalidPackage(format!("unreadable manifest: {}", e)))?;
    let manifest: DeltaManifest = serde_json::from_str(&content)
        .map_err(|e| DeltaError::InvalidPackage(format!("malformed manifest: {}", e)))?;
    manifest.validate()?;
    Ok(manifest)
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Write every body entry (all entries but the manifest) under `target`
fn write_body(archive: &mut ZipArchive<Cursor<&[u8]>>, target: &Path) -> Result<usize> {
    let mut written = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.name() == MANIFEST_ENTRY {
            continue;
        }
        let key = entry.name().trim_end_matches('/').to_string();
        let dest = join_key(target, &key)?;
        if entry.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if dest.is_dir() {
            fs::remove_dir_all(&dest)?;
        }
        let mut file = File::create(&dest)?;
        io::copy(&mut entry, &mut file)?;
        written += 1;
    }
    Ok(written)
}

/// Turn `target` (a copy of the current tree) into the next tree.
///
/// The manifest and body are checked before the first write, so a malformed
/// package leaves `target` untouched.
pub fn apply_package(target: &Path, package: &[u8]) -> Result<DeltaManifest> {
    let mut archive = open_archive(package)?;
    let manifest = read_manifest(&mut archive)?;

    if let Some(name) = archive
        .file_names()
        .find(|name| *name != MANIFEST_ENTRY && !is_safe_key(name.trim_end_matches('/')))
    {
        return Err(DeltaError::InvalidPackage(format!("unsafe entry '{}'", name)));
    }
    for path in manifest.changed_paths() {
        if archive.index_for_name(path).is_none() {
            return Err(DeltaError::InvalidPackage(format!(
                "'{}' listed in manifest but missing from package",
                path
            )));
        }
    }

    for path in &manifest.deleted {
        remove_path(&join_key(target, path)?)?;
    }
    let written = write_body(&mut archive, target)?;
    debug!(
        deleted = manifest.deleted.len(),
        written, "Applied delta package"
    );
    Ok(manifest)
}

/// Copy `current` into `staging`, then apply the delta there
pub fn apply_package_to_copy(
    current: &Path,
    staging: &Path,
    package: &[u8],
) -> Result<DeltaManifest> {
    copy_tree(current, staging)?;
    apply_package(staging, package)
}

/// Unpack a full package into `target`
pub fn extract_full_package(target: &Path, package: &[u8]) -> Result<usize> {
    let mut archive = open_archive(package)?;
    fs::create_dir_all(target)?;
    write_body(&mut archive, target)
}

/// Delta from one full package to another, built in scratch directories
pub fn build_delta_between_packages(
    previous: &[u8],
    next: &[u8],
) -> Result<(Vec<u8>, PackageStats)> {
    let scratch = tempfile::tempdir()?;
    let old_root: PathBuf = scratch.path().join("old");
    let new_root: PathBuf = scratch.path().join("new");
    extract_full_package(&old_root, previous)?;
    extract_full_package(&new_root, next)?;

    let old_tree = ReleaseTree::open(&old_root)?;
    let new_tree = ReleaseTree::open(&new_root)?;
    let manifest = diff(&old_tree.files, &new_tree.files);
    build_package(&new_tree, &manifest)
}
