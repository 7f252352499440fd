//! Generation Store
//!
//! Filesystem layout of an installation:
//!
//! ```text
//! <root>/state.json          agent state (the only commit point)
//! <root>/generations/<id>/   one directory per materialized hot update
//! <root>/generations/.tmp-*  staging, renamed into place when complete
//! <root>/downloads/          in-flight package downloads
//! ```
//!
//! Generation directories never move once installed; switching generations
//! only rewrites `state.json`.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const TEMP_PREFIX: &str = ".tmp-";

pub struct GenerationStore {
    base_dir: PathBuf,
}

impl GenerationStore {
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Platform data directory, e.g. `~/.local/share/hotpush` on Linux
    pub fn default_base_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("hotpush"))
    }

    /// Initialize the directory structure
    pub fn init(&self) -> io::Result<()> {
        fs::create_dir_all(self.generations_dir())?;
        fs::create_dir_all(self.downloads_dir())?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn generations_dir(&self) -> PathBuf {
        self.base_dir.join("generations")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn state_path(&self) -> PathBuf {
        self.base_dir.join("state.json")
    }

    pub fn generation_path(&self, id: &str) -> PathBuf {
        self.generations_dir().join(id)
    }

    pub fn is_installed(&self, id: &str) -> bool {
        self.generation_path(id).is_dir()
    }

    /// Fresh, not yet created staging path on the same filesystem as the
    /// generations
    pub fn new_staging_path(&self) -> PathBuf {
        self.generations_dir()
            .join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()))
    }

    /// Move a completed staging directory into place under a new id
    pub fn install(&self, staging: &Path) -> io::Result<String> {
        let id = Uuid::new_v4().to_string();
        fs::rename(staging, self.generation_path(&id))?;
        Ok(id)
    }

    pub fn remove(&self, id: &str) -> io::Result<()> {
        let path = self.generation_path(id);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    /// Installed generation ids, staging leftovers excluded
    pub fn list_generations(&self) -> io::Result<Vec<String>> {
        let dir = self.generations_dir();
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with(TEMP_PREFIX) {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete every generation not in `referenced`, staging leftovers and
    /// abandoned downloads. Returns how many entries were removed.
    pub fn collect_garbage(&self, referenced: &BTreeSet<String>) -> io::Result<usize> {
        let mut removed = 0;

        let dir = self.generations_dir();
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if referenced.contains(&name) {
                    continue;
                }
                let path = entry.path();
                let result = if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                match result {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove generation"),
                }
            }
        }

        let downloads = self.downloads_dir();
        if downloads.exists() {
            for entry in fs::read_dir(&downloads)? {
                let path = entry?.path();
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(removed, "Collected unreferenced generations");
        }
        Ok(removed)
    }
}
