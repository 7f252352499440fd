//! Release Store
//!
//! Ordered, newest-first release lists keyed by [`Scope`]. Every operation
//! replaces the scope's list as a whole; both backends hold one lock per scope
//! for the full read-modify-write so concurrent publishers cannot lose writes
//! or store the same version twice.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::error::{Result, StoreError};
use super::model::{Release, Scope};

pub trait ReleaseStore: Send + Sync {
    /// Full newest-first sequence; empty for an unknown scope
    fn list(&self, scope: &Scope) -> Result<Vec<Release>>;

    /// Insert at the front of the scope
    fn append(&self, scope: &Scope, release: Release) -> Result<Release>;

    /// Insert at the front unless the scope already holds `release.version`.
    ///
    /// The check and the insert happen under the same scope lock.
    fn append_unique(&self, scope: &Scope, release: Release) -> Result<Release>;

    /// Edit the newest entry with `version` in place and persist it
    fn mutate(
        &self,
        scope: &Scope,
        version: &str,
        edit: &mut dyn FnMut(&mut Release),
    ) -> Result<Release>;

    /// Clone the newest entry of `source`, apply `apply_override`, append to `target`
    fn copy_latest(
        &self,
        source: &Scope,
        target: &Scope,
        apply_override: &mut dyn FnMut(&mut Release),
    ) -> Result<Release> {
        let mut release = self
            .list(source)?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::EmptySource(source.to_string()))?;
        release.platform = target.platform;
        apply_override(&mut release);
        self.append(target, release)
    }
}

fn insert_unique(releases: &mut Vec<Release>, scope: &Scope, release: Release) -> Result<Release> {
    if releases.iter().any(|r| r.version == release.version) {
        return Err(StoreError::DuplicateVersion {
            scope: scope.to_string(),
            version: release.version,
        });
    }
    releases.insert(0, release.clone());
    Ok(release)
}

fn apply_edit(
    releases: &mut [Release],
    scope: &Scope,
    version: &str,
    edit: &mut dyn FnMut(&mut Release),
) -> Result<Release> {
    let entry = releases
        .iter_mut()
        .find(|r| r.version == version)
        .ok_or_else(|| StoreError::VersionNotFound {
            scope: scope.to_string(),
            version: version.to_string(),
        })?;
    edit(entry);
    Ok(entry.clone())
}

/// Process-local store, used by tests and embedded endpoints
#[derive(Default)]
pub struct MemoryReleaseStore {
    scopes: Mutex<HashMap<Scope, Vec<Release>>>,
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReleaseStore for MemoryReleaseStore {
    fn list(&self, scope: &Scope) -> Result<Vec<Release>> {
        let scopes = self.scopes.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(scopes.get(scope).cloned().unwrap_or_default())
    }

    fn append(&self, scope: &Scope, release: Release) -> Result<Release> {
        let mut scopes = self.scopes.lock().map_err(|_| StoreError::LockPoisoned)?;
        scopes
            .entry(scope.clone())
            .or_default()
            .insert(0, release.clone());
        Ok(release)
    }

    fn append_unique(&self, scope: &Scope, release: Release) -> Result<Release> {
        let mut scopes = self.scopes.lock().map_err(|_| StoreError::LockPoisoned)?;
        insert_unique(scopes.entry(scope.clone()).or_default(), scope, release)
    }

    fn mutate(
        &self,
        scope: &Scope,
        version: &str,
        edit: &mut dyn FnMut(&mut Release),
    ) -> Result<Release> {
        let mut scopes = self.scopes.lock().map_err(|_| StoreError::LockPoisoned)?;
        let releases = scopes
            .get_mut(scope)
            .ok_or_else(|| StoreError::VersionNotFound {
                scope: scope.to_string(),
                version: version.to_string(),
            })?;
        apply_edit(releases, scope, version, edit)
    }
}

/// One JSON list per scope at `<root>/<key fingerprint>/<platform>/<environment>.json`
pub struct JsonReleaseStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl JsonReleaseStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_path(&self, scope: &Scope) -> Result<PathBuf> {
        if !scope.environment_is_valid() {
            return Err(StoreError::InvalidScope(format!(
                "environment '{}' must be alphanumeric, '-' or '_'",
                scope.environment
            )));
        }
        Ok(self
            .root
            .join(scope.key_fingerprint())
            .join(scope.platform.as_str())
            .join(format!("{}.json", scope.environment)))
    }

    fn scope_lock(&self, path: &Path) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(locks.entry(path.to_path_buf()).or_default().clone())
    }

    fn read_scope(path: &Path) -> Result<Vec<Release>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write to a temp file first, then rename over the old list
    fn write_scope(path: &Path, releases: &[Release]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(releases)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn update_scope<T>(
        &self,
        scope: &Scope,
        update: impl FnOnce(&mut Vec<Release>) -> Result<T>,
    ) -> Result<T> {
        let path = self.scope_path(scope)?;
        let lock = self.scope_lock(&path)?;
        let _guard = lock.lock().map_err(|_| StoreError::LockPoisoned)?;

        let mut releases = Self::read_scope(&path)?;
        let result = update(&mut releases)?;
        Self::write_scope(&path, &releases)?;
        Ok(result)
    }
}

impl ReleaseStore for JsonReleaseStore {
    fn list(&self, scope: &Scope) -> Result<Vec<Release>> {
        let path = self.scope_path(scope)?;
        let lock = self.scope_lock(&path)?;
        let _guard = lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        Self::read_scope(&path)
    }

    fn append(&self, scope: &Scope, release: Release) -> Result<Release> {
        self.update_scope(scope, |releases| {
            releases.insert(0, release.clone());
            Ok(release)
        })
    }

    fn append_unique(&self, scope: &Scope, release: Release) -> Result<Release> {
        self.update_scope(scope, |releases| insert_unique(releases, scope, release))
    }

    fn mutate(
        &self,
        scope: &Scope,
        version: &str,
        edit: &mut dyn FnMut(&mut Release),
    ) -> Result<Release> {
        self.update_scope(scope, |releases| apply_edit(releases, scope, version, edit))
    }
}
