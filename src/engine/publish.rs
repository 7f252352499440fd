//! Publish
//!
//! Stores a full package, builds delta packages against recent predecessors in
//! the same scope, and appends the new release to the front of the scope.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::admin::validate_rollout;
use crate::engine::delta::{self, DeltaError, PackageStats};
use crate::engine::hasher;
use crate::engine::packages::{PackageError, PackageStore};
use crate::engine::release::version::{parse_version, BinaryRange};
use crate::engine::release::{Release, ReleaseStore, Scope, StoreError};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Release store error: {0}")]
    Store(#[from] StoreError),

    #[error("Package storage error: {0}")]
    Package(#[from] PackageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid package: {0}")]
    InvalidPackage(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Version {0} already exists in this scope")]
    DuplicateVersion(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),
}

/// Metadata and bytes of one publish
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub version: String,
    pub package: Vec<u8>,
    /// Advertised digest, checked when present
    pub hash: Option<String>,
    pub description: String,
    pub mandatory: bool,
    pub rollout: u32,
    pub target_binary_version: String,
}

impl PublishRequest {
    pub fn new(version: &str, package: Vec<u8>) -> Self {
        Self {
            version: version.to_string(),
            package,
            hash: None,
            description: String::new(),
            mandatory: false,
            rollout: 100,
            target_binary_version: "*".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaSummary {
    pub from_version: String,
    pub reference: String,
    pub stats: PackageStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOutcome {
    #[serde(flatten)]
    pub release: Release,
    pub deltas: Vec<DeltaSummary>,
}

#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn ReleaseStore>,
    packages: PackageStore,
    diff_history: usize,
}

impl Publisher {
    pub fn new(store: Arc<dyn ReleaseStore>, packages: PackageStore, diff_history: usize) -> Self {
        Self {
            store,
            packages,
            diff_history,
        }
    }

    fn validate(&self, request: &PublishRequest) -> Result<(), PublishError> {
        let version = request.version.trim();
        if version.is_empty() || version.chars().any(char::is_whitespace) {
            return Err(PublishError::InvalidField(format!(
                "invalid version '{}'",
                request.version
            )));
        }
        if parse_version(version).is_none() {
            warn!(version, "Publishing a version that is not semver; ordering checks will not apply");
        }
        validate_rollout(request.rollout).map_err(|e| PublishError::InvalidField(e.to_string()))?;
        BinaryRange::parse(&request.target_binary_version).map_err(PublishError::InvalidField)?;

        if let Some(expected) = &request.hash {
            let actual = hasher::hash_bytes(&request.package);
            if !hasher::digests_match(expected, &actual) {
                return Err(PublishError::HashMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        match delta::is_delta_package(&request.package) {
            Ok(false) => Ok(()),
            Ok(true) => Err(PublishError::InvalidPackage(
                "delta packages cannot be published directly".to_string(),
            )),
            Err(e) => Err(PublishError::InvalidPackage(e.to_string())),
        }
    }

    pub fn publish(
        &self,
        scope: &Scope,
        request: PublishRequest,
    ) -> Result<PublishOutcome, PublishError> {
        self.validate(&request)?;
        let version = request.version.trim().to_string();

        // Early exit; the authoritative check happens in `append_unique`
        let existing = self.store.list(scope)?;
        if existing.iter().any(|r| r.version == version) {
            return Err(PublishError::DuplicateVersion(version));
        }

        let stored = self.packages.put(&request.package)?;
        let mut release = Release::new(
            &version,
            scope.platform,
            &stored.reference,
            &stored.hash,
            stored.size,
        )
        .with_description(&request.description)
        .with_mandatory(request.mandatory)
        .with_rollout(request.rollout as u8)
        .with_target_binary_range(request.target_binary_version.trim());

        let mut deltas = Vec::new();
        for previous in existing.iter().take(self.diff_history) {
            match self.build_delta(previous, &request.package) {
                Ok(Some(summary)) => {
                    release
                        .diff_references
                        .insert(summary.from_version.clone(), summary.reference.clone());
                    deltas.push(summary);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    from = %previous.version,
                    to = %version,
                    error = %e,
                    "Skipping delta package"
                ),
            }
        }

        // Another publisher may have stored this version while deltas were built
        let release = self
            .store
            .append_unique(scope, release)
            .map_err(|e| match e {
                StoreError::DuplicateVersion { version, .. } => {
                    PublishError::DuplicateVersion(version)
                }
                other => PublishError::Store(other),
            })?;
        info!(
            scope = %scope,
            version = %release.version,
            size = release.size_bytes,
            deltas = deltas.len(),
            "Published release"
        );
        Ok(PublishOutcome { release, deltas })
    }

    /// `None` when the delta would not be smaller than the full package
    fn build_delta(
        &self,
        previous: &Release,
        package: &[u8],
    ) -> Result<Option<DeltaSummary>, PublishError> {
        let previous_bytes = self.packages.get(&previous.package_reference)?;
        let (delta_bytes, stats) = delta::build_delta_between_packages(&previous_bytes, package)
            .map_err(|e: DeltaError| PublishError::InvalidPackage(e.to_string()))?;
        if delta_bytes.len() >= package.len() {
            return Ok(None);
        }
        let stored = self.packages.put(&delta_bytes)?;
        Ok(Some(DeltaSummary {
            from_version: previous.version.clone(),
            reference: stored.reference,
            stats,
        }))
    }
}
