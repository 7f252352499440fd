//! Administrative Mutators
//!
//! `patch` edits fields of one release in place; `promote` copies the newest
//! release of one environment into another. Both stamp `updatedAt`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::engine::release::version::BinaryRange;
use crate::engine::release::{Platform, Release, ReleaseStats, ReleaseStore, Scope, StoreError};

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("Version {version} not found in {scope}")]
    VersionNotFound { scope: String, version: String },

    #[error("No releases to promote in {0}")]
    EmptySource(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Patch contains no fields")]
    EmptyPatch,

    #[error("Release store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for AdminError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionNotFound { scope, version } => {
                AdminError::VersionNotFound { scope, version }
            }
            StoreError::EmptySource(scope) => AdminError::EmptySource(scope),
            other => AdminError::Store(other),
        }
    }
}

/// Field-level edit accepted by `patch`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_binary_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PatchFields {
    pub fn is_empty(&self) -> bool {
        self == &PatchFields::default()
    }

    pub fn validate(&self) -> Result<(), AdminError> {
        if self.is_empty() {
            return Err(AdminError::EmptyPatch);
        }
        if let Some(rollout) = self.rollout {
            validate_rollout(rollout)?;
        }
        if let Some(range) = &self.target_binary_version {
            BinaryRange::parse(range).map_err(AdminError::InvalidField)?;
        }
        Ok(())
    }

    fn apply(&self, release: &mut Release) {
        if let Some(disabled) = self.disabled {
            release.disabled = disabled;
        }
        if let Some(rollout) = self.rollout {
            release.rollout_percent = rollout as u8;
        }
        if let Some(mandatory) = self.mandatory {
            release.mandatory = mandatory;
        }
        if let Some(range) = &self.target_binary_version {
            release.target_binary_range = range.trim().to_string();
        }
        if let Some(description) = &self.description {
            release.description = description.clone();
        }
        release.updated_at = Some(Utc::now());
    }
}

pub fn validate_rollout(rollout: u32) -> Result<(), AdminError> {
    if rollout > 100 {
        return Err(AdminError::InvalidField(format!(
            "rollout must be between 0 and 100, got {}",
            rollout
        )));
    }
    Ok(())
}

/// Edit one release in place
pub fn patch(
    store: &dyn ReleaseStore,
    scope: &Scope,
    version: &str,
    fields: &PatchFields,
) -> Result<Release, AdminError> {
    fields.validate()?;
    let release = store.mutate(scope, version, &mut |release| fields.apply(release))?;
    info!(scope = %scope, version, "Patched release");
    Ok(release)
}

/// Copy the newest release of `source` to the front of `target`
pub fn promote(
    store: &dyn ReleaseStore,
    source: &Scope,
    target: &Scope,
    rollout_override: Option<u32>,
) -> Result<Release, AdminError> {
    if let Some(rollout) = rollout_override {
        validate_rollout(rollout)?;
    }
    if source == target {
        return Err(AdminError::InvalidField(
            "source and target environments are the same".to_string(),
        ));
    }

    let promoted_from = source.environment.clone();
    let release = store.copy_latest(source, target, &mut |release| {
        let now = Utc::now();
        if let Some(rollout) = rollout_override {
            release.rollout_percent = rollout as u8;
        }
        release.stats = ReleaseStats::default();
        release.promoted_from = Some(promoted_from.clone());
        release.promoted_at = Some(now);
        release.updated_at = Some(now);
    })?;

    info!(
        from = %source,
        to = %target,
        version = %release.version,
        "Promoted release"
    );
    Ok(release)
}

/// Result of one platform in a multi-platform operation
#[derive(Debug)]
pub struct PlatformOutcome {
    pub platform: Platform,
    pub result: Result<Release, AdminError>,
}

/// Promote every listed platform; one platform failing does not stop the others
pub fn promote_platforms(
    store: &dyn ReleaseStore,
    deployment_key: &str,
    platforms: &[Platform],
    from_environment: &str,
    to_environment: &str,
    rollout_override: Option<u32>,
) -> Vec<PlatformOutcome> {
    platforms
        .iter()
        .map(|&platform| {
            let source = Scope::new(deployment_key, platform).with_environment(from_environment);
            let target = source.in_environment(to_environment);
            PlatformOutcome {
                platform,
                result: promote(store, &source, &target, rollout_override),
            }
        })
        .collect()
}
