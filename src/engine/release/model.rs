//! Release records and their scopes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::version::WILDCARD_RANGE;
use crate::engine::hasher;

/// Environment used when a request does not name one
pub const DEFAULT_ENVIRONMENT: &str = "production";

/// Client platform a release targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Android, Platform::Ios];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Unknown platform: {0} (expected android or ios)")]
pub struct ParsePlatformError(pub String);

impl FromStr for Platform {
    type Err = ParsePlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            other => Err(ParsePlatformError(other.to_string())),
        }
    }
}

/// Key of one ordered release list: (deployment credential, platform, environment)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub deployment_key: String,
    pub platform: Platform,
    pub environment: String,
}

impl Scope {
    pub fn new(deployment_key: &str, platform: Platform) -> Self {
        Self {
            deployment_key: deployment_key.to_string(),
            platform,
            environment: DEFAULT_ENVIRONMENT.to_string(),
        }
    }

    pub fn with_environment(mut self, environment: &str) -> Self {
        self.environment = environment.to_string();
        self
    }

    /// Same credential and platform, another environment
    pub fn in_environment(&self, environment: &str) -> Self {
        self.clone().with_environment(environment)
    }

    /// Short fingerprint of the credential; the raw key never touches disk or logs
    pub fn key_fingerprint(&self) -> String {
        hasher::hash_bytes(self.deployment_key.as_bytes())[..16].to_string()
    }

    pub fn environment_is_valid(&self) -> bool {
        !self.environment.is_empty()
            && self
                .environment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.key_fingerprint(),
            self.platform,
            self.environment
        )
    }
}

/// Per-release counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStats {
    #[serde(default)]
    pub checks: u64,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub installs: u64,
    #[serde(default)]
    pub failures: u64,
}

/// One published update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub version: String,
    pub platform: Platform,
    pub package_reference: String,
    pub content_hash: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default = "default_rollout")]
    pub rollout_percent: u8,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_range")]
    pub target_binary_range: String,
    /// Predecessor version -> delta package reference
    #[serde(default)]
    pub diff_references: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: ReleaseStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_from: Option<String>,
}

fn default_rollout() -> u8 {
    100
}

fn default_range() -> String {
    WILDCARD_RANGE.to_string()
}

impl Release {
    pub fn new(
        version: &str,
        platform: Platform,
        package_reference: &str,
        content_hash: &str,
        size_bytes: u64,
    ) -> Self {
        Self {
            version: version.to_string(),
            platform,
            package_reference: package_reference.to_string(),
            content_hash: content_hash.to_string(),
            size_bytes,
            description: String::new(),
            mandatory: false,
            rollout_percent: default_rollout(),
            disabled: false,
            target_binary_range: default_range(),
            diff_references: BTreeMap::new(),
            created_at: Utc::now(),
            stats: ReleaseStats::default(),
            updated_at: None,
            promoted_at: None,
            promoted_from: None,
        }
    }

    pub fn with_rollout(mut self, percent: u8) -> Self {
        self.rollout_percent = percent;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn with_target_binary_range(mut self, range: &str) -> Self {
        self.target_binary_range = range.to_string();
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_diff(mut self, from_version: &str, reference: &str) -> Self {
        self.diff_references
            .insert(from_version.to_string(), reference.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse() {
        assert_eq!("iOS".parse::<Platform>().unwrap(), Platform::Ios);
        assert_eq!("android".parse::<Platform>().unwrap(), Platform::Android);
        assert!("windows".parse::<Platform>().is_err());
    }

    #[test]
    fn test_release_json_is_camel_case() {
        let release = Release::new("1.0.0", Platform::Ios, "abc.zip", "abc", 10)
            .with_rollout(25)
            .with_diff("0.9.0", "def.zip");
        let value = serde_json::to_value(&release).unwrap();

        assert_eq!(value["rolloutPercent"], 25);
        assert_eq!(value["platform"], "ios");
        assert_eq!(value["diffReferences"]["0.9.0"], "def.zip");
        assert!(value.get("promotedAt").is_none());
    }

    #[test]
    fn test_release_defaults_on_load() {
        let json = r#"{
            "version": "1.0.0",
            "platform": "android",
            "packageReference": "abc.zip",
            "contentHash": "abc",
            "sizeBytes": 3,
            "createdAt": "2026-01-01T00:00:00Z"
        }"#;
        let release: Release = serde_json::from_str(json).unwrap();
        assert_eq!(release.rollout_percent, 100);
        assert_eq!(release.target_binary_range, "*");
        assert!(!release.disabled);
        assert_eq!(release.stats, ReleaseStats::default());
    }

    #[test]
    fn test_scope_display_hides_key() {
        let scope = Scope::new("secret-deployment-key", Platform::Android);
        let shown = scope.to_string();
        assert!(!shown.contains("secret"));
        assert!(shown.ends_with("/android/production"));
    }

    #[test]
    fn test_scope_environment_validation() {
        let scope = Scope::new("k", Platform::Ios);
        assert!(scope.environment_is_valid());
        assert!(scope.in_environment("staging-2").environment_is_valid());
        assert!(!scope.in_environment("../etc").environment_is_valid());
        assert!(!scope.in_environment("").environment_is_valid());
    }
}
