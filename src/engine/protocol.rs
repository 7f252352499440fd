//! Wire protocol shared by the distribution endpoint and the update agent

use serde::{Deserialize, Serialize};

use crate::engine::release::Platform;

/// Header carrying the opaque deployment credential
pub const DEPLOYMENT_KEY_HEADER: &str = "x-deployment-key";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUpdateRequest {
    pub current_version: String,
    pub platform: Platform,
    /// Host binary version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Set when the client has no base tree to apply a delta to
    #[serde(default, skip_serializing_if = "is_false")]
    pub full_package_only: bool,
}

fn is_false(value: &bool) -> bool {
    !value
}

/// Everything a client needs to fetch and verify an offered package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub version: String,
    pub download_url: String,
    /// Digest of the package at `download_url` (the delta when `is_diff`)
    pub hash: String,
    pub size: u64,
    pub description: String,
    pub mandatory: bool,
    pub is_diff: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUpdateResponse {
    pub update_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_diff: Option<bool>,
}

impl CheckUpdateResponse {
    pub fn no_update() -> Self {
        Self {
            update_available: false,
            version: None,
            download_url: None,
            hash: None,
            size: None,
            description: None,
            mandatory: None,
            is_diff: None,
        }
    }

    pub fn available(info: UpdateInfo) -> Self {
        Self {
            update_available: true,
            version: Some(info.version),
            download_url: Some(info.download_url),
            hash: Some(info.hash),
            size: Some(info.size),
            description: Some(info.description),
            mandatory: Some(info.mandatory),
            is_diff: Some(info.is_diff),
        }
    }

    /// `None` for "no update"; also `None` when an advertised update lacks a
    /// version, URL or hash
    pub fn into_update(self) -> Option<UpdateInfo> {
        if !self.update_available {
            return None;
        }
        Some(UpdateInfo {
            version: self.version?,
            download_url: self.download_url?,
            hash: self.hash?,
            size: self.size.unwrap_or(0),
            description: self.description.unwrap_or_default(),
            mandatory: self.mandatory.unwrap_or(false),
            is_diff: self.is_diff.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportInstallRequest {
    pub deployment_key: String,
    pub platform: Platform,
    pub version: String,
    pub status: InstallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteRequest {
    pub platforms: Vec<Platform>,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_update_is_minimal() {
        let value = serde_json::to_value(CheckUpdateResponse::no_update()).unwrap();
        assert_eq!(value, json!({"updateAvailable": false}));
    }

    #[test]
    fn test_update_response_shape() {
        let response = CheckUpdateResponse::available(UpdateInfo {
            version: "2.0.0".to_string(),
            download_url: "http://localhost/api/packages/abc.zip".to_string(),
            hash: "abc".to_string(),
            size: 42,
            description: "fixes".to_string(),
            mandatory: true,
            is_diff: false,
        });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["updateAvailable"], true);
        assert_eq!(value["downloadUrl"], "http://localhost/api/packages/abc.zip");
        assert_eq!(value["isDiff"], false);

        let parsed: CheckUpdateResponse = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.into_update().unwrap().size, 42);
    }

    #[test]
    fn test_incomplete_update_is_ignored() {
        let response: CheckUpdateResponse =
            serde_json::from_value(json!({"updateAvailable": true, "version": "2.0.0"})).unwrap();
        assert!(response.into_update().is_none());
    }

    #[test]
    fn test_check_request_optional_fields() {
        let request: CheckUpdateRequest =
            serde_json::from_value(json!({"currentVersion": "1.0.0", "platform": "ios"})).unwrap();
        assert_eq!(request.platform, Platform::Ios);
        assert!(request.app_version.is_none());
        assert!(!request.full_package_only);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"currentVersion": "1.0.0", "platform": "ios"})
        );

        let full_only: CheckUpdateRequest = serde_json::from_value(
            json!({"currentVersion": "1.0.0", "platform": "ios", "fullPackageOnly": true}),
        )
        .unwrap();
        assert!(full_only.full_package_only);
    }
}
