//! Release Store error types

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version {version} not found in {scope}")]
    VersionNotFound { scope: String, version: String },

    #[error("Version {version} already exists in {scope}")]
    DuplicateVersion { scope: String, version: String },

    #[error("No releases in source scope {0}")]
    EmptySource(String),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Release store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;
