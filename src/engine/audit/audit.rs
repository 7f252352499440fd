//! Release Audit Log
//!
//! Append-only, line-delimited JSON record of publish, patch and promote

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::warn;

use crate::engine::release::Scope;

/// Current audit log format version
pub const AUDIT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Publish,
    Patch,
    Promote,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditAction::Publish => "publish",
            AuditAction::Patch => "patch",
            AuditAction::Promote => "promote",
        })
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "publish" => Ok(AuditAction::Publish),
            "patch" => Ok(AuditAction::Patch),
            "promote" => Ok(AuditAction::Promote),
            other => Err(format!(
                "unknown action '{}' (expected publish, patch or promote)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Format version for compatibility
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    /// `<key fingerprint>/<platform>/<environment>`
    pub scope: String,
    pub release_version: String,
    /// Redacted credential that performed the action
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, scope: &Scope, release_version: &str) -> Self {
        Self {
            version: AUDIT_VERSION,
            timestamp: Utc::now(),
            action,
            scope: scope.to_string(),
            release_version: release_version.to_string(),
            actor: Some(redact(&scope.deployment_key)),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// First four characters of a credential, the rest masked
pub fn redact(credential: &str) -> String {
    let visible: String = credential.chars().take(4).collect();
    format!("{}****", visible)
}

/// Serialized appends from every handler share one file
pub struct AuditLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl AuditLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            append_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &AuditEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry).map_err(io::Error::other)?;
        line.push(b'\n');

        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| io::Error::other("audit log lock poisoned"))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(&line)
    }

    /// Every readable entry, oldest first.
    ///
    /// A line that does not parse (a torn write after a crash, or an entry
    /// from a newer format) is skipped with a warning.
    pub fn entries(&self) -> io::Result<Vec<AuditEntry>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) if entry.version <= AUDIT_VERSION => entries.push(entry),
                Ok(entry) => {
                    warn!(line = index + 1, version = entry.version, "Skipping audit entry from a newer format")
                }
                Err(e) => warn!(line = index + 1, error = %e, "Skipping unreadable audit entry"),
            }
        }
        Ok(entries)
    }

    /// Newest entries first, optionally restricted to one action
    pub fn recent(&self, action: Option<AuditAction>, limit: usize) -> io::Result<Vec<AuditEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .filter(|e| action.map_or(true, |a| e.action == a))
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::release::Platform;
    use tempfile::tempdir;

    #[test]
    fn test_append_then_read_back() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit/audit.jsonl")).unwrap();
        let scope = Scope::new("deploy-key-123", Platform::Ios);

        log.append(&AuditEntry::new(AuditAction::Publish, &scope, "1.0.0"))
            .unwrap();
        log.append(
            &AuditEntry::new(AuditAction::Patch, &scope, "1.0.0")
                .with_details(serde_json::json!({"disabled": true})),
        )
        .unwrap();
        log.append(&AuditEntry::new(AuditAction::Publish, &scope, "1.1.0"))
            .unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].release_version, "1.0.0");
        assert_eq!(entries[0].actor.as_deref(), Some("depl****"));

        let publishes = log.recent(Some(AuditAction::Publish), 10).unwrap();
        assert_eq!(publishes.len(), 2);
        assert_eq!(publishes[0].release_version, "1.1.0");
        assert_eq!(log.recent(None, 1).unwrap()[0].release_version, "1.1.0");
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit.jsonl")).unwrap();
        let scope = Scope::new("key", Platform::Android);
        log.append(&AuditEntry::new(AuditAction::Promote, &scope, "2.0.0"))
            .unwrap();

        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"{\"version\":1,\"timest").unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Promote);
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("never-written.jsonl")).unwrap();
        assert!(log.entries().unwrap().is_empty());
    }

    #[test]
    fn test_entries_never_carry_raw_key() {
        let scope = Scope::new("super-secret", Platform::Android);
        let entry = AuditEntry::new(AuditAction::Promote, &scope, "2.0.0");
        let line = serde_json::to_string(&entry).unwrap();
        assert!(!line.contains("super-secret"));
        assert_eq!("PROMOTE".parse::<AuditAction>().unwrap(), AuditAction::Promote);
    }
}
