//! Update State Machine
//!
//! Persistent agent state: the three generation slots, per-version
//! confirmation records and the last observed lifecycle status. Slot changes
//! go through the transition functions on [`Generations`] so every reachable
//! state keeps a loadable `current`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// One loadable bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Generation {
    /// The bundle shipped inside the host binary
    Bundled { version: String },
    /// A hot update materialized under `generations/<id>`
    Hot { version: String, id: String },
}

impl Generation {
    pub fn version(&self) -> &str {
        match self {
            Generation::Bundled { version } | Generation::Hot { version, .. } => version,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Generation::Bundled { .. } => None,
            Generation::Hot { id, .. } => Some(id),
        }
    }

    pub fn is_bundled(&self) -> bool {
        matches!(self, Generation::Bundled { .. })
    }
}

/// `current` always exists; `pending` and `backup` at most once each
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generations {
    pub current: Generation,
    pub pending: Option<Generation>,
    pub backup: Option<Generation>,
}

impl Generations {
    pub fn bundled(version: &str) -> Self {
        Self {
            current: Generation::Bundled {
                version: version.to_string(),
            },
            pending: None,
            backup: None,
        }
    }

    /// Replace any prior pending generation
    pub fn stage(&self, next: Generation) -> Self {
        Self {
            current: self.current.clone(),
            pending: Some(next),
            backup: self.backup.clone(),
        }
    }

    /// `pending` becomes `current`, `current` becomes `backup`; `None` when
    /// nothing is pending
    pub fn apply(&self) -> Option<Self> {
        let pending = self.pending.clone()?;
        Some(Self {
            current: pending,
            pending: None,
            backup: Some(self.current.clone()),
        })
    }

    /// `backup` returns to `current`; `None` when there is no backup.
    /// A pending generation of the failed version is dropped with it.
    pub fn rollback(&self) -> Option<Self> {
        let backup = self.backup.clone()?;
        let failed = self.current.version();
        let pending = self
            .pending
            .clone()
            .filter(|p| p.version() != failed);
        Some(Self {
            current: backup,
            pending,
            backup: None,
        })
    }

    pub fn discard_pending(&self) -> Self {
        Self {
            current: self.current.clone(),
            pending: None,
            backup: self.backup.clone(),
        }
    }

    /// Generation directories that must survive garbage collection
    pub fn referenced_ids(&self) -> BTreeSet<String> {
        [Some(&self.current), self.pending.as_ref(), self.backup.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|g| g.id().map(str::to_string))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub confirmed: bool,
    pub launch_count: u32,
}

impl Confirmation {
    pub fn confirmed() -> Self {
        Self {
            confirmed: true,
            launch_count: 0,
        }
    }
}

/// Last observed lifecycle status
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateStatus {
    #[default]
    Idle,
    Checking,
    NoUpdate,
    Downloading {
        version: String,
        total_bytes: u64,
    },
    Verifying {
        version: String,
    },
    StagedPending {
        version: String,
    },
    AppliedUnconfirmed {
        version: String,
    },
    Confirmed {
        version: String,
    },
    RolledBack {
        from: String,
        to: String,
    },
    Failed {
        reason: String,
    },
}

/// Complete agent state persisted to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    /// Bundle version of the host binary this state was created for
    pub bundled_version: String,
    pub generations: Generations,
    #[serde(default)]
    pub confirmations: BTreeMap<String, Confirmation>,
    #[serde(default)]
    pub status: UpdateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

impl AgentState {
    pub fn fresh(bundled_version: &str) -> Self {
        Self {
            bundled_version: bundled_version.to_string(),
            generations: Generations::bundled(bundled_version),
            confirmations: BTreeMap::new(),
            status: UpdateStatus::Idle,
            last_check: None,
        }
    }

    /// Load state from disk. Missing state, or state written for a different
    /// host bundle, starts fresh.
    pub fn load(state_path: &Path, bundled_version: &str) -> Result<Self, StateError> {
        if !state_path.exists() {
            return Ok(Self::fresh(bundled_version));
        }
        let content = fs::read_to_string(state_path)?;
        let state: AgentState = serde_json::from_str(&content)?;
        if state.bundled_version != bundled_version {
            return Ok(Self::fresh(bundled_version));
        }
        Ok(state)
    }

    /// Save state to disk atomically
    pub fn save(&self, state_path: &Path) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(self)?;

        // Write to temp file first, then rename (atomic)
        let temp_path = state_path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, state_path)?;
        Ok(())
    }

    pub fn current_version(&self) -> &str {
        self.generations.current.version()
    }

    /// Bundled generations never need confirming
    pub fn current_is_confirmed(&self) -> bool {
        self.generations.current.is_bundled()
            || self
                .confirmations
                .get(self.current_version())
                .is_some_and(|c| c.confirmed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to access state: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse state: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hot(version: &str, id: &str) -> Generation {
        Generation::Hot {
            version: version.to_string(),
            id: id.to_string(),
        }
    }

    #[test]
    fn test_apply_moves_current_to_backup() {
        let slots = Generations::bundled("1.0.0").stage(hot("1.1.0", "a"));
        let applied = slots.apply().unwrap();
        assert_eq!(applied.current.version(), "1.1.0");
        assert_eq!(applied.backup.as_ref().map(Generation::version), Some("1.0.0"));
        assert!(applied.pending.is_none());

        // nothing left to apply
        assert!(applied.apply().is_none());
    }

    #[test]
    fn test_rollback_restores_backup() {
        let slots = Generations::bundled("1.0.0")
            .stage(hot("1.1.0", "a"))
            .apply()
            .unwrap();
        let rolled = slots.rollback().unwrap();
        assert_eq!(rolled.current, Generation::Bundled { version: "1.0.0".into() });
        assert!(rolled.backup.is_none());
        assert!(rolled.rollback().is_none());
    }

    #[test]
    fn test_rollback_keeps_unrelated_pending() {
        let slots = Generations::bundled("1.0.0")
            .stage(hot("1.1.0", "a"))
            .apply()
            .unwrap()
            .stage(hot("1.2.0", "b"));
        let rolled = slots.rollback().unwrap();
        assert_eq!(rolled.pending.as_ref().map(Generation::version), Some("1.2.0"));
        assert_eq!(
            rolled.referenced_ids(),
            BTreeSet::from(["b".to_string()])
        );
    }

    #[test]
    fn test_state_persistence() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        let mut state = AgentState::fresh("1.0.0");
        state.generations = state.generations.stage(hot("1.1.0", "a"));
        state.status = UpdateStatus::StagedPending {
            version: "1.1.0".into(),
        };
        state.save(&state_path).unwrap();

        let loaded = AgentState::load(&state_path, "1.0.0").unwrap();
        assert_eq!(loaded.generations, state.generations);
        assert_eq!(loaded.status, state.status);

        // a new host bundle invalidates hot updates made for the old one
        let reset = AgentState::load(&state_path, "2.0.0").unwrap();
        assert_eq!(reset.current_version(), "2.0.0");
        assert!(reset.generations.pending.is_none());
    }

    #[test]
    fn test_bundled_counts_as_confirmed() {
        let mut state = AgentState::fresh("1.0.0");
        assert!(state.current_is_confirmed());

        state.generations = state.generations.stage(hot("1.1.0", "a")).apply().unwrap();
        state
            .confirmations
            .insert("1.1.0".to_string(), Confirmation::default());
        assert!(!state.current_is_confirmed());
    }
}
