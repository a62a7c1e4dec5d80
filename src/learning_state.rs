// =============================================================================
// Learning-state persistence — atomic JSON snapshot
// =============================================================================
//
// The policy parameters and per-bucket statistics the engine learns over time
// are persisted as a single JSON document. Writes go to a sibling `.tmp` file
// first and are renamed into place; on platforms where rename-over-existing
// fails, a copy + remove fallback is used.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

fn default_schema_version() -> u32 {
    1
}

/// One persisted snapshot of the engine's learning state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStateSnapshot {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub saved_at_ms: i64,
    #[serde(default)]
    pub policy_params: serde_json::Value,
    #[serde(default)]
    pub bucket_stats: serde_json::Value,
    #[serde(default)]
    pub rollback_point: serde_json::Value,
}

impl Default for LearningStateSnapshot {
    fn default() -> Self {
        Self {
            schema_version: 1,
            saved_at_ms: 0,
            policy_params: serde_json::Value::Object(Default::default()),
            bucket_stats: serde_json::Value::Array(Default::default()),
            rollback_point: serde_json::Value::Object(Default::default()),
        }
    }
}

/// File-backed store for [`LearningStateSnapshot`].
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the snapshot, or `None` when the file does not exist.
    pub fn load(&self) -> Result<Option<LearningStateSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read learning state from {}", self.path.display()))?;

        let snapshot: LearningStateSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse learning state from {}", self.path.display()))?;

        debug!(path = %self.path.display(), schema = snapshot.schema_version, "learning state loaded");
        Ok(Some(snapshot))
    }

    /// Persist the snapshot atomically.
    pub fn save(&self, snapshot: &LearningStateSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create state directory {}", parent.display())
                })?;
            }
        }

        let content = serde_json::to_string_pretty(snapshot)
            .context("failed to serialise learning state")?;

        let tmp_path = tmp_path_for(&self.path);
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;

        if std::fs::rename(&tmp_path, &self.path).is_ok() {
            debug!(path = %self.path.display(), "learning state saved (rename)");
            return Ok(());
        }

        // Rename over an existing file can fail on some platforms; fall back
        // to copy + remove.
        std::fs::copy(&tmp_path, &self.path)
            .with_context(|| format!("failed to copy tmp state to {}", self.path.display()))?;
        let _ = std::fs::remove_file(&tmp_path);

        debug!(path = %self.path.display(), "learning state saved (copy fallback)");
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> JsonStateStore {
        let dir = std::env::temp_dir().join("uptide-state-tests");
        let _ = std::fs::create_dir_all(&dir);
        JsonStateStore::new(dir.join(name))
    }

    #[test]
    fn load_missing_file_returns_none() {
        let store = temp_store("missing.json");
        let _ = std::fs::remove_file(&store.path);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_load_round_trip() {
        let store = temp_store("roundtrip.json");
        let snapshot = LearningStateSnapshot {
            schema_version: 1,
            saved_at_ms: 1_700_000_000_000,
            policy_params: serde_json::json!({ "dynamic_filter": 0.52 }),
            bucket_stats: serde_json::json!([{ "bucket": "trend", "wins": 3, "losses": 1 }]),
            rollback_point: serde_json::json!({ "dynamic_filter": 0.50 }),
        };

        store.save(&snapshot).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn save_overwrites_previous_snapshot() {
        let store = temp_store("overwrite.json");
        let mut snapshot = LearningStateSnapshot::default();
        snapshot.saved_at_ms = 1;
        store.save(&snapshot).unwrap();
        snapshot.saved_at_ms = 2;
        store.save(&snapshot).unwrap();

        assert_eq!(store.load().unwrap().unwrap().saved_at_ms, 2);
    }
}
