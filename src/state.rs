//! Content-hash state for incremental sync.
//!
//! Each run hashes every flattened source value with SHA-256 and compares
//! the result with the hashes saved by the previous run. Only hashes are
//! compared, so formatting changes in the source file never show up as
//! modifications.

use crate::cache::hex_digest;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const STATE_FILE_NAME: &str = "state.json";
pub const STATE_FORMAT_VERSION: &str = "1.0";

/// Flattened key → SHA-256 hex of its value.
pub type StateHashes = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetadata {
    pub last_updated: DateTime<Utc>,
    pub version: String,
    pub tool_version: String,
}

/// On-disk layout: hashes at the top level next to a `_metadata` object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(flatten)]
    pub hashes: StateHashes,
    #[serde(rename = "_metadata", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<StateMetadata>,
}

/// Difference between two states. Every list is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComparisonResult {
    pub new_keys: Vec<String>,
    pub modified_keys: Vec<String>,
    pub deleted_keys: Vec<String>,
    pub unchanged_keys: Vec<String>,
    pub has_changes: bool,
}

impl ComparisonResult {
    /// Keys whose source text must be (re)translated.
    pub fn changed_keys(&self) -> impl Iterator<Item = &String> {
        self.new_keys.iter().chain(self.modified_keys.iter())
    }
}

pub fn hash_value(value: &str) -> String {
    hex_digest(&Sha256::digest(value.as_bytes()))
}

pub struct StateManager {
    state_dir: PathBuf,
}

impl StateManager {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE_NAME)
    }

    pub fn generate_state(flat: &BTreeMap<String, String>) -> StateHashes {
        flat.iter()
            .map(|(key, value)| (key.clone(), hash_value(value)))
            .collect()
    }

    pub fn compare_states(previous: &StateHashes, current: &StateHashes) -> ComparisonResult {
        let mut result = ComparisonResult::default();

        for (key, hash) in current {
            match previous.get(key) {
                None => result.new_keys.push(key.clone()),
                Some(old) if old != hash => result.modified_keys.push(key.clone()),
                Some(_) => result.unchanged_keys.push(key.clone()),
            }
        }
        result.deleted_keys = previous
            .keys()
            .filter(|key| !current.contains_key(*key))
            .cloned()
            .collect();

        result.has_changes = !(result.new_keys.is_empty()
            && result.modified_keys.is_empty()
            && result.deleted_keys.is_empty());
        result
    }

    /// Load the previous run's hashes.
    ///
    /// A missing file means first run. An unreadable or corrupt file is
    /// logged and also treated as empty, so the next run retranslates
    /// instead of failing.
    pub fn load_state(&self) -> StateRecord {
        let path = self.state_path();
        match read_record(&path) {
            Ok(Some(record)) => {
                debug!(path = %path.display(), keys = record.hashes.len(), "Loaded sync state");
                record
            }
            Ok(None) => {
                info!(path = %path.display(), "No previous sync state, treating as first run");
                StateRecord::default()
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %format!("{:#}", e),
                    code = "state_corrupt",
                    "Ignoring unreadable sync state"
                );
                StateRecord::default()
            }
        }
    }

    /// Persist `hashes` with fresh metadata, creating the state directory.
    pub fn save_state(&self, hashes: &StateHashes) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).with_context(|| {
            format!("Failed to create state directory {}", self.state_dir.display())
        })?;

        let record = StateRecord {
            hashes: hashes.clone(),
            metadata: Some(StateMetadata {
                last_updated: Utc::now(),
                version: STATE_FORMAT_VERSION.to_string(),
                tool_version: env!("CARGO_PKG_VERSION").to_string(),
            }),
        };
        let json = serde_json::to_string_pretty(&record).context("Failed to serialize sync state")?;

        let path = self.state_path();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        debug!(path = %path.display(), keys = hashes.len(), "Saved sync state");
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<Option<StateRecord>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let record = serde_json::from_str(&contents).context("State file is not a valid state record")?;
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    /// Dotted keys up to three levels deep
    const KEY_PATTERN: &str = "[a-z]{1,6}(\\.[a-z]{1,6}){0,2}";

    fn flat(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ==================== Hashing ====================

    #[test]
    fn test_hash_value_is_sha256_hex() {
        assert_eq!(
            hash_value("Hello"),
            "185f8db32271fe25f561a6fc938b2e264306ec304eda518007d1764826381969"
        );
    }

    #[test]
    fn test_generate_state_hashes_every_key() {
        let state = StateManager::generate_state(&flat(&[("a", "x"), ("b.c", "y")]));
        assert_eq!(state.len(), 2);
        assert_eq!(state["a"], hash_value("x"));
        assert_eq!(state["b.c"], hash_value("y"));
    }

    // ==================== Comparison ====================

    #[test]
    fn test_compare_classifies_keys() {
        let previous =
            StateManager::generate_state(&flat(&[("keep", "1"), ("change", "2"), ("drop", "3")]));
        let current =
            StateManager::generate_state(&flat(&[("keep", "1"), ("change", "two"), ("add", "4")]));

        let result = StateManager::compare_states(&previous, &current);
        assert_eq!(result.new_keys, vec!["add"]);
        assert_eq!(result.modified_keys, vec!["change"]);
        assert_eq!(result.deleted_keys, vec!["drop"]);
        assert_eq!(result.unchanged_keys, vec!["keep"]);
        assert!(result.has_changes);

        let changed: Vec<&String> = result.changed_keys().collect();
        assert_eq!(changed, vec!["add", "change"]);
    }

    #[test]
    fn test_deletion_alone_is_a_change() {
        let previous = StateManager::generate_state(&flat(&[("a", "1"), ("b", "2")]));
        let current = StateManager::generate_state(&flat(&[("a", "1")]));
        let result = StateManager::compare_states(&previous, &current);
        assert!(result.has_changes);
        assert_eq!(result.deleted_keys, vec!["b"]);
    }

    proptest! {
        #[test]
        fn prop_compare_with_itself_has_no_changes(
            source in prop::collection::btree_map(KEY_PATTERN, ".{0,40}", 0..30)
        ) {
            let state = StateManager::generate_state(&source);
            let result = StateManager::compare_states(&state, &state);
            prop_assert!(!result.has_changes);
            prop_assert!(result.new_keys.is_empty());
            prop_assert!(result.modified_keys.is_empty());
            prop_assert!(result.deleted_keys.is_empty());
            prop_assert_eq!(result.unchanged_keys.len(), source.len());
        }

        #[test]
        fn prop_first_run_marks_everything_new(
            source in prop::collection::btree_map(KEY_PATTERN, ".{0,40}", 1..30)
        ) {
            let current = StateManager::generate_state(&source);
            let result = StateManager::compare_states(&StateHashes::new(), &current);
            let expected: Vec<String> = source.keys().cloned().collect();
            prop_assert_eq!(result.new_keys, expected);
            prop_assert!(result.has_changes);
        }

        #[test]
        fn prop_every_key_lands_in_exactly_one_bucket(
            previous in prop::collection::btree_map("[a-e]{1,2}", "[xy]{1,2}", 0..15),
            current in prop::collection::btree_map("[a-e]{1,2}", "[xy]{1,2}", 0..15),
        ) {
            let result = StateManager::compare_states(
                &StateManager::generate_state(&previous),
                &StateManager::generate_state(&current),
            );
            let mut all: Vec<String> = result.new_keys.iter()
                .chain(&result.modified_keys)
                .chain(&result.deleted_keys)
                .chain(&result.unchanged_keys)
                .cloned()
                .collect();
            all.sort();
            let mut expected: Vec<String> =
                previous.keys().chain(current.keys()).cloned().collect();
            expected.sort();
            expected.dedup();
            prop_assert_eq!(all, expected);
        }
    }

    // ==================== Persistence ====================

    #[test]
    fn test_missing_state_is_empty() {
        let dir = TempDir::new().unwrap();
        let manager = StateManager::new(dir.path().join(".locale-sync"));
        let record = manager.load_state();
        assert!(record.hashes.is_empty());
        assert!(record.metadata.is_none());
    }

    #[test]
    fn test_corrupt_state_is_empty() {
        let dir = TempDir::new().unwrap();
        let manager = StateManager::new(dir.path());
        std::fs::write(manager.state_path(), "{ not json").unwrap();
        assert!(manager.load_state().hashes.is_empty());
    }

    #[test]
    fn test_non_string_hash_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let manager = StateManager::new(dir.path());
        std::fs::write(manager.state_path(), r#"{"greeting": 42}"#).unwrap();
        assert!(manager.load_state().hashes.is_empty());
    }

    #[test]
    fn test_save_then_load_round_trips_hashes_and_metadata() {
        let dir = TempDir::new().unwrap();
        let manager = StateManager::new(dir.path().join("nested").join(".locale-sync"));
        let hashes =
            StateManager::generate_state(&flat(&[("greeting", "Hello"), ("nav.home", "Home")]));

        manager.save_state(&hashes).unwrap();
        let record = manager.load_state();

        assert_eq!(record.hashes, hashes);
        let metadata = record.metadata.unwrap();
        assert_eq!(metadata.version, STATE_FORMAT_VERSION);
        assert_eq!(metadata.tool_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_saved_file_layout() {
        let dir = TempDir::new().unwrap();
        let manager = StateManager::new(dir.path());
        let hashes = StateManager::generate_state(&flat(&[("greeting", "Hello")]));
        manager.save_state(&hashes).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(manager.state_path()).unwrap()).unwrap();
        assert_eq!(raw["greeting"], hash_value("Hello"));
        assert!(raw["_metadata"]["lastUpdated"].is_string());
        assert!(raw["_metadata"]["toolVersion"].is_string());
        assert_eq!(raw["_metadata"]["version"], STATE_FORMAT_VERSION);
    }

    #[test]
    fn test_save_into_unwritable_location_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        let manager = StateManager::new(blocker.join("state"));
        assert!(manager.save_state(&StateHashes::new()).is_err());
    }
}
