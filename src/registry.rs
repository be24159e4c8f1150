//! Persistent adapter registry.
//!
//! One JSON file per adapter under an injected base directory, plus a
//! durable copy of the adapter weights. The registry is the source of
//! truth for which adapters exist, which are enabled, and where their
//! weights live; serving-runtime state is derived from it, never the
//! other way around.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Normalize an arbitrary identifier into a filesystem- and
/// runtime-safe name. Idempotent.
#[must_use]
pub fn sanitize(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    // Collapse runs of dashes, then strip edge separators.
    let mut collapsed = String::with_capacity(out.len());
    let mut prev_dash = false;
    for ch in out.chars() {
        if ch == '-' {
            if !prev_dash {
                collapsed.push(ch);
            }
            prev_dash = true;
        } else {
            collapsed.push(ch);
            prev_dash = false;
        }
    }
    let trimmed = collapsed.trim_matches(|c| c == '-' || c == '_');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }
    if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("model-{trimmed}");
    }
    trimmed.to_string()
}

/// Lifecycle state of a registered adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStatus {
    /// Trained and registered, not yet served.
    Ready,
    /// A model referencing this adapter exists in the runtime.
    Deployed,
    /// Deployed and enabled for use.
    Active,
    /// Explicitly disabled; runtime model removed.
    Disabled,
}

/// A registered adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterRecord {
    pub adapter_id: String,
    /// Runtime model name, `<id>_adapter`.
    pub adapter_name: String,
    /// Serving-runtime tag of the base model.
    pub base_model: String,
    /// External-library identifier the adapter was trained against.
    pub library_model: String,
    /// Durable weights directory.
    pub adapter_path: PathBuf,
    /// This record's own JSON file.
    pub registry_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub enabled: bool,
    /// "attach" or "merged".
    pub training_method: String,
    pub status: AdapterStatus,
    pub persistent: bool,
    pub last_enabled: Option<DateTime<Utc>>,
    pub last_disabled: Option<DateTime<Utc>>,
}

/// File-backed adapter registry rooted at an injected directory.
pub struct AdapterRegistry {
    base_dir: PathBuf,
}

impl AdapterRegistry {
    /// Open (creating if needed) a registry at `base_dir`.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(base_dir.join("registry"))?;
        fs::create_dir_all(base_dir.join("weights"))?;
        Ok(Self { base_dir })
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, adapter_id: &str) -> PathBuf {
        self.base_dir
            .join("registry")
            .join(format!("{}_adapter.json", sanitize(adapter_id)))
    }

    /// Durable weights directory for an adapter.
    #[must_use]
    pub fn weights_dir(&self, adapter_id: &str) -> PathBuf {
        self.base_dir
            .join("weights")
            .join(format!("{}_adapter", sanitize(adapter_id)))
    }

    /// Register a freshly trained adapter: copy its weights into the
    /// registry and write the record. An existing record with the same
    /// id is replaced.
    pub fn register(
        &self,
        adapter_id: &str,
        base_model: &str,
        library_model: &str,
        staging_weights: &Path,
        training_method: &str,
    ) -> Result<AdapterRecord> {
        let id = sanitize(adapter_id);
        let weights_dir = self.weights_dir(&id);
        if weights_dir.exists() {
            fs::remove_dir_all(&weights_dir)?;
        }
        copy_dir(staging_weights, &weights_dir)?;

        let record = AdapterRecord {
            adapter_id: id.clone(),
            adapter_name: format!("{id}_adapter"),
            base_model: base_model.to_string(),
            library_model: library_model.to_string(),
            adapter_path: weights_dir,
            registry_path: self.record_path(&id),
            created_at: Utc::now(),
            enabled: false,
            training_method: training_method.to_string(),
            status: AdapterStatus::Ready,
            persistent: true,
            last_enabled: None,
            last_disabled: None,
        };
        self.save(&record)?;
        Ok(record)
    }

    /// Persist a record to its JSON file.
    pub fn save(&self, record: &AdapterRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&record.registry_path, json)?;
        Ok(())
    }

    /// Load one record, verifying its weights still exist.
    pub fn load(&self, adapter_id: &str) -> Result<AdapterRecord> {
        let path = self.record_path(adapter_id);
        if !path.exists() {
            return Err(Error::AdapterNotFound(sanitize(adapter_id)));
        }
        let record: AdapterRecord = serde_json::from_str(&fs::read_to_string(&path)?)?;
        if !record.adapter_path.exists() {
            return Err(Error::WeightsMissing(record.adapter_path));
        }
        Ok(record)
    }

    /// Lookup that treats a missing adapter as an answer rather than a
    /// failure. Tries the id as given, then sanitized; on a miss, logs
    /// the ids that do exist.
    pub fn get_info(&self, adapter_id: &str) -> Result<Option<AdapterRecord>> {
        match self.load(adapter_id) {
            Ok(record) => Ok(Some(record)),
            Err(Error::AdapterNotFound(_)) => {
                let available: Vec<String> = self
                    .list()?
                    .into_iter()
                    .map(|r| r.adapter_id)
                    .collect();
                eprintln!(
                    "adapter {adapter_id} not registered (available: {})",
                    if available.is_empty() {
                        "none".to_string()
                    } else {
                        available.join(", ")
                    }
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// All records, sorted by creation time, newest first. Unreadable
    /// record files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<AdapterRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(self.base_dir.join("registry"))? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.ends_with("_adapter.json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|s| serde_json::from_str::<AdapterRecord>(&s).map_err(Error::from))
            {
                Ok(record) => records.push(record),
                Err(err) => eprintln!("warning: skipping {}: {err}", path.display()),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Mark an adapter enabled and stamp the time.
    pub fn mark_enabled(&self, adapter_id: &str) -> Result<AdapterRecord> {
        let mut record = self.load(adapter_id)?;
        record.enabled = true;
        record.status = AdapterStatus::Active;
        record.last_enabled = Some(Utc::now());
        self.save(&record)?;
        Ok(record)
    }

    /// Mark an adapter disabled and stamp the time. The record and
    /// weights stay; only the served model is expected to be removed.
    pub fn mark_disabled(&self, adapter_id: &str) -> Result<AdapterRecord> {
        let mut record = self.load(adapter_id)?;
        record.enabled = false;
        record.status = AdapterStatus::Disabled;
        record.last_disabled = Some(Utc::now());
        self.save(&record)?;
        Ok(record)
    }

    /// Remove an adapter entirely: record file and weights.
    pub fn remove(&self, adapter_id: &str) -> Result<()> {
        let path = self.record_path(adapter_id);
        if !path.exists() {
            return Err(Error::AdapterNotFound(sanitize(adapter_id)));
        }
        let weights = self.weights_dir(adapter_id);
        if weights.exists() {
            fs::remove_dir_all(&weights)?;
        }
        fs::remove_file(&path)?;
        Ok(())
    }
}

/// Recursive directory copy.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        return Err(Error::WeightsMissing(src.to_path_buf()));
    }
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn staged_weights(dir: &TempDir) -> PathBuf {
        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("adapter_model.safetensors"), b"weights").unwrap();
        fs::write(staging.join("adapter_config.json"), b"{}").unwrap();
        staging
    }

    #[test]
    fn test_sanitize_rules() {
        assert_eq!(sanitize("My Model v2!"), "my-model-v2");
        assert_eq!(sanitize("a--b---c"), "a-b-c");
        assert_eq!(sanitize("--edge--"), "edge");
        assert_eq!(sanitize("???"), "unnamed");
        assert_eq!(sanitize("3b-model"), "model-3b-model");
        assert_eq!(sanitize("snake_case_ok"), "snake_case_ok");
    }

    #[test]
    fn test_sanitize_idempotent() {
        let once = sanitize("Weird  NAME (v1.2)");
        assert_eq!(sanitize(&once), once);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn sanitize_is_idempotent(raw in ".{0,64}") {
                let once = sanitize(&raw);
                prop_assert_eq!(sanitize(&once), once.clone());
            }

            #[test]
            fn sanitize_output_is_always_safe(raw in ".{0,64}") {
                let name = sanitize(&raw);
                prop_assert!(!name.is_empty());
                prop_assert!(name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'));
                prop_assert!(!name.starts_with(|c: char| c.is_ascii_digit()));
                prop_assert!(!name.contains("--"));
            }
        }
    }

    #[test]
    fn test_register_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let staging = staged_weights(&dir);
        let registry = AdapterRegistry::open(dir.path().join("registry")).unwrap();

        let record = registry
            .register("My Adapter", "gemma3:latest", "unsloth/gemma-3-4b-it", &staging, "attach")
            .unwrap();
        assert_eq!(record.adapter_id, "my-adapter");
        assert_eq!(record.adapter_name, "my-adapter_adapter");
        assert!(record.adapter_path.join("adapter_model.safetensors").exists());

        let loaded = registry.load("My Adapter").unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_missing_adapter_errors() {
        let dir = TempDir::new().unwrap();
        let registry = AdapterRegistry::open(dir.path()).unwrap();
        assert!(matches!(
            registry.load("nope"),
            Err(Error::AdapterNotFound(_))
        ));
    }

    #[test]
    fn test_missing_weights_detected() {
        let dir = TempDir::new().unwrap();
        let staging = staged_weights(&dir);
        let registry = AdapterRegistry::open(dir.path().join("registry")).unwrap();
        let record = registry
            .register("gone", "gemma3:latest", "unsloth/gemma-3-4b-it", &staging, "attach")
            .unwrap();
        fs::remove_dir_all(&record.adapter_path).unwrap();
        assert!(matches!(
            registry.load("gone"),
            Err(Error::WeightsMissing(_))
        ));
    }

    #[test]
    fn test_enable_disable_stamps() {
        let dir = TempDir::new().unwrap();
        let staging = staged_weights(&dir);
        let registry = AdapterRegistry::open(dir.path().join("registry")).unwrap();
        registry
            .register("toggled", "gemma3:latest", "unsloth/gemma-3-4b-it", &staging, "attach")
            .unwrap();

        let enabled = registry.mark_enabled("toggled").unwrap();
        assert!(enabled.enabled);
        assert_eq!(enabled.status, AdapterStatus::Active);
        assert!(enabled.last_enabled.is_some());

        let disabled = registry.mark_disabled("toggled").unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.status, AdapterStatus::Disabled);
        assert!(disabled.last_disabled.is_some());
        // Weights survive disable.
        assert!(disabled.adapter_path.exists());

        // Disabling again is harmless.
        let again = registry.mark_disabled("toggled").unwrap();
        assert!(!again.enabled);
        assert_eq!(again.status, AdapterStatus::Disabled);
    }

    #[test]
    fn test_list_sorted_and_tolerant() {
        let dir = TempDir::new().unwrap();
        let staging = staged_weights(&dir);
        let registry = AdapterRegistry::open(dir.path().join("registry")).unwrap();
        registry
            .register("first", "gemma3:latest", "unsloth/gemma-3-4b-it", &staging, "attach")
            .unwrap();
        registry
            .register("second", "gemma3:latest", "unsloth/gemma-3-4b-it", &staging, "merged")
            .unwrap();
        // Corrupt file must be skipped, not fatal.
        fs::write(
            registry.base_dir().join("registry").join("bad_adapter.json"),
            "{",
        )
        .unwrap();

        let records = registry.list().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_get_info_miss_is_none() {
        let dir = TempDir::new().unwrap();
        let registry = AdapterRegistry::open(dir.path()).unwrap();
        assert!(registry.get_info("absent").unwrap().is_none());

        let staging = staged_weights(&dir);
        registry
            .register("present", "gemma3:latest", "unsloth/gemma-3-4b-it", &staging, "attach")
            .unwrap();
        // Raw, unsanitized spelling resolves to the same record.
        assert!(registry.get_info("PRESENT").unwrap().is_some());
    }

    #[test]
    fn test_remove_deletes_record_and_weights() {
        let dir = TempDir::new().unwrap();
        let staging = staged_weights(&dir);
        let registry = AdapterRegistry::open(dir.path().join("registry")).unwrap();
        let record = registry
            .register("doomed", "gemma3:latest", "unsloth/gemma-3-4b-it", &staging, "attach")
            .unwrap();
        registry.remove("doomed").unwrap();
        assert!(!record.registry_path.exists());
        assert!(!record.adapter_path.exists());
    }
}
