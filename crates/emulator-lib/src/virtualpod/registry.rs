//! Durable registry of virtual pod pairs
//!
//! A single JSON file rewritten wholesale on every mutation. The file is
//! single-writer (one lifecycle manager process); the only guard is the
//! atomic replace-on-write, which keeps a crashed writer from leaving a
//! half-written document behind.

use crate::error::{EmulatorError, Result};
use crate::models::VirtualPodRecord;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    virtual_pods: Vec<VirtualPodRecord>,
}

/// File-backed record store
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<RegistryDocument> {
        if !self.path.exists() {
            return Ok(RegistryDocument::default());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            EmulatorError::Registry(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        match serde_json::from_str(&raw) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                // The next successful mutation rewrites the file whole.
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "malformed registry file, treating as empty"
                );
                Ok(RegistryDocument::default())
            }
        }
    }

    /// Whole-file rewrite: write a sibling temp file, then rename over the
    /// target so readers never observe a partial document.
    fn write(&self, doc: &RegistryDocument) -> Result<()> {
        let payload = serde_json::to_string_pretty(doc)
            .map_err(|e| EmulatorError::Registry(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, payload).map_err(|e| {
            EmulatorError::Registry(format!("cannot write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            EmulatorError::Registry(format!(
                "cannot replace {}: {}",
                self.path.display(),
                e
            ))
        })?;
        debug!(path = %self.path.display(), records = doc.virtual_pods.len(), "registry written");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<VirtualPodRecord>> {
        Ok(self.read()?.virtual_pods)
    }

    pub fn get(&self, id: &str) -> Result<VirtualPodRecord> {
        self.read()?
            .virtual_pods
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| EmulatorError::NotFound {
                kind: "virtual pod",
                name: id.to_string(),
            })
    }

    pub fn add(&self, record: VirtualPodRecord) -> Result<()> {
        let mut doc = self.read()?;
        if doc.virtual_pods.iter().any(|r| r.id == record.id) {
            return Err(EmulatorError::Registry(format!(
                "duplicate virtual pod id '{}'",
                record.id
            )));
        }
        info!(id = %record.id, "registry record added");
        doc.virtual_pods.push(record);
        self.write(&doc)
    }

    /// Remove a record by id. Returns the removed record; `NotFound` when
    /// no record has that id.
    pub fn remove(&self, id: &str) -> Result<VirtualPodRecord> {
        let mut doc = self.read()?;
        let position = doc
            .virtual_pods
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| EmulatorError::NotFound {
                kind: "virtual pod",
                name: id.to_string(),
            })?;
        let record = doc.virtual_pods.remove(position);
        self.write(&doc)?;
        info!(id = %record.id, "registry record removed");
        Ok(record)
    }

    /// Next id as `vp-<n>` where `n` is one past the highest numeric
    /// suffix among current records, or 1 for an empty registry.
    pub fn next_id(&self) -> Result<String> {
        let max = self
            .read()?
            .virtual_pods
            .iter()
            .filter_map(|r| r.id.rsplit('-').next()?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok(format!("vp-{:03}", max + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VirtualPodStatus;
    use tempfile::tempdir;

    fn record(id: &str) -> VirtualPodRecord {
        VirtualPodRecord {
            id: id.to_string(),
            source_node: "node-a".into(),
            source_pod_name: format!("{id}-source"),
            dest_node: "node-b".into(),
            dest_pod_name: format!("{id}-dest"),
            namespace: "virtual-pods".into(),
            kwok_node: "virtual-kwok-node".into(),
            time_series_file: format!("/var/lib/emulator/{id}.json"),
            workload_file: "/tmp/workload.json".into(),
            created_at: "2026-08-30T12:00:00Z".into(),
            status: VirtualPodStatus::Running,
            replayer_pid: Some(4242),
            interval: 60,
        }
    }

    #[test]
    fn test_missing_file_is_empty_registry() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        assert!(registry.list().unwrap().is_empty());
        assert_eq!(registry.next_id().unwrap(), "vp-001");
    }

    #[test]
    fn test_add_and_remove_round_trip() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));

        registry.add(record("vp-001")).unwrap();
        registry.add(record("vp-002")).unwrap();
        assert_eq!(registry.list().unwrap().len(), 2);
        assert_eq!(registry.get("vp-002").unwrap().dest_pod_name, "vp-002-dest");

        let removed = registry.remove("vp-001").unwrap();
        assert_eq!(removed.id, "vp-001");
        assert_eq!(registry.list().unwrap().len(), 1);
        assert!(registry.remove("vp-001").unwrap_err().is_not_found());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        registry.add(record("vp-001")).unwrap();
        assert!(registry.add(record("vp-001")).is_err());
    }

    #[test]
    fn test_next_id_follows_highest_suffix() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        registry.add(record("vp-003")).unwrap();
        registry.add(record("vp-007")).unwrap();
        assert_eq!(registry.next_id().unwrap(), "vp-008");

        registry.remove("vp-007").unwrap();
        // max+1 over what remains; vp-008 was never written.
        assert_eq!(registry.next_id().unwrap(), "vp-004");
    }

    #[test]
    fn test_malformed_file_treated_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "{not json").unwrap();
        let registry = Registry::new(path.clone());

        assert!(registry.list().unwrap().is_empty());
        assert_eq!(registry.next_id().unwrap(), "vp-001");

        // A mutation replaces the corrupt file with a valid one.
        registry.add(record("vp-001")).unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
    }
}
