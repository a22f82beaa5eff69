//! Persisted indexing state: the per-vault manifest and last-run status.
//!
//! Both are single JSON documents under the storage root. A missing file
//! reads as the empty state. Writes go to a temporary sibling first and are
//! renamed into place, so a crash never leaves a half-written document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use cope_rag_core::models::{IngestStats, ManifestEntry};

use crate::vault::BackendKind;

/// Note path → bookkeeping entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn insert(&mut self, entry: ManifestEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<ManifestEntry> {
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of the most recent indexing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub last_run: DateTime<Utc>,
    pub backend: BackendKind,
    pub stats: IngestStats,
}

/// Where one vault's manifest and status live.
#[derive(Debug, Clone)]
pub struct StateFiles {
    pub manifest: PathBuf,
    pub status: PathBuf,
}

impl StateFiles {
    pub fn for_vault(storage_root: &Path, vault_name: &str) -> Self {
        let name = crate::chunk_cache::safe_file_stem(vault_name);
        let dir = storage_root.join("vaults");
        Self {
            manifest: dir.join(format!("{}.manifest.json", name)),
            status: dir.join(format!("{}.status.json", name)),
        }
    }
}

/// Read a JSON document; a missing file yields `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let value = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Write a JSON document atomically (temp file + rename).
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

pub fn load_manifest(path: &Path) -> Result<Manifest> {
    Ok(read_json(path)?.unwrap_or_default())
}

pub fn save_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    write_json_atomic(path, manifest)
}

pub fn load_status(path: &Path) -> Result<Option<StatusSnapshot>> {
    read_json(path)
}

pub fn save_status(path: &Path, status: &StatusSnapshot) -> Result<()> {
    write_json_atomic(path, status)
}
