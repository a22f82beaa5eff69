//! Note vault access.
//!
//! Two interchangeable backends implement [`VaultAdapter`]:
//! - [`fs::FsVault`]: a directory on disk.
//! - [`remote::RemoteVault`]: a note server speaking the Obsidian Local
//!   REST API shape.
//!
//! [`Vault`] is the façade. It probes backend health at call time and
//! picks the remote backend when configured and healthy, else the
//! filesystem, else none. "None" is a status, not an error.

pub mod fs;
pub mod remote;
pub mod rules;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VaultConfig;

/// A note's raw content plus its modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteFile {
    /// Vault-relative path.
    pub path: String,
    pub content: String,
    pub modified_at: Option<DateTime<Utc>>,
}

/// A vault-native search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteHit {
    pub path: String,
    pub title: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultHealth {
    pub ok: bool,
    pub detail: String,
}

impl VaultHealth {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn down(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Which backend served a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Remote,
    Filesystem,
    None,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Remote => "remote",
            BackendKind::Filesystem => "filesystem",
            BackendKind::None => "none",
        })
    }
}

/// The six operations every vault backend provides.
///
/// Every path-taking operation validates containment and the include /
/// exclude rules, failing with `PathRejected`.
#[async_trait]
pub trait VaultAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Vault-relative paths of visible notes, sorted.
    async fn list_notes(&self) -> cope_rag_core::Result<Vec<String>>;

    async fn read_note(&self, path: &str) -> cope_rag_core::Result<NoteFile>;

    /// Create a note, returning the path actually written.
    async fn create_note(&self, path: &str, content: &str) -> cope_rag_core::Result<String>;

    async fn append_note(&self, path: &str, content: &str) -> cope_rag_core::Result<String>;

    async fn search_notes(&self, query: &str, limit: usize) -> cope_rag_core::Result<Vec<NoteHit>>;

    async fn health(&self) -> VaultHealth;
}

/// Health of every configured backend plus the one that would be used.
#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub remote: Option<VaultHealth>,
    pub filesystem: Option<VaultHealth>,
    pub active: BackendKind,
}

/// Backend-selecting façade.
#[derive(Clone)]
pub struct Vault {
    remote: Option<Arc<dyn VaultAdapter>>,
    filesystem: Option<Arc<dyn VaultAdapter>>,
}

impl Vault {
    pub fn new(remote: Option<Arc<dyn VaultAdapter>>, filesystem: Option<Arc<dyn VaultAdapter>>) -> Self {
        Self { remote, filesystem }
    }

    /// Build the backends a configuration describes.
    ///
    /// The remote backend exists when a URL and key are configured; the
    /// filesystem backend when a path is.
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let remote: Option<Arc<dyn VaultAdapter>> = if config.has_remote() {
            Some(Arc::new(remote::RemoteVault::new(config)?))
        } else {
            None
        };
        let filesystem: Option<Arc<dyn VaultAdapter>> = if config.path.is_some() {
            Some(Arc::new(fs::FsVault::new(config)?))
        } else {
            None
        };
        Ok(Self::new(remote, filesystem))
    }

    /// Probe health and return the backend to use, if any.
    pub async fn active(&self) -> Option<Arc<dyn VaultAdapter>> {
        if let Some(remote) = &self.remote {
            let health = remote.health().await;
            if health.ok {
                return Some(remote.clone());
            }
            debug!(detail = %health.detail, "remote vault unavailable, trying filesystem");
        }
        if let Some(fs) = &self.filesystem {
            if fs.health().await.ok {
                return Some(fs.clone());
            }
        }
        None
    }

    pub async fn status(&self) -> VaultStatus {
        let remote = match &self.remote {
            Some(r) => Some(r.health().await),
            None => None,
        };
        let filesystem = match &self.filesystem {
            Some(f) => Some(f.health().await),
            None => None,
        };
        let active = if remote.as_ref().is_some_and(|h| h.ok) {
            BackendKind::Remote
        } else if filesystem.as_ref().is_some_and(|h| h.ok) {
            BackendKind::Filesystem
        } else {
            BackendKind::None
        };
        VaultStatus {
            remote,
            filesystem,
            active,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use cope_rag_core::Error;

    /// In-memory vault for façade and indexer tests.
    pub struct StubVault {
        pub kind: BackendKind,
        pub healthy: bool,
        pub notes: Mutex<BTreeMap<String, NoteFile>>,
    }

    impl StubVault {
        pub fn new(kind: BackendKind, healthy: bool) -> Self {
            Self {
                kind,
                healthy,
                notes: Mutex::new(BTreeMap::new()),
            }
        }
    }

    #[async_trait]
    impl VaultAdapter for StubVault {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn list_notes(&self) -> cope_rag_core::Result<Vec<String>> {
            Ok(self.notes.lock().unwrap().keys().cloned().collect())
        }

        async fn read_note(&self, path: &str) -> cope_rag_core::Result<NoteFile> {
            self.notes
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| Error::ExtractionFailed(format!("missing {}", path)))
        }

        async fn create_note(&self, path: &str, content: &str) -> cope_rag_core::Result<String> {
            self.notes.lock().unwrap().insert(
                path.to_string(),
                NoteFile {
                    path: path.to_string(),
                    content: content.to_string(),
                    modified_at: None,
                },
            );
            Ok(path.to_string())
        }

        async fn append_note(&self, path: &str, content: &str) -> cope_rag_core::Result<String> {
            let mut notes = self.notes.lock().unwrap();
            let entry = notes.entry(path.to_string()).or_insert_with(|| NoteFile {
                path: path.to_string(),
                content: String::new(),
                modified_at: None,
            });
            entry.content.push_str(content);
            Ok(path.to_string())
        }

        async fn search_notes(&self, _query: &str, _limit: usize) -> cope_rag_core::Result<Vec<NoteHit>> {
            Ok(Vec::new())
        }

        async fn health(&self) -> VaultHealth {
            if self.healthy {
                VaultHealth::ok("stub")
            } else {
                VaultHealth::down("stub down")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StubVault;
    use super::*;

    fn vault(remote: Option<bool>, fs: Option<bool>) -> Vault {
        Vault::new(
            remote.map(|h| Arc::new(StubVault::new(BackendKind::Remote, h)) as Arc<dyn VaultAdapter>),
            fs.map(|h| Arc::new(StubVault::new(BackendKind::Filesystem, h)) as Arc<dyn VaultAdapter>),
        )
    }

    #[tokio::test]
    async fn test_prefers_healthy_remote() {
        let v = vault(Some(true), Some(true));
        assert_eq!(v.active().await.unwrap().kind(), BackendKind::Remote);
        assert_eq!(v.status().await.active, BackendKind::Remote);
    }

    #[tokio::test]
    async fn test_falls_back_to_filesystem() {
        let v = vault(Some(false), Some(true));
        assert_eq!(v.active().await.unwrap().kind(), BackendKind::Filesystem);
        let status = v.status().await;
        assert_eq!(status.active, BackendKind::Filesystem);
        assert!(!status.remote.unwrap().ok);
    }

    #[tokio::test]
    async fn test_none_is_a_status() {
        let v = vault(Some(false), Some(false));
        assert!(v.active().await.is_none());
        assert_eq!(v.status().await.active, BackendKind::None);

        let empty = vault(None, None);
        assert!(empty.active().await.is_none());
        let status = empty.status().await;
        assert!(status.remote.is_none() && status.filesystem.is_none());
    }
}
