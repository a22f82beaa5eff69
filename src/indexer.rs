//! Incremental note-vault indexing.
//!
//! One run lists the vault, diffs each note against the persisted manifest
//! (content hash + modification time), and re-embeds only what changed:
//!
//! 1. Resolve the active vault backend and list notes. Failure here aborts
//!    the run before anything is touched.
//! 2. For each note: read, hash, skip when unchanged, else parse, chunk,
//!    embed in one batch, delete the note's old vectors by `file_path`,
//!    upsert the new ones, and replace the manifest entry.
//! 3. Manifest paths not listed this run are deleted from the store.
//! 4. Persist the manifest and a status snapshot.
//!
//! Per-note failures are recorded in [`IngestStats::errors`] and never stop
//! the run. The manifest is only written at the end, so an interrupted run
//! leaves the previous one in place and the next run redoes its work.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use cope_rag_core::chunk::content_hash;
use cope_rag_core::embedding::EmbeddingProvider;
use cope_rag_core::markdown::{chunk_by_headings, parse_note, Note};
use cope_rag_core::models::{IngestStats, ManifestEntry};
use cope_rag_core::store::{DeleteSelector, PayloadField, Point, PointFilter, VectorStore};
use cope_rag_core::Error;

use crate::config::{Config, VaultConfig};
use crate::embedding::create_provider;
use crate::manifest::{
    load_manifest, load_status, save_manifest, save_status, StateFiles, StatusSnapshot,
};
use crate::qdrant::QdrantStore;
use crate::vault::{Vault, VaultAdapter};

/// Drives one vault's incremental indexing.
pub struct NoteIndexer {
    vault: Vault,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    config: VaultConfig,
    state: StateFiles,
}

enum NoteOutcome {
    Unchanged,
    Indexed(ManifestEntry),
}

/// A failed note, and whether its old vectors were already deleted.
struct NoteFailure {
    error: Error,
    vectors_removed: bool,
}

impl From<Error> for NoteFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            vectors_removed: false,
        }
    }
}

/// Vector-store filter selecting every chunk of one note.
fn note_filter(path: &str) -> PointFilter {
    PointFilter::new().equals(PayloadField::FilePath, path)
}

impl NoteIndexer {
    pub fn new(
        vault: Vault,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        config: VaultConfig,
        state: StateFiles,
    ) -> Self {
        Self {
            vault,
            embedder,
            store,
            config,
            state,
        }
    }

    pub async fn run(&self) -> Result<IngestStats> {
        let backend = self
            .vault
            .active()
            .await
            .ok_or_else(|| Error::BackendUnavailable("no vault backend is available".into()))?;
        let paths = backend.list_notes().await?;
        info!(backend = %backend.kind(), notes = paths.len(), "indexing vault");

        let mut manifest = load_manifest(&self.state.manifest)?;
        let mut stats = IngestStats {
            notes_seen: paths.len(),
            ..Default::default()
        };

        if let Err(e) = self.store.ensure_collection(self.embedder.dims()).await {
            warn!(error = %e, "could not ensure vector collection");
        }

        for path in &paths {
            let previous = manifest.get(path).cloned();
            match self.index_note(backend.as_ref(), path, previous.as_ref()).await {
                Ok(NoteOutcome::Unchanged) => stats.skipped += 1,
                Ok(NoteOutcome::Indexed(entry)) => {
                    stats.indexed += 1;
                    stats.chunks_indexed += entry.chunk_ids.len();
                    manifest.insert(entry);
                }
                Err(failure) => {
                    warn!(path = %path, error = %failure.error, "failed to index note");
                    stats.record_error(path.clone(), failure.error.to_string());
                    // Keep tracking the note for deletion, but force a retry.
                    if let Some(mut entry) = previous {
                        entry.content_hash.clear();
                        if failure.vectors_removed {
                            entry.chunk_ids.clear();
                        }
                        manifest.insert(entry);
                    }
                }
            }
        }

        let listed: HashSet<&str> = paths.iter().map(String::as_str).collect();
        let stale: Vec<String> = manifest
            .entries
            .keys()
            .filter(|p| !listed.contains(p.as_str()))
            .cloned()
            .collect();
        for path in stale {
            match self
                .store
                .delete(DeleteSelector::Filter(note_filter(&path)))
                .await
            {
                Ok(()) => {
                    manifest.remove(&path);
                    stats.deleted += 1;
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "failed to delete vectors of removed note");
                    stats.record_error(path, e.to_string());
                }
            }
        }

        save_manifest(&self.state.manifest, &manifest).context("Failed to save manifest")?;
        save_status(
            &self.state.status,
            &StatusSnapshot {
                last_run: Utc::now(),
                backend: backend.kind(),
                stats: stats.clone(),
            },
        )
        .context("Failed to save index status")?;

        info!(
            indexed = stats.indexed,
            skipped = stats.skipped,
            deleted = stats.deleted,
            errors = stats.error_count(),
            "vault indexing finished"
        );
        Ok(stats)
    }

    async fn index_note(
        &self,
        backend: &dyn VaultAdapter,
        path: &str,
        previous: Option<&ManifestEntry>,
    ) -> std::result::Result<NoteOutcome, NoteFailure> {
        let file = backend.read_note(path).await?;
        let hash = content_hash(&file.content);

        if self.config.incremental_indexing {
            if let Some(prev) = previous {
                if prev.content_hash == hash && prev.modified_at == file.modified_at {
                    return Ok(NoteOutcome::Unchanged);
                }
            }
        }

        let note = Note {
            path: path.to_string(),
            content: file.content,
            modified_at: file.modified_at,
        };
        let parsed = parse_note(&note.path, &note.content);
        let chunks = chunk_by_headings(
            &note,
            &parsed,
            self.config.note_chunk_chars,
            self.config.note_chunk_overlap,
        );

        let vectors = if chunks.is_empty() {
            Vec::new()
        } else {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            self.embedder.embed(&texts).await?
        };
        if vectors.len() != chunks.len() {
            return Err(Error::BackendUnavailable(format!(
                "embedding service returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            ))
            .into());
        }

        self.store
            .delete(DeleteSelector::Filter(note_filter(path)))
            .await?;

        let chunk_ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let points: Vec<Point> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| Point {
                id: chunk.id.clone(),
                vector,
                payload: chunk,
            })
            .collect();
        self.store.upsert(points).await.map_err(|error| NoteFailure {
            error,
            vectors_removed: true,
        })?;

        Ok(NoteOutcome::Indexed(ManifestEntry {
            path: path.to_string(),
            content_hash: hash,
            modified_at: note.modified_at,
            chunk_ids,
        }))
    }
}

/// Last persisted run plus the current manifest size.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub last_run: Option<StatusSnapshot>,
    pub manifest_entries: usize,
}

/// Index the configured vault against the configured services.
pub async fn run_incremental_index(config: &Config) -> Result<IngestStats> {
    config.validate()?;
    let vault = Vault::from_config(&config.vault)?;
    let embedder = create_provider(&config.embedding, config.vector_store.dims)?;
    let store: Arc<dyn VectorStore> = Arc::new(QdrantStore::new(&config.vector_store)?);
    let state = StateFiles::for_vault(&config.storage.root, &config.vault.vault_name);
    NoteIndexer::new(vault, embedder, store, config.vault.clone(), state)
        .run()
        .await
}

/// Read the persisted index state; missing files read as empty.
pub fn index_status(config: &Config) -> Result<IndexStatus> {
    let state = StateFiles::for_vault(&config.storage.root, &config.vault.vault_name);
    Ok(IndexStatus {
        last_run: load_status(&state.status)?,
        manifest_entries: load_manifest(&state.manifest)?.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledProvider;
    use crate::vault::testing::StubVault;
    use crate::vault::BackendKind;
    use cope_rag_core::embedding::HashEmbedder;
    use cope_rag_core::store::memory::InMemoryVectorStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        stub: Arc<StubVault>,
        store: Arc<InMemoryVectorStore>,
        indexer: NoteIndexer,
    }

    async fn fixture(embedder: Arc<dyn EmbeddingProvider>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let stub = Arc::new(StubVault::new(BackendKind::Filesystem, true));
        stub.create_note("Cours/a.md", "# A\nLa didactique de l'EPS #eps")
            .await
            .unwrap();
        stub.create_note("practice/b.md", "# B\nSéance de volleyball\n## Retour\nBilan")
            .await
            .unwrap();
        let store = Arc::new(InMemoryVectorStore::new());
        let vault = Vault::new(None, Some(stub.clone() as Arc<dyn VaultAdapter>));
        let mut config = VaultConfig::filesystem(dir.path());
        config.note_chunk_chars = 200;
        config.note_chunk_overlap = 20;
        let state = StateFiles::for_vault(dir.path(), "test");
        let indexer = NoteIndexer::new(vault, embedder, store.clone(), config, state);
        Fixture {
            _dir: dir,
            stub,
            store,
            indexer,
        }
    }

    fn manifest_of(f: &Fixture) -> crate::manifest::Manifest {
        load_manifest(&f.indexer.state.manifest).unwrap()
    }

    #[tokio::test]
    async fn second_run_skips_unchanged_notes() {
        let f = fixture(Arc::new(HashEmbedder::new(32))).await;
        let first = f.indexer.run().await.unwrap();
        assert_eq!(first.indexed, 2);
        assert!(first.errors.is_empty());
        let manifest_after_first = manifest_of(&f);
        let vectors_after_first = f.store.len();

        let second = f.indexer.run().await.unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(manifest_of(&f), manifest_after_first);
        assert_eq!(f.store.len(), vectors_after_first);
    }

    #[tokio::test]
    async fn removed_note_loses_vectors_and_entry() {
        let f = fixture(Arc::new(HashEmbedder::new(32))).await;
        f.indexer.run().await.unwrap();
        let ids = manifest_of(&f).get("Cours/a.md").unwrap().chunk_ids.clone();
        assert!(!ids.is_empty());

        f.stub.notes.lock().unwrap().remove("Cours/a.md");
        let stats = f.indexer.run().await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(manifest_of(&f).get("Cours/a.md").is_none());
        for id in ids {
            assert!(!f.store.contains(&id));
        }
    }

    #[tokio::test]
    async fn changed_note_replaces_its_chunks() {
        let f = fixture(Arc::new(HashEmbedder::new(32))).await;
        f.indexer.run().await.unwrap();

        f.stub
            .create_note("Cours/a.md", "# A\nNouveau texte\n# Deux\nEncore")
            .await
            .unwrap();
        let stats = f.indexer.run().await.unwrap();
        assert_eq!(stats.indexed, 1);
        assert_eq!(stats.skipped, 1);

        let entry = manifest_of(&f).get("Cours/a.md").cloned().unwrap();
        assert_eq!(
            f.store.ids_matching(&note_filter("Cours/a.md")).len(),
            entry.chunk_ids.len()
        );
        let total: usize = manifest_of(&f).entries.values().map(|e| e.chunk_ids.len()).sum();
        assert_eq!(f.store.len(), total);
    }

    #[tokio::test]
    async fn embedding_failure_is_recorded_per_note() {
        let f = fixture(Arc::new(DisabledProvider)).await;
        let stats = f.indexer.run().await.unwrap();
        assert_eq!(stats.indexed, 0);
        assert_eq!(stats.errors.len(), 2);
        assert!(f.store.is_empty());

        let snapshot = load_status(&f.indexer.state.status).unwrap().unwrap();
        assert_eq!(snapshot.backend, BackendKind::Filesystem);
        assert_eq!(snapshot.stats.errors.len(), 2);
    }

    /// Delegates to an in-memory store; upserts fail once `fail_upserts` is set.
    struct UpsertOutage {
        inner: InMemoryVectorStore,
        fail_upserts: AtomicBool,
    }

    #[async_trait::async_trait]
    impl VectorStore for UpsertOutage {
        async fn ensure_collection(&self, dims: usize) -> cope_rag_core::Result<()> {
            self.inner.ensure_collection(dims).await
        }

        async fn upsert(&self, points: Vec<Point>) -> cope_rag_core::Result<()> {
            if self.fail_upserts.load(Ordering::SeqCst) {
                return Err(Error::BackendUnavailable("upsert refused".into()));
            }
            self.inner.upsert(points).await
        }

        async fn search(
            &self,
            vector: &[f32],
            limit: usize,
            filter: &PointFilter,
        ) -> cope_rag_core::Result<Vec<cope_rag_core::store::ScoredPoint>> {
            self.inner.search(vector, limit, filter).await
        }

        async fn delete(&self, selector: DeleteSelector) -> cope_rag_core::Result<()> {
            self.inner.delete(selector).await
        }
    }

    #[tokio::test]
    async fn failed_upsert_after_delete_leaves_no_dangling_ids() {
        let dir = TempDir::new().unwrap();
        let stub = Arc::new(StubVault::new(BackendKind::Filesystem, true));
        stub.create_note("Cours/a.md", "# A\nLa didactique").await.unwrap();
        let store = Arc::new(UpsertOutage {
            inner: InMemoryVectorStore::new(),
            fail_upserts: AtomicBool::new(false),
        });
        let state = StateFiles::for_vault(dir.path(), "test");
        let indexer = NoteIndexer::new(
            Vault::new(None, Some(stub.clone() as Arc<dyn VaultAdapter>)),
            Arc::new(HashEmbedder::new(32)),
            store.clone(),
            VaultConfig::filesystem(dir.path()),
            state.clone(),
        );
        indexer.run().await.unwrap();
        assert!(!load_manifest(&state.manifest)
            .unwrap()
            .get("Cours/a.md")
            .unwrap()
            .chunk_ids
            .is_empty());

        stub.create_note("Cours/a.md", "# A\nTexte modifié").await.unwrap();
        store.fail_upserts.store(true, Ordering::SeqCst);
        let stats = indexer.run().await.unwrap();
        assert_eq!(stats.errors.len(), 1);
        assert!(store.inner.is_empty());

        let manifest = load_manifest(&state.manifest).unwrap();
        let entry = manifest.get("Cours/a.md").unwrap();
        assert!(entry.chunk_ids.iter().all(|id| store.inner.contains(id)));
        assert!(entry.chunk_ids.is_empty());
        assert!(entry.content_hash.is_empty());

        // The next healthy run re-indexes the note.
        store.fail_upserts.store(false, Ordering::SeqCst);
        let stats = indexer.run().await.unwrap();
        assert_eq!(stats.indexed, 1);
        let entry = load_manifest(&state.manifest).unwrap().get("Cours/a.md").cloned().unwrap();
        assert!(!entry.chunk_ids.is_empty());
        assert!(entry.chunk_ids.iter().all(|id| store.inner.contains(id)));
    }

    #[tokio::test]
    async fn no_backend_is_a_hard_error() {
        let dir = TempDir::new().unwrap();
        let down = Arc::new(StubVault::new(BackendKind::Filesystem, false));
        let indexer = NoteIndexer::new(
            Vault::new(None, Some(down as Arc<dyn VaultAdapter>)),
            Arc::new(HashEmbedder::new(8)),
            Arc::new(InMemoryVectorStore::new()),
            VaultConfig::filesystem(dir.path()),
            StateFiles::for_vault(dir.path(), "x"),
        );
        let err = indexer.run().await.unwrap_err();
        assert!(matches!(
            err.downcast::<Error>().unwrap(),
            Error::BackendUnavailable(_)
        ));
        assert!(!StateFiles::for_vault(dir.path(), "x").manifest.exists());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_indexing() {
        let err = run_incremental_index(&Config::default()).await.unwrap_err();
        assert!(matches!(
            err.downcast::<Error>().unwrap(),
            Error::ConfigInvalid(_)
        ));
    }
}
