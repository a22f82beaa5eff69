//! PDF document ingestion.
//!
//! ```text
//! bytes → pages → doc type → chunk params → page-window chunks
//!       → lexical chunk cache (always)
//!       → delete old vectors by doc_id → embed → upsert (best effort)
//! ```
//!
//! The lexical cache is written before any embedding call and is the
//! durability guarantee: when the embedding service or the vector store is
//! down, the document is still retrievable through the lexical channel and
//! the report carries the vector-side error instead of failing the call.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use cope_rag_core::chunk::{chunk_params, chunk_text, content_uuid, infer_doc_type};
use cope_rag_core::embedding::EmbeddingProvider;
use cope_rag_core::models::{text_prefix, Chunk, ChunkSource, DocType, Locator};
use cope_rag_core::store::{DeleteSelector, PayloadField, Point, PointFilter, VectorStore};
use cope_rag_core::Error;

use crate::chunk_cache::ChunkCache;
use crate::config::Config;
use crate::embedding::create_provider;
use crate::extract::{type_sample, PageExtractor, PageText, PdfExtractor};
use crate::qdrant::QdrantStore;

/// Pages sampled for document-type inference.
const TYPE_SAMPLE_PAGES: usize = 2;
/// Characters taken from each sampled page.
const TYPE_SAMPLE_CHARS: usize = 350;

/// Caller-supplied document metadata. A missing `doc_type` is inferred.
#[derive(Debug, Clone, Default)]
pub struct DocumentMetadata {
    pub doc_type: Option<DocType>,
    pub tags: Vec<String>,
    pub course: Option<String>,
    pub language: Option<String>,
}

/// Outcome of one ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub doc_type: DocType,
    pub pages: usize,
    pub chunks: usize,
    pub vectors_indexed: usize,
    /// Why the vector half failed, when it did.
    pub vector_error: Option<String>,
}

/// Outcome of [`DocumentIngestor::remove_document`].
#[derive(Debug, Clone, Serialize)]
pub struct RemovalReport {
    pub doc_id: String,
    pub cache_removed: bool,
    pub vector_error: Option<String>,
}

pub struct DocumentIngestor {
    extractor: Arc<dyn PageExtractor>,
    cache: ChunkCache,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
}

impl DocumentIngestor {
    pub fn new(
        extractor: Arc<dyn PageExtractor>,
        cache: ChunkCache,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            extractor,
            cache,
            embedder,
            store,
        }
    }

    /// Build an ingestor over the configured services.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            Arc::new(PdfExtractor),
            ChunkCache::new(&config.storage.root),
            create_provider(&config.embedding, config.vector_store.dims)?,
            Arc::new(QdrantStore::new(&config.vector_store)?),
        ))
    }

    pub async fn ingest_file(
        &self,
        doc_id: &str,
        path: &Path,
        title: &str,
        metadata: DocumentMetadata,
    ) -> Result<IngestReport> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.ingest_document(doc_id, bytes, title, metadata).await
    }

    /// Ingest one PDF.
    ///
    /// Fails only when no text can be extracted or the lexical cache cannot
    /// be written; vector-side failures are reported in the result.
    pub async fn ingest_document(
        &self,
        doc_id: &str,
        bytes: Vec<u8>,
        title: &str,
        metadata: DocumentMetadata,
    ) -> Result<IngestReport> {
        let extractor = self.extractor.clone();
        let pages = tokio::task::spawn_blocking(move || extractor.pages(&bytes))
            .await
            .context("PDF extraction task panicked")??;

        let doc_type = metadata.doc_type.clone().unwrap_or_else(|| {
            infer_doc_type(
                title,
                &metadata.tags,
                &type_sample(&pages, TYPE_SAMPLE_PAGES, TYPE_SAMPLE_CHARS),
            )
        });
        let chunks = build_chunks(doc_id, title, &doc_type, &metadata, &pages);
        if chunks.is_empty() {
            return Err(Error::ExtractionFailed(format!("no extractable text in document {}", doc_id)).into());
        }

        self.cache.save(doc_id, &chunks)?;

        let (vectors_indexed, vector_error) = match self.index_vectors(doc_id, &chunks).await {
            Ok(n) => (n, None),
            Err(e) => {
                warn!(doc_id = %doc_id, error = %e, "vector indexing failed, document is lexical-only");
                (0, Some(e.to_string()))
            }
        };

        info!(
            doc_id = %doc_id,
            doc_type = %doc_type,
            pages = pages.len(),
            chunks = chunks.len(),
            vectors = vectors_indexed,
            "document ingested"
        );
        Ok(IngestReport {
            doc_id: doc_id.to_string(),
            doc_type,
            pages: pages.len(),
            chunks: chunks.len(),
            vectors_indexed,
            vector_error,
        })
    }

    /// Replace the document's vectors. Old vectors go first, so re-ingestion
    /// never leaves duplicates behind.
    async fn index_vectors(&self, doc_id: &str, chunks: &[Chunk]) -> cope_rag_core::Result<usize> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != chunks.len() {
            return Err(Error::BackendUnavailable(format!(
                "embedding service returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }

        self.store.ensure_collection(self.embedder.dims()).await?;
        self.store
            .delete(DeleteSelector::Filter(document_filter(doc_id)))
            .await?;
        let points: Vec<Point> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| Point {
                id: chunk.id.clone(),
                vector,
                payload: chunk.clone(),
            })
            .collect();
        let n = points.len();
        self.store.upsert(points).await?;
        Ok(n)
    }

    /// Drop a document's lexical cache and vectors. Both halves are attempted.
    pub async fn remove_document(&self, doc_id: &str) -> Result<RemovalReport> {
        let vector_error = match self
            .store
            .delete(DeleteSelector::Filter(document_filter(doc_id)))
            .await
        {
            Ok(()) => None,
            Err(e) => {
                warn!(doc_id = %doc_id, error = %e, "failed to delete document vectors");
                Some(e.to_string())
            }
        };
        let cache_removed = self.cache.remove(doc_id)?;
        Ok(RemovalReport {
            doc_id: doc_id.to_string(),
            cache_removed,
            vector_error,
        })
    }
}

fn document_filter(doc_id: &str) -> PointFilter {
    PointFilter::new()
        .equals(PayloadField::Source, ChunkSource::Pdf.as_str())
        .equals(PayloadField::DocId, doc_id)
}

/// One chunk per page window. Chunk size is chosen from the whole
/// document's length, then applied page by page.
fn build_chunks(
    doc_id: &str,
    title: &str,
    doc_type: &DocType,
    metadata: &DocumentMetadata,
    pages: &[PageText],
) -> Vec<Chunk> {
    let total_len: usize = pages.iter().map(|p| p.text.chars().count()).sum();
    let params = chunk_params(doc_type, total_len);
    let tags: BTreeSet<String> = metadata.tags.iter().cloned().collect();
    let ingested_at = Utc::now();

    let mut chunks = Vec::new();
    for page in pages {
        for (idx, text) in chunk_text(&page.text, params.size, params.overlap)
            .into_iter()
            .enumerate()
        {
            let id = content_uuid(&format!(
                "pdf|{}|{}|{}|{}",
                doc_id,
                page.number,
                idx,
                text_prefix(&text, 120)
            ));
            chunks.push(Chunk {
                id,
                text,
                source: ChunkSource::Pdf,
                doc_id: doc_id.to_string(),
                file_path: None,
                locator: Locator::Page(page.number),
                title: Some(title.to_string()),
                doc_type: doc_type.clone(),
                tags: tags.clone(),
                course: metadata.course.clone(),
                language: metadata.language.clone(),
                modified_at: Some(ingested_at),
                score: 0.0,
                fused_score: 0.0,
            });
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledProvider;
    use cope_rag_core::embedding::HashEmbedder;
    use cope_rag_core::store::memory::InMemoryVectorStore;
    use tempfile::TempDir;

    /// Splits the input on form feeds, one page per piece.
    struct TextPages;

    impl PageExtractor for TextPages {
        fn pages(&self, bytes: &[u8]) -> cope_rag_core::Result<Vec<PageText>> {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| Error::ExtractionFailed(e.to_string()))?;
            Ok(text
                .split('\u{c}')
                .enumerate()
                .map(|(i, t)| PageText {
                    number: i as u32 + 1,
                    text: t.to_string(),
                })
                .collect())
        }
    }

    fn ingestor(
        dir: &TempDir,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<InMemoryVectorStore>,
    ) -> DocumentIngestor {
        DocumentIngestor::new(
            Arc::new(TextPages),
            ChunkCache::new(dir.path()),
            embedder,
            store,
        )
    }

    fn doc_bytes() -> Vec<u8> {
        format!(
            "{}\u{c}{}",
            "Plan de séance de volleyball au gymnase. ".repeat(30),
            "Exercice de manchette et passe haute. ".repeat(30)
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn ingest_writes_cache_and_vectors() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryVectorStore::new());
        let ing = ingestor(&dir, Arc::new(HashEmbedder::new(16)), store.clone());

        let report = ing
            .ingest_document("7", doc_bytes(), "Volley", DocumentMetadata::default())
            .await
            .unwrap();
        assert_eq!(report.pages, 2);
        assert_eq!(report.doc_type, DocType::Practice);
        assert!(report.vector_error.is_none());
        assert_eq!(report.vectors_indexed, report.chunks);

        let cached = ChunkCache::new(dir.path()).load("7").unwrap();
        assert_eq!(cached.len(), report.chunks);
        assert!(cached.iter().all(|c| c.text.chars().count() <= 700));
        assert!(cached.iter().any(|c| c.page() == Some(2)));
        assert_eq!(store.len(), report.chunks);
    }

    #[tokio::test]
    async fn reingest_does_not_duplicate_vectors() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryVectorStore::new());
        let ing = ingestor(&dir, Arc::new(HashEmbedder::new(16)), store.clone());
        let first = ing
            .ingest_document("7", doc_bytes(), "Volley", DocumentMetadata::default())
            .await
            .unwrap();
        ing.ingest_document("7", doc_bytes(), "Volley", DocumentMetadata::default())
            .await
            .unwrap();
        assert_eq!(store.len(), first.chunks);
    }

    #[tokio::test]
    async fn embedding_outage_keeps_lexical_copy() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryVectorStore::new());
        let ing = ingestor(&dir, Arc::new(DisabledProvider), store.clone());
        let metadata = DocumentMetadata {
            doc_type: Some(DocType::Theory),
            ..Default::default()
        };
        let report = ing
            .ingest_document("9", doc_bytes(), "Cours", metadata)
            .await
            .unwrap();
        assert!(report.vector_error.is_some());
        assert_eq!(report.doc_type, DocType::Theory);
        assert!(store.is_empty());
        assert_eq!(ChunkCache::new(dir.path()).load("9").unwrap().len(), report.chunks);
    }

    #[tokio::test]
    async fn empty_document_fails_extraction() {
        let dir = TempDir::new().unwrap();
        let ing = ingestor(&dir, Arc::new(DisabledProvider), Arc::new(InMemoryVectorStore::new()));
        let err = ing
            .ingest_document("1", b"   ".to_vec(), "Vide", DocumentMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err.downcast::<Error>().unwrap(), Error::ExtractionFailed(_)));
    }

    #[tokio::test]
    async fn remove_document_clears_both_halves() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryVectorStore::new());
        let ing = ingestor(&dir, Arc::new(HashEmbedder::new(16)), store.clone());
        ing.ingest_document("7", doc_bytes(), "Volley", DocumentMetadata::default())
            .await
            .unwrap();

        let removed = ing.remove_document("7").await.unwrap();
        assert!(removed.cache_removed);
        assert!(removed.vector_error.is_none());
        assert!(store.is_empty());
        assert!(!ing.remove_document("7").await.unwrap().cache_removed);
    }

    #[test]
    fn from_config_rejects_invalid_config() {
        let err = DocumentIngestor::from_config(&Config::default()).err().unwrap();
        assert!(matches!(err.downcast::<Error>().unwrap(), Error::ConfigInvalid(_)));
    }
}
