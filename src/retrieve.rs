//! Retrieval over the PDF and note corpora, and the grounding pipeline.
//!
//! # PDF retrieval
//!
//! 1. Lexical coarse pass over the local chunk cache, metadata-filtered
//!    before scoring, keeping `max(top_k × 4, 10)` candidates.
//! 2. Vector pass for the query and up to two expansions, keeping
//!    `max(top_k × 3, 8)` per query. Failures degrade to no candidates.
//! 3. Merge, dedup, rerank by lexical overlap plus intent bonus, then
//!    diversify across the target documents.
//!
//! # Note retrieval
//!
//! Vector search restricted to note chunks, then note filters, score
//! normalization, and boosts for recency, tag and type matches, and an
//! explicit preference for notes. When the vector side yields nothing the
//! vault's own search is used.
//!
//! # Grounding
//!
//! [`Retriever::ground`] chains intent classification, query expansion,
//! both retrievals, fusion, rerank, and compression.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use cope_rag_core::chunk::content_uuid;
use cope_rag_core::compress::compress;
use cope_rag_core::embedding::{Clock, EmbeddingProvider, SystemClock};
use cope_rag_core::fusion::{fuse, rerank};
use cope_rag_core::markdown::infer_note_type;
use cope_rag_core::models::{Chunk, ChunkSource, Citation, DocType, Intent, Locator, MetadataFilters};
use cope_rag_core::query::{classify_intent, expand_query};
use cope_rag_core::search::{
    diversify, matches_document_filters, matches_note_filters, normalize_scores, recency_boost,
    rerank_candidates, sort_by_score_desc, weighted_lexical_score,
};
use cope_rag_core::store::{PayloadField, PointFilter, VectorStore};

use crate::chunk_cache::ChunkCache;
use crate::config::{Config, RetrievalConfig};
use crate::embedding::create_provider;
use crate::qdrant::QdrantStore;
use crate::vault::{NoteHit, Vault};

/// Expansion queries sent to the vector store besides the original.
const VECTOR_EXPANSIONS: usize = 2;
const NOTE_TAG_BOOST: f64 = 0.12;
const NOTE_TYPE_BOOST: f64 = 0.10;
const PREFER_NOTES_BOOST: f64 = 0.12;

/// Input of [`Retriever::ground`].
#[derive(Debug, Clone, Default)]
pub struct GroundingRequest {
    pub query: String,
    /// Conversation mode; reflective modes force the reflection intent.
    pub mode: Option<String>,
    /// Documents to search. Empty means every cached document.
    pub doc_ids: Vec<String>,
    pub include_notes: bool,
    pub prefer_notes: bool,
    pub filters: MetadataFilters,
}

/// Compressed, cited context ready for prompt assembly.
#[derive(Debug, Clone, Serialize)]
pub struct GroundedContext {
    pub intent: Intent,
    pub expansions: Vec<String>,
    pub citations: Vec<Citation>,
    /// No citation survived; callers should say so instead of answering.
    pub insufficient: bool,
}

pub struct Retriever {
    cache: ChunkCache,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    vault: Option<Vault>,
    settings: RetrievalConfig,
    clock: Arc<dyn Clock>,
}

impl Retriever {
    pub fn new(
        cache: ChunkCache,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        vault: Option<Vault>,
        settings: RetrievalConfig,
    ) -> Self {
        Self {
            cache,
            embedder,
            store,
            vault,
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build a retriever over the configured services.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let embedder = create_provider(&config.embedding, config.vector_store.dims)?;
        let store: Arc<dyn VectorStore> = Arc::new(QdrantStore::new(&config.vector_store)?);
        let vault = if config.vault.path.is_some() || config.vault.has_remote() {
            Some(Vault::from_config(&config.vault)?)
        } else {
            None
        };
        Ok(Self::new(
            ChunkCache::new(&config.storage.root),
            embedder,
            store,
            vault,
            config.retrieval.clone(),
        ))
    }

    /// Ranked PDF chunks for `query`.
    ///
    /// `doc_ids` restricts the corpus; with more than one target document,
    /// each one gets at least one slot when it has any hit.
    pub async fn retrieve(
        &self,
        query: &str,
        doc_ids: Option<&[String]>,
        top_k: usize,
        expansions: &[String],
        intent: Intent,
        filters: &MetadataFilters,
    ) -> Result<Vec<Chunk>> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let mut candidates = self.lexical_pass(query, doc_ids, top_k, expansions, filters);
        candidates.extend(self.vector_pass(query, doc_ids, top_k, expansions, filters).await);

        let pool = candidates.len();
        let ranked = rerank_candidates(query, candidates, intent, pool);
        Ok(diversify(ranked, doc_ids.unwrap_or_default(), top_k))
    }

    fn lexical_pass(
        &self,
        query: &str,
        doc_ids: Option<&[String]>,
        top_k: usize,
        expansions: &[String],
        filters: &MetadataFilters,
    ) -> Vec<Chunk> {
        let cached = match self.cache.load_many(doc_ids) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(error = %e, "lexical pass skipped");
                return Vec::new();
            }
        };
        let mut hits: Vec<Chunk> = cached
            .into_iter()
            .filter(|c| matches_document_filters(c, filters))
            .filter_map(|mut c| {
                let score = weighted_lexical_score(query, expansions, &c.text);
                (score > 0.0).then(|| {
                    c.score = score;
                    c
                })
            })
            .collect();
        sort_by_score_desc(&mut hits, |c| c.score);
        hits.truncate((top_k * 4).max(10));
        hits
    }

    async fn vector_pass(
        &self,
        query: &str,
        doc_ids: Option<&[String]>,
        top_k: usize,
        expansions: &[String],
        filters: &MetadataFilters,
    ) -> Vec<Chunk> {
        let queries: Vec<String> = std::iter::once(query.to_string())
            .chain(expansions.iter().take(VECTOR_EXPANSIONS).cloned())
            .collect();
        let vectors = match self.embedder.embed(&queries).await {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "vector pass skipped");
                return Vec::new();
            }
        };

        let doc_types: Vec<String> = filters
            .doc_types
            .iter()
            .map(|t| DocType::from(t.as_str()).as_str().to_string())
            .collect();
        let mut filter = PointFilter::new()
            .equals(PayloadField::Source, ChunkSource::Pdf.as_str())
            .any(PayloadField::DocType, &doc_types)
            .any(PayloadField::Tags, &filters.tags);
        if let Some(ids) = doc_ids {
            filter = filter.any(PayloadField::DocId, ids);
        }

        let limit = (top_k * 3).max(8);
        let mut out = Vec::new();
        for vector in &vectors {
            match self.store.search(vector, limit, &filter).await {
                Ok(hits) => out.extend(hits.into_iter().map(|h| {
                    let mut c = h.payload;
                    c.score = h.score;
                    c
                })),
                Err(e) => {
                    warn!(error = %e, "vector search failed, using lexical candidates only");
                    return Vec::new();
                }
            }
        }
        // Store-side matching is exact; re-check with case-insensitive rules.
        out.retain(|c| matches_document_filters(c, filters));
        out
    }

    /// Ranked note chunks for `query`.
    pub async fn retrieve_notes(
        &self,
        query: &str,
        top_k: usize,
        filters: &MetadataFilters,
        prefer_notes: bool,
    ) -> Result<Vec<Chunk>> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();

        let mut hits: Vec<Chunk> = self
            .note_vector_hits(query, top_k)
            .await
            .into_iter()
            .filter(|c| matches_note_filters(c, filters, now))
            .collect();

        if hits.is_empty() {
            hits = self
                .vault_search(query, top_k)
                .await
                .into_iter()
                .filter(|c| matches_note_filters(c, filters, now))
                .collect();
        }

        let normalized = normalize_scores(&hits.iter().map(|c| c.score).collect::<Vec<_>>());
        let wanted_tags: Vec<String> = filters.tags.iter().map(|t| t.to_lowercase()).collect();
        let wanted_types: Vec<String> = filters.note_types.iter().map(|t| t.to_lowercase()).collect();
        for (chunk, base) in hits.iter_mut().zip(normalized) {
            let mut score = base + recency_boost(chunk.modified_at, now);
            if chunk.tags.iter().any(|t| wanted_tags.contains(&t.to_lowercase())) {
                score += NOTE_TAG_BOOST;
            }
            if wanted_types.contains(&chunk.doc_type.as_str().to_lowercase()) {
                score += NOTE_TYPE_BOOST;
            }
            if prefer_notes {
                score += PREFER_NOTES_BOOST;
            }
            chunk.score = score;
        }
        sort_by_score_desc(&mut hits, |c| c.score);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn note_vector_hits(&self, query: &str, top_k: usize) -> Vec<Chunk> {
        let vectors = match self.embedder.embed(&[query.to_string()]).await {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "note vector pass skipped");
                return Vec::new();
            }
        };
        let Some(vector) = vectors.first() else {
            return Vec::new();
        };
        let filter = PointFilter::new().equals(PayloadField::Source, ChunkSource::Note.as_str());
        match self.store.search(vector, (top_k * 3).max(20), &filter).await {
            Ok(hits) => hits
                .into_iter()
                .map(|h| {
                    let mut c = h.payload;
                    c.score = h.score;
                    c
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "note vector search failed, trying vault search");
                Vec::new()
            }
        }
    }

    async fn vault_search(&self, query: &str, top_k: usize) -> Vec<Chunk> {
        let Some(vault) = &self.vault else {
            return Vec::new();
        };
        let Some(backend) = vault.active().await else {
            debug!("no vault backend for note search");
            return Vec::new();
        };
        match backend.search_notes(query, top_k).await {
            Ok(hits) => {
                let n = hits.len();
                hits.into_iter()
                    .enumerate()
                    .map(|(rank, hit)| note_hit_to_chunk(hit, (n - rank) as f64))
                    .collect()
            }
            Err(e) => {
                warn!(error = %e, "vault search failed");
                Vec::new()
            }
        }
    }

    /// Full grounding pass for one user query.
    pub async fn ground(&self, request: &GroundingRequest) -> Result<GroundedContext> {
        let intent = classify_intent(&request.query, request.mode.as_deref());
        let expansions = expand_query(&request.query, intent);
        let doc_ids = (!request.doc_ids.is_empty()).then_some(request.doc_ids.as_slice());

        let pdf_hits = self
            .retrieve(
                &request.query,
                doc_ids,
                self.settings.top_k,
                &expansions,
                intent,
                &request.filters,
            )
            .await?;
        let note_hits = if request.include_notes {
            self.retrieve_notes(
                &request.query,
                self.settings.note_top_k,
                &request.filters,
                request.prefer_notes,
            )
            .await?
        } else {
            Vec::new()
        };
        debug!(pdf = pdf_hits.len(), notes = note_hits.len(), "retrieved candidates");

        let mut fused = fuse(
            pdf_hits,
            note_hits,
            self.settings.top_k + self.settings.note_top_k,
            self.settings.fusion_weights(),
        );
        rerank(&request.query, &mut fused, self.settings.rerank_boosts(), self.clock.now());
        let citations = compress(&fused, self.settings.context_max_chars);

        Ok(GroundedContext {
            intent,
            expansions,
            insufficient: citations.is_empty(),
            citations,
        })
    }
}

fn note_hit_to_chunk(hit: NoteHit, score: f64) -> Chunk {
    let text = if hit.snippet.trim().is_empty() {
        hit.title.clone()
    } else {
        hit.snippet
    };
    Chunk {
        id: content_uuid(&format!("vault-search|{}", hit.path)),
        text,
        source: ChunkSource::Note,
        doc_id: format!("note:{}", hit.path),
        doc_type: infer_note_type(&hit.path),
        file_path: Some(hit.path),
        locator: Locator::Heading(None),
        title: Some(hit.title),
        tags: Default::default(),
        course: None,
        language: None,
        modified_at: None,
        score,
        fused_score: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::embedding::DisabledProvider;
    use crate::vault::fs::FsVault;
    use crate::vault::VaultAdapter;
    use chrono::{Duration, TimeZone, Utc};
    use cope_rag_core::embedding::{HashEmbedder, ManualClock};
    use cope_rag_core::store::memory::InMemoryVectorStore;
    use cope_rag_core::store::Point;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn pdf(doc_id: &str, page: u32, text: &str, doc_type: DocType) -> Chunk {
        Chunk {
            id: content_uuid(&format!("{}|{}|{}", doc_id, page, text)),
            text: text.to_string(),
            source: ChunkSource::Pdf,
            doc_id: doc_id.to_string(),
            file_path: None,
            locator: Locator::Page(page),
            title: Some(format!("Doc {}", doc_id)),
            doc_type,
            tags: BTreeSet::new(),
            course: None,
            language: None,
            modified_at: None,
            score: 0.0,
            fused_score: 0.0,
        }
    }

    fn note(path: &str, text: &str, modified_at: chrono::DateTime<Utc>) -> Chunk {
        Chunk {
            id: content_uuid(path),
            text: text.to_string(),
            source: ChunkSource::Note,
            doc_id: format!("note:{}", path),
            file_path: Some(path.to_string()),
            locator: Locator::Heading(Some("Bilan".into())),
            title: Some(path.to_string()),
            doc_type: DocType::Reflection,
            tags: ["eps".to_string()].into_iter().collect(),
            course: None,
            language: None,
            modified_at: Some(modified_at),
            score: 0.0,
            fused_score: 0.0,
        }
    }

    fn seeded_cache(dir: &TempDir) -> ChunkCache {
        let cache = ChunkCache::new(dir.path());
        cache
            .save(
                "1",
                &[
                    pdf("1", 1, "La séance de volleyball commence par un échauffement.", DocType::Practice),
                    pdf("1", 2, "Le volleyball se joue en équipe, échauffement progressif.", DocType::Practice),
                ],
            )
            .unwrap();
        cache
            .save(
                "2",
                &[pdf("2", 1, "Théorie du volleyball et de la motricité.", DocType::Theory)],
            )
            .unwrap();
        cache
    }

    fn retriever(dir: &TempDir, embedder: Arc<dyn EmbeddingProvider>, store: Arc<InMemoryVectorStore>) -> Retriever {
        Retriever::new(
            seeded_cache(dir),
            embedder,
            store,
            None,
            RetrievalConfig::default(),
        )
    }

    #[tokio::test]
    async fn doc_type_filter_is_strict() {
        let dir = TempDir::new().unwrap();
        let r = retriever(&dir, Arc::new(DisabledProvider), Arc::new(InMemoryVectorStore::new()));
        let filters = MetadataFilters {
            doc_types: vec!["practice".into()],
            ..Default::default()
        };
        let hits = r
            .retrieve("volleyball", None, 5, &[], Intent::Explanation, &filters)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.doc_type == DocType::Practice));
    }

    #[tokio::test]
    async fn empty_query_returns_nothing() {
        let dir = TempDir::new().unwrap();
        let r = retriever(&dir, Arc::new(DisabledProvider), Arc::new(InMemoryVectorStore::new()));
        let hits = r
            .retrieve("  ", None, 5, &[], Intent::Explanation, &MetadataFilters::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn vector_and_lexical_candidates_are_merged_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryVectorStore::new());
        let embedder = Arc::new(HashEmbedder::new(64));
        let chunk = pdf("2", 1, "Théorie du volleyball et de la motricité.", DocType::Theory);
        store
            .upsert(vec![Point {
                id: chunk.id.clone(),
                vector: embedder.embed_one(&chunk.text),
                payload: chunk,
            }])
            .await
            .unwrap();
        let r = retriever(&dir, embedder, store);
        let hits = r
            .retrieve("motricité volleyball", None, 10, &[], Intent::Explanation, &MetadataFilters::default())
            .await
            .unwrap();
        let theory: Vec<_> = hits.iter().filter(|h| h.doc_id == "2").collect();
        assert_eq!(theory.len(), 1);
    }

    #[tokio::test]
    async fn every_target_document_gets_a_slot() {
        let dir = TempDir::new().unwrap();
        let r = retriever(&dir, Arc::new(DisabledProvider), Arc::new(InMemoryVectorStore::new()));
        let targets = vec!["1".to_string(), "2".to_string()];
        let hits = r
            .retrieve(
                "séance volleyball échauffement",
                Some(&targets),
                2,
                &[],
                Intent::LessonDesign,
                &MetadataFilters::default(),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().any(|h| h.doc_id == "1"));
        assert!(hits.iter().any(|h| h.doc_id == "2"));
    }

    #[tokio::test]
    async fn corrupt_target_cache_degrades_to_other_documents() {
        let dir = TempDir::new().unwrap();
        let r = retriever(&dir, Arc::new(DisabledProvider), Arc::new(InMemoryVectorStore::new()));
        std::fs::write(dir.path().join("chunks/2.json"), "{truncated").unwrap();

        let only_broken = vec!["2".to_string()];
        let hits = r
            .retrieve("volleyball", Some(&only_broken), 3, &[], Intent::Explanation, &MetadataFilters::default())
            .await
            .unwrap();
        assert!(hits.is_empty());

        let targets = vec!["2".to_string(), "1".to_string()];
        let hits = r
            .retrieve("volleyball", Some(&targets), 3, &[], Intent::Explanation, &MetadataFilters::default())
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.doc_id == "1"));
    }

    #[tokio::test]
    async fn recent_notes_rank_first() {
        let dir = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let store = Arc::new(InMemoryVectorStore::new());
        let embedder = Arc::new(HashEmbedder::new(64));
        let text = "Bilan de la séance de volleyball";
        for c in [
            note("old.md", text, now - Duration::days(90)),
            note("new.md", text, now - Duration::days(2)),
        ] {
            store
                .upsert(vec![Point {
                    id: c.id.clone(),
                    vector: embedder.embed_one(&c.text),
                    payload: c,
                }])
                .await
                .unwrap();
        }
        let r = retriever(&dir, embedder, store).with_clock(Arc::new(ManualClock::new(now)));

        let hits = r
            .retrieve_notes("bilan volleyball", 5, &MetadataFilters::default(), false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].file_path.as_deref(), Some("new.md"));

        let recent_only = MetadataFilters {
            recency_days: Some(30),
            ..Default::default()
        };
        let hits = r.retrieve_notes("bilan", 5, &recent_only, false).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn notes_fall_back_to_vault_search() {
        let dir = TempDir::new().unwrap();
        let vault_dir = TempDir::new().unwrap();
        std::fs::write(vault_dir.path().join("Bilan.md"), "# Bilan\nRetour sur la séance de volleyball").unwrap();
        let fs = FsVault::new(&VaultConfig::filesystem(vault_dir.path())).unwrap();
        let vault = Vault::new(None, Some(Arc::new(fs) as Arc<dyn VaultAdapter>));
        let r = Retriever::new(
            ChunkCache::new(dir.path()),
            Arc::new(DisabledProvider),
            Arc::new(InMemoryVectorStore::new()),
            Some(vault),
            RetrievalConfig::default(),
        );

        let hits = r
            .retrieve_notes("volleyball", 3, &MetadataFilters::default(), true)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path.as_deref(), Some("Bilan.md"));
        assert_eq!(hits[0].source, ChunkSource::Note);
    }

    #[tokio::test]
    async fn ground_compresses_within_budget() {
        let dir = TempDir::new().unwrap();
        let r = retriever(&dir, Arc::new(DisabledProvider), Arc::new(InMemoryVectorStore::new()));
        let request = GroundingRequest {
            query: "plan de séance volleyball".into(),
            ..Default::default()
        };
        let ctx = r.ground(&request).await.unwrap();
        assert_eq!(ctx.intent, Intent::LessonDesign);
        assert!(!ctx.insufficient);
        assert!(!ctx.expansions.is_empty());
        let total: usize = ctx.citations.iter().map(|c| c.excerpt.chars().count()).sum();
        assert!(total <= RetrievalConfig::default().context_max_chars);
    }

    #[tokio::test]
    async fn ground_reports_insufficient_sources() {
        let dir = TempDir::new().unwrap();
        let r = Retriever::new(
            ChunkCache::new(dir.path()),
            Arc::new(DisabledProvider),
            Arc::new(InMemoryVectorStore::new()),
            None,
            RetrievalConfig::default(),
        );
        let request = GroundingRequest {
            query: "grille d'évaluation".into(),
            include_notes: true,
            ..Default::default()
        };
        let ctx = r.ground(&request).await.unwrap();
        assert_eq!(ctx.intent, Intent::Evaluation);
        assert!(ctx.insufficient);
        assert!(ctx.citations.is_empty());
    }

    #[test]
    fn from_config_rejects_invalid_config() {
        let err = Retriever::from_config(&Config::default()).err().unwrap();
        assert!(matches!(
            err.downcast::<cope_rag_core::Error>().unwrap(),
            cope_rag_core::Error::ConfigInvalid(_)
        ));
    }
}
